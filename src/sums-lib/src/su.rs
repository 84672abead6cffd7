use crate::{SumsError, SumsResult};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage-unit number. Always travels as a hex string so that JSON numerics
/// never lose precision.
pub type Sunum = u64;

/// Placement-record status codes (`sum_partn_alloc.status`).
pub const PA_STATUS_PROVISIONAL: i64 = 1;
pub const PA_STATUS_DELETE_PENDING: i64 = 2;
pub const PA_STATUS_ARCHIVE_PENDING: i64 = 4;
/// Unlabeled status. Observed only as "implies read-only"; kept as a literal:
/// excluded from TTL touches, cleaned up by close.
pub const PA_STATUS_UNLABELED_8: i64 = 8;

/// Archive sub-status codes (`sum_partn_alloc.archive_substatus`).
pub const PA_SUBSTATUS_NOARCHIVE: i64 = 32;
pub const PA_SUBSTATUS_PERMANENT_ARCHIVE: i64 = 64;
pub const PA_SUBSTATUS_TEMPORARY_ARCHIVE: i64 = 128;

pub const DEFAULT_PUT_RETENTION_DAYS: i64 = 2;

pub fn parse_hex_id(s: &str) -> SumsResult<u64> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(SumsError::BadRequest("empty hex id".to_string()));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| SumsError::BadRequest(format!("invalid hex id '{}': {}", s, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HexId(pub u64);

impl HexId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

impl From<u64> for HexId {
    fn from(v: u64) -> Self {
        HexId(v)
    }
}

impl FromStr for HexId {
    type Err = SumsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_id(s).map(HexId)
    }
}

impl Serialize for HexId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HexId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_hex_id(&s).map(HexId).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    PermanentArchive,
    TemporaryArchive,
    TemporaryNoArchive,
}

impl ArchiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveType::PermanentArchive => "permanent+archive",
            ArchiveType::TemporaryArchive => "temporary+archive",
            ArchiveType::TemporaryNoArchive => "temporary+noarchive",
        }
    }

    /// Archive sub-status for the final placement row. Archival requested
    /// without a tape subsystem falls back to the no-archive code.
    pub fn substatus(&self, tape_enabled: bool) -> i64 {
        match (self, tape_enabled) {
            (ArchiveType::PermanentArchive, true) => PA_SUBSTATUS_PERMANENT_ARCHIVE,
            (ArchiveType::TemporaryNoArchive, _) => PA_SUBSTATUS_NOARCHIVE,
            (ArchiveType::TemporaryArchive, true) => PA_SUBSTATUS_TEMPORARY_ARCHIVE,
            _ => PA_SUBSTATUS_NOARCHIVE,
        }
    }

    /// Status of the final placement row written by put.
    pub fn final_status(tape_enabled: bool) -> i64 {
        if tape_enabled {
            PA_STATUS_ARCHIVE_PENDING
        } else {
            PA_STATUS_DELETE_PENDING
        }
    }
}

impl FromStr for ArchiveType {
    type Err = SumsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permanent+archive" => Ok(ArchiveType::PermanentArchive),
            "temporary+archive" => Ok(ArchiveType::TemporaryArchive),
            "temporary+noarchive" => Ok(ArchiveType::TemporaryNoArchive),
            other => Err(SumsError::BadRequest(format!(
                "invalid archive type: {}",
                other
            ))),
        }
    }
}

impl Serialize for ArchiveType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ArchiveType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Name of the directory holding one SU below its partition root.
pub fn su_dir_name(sunum: Sunum) -> String {
    format!("D{}", sunum)
}
