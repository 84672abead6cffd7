use crate::{ArchiveType, HexId, SumsError, SumsResult, SumsStatus, Sunum, DEFAULT_PUT_RETENTION_DAYS};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::PathBuf;

pub const TAPE_PLACEHOLDER: &str = "N/A";
pub const TAPE_DATE_PLACEHOLDER: &str = "1958-01-01 00:00:00";
pub const EXPIRED_EFFECTIVE_DATE: &str = "195801010000";

/// First frame sent by every client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub pid: i64,
    pub user: String,
}

impl ClientInfo {
    pub fn parse(value: Value) -> SumsResult<Self> {
        let info: ClientInfo =
            serde_json::from_value(value).map_err(|e| SumsError::BadClientInfo(e.to_string()))?;
        if info.user.trim().is_empty() {
            return Err(SumsError::BadClientInfo("empty user name".to_string()));
        }
        Ok(info)
    }
}

/// One `{hexsunum: path}` entry of a put request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuDirEntry {
    pub sunum: Sunum,
    pub path: PathBuf,
}

impl<'de> Deserialize<'de> for SuDirEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = SuDirEntry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a single-key map of hex sunum to path")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<SuDirEntry, A::Error> {
                let (key, path): (String, String) = map
                    .next_entry()?
                    .ok_or_else(|| de::Error::custom("empty sudir entry"))?;
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("sudir entry must have exactly one key"));
                }
                let sunum = crate::parse_hex_id(&key).map_err(de::Error::custom)?;
                if path.is_empty() {
                    return Err(de::Error::custom("empty sudir path"));
                }
                Ok(SuDirEntry {
                    sunum,
                    path: PathBuf::from(path),
                })
            }
        }

        deserializer.deserialize_map(EntryVisitor)
    }
}

fn default_put_retention() -> i64 {
    DEFAULT_PUT_RETENTION_DAYS
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "reqtype", rename_all = "lowercase")]
pub enum SumsRequest {
    Open,
    Close {
        sessionid: HexId,
    },
    Rollback {
        sessionid: HexId,
    },
    Info {
        sessionid: HexId,
        sus: Vec<HexId>,
    },
    Get {
        sessionid: HexId,
        sus: Vec<HexId>,
        #[serde(default)]
        touch: bool,
        #[serde(default)]
        retrieve: bool,
        #[serde(default)]
        retention: i64,
    },
    Alloc {
        sessionid: HexId,
        #[serde(default)]
        sunum: Option<HexId>,
        #[serde(default)]
        sugroup: i64,
        numbytes: u64,
    },
    Put {
        sessionid: HexId,
        sudirs: Vec<SuDirEntry>,
        series: String,
        #[serde(default = "default_put_retention")]
        retention: i64,
        archivetype: ArchiveType,
    },
    DeleteSeries {
        sessionid: HexId,
        series: String,
    },
    Ping {
        sessionid: HexId,
    },
    Poll {
        sessionid: HexId,
        requestid: String,
    },
}

const REQUEST_TYPES: [&str; 10] = [
    "open",
    "close",
    "rollback",
    "info",
    "get",
    "alloc",
    "put",
    "deleteseries",
    "ping",
    "poll",
];

impl SumsRequest {
    /// Parses a decoded request frame. An unknown `reqtype` is
    /// `BadRequestType`; a known type with bad fields is `BadRequest`.
    pub fn parse(value: Value, sunum_list_max: usize) -> SumsResult<Self> {
        let reqtype = match value.get("reqtype") {
            Some(Value::String(s)) => s.to_ascii_lowercase(),
            Some(other) => {
                return Err(SumsError::BadRequest(format!(
                    "reqtype must be a string, got {}",
                    other
                )))
            }
            None => return Err(SumsError::BadRequest("missing reqtype".to_string())),
        };
        if !REQUEST_TYPES.contains(&reqtype.as_str()) {
            return Err(SumsError::BadRequestType(reqtype));
        }

        let mut value = value;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("reqtype".to_string(), Value::String(reqtype.clone()));
        }

        let request: SumsRequest = serde_json::from_value(value)
            .map_err(|e| SumsError::BadRequest(format!("{}: {}", reqtype, e)))?;
        request.check_limits(sunum_list_max)?;
        Ok(request)
    }

    fn check_limits(&self, sunum_list_max: usize) -> SumsResult<()> {
        let count = match self {
            SumsRequest::Info { sus, .. } | SumsRequest::Get { sus, .. } => sus.len(),
            SumsRequest::Put { sudirs, .. } => sudirs.len(),
            _ => 0,
        };
        if count > sunum_list_max {
            return Err(SumsError::BadRequest(format!(
                "too many storage units in request: {} > {}",
                count, sunum_list_max
            )));
        }
        if let SumsRequest::Put { sudirs, .. } = self {
            if sudirs.is_empty() {
                return Err(SumsError::BadRequest("put without sudirs".to_string()));
            }
        }
        Ok(())
    }

    pub fn reqtype(&self) -> &'static str {
        match self {
            SumsRequest::Open => "open",
            SumsRequest::Close { .. } => "close",
            SumsRequest::Rollback { .. } => "rollback",
            SumsRequest::Info { .. } => "info",
            SumsRequest::Get { .. } => "get",
            SumsRequest::Alloc { .. } => "alloc",
            SumsRequest::Put { .. } => "put",
            SumsRequest::DeleteSeries { .. } => "deleteseries",
            SumsRequest::Ping { .. } => "ping",
            SumsRequest::Poll { .. } => "poll",
        }
    }

    pub fn session_id(&self) -> Option<u64> {
        match self {
            SumsRequest::Open => None,
            SumsRequest::Close { sessionid }
            | SumsRequest::Rollback { sessionid }
            | SumsRequest::Info { sessionid, .. }
            | SumsRequest::Get { sessionid, .. }
            | SumsRequest::Alloc { sessionid, .. }
            | SumsRequest::Put { sessionid, .. }
            | SumsRequest::DeleteSeries { sessionid, .. }
            | SumsRequest::Ping { sessionid }
            | SumsRequest::Poll { sessionid, .. } => Some(sessionid.value()),
        }
    }
}

/// One `info` entry. Unknown SUs are answered with `SuInfo::placeholder`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SuInfo {
    pub sunum: HexId,
    pub online_loc: String,
    pub online_status: String,
    pub archive_status: String,
    pub offsite_ack: String,
    pub history_comment: String,
    pub owning_series: String,
    pub storage_group: i64,
    pub bytes: HexId,
    pub creat_date: String,
    pub username: String,
    pub arch_tape: String,
    pub arch_tape_fn: i64,
    pub arch_tape_date: String,
    pub safe_tape: String,
    pub safe_tape_fn: i64,
    pub safe_tape_date: String,
    pub effective_date: String,
    pub pa_status: i64,
    pub pa_substatus: i64,
}

impl SuInfo {
    pub fn placeholder(sunum: Sunum) -> Self {
        SuInfo {
            sunum: HexId(sunum),
            online_loc: String::new(),
            online_status: "N".to_string(),
            archive_status: "N".to_string(),
            offsite_ack: "N".to_string(),
            history_comment: String::new(),
            owning_series: String::new(),
            storage_group: 0,
            bytes: HexId(0),
            creat_date: String::new(),
            username: String::new(),
            arch_tape: TAPE_PLACEHOLDER.to_string(),
            arch_tape_fn: 0,
            arch_tape_date: TAPE_DATE_PLACEHOLDER.to_string(),
            safe_tape: TAPE_PLACEHOLDER.to_string(),
            safe_tape_fn: 0,
            safe_tape_date: TAPE_DATE_PLACEHOLDER.to_string(),
            effective_date: TAPE_PLACEHOLDER.to_string(),
            pa_status: 0,
            pa_substatus: 0,
        }
    }
}

/// `get` result for one SU. `path` is null when the SU is offline or unknown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuPath {
    pub sunum: HexId,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SumsResponse {
    Opened { session_id: u64 },
    Done,
    Info(Vec<SuInfo>),
    Paths(Vec<SuPath>),
    TapeRead { request_id: String },
    Allocated { sunum: Sunum, sudir: String },
    PollPending { request_id: String },
    PollDone(Vec<SuPath>),
}

impl SumsResponse {
    pub fn to_value(&self) -> Value {
        let ok = SumsStatus::Ok.as_str();
        match self {
            SumsResponse::Opened { session_id } => json!({
                "status": ok,
                "sessionid": HexId(*session_id),
            }),
            SumsResponse::Done => json!({ "status": ok }),
            SumsResponse::Info(infos) => json!({
                "status": ok,
                "suinfo": infos,
            }),
            SumsResponse::Paths(paths) => json!({
                "status": ok,
                "supaths": paths,
            }),
            SumsResponse::TapeRead { request_id } => json!({
                "status": ok,
                "taperead-requestid": request_id,
            }),
            SumsResponse::Allocated { sunum, sudir } => json!({
                "status": ok,
                "sunum": HexId(*sunum),
                "sudir": sudir,
            }),
            SumsResponse::PollPending { request_id } => json!({
                "reqtype": "get",
                "status": SumsStatus::TapeRead.as_str(),
                "taperead-requestid": request_id,
            }),
            SumsResponse::PollDone(paths) => json!({
                "reqtype": "get",
                "status": ok,
                "supaths": paths,
            }),
        }
    }
}

pub fn error_response(err: &SumsError) -> Value {
    let mut obj = Map::new();
    obj.insert(
        "status".to_string(),
        Value::String(err.status().as_str().to_string()),
    );
    obj.insert("errmsg".to_string(), Value::String(err.client_message()));
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 32768;

    #[test]
    fn test_parse_put() {
        let req = SumsRequest::parse(
            json!({
                "reqtype": "put",
                "sessionid": "1A",
                "sudirs": [{"2b": "/SUM1/D43"}, {"2C": "/SUM1/D44"}],
                "series": "hmi.M_45s",
                "archivetype": "temporary+archive"
            }),
            MAX,
        )
        .unwrap();
        match req {
            SumsRequest::Put {
                sessionid,
                sudirs,
                retention,
                archivetype,
                ..
            } => {
                assert_eq!(sessionid.value(), 0x1a);
                assert_eq!(sudirs.len(), 2);
                assert_eq!(sudirs[0].sunum, 0x2b);
                assert_eq!(sudirs[1].path, PathBuf::from("/SUM1/D44"));
                assert_eq!(retention, DEFAULT_PUT_RETENTION_DAYS);
                assert_eq!(archivetype, ArchiveType::TemporaryArchive);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_kinds() {
        let err = SumsRequest::parse(json!({"reqtype": "fly"}), MAX).unwrap_err();
        assert_eq!(err.status(), SumsStatus::BadRequestType);

        let err = SumsRequest::parse(json!({"reqtype": "info", "sessionid": "1"}), MAX).unwrap_err();
        assert_eq!(err.status(), SumsStatus::BadRequest);

        let err = SumsRequest::parse(json!({"sessionid": "1"}), MAX).unwrap_err();
        assert_eq!(err.status(), SumsStatus::BadRequest);

        let err = SumsRequest::parse(
            json!({"reqtype": "put", "sessionid": "1", "sudirs": [{"1": "/a"}], "series": "s"}),
            MAX,
        )
        .unwrap_err();
        assert_eq!(err.status(), SumsStatus::BadRequest);
    }

    #[test]
    fn test_list_cap() {
        let sus: Vec<String> = (0..5).map(|i| format!("{:x}", i)).collect();
        let req = json!({"reqtype": "info", "sessionid": "1", "sus": sus});
        assert!(SumsRequest::parse(req.clone(), 5).is_ok());
        let err = SumsRequest::parse(req, 4).unwrap_err();
        assert_eq!(err.status(), SumsStatus::BadRequest);
    }

    #[test]
    fn test_placeholder_json() {
        let value = serde_json::to_value(SuInfo::placeholder(0xabc)).unwrap();
        assert_eq!(
            value,
            json!({
                "sunum": "ABC",
                "onlineLoc": "",
                "onlineStatus": "N",
                "archiveStatus": "N",
                "offsiteAck": "N",
                "historyComment": "",
                "owningSeries": "",
                "storageGroup": 0,
                "bytes": "0",
                "creatDate": "",
                "username": "",
                "archTape": "N/A",
                "archTapeFn": 0,
                "archTapeDate": "1958-01-01 00:00:00",
                "safeTape": "N/A",
                "safeTapeFn": 0,
                "safeTapeDate": "1958-01-01 00:00:00",
                "effectiveDate": "N/A",
                "paStatus": 0,
                "paSubstatus": 0
            })
        );
    }

    #[test]
    fn test_response_shapes() {
        let v = SumsResponse::Paths(vec![SuPath {
            sunum: HexId(1),
            path: None,
        }])
        .to_value();
        assert_eq!(v, json!({"status": "ok", "supaths": [{"sunum": "1", "path": null}]}));

        let v = SumsResponse::PollPending {
            request_id: "7".to_string(),
        }
        .to_value();
        assert_eq!(v["status"], "taperead");
        assert_eq!(v["reqtype"], "get");

        let v = error_response(&SumsError::SessionClosed("no session".to_string()));
        assert_eq!(v["status"], "session-closed");
        assert!(v["errmsg"].as_str().unwrap().contains("no session"));
    }
}
