use crate::{SumsError, SumsResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SUMS_CONFIG_PATH: &str = "/opt/sums/etc/sums.json";
pub const DEFAULT_SUNUM_LIST_MAX: usize = 32768;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SumsConfig {
    #[serde(alias = "db", alias = "db_file")]
    pub db_path: PathBuf,
    pub daemon: DaemonConfig,
    pub steward: StewardConfig,
    pub partitions: Vec<PartitionSeed>,
    #[serde(alias = "storage_groups")]
    pub groups: Vec<GroupSeed>,
}

impl Default for SumsConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/opt/sums/var/sums.db"),
            daemon: DaemonConfig::default(),
            steward: StewardConfig::default(),
            partitions: Vec::new(),
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(alias = "listen", alias = "addr")]
    pub listen_addr: String,
    #[serde(alias = "workers")]
    pub max_workers: usize,
    #[serde(alias = "db_connections")]
    pub max_db_connections: usize,
    pub sunum_list_max: usize,
    #[serde(alias = "tape")]
    pub tape_enabled: bool,
    pub multi_partition_sets: bool,
    pub alloc_probe_timeout_ms: u64,
    /// Privileged helper run once per SU by put as `<helper> <sudir>`.
    pub chmown_helper: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6102".to_string(),
            max_workers: 32,
            max_db_connections: 4,
            sunum_list_max: DEFAULT_SUNUM_LIST_MAX,
            tape_enabled: false,
            multi_partition_sets: false,
            alloc_probe_timeout_ms: 2000,
            chmown_helper: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    pub chunk_size: usize,
    #[serde(alias = "high")]
    pub high_water: f64,
    #[serde(alias = "low")]
    pub low_water: f64,
    #[serde(alias = "interval_secs")]
    pub scrub_interval_secs: u64,
    #[serde(alias = "sets")]
    pub partition_sets: Vec<i64>,
    pub probe_timeout_ms: u64,
    pub lock_file: PathBuf,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            high_water: 95.0,
            low_water: 90.0,
            scrub_interval_secs: 300,
            partition_sets: vec![0],
            probe_timeout_ms: 5000,
            lock_file: PathBuf::from("/opt/sums/var/.sums_steward_lock"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionSeed {
    #[serde(alias = "partn_name", alias = "path")]
    pub name: String,
    #[serde(default, alias = "pds_set")]
    pub set: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSeed {
    pub group_id: i64,
    #[serde(default, alias = "sum_set")]
    pub set: i64,
}

pub fn read_json_config<T: DeserializeOwned>(path: &Path) -> SumsResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SumsError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| SumsError::InvalidConfig(format!("parse {} failed: {}", path.display(), e)))
}

impl SumsConfig {
    pub fn load(path: &Path) -> SumsResult<Self> {
        let config: SumsConfig = read_json_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SumsResult<()> {
        if self.daemon.max_workers == 0 || self.daemon.max_db_connections == 0 {
            return Err(SumsError::InvalidConfig(
                "pool sizes must be greater than zero".to_string(),
            ));
        }
        if self.steward.low_water > self.steward.high_water {
            return Err(SumsError::InvalidConfig(format!(
                "steward low_water {} above high_water {}",
                self.steward.low_water, self.steward.high_water
            )));
        }
        if self.steward.chunk_size == 0 {
            return Err(SumsError::InvalidConfig(
                "steward chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hand-parsed `--config <path>` for both binaries.
pub fn parse_config_arg(args: &[String], usage: &str) -> Result<PathBuf, String> {
    let mut config_path = PathBuf::from(DEFAULT_SUMS_CONFIG_PATH);
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage.to_string()),
            "--config" | "-c" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage));
            }
        }
        i += 1;
    }
    Ok(config_path)
}
