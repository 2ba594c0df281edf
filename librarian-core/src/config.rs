use crate::placement::{DEFAULT_MAX_RESERVE_ATTEMPTS, PlacementPolicy};
use crate::reconcile::SweepConfig;
use crate::retry::BackoffPolicy;
use crate::store::StoreDescriptor;
use crate::{LibrarianError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibrarianConfig {
    #[serde(default)]
    pub stores: Vec<StoreDescriptor>,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub journal: Option<JournalConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(default = "default_max_reserve_attempts")]
    pub max_reserve_attempts: usize,
    #[serde(default)]
    pub pipeline_affinity: HashMap<String, String>,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_reserve_attempts: default_max_reserve_attempts(),
            pipeline_affinity: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDriver {
    Local,
    Rsync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_transfer_driver")]
    pub driver: TransferDriver,
    #[serde(default = "default_transfer_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_rsync_binary")]
    pub rsync_binary: String,
    #[serde(default)]
    pub rsync_args: Vec<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            driver: default_transfer_driver(),
            max_attempts: default_transfer_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            workers: default_workers(),
            rsync_binary: default_rsync_binary(),
            rsync_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub drift_tolerance_bytes: u64,
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
    #[serde(default = "default_resolved_retention_secs")]
    pub resolved_retention_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            drift_tolerance_bytes: 0,
            reservation_ttl_secs: default_reservation_ttl_secs(),
            resolved_retention_secs: default_resolved_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    pub path: PathBuf,
}

fn default_max_reserve_attempts() -> usize {
    DEFAULT_MAX_RESERVE_ATTEMPTS
}

fn default_transfer_driver() -> TransferDriver {
    TransferDriver::Rsync
}

fn default_transfer_max_attempts() -> usize {
    4
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_workers() -> usize {
    8
}

fn default_rsync_binary() -> String {
    "rsync".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_reservation_ttl_secs() -> u64 {
    3_600
}

fn default_resolved_retention_secs() -> u64 {
    600
}

impl LibrarianConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("LIBRARIAN").separator("__"))
            .build()
            .map_err(|e| LibrarianError::Config(e.to_string()))?;

        let config: LibrarianConfig = settings
            .try_deserialize()
            .map_err(|e| LibrarianError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for store in &self.stores {
            if store.name.trim().is_empty() {
                return Err(LibrarianError::Config(
                    "store name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(store.name.trim()) {
                return Err(LibrarianError::Config(format!(
                    "store {} is listed more than once",
                    store.name
                )));
            }
        }

        if self.transfer.workers == 0 {
            return Err(LibrarianError::Config(
                "transfer.workers must be at least 1".to_string(),
            ));
        }

        if self.reconciliation.interval_secs == 0 {
            return Err(LibrarianError::Config(
                "reconciliation.interval_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn placement_policy(&self) -> PlacementPolicy {
        PlacementPolicy {
            max_reserve_attempts: self.placement.max_reserve_attempts.max(1),
            pipeline_affinity: self.placement.pipeline_affinity.clone(),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            self.transfer.max_attempts,
            Duration::from_millis(self.transfer.base_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.transfer.max_delay_ms))
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: Duration::from_secs(self.reconciliation.interval_secs),
            drift_tolerance_bytes: self.reconciliation.drift_tolerance_bytes,
            reservation_ttl: Duration::from_secs(self.reconciliation.reservation_ttl_secs),
            resolved_retention: Duration::from_secs(self.reconciliation.resolved_retention_secs),
        }
    }
}
