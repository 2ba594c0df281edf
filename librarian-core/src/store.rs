use serde::{Deserialize, Serialize};
use std::fmt;

/// A storage backend known to the librarian.
///
/// The shape is fixed at registration. Used bytes are not stored here: the
/// capacity ledger owns them and reports them through [`crate::StoreUsage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub name: String,
    pub capacity: u64,
    pub rsync_endpoint: String,
    pub http_endpoint: String,
    /// Storage root on the backend; only transport drivers interpret it.
    pub path: String,
}

/// Store description as supplied by configuration or persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub name: String,
    pub capacity: u64,
    #[serde(default)]
    pub rsync_endpoint: String,
    #[serde(default)]
    pub http_endpoint: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl StoreDescriptor {
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        let name = name.into();
        Self {
            rsync_endpoint: String::new(),
            http_endpoint: String::new(),
            path: String::new(),
            name,
            capacity,
            available: true,
        }
    }

    pub fn with_rsync_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.rsync_endpoint = endpoint.into();
        self
    }

    pub fn with_http_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.http_endpoint = endpoint.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn store(&self) -> Store {
        Store {
            name: self.name.clone(),
            capacity: self.capacity,
            rsync_endpoint: self.rsync_endpoint.clone(),
            http_endpoint: self.http_endpoint.clone(),
            path: self.path.clone(),
        }
    }

    pub fn from_store(store: &Store, available: bool) -> Self {
        Self {
            name: store.name.clone(),
            capacity: store.capacity,
            rsync_endpoint: store.rsync_endpoint.clone(),
            http_endpoint: store.http_endpoint.clone(),
            path: store.path.clone(),
            available,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreStatus {
    Available,
    Decommissioned,
}

impl StoreStatus {
    pub fn from_available(available: bool) -> Self {
        if available {
            StoreStatus::Available
        } else {
            StoreStatus::Decommissioned
        }
    }

    pub fn is_available(self) -> bool {
        self == StoreStatus::Available
    }
}

/// Label naming the upstream pipeline a file came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePipeline(String);

impl SourcePipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourcePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourcePipeline {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
