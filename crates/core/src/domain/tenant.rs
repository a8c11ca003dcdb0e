use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Inactive,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Suspended => "suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// A plan limit or toggle attached to a tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Enabled(bool),
    Limit(u64),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantFeatures(pub BTreeMap<String, FeatureValue>);

impl TenantFeatures {
    pub fn with(mut self, key: impl Into<String>, value: FeatureValue) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn limit(&self, key: &str) -> Option<u64> {
        match self.0.get(key) {
            Some(FeatureValue::Limit(limit)) => Some(*limit),
            _ => None,
        }
    }

    pub fn enabled(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(FeatureValue::Enabled(true)))
    }
}

/// Where a tenant's data lives. The URL may embed credentials, so it is kept
/// secret and excluded from `Debug` output.
#[derive(Clone)]
pub struct ConnectionDescriptor {
    pub url: SecretString,
    pub max_connections: u32,
}

impl ConnectionDescriptor {
    pub fn new(url: impl Into<String>, max_connections: u32) -> Self {
        Self { url: SecretString::from(url.into()), max_connections }
    }

    /// Stable digest of everything that affects how a handle is built. Two
    /// descriptors with the same fingerprint produce interchangeable handles.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.url.expose_secret().as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.max_connections.to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub descriptor: ConnectionDescriptor,
    pub status: TenantStatus,
    pub features: TenantFeatures,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, descriptor: ConnectionDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: TenantId(id.into()),
            name: name.into(),
            descriptor,
            status: TenantStatus::Active,
            features: TenantFeatures::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}
