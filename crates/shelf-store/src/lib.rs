//! Capability-scoped object store access for the tool shelf.
//!
//! The shelf never proxies payload bytes. It only needs four things from a
//! blob store: issue a signed write URL for one key, issue a signed read URL
//! for one key, probe whether a key exists, and fetch a (small) object body.
//! [`ObjectStore`] captures exactly that surface so the pointer logic can run
//! against S3 in production and against [`MemoryObjectStore`] in tests.

pub mod memory;
pub mod s3;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::{MemoryObjectStore, RedeemError};
pub use s3::{S3ObjectStore, S3Settings};

/// Content type every shelf object is written with.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Cache directive applied to mutable objects and read capabilities.
pub const NO_STORE: &str = "no-store";

/// Storage operation a capability authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityMethod {
    Put,
    Get,
}

impl CapabilityMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityMethod::Put => "PUT",
            CapabilityMethod::Get => "GET",
        }
    }
}

/// Headers the eventual PUT must carry for a write capability to be honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteConstraints {
    pub content_type: String,
    pub cache_control: Option<String>,
}

impl WriteConstraints {
    pub fn json() -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE.to_string(),
            cache_control: None,
        }
    }

    pub fn with_cache_control(mut self, directive: impl Into<String>) -> Self {
        self.cache_control = Some(directive.into());
        self
    }
}

/// Response overrides baked into a read capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub response_cache_control: Option<String>,
}

impl ReadOptions {
    pub fn no_store() -> Self {
        Self {
            response_cache_control: Some(NO_STORE.to_string()),
        }
    }
}

/// A signed, time-limited authorization for one operation on one key.
///
/// The store keeps no record of issued capabilities; validity is carried by
/// the signature embedded in `url` and checked by the store on use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub method: CapabilityMethod,
    pub key: String,
    pub url: String,
    pub expires_in: Duration,
    pub issued_at: DateTime<Utc>,
}

impl Capability {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + chrono::Duration::from_std(self.expires_in).unwrap_or_default()
    }
}

/// Metadata returned by an existence probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub last_modified: Option<DateTime<Utc>>,
    pub content_length: Option<u64>,
}

/// A fetched object body together with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object '{0}' not found")]
    NotFound(String),
    #[error("invalid expiry for '{key}': {reason}")]
    InvalidExpiry { key: String, reason: String },
    #[error("object store {operation} failed for '{key}'")]
    Backend {
        operation: &'static str,
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StoreError {
    pub(crate) fn backend(
        operation: &'static str,
        key: &str,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        StoreError::Backend {
            operation,
            key: key.to_string(),
            source: source.into(),
        }
    }
}

/// Capability-issuing view of a blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Issues a write capability for `key`, constrained by `constraints`.
    async fn sign_write(
        &self,
        key: &str,
        constraints: &WriteConstraints,
        expires_in: Duration,
    ) -> Result<Capability, StoreError>;

    /// Issues a read capability for `key`. Does not check that `key` exists.
    async fn sign_read(
        &self,
        key: &str,
        options: &ReadOptions,
        expires_in: Duration,
    ) -> Result<Capability, StoreError>;

    /// Probes `key` without transferring its body. `Ok(None)` means absent.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError>;

    /// Reads the full body of `key`.
    async fn fetch(&self, key: &str) -> Result<StoredObject, StoreError>;
}
