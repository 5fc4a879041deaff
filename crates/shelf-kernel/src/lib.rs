//! Pointer indirection over a capability-scoped object store.
//!
//! Publishers ask for an [`UploadGrant`]: two write capabilities, one for a
//! freshly named artifact object and one for the tool's `latest.json`
//! pointer. They upload the artifact, then overwrite the pointer with a
//! document naming it. Readers call [`ShelfKernel::resolve_latest`], which
//! reads the pointer and hands back read capabilities for both objects.
//!
//! The two writes are not atomic and nothing here sequences them. A pointer
//! may therefore name an artifact that is missing or still being uploaded;
//! the resolver reports what the pointer says unless `verify_artifact` is
//! enabled.

pub mod keys;
pub mod pointer;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use shelf_store::{Capability, ObjectStore, ReadOptions, StoreError, WriteConstraints, NO_STORE};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

pub use keys::{ToolName, LATEST_OBJECT};
pub use pointer::{format_timestamp, PointerDocument};

pub const DEFAULT_UPLOAD_EXPIRY: Duration = Duration::from_secs(900);
pub const DEFAULT_READ_EXPIRY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub upload_expiry: Duration,
    pub read_expiry: Duration,
    /// Head the artifact before issuing its read capability.
    pub verify_artifact: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            upload_expiry: DEFAULT_UPLOAD_EXPIRY,
            read_expiry: DEFAULT_READ_EXPIRY,
            verify_artifact: false,
        }
    }
}

/// Write capabilities for one publish cycle.
#[derive(Debug, Clone)]
pub struct UploadGrant {
    pub artifact: Capability,
    pub pointer: Capability,
    pub key: String,
    pub latest_key: String,
    pub expires_in: Duration,
}

/// Read capabilities for the currently published artifact of a tool.
#[derive(Debug, Clone)]
pub struct LatestResolution {
    pub pointer: Capability,
    pub artifact: Capability,
    pub key: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{0}")]
    Validation(&'static str),
    #[error("no published artifact for tool '{0}' yet")]
    NotPublished(String),
    #[error("pointer {pointer} is inconsistent: {reason}")]
    InconsistentPointer {
        pointer: String,
        reason: &'static str,
    },
    #[error("pointer {pointer} is not valid JSON: {source}")]
    MalformedPointer {
        pointer: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub const POINTER_WITHOUT_KEY: &str = "pointer exists but names no artifact";
pub const POINTER_TO_MISSING_ARTIFACT: &str = "pointer references a missing artifact";

#[derive(Clone)]
pub struct ShelfKernel {
    store: Arc<dyn ObjectStore>,
    config: KernelConfig,
}

impl ShelfKernel {
    pub fn new(store: Arc<dyn ObjectStore>, config: KernelConfig) -> Self {
        Self { store, config }
    }

    /// Issues the artifact and pointer write capabilities for `tool`.
    #[instrument(skip(self))]
    pub async fn sign_upload(&self, tool: Option<&str>) -> Result<UploadGrant, KernelError> {
        let tool = ToolName::parse(tool).ok_or(KernelError::Validation("tool is required"))?;

        let key = tool.artifact_key(Utc::now(), &keys::random_suffix());
        let latest_key = tool.latest_key();
        let expires_in = self.config.upload_expiry;

        let artifact = self
            .store
            .sign_write(&key, &WriteConstraints::json(), expires_in)
            .await?;
        let pointer = self
            .store
            .sign_write(
                &latest_key,
                &WriteConstraints::json().with_cache_control(NO_STORE),
                expires_in,
            )
            .await?;

        info!(%tool, %key, "upload capabilities issued");
        Ok(UploadGrant {
            artifact,
            pointer,
            key,
            latest_key,
            expires_in,
        })
    }

    /// Follows `tool`'s pointer and issues read capabilities for it and the
    /// artifact it names.
    #[instrument(skip(self))]
    pub async fn resolve_latest(&self, tool: Option<&str>) -> Result<LatestResolution, KernelError> {
        let tool = ToolName::parse(tool)
            .ok_or(KernelError::Validation("tool query parameter is required"))?;
        let latest_key = tool.latest_key();
        let read = ReadOptions::no_store();

        if self.store.head(&latest_key).await?.is_none() {
            info!(%tool, "no pointer published");
            return Err(KernelError::NotPublished(tool.to_string()));
        }

        let pointer = self
            .store
            .sign_read(&latest_key, &read, self.config.read_expiry)
            .await?;

        let object = self.store.fetch(&latest_key).await?;
        let document =
            PointerDocument::parse(&object.body).map_err(|source| KernelError::MalformedPointer {
                pointer: latest_key.clone(),
                source,
            })?;

        let Some(key) = document.key else {
            error!(%tool, pointer = %latest_key, "{POINTER_WITHOUT_KEY}");
            return Err(KernelError::InconsistentPointer {
                pointer: latest_key,
                reason: POINTER_WITHOUT_KEY,
            });
        };

        if self.config.verify_artifact && self.store.head(&key).await?.is_none() {
            error!(%tool, pointer = %latest_key, %key, "{POINTER_TO_MISSING_ARTIFACT}");
            return Err(KernelError::InconsistentPointer {
                pointer: latest_key,
                reason: POINTER_TO_MISSING_ARTIFACT,
            });
        }
        if !keys::is_artifact_key(&tool, &key) {
            warn!(%tool, %key, "pointer names a key outside the artifact naming scheme");
        }

        let artifact = self
            .store
            .sign_read(&key, &read, self.config.read_expiry)
            .await?;

        let updated_at = document
            .updated_at
            .or_else(|| object.last_modified.map(format_timestamp));

        info!(%tool, %key, "latest artifact resolved");
        Ok(LatestResolution {
            pointer,
            artifact,
            key,
            updated_at,
        })
    }
}
