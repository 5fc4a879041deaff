//! In-process object store issuing HMAC-signed `memory://` capabilities.
//!
//! Capabilities are self-contained: every constraint the store later enforces
//! (method, key, expiry, content type, cache directive) travels in the URL
//! query and is covered by the signature. Redeeming a capability therefore
//! needs nothing but the URL and the store's secret.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
    Capability, CapabilityMethod, ObjectMeta, ObjectStore, ReadOptions, StoreError, StoredObject,
    WriteConstraints,
};

type HmacSha256 = Hmac<Sha256>;

const SCHEME: &str = "memory";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RedeemError {
    #[error("malformed capability: {0}")]
    Malformed(String),
    #[error("capability was issued for bucket '{0}'")]
    WrongBucket(String),
    #[error("capability signature does not match")]
    BadSignature,
    #[error("capability expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("capability authorizes {expected}, not {actual}")]
    WrongMethod {
        expected: &'static str,
        actual: String,
    },
    #[error("content type '{actual}' does not match signed '{expected}'")]
    ContentTypeMismatch { expected: String, actual: String },
    #[error("object '{0}' not found")]
    NotFound(String),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    body: Vec<u8>,
    content_type: String,
    cache_control: Option<String>,
    last_modified: DateTime<Utc>,
}

impl StoredEntry {
    fn to_object(&self) -> StoredObject {
        StoredObject {
            body: self.body.clone(),
            content_type: Some(self.content_type.clone()),
            last_modified: Some(self.last_modified),
        }
    }
}

/// Fields covered by a capability signature.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Grant {
    method: String,
    key: String,
    expires_ms: i64,
    content_type: Option<String>,
    cache_control: Option<String>,
}

impl Grant {
    fn canonical(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.method,
            self.key,
            self.expires_ms,
            self.content_type.as_deref().unwrap_or_default(),
            self.cache_control.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Clone)]
pub struct MemoryObjectStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    bucket: String,
    secret: Vec<u8>,
    objects: RwLock<HashMap<String, StoredEntry>>,
    issued: AtomicU64,
}

impl std::fmt::Debug for MemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObjectStore")
            .field("bucket", &self.inner.bucket)
            .field("objects", &self.inner.objects.read().len())
            .finish()
    }
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                bucket: bucket.into(),
                secret: secret.into(),
                objects: RwLock::new(HashMap::new()),
                issued: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_random_secret(bucket: impl Into<String>) -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::new(bucket, secret)
    }

    /// Number of capabilities issued since construction.
    pub fn issued_capabilities(&self) -> u64 {
        self.inner.issued.load(Ordering::SeqCst)
    }

    /// Writes an object directly, bypassing capabilities.
    pub fn put_object(&self, key: &str, content_type: &str, body: impl Into<Vec<u8>>) {
        self.insert(key, content_type, None, body.into(), Utc::now());
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.inner.objects.read().get(key).map(StoredEntry::to_object)
    }

    pub fn cache_control(&self, key: &str) -> Option<String> {
        self.inner
            .objects
            .read()
            .get(key)
            .and_then(|entry| entry.cache_control.clone())
    }

    /// Performs the PUT a write capability authorizes.
    pub fn redeem_put(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<String, RedeemError> {
        self.redeem_put_at(url, content_type, body, Utc::now())
    }

    pub fn redeem_put_at(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<String, RedeemError> {
        let grant = self.verify(url, CapabilityMethod::Put, now)?;
        let expected = grant.content_type.clone().unwrap_or_default();
        if expected != content_type {
            return Err(RedeemError::ContentTypeMismatch {
                expected,
                actual: content_type.to_string(),
            });
        }

        self.insert(
            &grant.key,
            content_type,
            grant.cache_control.clone(),
            body.into(),
            now,
        );
        debug!(key = %grant.key, "memory capability redeemed for write");
        Ok(grant.key)
    }

    /// Performs the GET a read capability authorizes.
    pub fn redeem_get(&self, url: &str) -> Result<StoredObject, RedeemError> {
        self.redeem_get_at(url, Utc::now())
    }

    pub fn redeem_get_at(&self, url: &str, now: DateTime<Utc>) -> Result<StoredObject, RedeemError> {
        let grant = self.verify(url, CapabilityMethod::Get, now)?;
        self.object(&grant.key)
            .ok_or(RedeemError::NotFound(grant.key))
    }

    fn insert(
        &self,
        key: &str,
        content_type: &str,
        cache_control: Option<String>,
        body: Vec<u8>,
        at: DateTime<Utc>,
    ) {
        self.inner.objects.write().insert(
            key.to_string(),
            StoredEntry {
                body,
                content_type: content_type.to_string(),
                cache_control,
                last_modified: at,
            },
        );
    }

    fn sign(&self, grant: &Grant) -> String {
        let mut mac = self.mac();
        mac.update(grant.canonical().as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length, including empty ones.
        HmacSha256::new_from_slice(&self.inner.secret).unwrap_or_else(|_| unreachable!())
    }

    fn issue(
        &self,
        method: CapabilityMethod,
        key: &str,
        content_type: Option<&str>,
        cache_control: Option<&str>,
        expires_in: Duration,
    ) -> Result<Capability, StoreError> {
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(expires_in).map_err(|err| {
            StoreError::InvalidExpiry {
                key: key.to_string(),
                reason: err.to_string(),
            }
        })?;
        let grant = Grant {
            method: method.as_str().to_string(),
            key: key.to_string(),
            expires_ms: (issued_at + ttl).timestamp_millis(),
            content_type: content_type.map(str::to_string),
            cache_control: cache_control.map(str::to_string),
        };
        let signature = self.sign(&grant);

        let mut url = Url::parse(&format!("{SCHEME}://{}/object", self.inner.bucket))
            .map_err(|err| StoreError::backend("sign", key, err))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("key", &grant.key);
            query.append_pair("method", &grant.method);
            query.append_pair("expires", &grant.expires_ms.to_string());
            if let Some(content_type) = &grant.content_type {
                query.append_pair("content-type", content_type);
            }
            if let Some(cache_control) = &grant.cache_control {
                query.append_pair("cache-control", cache_control);
            }
            query.append_pair("signature", &signature);
        }

        self.inner.issued.fetch_add(1, Ordering::SeqCst);
        Ok(Capability {
            method,
            key: key.to_string(),
            url: url.into(),
            expires_in,
            issued_at,
        })
    }

    fn verify(
        &self,
        raw: &str,
        method: CapabilityMethod,
        now: DateTime<Utc>,
    ) -> Result<Grant, RedeemError> {
        let url = Url::parse(raw).map_err(|err| RedeemError::Malformed(err.to_string()))?;
        if url.scheme() != SCHEME {
            return Err(RedeemError::Malformed(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        let bucket = url.host_str().unwrap_or_default();
        if bucket != self.inner.bucket {
            return Err(RedeemError::WrongBucket(bucket.to_string()));
        }

        let mut params: HashMap<String, String> = url
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        let mut required = |name: &str| {
            params
                .remove(name)
                .ok_or_else(|| RedeemError::Malformed(format!("missing '{name}' parameter")))
        };
        let key = required("key")?;
        let signed_method = required("method")?;
        let expires_raw = required("expires")?;
        let signature = required("signature")?;
        let expires_ms = expires_raw
            .parse::<i64>()
            .map_err(|_| RedeemError::Malformed(format!("invalid expiry '{expires_raw}'")))?;

        let grant = Grant {
            method: signed_method,
            key,
            expires_ms,
            content_type: params.remove("content-type"),
            cache_control: params.remove("cache-control"),
        };

        let provided = URL_SAFE_NO_PAD
            .decode(signature.as_bytes())
            .map_err(|_| RedeemError::BadSignature)?;
        let mut mac = self.mac();
        mac.update(grant.canonical().as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| RedeemError::BadSignature)?;

        if grant.method != method.as_str() {
            return Err(RedeemError::WrongMethod {
                expected: method.as_str(),
                actual: grant.method,
            });
        }

        let expires_at = DateTime::<Utc>::from_timestamp_millis(grant.expires_ms)
            .ok_or_else(|| RedeemError::Malformed(format!("invalid expiry '{expires_ms}'")))?;
        if now > expires_at {
            return Err(RedeemError::Expired(expires_at));
        }

        Ok(grant)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn sign_write(
        &self,
        key: &str,
        constraints: &WriteConstraints,
        expires_in: Duration,
    ) -> Result<Capability, StoreError> {
        self.issue(
            CapabilityMethod::Put,
            key,
            Some(&constraints.content_type),
            constraints.cache_control.as_deref(),
            expires_in,
        )
    }

    async fn sign_read(
        &self,
        key: &str,
        options: &ReadOptions,
        expires_in: Duration,
    ) -> Result<Capability, StoreError> {
        self.issue(
            CapabilityMethod::Get,
            key,
            None,
            options.response_cache_control.as_deref(),
            expires_in,
        )
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        Ok(self.inner.objects.read().get(key).map(|entry| ObjectMeta {
            last_modified: Some(entry.last_modified),
            content_length: Some(entry.body.len() as u64),
        }))
    }

    async fn fetch(&self, key: &str) -> Result<StoredObject, StoreError> {
        self.object(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JSON_CONTENT_TYPE, NO_STORE};

    fn store() -> MemoryObjectStore {
        MemoryObjectStore::new("shelf-test", b"test-secret".to_vec())
    }

    #[tokio::test]
    async fn write_capability_round_trips() {
        let store = store();
        let capability = store
            .sign_write(
                "tool-a/latest.json",
                &WriteConstraints::json().with_cache_control(NO_STORE),
                Duration::from_secs(900),
            )
            .await
            .unwrap();
        assert_eq!(capability.method, CapabilityMethod::Put);
        assert!(capability.url.starts_with("memory://shelf-test/object?"));

        let key = store
            .redeem_put(&capability.url, JSON_CONTENT_TYPE, br#"{"key":"x"}"#.to_vec())
            .unwrap();
        assert_eq!(key, "tool-a/latest.json");
        assert_eq!(
            store.cache_control("tool-a/latest.json").as_deref(),
            Some("no-store")
        );

        let read = store
            .sign_read("tool-a/latest.json", &ReadOptions::no_store(), Duration::from_secs(300))
            .await
            .unwrap();
        let object = store.redeem_get(&read.url).unwrap();
        assert_eq!(object.body, br#"{"key":"x"}"#.to_vec());
        assert_eq!(object.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(store.issued_capabilities(), 2);
    }

    #[tokio::test]
    async fn keys_with_reserved_characters_survive_encoding() {
        let store = store();
        let key = "my tool?&=/2024-01-01T00-00-00.000Z-abcdef12.json";
        let capability = store
            .sign_write(key, &WriteConstraints::json(), Duration::from_secs(60))
            .await
            .unwrap();
        let written = store
            .redeem_put(&capability.url, JSON_CONTENT_TYPE, b"{}".to_vec())
            .unwrap();
        assert_eq!(written, key);
        assert!(store.object(key).is_some());
    }

    #[tokio::test]
    async fn rejects_expired_capability() {
        let store = store();
        let capability = store
            .sign_write("t/a.json", &WriteConstraints::json(), Duration::from_secs(900))
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(901);
        let err = store
            .redeem_put_at(&capability.url, JSON_CONTENT_TYPE, b"{}".to_vec(), later)
            .unwrap_err();
        assert!(matches!(err, RedeemError::Expired(_)));
        assert!(store.object("t/a.json").is_none());

        store.put_object("t/a.json", JSON_CONTENT_TYPE, b"{}".to_vec());
        let read = store
            .sign_read("t/a.json", &ReadOptions::default(), Duration::from_secs(300))
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(301);
        assert!(matches!(
            store.redeem_get_at(&read.url, later),
            Err(RedeemError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn rejects_content_type_mismatch() {
        let store = store();
        let capability = store
            .sign_write("t/a.json", &WriteConstraints::json(), Duration::from_secs(900))
            .await
            .unwrap();
        let err = store
            .redeem_put(&capability.url, "text/plain", b"{}".to_vec())
            .unwrap_err();
        assert_eq!(
            err,
            RedeemError::ContentTypeMismatch {
                expected: "application/json".into(),
                actual: "text/plain".into(),
            }
        );
    }

    #[tokio::test]
    async fn rejects_tampered_key_and_wrong_method() {
        let store = store();
        let capability = store
            .sign_write("t/a.json", &WriteConstraints::json(), Duration::from_secs(900))
            .await
            .unwrap();
        let tampered = capability.url.replace("key=t%2Fa.json", "key=t%2Fb.json");
        assert_ne!(tampered, capability.url);
        assert_eq!(
            store
                .redeem_put(&tampered, JSON_CONTENT_TYPE, b"{}".to_vec())
                .unwrap_err(),
            RedeemError::BadSignature
        );

        let err = store.redeem_get(&capability.url).unwrap_err();
        assert!(matches!(err, RedeemError::WrongMethod { expected: "GET", .. }));
    }

    #[tokio::test]
    async fn capabilities_are_bound_to_their_store() {
        let issuer = store();
        let other = MemoryObjectStore::new("shelf-test", b"another-secret".to_vec());
        let capability = issuer
            .sign_write("t/a.json", &WriteConstraints::json(), Duration::from_secs(900))
            .await
            .unwrap();
        assert_eq!(
            other
                .redeem_put(&capability.url, JSON_CONTENT_TYPE, b"{}".to_vec())
                .unwrap_err(),
            RedeemError::BadSignature
        );

        let elsewhere = MemoryObjectStore::new("elsewhere", b"test-secret".to_vec());
        assert_eq!(
            elsewhere
                .redeem_put(&capability.url, JSON_CONTENT_TYPE, b"{}".to_vec())
                .unwrap_err(),
            RedeemError::WrongBucket("shelf-test".into())
        );
    }

    #[tokio::test]
    async fn head_and_fetch_distinguish_missing_objects() {
        let store = store();
        assert!(store.head("t/latest.json").await.unwrap().is_none());
        assert!(matches!(
            store.fetch("t/latest.json").await,
            Err(StoreError::NotFound(key)) if key == "t/latest.json"
        ));

        store.put_object("t/latest.json", JSON_CONTENT_TYPE, b"{}".to_vec());
        let meta = store.head("t/latest.json").await.unwrap().unwrap();
        assert_eq!(meta.content_length, Some(2));
        assert!(meta.last_modified.is_some());
        assert_eq!(store.issued_capabilities(), 0);
    }
}
