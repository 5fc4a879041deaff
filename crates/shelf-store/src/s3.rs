//! S3 backend built on `aws-sdk-s3` presigning.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{presigning::PresigningConfig, primitives::DateTime as AwsDateTime, Client};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::{
    Capability, CapabilityMethod, ObjectMeta, ObjectStore, ReadOptions, StoreError, StoredObject,
    WriteConstraints,
};

#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Builds a client from the ambient AWS configuration chain, applying the
    /// overrides in `settings`.
    pub async fn connect(settings: S3Settings) -> anyhow::Result<Self> {
        anyhow::ensure!(!settings.bucket.is_empty(), "S3 bucket name must not be empty");

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = settings.region.clone() {
            loader = loader.region(Region::new(region));
        }
        if let Some(endpoint) = settings.endpoint_url.clone() {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(settings.force_path_style)
            .build();
        Ok(Self::from_client(Client::from_conf(config), settings.bucket))
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    fn presigning(key: &str, expires_in: Duration) -> Result<PresigningConfig, StoreError> {
        PresigningConfig::expires_in(expires_in).map_err(|err| StoreError::InvalidExpiry {
            key: key.to_string(),
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(level = "debug", skip(self, constraints))]
    async fn sign_write(
        &self,
        key: &str,
        constraints: &WriteConstraints,
        expires_in: Duration,
    ) -> Result<Capability, StoreError> {
        let issued_at = Utc::now();
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&constraints.content_type)
            .set_cache_control(constraints.cache_control.clone())
            .presigned(Self::presigning(key, expires_in)?)
            .await
            .map_err(|err| StoreError::backend("presign PUT", key, err))?;

        Ok(Capability {
            method: CapabilityMethod::Put,
            key: key.to_string(),
            url: presigned.uri().to_string(),
            expires_in,
            issued_at,
        })
    }

    #[instrument(level = "debug", skip(self, options))]
    async fn sign_read(
        &self,
        key: &str,
        options: &ReadOptions,
        expires_in: Duration,
    ) -> Result<Capability, StoreError> {
        let issued_at = Utc::now();
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_response_cache_control(options.response_cache_control.clone())
            .presigned(Self::presigning(key, expires_in)?)
            .await
            .map_err(|err| StoreError::backend("presign GET", key, err))?;

        Ok(Capability {
            method: CapabilityMethod::Get,
            key: key.to_string(),
            url: presigned.uri().to_string(),
            expires_in,
            issued_at,
        })
    }

    #[instrument(level = "debug", skip(self))]
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                last_modified: output.last_modified().and_then(to_chrono),
                content_length: output
                    .content_length()
                    .and_then(|length| u64::try_from(length).ok()),
            })),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|service| service.is_not_found())
                    .unwrap_or(false)
                    || err.raw_response().map(|raw| raw.status().as_u16()) == Some(404);
                if not_found {
                    debug!(bucket = %self.bucket, "object absent");
                    Ok(None)
                } else {
                    Err(StoreError::backend("HEAD", key, err))
                }
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, key: &str) -> Result<StoredObject, StoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(StoreError::NotFound(key.to_string()));
                }
                return Err(StoreError::backend("GET", key, err));
            }
        };

        let last_modified = output.last_modified().and_then(to_chrono);
        let content_type = output.content_type().map(str::to_string);
        let body = output
            .body
            .collect()
            .await
            .context("reading object body")
            .map_err(|err| StoreError::backend("GET", key, err))?
            .into_bytes()
            .to_vec();

        Ok(StoredObject {
            body,
            content_type,
            last_modified,
        })
    }
}

fn to_chrono(value: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(value.secs(), value.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::Credentials;

    fn offline_store() -> S3ObjectStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new(
                "AKIDEXAMPLE",
                "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
                None,
                None,
                "static",
            ))
            .force_path_style(true)
            .build();
        S3ObjectStore::from_client(Client::from_conf(config), "shelf-bucket")
    }

    #[test]
    fn converts_aws_timestamps() {
        let value = AwsDateTime::from_secs(1_714_564_800);
        assert_eq!(
            to_chrono(&value).unwrap().to_rfc3339(),
            "2024-05-01T12:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn presigns_write_without_network() {
        let store = offline_store();
        let capability = store
            .sign_write(
                "tool-a/latest.json",
                &WriteConstraints::json().with_cache_control("no-store"),
                Duration::from_secs(900),
            )
            .await
            .unwrap();

        assert_eq!(capability.method, CapabilityMethod::Put);
        assert_eq!(capability.expires_in, Duration::from_secs(900));
        assert!(capability.url.contains("/shelf-bucket/tool-a/latest.json"));
        assert!(capability.url.contains("X-Amz-Expires=900"));
        assert!(capability.url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn presigns_read_with_cache_override() {
        let store = offline_store();
        let capability = store
            .sign_read(
                "tool-a/latest.json",
                &ReadOptions::no_store(),
                Duration::from_secs(300),
            )
            .await
            .unwrap();

        assert_eq!(capability.method, CapabilityMethod::Get);
        assert!(capability.url.contains("X-Amz-Expires=300"));
        assert!(capability.url.contains("response-cache-control=no-store"));
    }

    #[tokio::test]
    async fn rejects_expiry_beyond_presign_limit() {
        let store = offline_store();
        let err = store
            .sign_read(
                "tool-a/latest.json",
                &ReadOptions::default(),
                Duration::from_secs(8 * 24 * 60 * 60),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidExpiry { .. }));
    }
}
