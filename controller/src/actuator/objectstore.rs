use crate::error::{ActuatorError, ActuatorResult};
use anyhow::Result;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::Region;
use codehub_common::args::S3Args;
use codehub_types::{meta_key, reason};

/// Create an S3 client from the provided arguments. Path-style addressing
/// is forced so MinIO-style endpoints resolve without wildcard DNS.
pub async fn create_s3_client(args: &S3Args) -> Result<S3Client> {
    let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(args.region.clone()));

    if let Some(ref endpoint) = args.endpoint {
        config_loader = config_loader.endpoint_url(endpoint);
    }
    if let (Some(access_key), Some(secret_key)) = (&args.access_key, &args.secret_key) {
        config_loader = config_loader.credentials_provider(
            aws_credential_types::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "codehub-static",
            ),
        );
    }

    let config = config_loader.load().await;
    let s3_config = aws_sdk_s3::config::Builder::from(&config)
        .force_path_style(true)
        .build();
    Ok(S3Client::from_conf(s3_config))
}

/// Object-store side of the storage provider: probes, deletes, listing.
#[derive(Clone)]
pub struct ObjectStore {
    client: S3Client,
    bucket: String,
}

impl ObjectStore {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn exists(&self, key: &str) -> ActuatorResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(ActuatorError::unreachable(format!(
                        "head {key}: {service_error}"
                    )))
                }
            }
        }
    }

    /// Condition probe for a referenced archive: the blob and its sidecar
    /// must both be retrievable and the sidecar well-formed.
    pub async fn archive_accessible(&self, archive_key: &str) -> ActuatorResult<(bool, String)> {
        if !self.exists(archive_key).await? {
            return Ok((false, reason::ARCHIVE_NOT_FOUND.to_string()));
        }
        let sidecar = meta_key(archive_key);
        if !self.exists(&sidecar).await? {
            return Ok((false, reason::ARCHIVE_CORRUPTED.to_string()));
        }
        match self.read_small(&sidecar).await {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes);
                if content.trim().strip_prefix("sha256:").is_some_and(is_hex) {
                    Ok((true, reason::ARCHIVE_UPLOADED.to_string()))
                } else {
                    Ok((false, reason::ARCHIVE_CORRUPTED.to_string()))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn read_small(&self, key: &str) -> ActuatorResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ActuatorError::unreachable(format!("get {key}: {e}")))?;
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| ActuatorError::unreachable(format!("read {key}: {e}")))?;
        Ok(body.into_bytes().to_vec())
    }

    /// Delete an archive blob together with its sidecar; both deletes are
    /// idempotent.
    pub async fn delete_archive(&self, archive_key: &str) -> ActuatorResult<()> {
        self.delete(archive_key).await?;
        self.delete(&meta_key(archive_key)).await
    }

    pub async fn delete(&self, key: &str) -> ActuatorResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ActuatorError::unreachable(format!("delete {key}: {e}")))
    }

    /// List every object key under `prefix`, following pagination.
    pub async fn list_keys(&self, prefix: &str) -> ActuatorResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ActuatorError::unreachable(format!("list {prefix}: {e}")))?;

            if let Some(contents) = response.contents {
                for object in contents {
                    if let Some(key) = object.key {
                        keys.push(key);
                    }
                }
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}
