use crate::args::JobArgs;
use crate::logfmt::{JobError, JobErrorCode};
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use std::path::Path;
use std::time::Duration;

/// Internal retry budget for transient object-store failures. The
/// controller has its own, larger-grained budget on top.
const RETRIES: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// `s3://bucket/key` -> (bucket, key).
pub fn parse_archive_url(url: &str) -> Result<(String, String), JobError> {
    let rest = url.strip_prefix("s3://").ok_or_else(|| {
        JobError::new(
            JobErrorCode::S3AccessError,
            format!("unsupported archive url: {url}"),
        )
    })?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(JobError::new(
            JobErrorCode::S3AccessError,
            format!("archive url missing bucket or key: {url}"),
        )),
    }
}

pub async fn create_client(args: &JobArgs) -> S3Client {
    let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(args.s3_region.clone()));

    if let Some(ref endpoint) = args.s3_endpoint {
        config_loader = config_loader.endpoint_url(endpoint);
    }
    if let (Some(access_key), Some(secret_key)) = (&args.s3_access_key, &args.s3_secret_key) {
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
    S3Client::from_conf(s3_config)
}

pub async fn head(client: &S3Client, bucket: &str, key: &str) -> Result<bool, JobError> {
    with_retries("head", key, || async {
        match client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(JobError::new(
                        JobErrorCode::S3AccessError,
                        format!("head {key}: {service_error}"),
                    ))
                }
            }
        }
    })
    .await
}

/// Download `key` to `dest`. `missing` names the code for a 404 so the
/// blob and its sidecar classify differently.
pub async fn download(
    client: &S3Client,
    bucket: &str,
    key: &str,
    dest: &Path,
    missing: JobErrorCode,
) -> Result<(), JobError> {
    with_retries("download", key, || async {
        let response = match client.get_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(JobError::new(missing, format!("{key} does not exist")));
                }
                return Err(JobError::new(
                    JobErrorCode::S3AccessError,
                    format!("get {key}: {service_error}"),
                ));
            }
        };
        let bytes = response.body.collect().await.map_err(|e| {
            JobError::new(JobErrorCode::S3AccessError, format!("read {key}: {e}"))
        })?;
        tokio::fs::write(dest, bytes.into_bytes())
            .await
            .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "write download"))
    })
    .await
}

pub async fn upload_file(
    client: &S3Client,
    bucket: &str,
    key: &str,
    path: &Path,
) -> Result<(), JobError> {
    with_retries("upload", key, || async {
        let body = ByteStream::from_path(path).await.map_err(|e| {
            JobError::new(
                JobErrorCode::S3AccessError,
                format!("open {}: {e}", path.display()),
            )
        })?;
        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| {
                JobError::new(JobErrorCode::S3AccessError, format!("put {key}: {e}"))
            })
    })
    .await
}

pub async fn upload_bytes(
    client: &S3Client,
    bucket: &str,
    key: &str,
    bytes: Vec<u8>,
) -> Result<(), JobError> {
    with_retries("upload", key, || {
        let bytes = bytes.clone();
        async move {
            client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(bytes))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| {
                    JobError::new(JobErrorCode::S3AccessError, format!("put {key}: {e}"))
                })
        }
    })
    .await
}

async fn with_retries<T, F, Fut>(what: &str, key: &str, mut op: F) -> Result<T, JobError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, JobError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.code.retryable() && attempt < RETRIES => {
                tracing::warn!(what, key, attempt, error = %e, "retrying");
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_url_splits_into_bucket_and_key() {
        let (bucket, key) =
            parse_archive_url("s3://codehub/archives/a/b/home.tar.zst").unwrap();
        assert_eq!(bucket, "codehub");
        assert_eq!(key, "archives/a/b/home.tar.zst");
    }

    #[test]
    fn malformed_urls_are_rejected() {
        for url in ["http://x/y", "s3://", "s3://bucket", "s3://bucket/"] {
            let e = parse_archive_url(url).unwrap_err();
            assert_eq!(e.code, JobErrorCode::S3AccessError, "{url}");
        }
    }
}
