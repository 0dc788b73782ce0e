use crate::args::JobArgs;
use crate::logfmt::{self, JobError, JobErrorCode};
use crate::s3;
use aws_sdk_s3::Client as S3Client;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Archive the data volume to the target object, sidecar included.
/// Idempotent: if both the blob and the sidecar already exist the job
/// skips, which is what makes crashed-and-rerun attempts converge.
pub async fn run(
    client: &S3Client,
    bucket: &str,
    key: &str,
    args: &JobArgs,
) -> Result<(), JobError> {
    let sidecar = format!("{key}.meta");

    logfmt::step("head");
    if s3::head(client, bucket, key).await? && s3::head(client, bucket, &sidecar).await? {
        logfmt::skipped();
        return Ok(());
    }

    logfmt::step("pack");
    let archive_path = PathBuf::from(&args.scratch_dir).join("home.tar.zst");
    {
        let data_dir = PathBuf::from(&args.data_dir);
        let archive_path = archive_path.clone();
        tokio::task::spawn_blocking(move || pack_dir(&data_dir, &archive_path))
            .await
            .map_err(|e| JobError::new(JobErrorCode::TarExtractFailed, format!("pack task: {e}")))??;
    }

    logfmt::step("checksum");
    let digest = {
        let archive_path = archive_path.clone();
        tokio::task::spawn_blocking(move || sha256_file(&archive_path))
            .await
            .map_err(|e| {
                JobError::new(JobErrorCode::TarExtractFailed, format!("digest task: {e}"))
            })?
            .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "digest archive"))?
    };
    logfmt::kv("SHA256", &digest);

    // Blob first, sidecar last: a visible sidecar implies a complete blob.
    logfmt::step("upload");
    s3::upload_file(client, bucket, key, &archive_path).await?;
    s3::upload_bytes(client, bucket, &sidecar, format!("sha256:{digest}").into_bytes()).await?;

    logfmt::success();
    Ok(())
}

/// Stream a directory into tar+zstd on disk.
pub fn pack_dir(src: &Path, dst: &Path) -> Result<(), JobError> {
    let file = File::create(dst)
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "create archive"))?;
    let encoder = zstd::Encoder::new(file, 3)
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "init zstd"))?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", src)
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "tar volume"))?;
    let encoder = builder
        .into_inner()
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "finish tar"))?;
    encoder
        .finish()
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "finish zstd"))?;
    Ok(())
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// The sidecar's sole content is `sha256:<hex>`.
pub fn parse_meta(content: &str) -> Option<String> {
    let digest = content.trim().strip_prefix("sha256:")?;
    let ok = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
    ok.then(|| digest.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_empty_file_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn meta_parsing_is_strict() {
        let digest = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(
            parse_meta(&format!("sha256:{digest}\n")).as_deref(),
            Some(digest)
        );
        assert!(parse_meta("md5:abcd").is_none());
        assert!(parse_meta("sha256:short").is_none());
        assert!(parse_meta("sha256:").is_none());
        assert!(parse_meta(&format!("sha256:{}zz", &digest[..62])).is_none());
    }
}
