use crate::archive::{parse_meta, sha256_file};
use crate::args::JobArgs;
use crate::logfmt::{self, JobError, JobErrorCode};
use crate::s3;
use aws_sdk_s3::Client as S3Client;
use std::fs::File;
use std::path::{Component, Path, PathBuf};

/// Restore the archive object into the data volume. The download is
/// verified against the sidecar before anything touches the volume, and
/// extraction lands in scratch first: a failed run leaves `/data` as it
/// was.
pub async fn run(
    client: &S3Client,
    bucket: &str,
    key: &str,
    args: &JobArgs,
) -> Result<(), JobError> {
    let scratch = PathBuf::from(&args.scratch_dir);
    let blob_path = scratch.join("home.tar.zst");
    let meta_path = scratch.join("home.tar.zst.meta");
    let sidecar = format!("{key}.meta");

    logfmt::step("download");
    s3::download(client, bucket, key, &blob_path, JobErrorCode::ArchiveNotFound).await?;
    s3::download(client, bucket, &sidecar, &meta_path, JobErrorCode::MetaNotFound).await?;

    // Content-MD5 and ETag are not trusted (multipart disagreement); the
    // sidecar digest over the downloaded bytes is the only integrity
    // check.
    logfmt::step("verify");
    let meta_content = std::fs::read_to_string(&meta_path)
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "read sidecar"))?;
    let expected = parse_meta(&meta_content).ok_or_else(|| {
        JobError::new(
            JobErrorCode::ChecksumMismatch,
            format!("sidecar is not a sha256 line: {meta_content:?}"),
        )
    })?;
    let actual = {
        let blob_path = blob_path.clone();
        tokio::task::spawn_blocking(move || sha256_file(&blob_path))
            .await
            .map_err(|e| {
                JobError::new(JobErrorCode::TarExtractFailed, format!("digest task: {e}"))
            })?
            .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "digest blob"))?
    };
    if actual != expected {
        return Err(JobError::new(
            JobErrorCode::ChecksumMismatch,
            format!("expected sha256:{expected}, downloaded blob is sha256:{actual}"),
        ));
    }

    logfmt::step("extract");
    let staging = scratch.join("staging");
    if staging.exists() {
        std::fs::remove_dir_all(&staging)
            .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "clear staging"))?;
    }
    std::fs::create_dir_all(&staging)
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "create staging"))?;
    {
        let blob_path = blob_path.clone();
        let staging = staging.clone();
        tokio::task::spawn_blocking(move || unpack_archive(&blob_path, &staging))
            .await
            .map_err(|e| {
                JobError::new(JobErrorCode::TarExtractFailed, format!("extract task: {e}"))
            })??;
    }

    logfmt::step("sync");
    let data_dir = PathBuf::from(&args.data_dir);
    tokio::task::spawn_blocking(move || sync_dirs(&staging, &data_dir))
        .await
        .map_err(|e| JobError::new(JobErrorCode::TarExtractFailed, format!("sync task: {e}")))?
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "sync into volume"))?;

    logfmt::success();
    Ok(())
}

/// Extract tar+zstd into `dest`. Absolute paths and parent-dir escapes are
/// refused outright; remote ownership is never applied.
pub fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<(), JobError> {
    let file = File::open(archive_path)
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "open archive"))?;
    let decoder = zstd::Decoder::new(file)
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "init zstd"))?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(false);
    archive.set_unpack_xattrs(false);

    let entries = archive
        .entries()
        .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "read entries"))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "read entry"))?;
        let path = entry
            .path()
            .map_err(|e| JobError::from_io(JobErrorCode::TarExtractFailed, &e, "entry path"))?
            .into_owned();
        if safe_join(dest, &path).is_none() {
            return Err(JobError::new(
                JobErrorCode::TarExtractFailed,
                format!("refusing unsafe entry path: {}", path.display()),
            ));
        }
        // unpack_in re-validates against the destination root, covering
        // link targets as well as names.
        entry.unpack_in(dest).map_err(|e| {
            JobError::from_io(JobErrorCode::TarExtractFailed, &e, "unpack entry")
        })?;
    }
    Ok(())
}

/// Join an archive-relative path onto `base`, refusing absolute paths and
/// any `..` component.
pub fn safe_join(base: &Path, relative: &Path) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => return None,
        }
    }
    Some(out)
}

/// Mirror `src` into `dst` with deletion: afterwards `dst` contains
/// exactly the tree under `src`.
pub fn sync_dirs(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;

    // Delete entries the source no longer has.
    for entry in std::fs::read_dir(dst)? {
        let entry = entry?;
        let counterpart = src.join(entry.file_name());
        if counterpart.symlink_metadata().is_ok() {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }

    // Copy everything over.
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            // Replace a same-named non-directory before recursing.
            if target.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                std::fs::remove_file(&target)?;
            }
            sync_dirs(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                if target.is_dir() && !target.is_symlink() {
                    std::fs::remove_dir_all(&target)?;
                } else {
                    std::fs::remove_file(&target)?;
                }
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(link, &target)?;
            #[cfg(not(unix))]
            let _ = link;
        } else {
            if target.symlink_metadata().is_ok_and(|m| m.is_dir()) {
                std::fs::remove_dir_all(&target)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::pack_dir;

    #[test]
    fn safe_join_refuses_escapes() {
        let base = Path::new("/staging");
        assert_eq!(
            safe_join(base, Path::new("home/user/file.txt")),
            Some(PathBuf::from("/staging/home/user/file.txt"))
        );
        assert_eq!(
            safe_join(base, Path::new("./ok.txt")),
            Some(PathBuf::from("/staging/ok.txt"))
        );
        assert!(safe_join(base, Path::new("../evil.txt")).is_none());
        assert!(safe_join(base, Path::new("a/../../evil.txt")).is_none());
        assert!(safe_join(base, Path::new("/etc/passwd")).is_none());
    }

    #[test]
    fn pack_then_unpack_round_trips_content() {
        let scratch = tempfile::tempdir().unwrap();
        let src = scratch.path().join("volume");
        std::fs::create_dir_all(src.join("project/src")).unwrap();
        std::fs::create_dir_all(src.join("empty-dir")).unwrap();
        std::fs::write(src.join("project/src/main.rs"), b"fn main() {}\n").unwrap();
        std::fs::write(src.join(".bashrc"), b"export EDITOR=hx\n").unwrap();

        let archive = scratch.path().join("home.tar.zst");
        pack_dir(&src, &archive).unwrap();

        let staging = scratch.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        unpack_archive(&archive, &staging).unwrap();

        assert_eq!(
            std::fs::read(staging.join("project/src/main.rs")).unwrap(),
            b"fn main() {}\n"
        );
        assert_eq!(
            std::fs::read(staging.join(".bashrc")).unwrap(),
            b"export EDITOR=hx\n"
        );
        assert!(staging.join("empty-dir").is_dir());
    }

    #[test]
    fn packing_twice_produces_equal_trees_after_unpack() {
        let scratch = tempfile::tempdir().unwrap();
        let src = scratch.path().join("volume");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("notes.md"), b"idempotence\n").unwrap();

        let a1 = scratch.path().join("a1.tar.zst");
        let a2 = scratch.path().join("a2.tar.zst");
        pack_dir(&src, &a1).unwrap();
        pack_dir(&src, &a2).unwrap();

        for (archive, out) in [(&a1, "out1"), (&a2, "out2")] {
            let out = scratch.path().join(out);
            std::fs::create_dir_all(&out).unwrap();
            unpack_archive(archive, &out).unwrap();
            assert_eq!(std::fs::read(out.join("notes.md")).unwrap(), b"idempotence\n");
        }
    }

    #[test]
    fn sync_deletes_extras_and_overwrites() {
        let scratch = tempfile::tempdir().unwrap();
        let src = scratch.path().join("staging");
        let dst = scratch.path().join("data");
        std::fs::create_dir_all(src.join("keep")).unwrap();
        std::fs::write(src.join("keep/file.txt"), b"new").unwrap();
        std::fs::create_dir_all(dst.join("stale-dir")).unwrap();
        std::fs::write(dst.join("stale.txt"), b"stale").unwrap();
        std::fs::create_dir_all(dst.join("keep")).unwrap();
        std::fs::write(dst.join("keep/file.txt"), b"old").unwrap();

        sync_dirs(&src, &dst).unwrap();

        assert!(!dst.join("stale.txt").exists());
        assert!(!dst.join("stale-dir").exists());
        assert_eq!(std::fs::read(dst.join("keep/file.txt")).unwrap(), b"new");
    }

    /// The archive/restore round trip the whole storage path relies on:
    /// pack, verify, extract, promote — byte-faithful end to end.
    #[test]
    fn volume_round_trip_is_byte_faithful() {
        let scratch = tempfile::tempdir().unwrap();
        let volume = scratch.path().join("volume");
        std::fs::create_dir_all(volume.join("deep/nested/dir")).unwrap();
        std::fs::write(volume.join("deep/nested/dir/blob.bin"), [7u8; 4096]).unwrap();
        std::fs::write(volume.join("top.txt"), b"top\n").unwrap();

        let archive = scratch.path().join("home.tar.zst");
        pack_dir(&volume, &archive).unwrap();
        let digest = sha256_file(&archive).unwrap();
        assert_eq!(digest.len(), 64);

        let staging = scratch.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        unpack_archive(&archive, &staging).unwrap();

        let restored = scratch.path().join("restored");
        std::fs::create_dir_all(&restored).unwrap();
        std::fs::write(restored.join("leftover.txt"), b"gone after sync").unwrap();
        sync_dirs(&staging, &restored).unwrap();

        assert_eq!(
            std::fs::read(restored.join("deep/nested/dir/blob.bin")).unwrap(),
            vec![7u8; 4096]
        );
        assert_eq!(std::fs::read(restored.join("top.txt")).unwrap(), b"top\n");
        assert!(!restored.join("leftover.txt").exists());
    }
}
