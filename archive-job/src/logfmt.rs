//! The job's structured log contract: `KEY=VALUE` lines on stdout. The
//! controller parses `CODEHUB_ERROR` to classify failures; the exit code
//! alone decides success.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobErrorCode {
    S3AccessError,
    ArchiveNotFound,
    MetaNotFound,
    ChecksumMismatch,
    TarExtractFailed,
    DiskFull,
}

impl JobErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            JobErrorCode::S3AccessError => "S3_ACCESS_ERROR",
            JobErrorCode::ArchiveNotFound => "ARCHIVE_NOT_FOUND",
            JobErrorCode::MetaNotFound => "META_NOT_FOUND",
            JobErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            JobErrorCode::TarExtractFailed => "TAR_EXTRACT_FAILED",
            JobErrorCode::DiskFull => "DISK_FULL",
        }
    }

    /// Whether the job may retry the failing step internally before
    /// giving up.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            JobErrorCode::S3AccessError | JobErrorCode::TarExtractFailed
        )
    }
}

#[derive(Debug)]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Classify an I/O failure: a full disk has its own code, everything
    /// else belongs to the step's default.
    pub fn from_io(default: JobErrorCode, e: &std::io::Error, what: &str) -> Self {
        let code = if is_disk_full(e) {
            JobErrorCode::DiskFull
        } else {
            default
        };
        Self::new(code, format!("{what}: {e}"))
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for JobError {}

pub fn is_disk_full(e: &std::io::Error) -> bool {
    // ENOSPC; StorageFull is still unstable as an ErrorKind match on some
    // toolchains, the raw errno is not.
    e.raw_os_error() == Some(28)
}

pub fn step(name: &str) {
    println!("STEP={name}");
}

pub fn kv(key: &str, value: &str) {
    println!("{key}={value}");
}

pub fn success() {
    println!("RESULT=OK");
}

pub fn skipped() {
    println!("RESULT=SKIP");
}

pub fn failure(error: &JobError) {
    eprintln!("job failed: {error}");
    println!("CODEHUB_ERROR={}", error.code.as_str());
    println!("RESULT=FAIL");
}

pub fn timed_out() {
    println!("RESULT=TIMEOUT");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_wire_grammar() {
        assert_eq!(JobErrorCode::S3AccessError.as_str(), "S3_ACCESS_ERROR");
        assert_eq!(JobErrorCode::ChecksumMismatch.as_str(), "CHECKSUM_MISMATCH");
        assert_eq!(JobErrorCode::DiskFull.as_str(), "DISK_FULL");
    }

    #[test]
    fn only_transient_classes_retry() {
        assert!(JobErrorCode::S3AccessError.retryable());
        assert!(JobErrorCode::TarExtractFailed.retryable());
        assert!(!JobErrorCode::ArchiveNotFound.retryable());
        assert!(!JobErrorCode::MetaNotFound.retryable());
        assert!(!JobErrorCode::ChecksumMismatch.retryable());
        assert!(!JobErrorCode::DiskFull.retryable());
    }

    #[test]
    fn enospc_is_disk_full() {
        let e = std::io::Error::from_raw_os_error(28);
        assert!(is_disk_full(&e));
        let e = std::io::Error::from_raw_os_error(2);
        assert!(!is_disk_full(&e));
        assert_eq!(
            JobError::from_io(JobErrorCode::TarExtractFailed, &std::io::Error::from_raw_os_error(28), "write").code,
            JobErrorCode::DiskFull
        );
    }
}
