use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "codehub-archive-job")]
#[command(about = "Ephemeral archive/restore worker for codehub home volumes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream the data volume into an archive object
    Archive(JobArgs),

    /// Populate the data volume from an archive object
    Restore(JobArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct JobArgs {
    /// Fully resolved target, e.g. s3://bucket/archives/{id}/{op}/home.tar.zst.
    /// The job never constructs paths itself.
    #[arg(long, env = "ARCHIVE_URL", required = true)]
    pub archive_url: String,

    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "S3_ACCESS_KEY")]
    pub s3_access_key: Option<String>,

    #[arg(long, env = "S3_SECRET_KEY")]
    pub s3_secret_key: Option<String>,

    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// Mount point of the target volume
    #[arg(long, env = "DATA_DIR", default_value = "/data")]
    pub data_dir: String,

    /// Ephemeral scratch space, discarded on re-run
    #[arg(long, env = "SCRATCH_DIR", default_value = "/tmp")]
    pub scratch_dir: String,

    /// Self-imposed deadline
    #[arg(long, env = "JOB_TIMEOUT_SECONDS", default_value_t = 1800)]
    pub timeout_seconds: u64,
}
