use clap::{Parser, Subcommand};
use codehub_common::args::{PostgresArgs, RedisArgs, S3Args};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "codehub-controller")]
#[command(about = "Workspace control plane for codehub")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane (leader election + control loops)
    Run(RunArgs),

    /// Initialize the database schema and exit
    InitDb(InitDbArgs),

    /// Workspace administration
    Workspace(WorkspaceCommandArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub redis: RedisArgs,

    #[clap(flatten)]
    pub s3: S3Args,

    /// Image run by archive/restore worker containers
    #[arg(long, env = "JOB_IMAGE", default_value = "codehub/archive-job:latest")]
    pub job_image: String,

    /// Max concurrently running workspaces per user
    #[arg(long, env = "MAX_RUNNING_PER_USER", default_value_t = 3)]
    pub max_running_per_user: i64,

    /// Max concurrently running workspaces across all users
    #[arg(long, env = "MAX_RUNNING_GLOBAL", default_value_t = 50)]
    pub max_running_global: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct InitDbArgs {
    #[clap(flatten)]
    pub postgres: PostgresArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct WorkspaceCommandArgs {
    #[command(subcommand)]
    pub command: WorkspaceCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum WorkspaceCommands {
    /// Create a new workspace
    Create(CreateWorkspaceArgs),
    /// Get a workspace by ID
    Get(WorkspaceIdArgs),
    /// List workspaces
    List(ListWorkspacesArgs),
    /// Update a workspace (metadata, TTLs, desired state)
    Update(UpdateWorkspaceArgs),
    /// Soft-delete a workspace
    Delete(WorkspaceIdArgs),
    /// Clear a terminal error so the workspace can recover
    ResetError(WorkspaceIdArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct CreateWorkspaceArgs {
    #[clap(flatten)]
    pub service: ServiceArgs,

    #[arg(long)]
    pub owner: String,

    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long)]
    pub memo: Option<String>,

    #[arg(long)]
    pub image: String,

    #[arg(long, default_value = "docker")]
    pub instance_backend: String,

    #[arg(long, default_value = "docker")]
    pub storage_backend: String,

    #[arg(long, default_value = "PENDING")]
    pub desired_state: String,

    #[arg(long, default_value_t = 300)]
    pub standby_ttl_seconds: i64,

    #[arg(long, default_value_t = 604_800)]
    pub archive_ttl_seconds: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct WorkspaceIdArgs {
    #[clap(flatten)]
    pub service: ServiceArgs,

    pub id: Uuid,
}

#[derive(Parser, Debug, Clone)]
pub struct ListWorkspacesArgs {
    #[clap(flatten)]
    pub service: ServiceArgs,

    /// Filter by owner
    #[arg(long)]
    pub owner: Option<String>,

    #[arg(long, default_value_t = 100)]
    pub limit: i64,

    #[arg(long, default_value_t = 0)]
    pub offset: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct UpdateWorkspaceArgs {
    #[clap(flatten)]
    pub service: ServiceArgs,

    pub id: Uuid,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long)]
    pub memo: Option<String>,

    #[arg(long)]
    pub standby_ttl_seconds: Option<i64>,

    #[arg(long)]
    pub archive_ttl_seconds: Option<i64>,

    #[arg(long)]
    pub desired_state: Option<String>,
}

/// Connection + quota knobs shared by every admin verb; the CLI speaks to
/// the same service layer the API and TTL controller use.
#[derive(Parser, Debug, Clone)]
pub struct ServiceArgs {
    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[arg(long, env = "MAX_RUNNING_PER_USER", default_value_t = 3)]
    pub max_running_per_user: i64,

    #[arg(long, env = "MAX_RUNNING_GLOBAL", default_value_t = 50)]
    pub max_running_global: i64,
}
