use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use std::sync::Arc;

mod actuator;
mod args;
mod cdc;
mod channels;
mod cli;
mod coordinator;
mod db;
mod error;
mod gc;
mod metrics;
mod observer;
mod planner;
mod reconciler;
mod service;
mod ttl;

use args::{Cli, Commands, RunArgs, WorkspaceCommands};

#[tokio::main]
async fn main() -> Result<()> {
    codehub_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_controller(args).await,
        Commands::InitDb(args) => {
            let pool = codehub_common::postgres::create_pool(args.postgres).await;
            db::init_schema(&pool).await
        }
        Commands::Workspace(args) => match args.command {
            WorkspaceCommands::Create(args) => cli::run_create(args).await,
            WorkspaceCommands::Get(args) => cli::run_get(args).await,
            WorkspaceCommands::List(args) => cli::run_list(args).await,
            WorkspaceCommands::Update(args) => cli::run_update(args).await,
            WorkspaceCommands::Delete(args) => cli::run_delete(args).await,
            WorkspaceCommands::ResetError(args) => cli::run_reset_error(args).await,
        },
    }
}

async fn run_controller(args: RunArgs) -> Result<()> {
    println!("{}", "⚙️ Starting workspace control plane...".green());
    codehub_common::metrics::maybe_spawn_metrics_server();

    let pool = codehub_common::postgres::create_pool(args.postgres.clone()).await;
    db::init_schema(&pool)
        .await
        .context("failed to initialize database schema")?;
    let redis = codehub_common::redis::init_redis(&args.redis).await;

    let s3_client = actuator::objectstore::create_s3_client(&args.s3)
        .await
        .context("failed to create s3 client")?;
    let store = actuator::objectstore::ObjectStore::new(s3_client, args.s3.bucket.clone());

    let docker = bollard::Docker::connect_with_local_defaults()
        .context("failed to connect to docker daemon")?;
    let job_env = actuator::job::JobEnv {
        image: args.job_image.clone(),
        endpoint: args.s3.endpoint.clone().unwrap_or_default(),
        access_key: args.s3.access_key.clone().unwrap_or_default(),
        secret_key: args.s3.secret_key.clone().unwrap_or_default(),
    };

    let mut actuators = actuator::Actuators::new();
    actuators.register_instance(
        "docker",
        Arc::new(actuator::docker::DockerInstanceController::with_client(
            docker.clone(),
        )),
    );
    actuators.register_storage(
        "docker",
        Arc::new(actuator::storage::DockerStorageProvider::new(
            docker,
            store.clone(),
            job_env,
        )),
    );
    let actuators = Arc::new(actuators);

    let service = Arc::new(service::WorkspaceService::new(
        pool.clone(),
        service::ServiceLimits {
            max_running_per_user: args.max_running_per_user,
            max_running_global: args.max_running_global,
        },
    ));

    let cancel = codehub_common::shutdown::cancel_on_shutdown();
    codehub_common::signal_ready();

    let coordinator = Arc::new(coordinator::Coordinator {
        pg_args: args.postgres,
        redis_args: args.redis,
        pool,
        redis,
        actuators,
        store,
        service,
    });
    coordinator.run(cancel).await
}
