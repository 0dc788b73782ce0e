//! Operator verbs that talk straight to the service layer.

use crate::args::{
    CreateWorkspaceArgs, ListWorkspacesArgs, ServiceArgs, UpdateWorkspaceArgs, WorkspaceIdArgs,
};
use crate::service::{CreateWorkspace, ServiceLimits, UpdateWorkspace, WorkspaceService};
use anyhow::{Context, Result};
use codehub_types::{DesiredState, Workspace};

async fn service(args: &ServiceArgs) -> WorkspaceService {
    let pool = codehub_common::postgres::create_pool(args.postgres.clone()).await;
    WorkspaceService::new(
        pool,
        ServiceLimits {
            max_running_per_user: args.max_running_per_user,
            max_running_global: args.max_running_global,
        },
    )
}

fn print_workspace(ws: &Workspace) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(ws).context("failed to serialize workspace")?
    );
    Ok(())
}

pub async fn run_create(args: CreateWorkspaceArgs) -> Result<()> {
    let desired: DesiredState = args
        .desired_state
        .parse()
        .context("invalid --desired-state")?;
    let ws = service(&args.service)
        .await
        .create(CreateWorkspace {
            owner_user_id: args.owner,
            name: args.name,
            description: args.description,
            memo: args.memo,
            image_ref: args.image,
            instance_backend: args.instance_backend,
            storage_backend: args.storage_backend,
            desired_state: desired,
            standby_ttl_seconds: args.standby_ttl_seconds,
            archive_ttl_seconds: args.archive_ttl_seconds,
        })
        .await?;
    print_workspace(&ws)
}

pub async fn run_get(args: WorkspaceIdArgs) -> Result<()> {
    let ws = service(&args.service).await.get(args.id).await?;
    print_workspace(&ws)
}

pub async fn run_list(args: ListWorkspacesArgs) -> Result<()> {
    let list = service(&args.service)
        .await
        .list(args.owner.as_deref(), args.limit, args.offset)
        .await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&list).context("failed to serialize workspaces")?
    );
    Ok(())
}

pub async fn run_update(args: UpdateWorkspaceArgs) -> Result<()> {
    let desired = args
        .desired_state
        .as_deref()
        .map(str::parse::<DesiredState>)
        .transpose()
        .context("invalid --desired-state")?;
    let ws = service(&args.service)
        .await
        .update(
            args.id,
            UpdateWorkspace {
                name: args.name,
                description: args.description,
                memo: args.memo,
                standby_ttl_seconds: args.standby_ttl_seconds,
                archive_ttl_seconds: args.archive_ttl_seconds,
                desired_state: desired,
            },
        )
        .await?;
    print_workspace(&ws)
}

pub async fn run_delete(args: WorkspaceIdArgs) -> Result<()> {
    let ws = service(&args.service).await.delete(args.id).await?;
    print_workspace(&ws)
}

pub async fn run_reset_error(args: WorkspaceIdArgs) -> Result<()> {
    service(&args.service).await.reset_error(args.id).await?;
    println!("error state cleared for {}", args.id);
    Ok(())
}
