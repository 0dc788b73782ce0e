use clap::Parser;
use std::time::Duration;

mod archive;
mod args;
mod logfmt;
mod restore;
mod s3;

use args::{Cli, Commands};

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr; stdout is reserved for the KEY=VALUE
    // contract the controller parses.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (job_args, is_archive) = match &cli.command {
        Commands::Archive(args) => (args.clone(), true),
        Commands::Restore(args) => (args.clone(), false),
    };

    let (bucket, key) = match s3::parse_archive_url(&job_args.archive_url) {
        Ok(parts) => parts,
        Err(e) => {
            logfmt::failure(&e);
            std::process::exit(1);
        }
    };
    let client = s3::create_client(&job_args).await;

    let deadline = Duration::from_secs(job_args.timeout_seconds);
    let work = async {
        if is_archive {
            archive::run(&client, &bucket, &key, &job_args).await
        } else {
            restore::run(&client, &bucket, &key, &job_args).await
        }
    };

    match tokio::time::timeout(deadline, work).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            logfmt::failure(&e);
            std::process::exit(1);
        }
        Err(_) => {
            // Crash-only: scratch state dies with the container; a partial
            // blob under the op-id path is overwritten or skipped by the
            // next attempt.
            logfmt::timed_out();
            std::process::exit(3);
        }
    }
}
