//! `treestore` command-line tool.
//!
//! Operates on one owner's tree per invocation:
//! - metadata in a SQLite database
//! - file contents in a blob directory
//!
//! Nodes are printed as JSON lines on stdout; logs go to stderr.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use treestore_core::{FileNode, TreeService};
use treestore_local::config::{Command, Config};
use treestore_local::create_service;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let database = config.database_path();
    let blob_dir = config.blob_path();

    info!("treestore v{}", env!("CARGO_PKG_VERSION"));
    info!("  Owner: {}", config.owner);
    info!("  Database: {}", database.display());
    info!("  Blob directory: {}", blob_dir.display());

    let service = create_service(&database, &blob_dir)?;
    let owner = config.owner.as_str();

    match config.command {
        Command::Mkdir { name, parent } => {
            let node = service.create_directory(owner, &parent, &name).await?;
            print_json(&node)?;
        }
        Command::Put { path, name, parent } => {
            let name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .with_context(|| format!("{} has no file name", path.display()))?,
            };
            let mut file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let size = file.metadata().await?.len();
            let node = service
                .create_file(owner, &parent, &name, size, &mut file)
                .await?;
            print_json(&node)?;
        }
        Command::Mv { id, new_parent } => {
            let node = service.move_file(owner, &id, &new_parent).await?;
            print_json(&node)?;
        }
        Command::Rename { id, new_name } => {
            let node = service.rename_file(owner, &id, &new_name).await?;
            print_json(&node)?;
        }
        Command::Rm { id } => {
            let summary = service.delete_file(owner, &id).await?;
            print_json(&DeleteOutput {
                id: &id,
                nodes_deleted: summary.nodes_deleted,
                blobs_deleted: summary.blobs_deleted,
                blob_failures: &summary.blob_failures,
            })?;
        }
        Command::Get { id, output } => {
            let (mut reader, node) = service.download(owner, &id).await?;
            let written = match output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    let written = tokio::io::copy(&mut reader, &mut file).await?;
                    file.flush().await?;
                    written
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    let written = tokio::io::copy(&mut reader, &mut stdout).await?;
                    stdout.flush().await?;
                    written
                }
            };
            info!("Downloaded {} ({} bytes)", node.path(), written);
        }
        Command::Stat { id } => {
            let node = service.get_file(owner, &id).await?;
            print_json(&node)?;
        }
        Command::Ls {
            parent,
            limit,
            offset,
        } => {
            let nodes = service.list_children(owner, &parent, limit, offset).await?;
            print_nodes(&nodes)?;
        }
        Command::Tree { dirs_only } => {
            print_tree(&service, owner, dirs_only).await?;
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct DeleteOutput<'a> {
    id: &'a str,
    nodes_deleted: usize,
    blobs_deleted: usize,
    blob_failures: &'a [String],
}

#[derive(Serialize)]
struct TreeEntry<'a> {
    path: String,
    #[serde(flatten)]
    node: &'a FileNode,
}

async fn print_tree(service: &TreeService, owner: &str, dirs_only: bool) -> anyhow::Result<()> {
    let nodes = service.list_by_owner(owner, dirs_only, 0, 0).await?;
    for node in &nodes {
        print_json(&TreeEntry {
            path: node.path(),
            node,
        })?;
    }
    Ok(())
}

fn print_nodes(nodes: &[FileNode]) -> anyhow::Result<()> {
    for node in nodes {
        print_json(node)?;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
