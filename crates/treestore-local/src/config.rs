use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

/// Configuration for the treestore command-line tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "treestore")]
#[command(about = "Per-owner file tree over SQLite metadata and local-disk blobs")]
pub struct Config {
    /// Owner whose tree is operated on
    #[arg(long, env = "TREESTORE_OWNER")]
    pub owner: String,

    /// SQLite database holding the tree metadata
    #[arg(long, default_value = "treestore.db", env = "TREESTORE_DATABASE")]
    pub database: PathBuf,

    /// Directory holding file contents
    #[arg(long, default_value = "files", env = "TREESTORE_BLOB_DIR")]
    pub blob_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a directory
    Mkdir {
        name: String,
        /// Parent directory id (root when omitted)
        #[arg(long, default_value = "")]
        parent: String,
    },

    /// Upload a local file
    Put {
        path: PathBuf,
        /// Name in the tree (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,
        /// Parent directory id (root when omitted)
        #[arg(long, default_value = "")]
        parent: String,
    },

    /// Move a node under another directory (use the owner as id for root)
    Mv { id: String, new_parent: String },

    /// Rename a node
    Rename { id: String, new_name: String },

    /// Delete a node and everything below it
    Rm { id: String },

    /// Download a file's content
    Get {
        id: String,
        /// Write to this path instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show one node
    Stat { id: String },

    /// List the children of a directory
    Ls {
        #[arg(long, default_value = "")]
        parent: String,
        /// Maximum number of entries (0 = unlimited)
        #[arg(long, default_value = "0")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// List every node of the owner ordered by path
    Tree {
        #[arg(long)]
        dirs_only: bool,
    },
}

impl Config {
    /// Database path, resolved against the working directory.
    pub fn database_path(&self) -> PathBuf {
        resolve(&self.database)
    }

    /// Blob directory, resolved against the working directory.
    pub fn blob_path(&self) -> PathBuf {
        resolve(&self.blob_dir)
    }
}

fn resolve(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
