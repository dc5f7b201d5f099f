use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Developer CLI for the entry bridge and store
#[derive(Parser)]
#[command(name = "ivehub")]
#[command(about = "Exercise the extension bridge and entry store against an in-process extension", long_about = None)]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the liveness probe and report the outcome
    Probe {
        /// Version the fake extension advertises
        #[arg(long)]
        provider_version: Option<String>,
        /// Simulate an extension that never answers
        #[arg(long)]
        offline: bool,
    },
    /// List entries through the store
    List {
        /// Backup file to import before listing
        #[arg(long)]
        seed: Option<PathBuf>,
        /// Case-insensitive title filter
        #[arg(long)]
        title: Option<String>,
        /// Only favorited entries
        #[arg(long)]
        favorites: bool,
        #[arg(long)]
        page_size: Option<usize>,
        /// Keep loading pages until the last one
        #[arg(long)]
        all: bool,
    },
    /// Import a backup, then export it again
    Export {
        #[arg(long)]
        seed: PathBuf,
        /// Directory the dated backup file is written to
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Import a backup and report what made it
    Import {
        file: PathBuf,
    },
    /// Import a backup, then attach a funscript file to one of its entries as a local script
    AddScript {
        #[arg(long)]
        seed: PathBuf,
        /// Title of the entry to attach to
        #[arg(long)]
        title: String,
        /// Script file (JSON)
        file: PathBuf,
    },
}
