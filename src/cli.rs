use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Data directory (default: ~/.kb)
    #[clap(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Cluster a chunk catalog and persist the derived cluster data
    Build {
        /// Path to a JSON chunk catalog
        #[clap(short, long)]
        input: PathBuf,

        /// Override the configured algorithm: hierarchical or dbscan
        #[clap(long)]
        algorithm: Option<String>,

        /// Hide the progress bar
        #[clap(short, long)]
        quiet: bool,
    },

    /// Rank clusters against a query
    Query {
        /// Query text
        text: String,

        /// Maximum number of clusters to return
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Do not record exposure for the returned clusters
        #[clap(long)]
        no_record: bool,
    },

    /// Show knowledge coverage and remaining gaps
    Progress {},

    /// Destroy all persisted knowledge state
    Reset {
        /// Skip the confirmation prompt
        #[clap(short, long)]
        yes: bool,
    },

    /// Export the data directory as a tar.gz archive
    Export {
        /// Output path (default: kb-backup-<timestamp>.tar.gz, or stdout when piped)
        output: Option<PathBuf>,
    },

    /// Import a previously exported archive
    Import {
        /// Archive path (reads stdin when piped)
        archive: Option<PathBuf>,

        /// Skip the confirmation prompt
        #[clap(short, long)]
        yes: bool,
    },
}
