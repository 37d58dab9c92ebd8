use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "sluice",
    version,
    about = "Resumable, deduplicated chunked file uploads",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $SLUICE_CONFIG              (environment variable)
  3. ./sluice.yaml               (working directory)

Environment variables:
  SLUICE_CONFIG   Path to configuration file (overrides default search)
  SLUICE_TOKEN    Bearer token attached to requests (overrides config)"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides SLUICE_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Upload one or more files
    Upload {
        /// Server base URL (overrides config)
        #[arg(long)]
        server: Option<String>,

        /// Bearer token attached to requests (overrides config)
        #[arg(long)]
        token: Option<String>,

        /// Chunk size in MiB (overrides config and the server's hint)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=256))]
        chunk_size_mib: Option<u64>,

        /// Max concurrent chunk uploads (1-16, overrides config)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..=16))]
        concurrency: Option<u16>,

        /// Disable the local resume cache
        #[arg(long)]
        no_resume_cache: bool,

        /// Files to upload
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Compute content fingerprints without uploading
    Hash {
        /// Chunk size in MiB used as hashing granularity
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=256))]
        chunk_size_mib: Option<u64>,

        /// Files to fingerprint
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// List the server's upload task records
    Tasks {
        /// Server base URL (overrides config)
        #[arg(long)]
        server: Option<String>,

        /// Delete every listed task record after printing it
        #[arg(long)]
        clear: bool,
    },

    /// Show server-side upload statistics
    Stats {
        /// Server base URL (overrides config)
        #[arg(long)]
        server: Option<String>,
    },

    /// Cancel a tracked upload and discard its stored chunks
    Cancel {
        /// Server base URL (overrides config)
        #[arg(long)]
        server: Option<String>,

        /// Content hash of the upload
        file_hash: String,

        /// File name of the upload
        file_name: String,
    },

    /// List the chunks the server holds for one upload
    Chunks {
        /// Server base URL (overrides config)
        #[arg(long)]
        server: Option<String>,

        /// Content hash of the upload
        file_hash: String,

        /// File name of the upload
        file_name: String,
    },

    /// Write a starter configuration file
    Config {
        /// Destination path (default: ./sluice.yaml)
        dest: Option<String>,
    },
}
