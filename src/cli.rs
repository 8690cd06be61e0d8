use clap::{Parser, Subcommand, ValueEnum};
use mediagrab_lib::SourceKind;

#[derive(Debug, Parser)]
#[command(name = "mediagrab", version, about = "Fetch media metadata and download a chosen format")]
pub struct Cli {
    /// Write a log file for this run even when disabled in settings.
    #[arg(long, global = true)]
    pub debug_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the formats available for a URL (cached until the media links expire).
    Metadata {
        url: String,
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        /// Ignore any cached copy.
        #[arg(long)]
        refresh: bool,
    },
    /// Download one format of a URL. Ctrl-C pauses the download.
    Download {
        url: String,
        #[arg(short, long)]
        format: String,
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
    /// Restart a paused download from its stored command.
    Resume { job_id: String },
    /// List finished, failed and paused downloads.
    History {
        /// Only downloads that can be resumed.
        #[arg(long)]
        paused: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Video,
    Playlist,
    Generic,
}

impl From<KindArg> for SourceKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Video => SourceKind::Video,
            KindArg::Playlist => SourceKind::Playlist,
            KindArg::Generic => SourceKind::Generic,
        }
    }
}
