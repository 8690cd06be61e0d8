pub mod database;
pub mod download;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod settings;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

pub use database::{Database, DownloadJob, JobStatus};
pub use download::manager::{DownloadEvent, DownloadManager, Emitter};
pub use download::process::CommandSpec;
pub use error::{EngineError, Result};
pub use metadata::{FormatDescriptor, MetadataCache, MetadataRecord, MetadataSource, YtDlpFetcher};
pub use settings::Settings;
pub use utils::url::{infer_kind, ResourceKey, SourceKind};

/// Load settings and install logging. Call once at startup.
pub fn init() -> Settings {
    let s = settings::load_settings();
    logging::init(&settings::log_dir(), s.debug_logs);
    tracing::info!("engine starting; debug_logs={}", s.debug_logs);
    s
}

/// Metadata cache backed by the configured downloader, recording fetches in
/// the history database.
pub fn metadata_cache(s: &Settings) -> MetadataCache {
    let fetcher = YtDlpFetcher::new(
        s.downloader_path.clone(),
        Duration::from_secs(s.metadata_timeout_secs),
    );
    MetadataCache::new(settings::cache_dir(), Arc::new(fetcher))
        .with_history(settings::history_db_path())
        .with_default_expiry(s.default_expiry_minutes)
}
