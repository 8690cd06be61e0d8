pub mod cache;
pub mod enrich;
pub mod fetcher;
pub mod live_formats;
pub mod record;

pub use cache::MetadataCache;
pub use fetcher::{MetadataSource, YtDlpFetcher};
pub use record::{FormatDescriptor, MetadataRecord};
