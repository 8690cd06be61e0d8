use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::database::{Database, MetadataFetchRow};
use crate::error::{EngineError, Result};
use crate::metadata::enrich::{enrich, EnrichContext};
use crate::metadata::fetcher::MetadataSource;
use crate::metadata::record::MetadataRecord;
use crate::utils::url::{ResourceKey, SourceKind};

type InFlight = Shared<BoxFuture<'static, Option<MetadataRecord>>>;

const DEFAULT_EXPIRY_MINUTES: i64 = 15;

/// On-disk metadata cache with time-based invalidation. Concurrent lookups
/// of one resource share a single load, so at most one fetch per resource
/// runs at a time.
#[derive(Clone)]
pub struct MetadataCache {
    cache_dir: PathBuf,
    source: Arc<dyn MetadataSource>,
    http: reqwest::Client,
    history_db: Option<PathBuf>,
    default_ttl: Duration,
    in_flight: Arc<Mutex<HashMap<ResourceKey, InFlight>>>,
}

impl MetadataCache {
    pub fn new(cache_dir: impl Into<PathBuf>, source: Arc<dyn MetadataSource>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            source,
            http: reqwest::Client::new(),
            history_db: None,
            default_ttl: Duration::minutes(DEFAULT_EXPIRY_MINUTES),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record every successful fetch in the history database at `db_path`.
    pub fn with_history(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.history_db = Some(db_path.into());
        self
    }

    /// Lifetime of a document whose media URLs carry no expiry.
    pub fn with_default_expiry(mut self, minutes: i64) -> Self {
        self.default_ttl = Duration::minutes(minutes);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn metadata_path(&self, key: &ResourceKey) -> PathBuf {
        self.cache_dir
            .join("metadata")
            .join(key.kind.as_str())
            .join(format!("{}.json", key.id))
    }

    /// Cached record for `url` when present and unexpired, otherwise a fresh
    /// fetch. Any failure surfaces as `MetadataNotFound`; details are logged.
    pub async fn resolve(&self, url: &str, kind: SourceKind, force_refresh: bool) -> Result<MetadataRecord> {
        let key = ResourceKey::from_url(kind, url);
        let load = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => {
                    tracing::debug!("joining in-flight metadata load for {}", key);
                    existing.clone()
                }
                None => {
                    let this = self.clone();
                    let k = key.clone();
                    let url = url.to_string();
                    let fut = async move {
                        let out = this.load(&k, &url, force_refresh).await;
                        this.in_flight.lock().await.remove(&k);
                        out
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key.clone(), fut.clone());
                    fut
                }
            }
        };
        load.await.ok_or(EngineError::MetadataNotFound)
    }

    async fn load(&self, key: &ResourceKey, url: &str, force_refresh: bool) -> Option<MetadataRecord> {
        let path = self.metadata_path(key);
        if !force_refresh {
            match read_cached(key, &path).await {
                Some(rec) if rec.is_fresh(Utc::now()) => {
                    tracing::debug!("metadata cache hit for {}", key);
                    return Some(rec);
                }
                Some(_) => tracing::info!("cached metadata for {} expired, refetching", key),
                None => {}
            }
        }

        match self.fetch(key, url, &path).await {
            Ok(rec) => Some(rec),
            Err(e) => {
                tracing::error!("metadata fetch for {} ({}) failed: {}", key, url, e);
                None
            }
        }
    }

    async fn fetch(&self, key: &ResourceKey, url: &str, path: &Path) -> Result<MetadataRecord> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = path.with_extension("json.part");
        let fetched = self.source.fetch_document(url, key.kind, &part).await;
        let bytes = match fetched {
            Ok(()) => tokio::fs::read(&part).await,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };
        let _ = tokio::fs::remove_file(&part).await;
        let mut record = MetadataRecord::from_slice(key.clone(), &bytes?)?;

        let ctx = EnrichContext {
            cache_dir: &self.cache_dir,
            source: self.source.as_ref(),
            http: &self.http,
            url,
            default_ttl: self.default_ttl,
        };
        enrich(&mut record, &ctx).await;

        tokio::fs::write(path, record.to_bytes()?).await?;
        tracing::info!("fetched metadata for {}", key);

        if let Err(e) = self.record_history(&record, url).await {
            tracing::warn!("metadata history for {} not recorded: {}", key, e);
        }
        Ok(record)
    }

    async fn record_history(&self, record: &MetadataRecord, url: &str) -> Result<()> {
        let Some(db_path) = self.history_db.clone() else {
            return Ok(());
        };
        let row = MetadataFetchRow {
            resource_key: record.key.to_string(),
            url: url.to_string(),
            title: record.title().unwrap_or_default().to_string(),
            source_kind: record.key.kind,
            fetched_at: record.created_at().unwrap_or_else(Utc::now),
        };
        tokio::task::spawn_blocking(move || -> Result<()> {
            Database::open(&db_path)?.record_metadata_fetch(&row)?;
            Ok(())
        })
        .await?
    }
}

async fn read_cached(key: &ResourceKey, path: &Path) -> Option<MetadataRecord> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match MetadataRecord::from_slice(key.clone(), &bytes) {
        Ok(rec) => Some(rec),
        Err(e) => {
            tracing::warn!("ignoring unreadable cached metadata {}: {}", path.display(), e);
            None
        }
    }
}
