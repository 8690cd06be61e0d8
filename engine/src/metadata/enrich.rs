use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::error::{EngineError, Result};
use crate::metadata::fetcher::MetadataSource;
use crate::metadata::live_formats::parse_live_format_table;
use crate::metadata::record::MetadataRecord;
use crate::utils::url::{sanitize, ResourceKey};

static EXPIRE_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/expire/(\d+)(?:/|$)").expect("valid regex"));

const MAX_TITLE_CHARS: usize = 80;

/// Expiry instant encoded in a signed media URL, either as an `expire`
/// query parameter or an `/expire/<secs>/` path segment.
pub fn extract_expiry(media_url: &str) -> Option<DateTime<Utc>> {
    let parsed = Url::parse(media_url).ok()?;
    let secs = parsed
        .query_pairs()
        .find(|(k, _)| k == "expire")
        .and_then(|(_, v)| v.parse::<i64>().ok())
        .or_else(|| {
            EXPIRE_SEGMENT_RE
                .captures(parsed.path())
                .and_then(|c| c[1].parse::<i64>().ok())
        })?;
    DateTime::from_timestamp(secs, 0)
}

/// `expires_at` for a freshly fetched document. The first format carrying
/// video with a URL decides; playlists never expire.
pub fn derive_expiry(
    record: &MetadataRecord,
    created_at: DateTime<Utc>,
    default_ttl: Duration,
) -> Option<DateTime<Utc>> {
    if record.is_playlist() {
        return None;
    }
    let media_url = record.raw_formats().iter().find_map(|f| {
        let vcodec = f.get("vcodec").and_then(Value::as_str)?;
        if vcodec == "none" {
            return None;
        }
        f.get("url").and_then(Value::as_str).filter(|u| !u.is_empty())
    });
    let expires_at = match media_url {
        Some(u) => extract_expiry(u).unwrap_or(created_at + default_ttl),
        None => created_at,
    };
    Some(expires_at.max(created_at))
}

pub fn thumbnail_path(cache_dir: &Path, key: &ResourceKey, title: &str, thumb_url: &str) -> PathBuf {
    let ext = Url::parse(thumb_url)
        .ok()
        .and_then(|u| {
            let last = u.path_segments()?.last()?.to_string();
            let (_, ext) = last.rsplit_once('.')?;
            (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
                .then(|| ext.to_ascii_lowercase())
        })
        .unwrap_or_else(|| "jpg".to_string());
    let title: String = sanitize(title).chars().take(MAX_TITLE_CHARS).collect();
    cache_dir
        .join("thumbnails")
        .join(format!("{}-{}-{}.{}", key.kind, key.id, title.trim(), ext))
}

pub fn description_path(cache_dir: &Path, key: &ResourceKey) -> PathBuf {
    cache_dir
        .join("descriptions")
        .join(format!("{}-{}.txt", key.kind, key.id))
}

async fn download_thumbnail(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(EngineError::MetadataFetch(format!(
            "thumbnail request returned {}",
            resp.status()
        )));
    }
    let bytes = resp.bytes().await?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, &bytes).await?;
    Ok(())
}

async fn write_description(dest: &Path, text: &str) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, text).await?;
    Ok(())
}

/// Everything enrichment needs besides the record.
pub struct EnrichContext<'a> {
    pub cache_dir: &'a Path,
    pub source: &'a dyn MetadataSource,
    pub http: &'a reqwest::Client,
    pub url: &'a str,
    pub default_ttl: Duration,
}

/// Add the derived fields to a freshly fetched record. Steps are
/// independent; a failing step is logged and leaves its field unset.
pub async fn enrich(record: &mut MetadataRecord, ctx: &EnrichContext<'_>) {
    let created_at = Utc::now();
    record.set_created_at(created_at);
    record.set_expires_at(derive_expiry(record, created_at, ctx.default_ttl));

    if let Some(thumb_url) = record.thumbnail_url().map(str::to_string) {
        let title = record.title().unwrap_or_default().to_string();
        let dest = thumbnail_path(ctx.cache_dir, &record.key, &title, &thumb_url);
        match download_thumbnail(ctx.http, &thumb_url, &dest).await {
            Ok(()) => record.set_thumbnail_local_path(&dest.to_string_lossy()),
            Err(e) => tracing::warn!("thumbnail for {} not saved: {}", record.key, e),
        }
    }

    if let Some(text) = record.description().map(str::to_string) {
        let dest = description_path(ctx.cache_dir, &record.key);
        match write_description(&dest, &text).await {
            Ok(()) => record.set_description_path(&dest.to_string_lossy()),
            Err(e) => tracing::warn!("description for {} not saved: {}", record.key, e),
        }
    }

    if record.is_live() {
        let formats = match ctx.source.list_live_from_start_formats(ctx.url).await {
            Ok(text) => {
                let table = parse_live_format_table(&text);
                if table.skipped > 0 {
                    tracing::debug!("{} unreadable live format rows for {}", table.skipped, record.key);
                }
                table.formats
            }
            Err(e) => {
                tracing::warn!("live format listing for {} failed: {}", record.key, e);
                Vec::new()
            }
        };
        record.set_live_from_start_formats(&formats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::url::SourceKind;
    use serde_json::json;

    fn record(doc: Value) -> MetadataRecord {
        let key = ResourceKey { kind: SourceKind::Video, id: "abc".into() };
        MetadataRecord::from_slice(key, doc.to_string().as_bytes()).unwrap()
    }

    fn created() -> DateTime<Utc> {
        DateTime::from_timestamp(1_699_990_000, 0).unwrap()
    }

    #[test]
    fn expiry_from_query_parameter() {
        let rec = record(json!({"formats": [
            {"format_id": "140", "vcodec": "none", "url": "https://cdn.example/a?expire=1"},
            {"format_id": "137", "vcodec": "avc1", "url": "https://cdn.example/v?expire=1700000000&x=1"}
        ]}));
        let at = derive_expiry(&rec, created(), Duration::minutes(15));
        assert_eq!(at, DateTime::from_timestamp(1_700_000_000, 0));
    }

    #[test]
    fn expiry_from_path_segment() {
        let rec = record(json!({"formats": [
            {"format_id": "1", "vcodec": "vp9", "url": "https://cdn.example/videoplayback/expire/1700000000/sig/xyz"}
        ]}));
        let at = derive_expiry(&rec, created(), Duration::minutes(15));
        assert_eq!(at, DateTime::from_timestamp(1_700_000_000, 0));
    }

    #[test]
    fn expiry_defaults_to_ttl_when_url_has_none() {
        let rec = record(json!({"formats": [
            {"format_id": "1", "vcodec": "vp9", "url": "https://cdn.example/plain.mp4"}
        ]}));
        let at = derive_expiry(&rec, created(), Duration::minutes(15));
        assert_eq!(at, Some(created() + Duration::minutes(15)));
    }

    #[test]
    fn audio_only_documents_expire_immediately() {
        let rec = record(json!({"formats": [
            {"format_id": "140", "vcodec": "none", "url": "https://cdn.example/a?expire=1700000000"}
        ]}));
        assert_eq!(derive_expiry(&rec, created(), Duration::minutes(15)), Some(created()));
    }

    #[test]
    fn past_expiry_is_clamped_to_creation() {
        let rec = record(json!({"formats": [
            {"format_id": "1", "vcodec": "avc1", "url": "https://cdn.example/v?expire=5"}
        ]}));
        assert_eq!(derive_expiry(&rec, created(), Duration::minutes(15)), Some(created()));
    }

    #[test]
    fn playlists_never_expire() {
        let rec = record(json!({"_type": "playlist", "formats": [
            {"format_id": "1", "vcodec": "avc1", "url": "https://cdn.example/v?expire=1700000000"}
        ]}));
        assert_eq!(derive_expiry(&rec, created(), Duration::minutes(15)), None);
    }

    #[test]
    fn thumbnail_path_uses_url_extension_and_sanitized_title() {
        let key = ResourceKey { kind: SourceKind::Video, id: "abc".into() };
        let p = thumbnail_path(Path::new("/c"), &key, "A/B: c?", "https://i.example/vi/abc/maxres.webp?x=1");
        assert_eq!(p, Path::new("/c/thumbnails/video-abc-A_B_ c_.webp"));

        let p = thumbnail_path(Path::new("/c"), &key, "t", "https://i.example/thumb");
        assert_eq!(p, Path::new("/c/thumbnails/video-abc-t.jpg"));
    }
}
