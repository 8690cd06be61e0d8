use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::utils::url::ResourceKey;

pub const CREATED_AT: &str = "created_at";
pub const EXPIRES_AT: &str = "expires_at";
pub const THUMBNAIL_LOCAL_PATH: &str = "thumbnail_local_path";
pub const DESCRIPTION_PATH: &str = "description_path";
pub const LIVE_FROM_START_FORMATS: &str = "live_from_start_formats";

/// One selectable rendition. `vcodec == "none"` is audio-only,
/// `acodec == "none"` is video-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    pub fps: f64,
    pub vcodec: String,
    pub acodec: String,
    /// Display label, "<format_id> - <resolution>".
    pub format: String,
}

impl FormatDescriptor {
    pub fn new(
        format_id: impl Into<String>,
        ext: impl Into<String>,
        resolution: impl Into<String>,
        fps: f64,
        vcodec: impl Into<String>,
        acodec: impl Into<String>,
    ) -> Self {
        let format_id = format_id.into();
        let resolution = resolution.into();
        let format = format!("{format_id} - {resolution}");
        Self {
            format_id,
            ext: ext.into(),
            resolution,
            fps,
            vcodec: vcodec.into(),
            acodec: acodec.into(),
            format,
        }
    }

    /// Best-effort view of one entry of a provider `formats` array.
    pub fn from_provider(entry: &Value) -> Option<Self> {
        let text = |key: &str| entry.get(key).and_then(Value::as_str).map(str::to_string);
        let format_id = text("format_id")?;
        let vcodec = text("vcodec").unwrap_or_else(|| "none".into());
        let resolution = if vcodec == "none" {
            "audio only".to_string()
        } else {
            text("resolution")
                .filter(|r| !r.is_empty())
                .or_else(|| entry.get("height").and_then(Value::as_u64).map(|h| format!("{h}p")))
                .unwrap_or_default()
        };
        Some(Self::new(
            format_id,
            text("ext").unwrap_or_default(),
            resolution,
            entry.get("fps").and_then(Value::as_f64).unwrap_or(0.0),
            vcodec,
            text("acodec").unwrap_or_else(|| "none".into()),
        ))
    }

    pub fn is_audio_only(&self) -> bool {
        self.vcodec == "none"
    }

    pub fn is_video_only(&self) -> bool {
        self.acodec == "none"
    }
}

/// Provider metadata document for one resource plus the fields added on fetch.
/// Derived fields live inside the document so it round-trips through one file.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub key: ResourceKey,
    pub document: Map<String, Value>,
}

fn parse_ts(v: Option<&Value>) -> Option<DateTime<Utc>> {
    v.and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl MetadataRecord {
    pub fn from_slice(key: ResourceKey, bytes: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(document) => Ok(Self { key, document }),
            other => Err(EngineError::MetadataFetch(format!(
                "metadata document for {key} is not an object (got {})",
                type_name(&other)
            ))),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.document)?)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.document.get(key).and_then(Value::as_str)
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.str_field("id")
    }

    pub fn title(&self) -> Option<&str> {
        self.str_field("title")
    }

    pub fn description(&self) -> Option<&str> {
        self.str_field("description").filter(|d| !d.trim().is_empty())
    }

    pub fn is_live(&self) -> bool {
        self.document.get("is_live").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn is_playlist(&self) -> bool {
        self.str_field("_type") == Some("playlist")
    }

    /// `thumbnail`, else the last (largest) entry of `thumbnails`.
    pub fn thumbnail_url(&self) -> Option<&str> {
        self.str_field("thumbnail").filter(|u| !u.is_empty()).or_else(|| {
            self.document
                .get("thumbnails")?
                .as_array()?
                .iter()
                .rev()
                .find_map(|t| t.get("url").and_then(Value::as_str))
        })
    }

    /// Raw provider format entries.
    pub fn raw_formats(&self) -> &[Value] {
        self.document
            .get("formats")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn formats(&self) -> Vec<FormatDescriptor> {
        self.raw_formats()
            .iter()
            .filter_map(FormatDescriptor::from_provider)
            .collect()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_ts(self.document.get(CREATED_AT))
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        parse_ts(self.document.get(EXPIRES_AT))
    }

    pub fn thumbnail_local_path(&self) -> Option<&str> {
        self.str_field(THUMBNAIL_LOCAL_PATH)
    }

    pub fn description_path(&self) -> Option<&str> {
        self.str_field(DESCRIPTION_PATH)
    }

    pub fn live_from_start_formats(&self) -> Vec<FormatDescriptor> {
        self.document
            .get(LIVE_FROM_START_FORMATS)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Fresh unless an expiry is recorded and `now` is past it.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => now <= expires_at,
            None => true,
        }
    }

    pub fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.document.insert(CREATED_AT.into(), Value::String(at.to_rfc3339()));
    }

    pub fn set_expires_at(&mut self, at: Option<DateTime<Utc>>) {
        let v = at.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null);
        self.document.insert(EXPIRES_AT.into(), v);
    }

    pub fn set_thumbnail_local_path(&mut self, path: &str) {
        self.document
            .insert(THUMBNAIL_LOCAL_PATH.into(), Value::String(path.to_string()));
    }

    pub fn set_description_path(&mut self, path: &str) {
        self.document
            .insert(DESCRIPTION_PATH.into(), Value::String(path.to_string()));
    }

    pub fn set_live_from_start_formats(&mut self, formats: &[FormatDescriptor]) {
        let v = serde_json::to_value(formats).unwrap_or_else(|_| Value::Array(Vec::new()));
        self.document.insert(LIVE_FROM_START_FORMATS.into(), v);
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::url::SourceKind;
    use chrono::Duration;
    use serde_json::json;

    fn key() -> ResourceKey {
        ResourceKey { kind: SourceKind::Video, id: "abc".into() }
    }

    #[test]
    fn rejects_non_object_documents() {
        assert!(MetadataRecord::from_slice(key(), b"[1,2]").is_err());
        assert!(MetadataRecord::from_slice(key(), b"not json").is_err());
    }

    #[test]
    fn freshness_follows_expires_at() {
        let now = Utc::now();
        let mut rec = MetadataRecord::from_slice(key(), br#"{"id":"abc"}"#).unwrap();
        assert!(rec.is_fresh(now));

        rec.set_expires_at(Some(now - Duration::seconds(1)));
        assert!(!rec.is_fresh(now));

        rec.set_expires_at(Some(now + Duration::minutes(5)));
        assert!(rec.is_fresh(now));

        rec.set_expires_at(None);
        assert_eq!(rec.document.get(EXPIRES_AT), Some(&Value::Null));
        assert!(rec.is_fresh(now));
    }

    #[test]
    fn thumbnail_falls_back_to_largest_listed() {
        let doc = json!({
            "id": "abc",
            "thumbnails": [{"url": "https://i.example/small.jpg"}, {"url": "https://i.example/big.webp"}]
        });
        let rec = MetadataRecord::from_slice(key(), doc.to_string().as_bytes()).unwrap();
        assert_eq!(rec.thumbnail_url(), Some("https://i.example/big.webp"));
    }

    #[test]
    fn provider_formats_are_mapped() {
        let doc = json!({
            "formats": [
                {"format_id": "140", "ext": "m4a", "resolution": "audio only", "vcodec": "none", "acodec": "mp4a.40.2"},
                {"format_id": "137", "ext": "mp4", "height": 1080, "fps": 30.0, "vcodec": "avc1.640028", "acodec": "none"},
                {"ext": "mp4"}
            ]
        });
        let rec = MetadataRecord::from_slice(key(), doc.to_string().as_bytes()).unwrap();
        let formats = rec.formats();
        assert_eq!(formats.len(), 2);
        assert!(formats[0].is_audio_only());
        assert_eq!(formats[0].format, "140 - audio only");
        assert_eq!(formats[1].resolution, "1080p");
        assert!(formats[1].is_video_only());
    }

    #[test]
    fn live_formats_round_trip_through_document() {
        let mut rec = MetadataRecord::from_slice(key(), b"{}").unwrap();
        let f = FormatDescriptor::new("301", "mp4", "1080p", 60.0, "avc1.64002a", "mp4a.40.2");
        rec.set_live_from_start_formats(&[f.clone()]);
        assert_eq!(rec.live_from_start_formats(), vec![f]);
    }
}
