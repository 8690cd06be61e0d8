use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// What a resource URL points at. Decides how the cache key is derived and
/// whether fetched metadata can expire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Video,
    Playlist,
    Generic,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Video => "video",
            SourceKind::Playlist => "playlist",
            SourceKind::Generic => "generic",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for SourceKind {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "video"             => SourceKind::Video,
            "playlist"          => SourceKind::Playlist,
            _                   => SourceKind::Generic,     // Default fallback
        }
    }
}

/// Stable identity of a resource in the metadata cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: SourceKind,
    pub id: String,
}

impl ResourceKey {
    pub fn from_url(kind: SourceKind, url: &str) -> Self {
        let id = match kind {
            SourceKind::Video => youtube_id_from_url(url),
            SourceKind::Playlist => playlist_id_from_url(url),
            SourceKind::Generic => None,
        }
        .map(|id| sanitize_id(&id))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| hashed_link(url));
        ResourceKey { kind, id }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Guess the kind of a URL when the caller did not say.
pub fn infer_kind(url: &str) -> SourceKind {
    if playlist_id_from_url(url).is_some() && youtube_id_from_url(url).is_none() {
        SourceKind::Playlist
    } else if youtube_id_from_url(url).is_some() {
        SourceKind::Video
    } else {
        SourceKind::Generic
    }
}

fn is_youtube_host(host: &str) -> bool {
    let host = host.trim_start_matches("www.").trim_start_matches("m.");
    host == "youtube.com" || host == "music.youtube.com" || host == "youtu.be"
}

/// Extract a YouTube video id from v=…, youtu.be/…, /shorts/…, /live/… or /embed/…
pub fn youtube_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    if !is_youtube_host(&host) {
        return None;
    }
    if let Some((_, v)) = parsed.query_pairs().find(|(k, v)| k == "v" && !v.is_empty()) {
        return Some(v.into_owned());
    }
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    if host == "youtu.be" {
        return segments.first().map(|s| s.to_string());
    }
    match segments.as_slice() {
        [prefix, id, ..] if matches!(*prefix, "shorts" | "live" | "embed") => Some(id.to_string()),
        _ => None,
    }
}

/// Extract the list=… id of a YouTube playlist URL.
pub fn playlist_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    if !is_youtube_host(&parsed.host_str()?.to_lowercase()) {
        return None;
    }
    parsed
        .query_pairs()
        .find(|(k, v)| k == "list" && !v.is_empty())
        .map(|(_, v)| v.into_owned())
}

/// Query parameters that only track where a link was shared from.
fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || matches!(name, "si" | "feature" | "fbclid" | "gclid")
}

/// Canonical form of a link for hashing: no scheme, lowercase host without
/// "www.", no trailing slash, query kept with tracking parameters removed and
/// the rest sorted. Unparsable input is only trimmed and lowercased.
pub fn normalize_link(link: &str) -> String {
    let Ok(parsed) = Url::parse(link.trim()) else {
        return link.trim().to_lowercase();
    };
    let host = parsed.host_str().unwrap_or_default().to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let mut out = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    out.push_str(parsed.path().trim_end_matches('/'));

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !params.is_empty() {
        params.sort();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&params)
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    out
}

fn hashed_link(url: &str) -> String {
    let digest = Sha256::digest(normalize_link(url).as_bytes());
    hex::encode(&digest[..12])
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Make a title safe to embed in a file name.
pub fn sanitize<S: Into<String>>(s: S) -> String {
    let t = s
        .into()
        .replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_")
        .replace(['\n', '\r', '\t'], " ");
    t.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_key_ignores_url_variants() {
        let a = ResourceKey::from_url(SourceKind::Video, "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42");
        let b = ResourceKey::from_url(SourceKind::Video, "https://youtu.be/dQw4w9WgXcQ");
        let c = ResourceKey::from_url(SourceKind::Video, "https://youtube.com/shorts/dQw4w9WgXcQ?feature=share");
        assert_eq!(a.id, "dQw4w9WgXcQ");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn playlist_key_uses_list_param() {
        let k = ResourceKey::from_url(
            SourceKind::Playlist,
            "https://www.youtube.com/playlist?list=PLabc123",
        );
        assert_eq!(k.id, "PLabc123");
        assert_eq!(k.to_string(), "playlist:PLabc123");
    }

    #[test]
    fn generic_key_merges_only_cosmetic_variants() {
        let a = ResourceKey::from_url(SourceKind::Generic, "https://Example.com/media/1?utm_source=x");
        let b = ResourceKey::from_url(SourceKind::Generic, "http://www.example.com/media/1/");
        let c = ResourceKey::from_url(SourceKind::Generic, "https://example.com/media/2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.id.len(), 24);
    }

    #[test]
    fn generic_key_keeps_identifying_query_parameters() {
        let one = ResourceKey::from_url(SourceKind::Generic, "https://example.com/play.php?id=1");
        let two = ResourceKey::from_url(SourceKind::Generic, "https://example.com/play.php?id=2");
        assert_ne!(one, two);

        let fb1 = ResourceKey::from_url(SourceKind::Generic, "https://www.facebook.com/watch?v=111");
        let fb2 = ResourceKey::from_url(SourceKind::Generic, "https://www.facebook.com/watch?v=222");
        assert_ne!(fb1, fb2);

        let yt1 = ResourceKey::from_url(SourceKind::Generic, "https://www.youtube.com/watch?v=aaa&si=share1");
        let yt2 = ResourceKey::from_url(SourceKind::Generic, "https://www.youtube.com/watch?v=bbb&si=share1");
        assert_ne!(yt1, yt2);
    }

    #[test]
    fn query_order_and_tracking_do_not_change_the_key() {
        let a = ResourceKey::from_url(SourceKind::Generic, "https://example.com/v?b=2&a=1&feature=share");
        let b = ResourceKey::from_url(SourceKind::Generic, "https://example.com/v?a=1&b=2");
        assert_eq!(a, b);
        assert_eq!(normalize_link("https://www.Example.com/v/?b=2&a=1&si=x"), "example.com/v?a=1&b=2");
    }

    #[test]
    fn infer_kind_from_url() {
        assert_eq!(infer_kind("https://youtube.com/watch?v=abc"), SourceKind::Video);
        assert_eq!(infer_kind("https://youtube.com/playlist?list=PL1"), SourceKind::Playlist);
        assert_eq!(infer_kind("https://vimeo.com/123"), SourceKind::Generic);
    }

    #[test]
    fn sanitize_strips_path_characters() {
        assert_eq!(sanitize("a/b: c?\n d"), "a_b_ c_ d");
    }
}
