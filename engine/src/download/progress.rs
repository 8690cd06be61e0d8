use once_cell::sync::Lazy;
use regex::Regex;

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("valid percent regex"));

/// First `N[.N]%` on the line, as a percentage in [0, 100].
pub fn parse_progress_percentage(line: &str) -> Option<f32> {
    let caps = PERCENT_RE.captures(line)?;
    caps.get(1)?
        .as_str()
        .parse::<f32>()
        .ok()
        .map(|p| p.clamp(0.0, 100.0))
}
