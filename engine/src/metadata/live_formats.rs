//! Parser for the human-oriented format table the downloader prints when
//! asked to list formats that can be joined from the start of a live stream.
//!
//! The table is not a stable machine format. Every line is read on a
//! best-effort basis: missing tokens fall back to defaults and unusable lines
//! are counted and skipped, never reported as errors.

use crate::metadata::record::FormatDescriptor;

/// Lines of banner and column header preceding the rows.
const HEADER_LINES: usize = 3;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveFormatTable {
    pub formats: Vec<FormatDescriptor>,
    /// Non-blank rows that could not be read.
    pub skipped: usize,
}

pub fn parse_live_format_table(text: &str) -> LiveFormatTable {
    let mut table = LiveFormatTable::default();
    for line in text.lines().skip(HEADER_LINES) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_row(line) {
            Some(f) => table.formats.push(f),
            None => table.skipped += 1,
        }
    }
    table
}

fn parse_row(line: &str) -> Option<FormatDescriptor> {
    let segments: Vec<&str> = line.split('|').collect();
    if segments.len() < 3 {
        return None;
    }

    let left: Vec<&str> = segments[0].split_whitespace().collect();
    let format_id = *left.first()?;
    let ext = left.get(1).copied().unwrap_or_default();
    let marker = left.get(2).copied().unwrap_or_default();
    let audio_marker = marker == "audio";
    let resolution = if audio_marker { "audio only" } else { marker };
    let fps = left
        .get(3)
        .and_then(|t| t.parse::<f64>().ok())
        .unwrap_or(0.0);

    let right: Vec<&str> = segments[2].split_whitespace().collect();
    let audio_only = audio_marker || right.first() == Some(&"audio");
    let vcodec = if audio_only {
        "none"
    } else {
        right.first().copied().unwrap_or("none")
    };
    let acodec = audio_codec(&right);

    Some(FormatDescriptor::new(format_id, ext, resolution, fps, vcodec, acodec))
}

fn audio_codec(tokens: &[&str]) -> String {
    if let Some(t) = tokens.iter().find(|t| t.contains("mp4a")) {
        return t.to_string();
    }
    if tokens.iter().any(|t| *t == "audio") {
        return "audio only".to_string();
    }
    "none".to_string()
}
