//! WebVTT to SRT conversion.
//!
//! The downloader regularly produces `.vtt` caption files; the burn-in
//! filter and the transform engine both want SRT. The converter strips VTT
//! chrome (header, NOTE/STYLE blocks, inline tags, cue settings), expands
//! the short `MM:SS.mmm` timestamp form, and re-renders through the
//! canonical SRT renderer.

use super::{Cue, srt};
use crate::Result;
use log::debug;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Inline tags: <c.classname>, <v Speaker>, </c>, <00:00:01.000> etc.
    RE.get_or_init(|| Regex::new(r"<[^>]*>").unwrap())
}

fn short_ts_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // MM:SS.mmm without an hour field, anchored to timing-line context.
    RE.get_or_init(|| Regex::new(r"(^|\s|>)(\d{1,2}):(\d{2})[.,](\d{3})").unwrap())
}

/// Convert VTT content to cues on the local timeline.
pub fn parse_vtt(content: &str) -> Vec<Cue> {
    let mut cleaned_lines: Vec<String> = Vec::new();
    let mut in_skipped_block = false;
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("NOTE") || trimmed.starts_with("STYLE") || trimmed.starts_with("REGION")
        {
            in_skipped_block = true;
            continue;
        }
        if in_skipped_block {
            if trimmed.is_empty() {
                in_skipped_block = false;
            }
            continue;
        }
        let line = if line.contains("-->") {
            // Expand the hourless timestamp form before the SRT parser
            // sees it, and drop cue settings after the end timestamp.
            let expanded = short_ts_re().replace_all(line, "${1}00:$2:$3,$4");
            let mut parts = expanded.splitn(2, "-->");
            let start = parts.next().unwrap_or("").trim().to_string();
            let end_and_settings = parts.next().unwrap_or("").trim();
            let end = end_and_settings.split_whitespace().next().unwrap_or("");
            format!("{} --> {}", start, end)
        } else {
            tag_re().replace_all(line, "").into_owned()
        };
        cleaned_lines.push(line);
    }
    srt::parse_srt(&cleaned_lines.join("\n"), 0.0)
}

/// Convert VTT content to canonical SRT text.
pub fn vtt_to_srt(content: &str) -> Option<String> {
    let cues = parse_vtt(content);
    if cues.is_empty() {
        debug!("VTT conversion produced no cues");
    }
    srt::render_srt(&cues)
}

/// Convert a `.vtt` file into a sibling `.srt` file, returning its path.
pub fn convert_vtt_file(vtt_path: &Path) -> Result<Option<std::path::PathBuf>> {
    let content = super::read_subtitle_file(vtt_path)?;
    match vtt_to_srt(&content) {
        Some(srt_text) => {
            let srt_path = vtt_path.with_extension("srt");
            std::fs::write(&srt_path, srt_text)?;
            Ok(Some(srt_path))
        }
        None => Ok(None),
    }
}
