//! Loose SRT parsing and rendering.
//!
//! The parser accepts what real-world files actually contain: missing
//! index lines, `.` instead of `,` before the milliseconds, a stray WEBVTT
//! header, single-digit hour fields. Malformed blocks are dropped with a
//! log line only; the engine never fails a task over one bad cue.

use super::Cue;
use log::debug;
use regex::Regex;
use std::sync::OnceLock;

const MIN_VISIBLE_DUR_S: f64 = 0.05;
const INVALID_TS_FALLBACK_S: f64 = 0.5;

fn block_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").unwrap())
}

/// Parse SRT text into cues, shifting every timestamp by `base_offset_s`.
///
/// The formula `global = base_offset_s + relative` applies per-segment ASR
/// calibration at parse time.
pub fn parse_srt(srt_text: &str, base_offset_s: f64) -> Vec<Cue> {
    let text = srt_text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    // Skip a WEBVTT header block when someone feeds us a renamed VTT file.
    let text = if text.to_uppercase().starts_with("WEBVTT") {
        match block_split_re().splitn(text, 2).nth(1) {
            Some(rest) => rest,
            None => return Vec::new(),
        }
    } else {
        text
    };

    let mut cues = Vec::new();
    for block in block_split_re().split(text) {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let lines: Vec<&str> = block.lines().collect();
        if lines.len() < 2 {
            continue;
        }

        // Optional index line before the timing line.
        let (time_line, content_lines) = if !lines[0].contains("-->") && lines[1].contains("-->")
        {
            (lines[1], &lines[2..])
        } else {
            (lines[0], &lines[1..])
        };
        if !time_line.contains("-->") {
            debug!("Dropping malformed SRT block: {:?}", &block[..block.len().min(60)]);
            continue;
        }
        let mut parts = time_line.splitn(2, "-->");
        let start_str = parts.next().unwrap_or("").trim();
        let end_str = parts.next().unwrap_or("").trim();
        // VTT cue settings may trail the end timestamp.
        let end_str = end_str.split_whitespace().next().unwrap_or("");

        let start_s = seconds_from_timestamp(start_str) + base_offset_s;
        let mut end_s = seconds_from_timestamp(end_str) + base_offset_s;
        if end_s <= start_s {
            end_s = start_s + INVALID_TS_FALLBACK_S;
        }

        let content = content_lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if content.is_empty() {
            continue;
        }

        cues.push(Cue {
            start_s: start_s.max(0.0),
            end_s: end_s.max(start_s + MIN_VISIBLE_DUR_S),
            text: content,
        });
    }
    cues
}

/// Render cues as canonical SRT with sequential indices.
///
/// Blank cues are dropped; returns `None` when nothing remains.
pub fn render_srt(cues: &[Cue]) -> Option<String> {
    let mut out = String::new();
    let mut index = 0usize;
    for cue in cues {
        let text = cue.text.trim();
        if text.is_empty() {
            continue;
        }
        index += 1;
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index,
            format_timestamp(cue.start_s),
            format_timestamp(cue.end_s),
            text
        ));
    }
    if index == 0 {
        None
    } else {
        Some(format!("{}\n", out.trim_end()))
    }
}

/// Convert `HH:MM:SS,mmm` (or `.mmm`, 1-2 digit hours) to seconds.
///
/// Unparseable input reads as 0.0, matching the lenient legacy behavior.
pub fn seconds_from_timestamp(time_str: &str) -> f64 {
    let normalized = time_str.trim().replace('.', ",");
    let mut fields = normalized.split(':');
    let (Some(hh), Some(mm), Some(rest)) = (fields.next(), fields.next(), fields.next()) else {
        return 0.0;
    };
    if fields.next().is_some() {
        return 0.0;
    }
    let mut sec_ms = rest.split(',');
    let (Some(sec), Some(ms)) = (sec_ms.next(), sec_ms.next()) else {
        return 0.0;
    };
    let (Ok(h), Ok(m), Ok(s), Ok(ms)) = (
        hh.trim().parse::<u64>(),
        mm.trim().parse::<u64>(),
        sec.trim().parse::<u64>(),
        ms.trim().parse::<u64>(),
    ) else {
        return 0.0;
    };
    h as f64 * 3600.0 + m as f64 * 60.0 + s as f64 + ms as f64 / 1000.0
}

/// Convert seconds to `HH:MM:SS,mmm`.
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let h = total_ms / 3_600_000;
    let m = (total_ms % 3_600_000) / 60_000;
    let s = (total_ms % 60_000) / 1000;
    let ms = total_ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

/// Count cue blocks in an SRT file without a full parse.
pub fn count_cues_in_file(path: &std::path::Path) -> Option<usize> {
    let content = super::read_subtitle_file(path).ok()?;
    Some(
        block_split_re()
            .split(content.trim())
            .filter(|b| b.contains("-->"))
            .count(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SRT: &str = "1\n00:00:01,000 --> 00:00:03,000\nHello, World!\n\n2\n00:00:05,000 --> 00:00:08,000\nThis is a test subtitle.\n多行测试\n";

    #[test]
    fn test_parse_basic() {
        let cues = parse_srt(SAMPLE_SRT, 0.0);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].start_s, 1.0);
        assert_eq!(cues[0].end_s, 3.0);
        assert_eq!(cues[0].text, "Hello, World!");
        assert_eq!(cues[1].text, "This is a test subtitle.\n多行测试");
    }

    #[test]
    fn test_parse_applies_base_offset() {
        let cues = parse_srt(SAMPLE_SRT, 120.0);
        assert_eq!(cues[0].start_s, 121.0);
        assert_eq!(cues[1].end_s, 128.0);
    }

    #[test]
    fn test_parse_missing_index_and_dot_millis() {
        let loose = "00:00:01.500 --> 00:00:02.500\nno index here\n\n0:00:04,000 --> 0:00:05,000\nsingle digit hour\n";
        let cues = parse_srt(loose, 0.0);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].start_s, 1.5);
        assert_eq!(cues[1].start_s, 4.0);
    }

    #[test]
    fn test_parse_skips_webvtt_header() {
        let vtt = "WEBVTT\nKind: captions\n\n00:00:01.000 --> 00:00:02.000\nhello\n";
        let cues = parse_srt(vtt, 0.0);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "hello");
    }

    #[test]
    fn test_parse_drops_malformed_blocks_silently() {
        let mixed = "garbage block without timing\n\n1\n00:00:01,000 --> 00:00:02,000\ngood\n\nnot-a-time --> also-not\nbad\n";
        let cues = parse_srt(mixed, 0.0);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].text, "good");
        // The unparseable block degrades to 0.0 timestamps with the
        // invalid-range fallback, not a parse failure.
        assert_eq!(cues[1].text, "bad");
        assert_eq!(cues[1].start_s, 0.0);
    }

    #[test]
    fn test_invalid_range_gets_fallback_duration() {
        let srt = "1\n00:00:05,000 --> 00:00:04,000\nbackwards\n";
        let cues = parse_srt(srt, 0.0);
        assert_eq!(cues.len(), 1);
        assert!((cues[0].end_s - cues[0].start_s - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_render_round_trip_normalizes() {
        // Dot separators, missing indices and blank cues unify on render.
        let loose = "00:00:01.000 --> 00:00:02.000\nfirst\n\n00:00:03.000 --> 00:00:04.000\n\n\n5\n00:00:05,000 --> 00:00:06,000\nsecond\n";
        let cues = parse_srt(loose, 0.0);
        let rendered = render_srt(&cues).unwrap();
        assert!(rendered.starts_with("1\n00:00:01,000 --> 00:00:02,000\nfirst\n"));
        assert!(rendered.contains("2\n00:00:05,000 --> 00:00:06,000\nsecond"));
        // Re-parsing the rendered output is stable.
        let reparsed = parse_srt(&rendered, 0.0);
        assert_eq!(reparsed, cues.into_iter().filter(|c| !c.text.is_empty()).collect::<Vec<_>>());
    }

    #[test]
    fn test_render_empty_returns_none() {
        assert!(render_srt(&[]).is_none());
        assert!(render_srt(&[Cue::new(0.0, 1.0, "  ")]).is_none());
    }

    #[test]
    fn test_timestamp_formatting() {
        assert_eq!(format_timestamp(3661.5), "01:01:01,500");
        assert_eq!(format_timestamp(0.0), "00:00:00,000");
        assert_eq!(seconds_from_timestamp("01:01:01,500"), 3661.5);
        assert_eq!(seconds_from_timestamp("bogus"), 0.0);
    }
}
