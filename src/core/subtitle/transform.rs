//! Global timestamp calibration and subtitle cleanup.
//!
//! Responsibilities, applied in order over the full cue list:
//!   1. Calibrate per-segment ASR output to the global timeline.
//!   2. Clean hallucinations (intra-cue repetition, near-duplicate cues).
//!   3. Resolve timing overlaps between adjacent cues.
//!   4. Normalize text (whitespace, punctuation spacing, filler removal).
//!   5. Split cues that exceed the line budget.
//!   6. Finalize: offset, clamp, merge fragments, enforce minimum duration.

use super::{Cue, char_count, srt};
use log::debug;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

const MIN_GAP_S: f64 = 0.01;
const MIN_VISIBLE_DUR_S: f64 = 0.05;
const DUPLICATE_WINDOW_S: f64 = 5.0;
const MAX_MERGED_DUR_S: f64 = 7.0;

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn punctuation_space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([.!?,:;])(\S)").unwrap())
}

fn sentence_punct_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?。！？;；,，]+\s*").unwrap())
}

fn filler_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            // English hesitation fillers
            Regex::new(r"(?i)\b(um|uh|er|ah|hmm|like|you know)\b").unwrap(),
            // CJK interjections
            Regex::new(r"[嗯啊呃哦唔]+").unwrap(),
            // ASMR onomatopoeia vocabulary
            Regex::new(
                r"(?i)\b(doo|da|dee|ch|sh|tickle|scratch|tap|click|pop|mouth|sound|noise|chew|eat|drink|slurp|gulp|swallow|breath|whisper|lip|smack|tongue)\b",
            )
            .unwrap(),
            // Asterisk / bracketed / parenthesized annotations
            Regex::new(r"\*[^*]*\*").unwrap(),
            Regex::new(r"\[[^\]]*\]").unwrap(),
            Regex::new(r"\([^)]*\)").unwrap(),
        ]
    })
}

/// Tunables for the transform passes.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Maximum characters per rendered line.
    pub max_line_length: usize,
    /// Maximum lines per cue.
    pub max_lines: usize,
    /// Insert a space after sentence punctuation.
    pub normalize_punctuation: bool,
    /// Strip filler words and annotations.
    pub filter_filler_words: bool,
    /// Global shift applied to every cue in the final pass, seconds.
    pub time_offset_s: f64,
    /// Minimum cue duration enforced in the final pass, seconds.
    pub min_cue_duration_s: f64,
    /// Gap below which adjacent cues are merge candidates, seconds.
    pub merge_gap_s: f64,
    /// Text shorter than this counts as a fragment.
    pub min_text_length: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            max_line_length: 42,
            max_lines: 2,
            normalize_punctuation: true,
            filter_filler_words: true,
            time_offset_s: 0.0,
            min_cue_duration_s: 0.6,
            merge_gap_s: 0.3,
            min_text_length: 2,
        }
    }
}

/// Parses, calibrates, cleans and renders subtitle cues.
pub struct SrtTransform {
    config: TransformConfig,
}

impl SrtTransform {
    /// Create an engine with the given tunables.
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    /// Merge per-segment ASR results into one sorted global cue list.
    ///
    /// Each entry pairs the segment's base offset with its SRT text (or
    /// `None` for a failed segment, which contributes nothing).
    pub fn calibrate_segments(&self, segment_results: &[(f64, Option<String>)]) -> Vec<Cue> {
        let mut all = Vec::new();
        for (offset, srt_text) in segment_results {
            if let Some(text) = srt_text {
                all.extend(srt::parse_srt(text, *offset));
            }
        }
        all.sort_by(|a, b| {
            (a.start_s, a.end_s)
                .partial_cmp(&(b.start_s, b.end_s))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all
    }

    /// Remove cues that look like ASR hallucinations.
    ///
    /// Two patterns: a 2-30 character phrase repeated three or more times
    /// inside one cue collapses to a single occurrence, and a cue whose
    /// normalized text already appeared within the 5-second look-back
    /// window is suppressed entirely.
    pub fn clean_hallucinations(&self, cues: Vec<Cue>) -> Vec<Cue> {
        let mut cleaned: Vec<Cue> = Vec::new();
        let mut seen: HashMap<String, f64> = HashMap::new();

        for mut cue in cues {
            let text = cue.text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            let collapsed = collapse_phrase_repeats(&text);
            if collapsed != text {
                debug!(
                    "Hallucination collapsed: '{}' -> '{}'",
                    truncate_for_log(&text),
                    truncate_for_log(&collapsed)
                );
            }
            let text = collapsed;
            if text.is_empty() {
                continue;
            }

            let key = whitespace_re()
                .replace_all(&text.to_lowercase(), " ")
                .trim()
                .to_string();
            if let Some(prev_end) = seen.get(&key) {
                if (cue.start_s - prev_end).abs() < DUPLICATE_WINDOW_S {
                    debug!("Duplicate cue removed: '{}'", truncate_for_log(&text));
                    continue;
                }
            }
            seen.insert(key, cue.end_s);
            cue.text = text;
            cleaned.push(cue);
        }
        cleaned
    }

    /// Resolve timing overlaps by trimming the earlier cue.
    pub fn resolve_overlaps(&self, mut cues: Vec<Cue>, total_duration_s: f64) -> Vec<Cue> {
        cues.sort_by(|a, b| {
            (a.start_s, a.end_s)
                .partial_cmp(&(b.start_s, b.end_s))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for i in 0..cues.len().saturating_sub(1) {
            if cues[i].end_s > cues[i + 1].start_s {
                cues[i].end_s = cues[i + 1].start_s;
            }
            if cues[i].end_s <= cues[i].start_s {
                cues[i].end_s = cues[i].start_s + MIN_VISIBLE_DUR_S;
            }
        }
        if total_duration_s > 0.0 {
            for c in &mut cues {
                c.start_s = c.start_s.min(total_duration_s);
                c.end_s = c.end_s.min(total_duration_s);
            }
        }
        cues
    }

    /// Clean up one cue's text: whitespace, punctuation spacing, fillers,
    /// adjacent duplicated words.
    pub fn normalize_text(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        let mut text = whitespace_re().replace_all(text, " ").trim().to_string();

        if self.config.normalize_punctuation {
            text = punctuation_space_re()
                .replace_all(&text, "$1 $2")
                .into_owned();
            text = whitespace_re().replace_all(&text, " ").trim().to_string();
        }

        if self.config.filter_filler_words {
            for pattern in filler_patterns() {
                text = pattern.replace_all(&text, "").into_owned();
            }
            text = collapse_repeated_words(&text);
            text = whitespace_re().replace_all(&text, " ").trim().to_string();
        }
        text
    }

    /// Split a cue whose text exceeds the `max_lines * max_line_length`
    /// budget; sub-cue durations are proportional to character share.
    pub fn split_long_cue(&self, cue: Cue) -> Vec<Cue> {
        if cue.text.is_empty() {
            return vec![cue];
        }
        let max_total = self.config.max_line_length * self.config.max_lines;
        let total_chars = char_count(&cue.text);
        if total_chars <= max_total {
            return vec![cue];
        }

        let sentences = split_sentences(&cue.text);
        let mut result: Vec<Cue> = Vec::new();
        let mut current = String::new();
        let mut start = cue.start_s;
        let mut chars_left = total_chars as f64;
        let mut duration_left = cue.end_s - cue.start_s;

        for sentence in sentences {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            let candidate = if current.is_empty() {
                sentence.to_string()
            } else {
                format!("{} {}", current, sentence)
            };
            if char_count(&candidate) > max_total && !current.is_empty() {
                let chars_in = char_count(&current) as f64;
                let frac = if chars_left > 0.0 { chars_in / chars_left } else { 0.0 };
                let mut cue_dur = (duration_left * frac).max(0.5);
                cue_dur = cue_dur.min(cue.end_s - start);
                result.push(Cue::new(start, start + cue_dur, current.clone()));
                start += cue_dur;
                chars_left -= chars_in;
                duration_left -= cue_dur;
                current = sentence.to_string();
            } else {
                current = candidate;
            }
        }
        if !current.is_empty() {
            result.push(Cue::new(start, cue.end_s, current));
        }
        if result.is_empty() { vec![cue] } else { result }
    }

    /// Normalize text and split long cues across the whole list.
    pub fn apply_text_processing(&self, cues: Vec<Cue>) -> Vec<Cue> {
        let mut processed = Vec::new();
        for mut cue in cues {
            cue.text = self.normalize_text(&cue.text);
            if cue.text.is_empty() {
                continue;
            }
            processed.extend(self.split_long_cue(cue));
        }
        processed
    }

    /// Final pass: apply the global offset, clamp to the clip, merge tiny
    /// fragments, enforce the minimum duration, drop invisible cues.
    pub fn finalize_cues(&self, mut cues: Vec<Cue>, total_duration_s: f64) -> Vec<Cue> {
        if cues.is_empty() {
            return cues;
        }
        let offset = self.config.time_offset_s;
        let merge_gap = self.config.merge_gap_s.max(0.0);
        let min_text = self.config.min_text_length;
        let min_dur = self.config.min_cue_duration_s.max(MIN_VISIBLE_DUR_S);

        cues.sort_by(|a, b| {
            a.start_s
                .partial_cmp(&b.start_s)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for c in &mut cues {
            c.start_s = (c.start_s + offset).clamp(0.0, total_duration_s);
            c.end_s = (c.end_s + offset).clamp(0.0, total_duration_s);
            if c.end_s <= c.start_s {
                c.end_s = (c.start_s + MIN_VISIBLE_DUR_S).min(total_duration_s);
            }
        }

        // Merge adjacent short or close cues.
        let mut merged: Vec<Cue> = Vec::new();
        for c in cues {
            let Some(prev) = merged.last_mut() else {
                merged.push(c);
                continue;
            };
            let gap = c.start_s - prev.end_s;
            let prev_dur = prev.duration();
            let cur_dur = c.duration();
            let combined = c.end_s - prev.start_s;
            let prev_len = char_count(prev.text.trim());
            let cur_len = char_count(c.text.trim());

            let need_merge = if gap <= merge_gap {
                combined < MAX_MERGED_DUR_S || prev_dur < 1.0 || cur_dur < 1.0
            } else {
                (prev_len < min_text || cur_len < min_text) && gap <= merge_gap * 2.0
            };

            if need_merge {
                let joined = format!("{} {}", prev.text.trim(), c.text.trim());
                prev.text = whitespace_re().replace_all(joined.trim(), " ").into_owned();
                prev.end_s = prev.end_s.max(c.end_s);
            } else {
                merged.push(c);
            }
        }

        // Enforce minimum duration, extending toward the next cue first
        // and merging when extension is impossible.
        let mut finalized: Vec<Cue> = Vec::new();
        let mut i = 0;
        while i < merged.len() {
            let c = merged[i].clone();
            let dur = c.duration();
            if dur < min_dur {
                let next_start = if i + 1 < merged.len() {
                    merged[i + 1].start_s
                } else {
                    total_duration_s
                };
                let gap_to_next = next_start - c.start_s;
                let target_end = if gap_to_next > min_dur + MIN_GAP_S {
                    c.start_s + min_dur
                } else if gap_to_next > MIN_VISIBLE_DUR_S {
                    next_start - MIN_GAP_S
                } else {
                    next_start
                };
                if target_end > c.end_s {
                    let mut extended = c;
                    extended.end_s = target_end;
                    finalized.push(extended);
                } else if i + 1 < merged.len() {
                    // Fold forward into the next cue.
                    merged[i + 1].start_s = c.start_s;
                    merged[i + 1].text =
                        format!("{} {}", c.text.trim(), merged[i + 1].text.trim());
                } else if let Some(last) = finalized.last_mut() {
                    // Fold backward into the previous cue.
                    last.end_s = last.end_s.max(c.end_s);
                    last.text = format!("{} {}", last.text.trim(), c.text.trim());
                } else {
                    finalized.push(c);
                }
            } else {
                finalized.push(c);
            }
            i += 1;
        }

        // Drop invisible or unrescuable ultra-short fragments.
        finalized.retain(|c| {
            let text = c.text.trim();
            if c.duration() < MIN_VISIBLE_DUR_S {
                debug!("Dropping invisible cue: '{}'", truncate_for_log(text));
                return false;
            }
            if char_count(text) < min_text && c.duration() < min_dur {
                debug!("Dropping ultra-short cue: '{}'", truncate_for_log(text));
                return false;
            }
            true
        });
        finalized
    }

    /// Full pipeline over raw per-segment results: calibrate, clean,
    /// resolve, process text, finalize.
    pub fn transform(
        &self,
        segment_results: &[(f64, Option<String>)],
        total_duration_s: f64,
    ) -> Vec<Cue> {
        let cues = self.calibrate_segments(segment_results);
        let cues = self.clean_hallucinations(cues);
        let cues = self.resolve_overlaps(cues, total_duration_s);
        let cues = self.apply_text_processing(cues);
        self.finalize_cues(cues, total_duration_s)
    }
}

/// Collapse a 2-30 character phrase repeated three or more times in
/// succession into one occurrence.
///
/// The regex crate has no backreferences, so this is an explicit scan over
/// the character vector; comparison is case-insensitive and whitespace
/// between repeats is tolerated.
fn collapse_phrase_repeats(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let lower: Vec<char> = text.to_lowercase().chars().collect();
    // Guard against pathological lowercase expansions; fall back to the
    // original when the mapping is not 1:1.
    if lower.len() != chars.len() {
        return text.to_string();
    }
    let n = chars.len();
    let mut out = String::new();
    let mut i = 0;
    'outer: while i < n {
        for len in 2..=30.min(n - i) {
            let phrase = &lower[i..i + len];
            if phrase.iter().all(|c| c.is_whitespace()) {
                continue;
            }
            let mut repeats = 0usize;
            let mut j = i + len;
            loop {
                let mut k = j;
                while k < n && chars[k].is_whitespace() {
                    k += 1;
                }
                if k + len <= n && &lower[k..k + len] == phrase {
                    repeats += 1;
                    j = k + len;
                } else {
                    break;
                }
            }
            if repeats >= 2 {
                // Keep one occurrence, skip the repeats.
                out.extend(&chars[i..i + len]);
                i = j;
                continue 'outer;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out.trim().to_string()
}

/// Collapse adjacent duplicated words ("the the" -> "the").
fn collapse_repeated_words(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        let normalized = word.trim_matches(|c: char| c == ',' || c == '.').to_lowercase();
        if let Some(prev) = out.last() {
            let prev_norm = prev
                .trim_matches(|c: char| c == ',' || c == '.')
                .to_lowercase();
            if !normalized.is_empty() && normalized == prev_norm {
                continue;
            }
        }
        out.push(word);
    }
    out.join(" ")
}

/// Split text into sentence-ish chunks, keeping trailing punctuation
/// attached to its sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut last = 0usize;
    for m in sentence_punct_re().find_iter(text) {
        let chunk = &text[last..m.end()];
        if !chunk.trim().is_empty() {
            parts.push(chunk.to_string());
        }
        last = m.end();
    }
    if last < text.len() {
        let tail = &text[last..];
        if !tail.trim().is_empty() {
            parts.push(tail.to_string());
        }
    }
    if parts.is_empty() && !text.trim().is_empty() {
        parts.push(text.to_string());
    }
    parts
}

fn truncate_for_log(text: &str) -> String {
    text.chars().take(40).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SrtTransform {
        SrtTransform::new(TransformConfig::default())
    }

    #[test]
    fn test_calibrate_applies_offsets_and_sorts() {
        let seg1 = "1\n00:00:01,000 --> 00:00:02,000\nsecond segment line\n";
        let seg0 = "1\n00:00:00,500 --> 00:00:01,500\nfirst segment line\n";
        let cues = engine().calibrate_segments(&[
            (30.0, Some(seg1.to_string())),
            (0.0, Some(seg0.to_string())),
            (60.0, None),
        ]);
        assert_eq!(cues.len(), 2);
        assert!((cues[0].start_s - 0.5).abs() < 1e-9);
        assert!((cues[1].start_s - 31.0).abs() < 1e-9);
    }

    #[test]
    fn test_collapse_phrase_repeats() {
        assert_eq!(
            collapse_phrase_repeats("thank you thank you thank you"),
            "thank you"
        );
        // Two occurrences stay untouched.
        assert_eq!(collapse_phrase_repeats("go go"), "go go");
        assert_eq!(collapse_phrase_repeats("normal sentence here"), "normal sentence here");
    }

    #[test]
    fn test_duplicate_cue_suppression_window() {
        let cues = vec![
            Cue::new(0.0, 2.0, "Hello world"),
            Cue::new(3.0, 5.0, "hello   WORLD"),
            Cue::new(20.0, 22.0, "Hello world"),
        ];
        let cleaned = engine().clean_hallucinations(cues);
        // Second cue suppressed (within 5 s of the first one's end);
        // third kept (outside the look-back window).
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[1].start_s, 20.0);
    }

    #[test]
    fn test_resolve_overlaps_trims_earlier_cue() {
        let cues = vec![Cue::new(0.0, 5.0, "a"), Cue::new(3.0, 6.0, "b")];
        let resolved = engine().resolve_overlaps(cues, 10.0);
        assert_eq!(resolved[0].end_s, 3.0);
        assert_eq!(resolved[1].end_s, 6.0);
    }

    #[test]
    fn test_normalize_text_fillers_and_punctuation() {
        let e = engine();
        assert_eq!(e.normalize_text("well um you know this works"), "well this works");
        assert_eq!(e.normalize_text("[applause] actual words"), "actual words");
        assert_eq!(e.normalize_text("the the same word"), "the same word");
        assert_eq!(e.normalize_text("  spaced   out  "), "spaced out");
    }

    #[test]
    fn test_split_long_cue_proportional_budget() {
        let long_text =
            "This is the first sentence of the cue. And here comes a second rather long sentence. Finally a third one to push it over the budget.";
        let cue = Cue::new(0.0, 12.0, long_text);
        let parts = engine().split_long_cue(cue);
        assert!(parts.len() >= 2);
        // Continuity of the timeline.
        assert_eq!(parts[0].start_s, 0.0);
        assert!((parts.last().unwrap().end_s - 12.0).abs() < 1e-9);
        for pair in parts.windows(2) {
            assert!((pair[0].end_s - pair[1].start_s).abs() < 1e-9);
        }
        // Every part respects the character budget.
        for p in &parts {
            assert!(char_count(&p.text) <= 42 * 2);
        }
    }

    #[test]
    fn test_finalize_merges_fragments_and_enforces_duration() {
        let e = engine();
        let cues = vec![
            Cue::new(0.0, 1.0, "first piece"),
            Cue::new(1.1, 1.3, "tail"),
            Cue::new(10.0, 10.2, "lonely short cue"),
        ];
        let out = e.finalize_cues(cues, 60.0);
        // First two merge (gap 0.1 <= 0.3, combined < 7 s).
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "first piece tail");
        // The isolated short cue is extended to the minimum duration.
        assert!(out[1].duration() >= 0.6 - 1e-9);
    }

    #[test]
    fn test_finalize_clamps_to_duration() {
        let e = SrtTransform::new(TransformConfig {
            time_offset_s: 2.0,
            ..TransformConfig::default()
        });
        let out = e.finalize_cues(vec![Cue::new(6.0, 9.5, "near the end")], 10.0);
        assert_eq!(out.len(), 1);
        assert!((out[0].start_s - 8.0).abs() < 1e-9);
        assert!(out[0].end_s <= 10.0);
    }

    #[test]
    fn test_full_transform_renders_clean_srt() {
        let seg = "1\n00:00:00,000 --> 00:00:02,000\num hello hello hello\n\n2\n00:00:02,000 --> 00:00:04,000\nreal content stays here\n";
        let cues = engine().transform(&[(0.0, Some(seg.to_string()))], 30.0);
        let rendered = srt::render_srt(&cues).unwrap();
        assert!(rendered.contains("real content stays here"));
        assert!(!rendered.contains("hello hello"));
    }
}
