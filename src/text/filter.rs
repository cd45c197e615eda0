//! Noise removal and segmentation for raw documents.

use std::collections::HashMap;

use regex::Regex;

use crate::error::FilterError;
use crate::pipeline::types::Document;

/// Capability interface for turning a document into generation-ready text.
///
/// Implementations must be deterministic: the same document always yields
/// the same segments.
pub trait TextFilter: Send + Sync {
    fn filter(&self, document: &Document) -> Result<Vec<String>, FilterError>;
}

/// Returns the default boilerplate line patterns.
pub fn default_boilerplate_patterns() -> Vec<&'static str> {
    vec![
        // Page numbering
        r"(?i)^page\s+\d+(\s+of\s+\d+)?$",
        r"^[-–—\s]*\d+[-–—\s]*$",
        r"^第\s*\d+\s*页(\s*[/／共]\s*\d+\s*页?)?$",
        r"^\d+\s*/\s*\d+$",
        // Legal footers
        r"(?i)^(copyright|©|\(c\)).{0,120}$",
        r"(?i)^all rights reserved\.?$",
        r"(?i)^(confidential|proprietary)(\s+.{0,60})?$",
        r"^版权所有.{0,80}$",
        r"^(机密|内部资料).{0,40}$",
        // Extraction residue
        r"(?i)^(table of contents|contents)$",
        r"^目\s*录$",
        r"^\.{4,}\s*\d*$",
        r"(?i)^(doi|issn|isbn)[:\s].{0,80}$",
    ]
}

/// Configuration for [`NoiseFilter`].
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Hard upper bound of a segment, in characters.
    pub max_segment_chars: usize,
    /// Segments shorter than this are merged into their predecessor.
    pub min_segment_chars: usize,
    /// A short line seen at least this many times is treated as a running header/footer.
    pub repeated_line_threshold: usize,
    /// Lines longer than this are never treated as running headers.
    pub repeated_line_max_chars: usize,
    /// Share of U+FFFD characters above which a document is unreadable.
    pub max_replacement_ratio: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_segment_chars: 2000,
            min_segment_chars: 80,
            repeated_line_threshold: 3,
            repeated_line_max_chars: 80,
            max_replacement_ratio: 0.1,
        }
    }
}

impl FilterConfig {
    pub fn new(max_segment_chars: usize, min_segment_chars: usize) -> Self {
        Self {
            max_segment_chars: max_segment_chars.max(1),
            min_segment_chars: min_segment_chars.min(max_segment_chars),
            ..Default::default()
        }
    }
}

/// Default text filter: strips boilerplate and encoding residue, then packs
/// paragraphs into bounded segments.
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    config: FilterConfig,
    boilerplate: Vec<Regex>,
}

impl NoiseFilter {
    pub fn new(config: FilterConfig) -> Self {
        let boilerplate = default_boilerplate_patterns()
            .into_iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self {
            config,
            boilerplate,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FilterConfig::default())
    }

    /// Adds extra boilerplate patterns.
    ///
    /// # Errors
    ///
    /// Returns the regex error for the first invalid pattern.
    pub fn with_extra_patterns<I, S>(mut self, patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.boilerplate.push(Regex::new(pattern.as_ref())?);
        }
        Ok(self)
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Cleans raw text into paragraphs.
    pub fn clean(&self, raw: &str) -> Result<Vec<String>, FilterError> {
        let total_chars = raw.chars().count();
        if total_chars > 0 {
            let replacements = raw.chars().filter(|&c| c == '\u{FFFD}').count();
            let ratio = replacements as f64 / total_chars as f64;
            if ratio > self.config.max_replacement_ratio {
                return Err(FilterError::Unreadable(format!(
                    "{:.0}% of characters failed to decode",
                    ratio * 100.0
                )));
            }
        }

        let normalized = normalize(raw);
        let lines: Vec<String> = normalized.lines().map(collapse_whitespace).collect();

        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        for line in &lines {
            if !line.is_empty() && line.chars().count() <= self.config.repeated_line_max_chars {
                *occurrences.entry(line.as_str()).or_insert(0) += 1;
            }
        }

        let mut paragraphs = Vec::new();
        let mut current = String::new();
        for line in &lines {
            let noise = line.is_empty()
                || self.is_boilerplate(line)
                || is_symbol_only(line)
                || occurrences.get(line.as_str()).copied().unwrap_or(0)
                    >= self.config.repeated_line_threshold;

            if line.is_empty() {
                if !current.is_empty() {
                    paragraphs.push(std::mem::take(&mut current));
                }
                continue;
            }
            if noise {
                continue;
            }
            join_line(&mut current, line);
        }
        if !current.is_empty() {
            paragraphs.push(current);
        }

        if paragraphs.is_empty() {
            return Err(FilterError::Empty);
        }
        Ok(paragraphs)
    }

    /// Packs paragraphs into segments no longer than `max_segment_chars`.
    pub fn segment(&self, paragraphs: &[String]) -> Vec<String> {
        let max = self.config.max_segment_chars.max(1);

        let mut pieces = Vec::new();
        for paragraph in paragraphs {
            if char_len(paragraph) <= max {
                pieces.push(paragraph.clone());
                continue;
            }
            for sentence in split_sentences(paragraph) {
                if char_len(&sentence) <= max {
                    pieces.push(sentence);
                } else {
                    pieces.extend(hard_split(&sentence, max));
                }
            }
        }

        let mut segments: Vec<String> = Vec::new();
        for piece in pieces {
            match segments.last_mut() {
                Some(last) if char_len(last) + 1 + char_len(&piece) <= max => {
                    last.push('\n');
                    last.push_str(&piece);
                }
                _ => segments.push(piece),
            }
        }

        // Fold undersized tails into their predecessor when they still fit.
        let mut merged: Vec<String> = Vec::with_capacity(segments.len());
        for segment in segments {
            match merged.last_mut() {
                Some(last)
                    if char_len(&segment) < self.config.min_segment_chars
                        && char_len(last) + 1 + char_len(&segment) <= max =>
                {
                    last.push('\n');
                    last.push_str(&segment);
                }
                _ => merged.push(segment),
            }
        }
        merged
    }

    fn is_boilerplate(&self, line: &str) -> bool {
        self.boilerplate.iter().any(|re| re.is_match(line))
    }
}

impl TextFilter for NoiseFilter {
    fn filter(&self, document: &Document) -> Result<Vec<String>, FilterError> {
        let paragraphs = self.clean(&document.raw_text)?;
        let segments = self.segment(&paragraphs);
        if segments.is_empty() {
            return Err(FilterError::Empty);
        }
        Ok(segments)
    }
}

fn normalize(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .chars()
        .filter_map(|c| match c {
            '\u{FEFF}' | '\u{FFFD}' | '\u{200B}' | '\u{00AD}' => None,
            '\r' | '\u{000C}' => Some('\n'),
            '\u{00A0}' | '\u{3000}' | '\t' => Some(' '),
            c if c.is_control() && c != '\n' => None,
            c => Some(c),
        })
        .collect()
}

fn collapse_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_symbol_only(line: &str) -> bool {
    !line.chars().any(|c| c.is_alphanumeric())
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0xFF00..=0xFFEF | 0x3000..=0x303F)
}

/// Appends a wrapped line to a paragraph; CJK text is joined without a space
/// and hyphenated line breaks are rejoined.
fn join_line(paragraph: &mut String, line: &str) {
    if paragraph.is_empty() {
        paragraph.push_str(line);
        return;
    }
    let prev = paragraph.chars().last();
    let next = line.chars().next();
    match (prev, next) {
        (Some('-'), Some(n)) if n.is_lowercase() => {
            paragraph.pop();
        }
        (Some(p), Some(n)) if is_cjk(p) || is_cjk(n) => {}
        _ => paragraph.push(' '),
    }
    paragraph.push_str(line);
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = match c {
            '。' | '！' | '？' | '；' => true,
            '.' | '!' | '?' | ';' => chars.peek().map_or(true, |n| n.is_whitespace()),
            _ => false,
        };
        if boundary {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

fn hard_split(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max)
        .map(|chunk| chunk.iter().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
