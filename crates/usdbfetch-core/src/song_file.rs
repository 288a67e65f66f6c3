//! Line-oriented view of an UltraStar song text.
//!
//! Header lines look like `#TAG:VALUE`; everything else (notes, line breaks,
//! the end marker) is kept verbatim. Rendering an untouched file reproduces
//! the input exactly, including `\r\n` endings and a leading byte order mark.

use std::fmt;

const BOM: char = '\u{feff}';

#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    content: String,
    ending: &'static str,
}

impl Line {
    /// `(tag, value)` for header lines; value is untrimmed
    fn header(&self) -> Option<(&str, &str)> {
        let rest = self.content.trim_start_matches(BOM).strip_prefix('#')?;
        Some(match rest.split_once(':') {
            Some((tag, value)) => (tag, value),
            None => (rest, ""),
        })
    }

    fn is_header(&self) -> bool {
        self.header().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SongFile {
    lines: Vec<Line>,
}

impl SongFile {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .split_inclusive('\n')
            .map(|segment| {
                if let Some(content) = segment.strip_suffix("\r\n") {
                    Line { content: content.to_string(), ending: "\r\n" }
                } else if let Some(content) = segment.strip_suffix('\n') {
                    Line { content: content.to_string(), ending: "\n" }
                } else {
                    Line { content: segment.to_string(), ending: "" }
                }
            })
            .collect();
        Self { lines }
    }

    /// Trimmed value of the first header with this tag (case-insensitive)
    pub fn field(&self, tag: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line.header() {
            Some((t, value)) if t.trim().eq_ignore_ascii_case(tag) => Some(value.trim()),
            _ => None,
        })
    }

    /// Replace the value of the first header with this tag.
    ///
    /// Later headers with the same tag are left alone. When the tag is
    /// absent a new header is appended to the leading header block.
    pub fn set_field(&mut self, tag: &str, value: &str) {
        let found = self.lines.iter().position(|line| {
            matches!(line.header(), Some((t, _)) if t.trim().eq_ignore_ascii_case(tag))
        });

        match found {
            Some(idx) => {
                let line = &mut self.lines[idx];
                let bom = if line.content.starts_with(BOM) { "\u{feff}" } else { "" };
                let original_tag = line.header().map(|(t, _)| t.to_string()).unwrap_or_default();
                line.content = format!("{}#{}:{}", bom, original_tag, value);
            }
            None => self.insert_header(tag, value),
        }
    }

    fn insert_header(&mut self, tag: &str, value: &str) {
        let idx = self
            .lines
            .iter()
            .position(|line| !line.is_header())
            .unwrap_or(self.lines.len());
        let ending = self.preferred_ending();

        let new_ending = if idx == self.lines.len() {
            if let Some(last) = self.lines.last_mut() {
                if last.ending.is_empty() {
                    last.ending = ending;
                }
            }
            ""
        } else {
            ending
        };

        self.lines.insert(
            idx,
            Line {
                content: format!("#{}:{}", tag, value),
                ending: new_ending,
            },
        );
    }

    fn preferred_ending(&self) -> &'static str {
        if self.lines.iter().any(|line| line.ending == "\r\n") {
            "\r\n"
        } else {
            "\n"
        }
    }
}

impl fmt::Display for SongFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            f.write_str(&line.content)?;
            f.write_str(line.ending)?;
        }
        Ok(())
    }
}
