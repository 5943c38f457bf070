/// Line-oriented text buffer wrapping `ropey::Rope`.
///
/// The undo engine thinks in whole lines, so this buffer exposes a
/// 1-based line API on top of the rope. Invariant: the rope either is
/// empty or ends with a newline, which makes "number of lines" exact and
/// lets the buffer hold zero lines mid-replay without inventing padding.
use std::fmt;

use ropey::Rope;

/// A text buffer backed by a rope, addressed by 1-based line numbers.
#[derive(Debug, Clone, Default)]
pub struct LineBuffer {
    rope: Rope,
}

impl From<&str> for LineBuffer {
    fn from(text: &str) -> Self {
        let mut rope = Rope::from_str(text);
        let len = rope.len_chars();
        if len > 0 && rope.char(len - 1) != '\n' {
            rope.insert(len, "\n");
        }
        Self { rope }
    }
}

impl fmt::Display for LineBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rope)
    }
}

impl LineBuffer {
    /// Creates an empty buffer (zero lines).
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the underlying rope (read-only).
    pub fn rope(&self) -> &Rope {
        &self.rope
    }

    /// Number of lines. An empty buffer has zero.
    pub fn line_count(&self) -> u64 {
        if self.rope.len_chars() == 0 {
            0
        } else {
            self.rope.len_lines() as u64 - 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rope.len_chars() == 0
    }

    /// Returns the text of line `lnum` (1-based) without its newline.
    /// Out-of-range lines read as empty.
    pub fn line(&self, lnum: u64) -> String {
        if lnum < 1 || lnum > self.line_count() {
            return String::new();
        }
        let slice = self.rope.line(lnum as usize - 1);
        let mut text = slice.to_string();
        if text.ends_with('\n') {
            text.pop();
        }
        text
    }

    /// Inserts `lines` after line `after` (0 inserts at the top). Each
    /// element becomes one full line.
    pub fn insert_lines(&mut self, after: u64, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let at_line = after.min(self.line_count()) as usize;
        let at_char = self.rope.line_to_char(at_line);
        let mut text = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            text.push_str(line);
            text.push('\n');
        }
        self.rope.insert(at_char, &text);
    }

    /// Removes `count` lines starting at `first` (1-based), returning
    /// their text. Requests past the end are clipped.
    pub fn delete_lines(&mut self, first: u64, count: u64) -> Vec<String> {
        let line_count = self.line_count();
        if first < 1 || first > line_count || count == 0 {
            return Vec::new();
        }
        let last = (first + count - 1).min(line_count);
        let removed: Vec<String> = (first..=last).map(|l| self.line(l)).collect();
        let start = self.rope.line_to_char(first as usize - 1);
        let end = self.rope.line_to_char(last as usize);
        self.rope.remove(start..end);
        removed
    }

    /// Collects every line, without newlines.
    pub fn lines(&self) -> Vec<String> {
        (1..=self.line_count()).map(|l| self.line(l)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_normalizes_trailing_newline() {
        let buf = LineBuffer::from("a\nb");
        assert_eq!(buf.line_count(), 2);
        assert_eq!(buf.to_string(), "a\nb\n");

        let buf = LineBuffer::from("a\nb\n");
        assert_eq!(buf.line_count(), 2);
    }

    #[test]
    fn test_empty_buffer_has_zero_lines() {
        let buf = LineBuffer::new();
        assert_eq!(buf.line_count(), 0);
        assert!(buf.is_empty());
        assert_eq!(buf.line(1), "");
    }

    #[test]
    fn test_line_access_is_one_based() {
        let buf = LineBuffer::from("first\nsecond\n");
        assert_eq!(buf.line(1), "first");
        assert_eq!(buf.line(2), "second");
        assert_eq!(buf.line(3), "");
    }

    #[test]
    fn test_insert_lines_at_top_middle_end() {
        let mut buf = LineBuffer::from("b\n");
        buf.insert_lines(0, &["a".to_string()]);
        buf.insert_lines(2, &["c".to_string()]);
        buf.insert_lines(1, &["ab".to_string()]);
        assert_eq!(buf.lines(), vec!["a", "ab", "b", "c"]);
    }

    #[test]
    fn test_delete_lines_returns_removed_text() {
        let mut buf = LineBuffer::from("a\nb\nc\nd\n");
        let removed = buf.delete_lines(2, 2);
        assert_eq!(removed, vec!["b", "c"]);
        assert_eq!(buf.lines(), vec!["a", "d"]);
    }

    #[test]
    fn test_delete_all_lines_empties_the_buffer() {
        let mut buf = LineBuffer::from("a\nb\n");
        buf.delete_lines(1, 2);
        assert_eq!(buf.line_count(), 0);
        assert!(buf.is_empty());

        // And it accepts lines again afterward.
        buf.insert_lines(0, &["fresh".to_string()]);
        assert_eq!(buf.lines(), vec!["fresh"]);
    }

    #[test]
    fn test_delete_clips_past_end() {
        let mut buf = LineBuffer::from("a\nb\n");
        let removed = buf.delete_lines(2, 10);
        assert_eq!(removed, vec!["b"]);
        assert_eq!(buf.lines(), vec!["a"]);
    }
}
