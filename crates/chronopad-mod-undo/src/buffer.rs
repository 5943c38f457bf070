/// The buffer collaborator boundary.
///
/// The undo engine never stores document text itself; it swaps line
/// ranges against whatever implements [`UndoBuffer`]. The trait also
/// carries the editor state a header snapshots (cursor, named marks,
/// visual selection, modified flag) and the notifications the replay
/// engine owes the mark/fold and rendering layers.
///
/// Line numbers are 1-based. `delete_lines` may transiently leave the
/// buffer with zero lines in the middle of a replay; implementations must
/// not pad it back on their own.
use std::path::Path;

use crate::types::{CursorSnapshot, MarkPos, VisualSelection, NUM_NAMED_MARKS};

pub trait UndoBuffer {
    /// Number of lines currently in the buffer.
    fn line_count(&self) -> u64;

    /// Returns the text of line `lnum` (1-based, without the newline).
    /// Callers validate bounds before asking.
    fn line(&self, lnum: u64) -> String;

    /// Inserts `lines` after line `after` (0 inserts at the top).
    fn insert_lines(&mut self, after: u64, lines: &[String]);

    /// Removes `count` lines starting at `first`, returning their text.
    fn delete_lines(&mut self, first: u64, count: u64) -> Vec<String>;

    /// False for read-only buffers; recording a save point is then refused.
    fn is_modifiable(&self) -> bool {
        true
    }

    fn is_modified(&self) -> bool;
    fn set_modified(&mut self, modified: bool);

    /// Path of the file backing this buffer, used to locate its undo file.
    fn file_path(&self) -> Option<&Path> {
        None
    }

    fn cursor(&self) -> CursorSnapshot;
    fn set_cursor(&mut self, cursor: CursorSnapshot);

    fn named_marks(&self) -> [MarkPos; NUM_NAMED_MARKS];
    fn set_named_marks(&mut self, marks: [MarkPos; NUM_NAMED_MARKS]);

    fn visual(&self) -> VisualSelection;
    fn set_visual(&mut self, visual: VisualSelection);

    /// Notifies the mark/fold layer that the region `(top, old_bot)`
    /// (exclusive bounds) changed size by `delta` lines: positions at or
    /// beyond `old_bot` shift by `delta`, positions inside the region are
    /// the layer's own business (typically clamped or dropped).
    fn adjust_marks(&mut self, top: u64, old_bot: u64, delta: i64);

    /// Requests a redraw of lines `first..=last` (inclusive, 1-based).
    fn lines_changed(&mut self, first: u64, last: u64) {
        let _ = (first, last);
    }
}

/// A plain in-memory [`UndoBuffer`] holding one `String` per line.
///
/// This is the reference implementation used by the engine's own tests;
/// real editors implement the trait on their document type instead.
#[derive(Debug, Clone, Default)]
pub struct VecBuffer {
    lines: Vec<String>,
    cursor: CursorSnapshot,
    marks: [MarkPos; NUM_NAMED_MARKS],
    visual: VisualSelection,
    modified: bool,
    modifiable: bool,
}

impl VecBuffer {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|s| s.to_string()).collect(),
            cursor: CursorSnapshot::default(),
            marks: [MarkPos::default(); NUM_NAMED_MARKS],
            visual: VisualSelection::default(),
            modified: false,
            modifiable: true,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn set_modifiable(&mut self, modifiable: bool) {
        self.modifiable = modifiable;
    }

    pub fn set_mark(&mut self, index: usize, pos: MarkPos) {
        self.marks[index] = pos;
    }

    pub fn mark(&self, index: usize) -> MarkPos {
        self.marks[index]
    }
}

impl UndoBuffer for VecBuffer {
    fn line_count(&self) -> u64 {
        self.lines.len() as u64
    }

    fn line(&self, lnum: u64) -> String {
        self.lines
            .get(lnum.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default()
    }

    fn insert_lines(&mut self, after: u64, lines: &[String]) {
        let at = (after as usize).min(self.lines.len());
        self.lines.splice(at..at, lines.iter().cloned());
    }

    fn delete_lines(&mut self, first: u64, count: u64) -> Vec<String> {
        let start = first.saturating_sub(1) as usize;
        let end = (start + count as usize).min(self.lines.len());
        if start >= end {
            return Vec::new();
        }
        self.lines.drain(start..end).collect()
    }

    fn is_modifiable(&self) -> bool {
        self.modifiable
    }

    fn is_modified(&self) -> bool {
        self.modified
    }

    fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    fn cursor(&self) -> CursorSnapshot {
        self.cursor
    }

    fn set_cursor(&mut self, cursor: CursorSnapshot) {
        self.cursor = cursor;
    }

    fn named_marks(&self) -> [MarkPos; NUM_NAMED_MARKS] {
        self.marks
    }

    fn set_named_marks(&mut self, marks: [MarkPos; NUM_NAMED_MARKS]) {
        self.marks = marks;
    }

    fn visual(&self) -> VisualSelection {
        self.visual
    }

    fn set_visual(&mut self, visual: VisualSelection) {
        self.visual = visual;
    }

    fn adjust_marks(&mut self, top: u64, old_bot: u64, delta: i64) {
        for mark in self.marks.iter_mut() {
            if mark.lnum == 0 {
                continue;
            }
            if mark.lnum >= old_bot {
                mark.lnum = mark.lnum.saturating_add_signed(delta);
            } else if mark.lnum > top && delta < 0 {
                // Mark inside a shrinking region: clamp to the region top.
                let new_bot = old_bot.saturating_add_signed(delta);
                if mark.lnum >= new_bot {
                    mark.lnum = top + 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_delete_roundtrip() {
        let mut buf = VecBuffer::new(&["a", "b", "c"]);
        buf.insert_lines(1, &["x".to_string(), "y".to_string()]);
        assert_eq!(buf.lines(), &["a", "x", "y", "b", "c"]);

        let removed = buf.delete_lines(2, 2);
        assert_eq!(removed, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(buf.lines(), &["a", "b", "c"]);
    }

    #[test]
    fn test_insert_at_top() {
        let mut buf = VecBuffer::new(&["b"]);
        buf.insert_lines(0, &["a".to_string()]);
        assert_eq!(buf.lines(), &["a", "b"]);
    }

    #[test]
    fn test_delete_all_lines_leaves_empty_buffer() {
        let mut buf = VecBuffer::new(&["a", "b"]);
        buf.delete_lines(1, 2);
        assert_eq!(buf.line_count(), 0);
    }

    #[test]
    fn test_marks_shift_on_adjust() {
        let mut buf = VecBuffer::new(&["a", "b", "c", "d"]);
        buf.set_mark(0, MarkPos { lnum: 4, col: 0, coladd: 0 });
        // Region (1, 3) grows by 2 lines: line 4 moves to line 6.
        buf.adjust_marks(1, 3, 2);
        assert_eq!(buf.mark(0).lnum, 6);
    }

    #[test]
    fn test_mark_inside_shrinking_region_clamps() {
        let mut buf = VecBuffer::new(&["a", "b", "c", "d"]);
        buf.set_mark(0, MarkPos { lnum: 3, col: 0, coladd: 0 });
        // Region (1, 4) shrinks by 2 lines.
        buf.adjust_marks(1, 4, -2);
        assert_eq!(buf.mark(0).lnum, 2);
    }
}
