/// Core data model: change entries, undo headers, and the snapshots a
/// header carries so that undoing back to it can restore editor state.
///
/// Headers reference each other by sequence number (`Seq`) rather than by
/// pointer; the [`crate::tree::UndoTree`] owns an arena keyed by `Seq` and
/// resolves the links. `0` is reserved as the "null" reference in the
/// on-disk format, so live sequence numbers start at 1.

/// Stable handle of an undo header. Monotonically increasing, never reused
/// within the lifetime of a tree.
pub type Seq = u64;

/// Number of named marks snapshotted per header (`'a'` through `'z'`).
pub const NUM_NAMED_MARKS: usize = 26;

/// A mark position. `lnum == 0` means the mark is not set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkPos {
    /// 1-based line number, 0 when unset.
    pub lnum: u64,
    /// 0-based column (byte offset within the line).
    pub col: u64,
    /// Columns past the end of the line (virtual-edit style positions).
    pub coladd: u64,
}

/// Cursor snapshot restored when undoing back to a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSnapshot {
    /// 1-based line number, 0 when the cursor was never placed.
    pub lnum: u64,
    /// 0-based column.
    pub col: u64,
    /// Columns past the end of the line.
    pub coladd: u64,
    /// Desired virtual column for vertical movement, -1 when unknown.
    pub vcol: i64,
}

impl Default for CursorSnapshot {
    fn default() -> Self {
        Self {
            lnum: 0,
            col: 0,
            coladd: 0,
            vcol: -1,
        }
    }
}

/// Visual-selection snapshot carried by a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VisualSelection {
    /// Start of the selection, unset when `lnum == 0`.
    pub start: MarkPos,
    /// End of the selection.
    pub end: MarkPos,
    /// Selection mode (0 = none; the editor layer defines the values).
    pub mode: u64,
    /// Desired column for block selections.
    pub curswant: u64,
}

/// Per-header state flags, exchanged with the live buffer on replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags {
    /// The buffer was marked modified when this header was created.
    pub was_changed: bool,
    /// The buffer held nothing but one empty line at that point.
    pub buffer_was_empty: bool,
}

impl HeaderFlags {
    const CHANGED: u16 = 0x01;
    const EMPTY: u16 = 0x02;

    pub fn to_bits(self) -> u16 {
        let mut bits = 0;
        if self.was_changed {
            bits |= Self::CHANGED;
        }
        if self.buffer_was_empty {
            bits |= Self::EMPTY;
        }
        bits
    }

    pub fn from_bits(bits: u16) -> Self {
        Self {
            was_changed: bits & Self::CHANGED != 0,
            buffer_was_empty: bits & Self::EMPTY != 0,
        }
    }
}

/// An immutable snapshot of a contiguous run of lines taken before a
/// mutation, plus the bounds needed to put them back.
///
/// During replay the entry's content is swapped with the live buffer text
/// for the same region, so the entry always holds exactly what the next
/// replay in the opposite direction must restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Line above the changed region (0 = change starts at line 1).
    pub top: u64,
    /// Line below the changed region. 0 means "extended to the end of the
    /// file when saved"; the real bottom is resolved at replay or sync.
    pub bot: u64,
    /// Buffer line count cached at save time, used to fix up `bot` for
    /// the entry still open when the header is finalized.
    pub lcount: u64,
    /// The saved lines, without trailing newlines.
    pub lines: Vec<String>,
}

impl ChangeEntry {
    /// Number of saved lines.
    pub fn size(&self) -> u64 {
        self.lines.len() as u64
    }
}

/// One undo step: the unit of navigation in the tree.
///
/// `prev` points toward the root (older state), `next` to the preferred
/// child along the main line. All children of a parent form a sibling
/// chain starting at `parent.next`, linked through `alt_next`/`alt_prev`;
/// siblings other than the first are alternate branches.
#[derive(Debug, Clone)]
pub struct UndoHeader {
    pub seq: Seq,
    pub next: Option<Seq>,
    pub prev: Option<Seq>,
    pub alt_next: Option<Seq>,
    pub alt_prev: Option<Seq>,
    /// Change entries in replay order (most recently saved first; the
    /// list is reversed after every replay so the opposite direction also
    /// processes it front to back).
    pub entries: Vec<ChangeEntry>,
    pub cursor: CursorSnapshot,
    pub named_marks: [MarkPos; NUM_NAMED_MARKS],
    pub visual: VisualSelection,
    pub flags: HeaderFlags,
    /// Creation time, seconds since the Unix epoch.
    pub time: u64,
    /// Sequence number of the file write that created this header, 0 when
    /// it was not created by a write.
    pub save_number: u64,
    /// Index of the entry whose `bot` is still pending fixup at sync.
    pub getbot_entry: Option<usize>,
    /// Traversal generation mark; compared against the tree's counter so
    /// walks never need to clear per-node state.
    pub visited: u64,
}

impl UndoHeader {
    pub fn new(seq: Seq, time: u64) -> Self {
        Self {
            seq,
            next: None,
            prev: None,
            alt_next: None,
            alt_prev: None,
            entries: Vec::new(),
            cursor: CursorSnapshot::default(),
            named_marks: [MarkPos::default(); NUM_NAMED_MARKS],
            visual: VisualSelection::default(),
            flags: HeaderFlags::default(),
            time,
            save_number: 0,
            getbot_entry: None,
            visited: 0,
        }
    }
}

/// Snapshot of a single line, used by the "restore one line" operation
/// that survives independently of the tree and round-trips through the
/// undo file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedLine {
    pub text: String,
    /// 1-based line number the snapshot belongs to.
    pub lnum: u64,
    /// Cursor column to restore alongside the line.
    pub col: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_bits_roundtrip() {
        for (changed, empty) in [(false, false), (true, false), (false, true), (true, true)] {
            let flags = HeaderFlags {
                was_changed: changed,
                buffer_was_empty: empty,
            };
            assert_eq!(HeaderFlags::from_bits(flags.to_bits()), flags);
        }
    }

    #[test]
    fn test_entry_size_tracks_lines() {
        let entry = ChangeEntry {
            top: 0,
            bot: 3,
            lcount: 2,
            lines: vec!["a".into(), "b".into()],
        };
        assert_eq!(entry.size(), 2);
    }

    #[test]
    fn test_new_header_is_unlinked() {
        let h = UndoHeader::new(7, 1_700_000_000);
        assert_eq!(h.seq, 7);
        assert!(h.next.is_none());
        assert!(h.prev.is_none());
        assert!(h.alt_next.is_none());
        assert!(h.alt_prev.is_none());
        assert!(h.entries.is_empty());
        assert_eq!(h.save_number, 0);
    }

    #[test]
    fn test_default_cursor_is_unplaced() {
        let c = CursorSnapshot::default();
        assert_eq!(c.lnum, 0);
        assert_eq!(c.vcol, -1);
    }
}
