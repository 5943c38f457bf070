/// The replay engine: applies or reverses one undo header against the
/// live buffer.
///
/// Replay works by swapping: for each change entry the live lines in the
/// entry's region are deleted (and captured), the entry's saved lines are
/// inserted, and the captured lines become the entry's new content. The
/// entry therefore always holds exactly what the next replay in the
/// opposite direction must restore, and replaying the same header twice
/// is the identity.
use crate::buffer::UndoBuffer;
use crate::error::UndoError;
use crate::types::{ChangeEntry, CursorSnapshot, Seq, UndoHeader};

/// Which way a header is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Re-apply the change (redo).
    Apply,
    /// Reverse the change (undo).
    Reverse,
}

/// Totals reported after replaying one header.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayStats {
    /// Lines inserted into the buffer.
    pub lines_added: u64,
    /// Lines removed from the buffer.
    pub lines_removed: u64,
    /// Sequence number of the replayed header.
    pub seq: Seq,
    /// Creation time of the replayed header.
    pub time: u64,
}

/// Replays all entries of `header` against `buf` as one transaction.
///
/// Both directions run the same swap; `direction` only matters for the
/// caller's bookkeeping. On success the entry list has been reversed so
/// the opposite direction processes it in the correct order, and the
/// header's cursor/marks/visual-selection/flags have been exchanged with
/// the buffer's live values.
///
/// # Errors
///
/// Returns [`UndoError::RangeError`] when an entry's recorded bounds no
/// longer fit the buffer. The replay is aborted at that entry, the
/// buffer is marked modified to force a safe state, and the header keeps
/// all its entries (already-swapped ones first).
pub(crate) fn replay_header<B: UndoBuffer>(
    header: &mut UndoHeader,
    buf: &mut B,
    direction: Direction,
) -> Result<ReplayStats, UndoError> {
    tracing::debug!(seq = header.seq, ?direction, "replaying header");
    let mut stats = ReplayStats {
        seq: header.seq,
        time: header.time,
        ..ReplayStats::default()
    };
    let empty_before = buffer_is_empty(buf);

    let mut pending = std::mem::take(&mut header.entries).into_iter();
    let mut swapped: Vec<ChangeEntry> = Vec::new();
    while let Some(mut entry) = pending.next() {
        let line_count = buf.line_count();
        let top = entry.top;
        let bot = if entry.bot == 0 {
            line_count + 1
        } else {
            entry.bot
        };
        if top > line_count || top >= bot || bot > line_count + 1 {
            tracing::warn!(
                seq = header.seq,
                top,
                bot,
                line_count,
                "undo header no longer matches the buffer, aborting replay"
            );
            // Keep every entry; the swapped ones come first so the header
            // stays structurally intact for inspection.
            let mut rest: Vec<ChangeEntry> = vec![entry];
            rest.extend(pending);
            swapped.extend(rest);
            header.entries = swapped;
            buf.set_modified(true);
            return Err(UndoError::RangeError {
                top,
                bot,
                line_count,
            });
        }

        let old_size = bot - top - 1;
        let new_size = entry.size();

        let captured = buf.delete_lines(top + 1, old_size);
        buf.insert_lines(top, &entry.lines);

        let delta = new_size as i64 - old_size as i64;
        if delta != 0 {
            buf.adjust_marks(top, bot, delta);
        }
        buf.lines_changed(top + 1, (top + new_size).max(top + 1));

        entry.lines = captured;
        entry.bot = top + new_size + 1;

        stats.lines_added += new_size;
        stats.lines_removed += old_size;

        // Prepend: the list ends up reversed, which is the processing
        // order for the opposite direction.
        swapped.insert(0, entry);
    }
    header.entries = swapped;
    header.getbot_entry = None;

    // Exchange cursor, marks and visual selection with the live values so
    // that the opposite replay restores what was current before this one.
    let live_cursor = buf.cursor();
    buf.set_cursor(clamp_cursor(header.cursor, buf));
    header.cursor = live_cursor;

    let live_marks = buf.named_marks();
    buf.set_named_marks(header.named_marks);
    header.named_marks = live_marks;

    let live_visual = buf.visual();
    buf.set_visual(header.visual);
    header.visual = live_visual;

    let was_modified = buf.is_modified();
    buf.set_modified(header.flags.was_changed);
    header.flags.was_changed = was_modified;
    header.flags.buffer_was_empty = empty_before;

    Ok(stats)
}

fn buffer_is_empty<B: UndoBuffer>(buf: &B) -> bool {
    match buf.line_count() {
        0 => true,
        1 => buf.line(1).is_empty(),
        _ => false,
    }
}

/// Clamps a restored cursor to valid buffer bounds. A snapshot that was
/// never placed (`lnum == 0`) lands on line 1.
fn clamp_cursor<B: UndoBuffer>(mut cursor: CursorSnapshot, buf: &B) -> CursorSnapshot {
    let line_count = buf.line_count().max(1);
    if cursor.lnum == 0 {
        cursor.lnum = 1;
        cursor.col = 0;
    } else if cursor.lnum > line_count {
        cursor.lnum = line_count;
    }
    let line_len = buf.line(cursor.lnum).chars().count() as u64;
    if cursor.col > line_len {
        cursor.col = line_len;
    }
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::VecBuffer;
    use crate::types::ChangeEntry;

    fn header_with_entry(entry: ChangeEntry) -> UndoHeader {
        let mut h = UndoHeader::new(1, 0);
        h.entries.push(entry);
        h
    }

    #[test]
    fn test_swap_restores_saved_lines() {
        // Buffer went from ["a","b","c"] to ["a","x","c"]; the entry holds
        // the pre-change line "b" for region (1, 3).
        let mut buf = VecBuffer::new(&["a", "x", "c"]);
        let mut h = header_with_entry(ChangeEntry {
            top: 1,
            bot: 3,
            lcount: 3,
            lines: vec!["b".to_string()],
        });

        let stats = replay_header(&mut h, &mut buf, Direction::Reverse).expect("replay");
        assert_eq!(buf.lines(), &["a", "b", "c"]);
        assert_eq!(stats.lines_added, 1);
        assert_eq!(stats.lines_removed, 1);
        // The entry now holds the post-change line for the way back.
        assert_eq!(h.entries[0].lines, vec!["x".to_string()]);

        replay_header(&mut h, &mut buf, Direction::Apply).expect("replay back");
        assert_eq!(buf.lines(), &["a", "x", "c"]);
    }

    #[test]
    fn test_size_changing_swap_updates_bot() {
        // Two lines were replaced by four; undoing shrinks the buffer.
        let mut buf = VecBuffer::new(&["a", "1", "2", "3", "4", "d"]);
        let mut h = header_with_entry(ChangeEntry {
            top: 1,
            bot: 6,
            lcount: 4,
            lines: vec!["b".to_string(), "c".to_string()],
        });

        let stats = replay_header(&mut h, &mut buf, Direction::Reverse).expect("replay");
        assert_eq!(buf.lines(), &["a", "b", "c", "d"]);
        assert_eq!(stats.lines_removed, 4);
        assert_eq!(stats.lines_added, 2);
        assert_eq!(h.entries[0].bot, 4);
        assert_eq!(h.entries[0].size(), 4);
    }

    #[test]
    fn test_bot_zero_resolves_to_end_of_file() {
        let mut buf = VecBuffer::new(&["a", "x", "y"]);
        let mut h = header_with_entry(ChangeEntry {
            top: 1,
            bot: 0,
            lcount: 3,
            lines: vec!["b".to_string()],
        });

        replay_header(&mut h, &mut buf, Direction::Reverse).expect("replay");
        assert_eq!(buf.lines(), &["a", "b"]);
        assert_eq!(h.entries[0].bot, 3);
    }

    #[test]
    fn test_entry_list_is_reversed_after_replay() {
        // Two disjoint regions saved by one command, most recent first.
        let mut buf = VecBuffer::new(&["A", "b", "C", "d"]);
        let mut h = UndoHeader::new(1, 0);
        h.entries.push(ChangeEntry {
            top: 2,
            bot: 4,
            lcount: 4,
            lines: vec!["c".to_string()],
        });
        h.entries.push(ChangeEntry {
            top: 0,
            bot: 2,
            lcount: 4,
            lines: vec!["a".to_string()],
        });

        replay_header(&mut h, &mut buf, Direction::Reverse).expect("replay");
        assert_eq!(buf.lines(), &["a", "b", "c", "d"]);
        // Oldest-saved entry now comes first for the opposite direction.
        assert_eq!(h.entries[0].top, 0);
        assert_eq!(h.entries[1].top, 2);

        replay_header(&mut h, &mut buf, Direction::Apply).expect("replay back");
        assert_eq!(buf.lines(), &["A", "b", "C", "d"]);
    }

    #[test]
    fn test_out_of_range_entry_aborts_and_marks_modified() {
        let mut buf = VecBuffer::new(&["a"]);
        let mut h = header_with_entry(ChangeEntry {
            top: 5,
            bot: 7,
            lcount: 6,
            lines: vec!["zz".to_string()],
        });

        let err = replay_header(&mut h, &mut buf, Direction::Reverse).unwrap_err();
        assert!(matches!(err, UndoError::RangeError { .. }));
        assert!(buf.is_modified());
        assert_eq!(buf.lines(), &["a"]);
        // The header keeps its entry for inspection.
        assert_eq!(h.entries.len(), 1);
    }

    #[test]
    fn test_cursor_swap_and_clamp() {
        let mut buf = VecBuffer::new(&["hello", "world"]);
        buf.set_cursor(CursorSnapshot {
            lnum: 2,
            col: 3,
            coladd: 0,
            vcol: -1,
        });
        let mut h = header_with_entry(ChangeEntry {
            top: 0,
            bot: 3,
            lcount: 1,
            lines: vec!["hi".to_string()],
        });
        h.cursor = CursorSnapshot {
            lnum: 9,
            col: 42,
            coladd: 0,
            vcol: -1,
        };

        replay_header(&mut h, &mut buf, Direction::Reverse).expect("replay");
        // Restored cursor clamped into the one-line buffer.
        assert_eq!(buf.cursor().lnum, 1);
        assert_eq!(buf.cursor().col, 2);
        // The header captured the pre-replay cursor.
        assert_eq!(h.cursor.lnum, 2);
        assert_eq!(h.cursor.col, 3);
    }

    #[test]
    fn test_modified_flag_exchanged() {
        let mut buf = VecBuffer::new(&["x"]);
        buf.set_modified(true);
        let mut h = header_with_entry(ChangeEntry {
            top: 0,
            bot: 2,
            lcount: 1,
            lines: vec!["y".to_string()],
        });
        // Header says the buffer was unmodified before the change.
        h.flags.was_changed = false;

        replay_header(&mut h, &mut buf, Direction::Reverse).expect("replay");
        assert!(!buf.is_modified());
        assert!(h.flags.was_changed);
    }
}
