/// The undo tree manager for a single buffer.
///
/// Owns every undo header in an arena keyed by sequence number, maintains
/// the main line (oldest to newest) and the alternate-branch sibling
/// chains, enforces the configured history depth, and exposes the
/// command-level surface: save points, sync, undo/redo, branch discard,
/// time travel, and undo-file persistence.
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::buffer::UndoBuffer;
use crate::config::UndoConfig;
use crate::error::{SeekEnd, UndoError, UndoInfo};
use crate::replay::{replay_header, Direction, ReplayStats};
use crate::travel;
use crate::types::{ChangeEntry, CursorSnapshot, SavedLine, Seq, UndoHeader};
use crate::undofile;

/// One leaf of the undo tree, as reported by [`UndoTree::list_undo_leaves`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoLeaf {
    pub seq: Seq,
    /// Number of changes between the root and this leaf, inclusive.
    pub changes_since_root: u64,
    /// Creation time of the leaf header, seconds since the Unix epoch.
    pub time: u64,
    /// Set when the leaf header was created by a file write.
    pub save_number: Option<u64>,
}

/// Per-buffer undo state: the header arena plus the bookkeeping that
/// defines "where we are" in history.
pub struct UndoTree {
    pub(crate) headers: HashMap<Seq, UndoHeader>,
    /// Root of the main line; other roots hang off its sibling chain.
    pub(crate) oldest: Option<Seq>,
    /// Tip of the main line.
    pub(crate) newest: Option<Seq>,
    /// Header most recently undone (the one a redo would re-apply).
    /// `None` means "at the tip, nothing undone".
    pub(crate) current: Option<Seq>,
    /// True when the next mutation must start a new header.
    pub(crate) synced: bool,
    /// Highest sequence number ever handed out. Never reused.
    pub(crate) seq_last: Seq,
    /// Sequence number of the current position (0 = before all changes).
    pub(crate) seq_cur: Seq,
    pub(crate) save_nr_last: u64,
    pub(crate) save_nr_cur: u64,
    /// Timestamp of the current position, for wall-clock navigation.
    pub(crate) time_cur: u64,
    /// Generation counter backing the per-header `visited` marks.
    pub(crate) visit_gen: u64,
    /// Single-line restore snapshot, persisted in the undo file.
    pub(crate) saved_line: Option<SavedLine>,
    pub(crate) config: UndoConfig,
    sandbox: bool,
    text_locked: bool,
    should_cancel: Option<Box<dyn Fn() -> bool>>,
}

impl fmt::Debug for UndoTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoTree")
            .field("header_count", &self.headers.len())
            .field("oldest", &self.oldest)
            .field("newest", &self.newest)
            .field("current", &self.current)
            .field("synced", &self.synced)
            .field("seq_last", &self.seq_last)
            .field("seq_cur", &self.seq_cur)
            .finish()
    }
}

impl Default for UndoTree {
    fn default() -> Self {
        Self::new(UndoConfig::default())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl UndoTree {
    pub fn new(config: UndoConfig) -> Self {
        Self {
            headers: HashMap::new(),
            oldest: None,
            newest: None,
            current: None,
            synced: true,
            seq_last: 0,
            seq_cur: 0,
            save_nr_last: 0,
            save_nr_cur: 0,
            time_cur: 0,
            visit_gen: 0,
            saved_line: None,
            config,
            sandbox: false,
            text_locked: false,
            should_cancel: None,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn config(&self) -> &UndoConfig {
        &self.config
    }

    /// Sequence number of the current position (0 = before all changes).
    pub fn current_sequence(&self) -> Seq {
        self.seq_cur
    }

    /// Highest sequence number ever assigned.
    pub fn last_sequence(&self) -> Seq {
        self.seq_last
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Whether an undo step is possible from the current position.
    pub fn can_undo(&self) -> bool {
        self.position().is_some()
    }

    /// Whether a redo step is possible from the current position.
    pub fn can_redo(&self) -> bool {
        self.current.is_some()
    }

    // ── Policy ───────────────────────────────────────────────────────

    /// Marks the tree as running inside a sandbox; recording and replay
    /// are refused until cleared.
    pub fn set_sandbox(&mut self, sandbox: bool) {
        self.sandbox = sandbox;
    }

    /// Marks buffer text as locked (a command is mutating state that must
    /// not change under it); recording and replay are refused.
    pub fn set_text_locked(&mut self, locked: bool) {
        self.text_locked = locked;
    }

    /// Installs a hook polled between headers during multi-step walks; a
    /// `true` return stops the walk at the last fully-replayed header.
    pub fn set_cancel_check(&mut self, check: Option<Box<dyn Fn() -> bool>>) {
        self.should_cancel = check;
    }

    fn check_allowed<B: UndoBuffer>(&self, buf: &B) -> Result<(), UndoError> {
        if !buf.is_modifiable() {
            return Err(UndoError::NotAllowed("buffer is not modifiable"));
        }
        if self.sandbox {
            return Err(UndoError::NotAllowed("not allowed in a sandbox"));
        }
        if self.text_locked {
            return Err(UndoError::NotAllowed("text is locked"));
        }
        Ok(())
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.should_cancel.as_ref().map_or(false, |f| f())
    }

    // ── Arena access ─────────────────────────────────────────────────

    pub(crate) fn hdr(&self, seq: Seq) -> &UndoHeader {
        self.headers
            .get(&seq)
            .expect("undo tree link points at a freed header")
    }

    pub(crate) fn hdr_mut(&mut self, seq: Seq) -> &mut UndoHeader {
        self.headers
            .get_mut(&seq)
            .expect("undo tree link points at a freed header")
    }

    /// Header the buffer is currently "at": the parent of the header that
    /// would be redone next, or the tip when nothing is undone.
    pub(crate) fn position(&self) -> Option<Seq> {
        match self.current {
            Some(cur) => self.hdr(cur).prev,
            None => self.newest,
        }
    }

    /// Follows preferred children from `start` down to the leaf.
    pub(crate) fn leaf_from(&self, start: Seq) -> Seq {
        let mut seq = start;
        while let Some(next) = self.hdr(seq).next {
            seq = next;
        }
        seq
    }

    /// Makes `child` the first entry of its sibling chain, so that plain
    /// undo/redo afterward continues along the path through it.
    pub(crate) fn promote_child(&mut self, parent: Option<Seq>, child: Seq) {
        let head = match parent {
            Some(p) => self.hdr(p).next,
            None => self.oldest,
        };
        if head == Some(child) {
            return;
        }
        let (alt_prev, alt_next) = {
            let c = self.hdr(child);
            (c.alt_prev, c.alt_next)
        };
        if let Some(p) = alt_prev {
            self.hdr_mut(p).alt_next = alt_next;
        }
        if let Some(n) = alt_next {
            self.hdr_mut(n).alt_prev = alt_prev;
        }
        if let Some(h) = head {
            self.hdr_mut(h).alt_prev = Some(child);
        }
        {
            let c = self.hdr_mut(child);
            c.alt_prev = None;
            c.alt_next = head;
        }
        match parent {
            Some(p) => self.hdr_mut(p).next = Some(child),
            None => self.oldest = Some(child),
        }
    }

    /// Frees `start` and every header reachable below it. Tree-level
    /// pointers into the freed subtree are cleared.
    pub(crate) fn free_branch(&mut self, start: Seq) {
        let mut stack = vec![start];
        while let Some(seq) = stack.pop() {
            let Some(removed) = self.headers.remove(&seq) else {
                continue;
            };
            if self.current == Some(seq) {
                self.current = None;
            }
            if self.newest == Some(seq) {
                self.newest = None;
            }
            if self.oldest == Some(seq) {
                self.oldest = None;
            }
            let mut child = removed.next;
            while let Some(c) = child {
                stack.push(c);
                child = self.headers.get(&c).and_then(|h| h.alt_next);
            }
        }
    }

    /// Removes the designated oldest header. Root-level alternate
    /// branches can never be reached again once their root goes, so they
    /// are discarded whole rather than partially freed.
    fn evict_oldest(&mut self) {
        let Some(old) = self.oldest else {
            return;
        };
        let mut alt = self.hdr(old).alt_next;
        while let Some(a) = alt {
            let next_alt = self.hdr(a).alt_next;
            self.free_branch(a);
            alt = next_alt;
        }
        if let Some(h) = self.headers.get_mut(&old) {
            h.alt_next = None;
        }
        match self.hdr(old).next {
            Some(child) => {
                // The preferred child and its siblings become roots.
                let mut sib = Some(child);
                while let Some(s) = sib {
                    let h = self.hdr_mut(s);
                    h.prev = None;
                    sib = h.alt_next;
                }
                self.oldest = Some(child);
            }
            None => {
                self.oldest = None;
                self.newest = None;
            }
        }
        if self.current == Some(old) {
            self.current = None;
        }
        self.headers.remove(&old);
    }

    // ── Save points ──────────────────────────────────────────────────

    /// Records the lines `(top, bot)` (exclusive bounds, 1-based lines)
    /// before a mutation. `new_bot` is the projected line below the
    /// region after the mutation, or 0 when not yet known.
    ///
    /// When the tree is synced this opens a fresh header at the current
    /// position (turning any undone headers into an alternate branch) and
    /// evicts history beyond the configured depth. Otherwise the saved
    /// range joins the open header, merging with an existing single-line
    /// entry when possible so character-at-a-time edits stay cheap.
    ///
    /// # Errors
    ///
    /// [`UndoError::NotAllowed`] when recording is refused by policy;
    /// [`UndoError::RangeError`] when the bounds do not fit the buffer
    /// (a caller bug).
    pub fn open_save_point<B: UndoBuffer>(
        &mut self,
        buf: &B,
        top: u64,
        bot: u64,
        new_bot: u64,
    ) -> Result<(), UndoError> {
        self.check_allowed(buf)?;
        if self.config.undo_levels < 0 {
            return Ok(());
        }
        let line_count = buf.line_count();
        if top > line_count || top >= bot || bot > line_count + 1 {
            return Err(UndoError::RangeError {
                top,
                bot,
                line_count,
            });
        }
        let size = bot - top - 1;

        if self.synced {
            self.start_header(buf);
        } else if size == 1 && self.try_merge_single_line(top, bot, new_bot, line_count) {
            return Ok(());
        }

        let head = match self.newest {
            Some(h) => h,
            // Unsynced with no header: nothing to append to (history was
            // cleared under an open transaction). Start fresh.
            None => {
                self.start_header(buf);
                match self.newest {
                    Some(h) => h,
                    None => return Ok(()),
                }
            }
        };

        let mut lines = Vec::with_capacity(size as usize);
        for lnum in (top + 1)..bot {
            lines.push(buf.line(lnum));
        }
        self.push_entry(head, top, bot, new_bot, line_count, lines);
        self.synced = false;
        Ok(())
    }

    /// Allocates a new header at the current position and links it as the
    /// main-line tip. Undone headers (if any) become the first alternate
    /// branch of the new header.
    fn start_header<B: UndoBuffer>(&mut self, buf: &B) {
        let seq = self.seq_last + 1;
        self.seq_last = seq;
        let now = unix_now();

        let (parent, displaced) = match self.current {
            Some(cur) => {
                let parent = self.hdr(cur).prev;
                let head = match parent {
                    Some(p) => self.hdr(p).next,
                    None => self.oldest,
                };
                (parent, head)
            }
            None => (self.newest, None),
        };

        let mut header = UndoHeader::new(seq, now);
        header.prev = parent;
        header.alt_next = displaced;
        header.cursor = buf.cursor();
        header.named_marks = buf.named_marks();
        header.visual = buf.visual();
        header.flags.was_changed = buf.is_modified();
        header.flags.buffer_was_empty =
            buf.line_count() == 0 || (buf.line_count() == 1 && buf.line(1).is_empty());
        self.headers.insert(seq, header);

        if let Some(d) = displaced {
            self.hdr_mut(d).alt_prev = Some(seq);
        }
        match parent {
            Some(p) => self.hdr_mut(p).next = Some(seq),
            None => self.oldest = Some(seq),
        }

        self.newest = Some(seq);
        self.current = None;
        self.seq_cur = seq;
        self.time_cur = now;
        self.synced = false;

        if self.config.undo_levels >= 0 {
            let keep = self.config.undo_levels.max(1) as usize;
            while self.headers.len() > keep {
                if self.oldest.is_none() || self.oldest == self.newest {
                    break;
                }
                self.evict_oldest();
            }
        }
    }

    /// Appends a change entry to the open header, resolving the pending
    /// bottom line of the previous entry first.
    fn push_entry(
        &mut self,
        head: Seq,
        top: u64,
        bot: u64,
        new_bot: u64,
        line_count: u64,
        lines: Vec<String>,
    ) {
        if self.hdr(head).getbot_entry.is_some() {
            self.fixup_pending_bot(line_count);
        }
        let mut entry = ChangeEntry {
            top,
            bot: 0,
            lcount: 0,
            lines,
        };
        let mut pending = false;
        if new_bot != 0 {
            entry.bot = new_bot;
        } else if bot > line_count {
            // Extends to the end of the file; resolved at replay time.
            entry.bot = 0;
        } else {
            entry.lcount = line_count;
            pending = true;
        }
        let h = self.hdr_mut(head);
        h.entries.insert(0, entry);
        h.getbot_entry = if pending { Some(0) } else { None };
    }

    /// Attempts to reuse an existing single-line entry of the open header
    /// instead of saving the same line again. Returns true when the save
    /// point is already covered.
    fn try_merge_single_line(&mut self, top: u64, bot: u64, new_bot: u64, line_count: u64) -> bool {
        let Some(head) = self.newest else {
            return false;
        };
        let mut found = None;
        {
            let h = self.hdr(head);
            for (i, e) in h.entries.iter().enumerate().take(10) {
                // Give up when lines were inserted/deleted in between, or
                // when the line was part of a multi-line save.
                let continuity_broken = if h.getbot_entry == Some(i) {
                    e.lcount != line_count
                } else {
                    let ebot = if e.bot == 0 { line_count + 1 } else { e.bot };
                    e.top + e.size() + 1 != ebot
                };
                if continuity_broken
                    || (e.size() > 1 && top >= e.top && top + 2 <= e.top + e.size() + 1)
                {
                    break;
                }
                if e.size() == 1 && e.top == top {
                    found = Some(i);
                    break;
                }
            }
        }
        let Some(i) = found else {
            return false;
        };
        if i > 0 {
            // Not the front entry: settle the pending bottom line now and
            // move the found entry to the front.
            self.fixup_pending_bot(line_count);
            let h = self.hdr_mut(head);
            let e = h.entries.remove(i);
            h.entries.insert(0, e);
        }
        let h = self.hdr_mut(head);
        h.getbot_entry = None;
        let e = &mut h.entries[0];
        if new_bot != 0 {
            e.bot = new_bot;
        } else if bot > line_count {
            e.bot = 0;
        } else {
            e.lcount = line_count;
            e.bot = 0;
            h.getbot_entry = Some(0);
        }
        true
    }

    /// Computes the real bottom line of the entry left pending by the
    /// last save point, correcting for changes in total line count.
    pub(crate) fn fixup_pending_bot(&mut self, line_count: u64) {
        let Some(newest) = self.newest else {
            return;
        };
        let Some(h) = self.headers.get_mut(&newest) else {
            return;
        };
        let Some(idx) = h.getbot_entry.take() else {
            return;
        };
        if let Some(e) = h.entries.get_mut(idx) {
            let extra = line_count as i64 - e.lcount as i64;
            let bot = e.top as i64 + e.lines.len() as i64 + 1 + extra;
            if bot < 1 || bot as u64 > line_count + 1 {
                tracing::warn!(
                    seq = h.seq,
                    bot,
                    "pending bottom-line fixup out of range, clamping to end of file"
                );
                e.bot = line_count + 1;
            } else {
                e.bot = bot as u64;
            }
        }
    }

    /// Requests that the next change joins the previous undo step instead
    /// of starting a new one. Ignored when there is no previous step, or
    /// while a redo position exists: the already-undone header is not new
    /// history and must not be reopened.
    pub fn mark_unsynced(&mut self) {
        if self.newest.is_some() && self.current.is_none() {
            self.synced = false;
        }
    }

    /// Finalizes the open header (pending bottom-line fixups) and marks
    /// the tree synced: the next mutation starts a new header.
    ///
    /// Calling this twice without an intervening mutation is a no-op
    /// unless `force` is set.
    pub fn sync<B: UndoBuffer>(&mut self, buf: &B, force: bool) {
        if self.synced && !force {
            return;
        }
        if self.config.undo_levels >= 0 {
            self.fixup_pending_bot(buf.line_count());
        }
        self.current = None;
        self.synced = true;
    }

    // ── Undo / redo ──────────────────────────────────────────────────

    /// Undoes up to `count` steps (at least one). Stops early, without an
    /// error, when the oldest change has been undone or cancellation is
    /// requested.
    pub fn undo<B: UndoBuffer>(&mut self, buf: &mut B, count: u64) -> Result<UndoInfo, UndoError> {
        self.step_many(buf, count, Direction::Reverse)
    }

    /// Redoes up to `count` steps along the main line.
    pub fn redo<B: UndoBuffer>(&mut self, buf: &mut B, count: u64) -> Result<UndoInfo, UndoError> {
        self.step_many(buf, count, Direction::Apply)
    }

    fn step_many<B: UndoBuffer>(
        &mut self,
        buf: &mut B,
        count: u64,
        direction: Direction,
    ) -> Result<UndoInfo, UndoError> {
        self.check_allowed(buf)?;
        if !self.synced {
            self.sync(buf, false);
        }
        let mut info = UndoInfo::default();
        for i in 0..count.max(1) {
            if i > 0 && self.cancel_requested() {
                info.cancelled = true;
                break;
            }
            let stepped = match direction {
                Direction::Reverse => self.undo_step(buf)?,
                Direction::Apply => self.redo_step(buf)?,
            };
            match stepped {
                Some(stats) => {
                    info.steps += 1;
                    info.lines_added += stats.lines_added;
                    info.lines_removed += stats.lines_removed;
                }
                None => {
                    info.end = Some(match direction {
                        Direction::Reverse => SeekEnd::AlreadyAtOldest,
                        Direction::Apply => SeekEnd::AlreadyAtNewest,
                    });
                    break;
                }
            }
        }
        info.at_seq = self.seq_cur;
        Ok(info)
    }

    fn undo_step<B: UndoBuffer>(&mut self, buf: &mut B) -> Result<Option<ReplayStats>, UndoError> {
        let Some(seq) = self.position() else {
            return Ok(None);
        };
        let stats = self.replay(buf, seq, Direction::Reverse)?;
        self.current = Some(seq);
        let parent = self.hdr(seq).prev;
        self.seq_cur = parent.map_or(0, |p| self.hdr(p).seq);
        self.time_cur = parent.map_or(0, |p| self.hdr(p).time);
        let save_nr = self.hdr(seq).save_number;
        if save_nr != 0 {
            self.save_nr_cur = save_nr - 1;
        }
        Ok(Some(stats))
    }

    fn redo_step<B: UndoBuffer>(&mut self, buf: &mut B) -> Result<Option<ReplayStats>, UndoError> {
        let Some(seq) = self.current else {
            return Ok(None);
        };
        let stats = self.replay(buf, seq, Direction::Apply)?;
        let (next, time, save_nr) = {
            let h = self.hdr(seq);
            (h.next, h.time, h.save_number)
        };
        self.seq_cur = seq;
        self.time_cur = time;
        if save_nr != 0 {
            self.save_nr_cur = save_nr;
        }
        self.current = next;
        Ok(Some(stats))
    }

    pub(crate) fn replay<B: UndoBuffer>(
        &mut self,
        buf: &mut B,
        seq: Seq,
        direction: Direction,
    ) -> Result<ReplayStats, UndoError> {
        let mut header = self.headers.remove(&seq).ok_or(UndoError::NotFound)?;
        let result = replay_header(&mut header, buf, direction);
        self.headers.insert(seq, header);
        result
    }

    // ── Branch discard ───────────────────────────────────────────────

    /// Performs one undo step, then permanently discards the just-undone
    /// header together with everything that descended from it. The next
    /// alternate branch (if any) takes over the preferred slot so redo
    /// continues there. Returns false when nothing could be undone.
    pub fn forget_current_branch<B: UndoBuffer>(&mut self, buf: &mut B) -> Result<bool, UndoError> {
        if self.undo_step(buf)?.is_none() {
            return Ok(false);
        }
        let Some(forgotten) = self.current else {
            return Ok(false);
        };
        let (parent, alt_prev, alt_next) = {
            let h = self.hdr(forgotten);
            (h.prev, h.alt_prev, h.alt_next)
        };
        if let Some(n) = alt_next {
            self.hdr_mut(n).alt_prev = alt_prev;
        }
        match alt_prev {
            Some(p) => self.hdr_mut(p).alt_next = alt_next,
            None => match parent {
                Some(p) => self.hdr_mut(p).next = alt_next,
                None => self.oldest = alt_next,
            },
        }
        self.current = alt_next;
        self.free_branch(forgotten);
        self.newest = match parent {
            Some(p) => Some(self.leaf_from(p)),
            None => self.oldest.map(|r| self.leaf_from(r)),
        };
        Ok(true)
    }

    /// Undoes `count` steps, discarding each undone change for good
    /// ("undo and forget"). Returns false when nothing was undone.
    pub fn undo_and_forget<B: UndoBuffer>(
        &mut self,
        buf: &mut B,
        count: u64,
    ) -> Result<bool, UndoError> {
        self.check_allowed(buf)?;
        let mut count = count.max(1);
        if !self.synced {
            self.sync(buf, true);
            count = 1;
        }
        let mut done = 0;
        for i in 0..count {
            if i > 0 && self.cancel_requested() {
                break;
            }
            if !self.forget_current_branch(buf)? {
                break;
            }
            done += 1;
        }
        Ok(done > 0)
    }

    // ── Time travel ──────────────────────────────────────────────────

    /// Moves to another point in history. `step` is interpreted according
    /// to the flags: a relative change count by default, seconds when
    /// `seconds` is set, file writes when `file_writes` is set, or an
    /// absolute sequence number when `absolute` is set.
    pub fn undo_time<B: UndoBuffer>(
        &mut self,
        buf: &mut B,
        step: i64,
        seconds: bool,
        file_writes: bool,
        absolute: bool,
    ) -> Result<UndoInfo, UndoError> {
        self.check_allowed(buf)?;
        if !self.synced {
            self.sync(buf, false);
        }
        travel::seek(self, buf, step, seconds, file_writes, absolute)
    }

    // ── File writes and the saved line ───────────────────────────────

    /// Records that the buffer was just written to its file: bumps the
    /// write counter and stamps the header at the current position, which
    /// is what file-write navigation counts.
    pub fn note_file_write(&mut self) {
        self.save_nr_last += 1;
        self.save_nr_cur = self.save_nr_last;
        if let Some(pos) = self.position() {
            let nr = self.save_nr_last;
            self.hdr_mut(pos).save_number = nr;
        }
    }

    /// Snapshots one line (with the cursor column) for the single-line
    /// restore operation. Saving the same line twice keeps the first
    /// snapshot.
    pub fn save_line<B: UndoBuffer>(&mut self, buf: &B, lnum: u64) {
        if lnum < 1 || lnum > buf.line_count() {
            return;
        }
        if let Some(saved) = &self.saved_line {
            if saved.lnum == lnum {
                return;
            }
        }
        self.saved_line = Some(SavedLine {
            text: buf.line(lnum),
            lnum,
            col: buf.cursor().col,
        });
    }

    /// Swaps the saved line back into the buffer. Because the replaced
    /// text becomes the new snapshot, calling this twice round-trips.
    ///
    /// # Errors
    ///
    /// [`UndoError::NotFound`] when no line is saved;
    /// [`UndoError::RangeError`] when the saved line number no longer
    /// exists in the buffer.
    pub fn restore_line<B: UndoBuffer>(&mut self, buf: &mut B) -> Result<(), UndoError> {
        let Some(saved) = self.saved_line.clone() else {
            return Err(UndoError::NotFound);
        };
        if saved.lnum < 1 || saved.lnum > buf.line_count() {
            return Err(UndoError::RangeError {
                top: saved.lnum,
                bot: saved.lnum + 1,
                line_count: buf.line_count(),
            });
        }
        self.sync(buf, false);
        self.open_save_point(buf, saved.lnum - 1, saved.lnum + 1, saved.lnum + 1)?;
        let mut replaced = buf.delete_lines(saved.lnum, 1);
        buf.insert_lines(saved.lnum - 1, std::slice::from_ref(&saved.text));
        buf.lines_changed(saved.lnum, saved.lnum);
        buf.set_modified(true);
        buf.set_cursor(CursorSnapshot {
            lnum: saved.lnum,
            col: saved.col,
            coladd: 0,
            vcol: -1,
        });
        self.saved_line = Some(SavedLine {
            text: replaced.pop().unwrap_or_default(),
            lnum: saved.lnum,
            col: saved.col,
        });
        self.sync(buf, false);
        Ok(())
    }

    /// Drops the whole tree, for example when the buffer is reloaded from
    /// disk and history no longer matches. Sequence numbers stay
    /// monotonic across the clear.
    pub fn clear(&mut self) {
        self.headers.clear();
        self.oldest = None;
        self.newest = None;
        self.current = None;
        self.synced = true;
        self.seq_cur = 0;
        self.time_cur = 0;
        self.save_nr_cur = 0;
        self.saved_line = None;
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Lists the leaves of the tree (headers with no child), ordered by
    /// sequence number.
    pub fn list_undo_leaves(&self) -> Vec<UndoLeaf> {
        let mut leaves: Vec<UndoLeaf> = self
            .headers
            .values()
            .filter(|h| h.next.is_none())
            .map(|h| {
                let mut depth = 1;
                let mut p = h.prev;
                while let Some(pp) = p {
                    depth += 1;
                    p = self.hdr(pp).prev;
                }
                UndoLeaf {
                    seq: h.seq,
                    changes_since_root: depth,
                    time: h.time,
                    save_number: (h.save_number != 0).then_some(h.save_number),
                }
            })
            .collect();
        leaves.sort_by_key(|l| l.seq);
        leaves
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Writes the tree to an undo file. With `path == None` the
    /// destination is resolved from the configured directory list and the
    /// buffer's file path. Returns the path written.
    ///
    /// # Errors
    ///
    /// [`UndoError::NotAllowed`] when no destination can be resolved or
    /// the destination exists and is not an undo file (unless `force`);
    /// [`UndoError::WriteFailed`] on I/O failure, in which case the
    /// partial file has been removed.
    pub fn write_undo_file<B: UndoBuffer>(
        &mut self,
        buf: &B,
        path: Option<&Path>,
        force: bool,
    ) -> Result<PathBuf, UndoError> {
        self.fixup_pending_bot(buf.line_count());
        let dest = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let file = buf
                    .file_path()
                    .ok_or(UndoError::NotAllowed("buffer has no file name"))?;
                self.config
                    .undo_file_for_write(file)
                    .ok_or(UndoError::NotAllowed("no usable undo directory"))?
            }
        };
        undofile::write(self, buf, &dest, force)?;
        Ok(dest)
    }

    /// Loads an undo file, replacing the in-memory tree only when the
    /// whole file validates and its content hash matches the buffer.
    ///
    /// # Errors
    ///
    /// [`UndoError::NotFound`] when no file can be resolved;
    /// [`UndoError::CorruptFile`] / [`UndoError::HashMismatch`] /
    /// [`UndoError::ReadFailed`] per the failure, with the previous
    /// in-memory state preserved unchanged.
    pub fn read_undo_file<B: UndoBuffer>(
        &mut self,
        buf: &B,
        path: Option<&Path>,
    ) -> Result<(), UndoError> {
        let src = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let file = buf.file_path().ok_or(UndoError::NotFound)?;
                self.config
                    .undo_file_for_read(file)
                    .ok_or(UndoError::NotFound)?
            }
        };
        undofile::read_into(self, buf, &src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::VecBuffer;
    use crate::config::UndoConfig;

    fn small_config() -> UndoConfig {
        UndoConfig {
            undo_levels: 100,
            undo_dirs: vec![],
        }
    }

    /// Replaces lines `first..=last` with `new_lines`, recording a save
    /// point first, the way an editing command would.
    fn edit(tree: &mut UndoTree, buf: &mut VecBuffer, first: u64, last: u64, new_lines: &[&str]) {
        tree.open_save_point(buf, first - 1, last + 1, first - 1 + new_lines.len() as u64 + 1)
            .expect("save point");
        buf.delete_lines(first, last - first + 1);
        let lines: Vec<String> = new_lines.iter().map(|s| s.to_string()).collect();
        buf.insert_lines(first - 1, &lines);
        buf.set_modified(true);
        tree.sync(buf, false);
    }

    #[test]
    fn test_undo_redo_roundtrip() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["a", "b", "c"]);

        edit(&mut tree, &mut buf, 2, 2, &["x"]);
        assert_eq!(buf.lines(), &["a", "x", "c"]);

        let info = tree.undo(&mut buf, 1).expect("undo");
        assert_eq!(info.steps, 1);
        assert_eq!(buf.lines(), &["a", "b", "c"]);

        let info = tree.redo(&mut buf, 1).expect("redo");
        assert_eq!(info.steps, 1);
        assert_eq!(buf.lines(), &["a", "x", "c"]);
    }

    #[test]
    fn test_undo_past_oldest_reports_end() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["a"]);
        edit(&mut tree, &mut buf, 1, 1, &["b"]);

        let info = tree.undo(&mut buf, 5).expect("undo");
        assert_eq!(info.steps, 1);
        assert_eq!(info.end, Some(SeekEnd::AlreadyAtOldest));
        assert_eq!(buf.lines(), &["a"]);
    }

    #[test]
    fn test_redo_at_tip_reports_end() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["a"]);
        edit(&mut tree, &mut buf, 1, 1, &["b"]);

        let info = tree.redo(&mut buf, 1).expect("redo");
        assert_eq!(info.steps, 0);
        assert_eq!(info.end, Some(SeekEnd::AlreadyAtNewest));
    }

    #[test]
    fn test_sync_is_idempotent() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["a"]);
        edit(&mut tree, &mut buf, 1, 1, &["b"]);

        let count_before = tree.header_count();
        let current_before = tree.current;
        tree.sync(&buf, false);
        tree.sync(&buf, false);
        assert_eq!(tree.header_count(), count_before);
        assert_eq!(tree.current, current_before);
        assert!(tree.is_synced());
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let mut tree = UndoTree::new(UndoConfig {
            undo_levels: 3,
            undo_dirs: vec![],
        });
        let mut buf = VecBuffer::new(&["0"]);
        for i in 1..=10 {
            edit(&mut tree, &mut buf, 1, 1, &[&i.to_string()]);
        }
        assert!(tree.header_count() <= 3);
        assert_eq!(tree.newest.map(|s| tree.hdr(s).seq), Some(10));
        // Only three undos are possible now.
        let info = tree.undo(&mut buf, 10).expect("undo");
        assert_eq!(info.steps, 3);
        assert_eq!(buf.lines(), &["7"]);
    }

    #[test]
    fn test_undo_levels_negative_disables_recording() {
        let mut tree = UndoTree::new(UndoConfig {
            undo_levels: -1,
            undo_dirs: vec![],
        });
        let buf = VecBuffer::new(&["a"]);
        tree.open_save_point(&buf, 0, 2, 2).expect("save point");
        assert_eq!(tree.header_count(), 0);
    }

    #[test]
    fn test_not_allowed_on_readonly_buffer() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["a"]);
        buf.set_modifiable(false);
        let err = tree.open_save_point(&buf, 0, 2, 2).unwrap_err();
        assert!(matches!(err, UndoError::NotAllowed(_)));
    }

    #[test]
    fn test_not_allowed_in_sandbox_and_textlock() {
        let mut tree = UndoTree::new(small_config());
        let buf = VecBuffer::new(&["a"]);
        tree.set_sandbox(true);
        assert!(matches!(
            tree.open_save_point(&buf, 0, 2, 2),
            Err(UndoError::NotAllowed(_))
        ));
        tree.set_sandbox(false);
        tree.set_text_locked(true);
        assert!(matches!(
            tree.open_save_point(&buf, 0, 2, 2),
            Err(UndoError::NotAllowed(_))
        ));
    }

    #[test]
    fn test_range_error_on_bad_bounds() {
        let mut tree = UndoTree::new(small_config());
        let buf = VecBuffer::new(&["a"]);
        assert!(matches!(
            tree.open_save_point(&buf, 5, 7, 0),
            Err(UndoError::RangeError { .. })
        ));
        assert!(matches!(
            tree.open_save_point(&buf, 1, 1, 0),
            Err(UndoError::RangeError { .. })
        ));
    }

    #[test]
    fn test_single_line_merge_keeps_one_entry() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["hello"]);

        // Character-at-a-time edits of the same line, no sync in between.
        for text in ["hellox", "helloxy", "helloxyz"] {
            tree.open_save_point(&buf, 0, 2, 2).expect("save point");
            buf.delete_lines(1, 1);
            buf.insert_lines(0, &[text.to_string()]);
            buf.set_modified(true);
        }
        tree.sync(&buf, false);

        assert_eq!(tree.header_count(), 1);
        let head = tree.newest.expect("open header");
        assert_eq!(tree.hdr(head).entries.len(), 1);
        assert_eq!(tree.hdr(head).entries[0].lines, vec!["hello".to_string()]);

        tree.undo(&mut buf, 1).expect("undo");
        assert_eq!(buf.lines(), &["hello"]);
        tree.redo(&mut buf, 1).expect("redo");
        assert_eq!(buf.lines(), &["helloxyz"]);
    }

    #[test]
    fn test_mark_unsynced_joins_next_change() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["a", "b"]);
        edit(&mut tree, &mut buf, 1, 1, &["A"]);

        tree.mark_unsynced();
        // This edit joins the previous undo step.
        tree.open_save_point(&buf, 1, 3, 3).expect("save point");
        buf.delete_lines(2, 1);
        buf.insert_lines(1, &["B".to_string()]);
        tree.sync(&buf, false);

        assert_eq!(tree.header_count(), 1);
        tree.undo(&mut buf, 1).expect("undo");
        assert_eq!(buf.lines(), &["a", "b"]);
    }

    #[test]
    fn test_mark_unsynced_after_undo_is_ignored() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["base"]);
        edit(&mut tree, &mut buf, 1, 1, &["one"]);
        edit(&mut tree, &mut buf, 1, 1, &["two"]);

        tree.undo(&mut buf, 1).expect("undo");
        assert_eq!(buf.lines(), &["one"]);

        // A join request while a redo position exists must not reopen the
        // undone header; the next undo keeps moving toward the root.
        tree.mark_unsynced();
        assert!(tree.is_synced());
        tree.undo(&mut buf, 1).expect("undo");
        assert_eq!(buf.lines(), &["base"]);

        tree.redo(&mut buf, 2).expect("redo");
        assert_eq!(buf.lines(), &["two"]);
    }

    #[test]
    fn test_mark_unsynced_without_history_is_ignored() {
        let mut tree = UndoTree::new(small_config());
        tree.mark_unsynced();
        assert!(tree.is_synced());
    }

    #[test]
    fn test_alternate_branch_created_after_undo_and_edit() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["base"]);
        edit(&mut tree, &mut buf, 1, 1, &["one"]);
        edit(&mut tree, &mut buf, 1, 1, &["two"]);

        tree.undo(&mut buf, 2).expect("undo");
        assert_eq!(buf.lines(), &["base"]);

        // A new edit from the undone position starts an alternate branch.
        edit(&mut tree, &mut buf, 1, 1, &["three"]);
        assert_eq!(buf.lines(), &["three"]);
        assert_eq!(tree.header_count(), 3);

        let root = tree.oldest.expect("root");
        assert_eq!(tree.hdr(root).seq, 3);
        // The displaced branch hangs off the new root's sibling chain.
        let displaced = tree.hdr(root).alt_next.expect("alternate branch");
        assert_eq!(tree.hdr(displaced).seq, 1);
    }

    #[test]
    fn test_forget_current_branch() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["base"]);
        edit(&mut tree, &mut buf, 1, 1, &["one"]);
        edit(&mut tree, &mut buf, 1, 1, &["two"]);

        let forgot = tree.undo_and_forget(&mut buf, 1).expect("forget");
        assert!(forgot);
        assert_eq!(buf.lines(), &["one"]);
        assert_eq!(tree.header_count(), 1);
        assert!(!tree.can_redo());
        // A plain undo still works on the surviving header.
        tree.undo(&mut buf, 1).expect("undo");
        assert_eq!(buf.lines(), &["base"]);
    }

    #[test]
    fn test_forget_with_nothing_undone() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["a"]);
        assert!(!tree.undo_and_forget(&mut buf, 1).expect("forget"));
    }

    #[test]
    fn test_saved_line_roundtrip() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["alpha", "beta"]);

        tree.save_line(&buf, 2);
        buf.delete_lines(2, 1);
        buf.insert_lines(1, &["BETA".to_string()]);

        tree.restore_line(&mut buf).expect("restore");
        assert_eq!(buf.lines(), &["alpha", "beta"]);
        tree.restore_line(&mut buf).expect("restore again");
        assert_eq!(buf.lines(), &["alpha", "BETA"]);
    }

    #[test]
    fn test_restore_line_without_snapshot() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["a"]);
        assert!(matches!(
            tree.restore_line(&mut buf),
            Err(UndoError::NotFound)
        ));
    }

    #[test]
    fn test_note_file_write_stamps_position() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["a"]);
        edit(&mut tree, &mut buf, 1, 1, &["b"]);

        tree.note_file_write();
        let pos = tree.position().expect("position");
        assert_eq!(tree.hdr(pos).save_number, 1);
        assert_eq!(tree.save_nr_last, 1);

        let leaves = tree.list_undo_leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].save_number, Some(1));
    }

    #[test]
    fn test_list_undo_leaves_counts_branches() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["base"]);
        edit(&mut tree, &mut buf, 1, 1, &["one"]);
        edit(&mut tree, &mut buf, 1, 1, &["two"]);
        tree.undo(&mut buf, 1).expect("undo");
        edit(&mut tree, &mut buf, 1, 1, &["three"]);

        let leaves = tree.list_undo_leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].seq, 2);
        assert_eq!(leaves[0].changes_since_root, 2);
        assert_eq!(leaves[1].seq, 3);
        assert_eq!(leaves[1].changes_since_root, 2);
    }

    #[test]
    fn test_clear_keeps_sequence_monotonic() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["a"]);
        edit(&mut tree, &mut buf, 1, 1, &["b"]);
        let last = tree.last_sequence();

        tree.clear();
        assert_eq!(tree.header_count(), 0);
        assert_eq!(tree.current_sequence(), 0);

        edit(&mut tree, &mut buf, 1, 1, &["c"]);
        assert!(tree.last_sequence() > last);
    }

    #[test]
    fn test_cancel_stops_multi_step_walk() {
        let mut tree = UndoTree::new(small_config());
        let mut buf = VecBuffer::new(&["0"]);
        for i in 1..=5 {
            edit(&mut tree, &mut buf, 1, 1, &[&i.to_string()]);
        }
        tree.set_cancel_check(Some(Box::new(|| true)));
        let info = tree.undo(&mut buf, 5).expect("undo");
        // The first header replays; cancellation is honored between
        // headers only.
        assert_eq!(info.steps, 1);
        assert!(info.cancelled);
        assert_eq!(buf.lines(), &["4"]);
    }
}
