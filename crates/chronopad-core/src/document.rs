/// Document model combining buffer, cursor, marks and branching undo.
///
/// A `Document` ties an [`EditorState`] (the live buffer plus the editor
/// state the undo engine snapshots) to its [`UndoTree`]. The two are
/// separate fields because replay mutates the state while the tree
/// drives it. All line-level editing goes through the document so every
/// change is recorded before it happens.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chronopad_mod_undo::{
    CursorSnapshot, MarkPos, UndoBuffer, UndoConfig, UndoInfo, UndoLeaf, UndoTree,
    VisualSelection, NUM_NAMED_MARKS,
};

use crate::buffer::LineBuffer;
use crate::marks::MarkFile;

/// The live editor state of one document: everything the undo engine
/// reads, swaps or notifies.
#[derive(Debug, Default)]
pub struct EditorState {
    pub buffer: LineBuffer,
    pub cursor: CursorSnapshot,
    pub marks: MarkFile,
    pub visual: VisualSelection,
    pub modified: bool,
    pub modifiable: bool,
    pub file_path: Option<PathBuf>,
    /// Line range a frontend should redraw, widened by every change
    /// until it is taken.
    damage: Option<(u64, u64)>,
}

impl EditorState {
    /// Takes and clears the accumulated redraw range.
    pub fn take_damage(&mut self) -> Option<(u64, u64)> {
        self.damage.take()
    }
}

impl UndoBuffer for EditorState {
    fn line_count(&self) -> u64 {
        self.buffer.line_count()
    }

    fn line(&self, lnum: u64) -> String {
        self.buffer.line(lnum)
    }

    fn insert_lines(&mut self, after: u64, lines: &[String]) {
        self.buffer.insert_lines(after, lines);
    }

    fn delete_lines(&mut self, first: u64, count: u64) -> Vec<String> {
        self.buffer.delete_lines(first, count)
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

    fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    fn cursor(&self) -> CursorSnapshot {
        self.cursor
    }

    fn set_cursor(&mut self, cursor: CursorSnapshot) {
        self.cursor = cursor;
    }

    fn named_marks(&self) -> [MarkPos; NUM_NAMED_MARKS] {
        self.marks.snapshot()
    }

    fn set_named_marks(&mut self, marks: [MarkPos; NUM_NAMED_MARKS]) {
        self.marks.restore(marks);
    }

    fn visual(&self) -> VisualSelection {
        self.visual
    }

    fn set_visual(&mut self, visual: VisualSelection) {
        self.visual = visual;
    }

    fn adjust_marks(&mut self, top: u64, old_bot: u64, delta: i64) {
        self.marks.adjust_for_edit(top, old_bot, delta);
    }

    fn lines_changed(&mut self, first: u64, last: u64) {
        self.damage = Some(match self.damage {
            Some((lo, hi)) => (lo.min(first), hi.max(last)),
            None => (first, last),
        });
    }
}

/// A single document with its buffer, editor state and undo history.
pub struct Document {
    pub state: EditorState,
    pub undo: UndoTree,
}

impl Document {
    /// Creates a document from initial text, with no backing file.
    pub fn from_text(text: &str) -> Self {
        Self::with_config(text, None, UndoConfig::default())
    }

    pub fn with_config(text: &str, file_path: Option<PathBuf>, config: UndoConfig) -> Self {
        Self {
            state: EditorState {
                buffer: LineBuffer::from(text),
                cursor: CursorSnapshot::default(),
                marks: MarkFile::new(),
                visual: VisualSelection::default(),
                modified: false,
                modifiable: true,
                file_path,
                damage: None,
            },
            undo: UndoTree::new(config),
        }
    }

    pub fn line_count(&self) -> u64 {
        self.state.buffer.line_count()
    }

    pub fn lines(&self) -> Vec<String> {
        self.state.buffer.lines()
    }

    // ── Editing ──────────────────────────────────────────────────────

    /// Replaces lines `first..=last` with `lines`, as one undo step.
    ///
    /// # Errors
    ///
    /// Fails when the range does not fit the buffer or undo recording is
    /// refused; the buffer is left untouched then.
    pub fn replace_lines(&mut self, first: u64, last: u64, lines: &[String]) -> Result<()> {
        if first < 1 || last < first {
            anyhow::bail!("invalid line range {first}..={last}");
        }
        let new_bot = first - 1 + lines.len() as u64 + 1;
        self.undo
            .open_save_point(&self.state, first - 1, last + 1, new_bot)
            .context("recording undo state for replace")?;
        self.state.buffer.delete_lines(first, last - first + 1);
        self.state.buffer.insert_lines(first - 1, lines);
        self.after_change(first, first + lines.len() as u64);
        self.undo.sync(&self.state, false);
        Ok(())
    }

    /// Inserts `lines` after line `after` (0 inserts at the top), as one
    /// undo step.
    ///
    /// # Errors
    ///
    /// Fails when `after` is past the end or undo recording is refused.
    pub fn insert_lines(&mut self, after: u64, lines: &[String]) -> Result<()> {
        self.undo
            .open_save_point(&self.state, after, after + 1, after + lines.len() as u64 + 1)
            .context("recording undo state for insert")?;
        self.state.buffer.insert_lines(after, lines);
        self.after_change(after + 1, after + lines.len() as u64);
        self.undo.sync(&self.state, false);
        Ok(())
    }

    /// Deletes lines `first..=last`, as one undo step.
    ///
    /// # Errors
    ///
    /// Fails when the range does not fit the buffer or undo recording is
    /// refused.
    pub fn delete_lines(&mut self, first: u64, last: u64) -> Result<()> {
        if first < 1 || last < first {
            anyhow::bail!("invalid line range {first}..={last}");
        }
        self.undo
            .open_save_point(&self.state, first - 1, last + 1, first)
            .context("recording undo state for delete")?;
        self.state.buffer.delete_lines(first, last - first + 1);
        self.after_change(first, first);
        self.undo.sync(&self.state, false);
        Ok(())
    }

    /// Rewrites a single line without closing the undo step, so repeated
    /// calls (typing) collapse into one. Call [`Document::commit`] when
    /// the burst of edits ends.
    ///
    /// # Errors
    ///
    /// Fails when `lnum` is out of range or undo recording is refused.
    pub fn set_line(&mut self, lnum: u64, text: &str) -> Result<()> {
        if lnum < 1 {
            anyhow::bail!("invalid line number {lnum}");
        }
        self.undo
            .open_save_point(&self.state, lnum - 1, lnum + 1, lnum + 1)
            .context("recording undo state for line edit")?;
        self.state.buffer.delete_lines(lnum, 1);
        self.state.buffer.insert_lines(lnum - 1, &[text.to_string()]);
        self.after_change(lnum, lnum);
        Ok(())
    }

    /// Closes the open undo step; the next change starts a new one.
    pub fn commit(&mut self) {
        self.undo.sync(&self.state, false);
    }

    fn after_change(&mut self, first: u64, last: u64) {
        self.state.modified = true;
        self.state.lines_changed(first, last.max(first));
    }

    // ── History ──────────────────────────────────────────────────────

    /// Undoes `count` steps.
    ///
    /// # Errors
    ///
    /// Fails when history and buffer have desynchronized or replay is
    /// refused by policy.
    pub fn undo(&mut self, count: u64) -> Result<UndoInfo> {
        self.undo
            .undo(&mut self.state, count)
            .context("undoing changes")
    }

    /// Redoes `count` steps along the preferred branch.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Document::undo`].
    pub fn redo(&mut self, count: u64) -> Result<UndoInfo> {
        self.undo
            .redo(&mut self.state, count)
            .context("redoing changes")
    }

    /// Moves through history by `step` units: relative changes by
    /// default, or seconds / file writes / an absolute sequence number
    /// per the flags.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Document::undo`].
    pub fn undo_time(
        &mut self,
        step: i64,
        seconds: bool,
        file_writes: bool,
        absolute: bool,
    ) -> Result<UndoInfo> {
        self.undo
            .undo_time(&mut self.state, step, seconds, file_writes, absolute)
            .context("travelling through undo history")
    }

    /// Undoes `count` steps and discards them for good.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Document::undo`].
    pub fn undo_and_forget(&mut self, count: u64) -> Result<bool> {
        self.undo
            .undo_and_forget(&mut self.state, count)
            .context("discarding undo history")
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    pub fn undo_leaves(&self) -> Vec<UndoLeaf> {
        self.undo.list_undo_leaves()
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Records a completed save of the buffer: clears the modified flag
    /// and stamps the current undo state as a file write.
    pub fn mark_saved(&mut self) {
        self.state.modified = false;
        self.undo.note_file_write();
    }

    /// Writes the undo history next to the document (or to `path`).
    /// Returns the path written.
    ///
    /// # Errors
    ///
    /// Fails when no destination can be resolved or on I/O failure.
    pub fn write_undo_file(&mut self, path: Option<&Path>, force: bool) -> Result<PathBuf> {
        let dest = self
            .undo
            .write_undo_file(&self.state, path, force)
            .context("writing undo file")?;
        tracing::info!(path = %dest.display(), "undo history written");
        Ok(dest)
    }

    /// Loads undo history for this document, replacing the in-memory
    /// tree when the file matches the buffer.
    ///
    /// # Errors
    ///
    /// Fails when no file is found, the file is corrupt, or it was
    /// written for different buffer content.
    pub fn read_undo_file(&mut self, path: Option<&Path>) -> Result<()> {
        self.undo
            .read_undo_file(&self.state, path)
            .context("reading undo file")
    }
}
