/// Named marks (`'a'` through `'z'`) for a document.
///
/// Marks live outside the text, so edits that change the line count have
/// to shift them; the undo engine drives that through
/// [`MarkFile::adjust_for_edit`] and snapshots/restores the whole set
/// when replaying history.
use chronopad_mod_undo::{MarkPos, NUM_NAMED_MARKS};

/// The 26 named marks of one document.
#[derive(Debug, Clone, Default)]
pub struct MarkFile {
    marks: [MarkPos; NUM_NAMED_MARKS],
}

fn index_of(name: char) -> Option<usize> {
    name.is_ascii_lowercase().then(|| name as usize - 'a' as usize)
}

impl MarkFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places mark `name` at the given position. Names outside `a..=z`
    /// are ignored.
    pub fn set(&mut self, name: char, pos: MarkPos) {
        if let Some(i) = index_of(name) {
            self.marks[i] = pos;
        }
    }

    /// Looks up mark `name`; `None` when it was never placed.
    pub fn get(&self, name: char) -> Option<MarkPos> {
        let i = index_of(name)?;
        (self.marks[i].lnum != 0).then_some(self.marks[i])
    }

    /// Removes mark `name`.
    pub fn unset(&mut self, name: char) {
        if let Some(i) = index_of(name) {
            self.marks[i] = MarkPos::default();
        }
    }

    /// Removes all marks.
    pub fn clear(&mut self) {
        self.marks = [MarkPos::default(); NUM_NAMED_MARKS];
    }

    /// The raw mark array, in the order the undo engine snapshots it.
    pub fn snapshot(&self) -> [MarkPos; NUM_NAMED_MARKS] {
        self.marks
    }

    /// Replaces the whole mark set from a snapshot.
    pub fn restore(&mut self, marks: [MarkPos; NUM_NAMED_MARKS]) {
        self.marks = marks;
    }

    /// Shifts marks after the region `(top, old_bot)` (exclusive bounds)
    /// by `delta` lines. Marks inside a shrinking region are clamped to
    /// the line above it rather than dropped, so they survive an undo of
    /// a big deletion.
    pub fn adjust_for_edit(&mut self, top: u64, old_bot: u64, delta: i64) {
        for mark in self.marks.iter_mut() {
            if mark.lnum == 0 {
                continue;
            }
            if mark.lnum >= old_bot {
                mark.lnum = mark.lnum.saturating_add_signed(delta);
            } else if mark.lnum > top && delta < 0 {
                let new_bot = old_bot.saturating_add_signed(delta);
                if mark.lnum >= new_bot {
                    mark.lnum = (top + 1).min(new_bot.saturating_sub(1).max(1));
                    mark.col = 0;
                }
            }
        }
    }
}
