/// Navigation to an arbitrary point in history, across branches.
///
/// A seek resolves its target to a destination header, then walks the
/// tree in two phases: up (reversing headers) from the current position
/// to the deepest ancestor shared with the destination, then down
/// (applying headers) along the destination's ancestor path. Every child
/// taken on the way down is promoted to the front of its sibling chain,
/// so plain undo/redo afterward follows the path just travelled.
use crate::buffer::UndoBuffer;
use crate::error::{SeekEnd, UndoError, UndoInfo};
use crate::replay::Direction;
use crate::tree::UndoTree;
use crate::types::Seq;

/// Where a seek wants to end up, after unit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// The state right after this sequence number was applied.
    At(Seq),
    /// The state before any recorded change.
    BeforeAll,
}

/// Seeks to another point in history. `step` is a relative change count
/// by default, seconds when `seconds` is set, file writes when
/// `file_writes` is set, or an absolute sequence number when `absolute`
/// is set (0 meaning "before all changes").
pub(crate) fn seek<B: UndoBuffer>(
    tree: &mut UndoTree,
    buf: &mut B,
    step: i64,
    seconds: bool,
    file_writes: bool,
    absolute: bool,
) -> Result<UndoInfo, UndoError> {
    let here = tree.position().map_or(0, |p| tree.hdr(p).seq);
    let target = if absolute {
        if step <= 0 {
            Target::BeforeAll
        } else if !tree.headers.contains_key(&(step as Seq)) {
            // An explicitly named state must exist; it may have been
            // evicted.
            return Err(UndoError::NotFound);
        } else {
            Target::At(step as Seq)
        }
    } else if seconds {
        target_by_time(tree, step)
    } else if file_writes {
        target_by_write(tree, step)
    } else {
        let raw = here as i64 + step;
        if raw <= 0 {
            Target::BeforeAll
        } else {
            Target::At((raw as Seq).min(tree.last_sequence()))
        }
    };

    let moving_back = match target {
        Target::BeforeAll => true,
        Target::At(t) => t < here,
    };
    let dest = resolve(tree, target, moving_back);

    let mut info = UndoInfo::default();
    let dest_seq = match dest {
        Target::At(s) => Some(s),
        Target::BeforeAll => None,
    };
    let here_opt = tree.position();
    if dest_seq == here_opt.map(|p| tree.hdr(p).seq) {
        // Nothing to travel; report which end blocked the request.
        info.end = Some(if moving_back {
            SeekEnd::AlreadyAtOldest
        } else {
            SeekEnd::AlreadyAtNewest
        });
        info.at_seq = tree.current_sequence();
        return Ok(info);
    }

    // Mark the destination's ancestor path so the up phase knows where
    // to stop.
    tree.visit_gen += 1;
    let gen = tree.visit_gen;
    if let Some(d) = dest_seq {
        let mut walk = Some(d);
        while let Some(seq) = walk {
            let h = tree.hdr_mut(seq);
            h.visited = gen;
            walk = h.prev;
        }
    }

    let mut pos = tree.position();

    // Up phase: reverse headers until we stand on the destination's
    // ancestor path (or on the floor for a seek before all changes).
    while let Some(p) = pos {
        if dest_seq.is_some() && tree.hdr(p).visited == gen {
            break;
        }
        if info.steps > 0 && tree.cancel_requested() {
            info.cancelled = true;
            break;
        }
        let stats = tree.replay(buf, p, Direction::Reverse)?;
        info.steps += 1;
        info.lines_added += stats.lines_added;
        info.lines_removed += stats.lines_removed;
        let (prev, save_nr) = {
            let h = tree.hdr(p);
            (h.prev, h.save_number)
        };
        if save_nr != 0 {
            tree.save_nr_cur = save_nr - 1;
        }
        pos = prev;
    }

    // Down phase: apply marked children until the destination is the
    // position, promoting each one to the preferred slot.
    if !info.cancelled {
        while pos != dest_seq {
            let head = match pos {
                Some(p) => tree.hdr(p).next,
                None => tree.oldest,
            };
            let mut child = head;
            while let Some(c) = child {
                if tree.hdr(c).visited == gen {
                    break;
                }
                child = tree.hdr(c).alt_next;
            }
            let Some(c) = child else {
                // No marked child: the path was truncated under us.
                break;
            };
            if info.steps > 0 && tree.cancel_requested() {
                info.cancelled = true;
                break;
            }
            tree.promote_child(pos, c);
            let stats = tree.replay(buf, c, Direction::Apply)?;
            info.steps += 1;
            info.lines_added += stats.lines_added;
            info.lines_removed += stats.lines_removed;
            let save_nr = tree.hdr(c).save_number;
            if save_nr != 0 {
                tree.save_nr_cur = save_nr;
            }
            pos = Some(c);
        }
    }

    // Settle the position bookkeeping on wherever the walk ended.
    tree.current = match pos {
        Some(p) => tree.hdr(p).next,
        None => tree.oldest,
    };
    tree.newest = tree.oldest.map(|r| tree.leaf_from(r));
    tree.seq_cur = pos.map_or(0, |p| tree.hdr(p).seq);
    tree.time_cur = pos.map_or(0, |p| tree.hdr(p).time);
    info.at_seq = tree.seq_cur;
    Ok(info)
}

/// Resolves a target that may name an evicted or never-assigned sequence
/// number to the closest existing header without overshooting.
fn resolve(tree: &UndoTree, target: Target, moving_back: bool) -> Target {
    let Target::At(want) = target else {
        return Target::BeforeAll;
    };
    if tree.headers.contains_key(&want) {
        return Target::At(want);
    }
    if moving_back {
        match tree.headers.keys().filter(|&&s| s <= want).max() {
            Some(&s) => Target::At(s),
            None => Target::BeforeAll,
        }
    } else {
        match tree.headers.keys().filter(|&&s| s >= want).min() {
            Some(&s) => Target::At(s),
            // Past everything that exists: stop at the newest change.
            None => match tree.headers.keys().max() {
                Some(&s) => Target::At(s),
                None => Target::BeforeAll,
            },
        }
    }
}

/// Picks the header closest to "now plus `step` seconds" in the
/// requested direction.
fn target_by_time(tree: &UndoTree, step: i64) -> Target {
    let want = tree.time_cur as i64 + step;
    if step < 0 {
        tree.headers
            .values()
            .filter(|h| (h.time as i64) <= want)
            .max_by_key(|h| (h.time, h.seq))
            .map_or(Target::BeforeAll, |h| Target::At(h.seq))
    } else {
        tree.headers
            .values()
            .filter(|h| (h.time as i64) >= want)
            .min_by_key(|h| (h.time, h.seq))
            .or_else(|| tree.headers.values().max_by_key(|h| h.seq))
            .map_or(Target::BeforeAll, |h| Target::At(h.seq))
    }
}

/// Picks the header stamped by the file write closest to "the current
/// write plus `step`" in the requested direction.
fn target_by_write(tree: &UndoTree, step: i64) -> Target {
    let want = tree.save_nr_cur as i64 + step;
    if step < 0 {
        if want <= 0 {
            return Target::BeforeAll;
        }
        tree.headers
            .values()
            .filter(|h| h.save_number != 0 && (h.save_number as i64) <= want)
            .max_by_key(|h| h.save_number)
            .map_or(Target::BeforeAll, |h| Target::At(h.seq))
    } else {
        tree.headers
            .values()
            .filter(|h| h.save_number != 0 && (h.save_number as i64) >= want)
            .min_by_key(|h| h.save_number)
            .or_else(|| tree.headers.values().max_by_key(|h| h.seq))
            .map_or(Target::BeforeAll, |h| Target::At(h.seq))
    }
}
