/// Persistent, branching undo for line-based text buffers.
///
/// Provides an `UndoTree` that records every change as a node in a tree
/// (undone-then-replaced states survive as alternate branches), replays
/// changes in either direction by swapping line ranges against the live
/// buffer, navigates history by steps, sequence number, wall-clock time
/// or file writes, and round-trips the whole tree through a versioned
/// binary undo file bound to the buffer content by hash.
pub mod buffer;
pub mod config;
pub mod error;
pub mod replay;
pub mod travel;
pub mod tree;
pub mod types;
pub mod undofile;

pub use buffer::{UndoBuffer, VecBuffer};
pub use config::{munge_file_name, resolve_undo_dirs, UndoConfig};
pub use error::{SeekEnd, UndoError, UndoInfo};
pub use replay::{Direction, ReplayStats};
pub use tree::{UndoLeaf, UndoTree};
pub use types::{
    ChangeEntry, CursorSnapshot, HeaderFlags, MarkPos, SavedLine, Seq, UndoHeader,
    VisualSelection, NUM_NAMED_MARKS,
};
