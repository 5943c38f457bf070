/// Error taxonomy for the undo engine.
///
/// Every public operation on [`crate::tree::UndoTree`] reports failures
/// through `UndoError`. Navigation hitting the end of history is not an
/// error; it is reported as a [`SeekEnd`] inside a successful result.
use thiserror::Error;

/// Errors surfaced at the undo-tree boundary.
#[derive(Debug, Error)]
pub enum UndoError {
    /// Policy refusal: the operation may not record or replay history
    /// right now. The buffer is left untouched.
    #[error("undo not allowed: {0}")]
    NotAllowed(&'static str),

    /// A header's recorded line bounds no longer match the live buffer.
    /// This signals that the undo chain and the buffer have desynchronized
    /// (for example after an external reload) and aborts the operation.
    #[error("undo line range out of sync with buffer (top {top}, bot {bot}, buffer has {line_count} lines)")]
    RangeError { top: u64, bot: u64, line_count: u64 },

    /// The undo file failed structural validation while reading. The
    /// in-memory tree is left unchanged.
    #[error("corrupt undo file: {0}")]
    CorruptFile(String),

    /// The undo file's content hash does not match the live buffer. The
    /// file was probably written for an older version of the text; it is
    /// simply not loaded.
    #[error("undo file does not match buffer contents")]
    HashMismatch,

    /// I/O failure while writing the undo file. The destination file is
    /// removed rather than left half-written.
    #[error("failed to write undo file")]
    WriteFailed(#[source] std::io::Error),

    /// I/O failure while opening or reading the undo file.
    #[error("failed to read undo file")]
    ReadFailed(#[source] std::io::Error),

    /// The requested undo state does not exist (for example an absolute
    /// sequence number that was evicted, or no saved line to restore).
    #[error("no undo state found for the requested target")]
    NotFound,
}

/// End-of-history conditions met while navigating.
///
/// These are user-visible, recoverable outcomes, not errors: the tree is
/// left at the last position that could be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekEnd {
    /// Tried to undo past the oldest recorded change.
    AlreadyAtOldest,
    /// Tried to redo past the newest recorded change.
    AlreadyAtNewest,
}

/// Summary of a completed undo/redo/seek operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct UndoInfo {
    /// Number of headers actually replayed.
    pub steps: u64,
    /// Total lines inserted into the buffer across all replayed headers.
    pub lines_added: u64,
    /// Total lines removed from the buffer across all replayed headers.
    pub lines_removed: u64,
    /// Sequence number of the position after the operation (0 = before
    /// the first recorded change).
    pub at_seq: u64,
    /// Set when navigation stopped because history was exhausted.
    pub end: Option<SeekEnd>,
    /// True when a multi-step walk stopped early at the caller's request.
    pub cancelled: bool,
}
