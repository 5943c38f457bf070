/// Core document model for chronopad.
///
/// Ties a rope-backed line buffer, cursor, named marks and the branching
/// undo engine together into a `Document` that records every change
/// before it happens and can walk its whole edit history, including
/// across sessions via undo files.
pub mod buffer;
pub mod document;
pub mod marks;

pub use buffer::LineBuffer;
pub use document::{Document, EditorState};
pub use marks::MarkFile;
