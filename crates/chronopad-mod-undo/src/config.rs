/// Configuration for the undo engine: history depth and undo-file storage.
use std::path::{Path, PathBuf};

/// Default number of undo steps retained per buffer.
const DEFAULT_UNDO_LEVELS: i64 = 1000;

/// Configuration for a buffer's undo tree.
#[derive(Debug, Clone)]
pub struct UndoConfig {
    /// Retained history depth. When the tree grows beyond this many
    /// headers the oldest are evicted. Negative disables recording
    /// entirely; 0 keeps only the most recent change.
    pub undo_levels: i64,
    /// Ordered candidate directories for undo files. `"."` means "next to
    /// the edited file". The first existing directory wins for writing;
    /// the first existing file wins for reading.
    pub undo_dirs: Vec<PathBuf>,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            undo_levels: DEFAULT_UNDO_LEVELS,
            undo_dirs: resolve_undo_dirs(),
        }
    }
}

/// Resolves the undo-file directory list.
///
/// Resolution order:
/// 1. `CHRONOPAD_UNDO_DIR` environment variable (single directory)
/// 2. `"."` (next to the edited file), then the per-user data directory
pub fn resolve_undo_dirs() -> Vec<PathBuf> {
    resolve_undo_dirs_from(std::env::var_os("CHRONOPAD_UNDO_DIR"))
}

/// The lookup itself, with the environment override passed in so tests
/// never touch process-global state.
fn resolve_undo_dirs_from(override_dir: Option<std::ffi::OsString>) -> Vec<PathBuf> {
    if let Some(dir) = override_dir {
        return vec![PathBuf::from(dir)];
    }
    let mut dirs = vec![PathBuf::from(".")];
    if let Some(data) = dirs::data_local_dir() {
        dirs.push(data.join("chronopad").join("undo"));
    }
    dirs
}

/// Flattens an absolute file path into a single file name by replacing
/// path separators with `%`, so undo files for different buffers never
/// collide inside a shared undo directory.
pub fn munge_file_name(path: &Path) -> String {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut name = String::new();
    for component in canonical.to_string_lossy().chars() {
        if component == std::path::MAIN_SEPARATOR || component == '/' {
            name.push('%');
        } else {
            name.push(component);
        }
    }
    name
}

impl UndoConfig {
    /// Returns the candidate undo-file paths for a buffer, in the order
    /// the directory list dictates.
    ///
    /// A `"."` directory maps to a hidden `.{name}.un~` file next to the
    /// buffer's own file; any other directory holds the munged full path.
    pub fn undo_file_candidates(&self, buffer_path: &Path) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        for dir in &self.undo_dirs {
            if dir.as_os_str() == "." {
                let file_name = buffer_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if file_name.is_empty() {
                    continue;
                }
                let hidden = format!(".{file_name}.un~");
                match buffer_path.parent() {
                    Some(parent) => candidates.push(parent.join(hidden)),
                    None => candidates.push(PathBuf::from(hidden)),
                }
            } else {
                candidates.push(dir.join(munge_file_name(buffer_path)));
            }
        }
        candidates
    }

    /// Picks the write destination: the first candidate whose directory
    /// exists. Directory creation is the caller's concern, not ours.
    pub fn undo_file_for_write(&self, buffer_path: &Path) -> Option<PathBuf> {
        self.undo_file_candidates(buffer_path)
            .into_iter()
            .find(|p| p.parent().map_or(true, |d| d.as_os_str().is_empty() || d.is_dir()))
    }

    /// Picks the read source: the first candidate that exists.
    pub fn undo_file_for_read(&self, buffer_path: &Path) -> Option<PathBuf> {
        self.undo_file_candidates(buffer_path)
            .into_iter()
            .find(|p| p.is_file())
    }
}
