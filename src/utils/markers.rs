// Completion predicates: the only record of what a previous attempt finished.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::defs::{BCL_DONE, CLUMPIFY_DONE, FASTQ_MADE, FILES_RENAMED};

/// Run-level sentinel files, in the order a run passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    BclDone,
    FilesRenamed,
    ClumpifyDone,
    FastqMade,
}

impl Marker {
    pub fn file_name(&self) -> &'static str {
        match self {
            Marker::BclDone => BCL_DONE,
            Marker::FilesRenamed => FILES_RENAMED,
            Marker::ClumpifyDone => CLUMPIFY_DONE,
            Marker::FastqMade => FASTQ_MADE,
        }
    }

    pub fn path_in(&self, run_output_dir: &Path) -> PathBuf {
        run_output_dir.join(self.file_name())
    }
}

/// Answers "has the work producing this path already been done?".
pub trait CompletionCheck: Send + Sync {
    fn is_done(&self, path: &Path) -> bool;

    fn any_done(&self, paths: &[PathBuf]) -> bool {
        paths.iter().any(|p| self.is_done(p))
    }
}

/// File existence on the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnDisk;

impl CompletionCheck for OnDisk {
    fn is_done(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// In-memory predicate, for exercising stage logic without touching disk.
#[derive(Debug, Default)]
pub struct KnownDone {
    done: Mutex<HashSet<PathBuf>>,
}

impl KnownDone {
    pub fn mark(&self, path: &Path) {
        if let Ok(mut done) = self.done.lock() {
            done.insert(path.to_path_buf());
        }
    }
}

impl CompletionCheck for KnownDone {
    fn is_done(&self, path: &Path) -> bool {
        self.done.lock().map(|d| d.contains(path)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_paths() {
        let out = Path::new("/out/run1");
        assert_eq!(Marker::BclDone.path_in(out), PathBuf::from("/out/run1/bcl.done"));
        assert_eq!(Marker::FastqMade.path_in(out), PathBuf::from("/out/run1/fastq.made"));
    }

    #[test]
    fn test_known_done() {
        let check = KnownDone::default();
        let a = PathBuf::from("/a");
        let b = PathBuf::from("/b");
        assert!(!check.any_done(&[a.clone(), b.clone()]));
        check.mark(&b);
        assert!(check.any_done(&[a.clone(), b]));
        assert!(!check.is_done(&a));
    }
}
