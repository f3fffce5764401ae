use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use glob::{glob_with, MatchOptions, Pattern};
use tempfile::NamedTempFile;

use crate::config::defs::FASTQ_GZ_EXT;

/// Writes `bytes` to a temp file next to `dest`, then renames it into place,
/// so readers never observe a half-written file.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = dest.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Creates a zero-byte sentinel file.
pub fn touch(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Copies `src` to `dest` unless `dest` already exists.
///
/// # Returns
/// true if a copy was made.
pub fn copy_once(src: &Path, dest: &Path) -> io::Result<bool> {
    if dest.exists() {
        return Ok(false);
    }
    fs::copy(src, dest)?;
    Ok(true)
}

/// File name without the `.fastq.gz` extension.
pub fn fastq_base(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(FASTQ_GZ_EXT).map(str::to_string).unwrap_or(name)
}

/// Expands `pattern` relative to `root`, with the root path escaped so
/// that bracket characters in directory names are taken literally.
/// Hidden entries are not matched.
///
/// # Returns
/// Sorted matches.
pub fn glob_under(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!("{}/{}", Pattern::escape(&root.to_string_lossy()), pattern);
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let mut paths = Vec::new();
    for entry in glob_with(&full, options).map_err(|e| anyhow!("Bad glob {}: {}", full, e))? {
        match entry {
            Ok(path) => paths.push(path),
            Err(e) => log::debug!("Unreadable path while globbing {}: {}", full, e),
        }
    }
    paths.sort();
    Ok(paths)
}

/// Every `*.fastq.gz` below `dir`, as paths relative to `dir`.
pub fn fastq_files_relative(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    collect_fastq(dir, dir, &mut out)?;
    out.sort();
    Ok(out)
}

fn collect_fastq(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_fastq(root, &path, out)?;
        } else if path.to_string_lossy().ends_with(FASTQ_GZ_EXT) {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_and_touch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("nested").join("out.txt");
        write_atomic(&dest, b"abc")?;
        assert_eq!(fs::read(&dest)?, b"abc");
        write_atomic(&dest, b"xyz")?;
        assert_eq!(fs::read(&dest)?, b"xyz");

        let marker = dir.path().join("bcl.done");
        touch(&marker)?;
        touch(&marker)?;
        assert_eq!(fs::metadata(&marker)?.len(), 0);
        Ok(())
    }

    #[test]
    fn test_copy_once_never_overwrites() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("a.csv");
        let dest = dir.path().join("b.csv");
        fs::write(&src, "first")?;
        assert!(copy_once(&src, &dest)?);
        fs::write(&src, "second")?;
        assert!(!copy_once(&src, &dest)?);
        assert_eq!(fs::read_to_string(&dest)?, "first");
        Ok(())
    }

    #[test]
    fn test_fastq_base() {
        assert_eq!(fastq_base(Path::new("/x/s1_R1.fastq.gz")), "s1_R1");
        assert_eq!(fastq_base(Path::new("/x/notes.txt")), "notes.txt");
    }

    #[test]
    fn test_glob_under_escapes_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("run[1]");
        fs::create_dir_all(root.join("P1"))?;
        fs::write(root.join("P1").join("a_R1.fastq.gz"), "")?;
        fs::write(root.join("P1").join(".hidden_R1.fastq.gz"), "")?;
        let found = glob_under(&root, "*/*R[12].fastq.gz")?;
        assert_eq!(found, vec![root.join("P1").join("a_R1.fastq.gz")]);
        Ok(())
    }
}
