// src/utils/system.rs: Host queries (disk space, CPU count) and secrets

use std::path::Path;

use rand::distr::{Alphanumeric, SampleString};
use sysinfo::{Disks, System};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Free space on the volume holding `path`, in GiB.
///
/// # Arguments
///
/// * `path` - Any path on the volume of interest.
///
/// # Returns
///
/// None when no mounted disk contains `path`.
pub fn free_space_gb(path: &Path) -> Option<f64> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() as f64 / GIB)
}

/// Free-space line used in run summaries.
pub fn free_space_message(path: &Path) -> String {
    match free_space_gb(path) {
        Some(gb) => format!("{} has {:.1} GiB free", path.display(), gb),
        None => format!("Free space on {} is unavailable", path.display()),
    }
}

/// Number of physical cores, at least 1.
pub fn physical_cores() -> usize {
    System::physical_core_count().unwrap_or(1).max(1)
}

/// Random alphanumeric passphrase for encrypted archives.
///
/// # Arguments
///
/// * `len` - Number of characters.
pub fn generate_passphrase(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passphrase_shape() {
        let a = generate_passphrase(24);
        let b = generate_passphrase(24);
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_free_space_message() {
        let dir = std::env::temp_dir();
        let message = free_space_message(&dir);
        assert!(message.contains(&dir.display().to_string()));
        assert!(physical_cores() >= 1);
    }
}
