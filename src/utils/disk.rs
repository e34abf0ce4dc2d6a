//! Disk capacity preflight helpers

use std::path::Path;

use sysinfo::Disks;

/// Free-space safety margin below which a capture warns (2 GiB).
pub const MIN_FREE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Available bytes on the disk holding `path`.
///
/// Picks the mounted disk with the longest mount-point prefix of the
/// (canonicalized) path. `None` when the path matches no mount point, e.g.
/// on platforms where the disk list is unavailable.
pub fn available_space(path: &Path) -> Option<u64> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
