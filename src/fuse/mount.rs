//! Mount helpers for starting/stopping FUSE.
//!
//! Only supported on Unix-like systems; on Linux the unprivileged path via
//! fusermount3 is preferred so mounts work without root.

use std::num::NonZeroU32;
use std::path::Path;

use rfuse3::MountOptions;

use crate::fuse::SlateFs;

fn default_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("slatefs");
    mo.default_permissions(true);
    mo.max_write(NonZeroU32::new(1024 * 1024).unwrap());
    mo
}

/// Mount the filesystem on the given directory using unprivileged mode when
/// available (requires fusermount3 in PATH).
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: SlateFs,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let opts = default_mount_options();
    let session = rfuse3::raw::Session::new(opts);
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: SlateFs,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
