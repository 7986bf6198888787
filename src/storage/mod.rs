//! Storage management for the agent.
//!
//! This module tree handles:
//! - The mount primitive wrapping the kernel mount/unmount calls
//! - SCSI device resolution and hot-unplug (`scsi`)
//! - PMEM device access (`pmem`)
//! - Overlay rootfs composition (`overlay`)

pub mod overlay;
pub mod pmem;
pub mod scsi;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::platform::{MntFlags, MsFlags, Platform};

/// Callback invoked exactly once when a mount releases its device
/// reference: after a successful unmount, or by [`mount`] itself when the
/// mount syscall fails and the pre-counted reference must be returned.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A kernel mount owned by the caller.
///
/// The mount does not own the device entry behind it; it holds the device's
/// release hook and the device entry survives at least until the hook has
/// run.
pub struct Mount {
    platform: Arc<dyn Platform>,
    target: PathBuf,
    mounted: bool,
    release: Option<ReleaseHook>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("target", &self.target)
            .field("mounted", &self.mounted)
            .finish()
    }
}

/// Issue the kernel mount syscall and wrap the result.
///
/// On failure the release hook is invoked before the error is returned so
/// that device reference counts stay balanced on both paths.
pub fn mount(
    platform: Arc<dyn Platform>,
    source: &str,
    target: &Path,
    fstype: &str,
    flags: MsFlags,
    data: &str,
    release: Option<ReleaseHook>,
) -> Result<Mount> {
    if let Err(err) = platform.mount(source, target, fstype, flags, data) {
        if let Some(hook) = release {
            hook();
        }
        return Err(Error::new(ErrorKind::Mount {
            source_path: source.to_string(),
            target: target.display().to_string(),
            source: err.into(),
        }));
    }
    debug!(source = %source, mount_point = %target.display(), fstype = %fstype, "mounted");
    Ok(Mount {
        platform,
        target: target.to_path_buf(),
        mounted: true,
        release,
    })
}

impl Mount {
    /// The filesystem location this mount is mounted to.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// True while the kernel holds the mount.
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Unmount the target.
    ///
    /// Returns [`ErrorKind::PathNotMounted`] if the target was already
    /// unmounted. On success the release hook, if any, runs exactly once.
    pub fn unmount(&mut self, flags: MntFlags) -> Result<()> {
        if !self.mounted {
            return Err(Error::new(ErrorKind::PathNotMounted {
                target: self.target.display().to_string(),
            }));
        }
        self.platform.unmount(&self.target, flags).map_err(|err| {
            Error::new(ErrorKind::Unmount {
                target: self.target.display().to_string(),
                source: err.into(),
            })
        })?;
        self.mounted = false;
        debug!(mount_point = %self.target.display(), "unmounted");
        if let Some(hook) = self.release.take() {
            hook();
        }
        Ok(())
    }
}
