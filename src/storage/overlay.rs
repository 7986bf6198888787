//! Overlay rootfs composition.
//!
//! Composes a union filesystem from ordered read-only lower layers plus an
//! optional writable upper/work pair. Directories created here are removed
//! again if the mount fails, so a failed composition leaves no residue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::platform::{MsFlags, Platform};
use crate::storage::Mount;

/// Compose an overlay of `layer_paths` at `rootfs`.
///
/// `layer_paths` are ordered topmost first. `upperdir` and `workdir` are
/// created when given and must both be absent for a readonly overlay.
/// `rootfs` is always created. On mount failure every directory this call
/// created is removed.
pub fn mount(
    platform: Arc<dyn Platform>,
    layer_paths: &[PathBuf],
    upperdir: Option<&Path>,
    workdir: Option<&Path>,
    rootfs: &Path,
    readonly: bool,
) -> Result<Mount> {
    if readonly && (upperdir.is_some() || workdir.is_some()) {
        return Err(Error::new(ErrorKind::ReadonlyScratch {
            upperdir: upperdir.map(|p| p.display().to_string()).unwrap_or_default(),
            workdir: workdir.map(|p| p.display().to_string()).unwrap_or_default(),
        }));
    }

    let mut created: Vec<PathBuf> = Vec::new();
    let result = mount_inner(
        &platform,
        layer_paths,
        upperdir,
        workdir,
        rootfs,
        readonly,
        &mut created,
    );
    if result.is_err() {
        for path in created.iter().rev() {
            if let Err(err) = platform.remove_all(path) {
                warn!(path = %path.display(), error = %err, "overlay cleanup failed");
            }
        }
    }
    result
}

fn mount_inner(
    platform: &Arc<dyn Platform>,
    layer_paths: &[PathBuf],
    upperdir: Option<&Path>,
    workdir: Option<&Path>,
    rootfs: &Path,
    readonly: bool,
    created: &mut Vec<PathBuf>,
) -> Result<Mount> {
    let lowerdir = layer_paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    let mut options = vec![format!("lowerdir={}", lowerdir)];

    let mut create_dir = |path: &Path| -> Result<()> {
        platform.mkdir_all(path).map_err(|err| {
            Error::new(ErrorKind::CreateDir {
                path: path.display().to_string(),
                source: err.into(),
            })
        })?;
        created.push(path.to_path_buf());
        Ok(())
    };

    if let Some(upperdir) = upperdir {
        create_dir(upperdir)?;
        options.push(format!("upperdir={}", upperdir.display()));
    }
    if let Some(workdir) = workdir {
        create_dir(workdir)?;
        options.push(format!("workdir={}", workdir.display()));
    }
    create_dir(rootfs)?;

    let flags = if readonly {
        MsFlags::MS_RDONLY
    } else {
        MsFlags::empty()
    };
    crate::storage::mount(
        Arc::clone(platform),
        "overlay",
        rootfs,
        "overlay",
        flags,
        &options.join(","),
        None,
    )
}
