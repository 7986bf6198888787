//! SCSI device registry.
//!
//! The host attaches disks to the utility VM as virtual SCSI devices named
//! by `(controller, lun)`. The kernel assigns the block device name
//! asynchronously, so the registry resolves each pair through sysfs with a
//! bounded retry, caches the outcome, and refcounts mounts so the device
//! can be ejected when the last mount goes away.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::platform::{MsFlags, Platform};
use crate::storage::{self, Mount, ReleaseHook};

/// Root of the kernel's SCSI device tree.
const SCSI_DEVICES_PATH: &str = "/sys/bus/scsi/devices";

/// How long to wait for the kernel to surface a hotplugged device before
/// resolution fails. Constructor-injectable so tests can shrink it.
const DEVICE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay between sysfs polls while a device is still appearing.
const DEVICE_LOOKUP_INTERVAL: Duration = Duration::from_millis(10);

fn device_key(controller: u8, lun: u8) -> String {
    format!("0:0:{}:{}", controller, lun)
}

/// Resolution and refcount state for one `(controller, lun)` pair.
#[derive(Default, Debug)]
struct DeviceState {
    /// The resolved `/dev/<name>` path. Set at most once.
    source: Option<PathBuf>,
    /// The cached resolution failure. Set at most once, and mutually
    /// exclusive with `source`.
    resolve_error: Option<Error>,
    ref_count: u32,
}

/// A SCSI device that maps block storage to active mount locations.
///
/// A device with zero mounts has no data that might need synchronizing, so
/// it is ejected only when the last mount is unmounted by protocol.
#[derive(Debug)]
pub struct ScsiDevice {
    key: String,
    controller: u8,
    lun: u8,
    state: Mutex<DeviceState>,
}

impl ScsiDevice {
    /// The controller half of the device coordinates.
    pub fn controller(&self) -> u8 {
        self.controller
    }

    /// The LUN half of the device coordinates.
    pub fn lun(&self) -> u8 {
        self.lun
    }

    /// The resolved block device path.
    pub fn source(&self) -> Option<PathBuf> {
        self.state.lock().source.clone()
    }
}

/// Process-wide registry of SCSI devices keyed by `(controller, lun)`.
pub struct ScsiRegistry {
    platform: Arc<dyn Platform>,
    lookup_timeout: Duration,
    devices: Mutex<HashMap<String, Arc<ScsiDevice>>>,
    /// Handed to mount release hooks so a mount outliving the registry
    /// degrades to a no-op release instead of keeping the registry alive.
    self_ref: Weak<ScsiRegistry>,
}

impl ScsiRegistry {
    /// Create a registry with the default lookup deadline.
    pub fn new(platform: Arc<dyn Platform>) -> Arc<Self> {
        Self::with_timeout(platform, DEVICE_LOOKUP_TIMEOUT)
    }

    /// Create a registry with an explicit lookup deadline.
    pub fn with_timeout(platform: Arc<dyn Platform>, lookup_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            platform,
            lookup_timeout,
            devices: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Get or create the device for `(controller, lun)`, fully resolved.
    ///
    /// Safe for concurrent callers with the same pair: all observe the same
    /// device or the same error, and the sysfs scan runs at most once.
    pub fn open(&self, controller: u8, lun: u8) -> Result<Arc<ScsiDevice>> {
        let key = device_key(controller, lun);
        let device = self
            .devices
            .lock()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(ScsiDevice {
                    key: key.clone(),
                    controller,
                    lun,
                    state: Mutex::new(DeviceState::default()),
                })
            })
            .clone();
        if let Err(err) = self.resolve(&device) {
            self.devices.lock().remove(&key);
            return Err(err);
        }
        Ok(device)
    }

    /// Resolve the device to its `/dev/sd*` path via sysfs.
    ///
    /// Runs at most once per device: the first outcome, success or failure,
    /// is cached and every later call observes it.
    fn resolve(&self, device: &ScsiDevice) -> Result<()> {
        let mut state = device.state.lock();
        if state.source.is_some() {
            // Another thread already resolved.
            return Ok(());
        }
        if let Some(err) = &state.resolve_error {
            return Err(err.clone());
        }

        let path = Path::new(SCSI_DEVICES_PATH).join(&device.key).join("block");
        let started = Instant::now();
        let names = loop {
            match self.platform.list_dir(&path) {
                Ok(names) => break names,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // The device has not surfaced yet. Keep polling until
                    // the deadline.
                    if started.elapsed() > self.lookup_timeout {
                        let err = Error::new(ErrorKind::DeviceTimeout {
                            path: path.display().to_string(),
                            source: err.into(),
                        });
                        state.resolve_error = Some(err.clone());
                        return Err(err);
                    }
                    std::thread::sleep(DEVICE_LOOKUP_INTERVAL);
                }
                Err(err) => {
                    let err = Error::new(ErrorKind::DeviceEnumeration {
                        path: path.display().to_string(),
                        source: err.into(),
                    });
                    state.resolve_error = Some(err.clone());
                    return Err(err);
                }
            }
        };

        match names.as_slice() {
            [] => {
                let err = Error::new(ErrorKind::NoMatchingDevices {
                    path: path.display().to_string(),
                });
                state.resolve_error = Some(err.clone());
                Err(err)
            }
            [name] => {
                let source = Path::new("/dev").join(name);
                debug!(
                    controller = device.controller,
                    lun = device.lun,
                    source = %source.display(),
                    "resolved scsi device"
                );
                state.source = Some(source);
                Ok(())
            }
            _ => {
                let err = Error::new(ErrorKind::MultipleMatchingDevices {
                    path: path.display().to_string(),
                });
                state.resolve_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Mount `device` at `target`, taking one device reference.
    ///
    /// The returned mount's release hook ejects the device when the last
    /// reference is released. The reference is taken before the mount is
    /// attempted; on mount failure the mount primitive runs the hook so the
    /// count stays balanced.
    pub fn mount_to(
        &self,
        device: &Arc<ScsiDevice>,
        target: &Path,
        readonly: bool,
    ) -> Result<Mount> {
        let source = {
            let mut state = device.state.lock();
            state.ref_count += 1;
            state.source.clone()
        };
        let source = match source {
            Some(source) => source,
            None => {
                debug_assert!(false, "mount_to called on an unresolved scsi device");
                self.eject(device);
                return Err(Error::new(ErrorKind::Mount {
                    source_path: device.key.clone(),
                    target: target.display().to_string(),
                    source: io::Error::from(io::ErrorKind::NotFound).into(),
                }));
            }
        };

        let (flags, data) = if readonly {
            (MsFlags::MS_RDONLY, "noload")
        } else {
            (MsFlags::empty(), "")
        };

        let registry = Weak::clone(&self.self_ref);
        let hooked = Arc::clone(device);
        let release: ReleaseHook = Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.eject(&hooked);
            }
        });
        storage::mount(
            Arc::clone(&self.platform),
            &source.display().to_string(),
            target,
            "ext4",
            flags,
            data,
            Some(release),
        )
    }

    /// Drop one device reference; eject and forget the device when the last
    /// reference goes away. Reached only through a mount's release hook.
    fn eject(&self, device: &Arc<ScsiDevice>) {
        let mut state = device.state.lock();
        assert!(state.ref_count > 0, "scsi mount refcount mismatch");
        state.ref_count -= 1;
        if state.ref_count > 0 {
            return;
        }

        // Last reference: ask the kernel to unplug the device. The host has
        // already released its interest, so write failures are logged and
        // otherwise ignored.
        let delete = Path::new(SCSI_DEVICES_PATH).join(&device.key).join("delete");
        if let Err(err) = self.platform.write_file(&delete, b"1\n") {
            warn!(
                controller = device.controller,
                lun = device.lun,
                error = %err,
                "scsi eject write failed"
            );
        } else {
            debug!(
                controller = device.controller,
                lun = device.lun,
                "ejected scsi device"
            );
        }

        // Forget the device under its (controller, lun) key so a later open
        // starts a fresh resolution.
        self.devices.lock().remove(&device.key);
    }
}
