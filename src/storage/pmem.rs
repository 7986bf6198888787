//! PMEM device registry.
//!
//! Persistent-memory devices carry read-only layer filesystems. Unlike
//! SCSI there is nothing to resolve: device `N` is always `/dev/pmemN`.
//! The registry still refcounts mounts so a device entry disappears when
//! its last mount is released, but PMEM is not hot-unplugged through this
//! path so no kernel delete is issued.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::platform::{MsFlags, Platform};
use crate::storage::{self, Mount, ReleaseHook};

#[derive(Default)]
struct PmemState {
    ref_count: u32,
}

/// A PMEM device mapped to active mount locations.
pub struct PmemDevice {
    device_number: u32,
    state: Mutex<PmemState>,
}

impl PmemDevice {
    /// The device index under `/dev/pmem`.
    pub fn device_number(&self) -> u32 {
        self.device_number
    }

    /// The block device path.
    pub fn source(&self) -> String {
        format!("/dev/pmem{}", self.device_number)
    }
}

/// Process-wide registry of PMEM devices keyed by device number.
pub struct PmemRegistry {
    platform: Arc<dyn Platform>,
    devices: Mutex<HashMap<u32, Arc<PmemDevice>>>,
    /// Handed to mount release hooks so a mount outliving the registry
    /// degrades to a no-op release instead of keeping the registry alive.
    self_ref: Weak<PmemRegistry>,
}

impl PmemRegistry {
    /// Create an empty registry.
    pub fn new(platform: Arc<dyn Platform>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            platform,
            devices: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Get or create the device entry for `device_number`.
    pub fn open(&self, device_number: u32) -> Result<Arc<PmemDevice>> {
        let device = self
            .devices
            .lock()
            .entry(device_number)
            .or_insert_with(|| {
                Arc::new(PmemDevice {
                    device_number,
                    state: Mutex::new(PmemState::default()),
                })
            })
            .clone();
        Ok(device)
    }

    /// Mount `device` read-only at `target`, taking one device reference.
    ///
    /// PMEM layers are always ext4 mounted with `noload,dax`. The returned
    /// mount's release hook returns the reference; the reference is taken
    /// before the mount is attempted and the mount primitive runs the hook
    /// on failure so the count stays balanced.
    pub fn mount_to(&self, device: &Arc<PmemDevice>, target: &Path) -> Result<Mount> {
        device.state.lock().ref_count += 1;

        let registry = Weak::clone(&self.self_ref);
        let hooked = Arc::clone(device);
        let release: ReleaseHook = Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.release(&hooked);
            }
        });
        storage::mount(
            Arc::clone(&self.platform),
            &device.source(),
            target,
            "ext4",
            MsFlags::MS_RDONLY,
            "noload,dax",
            Some(release),
        )
    }

    /// Drop one device reference; forget the device when the last reference
    /// goes away. Reached only through a mount's release hook.
    fn release(&self, device: &Arc<PmemDevice>) {
        let mut state = device.state.lock();
        assert!(state.ref_count > 0, "pmem mount refcount mismatch");
        state.ref_count -= 1;
        if state.ref_count > 0 {
            return;
        }
        debug!(device_number = device.device_number, "released pmem device");
        self.devices.lock().remove(&device.device_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::platform::fake::FakePlatform;
    use crate::platform::MntFlags;
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn test_open_constructs_device_path() {
        let platform = Arc::new(FakePlatform::new());
        let registry = PmemRegistry::new(platform);

        let device = registry.open(3).expect("open succeeds");
        assert_eq!(device.source(), "/dev/pmem3");
        assert!(registry.devices.lock().contains_key(&3));
    }

    #[test]
    fn test_open_twice_shares_entry() {
        let platform = Arc::new(FakePlatform::new());
        let registry = PmemRegistry::new(platform);

        let one = registry.open(0).expect("open succeeds");
        let two = registry.open(0).expect("open succeeds");
        assert!(Arc::ptr_eq(&one, &two));
    }

    #[test]
    fn test_mount_options_are_readonly_dax() {
        let platform = Arc::new(FakePlatform::new());
        let registry = PmemRegistry::new(Arc::clone(&platform) as Arc<dyn Platform>);

        let device = registry.open(2).expect("open succeeds");
        let _mount = registry
            .mount_to(&device, Path::new("/layers/2"))
            .expect("mount succeeds");

        let records = platform.mounts.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, "/dev/pmem2");
        assert_eq!(records[0].target, PathBuf::from("/layers/2"));
        assert_eq!(records[0].fstype, "ext4");
        assert_eq!(records[0].flags, MsFlags::MS_RDONLY);
        assert_eq!(records[0].data, "noload,dax");
    }

    #[test]
    fn test_last_unmount_forgets_device_without_eject() {
        let platform = Arc::new(FakePlatform::new());
        let registry = PmemRegistry::new(Arc::clone(&platform) as Arc<dyn Platform>);

        let device = registry.open(1).expect("open succeeds");
        let mut first = registry
            .mount_to(&device, Path::new("/a"))
            .expect("first mount");
        let mut second = registry
            .mount_to(&device, Path::new("/b"))
            .expect("second mount");
        assert_eq!(device.state.lock().ref_count, 2);

        first.unmount(MntFlags::empty()).expect("first unmount");
        assert!(registry.devices.lock().contains_key(&1));

        second.unmount(MntFlags::empty()).expect("second unmount");
        assert_eq!(device.state.lock().ref_count, 0);
        assert!(!registry.devices.lock().contains_key(&1));
        assert!(
            platform.writes.lock().is_empty(),
            "pmem release must not touch a kernel delete node"
        );
    }

    #[test]
    fn test_mount_failure_returns_reference() {
        let platform = Arc::new(FakePlatform::new().fail_mounts(io::ErrorKind::Other));
        let registry = PmemRegistry::new(Arc::clone(&platform) as Arc<dyn Platform>);

        let device = registry.open(1).expect("open succeeds");
        let err = registry
            .mount_to(&device, Path::new("/a"))
            .expect_err("mount fails");
        assert!(matches!(err.kind(), ErrorKind::Mount { .. }));
        assert_eq!(device.state.lock().ref_count, 0);
        assert!(!registry.devices.lock().contains_key(&1));
    }
}
