//! Platform capability bundle.
//!
//! The storage subsystems reach the kernel only through this trait so that
//! tests can substitute the filesystem and mount surface. A single
//! [`LinuxPlatform`] instance is created at startup and shared by every
//! registry.

use std::io;
use std::path::Path;

pub use nix::mount::{MntFlags, MsFlags};

/// Kernel surface used by the storage subsystems.
pub trait Platform: Send + Sync {
    /// List the entry names of a directory.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Issue the mount syscall.
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: &str,
    ) -> io::Result<()>;

    /// Issue the unmount syscall.
    fn unmount(&self, target: &Path, flags: MntFlags) -> io::Result<()>;

    /// Write `contents` to an existing file opened write-only.
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Create a directory and all of its parents with mode 0755.
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;

    /// Recursively remove a directory tree. Missing paths are not an error.
    fn remove_all(&self, path: &Path) -> io::Result<()>;
}

/// The real kernel surface.
pub struct LinuxPlatform;

impl Platform for LinuxPlatform {
    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: &str,
    ) -> io::Result<()> {
        let data = if data.is_empty() { None } else { Some(data) };
        nix::mount::mount(Some(source), target, Some(fstype), flags, data)
            .map_err(io::Error::from)
    }

    fn unmount(&self, target: &Path, flags: MntFlags) -> io::Result<()> {
        nix::mount::umount2(target, flags).map_err(io::Error::from)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.write_all(contents)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(path)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Recording fake used by the storage tests.
#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    type ListDirFn = Box<dyn Fn(&Path) -> io::Result<Vec<String>> + Send + Sync>;

    /// One recorded mount call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MountRecord {
        pub source: String,
        pub target: PathBuf,
        pub fstype: String,
        pub flags: MsFlags,
        pub data: String,
    }

    /// A [`Platform`] that records calls and fails on demand.
    pub struct FakePlatform {
        list_dir_fn: Mutex<Option<ListDirFn>>,
        pub list_dir_calls: AtomicU32,
        pub mounts: Mutex<Vec<MountRecord>>,
        pub unmounts: Mutex<Vec<PathBuf>>,
        pub writes: Mutex<Vec<(PathBuf, Vec<u8>)>>,
        pub created_dirs: Mutex<Vec<PathBuf>>,
        pub removed_dirs: Mutex<Vec<PathBuf>>,
        mount_error: Mutex<Option<io::ErrorKind>>,
        unmount_error: Mutex<Option<io::ErrorKind>>,
        write_error: Mutex<Option<io::ErrorKind>>,
    }

    impl FakePlatform {
        pub fn new() -> Self {
            Self {
                list_dir_fn: Mutex::new(None),
                list_dir_calls: AtomicU32::new(0),
                mounts: Mutex::new(Vec::new()),
                unmounts: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                created_dirs: Mutex::new(Vec::new()),
                removed_dirs: Mutex::new(Vec::new()),
                mount_error: Mutex::new(None),
                unmount_error: Mutex::new(None),
                write_error: Mutex::new(None),
            }
        }

        /// Serve directory listings from `f`.
        pub fn with_list_dir(
            self,
            f: impl Fn(&Path) -> io::Result<Vec<String>> + Send + Sync + 'static,
        ) -> Self {
            *self.list_dir_fn.lock() = Some(Box::new(f));
            self
        }

        /// Fail every mount call with `kind`.
        pub fn fail_mounts(self, kind: io::ErrorKind) -> Self {
            *self.mount_error.lock() = Some(kind);
            self
        }

        /// Fail every unmount call with `kind`.
        pub fn fail_unmounts(self, kind: io::ErrorKind) -> Self {
            *self.unmount_error.lock() = Some(kind);
            self
        }

        /// Fail every write call with `kind`.
        pub fn fail_writes(self, kind: io::ErrorKind) -> Self {
            *self.write_error.lock() = Some(kind);
            self
        }
    }

    impl Platform for FakePlatform {
        fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
            self.list_dir_calls.fetch_add(1, Ordering::SeqCst);
            match &*self.list_dir_fn.lock() {
                Some(f) => f(path),
                None => Ok(Vec::new()),
            }
        }

        fn mount(
            &self,
            source: &str,
            target: &Path,
            fstype: &str,
            flags: MsFlags,
            data: &str,
        ) -> io::Result<()> {
            if let Some(kind) = *self.mount_error.lock() {
                return Err(io::Error::from(kind));
            }
            self.mounts.lock().push(MountRecord {
                source: source.to_string(),
                target: target.to_path_buf(),
                fstype: fstype.to_string(),
                flags,
                data: data.to_string(),
            });
            Ok(())
        }

        fn unmount(&self, target: &Path, _flags: MntFlags) -> io::Result<()> {
            if let Some(kind) = *self.unmount_error.lock() {
                return Err(io::Error::from(kind));
            }
            self.unmounts.lock().push(target.to_path_buf());
            Ok(())
        }

        fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
            if let Some(kind) = *self.write_error.lock() {
                return Err(io::Error::from(kind));
            }
            self.writes.lock().push((path.to_path_buf(), contents.to_vec()));
            Ok(())
        }

        fn mkdir_all(&self, path: &Path) -> io::Result<()> {
            self.created_dirs.lock().push(path.to_path_buf());
            Ok(())
        }

        fn remove_all(&self, path: &Path) -> io::Result<()> {
            self.removed_dirs.lock().push(path.to_path_buf());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_dir_returns_sorted_names() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("sdb"), b"").expect("create");
        std::fs::write(dir.path().join("sda"), b"").expect("create");
        let names = LinuxPlatform.list_dir(dir.path()).expect("list");
        assert_eq!(names, vec!["sda".to_string(), "sdb".to_string()]);
    }

    #[test]
    fn test_list_dir_missing_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let err = LinuxPlatform
            .list_dir(&dir.path().join("absent"))
            .expect_err("missing directory");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_write_file_requires_existing_file() {
        let dir = TempDir::new().expect("tempdir");
        let err = LinuxPlatform
            .write_file(&dir.path().join("absent"), b"1\n")
            .expect_err("write-only open must not create");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let path = dir.path().join("delete");
        std::fs::write(&path, b"").expect("create");
        LinuxPlatform.write_file(&path, b"1\n").expect("write");
        assert_eq!(std::fs::read(&path).expect("read"), b"1\n");
    }

    #[test]
    fn test_mkdir_all_and_remove_all() {
        let dir = TempDir::new().expect("tempdir");
        let nested = dir.path().join("a/b/c");
        LinuxPlatform.mkdir_all(&nested).expect("mkdir");
        assert!(nested.is_dir());
        LinuxPlatform.remove_all(&dir.path().join("a")).expect("remove");
        assert!(!dir.path().join("a").exists());
        // A second removal of a missing tree is not an error.
        LinuxPlatform.remove_all(&dir.path().join("a")).expect("idempotent");
    }
}
