//! Container and process supervisor.
//!
//! Wraps the OCI runtime behind the [`Runtime`] trait and ties each
//! container's lifetime to its init process: a container exists exactly as
//! long as its init process does, and entering `Exited` is driven by a
//! background reaper per process. The supervisor also composes container
//! storage — PMEM-backed read-only layers, an optional SCSI-backed
//! writable scratch, and the overlay rootfs — and owns the mounts it
//! creates so resource modifications can be unwound later.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uvmd_protocol::{
    MappedDirectory, MappedVirtualDisk, ProcessParameters, RequestType,
    ResourceModificationRequest, ResourceType, VmHostedContainerSettings,
};

use crate::error::{Error, ErrorKind, Result};
use crate::platform::{MntFlags, Platform};
use crate::storage::overlay;
use crate::storage::pmem::PmemRegistry;
use crate::storage::scsi::ScsiRegistry;
use crate::storage::Mount;

/// Default directory container storage is composed under.
const BASE_STORAGE_PATH: &str = "/run/uvmd";

/// Interface to the OCI runtime driver.
pub trait Runtime: Send + Sync {
    /// Create a container from the bundle, returning the init pid.
    fn create(&self, id: &str, bundle: &Path, config: &Value) -> Result<i32>;
    /// Start a created container.
    fn start(&self, id: &str) -> Result<()>;
    /// Launch an additional process in a running container, returning its
    /// pid.
    fn exec(&self, id: &str, process: &Value) -> Result<i32>;
    /// Signal the container's init process, optionally every process in
    /// its cgroup.
    fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()>;
    /// Delete a stopped container's runtime state.
    fn delete(&self, id: &str) -> Result<()>;
    /// Block until `pid` exits and return its exit code.
    fn wait(&self, pid: i32) -> Result<i32>;
}

/// Container lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Created but not yet started.
    Created,
    /// Init process is running.
    Running,
    /// Init process has exited.
    Exited,
}

impl ContainerState {
    fn name(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Exit code rendezvous between a process reaper and its waiters.
struct ExitStatus {
    code: Mutex<Option<i32>>,
    cond: Condvar,
}

impl ExitStatus {
    fn new() -> Self {
        Self {
            code: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Block until the exit code is published and return it to every
    /// waiter.
    fn wait(&self) -> i32 {
        let mut code = self.code.lock();
        while code.is_none() {
            self.cond.wait(&mut code);
        }
        code.expect("guarded by the loop above")
    }

    fn set(&self, value: i32) {
        *self.code.lock() = Some(value);
        self.cond.notify_all();
    }

    fn get(&self) -> Option<i32> {
        *self.code.lock()
    }
}

/// A tracked process: a container init, an exec'd process, or an external
/// utility-VM process.
pub struct ProcessEntry {
    pid: i32,
    console: bool,
    exit: ExitStatus,
}

impl ProcessEntry {
    fn new(pid: i32, console: bool) -> Arc<Self> {
        Arc::new(Self {
            pid,
            console,
            exit: ExitStatus::new(),
        })
    }

    /// The process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }
}

/// Mounts owned by one container.
struct ContainerStorage {
    /// Layer, scratch, and rootfs mounts in mount order.
    mounts: Vec<Mount>,
    /// Mapped virtual disks keyed by their utility-VM mount path.
    mapped_disks: HashMap<String, Mount>,
}

/// One live container.
pub struct ContainerEntry {
    id: String,
    init: Arc<ProcessEntry>,
    state: Mutex<ContainerState>,
    /// Exec'd processes; never contains the init process. Entries are
    /// removed when their wait completes.
    processes: Mutex<HashMap<i32, Arc<ProcessEntry>>>,
    storage: Mutex<ContainerStorage>,
}

impl ContainerEntry {
    /// The container id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The container's current state.
    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }
}

/// A container id's slot in the supervisor's table.
///
/// Ids are reserved before any storage or runtime work happens, so a
/// concurrent duplicate create is rejected under the same lock that
/// registers the finished entry.
enum ContainerSlot {
    /// Creation is still composing storage; lookups treat this as absent.
    Creating,
    /// The container is fully created.
    Ready(Arc<ContainerEntry>),
}

/// Supervises every container and waitable process in the utility VM.
pub struct Supervisor {
    runtime: Arc<dyn Runtime>,
    platform: Arc<dyn Platform>,
    scsi: Arc<ScsiRegistry>,
    pmem: Arc<PmemRegistry>,
    base_path: PathBuf,
    containers: Mutex<HashMap<String, ContainerSlot>>,
    /// Every waitable process by pid: inits, exec'd, and external.
    processes: Mutex<HashMap<i32, Arc<ProcessEntry>>>,
}

impl Supervisor {
    /// Create a supervisor storing container state under the default base
    /// path.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        platform: Arc<dyn Platform>,
        scsi: Arc<ScsiRegistry>,
        pmem: Arc<PmemRegistry>,
    ) -> Arc<Self> {
        Self::with_base_path(runtime, platform, scsi, pmem, PathBuf::from(BASE_STORAGE_PATH))
    }

    /// Create a supervisor with an explicit storage base path.
    pub fn with_base_path(
        runtime: Arc<dyn Runtime>,
        platform: Arc<dyn Platform>,
        scsi: Arc<ScsiRegistry>,
        pmem: Arc<PmemRegistry>,
        base_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            platform,
            scsi,
            pmem,
            base_path,
            containers: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
        })
    }

    fn container(&self, id: &str) -> Result<Arc<ContainerEntry>> {
        match self.containers.lock().get(id) {
            Some(ContainerSlot::Ready(entry)) => Ok(Arc::clone(entry)),
            _ => Err(Error::new(ErrorKind::ContainerNotFound { id: id.to_string() })),
        }
    }

    // ========================================================================
    // Container lifecycle
    // ========================================================================

    /// Create a container: compose its rootfs from the settings' layer and
    /// scratch devices, hand the bundle to the runtime, and start tracking
    /// its init process.
    pub fn create_container(
        &self,
        id: &str,
        settings: VmHostedContainerSettings,
    ) -> Result<()> {
        // Reserve the id atomically before touching storage or the
        // runtime, so a concurrent create with the same id is rejected
        // instead of clobbering this entry.
        {
            let mut containers = self.containers.lock();
            if containers.contains_key(id) {
                return Err(Error::new(ErrorKind::ContainerExists { id: id.to_string() }));
            }
            containers.insert(id.to_string(), ContainerSlot::Creating);
        }

        match self.create_reserved(id, settings) {
            Ok(container) => {
                self.containers
                    .lock()
                    .insert(id.to_string(), ContainerSlot::Ready(container));
                info!(container_id = %id, "created container");
                Ok(())
            }
            Err(err) => {
                self.containers.lock().remove(id);
                Err(err)
            }
        }
    }

    /// Creation body run while the id is reserved. On error the caller
    /// drops the reservation; storage already mounted here is unwound
    /// before returning.
    fn create_reserved(
        &self,
        id: &str,
        settings: VmHostedContainerSettings,
    ) -> Result<Arc<ContainerEntry>> {
        let container_path = self.base_path.join(id);
        self.platform.mkdir_all(&container_path).map_err(|err| {
            Error::new(ErrorKind::CreateDir {
                path: container_path.display().to_string(),
                source: err.into(),
            })
        })?;

        let mut mounts = Vec::new();
        let rootfs = match self.mount_storage(&settings, &container_path, &mut mounts) {
            Ok(rootfs) => rootfs,
            Err(err) => {
                self.release_storage(&mut mounts);
                let _ = self.platform.remove_all(&container_path);
                return Err(err);
            }
        };

        let mut config = settings.oci_specification.clone();
        if !(config.is_object() || config.is_null()) {
            self.release_storage(&mut mounts);
            let _ = self.platform.remove_all(&container_path);
            return Err(Error::new(ErrorKind::Decode {
                context: "OCISpecification".to_string(),
                reason: "expected a JSON object".to_string(),
            }));
        }
        config["root"]["path"] = Value::String(rootfs.display().to_string());

        let pid = match self.runtime.create(id, &container_path, &config) {
            Ok(pid) => pid,
            Err(err) => {
                self.release_storage(&mut mounts);
                let _ = self.platform.remove_all(&container_path);
                return Err(err);
            }
        };

        let container = Arc::new(ContainerEntry {
            id: id.to_string(),
            init: ProcessEntry::new(pid, false),
            state: Mutex::new(ContainerState::Created),
            processes: Mutex::new(HashMap::new()),
            storage: Mutex::new(ContainerStorage {
                mounts,
                mapped_disks: HashMap::new(),
            }),
        });
        self.processes
            .lock()
            .insert(pid, Arc::clone(&container.init));

        // Reap the init process in the background; its exit moves the
        // container to Exited and releases every waiter.
        let runtime = Arc::clone(&self.runtime);
        let reaped = Arc::clone(&container);
        thread::spawn(move || {
            let code = match runtime.wait(pid) {
                Ok(code) => code,
                Err(err) => {
                    error!(container_id = %reaped.id, pid, error = %err, "init wait failed");
                    -1
                }
            };
            *reaped.state.lock() = ContainerState::Exited;
            reaped.init.exit.set(code);
            info!(container_id = %reaped.id, pid, exit_code = code, "init process exited");
        });

        Ok(container)
    }

    /// Mount layers, scratch, and the overlay rootfs for a container.
    ///
    /// Successfully created mounts are appended to `mounts` even when a
    /// later step fails, so the caller can unwind them.
    fn mount_storage(
        &self,
        settings: &VmHostedContainerSettings,
        container_path: &Path,
        mounts: &mut Vec<Mount>,
    ) -> Result<PathBuf> {
        let mut layer_paths = Vec::new();
        for (index, layer) in settings.layers.iter().enumerate() {
            let device_number = parse_device_number(&layer.path)?;
            let device = self.pmem.open(device_number)?;
            let target = container_path.join(format!("layer{}", index));
            self.mkdir(&target)?;
            mounts.push(self.pmem.mount_to(&device, &target)?);
            layer_paths.push(target);
        }

        let rootfs = container_path.join("rootfs");
        if settings.scratch_path.is_empty() {
            // No scratch device: the rootfs is a read-only overlay.
            let overlay_mount = overlay::mount(
                Arc::clone(&self.platform),
                &layer_paths,
                None,
                None,
                &rootfs,
                true,
            )?;
            mounts.push(overlay_mount);
            return Ok(rootfs);
        }

        let lun = parse_device_number(&settings.scratch_path)?;
        let lun = u8::try_from(lun).map_err(|_| {
            Error::new(ErrorKind::InvalidDeviceReference {
                value: settings.scratch_path.clone(),
            })
        })?;
        let scratch_device = self.scsi.open(0, lun)?;
        let scratch = container_path.join("scratch");
        self.mkdir(&scratch)?;
        mounts.push(self.scsi.mount_to(&scratch_device, &scratch, false)?);

        let overlay_mount = overlay::mount(
            Arc::clone(&self.platform),
            &layer_paths,
            Some(&scratch.join("upper")),
            Some(&scratch.join("work")),
            &rootfs,
            false,
        )?;
        mounts.push(overlay_mount);
        Ok(rootfs)
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        self.platform.mkdir_all(path).map_err(|err| {
            Error::new(ErrorKind::CreateDir {
                path: path.display().to_string(),
                source: err.into(),
            })
        })
    }

    /// Unmount everything in `mounts`, newest first.
    fn release_storage(&self, mounts: &mut Vec<Mount>) {
        while let Some(mut mount) = mounts.pop() {
            if let Err(err) = mount.unmount(MntFlags::empty()) {
                warn!(mount_point = %mount.target().display(), error = %err, "storage unwind failed");
            }
        }
    }

    /// Start a created container.
    pub fn start_container(&self, id: &str) -> Result<()> {
        let container = self.container(id)?;
        let mut state = container.state.lock();
        if *state != ContainerState::Created {
            return Err(Error::new(ErrorKind::InvalidState {
                id: id.to_string(),
                operation: "start",
                state: state.name(),
            }));
        }
        self.runtime.start(id)?;
        *state = ContainerState::Running;
        info!(container_id = %id, "started container");
        Ok(())
    }

    /// Signal a container's init process. Valid while the container has
    /// not exited.
    pub fn signal_container(&self, id: &str, signal: Signal) -> Result<()> {
        let container = self.container(id)?;
        let state = container.state();
        if state == ContainerState::Exited {
            return Err(Error::new(ErrorKind::InvalidState {
                id: id.to_string(),
                operation: "signal",
                state: state.name(),
            }));
        }
        self.runtime.kill(id, signal, false)
    }

    /// Block until the container's init process exits and return its exit
    /// code. Valid in any state; every waiter observes the same code.
    pub fn wait_container(&self, id: &str) -> Result<i32> {
        let container = self.container(id)?;
        Ok(container.init.exit.wait())
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Launch an additional process inside a running container.
    pub fn exec_process(&self, id: &str, params: &ProcessParameters) -> Result<i32> {
        let container = self.container(id)?;
        let state = container.state();
        if state != ContainerState::Running {
            return Err(Error::new(ErrorKind::InvalidState {
                id: id.to_string(),
                operation: "exec",
                state: state.name(),
            }));
        }

        let pid = self.runtime.exec(id, &oci_process(params))?;
        let entry = ProcessEntry::new(pid, params.emulate_console);
        container.processes.lock().insert(pid, Arc::clone(&entry));
        self.processes.lock().insert(pid, Arc::clone(&entry));

        let runtime = Arc::clone(&self.runtime);
        thread::spawn(move || {
            let code = match runtime.wait(pid) {
                Ok(code) => code,
                Err(err) => {
                    error!(container_id = %container.id, pid, error = %err, "process wait failed");
                    -1
                }
            };
            entry.exit.set(code);
            container.processes.lock().remove(&pid);
            debug!(container_id = %container.id, pid, exit_code = code, "process exited");
        });

        info!(container_id = %id, pid, "launched process");
        Ok(pid)
    }

    /// Launch a process directly in the utility VM, outside any container.
    pub fn run_external_process(&self, params: &ProcessParameters) -> Result<i32> {
        let (program, args) = params
            .command_args
            .split_first()
            .ok_or_else(|| Error::runtime("external process", "empty command"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&params.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if !params.working_directory.is_empty() {
            command.current_dir(&params.working_directory);
        }

        let mut child = command
            .spawn()
            .map_err(|err| Error::runtime("external process", err.to_string()))?;
        let pid = child.id() as i32;
        let entry = ProcessEntry::new(pid, params.emulate_console);
        self.processes.lock().insert(pid, Arc::clone(&entry));

        thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.code().unwrap_or(-1),
                Err(err) => {
                    error!(pid, error = %err, "external process wait failed");
                    -1
                }
            };
            entry.exit.set(code);
            debug!(pid, exit_code = code, "external process exited");
        });

        info!(pid, program = %program, "launched external process");
        Ok(pid)
    }

    /// Deliver a signal to a process.
    ///
    /// The init pid routes through the runtime's container-wide kill, with
    /// `all` extending it to every process in the cgroup. Any other pid is
    /// signalled directly; `all` with a non-init pid is a usage error.
    pub fn signal_process(&self, id: &str, pid: i32, signal: Signal, all: bool) -> Result<()> {
        let container = self.container(id)?;
        if pid == container.init.pid {
            return self.runtime.kill(id, signal, all);
        }
        if all {
            return Err(Error::new(ErrorKind::InvalidSignalScope { pid }));
        }
        if !self.processes.lock().contains_key(&pid) {
            return Err(Error::new(ErrorKind::ProcessNotFound { pid }));
        }
        nix::sys::signal::kill(Pid::from_raw(pid), signal).map_err(|errno| {
            Error::new(ErrorKind::Signal {
                pid,
                source: std::io::Error::from_raw_os_error(errno as i32).into(),
            })
        })
    }

    /// Block until `pid` exits and return its exit code. The entry is
    /// forgotten once the wait completes.
    pub fn wait_process(&self, pid: i32) -> Result<i32> {
        let entry = self
            .processes
            .lock()
            .get(&pid)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::ProcessNotFound { pid }))?;
        let code = entry.exit.wait();
        self.processes.lock().remove(&pid);
        Ok(code)
    }

    /// The container's live pids: init plus exec'd processes.
    pub fn list_processes(&self, id: &str) -> Result<Vec<i32>> {
        let container = self.container(id)?;
        let mut pids = Vec::new();
        if container.init.exit.get().is_none() {
            pids.push(container.init.pid);
        }
        pids.extend(container.processes.lock().keys().copied());
        pids.sort_unstable();
        Ok(pids)
    }

    /// Acknowledge a console resize for `pid`.
    ///
    /// The window size itself is applied by the stdio relay that owns the
    /// console; the supervisor only validates the target.
    pub fn resize_console(&self, pid: i32, width: u16, height: u16) -> Result<()> {
        let entry = self
            .processes
            .lock()
            .get(&pid)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::ProcessNotFound { pid }))?;
        if !entry.console {
            return Err(Error::runtime(
                "resize console",
                format!("process {} has no console", pid),
            ));
        }
        debug!(pid, width, height, "console resize forwarded");
        Ok(())
    }

    // ========================================================================
    // Resource modification
    // ========================================================================

    /// Apply a tagged resource modification to a container.
    pub fn modify_settings(
        &self,
        id: &str,
        request: ResourceModificationRequest,
    ) -> Result<()> {
        match request.resource_type {
            ResourceType::MappedVirtualDisk => {
                let disk: MappedVirtualDisk = serde_json::from_value(request.settings)
                    .map_err(|err| Error::decode("MappedVirtualDisk settings", err))?;
                match request.request_type {
                    RequestType::Add => self.add_mapped_virtual_disk(id, disk),
                    RequestType::Remove => self.remove_mapped_virtual_disk(id, &disk),
                }
            }
            ResourceType::MappedDirectory => {
                // The share relay lives outside the agent; decode the
                // settings to validate the request, then report it
                // unsupported.
                let _directory: MappedDirectory = serde_json::from_value(request.settings)
                    .map_err(|err| Error::decode("MappedDirectory settings", err))?;
                Err(Error::new(ErrorKind::UnsupportedResource {
                    tag: "MappedDirectory".to_string(),
                }))
            }
            ResourceType::Unknown => Err(Error::new(ErrorKind::UnsupportedResource {
                tag: "unknown".to_string(),
            })),
        }
    }

    fn add_mapped_virtual_disk(
        &self,
        id: &str,
        disk: MappedVirtualDisk,
    ) -> Result<()> {
        let container = self.container(id)?;
        if !disk.create_in_utility_vm {
            return Err(Error::new(ErrorKind::NamespaceMount));
        }

        let device = self.scsi.open(0, disk.lun)?;
        if disk.attach_only {
            debug!(container_id = %id, lun = disk.lun, "attached scsi device without mounting");
            return Ok(());
        }

        let target = PathBuf::from(&disk.container_path);
        self.mkdir(&target)?;
        let mount = self.scsi.mount_to(&device, &target, disk.read_only)?;
        container
            .storage
            .lock()
            .mapped_disks
            .insert(disk.container_path.clone(), mount);
        info!(container_id = %id, lun = disk.lun, mount_point = %disk.container_path, "mapped virtual disk");
        Ok(())
    }

    fn remove_mapped_virtual_disk(&self, id: &str, disk: &MappedVirtualDisk) -> Result<()> {
        let container = self.container(id)?;
        if disk.attach_only {
            // Nothing was mounted for an attach-only disk; removal is a
            // no-op.
            debug!(container_id = %id, lun = disk.lun, "detached scsi device without unmounting");
            return Ok(());
        }
        let mut mount = container
            .storage
            .lock()
            .mapped_disks
            .remove(&disk.container_path)
            .ok_or_else(|| {
                Error::new(ErrorKind::PathNotMounted {
                    target: disk.container_path.clone(),
                })
            })?;
        if let Err(err) = mount.unmount(MntFlags::empty()) {
            // Keep tracking the still-live mount.
            container
                .storage
                .lock()
                .mapped_disks
                .insert(disk.container_path.clone(), mount);
            return Err(err);
        }
        info!(container_id = %id, mount_point = %disk.container_path, "unmapped virtual disk");
        Ok(())
    }
}

fn parse_device_number(value: &str) -> Result<u32> {
    value.trim().parse().map_err(|_| {
        Error::new(ErrorKind::InvalidDeviceReference {
            value: value.to_string(),
        })
    })
}

/// Build the OCI process document for an exec request.
fn oci_process(params: &ProcessParameters) -> Value {
    let mut env: Vec<String> = params
        .environment
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    env.sort();
    let cwd = if params.working_directory.is_empty() {
        "/"
    } else {
        params.working_directory.as_str()
    };
    serde_json::json!({
        "terminal": params.emulate_console,
        "args": params.command_args,
        "env": env,
        "cwd": cwd,
    })
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct ExitGate {
        code: Mutex<Option<i32>>,
        cond: Condvar,
    }

    /// Scriptable [`Runtime`] that records calls and lets tests decide
    /// when processes exit.
    pub struct MockRuntime {
        calls: Mutex<Vec<String>>,
        next_pid: AtomicI32,
        gates: Mutex<HashMap<i32, Arc<ExitGate>>>,
        fail_operation: Mutex<Option<&'static str>>,
    }

    impl MockRuntime {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                next_pid: AtomicI32::new(1000),
                gates: Mutex::new(HashMap::new()),
                fail_operation: Mutex::new(None),
            })
        }

        /// Make the named operation fail until cleared.
        pub fn fail(&self, operation: &'static str) {
            *self.fail_operation.lock() = Some(operation);
        }

        /// Publish an exit code for `pid`, releasing its waiter.
        pub fn set_exit(&self, pid: i32, code: i32) {
            let gate = self
                .gates
                .lock()
                .get(&pid)
                .cloned()
                .expect("set_exit on an unknown pid");
            *gate.code.lock() = Some(code);
            gate.cond.notify_all();
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn check(&self, operation: &'static str) -> Result<()> {
            if *self.fail_operation.lock() == Some(operation) {
                return Err(Error::runtime(operation, "intentional failure"));
            }
            Ok(())
        }

        fn spawn_pid(&self) -> i32 {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.gates.lock().insert(
                pid,
                Arc::new(ExitGate {
                    code: Mutex::new(None),
                    cond: Condvar::new(),
                }),
            );
            pid
        }
    }

    impl Runtime for MockRuntime {
        fn create(&self, id: &str, bundle: &Path, config: &Value) -> Result<i32> {
            self.check("create")?;
            self.calls.lock().push(format!(
                "create {} bundle={} rootfs={}",
                id,
                bundle.display(),
                config["root"]["path"].as_str().unwrap_or("")
            ));
            Ok(self.spawn_pid())
        }

        fn start(&self, id: &str) -> Result<()> {
            self.check("start")?;
            self.calls.lock().push(format!("start {}", id));
            Ok(())
        }

        fn exec(&self, id: &str, process: &Value) -> Result<i32> {
            self.check("exec")?;
            self.calls
                .lock()
                .push(format!("exec {} args={}", id, process["args"]));
            Ok(self.spawn_pid())
        }

        fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()> {
            self.check("kill")?;
            self.calls
                .lock()
                .push(format!("kill {} {} all={}", id, signal, all));
            Ok(())
        }

        fn delete(&self, id: &str) -> Result<()> {
            self.check("delete")?;
            self.calls.lock().push(format!("delete {}", id));
            Ok(())
        }

        fn wait(&self, pid: i32) -> Result<i32> {
            let gate = self
                .gates
                .lock()
                .get(&pid)
                .cloned()
                .ok_or_else(|| Error::new(ErrorKind::ProcessNotFound { pid }))?;
            let mut code = gate.code.lock();
            while code.is_none() {
                gate.cond.wait(&mut code);
            }
            Ok(code.expect("guarded by the loop above"))
        }
    }
}
