//! Runc OCI runtime command adapter.
//!
//! Thin driver invoking the `runc` binary with consistent configuration.
//! The agent runs as child subreaper (set in `main`), so container inits
//! created by `runc create` reparent to the agent when runc exits and
//! [`Runtime::wait`] can reap real exit codes with `waitpid`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::supervisor::Runtime;

/// Path to the runc binary.
const RUNC_PATH: &str = "/usr/bin/runc";

/// Runtime state directory, kept off the default `/run/runc` so the agent
/// owns its own namespace of container ids.
const RUNC_ROOT_DIR: &str = "/run/uvmd/runc";

/// Builder for runc invocations with consistent global options.
struct RuncCommand {
    cmd: Command,
}

impl RuncCommand {
    fn new() -> Self {
        let mut cmd = Command::new(RUNC_PATH);
        cmd.args(["--root", RUNC_ROOT_DIR]);
        cmd.stdin(Stdio::null());
        Self { cmd }
    }

    /// `runc create --bundle <dir> --pid-file <file> <id>`
    fn create(bundle: &Path, pid_file: &Path, id: &str) -> Self {
        let mut c = Self::new();
        c.cmd
            .arg("create")
            .arg("--bundle")
            .arg(bundle)
            .arg("--pid-file")
            .arg(pid_file)
            .arg(id);
        c
    }

    /// `runc start <id>`
    fn start(id: &str) -> Self {
        let mut c = Self::new();
        c.cmd.args(["start", id]);
        c
    }

    /// `runc exec --detach --process <file> --pid-file <file> <id>`
    fn exec(id: &str, process_file: &Path, pid_file: &Path) -> Self {
        let mut c = Self::new();
        c.cmd
            .arg("exec")
            .arg("--detach")
            .arg("--process")
            .arg(process_file)
            .arg("--pid-file")
            .arg(pid_file)
            .arg(id);
        c
    }

    /// `runc kill [--all] <id> <signal>`
    fn kill(id: &str, signal: Signal, all: bool) -> Self {
        let mut c = Self::new();
        c.cmd.arg("kill");
        if all {
            c.cmd.arg("--all");
        }
        c.cmd.arg(id).arg((signal as i32).to_string());
        c
    }

    /// `runc delete <id>`
    fn delete(id: &str) -> Self {
        let mut c = Self::new();
        c.cmd.args(["delete", id]);
        c
    }

    /// Run to completion, mapping a nonzero exit into a runtime error
    /// carrying runc's stderr.
    fn run(mut self, operation: &'static str) -> Result<()> {
        let output = self
            .cmd
            .output()
            .map_err(|err| Error::runtime(operation, err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::runtime(operation, stderr.trim().to_string()));
        }
        Ok(())
    }
}

fn read_pid_file(path: &Path) -> Result<i32> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| Error::runtime("read pid file", err.to_string()))?;
    contents
        .trim()
        .parse()
        .map_err(|_| Error::runtime("read pid file", format!("invalid pid {:?}", contents)))
}

/// [`Runtime`] implementation backed by the runc binary.
pub struct RuncRuntime {
    /// Bundle directory per container, recorded at create time so exec can
    /// stage its process documents next to the config.
    bundles: Mutex<HashMap<String, PathBuf>>,
    exec_counter: AtomicU64,
}

impl RuncRuntime {
    /// Create an adapter with no known containers.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bundles: Mutex::new(HashMap::new()),
            exec_counter: AtomicU64::new(0),
        })
    }
}

impl Runtime for RuncRuntime {
    fn create(&self, id: &str, bundle: &Path, config: &Value) -> Result<i32> {
        let config_bytes = serde_json::to_vec_pretty(config)
            .map_err(|err| Error::runtime("create", err.to_string()))?;
        std::fs::write(bundle.join("config.json"), config_bytes)
            .map_err(|err| Error::runtime("create", err.to_string()))?;

        let pid_file = bundle.join("init.pid");
        RuncCommand::create(bundle, &pid_file, id).run("create")?;
        let pid = read_pid_file(&pid_file)?;
        self.bundles.lock().insert(id.to_string(), bundle.to_path_buf());
        debug!(container_id = %id, pid, "runc created container");
        Ok(pid)
    }

    fn start(&self, id: &str) -> Result<()> {
        RuncCommand::start(id).run("start")
    }

    fn exec(&self, id: &str, process: &Value) -> Result<i32> {
        let bundle = self
            .bundles
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::runtime("exec", format!("unknown container {}", id)))?;

        let sequence = self.exec_counter.fetch_add(1, Ordering::SeqCst);
        let process_file = bundle.join(format!("process{}.json", sequence));
        let pid_file = bundle.join(format!("process{}.pid", sequence));
        let process_bytes = serde_json::to_vec(process)
            .map_err(|err| Error::runtime("exec", err.to_string()))?;
        std::fs::write(&process_file, process_bytes)
            .map_err(|err| Error::runtime("exec", err.to_string()))?;

        RuncCommand::exec(id, &process_file, &pid_file).run("exec")?;
        read_pid_file(&pid_file)
    }

    fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()> {
        RuncCommand::kill(id, signal, all).run("kill")
    }

    fn delete(&self, id: &str) -> Result<()> {
        RuncCommand::delete(id).run("delete")?;
        self.bundles.lock().remove(id);
        Ok(())
    }

    fn wait(&self, pid: i32) -> Result<i32> {
        // Orphaned container processes reparent to the agent (child
        // subreaper), so a plain waitpid observes their exit.
        loop {
            match waitpid(Pid::from_raw(pid), None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(Error::runtime("wait", errno.desc())),
            }
        }
    }
}
