//! uvmd entry point.
//!
//! Wires the platform, device registries, runc driver, and supervisor into
//! the bridge and serves the host session until it dies. The agent is
//! stateless between sessions; a fatal session error ends the process and
//! the VM init layer restarts it.

use std::sync::Arc;

use tracing::{error, info, warn};

use uvmd::bridge::Bridge;
use uvmd::handlers::Api;
use uvmd::platform::LinuxPlatform;
use uvmd::runc::RuncRuntime;
use uvmd::storage::pmem::PmemRegistry;
use uvmd::storage::scsi::ScsiRegistry;
use uvmd::supervisor::Supervisor;
use uvmd::transport::HvsockTransport;

fn main() {
    // Quick --version check (used by image build tooling).
    if std::env::args().any(|arg| arg == "--version") {
        println!("{}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("uvmd=info".parse().expect("valid directive")),
        )
        .init();

    // Container inits are not our direct children; runc detaches them.
    // Becoming a subreaper lets the supervisor reap their exit codes.
    if let Err(errno) = nix::sys::prctl::set_child_subreaper(true) {
        warn!(error = %errno, "failed to become child subreaper");
    }

    let platform: Arc<dyn uvmd::platform::Platform> = Arc::new(LinuxPlatform);
    let scsi = ScsiRegistry::new(Arc::clone(&platform));
    let pmem = PmemRegistry::new(Arc::clone(&platform));
    let runtime = RuncRuntime::new();
    let supervisor = Supervisor::new(runtime, platform, scsi, pmem);

    let bridge = Bridge::new(Box::new(HvsockTransport));
    let api = Api::new(supervisor, bridge.notifier());
    let mux = Arc::new(api.mux());

    info!(version = env!("CARGO_PKG_VERSION"), "uvmd starting");
    match bridge.listen_and_serve(mux) {
        Ok(()) => info!("session closed"),
        Err(err) => {
            error!(error = %err, "session failed");
            std::process::exit(1);
        }
    }
}
