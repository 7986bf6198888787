//! uvmd - guest control agent for Linux utility VMs
//!
//! uvmd runs as the init daemon of a utility VM and brokers container
//! lifecycle, process management, and dynamic storage attachment on behalf
//! of the hypervisor-side compute service.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  host compute service                           │
//! ├─────────────────────────────────────────────────┤
//! │  hypervisor socket (framed messages, port       │
//! │  0x40000000)                                    │
//! ├─────────────────────────────────────────────────┤
//! │  bridge engine (reader / dispatcher / writer)   │
//! ├─────────────────────────────────────────────────┤
//! │  handlers → supervisor → runc                   │
//! │           → scsi / pmem registries → mounts     │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! The bridge reads length-prefixed requests off the socket, dispatches
//! each to a handler on its own thread, and serializes every response and
//! unsolicited notification through a single writer. The supervisor
//! composes container rootfs storage from hotplugged PMEM layer devices
//! and SCSI scratch disks, then drives the OCI runtime.

pub mod bridge;
pub mod error;
pub mod handlers;
pub mod platform;
pub mod runc;
pub mod storage;
pub mod supervisor;
pub mod transport;

pub use error::{Error, Result};
