//! Error types for uvmd.
//!
//! Every error carries an HRESULT for the wire plus the source location it
//! was raised at, which the bridge folds into the response's error record.
//!
//! Errors are cheap to clone: device registries cache the outcome of a
//! failed resolution and hand the identical error to every subsequent
//! caller, so I/O causes are captured in [`Io`], a cloneable snapshot that
//! preserves the original [`std::io::ErrorKind`].

use std::fmt;
use std::panic::Location;

use thiserror::Error;
use uvmd_protocol::{hresult, ErrorRecord};

/// Result type alias using uvmd's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Module name reported in wire error records.
const MODULE_NAME: &str = "uvmd";

/// Cloneable snapshot of an I/O failure.
#[derive(Debug, Clone)]
pub struct Io {
    kind: std::io::ErrorKind,
    message: String,
}

impl Io {
    /// The kind of the captured I/O error.
    pub fn kind(&self) -> std::io::ErrorKind {
        self.kind
    }

    /// True if the captured error was "not found".
    pub fn is_not_found(&self) -> bool {
        self.kind == std::io::ErrorKind::NotFound
    }
}

impl From<std::io::Error> for Io {
    fn from(err: std::io::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Io {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Io {}

/// The failure classes uvmd can report.
#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    // ========================================================================
    // Bridge / transport
    // ========================================================================
    /// Dialing the host command connection failed.
    #[error("bridge connection failed on port 0x{port:08x}: {source}")]
    Dial {
        /// Hypervisor socket port.
        port: u32,
        /// Underlying socket error.
        #[source]
        source: Io,
    },

    /// A read or write on the command connection failed.
    #[error("bridge {context} failed: {source}")]
    Transport {
        /// What the bridge was doing, e.g. "reading message header".
        context: &'static str,
        /// Underlying stream error.
        #[source]
        source: Io,
    },

    /// An inbound header declared a size smaller than the header itself.
    #[error("message size {size} is smaller than the message header")]
    InvalidMessageSize {
        /// Declared total size.
        size: u32,
    },

    /// A payload document failed to decode.
    #[error("failed to unmarshal {context}: {reason}")]
    Decode {
        /// What was being decoded.
        context: String,
        /// Decoder error text.
        reason: String,
    },

    /// A response document failed to encode.
    #[error("failed to marshal {context}: {reason}")]
    Encode {
        /// What was being encoded.
        context: String,
        /// Encoder error text.
        reason: String,
    },

    /// No handler is registered for the message type.
    #[error("message type not supported: 0x{message_type:08x}")]
    UnsupportedMessage {
        /// The unhandled message identifier.
        message_type: u32,
    },

    // ========================================================================
    // Device resolution
    // ========================================================================
    /// Enumerating a device directory failed for a reason other than
    /// "not found".
    #[error("device enumeration failed: {path}: {source}")]
    DeviceEnumeration {
        /// The sysfs directory being listed.
        path: String,
        /// Underlying filesystem error.
        #[source]
        source: Io,
    },

    /// The device never appeared before the lookup deadline.
    #[error("timed out waiting for scsi device: {path}")]
    DeviceTimeout {
        /// The sysfs directory being polled.
        path: String,
        /// The last "not found" error observed.
        #[source]
        source: Io,
    },

    /// The device directory exists but holds no block device name.
    #[error("no matching device names found for scsi device: {path}")]
    NoMatchingDevices {
        /// The sysfs directory that was listed.
        path: String,
    },

    /// The device directory holds more than one block device name.
    #[error("more than one block device could match scsi device: {path}")]
    MultipleMatchingDevices {
        /// The sysfs directory that was listed.
        path: String,
    },

    // ========================================================================
    // Mounts
    // ========================================================================
    /// The mount syscall failed.
    #[error("mount failed: source {source_path} target {target}: {source}")]
    Mount {
        /// Device or filesystem being mounted.
        source_path: String,
        /// Mount target.
        target: String,
        /// Underlying syscall error.
        #[source]
        source: Io,
    },

    /// The target is not currently mounted.
    #[error("path not mounted: {target}")]
    PathNotMounted {
        /// The target that was asked to unmount.
        target: String,
    },

    /// The unmount syscall failed.
    #[error("unmount failed: {target}: {source}")]
    Unmount {
        /// Mount target.
        target: String,
        /// Underlying syscall error.
        #[source]
        source: Io,
    },

    /// A directory needed for a mount could not be created.
    #[error("directory creation failed: {path}: {source}")]
    CreateDir {
        /// The directory being created.
        path: String,
        /// Underlying filesystem error.
        #[source]
        source: Io,
    },

    /// A read-only overlay was requested together with writable layers.
    #[error("upperdir {upperdir:?} and workdir {workdir:?} must be empty for a readonly overlay")]
    ReadonlyScratch {
        /// Requested upper directory.
        upperdir: String,
        /// Requested work directory.
        workdir: String,
    },

    // ========================================================================
    // Containers and processes
    // ========================================================================
    /// No container with the given id exists.
    #[error("container not found: {id}")]
    ContainerNotFound {
        /// Requested container id.
        id: String,
    },

    /// A container with the given id already exists.
    #[error("container already exists: {id}")]
    ContainerExists {
        /// Requested container id.
        id: String,
    },

    /// The container is in the wrong state for the operation.
    #[error("container {id} cannot {operation} in state {state}")]
    InvalidState {
        /// Container id.
        id: String,
        /// The rejected operation.
        operation: &'static str,
        /// The container's current state.
        state: &'static str,
    },

    /// No process with the given pid is tracked.
    #[error("process not found: {pid}")]
    ProcessNotFound {
        /// Requested pid.
        pid: i32,
    },

    /// Signalling every process in the cgroup requires the init pid.
    #[error("cannot signal all processes when pid {pid} is not the init pid")]
    InvalidSignalScope {
        /// The non-init pid the request named.
        pid: i32,
    },

    /// The request named a signal number the platform does not know.
    #[error("unknown signal number: {signal}")]
    UnknownSignal {
        /// The offending signal number.
        signal: i32,
    },

    /// A settings document referenced a device by something other than its
    /// decimal number.
    #[error("invalid device reference: {value:?}")]
    InvalidDeviceReference {
        /// The offending reference.
        value: String,
    },

    /// Delivering a signal failed.
    #[error("signal delivery to pid {pid} failed: {source}")]
    Signal {
        /// Target pid.
        pid: i32,
        /// Underlying syscall error.
        #[source]
        source: Io,
    },

    /// The OCI runtime reported a failure.
    #[error("runtime {operation} failed: {reason}")]
    Runtime {
        /// The runtime operation, e.g. "create".
        operation: String,
        /// The runtime's error output.
        reason: String,
    },

    // ========================================================================
    // Resource modification
    // ========================================================================
    /// The modify-settings union carried a tag this agent does not handle.
    #[error("resource type not supported: {tag}")]
    UnsupportedResource {
        /// The offending tag.
        tag: String,
    },

    /// A mount was requested inside the container namespace.
    #[error("mapped resources must be created in the utility vm")]
    NamespaceMount,
}

impl ErrorKind {
    fn hresult(&self) -> i32 {
        match self {
            ErrorKind::Decode { .. } | ErrorKind::InvalidMessageSize { .. } => {
                hresult::INVALID_DATA
            }
            ErrorKind::UnsupportedMessage { .. } | ErrorKind::UnsupportedResource { .. } => {
                hresult::NOT_IMPL
            }
            ErrorKind::DeviceTimeout { .. } => hresult::TIMEOUT,
            ErrorKind::ContainerNotFound { .. }
            | ErrorKind::ProcessNotFound { .. }
            | ErrorKind::PathNotMounted { .. } => hresult::NOT_FOUND,
            ErrorKind::ContainerExists { .. } => hresult::ALREADY_EXISTS,
            ErrorKind::InvalidState { .. } => hresult::INVALID_STATE,
            ErrorKind::InvalidSignalScope { .. }
            | ErrorKind::UnknownSignal { .. }
            | ErrorKind::InvalidDeviceReference { .. }
            | ErrorKind::NamespaceMount
            | ErrorKind::ReadonlyScratch { .. } => hresult::INVALID_ARG,
            _ => hresult::FAIL,
        }
    }
}

/// An error with its HRESULT and origin location.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    location: &'static Location<'static>,
}

impl Error {
    /// Wrap an [`ErrorKind`], capturing the caller's source location.
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            location: Location::caller(),
        }
    }

    /// Build a decode error from a JSON decoder failure.
    #[track_caller]
    pub fn decode(context: impl Into<String>, err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Decode {
            context: context.into(),
            reason: err.to_string(),
        })
    }

    /// Build a runtime error from an operation name and its output.
    #[track_caller]
    pub fn runtime(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime {
            operation: operation.into(),
            reason: reason.into(),
        })
    }

    /// The failure class.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The HRESULT reported for this error on the wire.
    pub fn hresult(&self) -> i32 {
        self.kind.hresult()
    }

    /// Source file the error was raised in.
    pub fn file(&self) -> &'static str {
        self.location.file()
    }

    /// Source line the error was raised at.
    pub fn line(&self) -> u32 {
        self.location.line()
    }

    /// Fold this error into a wire error record.
    pub fn to_error_record(&self) -> ErrorRecord {
        ErrorRecord {
            result: self.hresult(),
            message: self.to_string(),
            stack_trace: format!("{}:{}", self.location.file(), self.location.line()),
            module_name: MODULE_NAME.to_string(),
            file_name: self.location.file().to_string(),
            line: self.location.line(),
            function_name: String::new(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}
