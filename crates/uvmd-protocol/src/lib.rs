//! Wire protocol types for host-guest communication over the bridge.
//!
//! This crate defines the framed message protocol spoken between the
//! hypervisor-side compute service and the uvmd agent running inside the
//! utility VM.
//!
//! # Protocol Overview
//!
//! Every message begins with a fixed 16-byte little-endian header followed
//! by a JSON payload document:
//!
//! ```text
//! +-----------+-----------+-----------+------------------------+
//! | type (4)  | size (4)  | id (8)    | JSON payload           |
//! +-----------+-----------+-----------+------------------------+
//! ```
//!
//! `size` counts the header plus the payload. `id` correlates responses to
//! requests; id 0 is reserved for unsolicited notifications.

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};

/// Protocol version selected by the agent during container creation.
pub const PROTOCOL_VERSION: u32 = 3;

/// The hypervisor socket port the host sends commands over.
pub const COMMAND_PORT: u32 = 0x4000_0000;

/// Size of the fixed message header in bytes.
pub const MESSAGE_HEADER_SIZE: usize = 16;

// ============================================================================
// Message identifiers
// ============================================================================

/// Message class bits occupying the top nibble of an identifier.
pub const MT_REQUEST: u32 = 0x1000_0000;
/// Response class bit pattern.
pub const MT_RESPONSE: u32 = 0x2000_0000;
/// Notification class bit pattern.
pub const MT_NOTIFY: u32 = 0x3000_0000;

const MT_MASK: u32 = 0xF000_0000;

/// Message category for container operations.
pub const MC_CONTAINER: u32 = 0x0010_0000;

/// Create a container.
pub const CONTAINER_CREATE_V1: u32 = 0x1010_0101;
/// Shut a container down gracefully (SIGTERM to init).
pub const CONTAINER_SHUTDOWN_GRACEFUL_V1: u32 = 0x1010_0301;
/// Shut a container down forcefully (SIGKILL to init).
pub const CONTAINER_SHUTDOWN_FORCED_V1: u32 = 0x1010_0401;
/// Execute a process, either in a container or directly in the utility VM.
pub const CONTAINER_EXECUTE_PROCESS_V1: u32 = 0x1010_0501;
/// Wait for a process to exit and retrieve its exit code.
pub const CONTAINER_WAIT_FOR_PROCESS_V1: u32 = 0x1010_0601;
/// Deliver a signal to a process.
pub const CONTAINER_SIGNAL_PROCESS_V1: u32 = 0x1010_0701;
/// Resize the console of a process.
pub const CONTAINER_RESIZE_CONSOLE_V1: u32 = 0x1010_0801;
/// Query container properties (process list).
pub const CONTAINER_GET_PROPERTIES_V1: u32 = 0x1010_0901;
/// Modify container resources (attach/detach storage).
pub const CONTAINER_MODIFY_SETTINGS_V1: u32 = 0x1010_0A01;
/// Unsolicited container lifecycle notification.
pub const CONTAINER_NOTIFICATION_V1: u32 = 0x3010_0101;

/// Derive the response identifier for a request identifier by swapping the
/// message class bits.
pub fn response_identifier(request: u32) -> u32 {
    (request & !MT_MASK) | MT_RESPONSE
}

// ============================================================================
// Message header
// ============================================================================

/// Fixed-size header preceding every message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message identifier.
    pub message_type: u32,
    /// Total message size in bytes, header included.
    pub size: u32,
    /// Correlation id; 0 for notifications.
    pub id: u64,
}

impl MessageHeader {
    /// Encode the header into its 16-byte little-endian wire form.
    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut buf = [0u8; MESSAGE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.message_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf
    }

    /// Decode a header from its 16-byte little-endian wire form.
    pub fn decode(buf: &[u8; MESSAGE_HEADER_SIZE]) -> Self {
        Self {
            message_type: u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            size: u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
            id: u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes")),
        }
    }
}

// ============================================================================
// Common payload fragments
// ============================================================================

/// Fields present at the top of every request document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBase {
    /// The container the request targets.
    #[serde(rename = "ContainerID", default)]
    pub container_id: String,
    /// Opaque correlation token echoed into responses and notifications.
    #[serde(rename = "ActivityID", default)]
    pub activity_id: String,
}

/// One error carried in a failed response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// HRESULT for this error.
    #[serde(rename = "Result")]
    pub result: i32,
    /// Human-readable message.
    #[serde(rename = "Message")]
    pub message: String,
    /// Formatted stack information, if available.
    #[serde(rename = "StackTrace", default)]
    pub stack_trace: String,
    /// Reporting module.
    #[serde(rename = "ModuleName", default)]
    pub module_name: String,
    /// Source file of the error origin.
    #[serde(rename = "FileName", default)]
    pub file_name: String,
    /// Source line of the error origin.
    #[serde(rename = "Line", default)]
    pub line: u32,
    /// Function name of the error origin.
    #[serde(rename = "FunctionName", default)]
    pub function_name: String,
}

/// Fields present at the top of every response document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageResponseBase {
    /// Zero on success, otherwise the first error record's HRESULT.
    #[serde(rename = "Result", default)]
    pub result: i32,
    /// Echo of the request's activity id.
    #[serde(rename = "ActivityID", default)]
    pub activity_id: String,
    /// Errors describing a failure, most specific first.
    #[serde(rename = "ErrorRecords", default, skip_serializing_if = "Vec::is_empty")]
    pub error_records: Vec<ErrorRecord>,
}

// ============================================================================
// Container lifecycle
// ============================================================================

/// Create-container request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerCreate {
    /// Common request fields.
    #[serde(flatten)]
    pub base: MessageBase,
    /// JSON string holding a [`VmHostedContainerSettings`] document.
    #[serde(rename = "ContainerConfig", default)]
    pub container_config: String,
}

/// Create-container response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerCreateResponse {
    /// Common response fields.
    #[serde(flatten)]
    pub base: MessageResponseBase,
    /// Protocol version the agent selected for this session.
    #[serde(rename = "SelectedProtocolVersion")]
    pub selected_protocol_version: u32,
}

/// One read-only layer device backing a container rootfs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Layer {
    /// Decimal PMEM device number holding the layer filesystem.
    #[serde(rename = "Path", default)]
    pub path: String,
}

/// Storage and runtime settings carried inside the create request's
/// `ContainerConfig` string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmHostedContainerSettings {
    /// Read-only layers, topmost first.
    #[serde(rename = "Layers", default)]
    pub layers: Vec<Layer>,
    /// Decimal SCSI LUN of the writable scratch device; empty for a
    /// read-only rootfs.
    #[serde(rename = "ScratchPath", default)]
    pub scratch_path: String,
    /// OCI runtime configuration for the container; the agent fills in the
    /// rootfs path it composes.
    #[serde(rename = "OCISpecification", default)]
    pub oci_specification: serde_json::Value,
}

// ============================================================================
// Process operations
// ============================================================================

/// Parameters for a process to launch, carried as a JSON string inside
/// [`ExecuteProcessSettings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessParameters {
    /// Argument vector; the first entry is the executable.
    #[serde(rename = "CommandArgs", default)]
    pub command_args: Vec<String>,
    /// Environment variables.
    #[serde(rename = "Environment", default)]
    pub environment: std::collections::HashMap<String, String>,
    /// Working directory for the process.
    #[serde(rename = "WorkingDirectory", default)]
    pub working_directory: String,
    /// Whether the process wants a console.
    #[serde(rename = "EmulateConsole", default)]
    pub emulate_console: bool,
    /// Run directly in the utility VM rather than inside a container.
    #[serde(rename = "IsExternal", default)]
    pub is_external: bool,
    /// Relay stdin over an auxiliary socket channel.
    #[serde(rename = "CreateStdInPipe", default)]
    pub create_std_in_pipe: bool,
    /// Relay stdout over an auxiliary socket channel.
    #[serde(rename = "CreateStdOutPipe", default)]
    pub create_std_out_pipe: bool,
    /// Relay stderr over an auxiliary socket channel.
    #[serde(rename = "CreateStdErrPipe", default)]
    pub create_std_err_pipe: bool,
}

/// Auxiliary socket ports for the stdio relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VsockStdioRelaySettings {
    /// Port for stdin.
    #[serde(rename = "StdIn", default)]
    pub std_in: u32,
    /// Port for stdout.
    #[serde(rename = "StdOut", default)]
    pub std_out: u32,
    /// Port for stderr.
    #[serde(rename = "StdErr", default)]
    pub std_err: u32,
}

/// Settings for an execute-process request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteProcessSettings {
    /// JSON string holding a [`ProcessParameters`] document.
    #[serde(rename = "ProcessParameters", default)]
    pub process_parameters: String,
    /// Stdio relay ports.
    #[serde(rename = "VsockStdioRelaySettings", default)]
    pub vsock_stdio_relay_settings: VsockStdioRelaySettings,
}

/// Execute-process request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerExecuteProcess {
    /// Common request fields.
    #[serde(flatten)]
    pub base: MessageBase,
    /// Process settings.
    #[serde(rename = "Settings", default)]
    pub settings: ExecuteProcessSettings,
}

/// Execute-process response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerExecuteProcessResponse {
    /// Common response fields.
    #[serde(flatten)]
    pub base: MessageResponseBase,
    /// Pid of the launched process.
    #[serde(rename = "ProcessID")]
    pub process_id: u32,
}

/// Options for a signal-process request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalProcessOptions {
    /// Signal number to deliver; 0 means SIGKILL by host convention.
    #[serde(rename = "Signal", default)]
    pub signal: i32,
    /// Deliver the signal to every process in the container's cgroup.
    /// Only valid when the target pid is the container's init process.
    #[serde(rename = "All", default)]
    pub all: bool,
}

/// Signal-process request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSignalProcess {
    /// Common request fields.
    #[serde(flatten)]
    pub base: MessageBase,
    /// Pid to signal.
    #[serde(rename = "ProcessID", default)]
    pub process_id: u32,
    /// Signal options.
    #[serde(rename = "Options", default)]
    pub options: SignalProcessOptions,
}

/// Wait-for-process request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerWaitForProcess {
    /// Common request fields.
    #[serde(flatten)]
    pub base: MessageBase,
    /// Pid to wait on.
    #[serde(rename = "ProcessID", default)]
    pub process_id: u32,
    /// Host-side timeout hint in milliseconds; the agent waits indefinitely.
    #[serde(rename = "TimeoutInMs", default)]
    pub timeout_in_ms: u64,
}

/// Wait-for-process response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerWaitForProcessResponse {
    /// Common response fields.
    #[serde(flatten)]
    pub base: MessageResponseBase,
    /// Exit code of the process.
    #[serde(rename = "ExitCode")]
    pub exit_code: u32,
}

/// Get-properties request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerGetProperties {
    /// Common request fields.
    #[serde(flatten)]
    pub base: MessageBase,
}

/// Get-properties response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerGetPropertiesResponse {
    /// Common response fields.
    #[serde(flatten)]
    pub base: MessageResponseBase,
    /// JSON string holding an array of [`ProcessDetails`].
    #[serde(rename = "Properties", default)]
    pub properties: String,
}

/// One entry in the process list returned by get-properties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessDetails {
    /// Pid of the process.
    #[serde(rename = "ProcessId")]
    pub process_id: u32,
}

/// Resize-console request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerResizeConsole {
    /// Common request fields.
    #[serde(flatten)]
    pub base: MessageBase,
    /// Pid whose console to resize.
    #[serde(rename = "ProcessID", default)]
    pub process_id: u32,
    /// New height in character cells.
    #[serde(rename = "Height", default)]
    pub height: u16,
    /// New width in character cells.
    #[serde(rename = "Width", default)]
    pub width: u16,
}

// ============================================================================
// Resource modification
// ============================================================================

/// Resource class being modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    /// A block device attached over virtual SCSI.
    MappedVirtualDisk,
    /// A host directory shared over an auxiliary channel.
    MappedDirectory,
    /// A tag this agent does not recognize.
    #[serde(other)]
    Unknown,
}

impl Default for ResourceType {
    fn default() -> Self {
        ResourceType::Unknown
    }
}

/// Direction of a resource modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    /// Attach the resource.
    Add,
    /// Detach the resource.
    Remove,
}

impl Default for RequestType {
    fn default() -> Self {
        RequestType::Add
    }
}

/// The tagged resource-modification union.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceModificationRequest {
    /// Which resource class `settings` describes.
    #[serde(rename = "ResourceType", default)]
    pub resource_type: ResourceType,
    /// Attach or detach.
    #[serde(rename = "RequestType", default)]
    pub request_type: RequestType,
    /// The resource document; decoded per `resource_type`.
    #[serde(rename = "Settings", default)]
    pub settings: serde_json::Value,
}

/// Modify-settings request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerModifySettings {
    /// Common request fields.
    #[serde(flatten)]
    pub base: MessageBase,
    /// The modification to apply.
    #[serde(rename = "Request", default)]
    pub request: ResourceModificationRequest,
}

/// Settings for a [`ResourceType::MappedVirtualDisk`] modification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappedVirtualDisk {
    /// Absolute mount target inside the utility VM.
    #[serde(rename = "ContainerPath", default)]
    pub container_path: String,
    /// SCSI LUN of the disk on controller 0.
    #[serde(rename = "Lun", default)]
    pub lun: u8,
    /// The mount is established in the utility VM, not the container
    /// namespace. This agent requires it to be true.
    #[serde(rename = "CreateInUtilityVM", default)]
    pub create_in_utility_vm: bool,
    /// Mount read-only.
    #[serde(rename = "ReadOnly", default)]
    pub read_only: bool,
    /// Resolve the device but do not mount it.
    #[serde(rename = "AttachOnly", default)]
    pub attach_only: bool,
}

/// Settings for a [`ResourceType::MappedDirectory`] modification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappedDirectory {
    /// Absolute mount target inside the utility VM.
    #[serde(rename = "ContainerPath", default)]
    pub container_path: String,
    /// The mount is established in the utility VM, not the container
    /// namespace.
    #[serde(rename = "CreateInUtilityVM", default)]
    pub create_in_utility_vm: bool,
    /// Mount read-only.
    #[serde(rename = "ReadOnly", default)]
    pub read_only: bool,
    /// Auxiliary socket port the share relay is served on.
    #[serde(rename = "Port", default)]
    pub port: u32,
}

// ============================================================================
// Notifications
// ============================================================================

/// Kind of container notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    /// The container's init process exited without the host asking for it.
    UnexpectedExit,
}

/// Operation associated with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityOperation {
    /// No operation was in flight.
    None,
}

/// Unsolicited container lifecycle notification, sent with message id 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerNotification {
    /// Container and activity the notification belongs to.
    #[serde(flatten)]
    pub base: MessageBase,
    /// Notification kind.
    #[serde(rename = "Type")]
    pub notification_type: NotificationType,
    /// Associated operation.
    #[serde(rename = "Operation")]
    pub operation: ActivityOperation,
    /// Integer result; the init exit code for unexpected exits.
    #[serde(rename = "Result")]
    pub result: i32,
    /// Free-form detail string.
    #[serde(rename = "ResultInfo", default)]
    pub result_info: String,
}

// ============================================================================
// HRESULT constants
// ============================================================================

/// HRESULT status codes used on the wire. Zero is success; nonzero encodes
/// an error class and code.
pub mod hresult {
    /// Generic failure (E_FAIL).
    pub const FAIL: i32 = 0x8000_4005u32 as i32;
    /// The operation is not implemented (E_NOTIMPL).
    pub const NOT_IMPL: i32 = 0x8000_4001u32 as i32;
    /// An argument is invalid (E_INVALIDARG).
    pub const INVALID_ARG: i32 = 0x8007_0057u32 as i32;
    /// A payload document could not be decoded (ERROR_INVALID_DATA).
    pub const INVALID_DATA: i32 = 0x8007_000Du32 as i32;
    /// An operation timed out (ERROR_TIMEOUT).
    pub const TIMEOUT: i32 = 0x8007_05B4u32 as i32;
    /// The referenced object does not exist (ERROR_NOT_FOUND).
    pub const NOT_FOUND: i32 = 0x8007_0490u32 as i32;
    /// The object already exists (ERROR_ALREADY_EXISTS).
    pub const ALREADY_EXISTS: i32 = 0x8007_00B7u32 as i32;
    /// The object is in the wrong state for the request (ERROR_INVALID_STATE).
    pub const INVALID_STATE: i32 = 0x8007_139Fu32 as i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = MessageHeader {
            message_type: CONTAINER_CREATE_V1,
            size: 0x1234,
            id: 0xDEAD_BEEF_0042,
        };
        let decoded = MessageHeader::decode(&header.encode());
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_wire_layout_is_little_endian() {
        let header = MessageHeader {
            message_type: 0x0102_0304,
            size: 0x0506_0708,
            id: 0x090A_0B0C_0D0E_0F10,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[0x08, 0x07, 0x06, 0x05]);
        assert_eq!(
            &bytes[8..16],
            &[0x10, 0x0F, 0x0E, 0x0D, 0x0C, 0x0B, 0x0A, 0x09]
        );
    }

    #[test]
    fn test_response_identifier_sets_response_class() {
        assert_eq!(
            response_identifier(CONTAINER_CREATE_V1),
            0x2010_0101,
            "response keeps category and operation bits"
        );
        assert_eq!(
            response_identifier(CONTAINER_MODIFY_SETTINGS_V1),
            0x2010_0A01
        );
    }

    #[test]
    fn test_create_request_field_names() {
        let request: ContainerCreate = serde_json::from_str(
            r#"{"ContainerID":"test","ActivityID":"act","ContainerConfig":"{}"}"#,
        )
        .expect("valid create request");
        assert_eq!(request.base.container_id, "test");
        assert_eq!(request.base.activity_id, "act");
        assert_eq!(request.container_config, "{}");
    }

    #[test]
    fn test_response_base_omits_empty_error_records() {
        let response = MessageResponseBase {
            result: 0,
            activity_id: "act".to_string(),
            error_records: Vec::new(),
        };
        let json = serde_json::to_string(&response).expect("serializable");
        assert!(!json.contains("ErrorRecords"));
        assert!(json.contains(r#""Result":0"#));
    }

    #[test]
    fn test_error_record_field_names() {
        let record = ErrorRecord {
            result: hresult::FAIL,
            message: "boom".to_string(),
            module_name: "uvmd".to_string(),
            file_name: "src/lib.rs".to_string(),
            line: 7,
            ..Default::default()
        };
        let json = serde_json::to_value(&record).expect("serializable");
        assert_eq!(json["Result"], hresult::FAIL);
        assert_eq!(json["Message"], "boom");
        assert_eq!(json["ModuleName"], "uvmd");
        assert_eq!(json["FileName"], "src/lib.rs");
        assert_eq!(json["Line"], 7);
    }

    #[test]
    fn test_modify_settings_unknown_resource_tag() {
        let request: ContainerModifySettings = serde_json::from_str(
            r#"{"ContainerID":"test","Request":{"ResourceType":"MappedPipe","RequestType":"Add","Settings":{}}}"#,
        )
        .expect("unknown tags still decode");
        assert_eq!(request.request.resource_type, ResourceType::Unknown);
    }

    #[test]
    fn test_mapped_virtual_disk_settings_decode() {
        let request: ContainerModifySettings = serde_json::from_str(
            r#"{"Request":{"ResourceType":"MappedVirtualDisk","RequestType":"Add","Settings":{"ContainerPath":"/mnt/layer","Lun":4,"CreateInUtilityVM":true,"ReadOnly":true}}}"#,
        )
        .expect("valid modify request");
        assert_eq!(
            request.request.resource_type,
            ResourceType::MappedVirtualDisk
        );
        let disk: MappedVirtualDisk =
            serde_json::from_value(request.request.settings).expect("valid disk settings");
        assert_eq!(disk.container_path, "/mnt/layer");
        assert_eq!(disk.lun, 4);
        assert!(disk.create_in_utility_vm);
        assert!(disk.read_only);
        assert!(!disk.attach_only);
    }

    #[test]
    fn test_notification_serializes_type_and_result() {
        let notification = ContainerNotification {
            base: MessageBase {
                container_id: "test".to_string(),
                activity_id: "act".to_string(),
            },
            notification_type: NotificationType::UnexpectedExit,
            operation: ActivityOperation::None,
            result: -1,
            result_info: String::new(),
        };
        let json = serde_json::to_value(&notification).expect("serializable");
        assert_eq!(json["ContainerID"], "test");
        assert_eq!(json["Type"], "UnexpectedExit");
        assert_eq!(json["Operation"], "None");
        assert_eq!(json["Result"], -1);
    }
}
