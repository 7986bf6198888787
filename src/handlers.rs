//! Message handlers.
//!
//! Binds the bridge multiplexer to the supervisor: each handler decodes
//! its payload document, invokes the matching supervisor operation, and
//! answers with a typed response or an error envelope. This is where the
//! low-level JSON translation lives; the supervisor never sees the wire.

use std::sync::Arc;
use std::thread;

use nix::sys::signal::Signal;
use serde::Serialize;
use tracing::error;
use uvmd_protocol::{
    ActivityOperation, ContainerCreate, ContainerCreateResponse, ContainerExecuteProcess,
    ContainerExecuteProcessResponse, ContainerGetProperties, ContainerGetPropertiesResponse,
    ContainerModifySettings, ContainerNotification, ContainerResizeConsole,
    ContainerSignalProcess, ContainerWaitForProcess, ContainerWaitForProcessResponse,
    MessageBase, MessageResponseBase, NotificationType, ProcessDetails, ProcessParameters,
    VmHostedContainerSettings, CONTAINER_CREATE_V1, CONTAINER_EXECUTE_PROCESS_V1,
    CONTAINER_GET_PROPERTIES_V1, CONTAINER_MODIFY_SETTINGS_V1, CONTAINER_RESIZE_CONSOLE_V1,
    CONTAINER_SHUTDOWN_FORCED_V1, CONTAINER_SHUTDOWN_GRACEFUL_V1, CONTAINER_SIGNAL_PROCESS_V1,
    CONTAINER_WAIT_FOR_PROCESS_V1, PROTOCOL_VERSION,
};

use crate::bridge::{Mux, Notifier, Request, ResponseWriter};
use crate::error::{Error, ErrorKind};
use crate::supervisor::Supervisor;

/// The agent's message surface: supervisor plus notification publisher.
pub struct Api {
    supervisor: Arc<Supervisor>,
    notifier: Notifier,
}

/// Decode a request payload, answering with a decode error on failure.
fn decode_request<T: serde::de::DeserializeOwned>(
    w: &mut dyn ResponseWriter,
    r: &Request,
) -> Option<T> {
    match serde_json::from_slice(&r.message) {
        Ok(request) => Some(request),
        Err(err) => {
            w.error(&Error::decode(
                format!("message \"{}\"", String::from_utf8_lossy(&r.message)),
                err,
            ));
            None
        }
    }
}

/// Serialize and write a success response.
fn write_response<T: Serialize>(w: &mut dyn ResponseWriter, response: &T) {
    match serde_json::to_value(response) {
        Ok(value) => w.write(value),
        Err(err) => w.error(&Error::new(ErrorKind::Encode {
            context: "response".to_string(),
            reason: err.to_string(),
        })),
    }
}

fn response_base(activity_id: &str) -> MessageResponseBase {
    MessageResponseBase {
        result: 0,
        activity_id: activity_id.to_string(),
        error_records: Vec::new(),
    }
}

/// Map a wire signal number onto a host signal. The host uses 0 to mean
/// "terminate", which on Linux is a SIGKILL.
fn signal_from_wire(signal: i32) -> Result<Signal, Error> {
    if signal == 0 {
        return Ok(Signal::SIGKILL);
    }
    Signal::try_from(signal).map_err(|_| Error::new(ErrorKind::UnknownSignal { signal }))
}

impl Api {
    /// Wire the supervisor and notifier into an API surface.
    pub fn new(supervisor: Arc<Supervisor>, notifier: Notifier) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            notifier,
        })
    }

    /// Build the multiplexer binding every supported message type.
    pub fn mux(self: Arc<Self>) -> Mux {
        let mux = Mux::new();
        let bindings: [(u32, fn(&Api, &mut dyn ResponseWriter, &Request)); 9] = [
            (CONTAINER_CREATE_V1, Api::create_container),
            (CONTAINER_EXECUTE_PROCESS_V1, Api::execute_process),
            (CONTAINER_SHUTDOWN_FORCED_V1, Api::kill_container),
            (CONTAINER_SHUTDOWN_GRACEFUL_V1, Api::shutdown_container),
            (CONTAINER_SIGNAL_PROCESS_V1, Api::signal_process),
            (CONTAINER_GET_PROPERTIES_V1, Api::get_properties),
            (CONTAINER_WAIT_FOR_PROCESS_V1, Api::wait_on_process),
            (CONTAINER_RESIZE_CONSOLE_V1, Api::resize_console),
            (CONTAINER_MODIFY_SETTINGS_V1, Api::modify_settings),
        ];
        for (message_type, handler) in bindings {
            let api = Arc::clone(&self);
            mux.handle_fn(message_type, move |w, r| handler(&api, w, r));
        }
        mux
    }

    fn create_container(&self, w: &mut dyn ResponseWriter, r: &Request) {
        let Some(request) = decode_request::<ContainerCreate>(w, r) else {
            return;
        };

        // The request carries its storage and runtime settings as a nested
        // JSON string.
        let settings: VmHostedContainerSettings =
            match serde_json::from_str(&request.container_config) {
                Ok(settings) => settings,
                Err(err) => {
                    w.error(&Error::decode(
                        format!("ContainerConfig \"{}\"", request.container_config),
                        err,
                    ));
                    return;
                }
            };

        let id = request.base.container_id.clone();
        if let Err(err) = self.supervisor.create_container(&id, settings) {
            w.error(&err);
            return;
        }

        write_response(
            w,
            &ContainerCreateResponse {
                base: response_base(&request.base.activity_id),
                selected_protocol_version: PROTOCOL_VERSION,
            },
        );

        // Watch the init process for the container's lifetime and tell the
        // host when it goes away. Failures here are logged; they cannot
        // affect the response already written.
        let supervisor = Arc::clone(&self.supervisor);
        let notifier = self.notifier.clone();
        let activity_id = request.base.activity_id;
        thread::spawn(move || match supervisor.wait_container(&id) {
            Ok(exit_code) => notifier.publish(&ContainerNotification {
                base: MessageBase {
                    container_id: id,
                    activity_id,
                },
                notification_type: NotificationType::UnexpectedExit,
                operation: ActivityOperation::None,
                result: exit_code,
                result_info: String::new(),
            }),
            Err(err) => error!(container_id = %id, error = %err, "container wait failed"),
        });
    }

    fn execute_process(&self, w: &mut dyn ResponseWriter, r: &Request) {
        let Some(request) = decode_request::<ContainerExecuteProcess>(w, r) else {
            return;
        };

        let params: ProcessParameters =
            match serde_json::from_str(&request.settings.process_parameters) {
                Ok(params) => params,
                Err(err) => {
                    w.error(&Error::decode(
                        format!(
                            "ProcessParameters \"{}\"",
                            request.settings.process_parameters
                        ),
                        err,
                    ));
                    return;
                }
            };

        let launched = if params.is_external {
            self.supervisor.run_external_process(&params)
        } else {
            self.supervisor
                .exec_process(&request.base.container_id, &params)
        };
        match launched {
            Ok(pid) => write_response(
                w,
                &ContainerExecuteProcessResponse {
                    base: response_base(&request.base.activity_id),
                    process_id: pid as u32,
                },
            ),
            Err(err) => w.error(&err),
        }
    }

    fn kill_container(&self, w: &mut dyn ResponseWriter, r: &Request) {
        self.signal_container(w, r, Signal::SIGKILL);
    }

    fn shutdown_container(&self, w: &mut dyn ResponseWriter, r: &Request) {
        self.signal_container(w, r, Signal::SIGTERM);
    }

    /// Not a handler itself: the signal is implied by the message type.
    fn signal_container(&self, w: &mut dyn ResponseWriter, r: &Request, signal: Signal) {
        let Some(request) = decode_request::<MessageBase>(w, r) else {
            return;
        };
        match self
            .supervisor
            .signal_container(&request.container_id, signal)
        {
            Ok(()) => write_response(w, &response_base(&request.activity_id)),
            Err(err) => w.error(&err),
        }
    }

    fn signal_process(&self, w: &mut dyn ResponseWriter, r: &Request) {
        let Some(request) = decode_request::<ContainerSignalProcess>(w, r) else {
            return;
        };
        let signal = match signal_from_wire(request.options.signal) {
            Ok(signal) => signal,
            Err(err) => {
                w.error(&err);
                return;
            }
        };
        match self.supervisor.signal_process(
            &request.base.container_id,
            request.process_id as i32,
            signal,
            request.options.all,
        ) {
            Ok(()) => write_response(w, &response_base(&request.base.activity_id)),
            Err(err) => w.error(&err),
        }
    }

    fn get_properties(&self, w: &mut dyn ResponseWriter, r: &Request) {
        let Some(request) = decode_request::<ContainerGetProperties>(w, r) else {
            return;
        };
        let pids = match self.supervisor.list_processes(&request.base.container_id) {
            Ok(pids) => pids,
            Err(err) => {
                w.error(&err);
                return;
            }
        };
        let details: Vec<ProcessDetails> = pids
            .into_iter()
            .map(|pid| ProcessDetails {
                process_id: pid as u32,
            })
            .collect();
        let properties = match serde_json::to_string(&details) {
            Ok(properties) => properties,
            Err(err) => {
                w.error(&Error::new(ErrorKind::Encode {
                    context: "process list".to_string(),
                    reason: err.to_string(),
                }));
                return;
            }
        };
        write_response(
            w,
            &ContainerGetPropertiesResponse {
                base: response_base(&request.base.activity_id),
                properties,
            },
        );
    }

    fn wait_on_process(&self, w: &mut dyn ResponseWriter, r: &Request) {
        let Some(request) = decode_request::<ContainerWaitForProcess>(w, r) else {
            return;
        };
        match self.supervisor.wait_process(request.process_id as i32) {
            Ok(exit_code) => write_response(
                w,
                &ContainerWaitForProcessResponse {
                    base: response_base(&request.base.activity_id),
                    exit_code: exit_code as u32,
                },
            ),
            Err(err) => w.error(&err),
        }
    }

    fn resize_console(&self, w: &mut dyn ResponseWriter, r: &Request) {
        let Some(request) = decode_request::<ContainerResizeConsole>(w, r) else {
            return;
        };
        match self.supervisor.resize_console(
            request.process_id as i32,
            request.width,
            request.height,
        ) {
            Ok(()) => write_response(w, &response_base(&request.base.activity_id)),
            Err(err) => w.error(&err),
        }
    }

    fn modify_settings(&self, w: &mut dyn ResponseWriter, r: &Request) {
        let Some(request) = decode_request::<ContainerModifySettings>(w, r) else {
            return;
        };
        match self
            .supervisor
            .modify_settings(&request.base.container_id, request.request)
        {
            Ok(()) => write_response(w, &response_base(&request.base.activity_id)),
            Err(err) => w.error(&err),
        }
    }
}
