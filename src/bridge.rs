//! Bridge engine.
//!
//! The bridge connects the agent to the host control plane over one duplex
//! stream and, much like an HTTP server, multiplexes framed requests onto
//! registered handlers. It has two fundamentally different dispatch paths:
//!
//! 1. Request/response: an inbound request is dispatched by message type
//!    and a [`ResponseWriter`] answers exactly that request, correlated by
//!    message id.
//! 2. [`Notifier::publish`]: an unsolicited notification, not tied to any
//!    request, can be enqueued from any thread at any time.
//!
//! For the lifetime of a session reads are strictly sequential, writes are
//! strictly sequential, and handler execution is concurrent and unordered.
//! The response channel is the sole mutation point of the outbound stream,
//! so every frame is written atomically.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uvmd_protocol::{
    response_identifier, ContainerNotification, MessageHeader, MessageResponseBase,
    CONTAINER_NOTIFICATION_V1, MESSAGE_HEADER_SIZE,
};

use crate::error::{Error, ErrorKind, Result};
use crate::transport::{Duplex, Transport};

/// One inbound request as read off the wire.
pub struct Request {
    /// The decoded frame header.
    pub header: MessageHeader,
    /// The raw payload document.
    pub message: Vec<u8>,
}

/// Responds to a bridge request.
pub trait Handler: Send + Sync {
    /// Handle `r`, answering through `w` exactly once.
    fn serve_msg(&self, w: &mut dyn ResponseWriter, r: &Request);
}

impl<F> Handler for F
where
    F: Fn(&mut dyn ResponseWriter, &Request) + Send + Sync,
{
    fn serve_msg(&self, w: &mut dyn ResponseWriter, r: &Request) {
        self(w, r)
    }
}

/// The dispatcher a handler uses to answer its request.
pub trait ResponseWriter {
    /// The response header, its type already derived from the request.
    fn header(&self) -> &MessageHeader;
    /// Write a successful response document.
    fn write(&mut self, response: Value);
    /// Write `err` as the response.
    fn error(&mut self, err: &Error);
}

/// Build the error envelope for a failed request.
fn error_response(err: &Error) -> MessageResponseBase {
    MessageResponseBase {
        result: err.hresult(),
        activity_id: String::new(),
        error_records: vec![err.to_error_record()],
    }
}

/// Protocol multiplexer for request/response pairs.
pub struct Mux {
    handlers: RwLock<HashMap<u32, Box<dyn Handler>>>,
}

impl Mux {
    /// Create an empty multiplexer.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `message_type`. Overwriting an existing
    /// binding is allowed but logged.
    pub fn handle(&self, message_type: u32, handler: Box<dyn Handler>) {
        if self
            .handlers
            .write()
            .insert(message_type, handler)
            .is_some()
        {
            info!(
                message_type = format_args!("0x{:08x}", message_type),
                "overwriting bridge handler"
            );
        }
    }

    /// Register a function handler for `message_type`.
    pub fn handle_fn(
        &self,
        message_type: u32,
        handler: impl Fn(&mut dyn ResponseWriter, &Request) + Send + Sync + 'static,
    ) {
        self.handle(message_type, Box::new(handler));
    }
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for Mux {
    fn serve_msg(&self, w: &mut dyn ResponseWriter, r: &Request) {
        let handlers = self.handlers.read();
        match handlers.get(&r.header.message_type) {
            Some(handler) => handler.serve_msg(w, r),
            None => w.error(&Error::new(ErrorKind::UnsupportedMessage {
                message_type: r.header.message_type,
            })),
        }
    }
}

/// One outbound frame queued for the writer task.
struct BridgeResponse {
    header: MessageHeader,
    response: Value,
}

/// Response writer that enqueues onto the session's response channel.
struct QueuedResponseWriter {
    header: MessageHeader,
    tx: Sender<BridgeResponse>,
    responses_written: u32,
}

impl ResponseWriter for QueuedResponseWriter {
    fn header(&self) -> &MessageHeader {
        &self.header
    }

    fn write(&mut self, response: Value) {
        self.responses_written += 1;
        if self.responses_written > 1 {
            error!(
                id = self.header.id,
                "handler wrote more than one response"
            );
        }
        if self
            .tx
            .send(BridgeResponse {
                header: self.header,
                response,
            })
            .is_err()
        {
            // The session tore down while this handler was still running.
            warn!(id = self.header.id, "response dropped: session closed");
        }
    }

    fn error(&mut self, err: &Error) {
        match serde_json::to_value(error_response(err)) {
            Ok(response) => self.write(response),
            Err(encode_err) => {
                error!(
                    id = self.header.id,
                    error = %encode_err,
                    "failed to encode error envelope"
                );
            }
        }
    }
}

/// Publisher handle for unsolicited notifications.
///
/// Cloneable and callable from any thread. Each publish is enqueued whole,
/// so notifications from one producer keep their order and never interleave
/// with other frames on the wire. Publishing outside an active session is
/// logged and dropped.
#[derive(Clone)]
pub struct Notifier {
    tx: Arc<RwLock<Option<Sender<BridgeResponse>>>>,
}

impl Notifier {
    fn new() -> Self {
        Self {
            tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Enqueue `notification` with message id 0.
    pub fn publish(&self, notification: &ContainerNotification) {
        let response = match serde_json::to_value(notification) {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "failed to encode notification");
                return;
            }
        };
        let header = MessageHeader {
            message_type: CONTAINER_NOTIFICATION_V1,
            size: 0,
            id: 0,
        };
        match &*self.tx.read() {
            Some(tx) => {
                if tx.send(BridgeResponse { header, response }).is_err() {
                    warn!(
                        container_id = %notification.base.container_id,
                        "notification dropped: session closed"
                    );
                }
            }
            None => warn!(
                container_id = %notification.base.container_id,
                "notification dropped: no active session"
            ),
        }
    }
}

/// The bridge client: owns the transport and drives one host session.
pub struct Bridge {
    transport: Box<dyn Transport>,
    notifier: Notifier,
}

impl Bridge {
    /// Create a bridge over `transport`.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            notifier: Notifier::new(),
        }
    }

    /// A notification publisher for this bridge's sessions.
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Dial the host command port, then serve requests until the session
    /// dies. Returns the first fatal reader or writer error as the
    /// session's exit cause.
    pub fn listen_and_serve(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let port = uvmd_protocol::COMMAND_PORT;
        let Duplex {
            mut reader,
            mut writer,
        } = self.transport.dial(port).map_err(|err| {
            Error::new(ErrorKind::Dial {
                port,
                source: err.into(),
            })
        })?;
        info!("connected to the host control plane");

        let (request_tx, request_rx) = mpsc::channel::<Request>();
        let (response_tx, response_rx) = mpsc::channel::<BridgeResponse>();
        let (quit_tx, quit_rx) = mpsc::channel::<Error>();

        *self.notifier.tx.write() = Some(response_tx.clone());

        // Reader: the sole consumer of the receive half. Any framing error
        // is fatal to the session.
        let reader_quit = quit_tx.clone();
        thread::spawn(move || loop {
            let mut header_bytes = [0u8; MESSAGE_HEADER_SIZE];
            if let Err(err) = reader.read_exact(&mut header_bytes) {
                let _ = reader_quit.send(Error::new(ErrorKind::Transport {
                    context: "reading message header",
                    source: err.into(),
                }));
                return;
            }
            let header = MessageHeader::decode(&header_bytes);
            if (header.size as usize) < MESSAGE_HEADER_SIZE {
                let _ = reader_quit.send(Error::new(ErrorKind::InvalidMessageSize {
                    size: header.size,
                }));
                return;
            }
            let mut message = vec![0u8; header.size as usize - MESSAGE_HEADER_SIZE];
            if let Err(err) = reader.read_exact(&mut message) {
                let _ = reader_quit.send(Error::new(ErrorKind::Transport {
                    context: "reading message payload",
                    source: err.into(),
                }));
                return;
            }
            debug!(
                message_type = format_args!("0x{:08x}", header.message_type),
                id = header.id,
                len = message.len(),
                "read message"
            );
            if request_tx.send(Request { header, message }).is_err() {
                return;
            }
        });

        // Dispatcher: launches one handler task per inbound request.
        let dispatch_response_tx = response_tx;
        thread::spawn(move || {
            for request in request_rx {
                let handler = Arc::clone(&handler);
                let tx = dispatch_response_tx.clone();
                thread::spawn(move || {
                    let mut w = QueuedResponseWriter {
                        header: MessageHeader {
                            message_type: response_identifier(request.header.message_type),
                            size: 0,
                            id: request.header.id,
                        },
                        tx,
                        responses_written: 0,
                    };
                    handler.serve_msg(&mut w, &request);
                    if w.responses_written == 0 {
                        error!(
                            id = request.header.id,
                            message_type =
                                format_args!("0x{:08x}", request.header.message_type),
                            "handler failed to write a response"
                        );
                    }
                });
            }
        });

        // Writer: the sole producer of bytes on the send half. Serializes
        // each queued value and frames it behind a recomputed size.
        let writer_quit = quit_tx;
        thread::spawn(move || {
            for queued in response_rx {
                let payload = match serde_json::to_vec(&queued.response) {
                    Ok(payload) => payload,
                    Err(err) => {
                        let _ = writer_quit.send(Error::new(ErrorKind::Encode {
                            context: "response".to_string(),
                            reason: err.to_string(),
                        }));
                        return;
                    }
                };
                let mut header = queued.header;
                header.size = (MESSAGE_HEADER_SIZE + payload.len()) as u32;
                let written = writer
                    .write_all(&header.encode())
                    .and_then(|()| writer.write_all(&payload))
                    .and_then(|()| writer.flush());
                if let Err(err) = written {
                    let _ = writer_quit.send(Error::new(ErrorKind::Transport {
                        context: "writing message",
                        source: err.into(),
                    }));
                    return;
                }
                debug!(
                    message_type = format_args!("0x{:08x}", header.message_type),
                    id = header.id,
                    len = payload.len(),
                    "response sent"
                );
            }
        });

        // Block until the first fatal error, then stop accepting work.
        // Handlers still running may attempt to write and must tolerate the
        // closed channel.
        let result = match quit_rx.recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        };
        *self.notifier.tx.write() = None;
        result
    }
}

/// In-memory transport and recording response writer shared by the bridge
/// and handler tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::{Condvar, Mutex};
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};

    /// One half of an in-memory byte stream.
    #[derive(Clone)]
    pub struct Pipe(Arc<PipeInner>);

    pub struct PipeInner {
        state: Mutex<PipeState>,
        cond: Condvar,
    }

    struct PipeState {
        buffer: VecDeque<u8>,
        closed: bool,
    }

    impl Pipe {
        pub fn new() -> Self {
            Self(Arc::new(PipeInner {
                state: Mutex::new(PipeState {
                    buffer: VecDeque::new(),
                    closed: false,
                }),
                cond: Condvar::new(),
            }))
        }

        pub fn close(&self) {
            self.0.state.lock().closed = true;
            self.0.cond.notify_all();
        }
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.0.state.lock();
            while state.buffer.is_empty() && !state.closed {
                self.0.cond.wait(&mut state);
            }
            if state.buffer.is_empty() {
                return Ok(0);
            }
            let mut n = 0;
            while n < buf.len() {
                match state.buffer.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.0.state.lock();
            if state.closed {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            state.buffer.extend(buf);
            self.0.cond.notify_all();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Transport whose two directions are test-visible pipes.
    pub struct FakeTransport {
        /// Host-to-agent bytes; the test writes requests here.
        pub inbound: Pipe,
        /// Agent-to-host bytes; the test reads responses here.
        pub outbound: Pipe,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self {
                inbound: Pipe::new(),
                outbound: Pipe::new(),
            }
        }
    }

    impl Transport for FakeTransport {
        fn dial(&self, _port: u32) -> io::Result<Duplex> {
            Ok(Duplex {
                reader: Box::new(self.inbound.clone()),
                writer: Box::new(self.outbound.clone()),
            })
        }
    }

    /// Frame and send a request over a pipe.
    pub fn send_request(pipe: &Pipe, message_type: u32, id: u64, payload: &[u8]) {
        let header = MessageHeader {
            message_type,
            size: (MESSAGE_HEADER_SIZE + payload.len()) as u32,
            id,
        };
        let mut pipe = pipe.clone();
        pipe.write_all(&header.encode()).expect("pipe open");
        pipe.write_all(payload).expect("pipe open");
    }

    /// Read one framed message from a pipe.
    pub fn read_message(pipe: &Pipe) -> (MessageHeader, Value) {
        let mut pipe = pipe.clone();
        let mut header_bytes = [0u8; MESSAGE_HEADER_SIZE];
        pipe.read_exact(&mut header_bytes).expect("header");
        let header = MessageHeader::decode(&header_bytes);
        let mut payload = vec![0u8; header.size as usize - MESSAGE_HEADER_SIZE];
        pipe.read_exact(&mut payload).expect("payload");
        let value = serde_json::from_slice(&payload).expect("json payload");
        (header, value)
    }

    /// Response writer that records what the handler produced.
    pub struct RecordingWriter {
        pub header: MessageHeader,
        pub responses: Vec<Value>,
        pub errors: Vec<Error>,
    }

    impl RecordingWriter {
        pub fn for_request(message_type: u32, id: u64) -> Self {
            Self {
                header: MessageHeader {
                    message_type: response_identifier(message_type),
                    size: 0,
                    id,
                },
                responses: Vec::new(),
                errors: Vec::new(),
            }
        }

        /// Total times the handler responded; must be exactly 1.
        pub fn write_count(&self) -> usize {
            self.responses.len() + self.errors.len()
        }
    }

    impl ResponseWriter for RecordingWriter {
        fn header(&self) -> &MessageHeader {
            &self.header
        }

        fn write(&mut self, response: Value) {
            self.responses.push(response);
        }

        fn error(&mut self, err: &Error) {
            self.errors.push(err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use uvmd_protocol::{hresult, MessageBase};

    #[test]
    fn test_mux_dispatches_by_type() {
        let mux = Mux::new();
        mux.handle_fn(0x1010_0101, |w, r| {
            assert_eq!(r.header.id, 7);
            w.write(serde_json::json!({"ok": true}));
        });

        let mut w = RecordingWriter::for_request(0x1010_0101, 7);
        mux.serve_msg(
            &mut w,
            &Request {
                header: MessageHeader {
                    message_type: 0x1010_0101,
                    size: MESSAGE_HEADER_SIZE as u32,
                    id: 7,
                },
                message: Vec::new(),
            },
        );

        assert_eq!(w.write_count(), 1);
        assert_eq!(w.responses[0]["ok"], true);
        assert_eq!(w.header.message_type, 0x2010_0101);
    }

    #[test]
    fn test_mux_unmatched_type_is_not_supported() {
        let mux = Mux::new();
        let mut w = RecordingWriter::for_request(0x1010_9901, 1);
        mux.serve_msg(
            &mut w,
            &Request {
                header: MessageHeader {
                    message_type: 0x1010_9901,
                    size: MESSAGE_HEADER_SIZE as u32,
                    id: 1,
                },
                message: Vec::new(),
            },
        );

        assert_eq!(w.write_count(), 1);
        assert_eq!(w.errors[0].hresult(), hresult::NOT_IMPL);
    }

    #[test]
    fn test_mux_overwrite_uses_latest_handler() {
        let mux = Mux::new();
        mux.handle_fn(0x1010_0101, |w, _| w.write(serde_json::json!(1)));
        mux.handle_fn(0x1010_0101, |w, _| w.write(serde_json::json!(2)));

        let mut w = RecordingWriter::for_request(0x1010_0101, 1);
        mux.serve_msg(
            &mut w,
            &Request {
                header: MessageHeader {
                    message_type: 0x1010_0101,
                    size: MESSAGE_HEADER_SIZE as u32,
                    id: 1,
                },
                message: Vec::new(),
            },
        );
        assert_eq!(w.responses[0], serde_json::json!(2));
    }

    fn serve_in_background(
        transport: FakeTransport,
        handler: Arc<dyn Handler>,
    ) -> (Pipe, Pipe, Notifier, std::thread::JoinHandle<Result<()>>) {
        let inbound = transport.inbound.clone();
        let outbound = transport.outbound.clone();
        let bridge = Arc::new(Bridge::new(Box::new(transport)));
        let notifier = bridge.notifier();
        let serving = std::thread::spawn(move || bridge.listen_and_serve(handler));
        (inbound, outbound, notifier, serving)
    }

    #[test]
    fn test_round_trip_correlates_by_id() {
        let mux = Mux::new();
        mux.handle_fn(0x1010_0101, |w, r| {
            let echoed: Value = serde_json::from_slice(&r.message).expect("payload");
            w.write(serde_json::json!({"Echo": echoed}));
        });

        let (inbound, outbound, _notifier, serving) =
            serve_in_background(FakeTransport::new(), Arc::new(mux));

        send_request(&inbound, 0x1010_0101, 0x42, br#"{"Value":3}"#);
        let (header, body) = read_message(&outbound);
        assert_eq!(header.message_type, 0x2010_0101);
        assert_eq!(header.id, 0x42);
        assert_eq!(
            header.size as usize,
            MESSAGE_HEADER_SIZE + serde_json::to_vec(&body).expect("payload").len()
        );
        assert_eq!(body["Echo"]["Value"], 3);

        inbound.close();
        let err = serving.join().expect("serving thread").expect_err("session ends");
        assert!(matches!(err.kind(), ErrorKind::Transport { .. }));
    }

    #[test]
    fn test_unsupported_request_gets_error_envelope() {
        let (inbound, outbound, _notifier, serving) =
            serve_in_background(FakeTransport::new(), Arc::new(Mux::new()));

        send_request(&inbound, 0x1010_7701, 9, b"{}");
        let (header, body) = read_message(&outbound);
        assert_eq!(header.id, 9);
        assert_eq!(body["Result"], hresult::NOT_IMPL);
        let record = &body["ErrorRecords"][0];
        assert_eq!(record["Result"], hresult::NOT_IMPL);
        assert_eq!(record["ModuleName"], "uvmd");
        assert!(record["Message"]
            .as_str()
            .expect("message string")
            .contains("not supported"));

        inbound.close();
        serving.join().expect("serving thread").expect_err("session ends");
    }

    #[test]
    fn test_notifications_preserve_publish_order() {
        let mux = Mux::new();
        mux.handle_fn(0x1010_0101, |w, _| w.write(serde_json::json!({})));
        let (inbound, outbound, notifier, serving) =
            serve_in_background(FakeTransport::new(), Arc::new(mux));

        // Prove the session is live before publishing.
        send_request(&inbound, 0x1010_0101, 1, b"{}");
        read_message(&outbound);

        for result in [-1, -2, -3] {
            notifier.publish(&ContainerNotification {
                base: MessageBase {
                    container_id: "test".to_string(),
                    activity_id: "act".to_string(),
                },
                notification_type: uvmd_protocol::NotificationType::UnexpectedExit,
                operation: uvmd_protocol::ActivityOperation::None,
                result,
                result_info: String::new(),
            });
        }

        for expected in [-1, -2, -3] {
            let (header, body) = read_message(&outbound);
            assert_eq!(header.message_type, CONTAINER_NOTIFICATION_V1);
            assert_eq!(header.id, 0, "notifications use the reserved id");
            assert_eq!(body["Result"], expected);
        }

        inbound.close();
        serving.join().expect("serving thread").expect_err("session ends");
    }

    #[test]
    fn test_undersized_header_terminates_session() {
        let (inbound, _outbound, _notifier, serving) =
            serve_in_background(FakeTransport::new(), Arc::new(Mux::new()));

        let header = MessageHeader {
            message_type: 0x1010_0101,
            size: 4,
            id: 1,
        };
        {
            use std::io::Write;
            let mut pipe = inbound.clone();
            pipe.write_all(&header.encode()).expect("pipe open");
        }

        let err = serving.join().expect("serving thread").expect_err("corrupt session");
        assert!(matches!(err.kind(), ErrorKind::InvalidMessageSize { size: 4 }));
    }

    #[test]
    fn test_notification_outside_session_is_dropped() {
        let transport = FakeTransport::new();
        let bridge = Bridge::new(Box::new(transport));
        // Never served: the publish must not panic or block.
        bridge.notifier().publish(&ContainerNotification {
            base: MessageBase::default(),
            notification_type: uvmd_protocol::NotificationType::UnexpectedExit,
            operation: uvmd_protocol::ActivityOperation::None,
            result: 0,
            result_info: String::new(),
        });
    }
}
