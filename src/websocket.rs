//! # WebSocket Transcription Handler
//!
//! Streams audio over `/ws/transcribe`. One actor per connection owns the socket;
//! the protocol itself lives in [`crate::session`] and runs as a separate local
//! task fed through a bounded channel.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: client upgrades `GET /ws/transcribe`
//! 2. **Configuration** (optional): first text frame `{"language": .., "initial_prompt": ..}`
//! 3. **Audio Streaming**: every binary frame is one complete audio chunk in any
//!    format the converter understands
//! 4. **Replies**: exactly one JSON reply per binary frame, in frame order:
//!    `{"ok": true, "seq": 1, "transcript": .., "segments": [..], "duration": .., "language": ..}`
//!    or `{"ok": false, "seq": 1, "error": ..}`
//! 5. **Termination**: a reply with `"fatal": true` is followed by a close frame
//!
//! ## Size Limits:
//! A message (single frame or reassembled fragments) larger than the upload
//! limit gets an ordinary per-frame error and the session continues. A single
//! frame larger than twice the limit cannot be read at all; it ends the session
//! with a fatal reply and a `Size` close.
//!
//! ## Actor Model:
//! ```text
//! socket ──▶ AudioSocket ──try_send──▶ run_session task ──▶ ChunkPipeline
//!    ▲                                        │
//!    └──────── ctx.text ◀── SessionEvent ◀────┘
//! ```
//! The actor never awaits the pipeline, so heartbeats and control frames stay
//! responsive while a chunk is being transcribed.

use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::config::SessionSettings;
use crate::metrics::MetricsRegistry;
use crate::models::Transport;
use crate::pipeline::ChunkPipeline;
use crate::session::{start_session, Inbound, SessionEvent, SessionReply, SessionState};
use crate::state::AppState;

/// Continuation frames being stitched back together.
///
/// At most `max + 1` bytes are kept, which is enough for the pipeline to
/// reject the message as oversized.
struct Fragment {
    binary: bool,
    data: Vec<u8>,
    received: usize,
}

/// WebSocket actor for one streaming session.
pub struct AudioSocket {
    pipeline: Arc<ChunkPipeline>,
    metrics: Arc<MetricsRegistry>,
    settings: SessionSettings,

    /// Frames waiting for the session task; `None` once the session is gone
    inbound: Option<mpsc::Sender<Inbound>>,
    driver: Option<JoinHandle<SessionState>>,

    fragment: Option<Fragment>,
    max_message_bytes: usize,

    /// Last time anything arrived from the client
    last_heartbeat: Instant,
}

impl AudioSocket {
    pub fn new(
        pipeline: Arc<ChunkPipeline>,
        metrics: Arc<MetricsRegistry>,
        settings: SessionSettings,
    ) -> Self {
        let max_message_bytes = pipeline.max_upload_bytes();
        Self {
            pipeline,
            metrics,
            settings,
            inbound: None,
            driver: None,
            fragment: None,
            max_message_bytes,
            last_heartbeat: Instant::now(),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = Duration::from_secs(self.settings.heartbeat_interval_secs.max(1));
        let timeout = Duration::from_secs(self.settings.client_timeout_secs.max(1));

        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!("WebSocket client timed out, closing connection");
                act.inbound = None;
                act.terminate(
                    SessionReply::fatal(format!("no traffic from client for {:?}", timeout)),
                    ws::CloseCode::Away,
                    ctx,
                );
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Hand a complete frame to the session task.
    fn forward(&mut self, frame: Inbound, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = &self.inbound else {
            return;
        };

        match inbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Session backlog exceeded {} frames, closing connection",
                    self.settings.max_pending_frames
                );
                self.inbound = None;
                self.terminate(
                    SessionReply::fatal("too many frames pending, slow down"),
                    ws::CloseCode::Policy,
                    ctx,
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Session task already finished, dropping frame");
                self.inbound = None;
            }
        }
    }

    /// Send a terminal error frame, then close the socket.
    fn terminate(
        &mut self,
        reply: SessionReply,
        code: ws::CloseCode,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let description = reply.error.clone();
        ctx.text(reply.to_json());
        ctx.close(Some(ws::CloseReason { code, description }));
        ctx.stop();
    }

    fn handle_continuation(&mut self, item: Item, ctx: &mut ws::WebsocketContext<Self>) {
        let (binary, first, last, payload) = match item {
            Item::FirstText(data) => (false, true, false, data),
            Item::FirstBinary(data) => (true, true, false, data),
            Item::Continue(data) => (false, false, false, data),
            Item::Last(data) => (false, false, true, data),
        };

        if first {
            self.fragment = Some(Fragment {
                binary,
                data: Vec::new(),
                received: 0,
            });
        }

        let Some(fragment) = self.fragment.as_mut() else {
            warn!("Continuation frame without a first frame");
            return;
        };

        let keep = self
            .max_message_bytes
            .saturating_add(1)
            .saturating_sub(fragment.data.len());
        fragment.data.extend_from_slice(&payload[..payload.len().min(keep)]);
        fragment.received += payload.len();

        if last {
            if let Some(fragment) = self.fragment.take() {
                if fragment.received > self.max_message_bytes {
                    debug!(
                        "Reassembled message of {} bytes exceeds the {} byte limit",
                        fragment.received, self.max_message_bytes
                    );
                }
                if fragment.binary {
                    self.forward(Inbound::Audio(fragment.data), ctx);
                } else {
                    let text = String::from_utf8_lossy(&fragment.data).into_owned();
                    self.forward(Inbound::Control(text), ctx);
                }
            }
        }
    }

    /// The codec cannot recover from a bad frame, so the session ends here. The
    /// fatal reply still goes out because only the read side has failed.
    fn protocol_error(&mut self, err: ws::ProtocolError, ctx: &mut ws::WebsocketContext<Self>) {
        self.inbound = None;
        self.fragment = None;

        let (reply, code) = match err {
            ws::ProtocolError::Overflow => {
                warn!("WebSocket frame exceeds {} bytes, closing connection", self.max_frame_bytes());
                self.metrics.record_request(Transport::Ws);
                self.metrics.record_error(Transport::Ws, "validation");
                (
                    SessionReply::fatal(format!(
                        "frame exceeds the {} byte limit",
                        self.max_frame_bytes()
                    )),
                    ws::CloseCode::Size,
                )
            }
            other => {
                error!("WebSocket protocol error: {}", other);
                self.metrics.record_error(Transport::Ws, "protocol");
                (
                    SessionReply::fatal(format!("protocol error: {}", other)),
                    ws::CloseCode::Protocol,
                )
            }
        };
        self.terminate(reply, code, ctx);
    }

    /// Largest single frame the codec accepts.
    fn max_frame_bytes(&self) -> usize {
        max_frame_bytes(self.max_message_bytes)
    }
}

impl Actor for AudioSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.metrics.session_opened();

        let (inbound, outbound, driver) = start_session(self.pipeline.clone(), &self.settings);
        self.inbound = Some(inbound);
        self.driver = Some(actix_web::rt::spawn(driver));
        ctx.add_stream(UnboundedReceiverStream::new(outbound));

        self.heartbeat(ctx);
        info!("WebSocket session started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the in-flight pipeline call releases its engine slot and
        // scratch files; nobody is left to read the reply.
        self.inbound = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.metrics.session_closed();
        info!("WebSocket session stopped");
    }
}

/// Incoming socket traffic.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward(Inbound::Control(text.to_string()), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                debug!("Received {} bytes of audio", data.len());
                self.forward(Inbound::Audio(data.to_vec()), ctx);
            }
            Ok(ws::Message::Continuation(item)) => {
                self.handle_continuation(item, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => self.protocol_error(err, ctx),
        }
    }
}

/// Replies coming back from the session task.
impl StreamHandler<SessionEvent> for AudioSocket {
    fn handle(&mut self, event: SessionEvent, ctx: &mut Self::Context) {
        match event {
            SessionEvent::Reply(reply) => ctx.text(reply.to_json()),
            SessionEvent::Fatal(reply) => {
                self.inbound = None;
                self.terminate(reply, ws::CloseCode::Error, ctx);
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Session task finished");
        ctx.stop();
    }
}

/// `GET /ws/transcribe`: upgrade to a streaming transcription session.
pub async fn transcribe_socket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New WebSocket connection from {:?}",
        req.connection_info().peer_addr()
    );

    let socket = AudioSocket::new(
        app_state.pipeline.clone(),
        app_state.metrics.clone(),
        app_state.config.session.clone(),
    );

    let frame_size = max_frame_bytes(app_state.pipeline.max_upload_bytes());
    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(frame_size)
        .start()
}

/// A single frame may carry a whole upload; frames up to twice that are still
/// read so the pipeline can reject them with a per-frame error.
fn max_frame_bytes(max_upload_bytes: usize) -> usize {
    max_upload_bytes.saturating_mul(2)
}
