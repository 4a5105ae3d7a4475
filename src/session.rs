//! # Streaming Session
//!
//! Per-connection state for `/ws/transcribe`, independent of the WebSocket
//! plumbing so the protocol can be driven and tested with plain channels.
//!
//! ## State Machine:
//! ```text
//! AwaitingConfig ──config frame──▶ Streaming ──disconnect──▶ Closed
//!       │                             │
//!       └──────first audio frame──────┘
//!       (any state) ──too many failures──▶ ErroredClosed
//! ```
//!
//! ## Ordering:
//! [`run_session`] handles inbound frames one at a time, so at most one pipeline
//! call per session is in flight and replies leave in the order frames arrived.
//! Different sessions still run concurrently and share the engine pool.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::error::PipelineError;
use crate::models::{AudioChunk, SessionConfig, TranscriptResult, TranscriptSegment, Transport};
use crate::pipeline::ChunkPipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No audio yet; one control frame may still set the session config
    AwaitingConfig,
    /// Config fixed; every audio frame gets exactly one reply
    Streaming,
    /// Client went away; no further pipeline calls
    Closed,
    /// Terminated by the server after an unrecoverable session error
    ErroredClosed { reason: String },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::ErroredClosed { .. })
    }
}

/// A frame received from the client.
#[derive(Debug)]
pub enum Inbound {
    Control(String),
    Audio(Vec<u8>),
}

/// Something the connection should send back.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Reply(SessionReply),
    /// Last frame before the server closes the connection
    Fatal(SessionReply),
}

/// JSON reply frame.
///
/// Successful audio frames carry the transcript fields; failures carry `error`.
/// `seq` is the 1-based index of the audio frame being answered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<TranscriptSegment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<bool>,
}

impl SessionReply {
    fn empty(ok: bool) -> Self {
        Self {
            ok,
            seq: None,
            transcript: None,
            segments: None,
            duration: None,
            language: None,
            error: None,
            retryable: None,
            fatal: None,
        }
    }

    pub fn transcript(seq: u64, result: TranscriptResult) -> Self {
        Self {
            seq: Some(seq),
            transcript: Some(result.full_text),
            segments: Some(result.segments),
            duration: Some(result.duration),
            language: Some(result.language),
            ..Self::empty(true)
        }
    }

    pub fn frame_error(seq: u64, err: &PipelineError) -> Self {
        Self {
            seq: Some(seq),
            error: Some(err.to_string()),
            retryable: err.is_retryable().then_some(true),
            ..Self::empty(false)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::empty(false)
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            fatal: Some(true),
            ..Self::empty(false)
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"ok":false,"error":"reply encoding failed"}"#.to_string())
    }
}

/// What the session decided to do with an audio frame.
#[derive(Debug)]
pub enum AudioDecision {
    /// Run the pipeline for frame `seq` with this config
    Process { seq: u64, config: SessionConfig },
    Ignore,
}

/// Protocol state for one connection.
pub struct StreamingSession {
    id: Uuid,
    state: SessionState,
    config: SessionConfig,
    frames_received: u64,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
}

impl StreamingSession {
    pub fn new(max_consecutive_failures: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::AwaitingConfig,
            config: SessionConfig::default(),
            frames_received: 0,
            consecutive_failures: 0,
            max_consecutive_failures,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[cfg(test)]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handle a text frame. Returns an error reply when the frame is rejected.
    pub fn on_control(&mut self, text: &str) -> Option<SessionReply> {
        match &self.state {
            SessionState::AwaitingConfig => match serde_json::from_str::<SessionConfig>(text) {
                Ok(config) => {
                    debug!("Session {} configured: {:?}", self.id, config);
                    self.config = config;
                    self.state = SessionState::Streaming;
                    None
                }
                Err(err) => Some(SessionReply::error(format!("invalid config frame: {}", err))),
            },
            SessionState::Streaming => Some(SessionReply::error(
                "session config is fixed once streaming has started",
            )),
            SessionState::Closed | SessionState::ErroredClosed { .. } => None,
        }
    }

    /// Handle a binary frame: assign its sequence number and fix the config.
    pub fn on_audio(&mut self) -> AudioDecision {
        match self.state {
            SessionState::AwaitingConfig | SessionState::Streaming => {
                self.state = SessionState::Streaming;
                self.frames_received += 1;
                AudioDecision::Process {
                    seq: self.frames_received,
                    config: self.config.clone(),
                }
            }
            SessionState::Closed | SessionState::ErroredClosed { .. } => AudioDecision::Ignore,
        }
    }

    /// Account for one pipeline outcome. Returns the terminal reply if the
    /// session has now failed too many times in a row.
    pub fn on_result(&mut self, result: &Result<TranscriptResult, PipelineError>) -> Option<SessionReply> {
        match result {
            Ok(_) => self.consecutive_failures = 0,
            Err(err) if err.is_input_fault() => self.consecutive_failures += 1,
            Err(_) => {}
        }

        if self.max_consecutive_failures > 0
            && self.consecutive_failures >= self.max_consecutive_failures
        {
            let reason = format!(
                "{} consecutive audio frames could not be processed",
                self.consecutive_failures
            );
            self.fail(reason.clone());
            return Some(SessionReply::fatal(reason));
        }
        None
    }

    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Closed;
        }
    }

    pub fn fail(&mut self, reason: String) {
        if !self.state.is_terminal() {
            self.state = SessionState::ErroredClosed { reason };
        }
    }
}

/// Drive one session until the client disconnects or the session fails.
///
/// Frames are taken from `inbound` one at a time; each audio frame's pipeline
/// call completes (and its reply is queued on `outbound`) before the next frame
/// is looked at. Returns the final state.
pub async fn run_session(
    mut session: StreamingSession,
    pipeline: Arc<ChunkPipeline>,
    mut inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::UnboundedSender<SessionEvent>,
) -> SessionState {
    info!("Session {} started", session.id());

    while let Some(frame) = inbound.recv().await {
        match frame {
            Inbound::Control(text) => {
                if let Some(reply) = session.on_control(&text) {
                    let _ = outbound.send(SessionEvent::Reply(reply));
                }
            }
            Inbound::Audio(data) => {
                let AudioDecision::Process { seq, config } = session.on_audio() else {
                    continue;
                };

                let chunk = AudioChunk::new(data, None);
                let result = pipeline.process(chunk, &config, Transport::Ws).await;
                let fatal = session.on_result(&result);

                let reply = match result {
                    Ok(transcript) => SessionReply::transcript(seq, transcript),
                    Err(err) => SessionReply::frame_error(seq, &err),
                };
                let _ = outbound.send(SessionEvent::Reply(reply));

                if let Some(fatal) = fatal {
                    warn!("Session {} closing: {:?}", session.id(), fatal.error);
                    let _ = outbound.send(SessionEvent::Fatal(fatal));
                    break;
                }
            }
        }
    }

    session.close();
    info!("Session {} ended in state {:?}", session.id(), session.state());
    session.state().clone()
}

/// Build the channels and driver future for a new session.
pub fn start_session(
    pipeline: Arc<ChunkPipeline>,
    settings: &SessionSettings,
) -> (
    mpsc::Sender<Inbound>,
    mpsc::UnboundedReceiver<SessionEvent>,
    impl std::future::Future<Output = SessionState>,
) {
    let (inbound_tx, inbound_rx) = mpsc::channel(settings.max_pending_frames);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let session = StreamingSession::new(settings.max_consecutive_failures);
    let driver = run_session(session, pipeline, inbound_rx, outbound_tx);
    (inbound_tx, outbound_rx, driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pcm_bytes, test_pipeline, test_pipeline_with, FakeEngine, FakeTranscoder};
    use std::time::Duration;

    fn settings(max_failures: u32) -> SessionSettings {
        SessionSettings {
            max_consecutive_failures: max_failures,
            max_pending_frames: 32,
            heartbeat_interval_secs: 5,
            client_timeout_secs: 30,
        }
    }

    fn reply(event: SessionEvent) -> SessionReply {
        match event {
            SessionEvent::Reply(reply) => reply,
            SessionEvent::Fatal(reply) => panic!("unexpected fatal reply: {:?}", reply),
        }
    }

    #[test]
    fn test_config_frame_moves_to_streaming() {
        let mut session = StreamingSession::new(5);
        assert_eq!(session.state(), &SessionState::AwaitingConfig);

        assert!(session.on_control(r#"{"language":"fr","initial_prompt":"hello"}"#).is_none());
        assert_eq!(session.state(), &SessionState::Streaming);
        assert_eq!(session.config().language.as_deref(), Some("fr"));

        let rejected = session.on_control(r#"{"language":"de"}"#).unwrap();
        assert!(!rejected.ok);
        assert_eq!(session.config().language.as_deref(), Some("fr"));
    }

    #[test]
    fn test_malformed_config_keeps_awaiting() {
        let mut session = StreamingSession::new(5);
        let reply = session.on_control("not json").unwrap();
        assert!(!reply.ok);
        assert_eq!(session.state(), &SessionState::AwaitingConfig);
    }

    #[test]
    fn test_audio_without_config_uses_defaults() {
        let mut session = StreamingSession::new(5);
        match session.on_audio() {
            AudioDecision::Process { seq, config } => {
                assert_eq!(seq, 1);
                assert_eq!(config, SessionConfig::default());
            }
            AudioDecision::Ignore => panic!("first audio frame must be processed"),
        }
        assert_eq!(session.state(), &SessionState::Streaming);
    }

    #[test]
    fn test_closed_session_ignores_frames() {
        let mut session = StreamingSession::new(5);
        session.close();
        assert!(matches!(session.on_audio(), AudioDecision::Ignore));
        session.fail("late".into());
        assert_eq!(session.state(), &SessionState::Closed);
    }

    #[test]
    fn test_failure_threshold() {
        let mut session = StreamingSession::new(2);
        let bad: Result<TranscriptResult, PipelineError> =
            Err(crate::error::ValidationError::Empty.into());
        let busy: Result<TranscriptResult, PipelineError> =
            Err(PipelineError::EngineBusy(Duration::from_secs(1)));

        assert!(session.on_result(&bad).is_none());
        assert!(session.on_result(&busy).is_none());
        let fatal = session.on_result(&bad).unwrap();
        assert_eq!(fatal.fatal, Some(true));
        assert!(matches!(session.state(), SessionState::ErroredClosed { .. }));
    }

    #[test]
    fn test_zero_threshold_never_escalates() {
        let mut session = StreamingSession::new(0);
        let bad: Result<TranscriptResult, PipelineError> =
            Err(crate::error::ValidationError::Empty.into());
        for _ in 0..20 {
            assert!(session.on_result(&bad).is_none());
        }
    }

    #[test]
    fn test_reply_json_shape() {
        let err = PipelineError::EngineBusy(Duration::from_secs(1));
        let json: serde_json::Value =
            serde_json::from_str(&SessionReply::frame_error(4, &err).to_json()).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["seq"], 4);
        assert_eq!(json["retryable"], true);
        assert!(json.get("transcript").is_none());
    }

    #[tokio::test]
    async fn test_replies_follow_frame_order() {
        // Later frames are shorter, so a concurrent implementation would
        // finish them first.
        let engine = Arc::new(FakeEngine::named("fake").with_delay(Duration::from_millis(5)));
        let (pipeline, _arbiter, _metrics) = test_pipeline(vec![engine], 1024 * 1024, None);
        let (tx, mut rx, driver) = start_session(Arc::new(pipeline), &settings(5));
        let driver = tokio::spawn(driver);

        for i in 1..=6i16 {
            let samples = vec![i; (7 - i as usize) * 1600];
            tx.send(Inbound::Audio(pcm_bytes(&samples))).await.unwrap();
        }

        for i in 1..=6u64 {
            let reply = reply(rx.recv().await.unwrap());
            assert!(reply.ok);
            assert_eq!(reply.seq, Some(i));
            assert_eq!(reply.transcript.as_deref(), Some(format!("chunk {}", i).as_str()));
        }

        drop(tx);
        assert_eq!(driver.await.unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_bad_frame_keeps_session_streaming() {
        let (pipeline, _arbiter, metrics) =
            test_pipeline(vec![Arc::new(FakeEngine::named("fake"))], 1024 * 1024, None);
        let (tx, mut rx, driver) = start_session(Arc::new(pipeline), &settings(3));
        let driver = tokio::spawn(driver);

        tx.send(Inbound::Control(r#"{"language":"en"}"#.into())).await.unwrap();
        tx.send(Inbound::Audio(b"BAD frame".to_vec())).await.unwrap();
        tx.send(Inbound::Audio(pcm_bytes(&[9; 320]))).await.unwrap();

        let first = reply(rx.recv().await.unwrap());
        assert!(!first.ok);
        assert_eq!(first.seq, Some(1));

        let second = reply(rx.recv().await.unwrap());
        assert!(second.ok);
        assert_eq!(second.seq, Some(2));
        assert_eq!(second.transcript.as_deref(), Some("chunk 9"));

        drop(tx);
        assert_eq!(driver.await.unwrap(), SessionState::Closed);
        assert_eq!(metrics.requests(Transport::Ws), 2);
        assert_eq!(metrics.errors(Transport::Ws), 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_close_session() {
        let (pipeline, arbiter, _metrics) =
            test_pipeline(vec![Arc::new(FakeEngine::named("fake"))], 1024 * 1024, None);
        let (tx, mut rx, driver) = start_session(Arc::new(pipeline), &settings(2));
        let driver = tokio::spawn(driver);

        for _ in 0..3 {
            tx.send(Inbound::Audio(b"BAD".to_vec())).await.unwrap();
        }

        assert!(!reply(rx.recv().await.unwrap()).ok);
        assert!(!reply(rx.recv().await.unwrap()).ok);
        match rx.recv().await.unwrap() {
            SessionEvent::Fatal(fatal) => assert_eq!(fatal.fatal, Some(true)),
            other => panic!("expected fatal event, got {:?}", other),
        }

        let state = driver.await.unwrap();
        assert!(matches!(state, SessionState::ErroredClosed { .. }));
        assert!(rx.recv().await.is_none());
        assert_eq!(arbiter.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_mid_frame_releases_slot() {
        let engine = Arc::new(FakeEngine::named("slow").with_delay(Duration::from_millis(150)));
        let transcoder = Arc::new(FakeTranscoder::with_delay(Duration::from_millis(1)));
        let (pipeline, arbiter, _metrics) =
            test_pipeline_with(transcoder, vec![engine.clone()], 1024 * 1024, None);
        let (tx, _rx, driver) = start_session(Arc::new(pipeline), &settings(5));
        let driver = tokio::spawn(driver);

        tx.send(Inbound::Audio(pcm_bytes(&[5; 1600]))).await.unwrap();
        while engine.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        driver.abort();
        drop(tx);

        assert!(arbiter.acquire(Some(Duration::from_secs(2))).await.is_ok());
    }
}
