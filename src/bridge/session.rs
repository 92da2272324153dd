//! # Session Orchestrator
//!
//! Owns one call from transport upgrade to teardown. A session dials the
//! upstream, negotiates formats, then runs three tasks until one of them ends:
//!
//! - **caller pump**: telephony queue → transcode → `append` / `commit`
//! - **upstream reader**: upstream socket → audio deltas → outbound queue
//! - **agent pump**: outbound queue → transcode → telephony socket
//!
//! The first task to finish (or a forced shutdown from the registry) fixes the
//! close reason. Teardown then closes both queues, gives the tasks a grace
//! period to flush, aborts whatever is left, hangs up the telephony socket and
//! removes the session from the registry. Nothing is retried.

use crate::bridge::handle::{NegotiatedFormats, SessionHandle, SessionStats};
use crate::bridge::hooks::{CallEnded, CallEventNotifier, CallStarted, UpstreamCredentials};
use crate::bridge::queue::{FrameQueue, PushOutcome};
use crate::bridge::registry::{Registration, SessionRegistry};
use crate::bridge::telephony::{self, TelephonyCommand, TelephonyEndpoint, TelephonyEvent, TelephonyLeg};
use crate::bridge::upstream::{self, AgentProfile, ServerEvent, UpstreamReader, UpstreamWriter};
use crate::bridge::{CloseReason, SessionState};
use crate::codec::{AudioFormat, AudioFrame, CodecRegistry, Transcoder};
use crate::error::BridgeError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Everything a session needs to know, resolved before it starts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: UpstreamCredentials,
    pub agent: AgentProfile,
    /// Format assumed for caller media until `start` announces one.
    pub telephony_format: AudioFormat,
    pub upstream_input: AudioFormat,
    pub upstream_output: AudioFormat,
    /// Frames buffered per direction before the oldest is dropped.
    pub queue_capacity: usize,
    pub connect_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub grace_period: Duration,
}

impl SessionConfig {
    /// μ-law on both sides, so audio passes through untouched.
    pub fn new(credentials: UpstreamCredentials) -> Self {
        Self {
            credentials,
            agent: AgentProfile::default(),
            telephony_format: AudioFormat::telephony_mulaw(),
            upstream_input: AudioFormat::telephony_mulaw(),
            upstream_output: AudioFormat::telephony_mulaw(),
            queue_capacity: 50,
            connect_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(15),
            grace_period: Duration::from_secs(2),
        }
    }
}

/// One bridged call. Created on transport upgrade, consumed by [`Session::run`].
pub struct Session {
    handle: Arc<SessionHandle>,
    config: SessionConfig,
    telephony: TelephonyLeg,
    codecs: Arc<CodecRegistry>,
    notifier: Arc<dyn CallEventNotifier>,
    registration: Registration,
}

impl Session {
    /// Allocate an id, build the telephony leg and register the session.
    ///
    /// Returns the socket-side half of the telephony leg alongside the session.
    /// Fails with `CapacityExceeded` when the registry is full.
    pub fn create(
        config: SessionConfig,
        registry: &SessionRegistry,
        codecs: Arc<CodecRegistry>,
        notifier: Arc<dyn CallEventNotifier>,
    ) -> Result<(Session, TelephonyEndpoint), BridgeError> {
        let handle = Arc::new(SessionHandle::new(Uuid::new_v4().to_string()));
        let registration = registry.register(handle.clone())?;
        let (telephony, endpoint) =
            telephony::leg_pair(handle.clone(), config.queue_capacity, config.telephony_format);

        let session = Session {
            handle,
            config,
            telephony,
            codecs,
            notifier,
            registration,
        };
        Ok((session, endpoint))
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Bridge the call until either leg ends, then tear everything down.
    pub async fn run(self) -> CloseReason {
        let span = info_span!("session", session_id = %self.handle.id());
        self.drive().instrument(span).await
    }

    async fn drive(self) -> CloseReason {
        let Session {
            handle,
            config,
            telephony,
            codecs,
            notifier,
            registration,
        } = self;

        notifier.call_started(&CallStarted {
            session_id: handle.id().to_string(),
            started_at: handle.created_at(),
        });

        let mut shutdown = handle.shutdown_signal();
        let outbound = Arc::new(FrameQueue::<AudioFrame>::new(config.queue_capacity));
        let mut tasks = JoinSet::new();

        let reason = bridge(
            &handle,
            &config,
            &telephony,
            &codecs,
            &outbound,
            &mut tasks,
            &mut shutdown,
        )
        .await;

        info!(reason = %reason, "Session draining");
        handle.advance(SessionState::Draining);
        telephony.inbound.close();
        outbound.close();

        if tokio::time::timeout(config.grace_period, drain(&mut tasks)).await.is_err() {
            warn!(
                grace_ms = config.grace_period.as_millis() as u64,
                remaining = tasks.len(),
                "Tasks still running after grace period; aborting"
            );
            tasks.shutdown().await;
        }

        // A stalled socket may keep the channel full; dropping the sender then
        // ends the actor's command stream, which hangs up just the same.
        if tokio::time::timeout(config.grace_period, telephony.commands.send(TelephonyCommand::Close))
            .await
            .is_err()
        {
            debug!("Telephony socket not draining commands; relying on channel close");
        }
        handle.finish(reason.clone());
        drop(registration);

        let stats = handle.stats.snapshot();
        notifier.call_ended(&CallEnded {
            session_id: handle.id().to_string(),
            stream_id: handle.stream_id().map(str::to_string),
            started_at: handle.created_at(),
            ended_at: handle.closed_at().unwrap_or_else(Utc::now),
            reason: reason.clone(),
            stats,
        });
        info!(
            reason = %reason,
            duration_seconds = handle.duration_seconds(),
            frames_to_upstream = stats.frames_to_upstream,
            frames_to_caller = stats.frames_to_caller,
            frames_dropped = stats.frames_dropped,
            "Session closed"
        );
        reason
    }
}

/// Connect, negotiate and stream. Returns the reason the call is ending.
async fn bridge(
    handle: &Arc<SessionHandle>,
    config: &SessionConfig,
    telephony: &TelephonyLeg,
    codecs: &CodecRegistry,
    outbound: &Arc<FrameQueue<AudioFrame>>,
    tasks: &mut JoinSet<CloseReason>,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseReason {
    let connect = upstream::connect(&config.credentials, config.connect_timeout);
    let (mut writer, reader) = tokio::select! {
        connected = connect => match connected {
            Ok(halves) => halves,
            Err(e) => {
                error!(error = %e, "Failed to reach upstream");
                return CloseReason::UpstreamUnavailable(e.to_string());
            }
        },
        _ = wait_for_shutdown(shutdown) => return CloseReason::ForcedShutdown,
    };

    handle.advance(SessionState::Negotiating);
    if let Err(e) = writer
        .negotiate(&config.agent, config.upstream_input, config.upstream_output)
        .await
    {
        error!(error = %e, "Upstream negotiation failed");
        return CloseReason::UpstreamUnavailable(e.to_string());
    }

    let (ready_tx, mut ready_rx) = watch::channel(false);
    tasks.spawn(
        read_upstream(reader, outbound.clone(), config.upstream_output, ready_tx, handle.clone()).in_current_span(),
    );

    let (caller_path, agent_path) =
        match negotiate(handle, config, telephony, codecs, &mut ready_rx, tasks, shutdown).await {
            Ok(paths) => paths,
            Err(reason) => {
                close_writer(&mut writer, config.grace_period).await;
                return reason;
            }
        };

    tasks.spawn(pump_caller_audio(telephony.inbound.clone(), writer, caller_path, handle.clone()).in_current_span());
    tasks.spawn(
        pump_agent_audio(outbound.clone(), telephony.commands.clone(), agent_path, handle.clone()).in_current_span(),
    );
    handle.advance(SessionState::Streaming);

    tokio::select! {
        Some(finished) = tasks.join_next() => task_reason(finished),
        _ = wait_for_shutdown(shutdown) => CloseReason::ForcedShutdown,
    }
}

/// Wait for the caller's `start` and upstream readiness, then fix the formats
/// and resolve both conversion paths.
async fn negotiate(
    handle: &SessionHandle,
    config: &SessionConfig,
    telephony: &TelephonyLeg,
    codecs: &CodecRegistry,
    ready: &mut watch::Receiver<bool>,
    tasks: &mut JoinSet<CloseReason>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(Transcoder, Transcoder), CloseReason> {
    let deadline = tokio::time::sleep(config.negotiation_timeout);
    tokio::pin!(deadline);

    let mut start: Option<(String, AudioFormat)> = None;
    let mut upstream_ready = *ready.borrow();
    let mut ready_open = true;

    let (stream_id, telephony_format) = loop {
        if upstream_ready {
            if let Some(found) = start.take() {
                break found;
            }
        }

        tokio::select! {
            event = telephony.inbound.pop(), if start.is_none() => match event {
                Some(TelephonyEvent::Start { stream_id, format }) => {
                    debug!(stream_id = %stream_id, format = %format, "Telephony stream started");
                    start = Some((stream_id, format));
                }
                Some(other) => warn!(event = other.kind(), "Dropping telephony event received before start"),
                None => return Err(CloseReason::TelephonyClosed),
            },
            changed = ready.changed(), if ready_open && !upstream_ready => match changed {
                Ok(()) => upstream_ready = *ready.borrow(),
                Err(_) => ready_open = false,
            },
            Some(finished) = tasks.join_next() => return Err(task_reason(finished)),
            _ = &mut deadline => {
                warn!(
                    have_start = start.is_some(),
                    upstream_ready,
                    "Negotiation timed out"
                );
                return Err(CloseReason::NegotiationTimeout);
            }
            _ = wait_for_shutdown(shutdown) => return Err(CloseReason::ForcedShutdown),
        }
    };

    handle.set_stream_id(stream_id.clone());

    let caller_path = codecs
        .transcoder(telephony_format, config.upstream_input)
        .map_err(|e| CloseReason::UnsupportedFormat(e.to_string()))?;
    let agent_path = codecs
        .transcoder(config.upstream_output, telephony_format)
        .map_err(|e| CloseReason::UnsupportedFormat(e.to_string()))?;

    handle.set_negotiated(NegotiatedFormats {
        telephony: telephony_format,
        upstream_input: config.upstream_input,
        upstream_output: config.upstream_output,
    });
    info!(
        stream_id = %stream_id,
        telephony = %telephony_format,
        upstream_input = %config.upstream_input,
        upstream_output = %config.upstream_output,
        passthrough = caller_path.is_passthrough() && agent_path.is_passthrough(),
        "Negotiation complete"
    );
    Ok((caller_path, agent_path))
}

/// Caller → upstream. Ends when the telephony queue is closed and drained or
/// an upstream write fails; always closes the upstream socket on the way out.
async fn pump_caller_audio(
    inbound: Arc<FrameQueue<TelephonyEvent>>,
    mut writer: UpstreamWriter,
    transcoder: Transcoder,
    handle: Arc<SessionHandle>,
) -> CloseReason {
    let reason = loop {
        let Some(event) = inbound.pop().await else {
            break CloseReason::TelephonyClosed;
        };

        let sent = match event {
            TelephonyEvent::Media(frame) => match transcoder.apply(frame) {
                Ok(frame) => writer
                    .append(&frame)
                    .await
                    .map(|()| SessionStats::incr(&handle.stats.frames_to_upstream)),
                Err(e) => {
                    SessionStats::incr(&handle.stats.malformed_frames);
                    warn!(error = %e, "Dropping caller frame");
                    Ok(())
                }
            },
            TelephonyEvent::Stop => {
                debug!("Caller segment ended; committing upstream audio");
                writer
                    .commit()
                    .await
                    .map(|()| SessionStats::incr(&handle.stats.commits))
            }
            TelephonyEvent::Start { stream_id, .. } => {
                warn!(stream_id = %stream_id, "Ignoring repeated start");
                Ok(())
            }
            TelephonyEvent::Mark(name) => {
                debug!(mark = ?name, "Telephony mark");
                Ok(())
            }
        };

        if let Err(e) = sent {
            warn!(error = %e, "Upstream write failed");
            break CloseReason::UpstreamError(e.to_string());
        }
    };

    writer.close().await;
    reason
}

/// Upstream socket → outbound queue. Also raises the readiness flag the
/// negotiation waits on.
async fn read_upstream(
    mut reader: UpstreamReader,
    outbound: Arc<FrameQueue<AudioFrame>>,
    format: AudioFormat,
    ready: watch::Sender<bool>,
    handle: Arc<SessionHandle>,
) -> CloseReason {
    loop {
        let event = match reader.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                info!("Upstream closed the connection");
                return CloseReason::UpstreamClosed;
            }
            Err(e) if e.is_recoverable() => {
                SessionStats::incr(&handle.stats.malformed_frames);
                warn!(error = %e, "Dropping upstream message");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Upstream connection failed");
                return CloseReason::UpstreamError(e.to_string());
            }
        };

        if event.signals_ready() {
            ready.send_if_modified(|is_ready| !std::mem::replace(is_ready, true));
        }

        match event {
            ServerEvent::AudioDelta { delta } => match upstream::decode_delta(&delta, format) {
                Ok(frame) => {
                    SessionStats::incr(&handle.stats.frames_from_upstream);
                    if matches!(outbound.push(frame), PushOutcome::DroppedOldest | PushOutcome::Rejected) {
                        SessionStats::incr(&handle.stats.frames_dropped);
                    }
                }
                Err(e) => {
                    SessionStats::incr(&handle.stats.malformed_frames);
                    warn!(error = %e, "Dropping upstream audio delta");
                }
            },
            ServerEvent::SessionCreated { .. } | ServerEvent::SessionUpdated { .. } => {
                debug!("Upstream session acknowledged");
            }
            ServerEvent::ResponseDone { .. } => debug!("Upstream response complete"),
            ServerEvent::Error { error } => warn!(error = ?error, "Upstream reported an error"),
            ServerEvent::Other => {}
        }
    }
}

/// Outbound queue → telephony socket, in arrival order.
///
/// Waits while the command channel is full. Meanwhile the reader keeps
/// pushing into `outbound`, which evicts its oldest frames, so a slow caller
/// socket costs dropped audio rather than growing latency.
async fn pump_agent_audio(
    outbound: Arc<FrameQueue<AudioFrame>>,
    commands: mpsc::Sender<TelephonyCommand>,
    transcoder: Transcoder,
    handle: Arc<SessionHandle>,
) -> CloseReason {
    while let Some(frame) = outbound.pop().await {
        let frame = match transcoder.apply(frame) {
            Ok(frame) => frame,
            Err(e) => {
                SessionStats::incr(&handle.stats.malformed_frames);
                warn!(error = %e, "Dropping agent frame");
                continue;
            }
        };

        if commands.send(TelephonyCommand::Media(frame)).await.is_err() {
            return CloseReason::TelephonyClosed;
        }
        SessionStats::incr(&handle.stats.frames_to_caller);
    }
    CloseReason::UpstreamClosed
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn drain(tasks: &mut JoinSet<CloseReason>) {
    while let Some(finished) = tasks.join_next().await {
        if let Err(e) = finished {
            if e.is_panic() {
                error!(error = %e, "Session task panicked");
            }
        }
    }
}

async fn close_writer(writer: &mut UpstreamWriter, limit: Duration) {
    if tokio::time::timeout(limit, writer.close()).await.is_err() {
        debug!("Upstream close did not complete in time");
    }
}

fn task_reason(finished: Result<CloseReason, JoinError>) -> CloseReason {
    finished.unwrap_or_else(|e| CloseReason::UpstreamError(format!("session task failed: {}", e)))
}
