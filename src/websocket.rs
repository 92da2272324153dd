//! # Telephony Media WebSocket
//!
//! The telephony provider opens one WebSocket per call on the media path.
//! The upgrade handler creates a [`Session`] and starts a [`TelephonySocket`]
//! actor holding the socket-side half of the telephony leg.
//!
//! ## Message flow:
//! ```text
//! provider ──text──▶ TelephonySocket ──TelephonyEvent──▶ Session ──▶ upstream
//! provider ◀─text─── TelephonySocket ◀─TelephonyCommand── Session ◀── upstream
//! ```
//!
//! The actor never decides when the call ends. When the provider hangs up the
//! actor stops and closes the inbound queue; when the session ends it sends
//! `Close` and the actor hangs up the socket.

use crate::bridge::{Session, TelephonyCommand, TelephonyEndpoint};
use crate::error::{AppError, BridgeError};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Actor owning one telephony media socket.
pub struct TelephonySocket {
    endpoint: TelephonyEndpoint,
    commands: Option<mpsc::Receiver<TelephonyCommand>>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl TelephonySocket {
    pub fn new(mut endpoint: TelephonyEndpoint, heartbeat_interval: Duration, client_timeout: Duration) -> Self {
        let commands = endpoint.take_commands();
        Self {
            endpoint,
            commands,
            heartbeat_interval,
            client_timeout,
            last_heartbeat: Instant::now(),
        }
    }

    /// Ping on every interval; stop if nothing was heard for `client_timeout`.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.endpoint.session_id(), "Telephony heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for TelephonySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.endpoint.session_id(), "Telephony socket opened");

        if let Some(commands) = self.commands.take() {
            ctx.add_stream(ReceiverStream::new(commands));
        }
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(
            session_id = %self.endpoint.session_id(),
            stream_id = self.endpoint.stream_id().unwrap_or("-"),
            "Telephony socket closed"
        );
        self.endpoint.close();
    }
}

/// Frames from the provider.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TelephonySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                if let Err(e) = self.endpoint.receive_text(&text) {
                    warn!(session_id = %self.endpoint.session_id(), error = %e, "Dropping telephony frame");
                }
            }
            Ok(ws::Message::Binary(bytes)) => {
                debug!(len = bytes.len(), "Ignoring binary frame on telephony socket");
            }
            Ok(ws::Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.endpoint.session_id(), ?reason, "Provider closed the media stream");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                debug!("Ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                warn!(session_id = %self.endpoint.session_id(), error = %e, "Telephony socket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Commands from the session. The stream ends when the session drops its
/// sender, at which point the default `finished` stops the actor.
impl StreamHandler<TelephonyCommand> for TelephonySocket {
    fn handle(&mut self, command: TelephonyCommand, ctx: &mut Self::Context) {
        match command {
            TelephonyCommand::Media(frame) => match self.endpoint.encode_outbound(&frame) {
                Ok(text) => ctx.text(text),
                Err(e) => warn!(error = %e, "Failed to encode outbound media"),
            },
            TelephonyCommand::Close => {
                debug!(session_id = %self.endpoint.session_id(), "Session asked to hang up");
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }
}

/// Upgrade handler for the media path.
///
/// Refuses with 503 when the session limit is reached. The session task is
/// spawned only after the handshake succeeded, so a failed upgrade leaves no
/// registry entry behind.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "Media stream upgrade requested");

    let config = state.get_config();
    let (session, endpoint) = match Session::create(
        config.session_config(),
        &state.sessions,
        state.codecs.clone(),
        state.notifier.clone(),
    ) {
        Ok(created) => created,
        Err(e) => {
            if matches!(e, BridgeError::CapacityExceeded(_)) {
                state.record_session_rejected();
            }
            warn!(error = %e, "Refusing media stream");
            return Err(AppError::from(e).into());
        }
    };

    let socket = TelephonySocket::new(endpoint, config.heartbeat_interval(), config.client_timeout());
    let response = ws::start(socket, &req, stream)?;

    state.record_session_started();
    actix_web::rt::spawn(session.run());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SessionHandle;
    use crate::config::AppConfig;
    use actix_web::{test as actix_test, App, HttpServer};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(5);

    /// Upstream that acknowledges the session and speaks every appended
    /// chunk straight back.
    async fn echo_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::text(json!({"type": "session.created"}).to_string()))
                .await
                .unwrap();

            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else { continue };
                let event: Value = serde_json::from_str(&text).unwrap();
                if event["type"] == "input_audio_buffer.append" {
                    let reply = json!({"type": "response.output_audio.delta", "delta": event["audio"]});
                    if ws.send(Message::text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        });

        url
    }

    fn app_config(upstream_url: String) -> AppConfig {
        let mut config = AppConfig::default();
        config.upstream.url = upstream_url;
        config.bridge.grace_period_ms = 200;
        config
    }

    #[actix_web::test]
    async fn test_media_round_trip_through_bridge() {
        let state = web::Data::new(AppState::new(app_config(echo_upstream().await)));
        let server = HttpServer::new({
            let state = state.clone();
            move || {
                App::new()
                    .app_data(state.clone())
                    .route("/media-stream", web::get().to(media_stream))
            }
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let server_handle = server.handle();
        actix_web::rt::spawn(server);

        let (mut caller, _) = tokio_tungstenite::connect_async(format!("ws://{}/media-stream", addr))
            .await
            .unwrap();
        caller
            .send(Message::text(
                json!({"event": "start", "start": {"streamSid": "MZ-e2e", "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}}})
                    .to_string(),
            ))
            .await
            .unwrap();

        let payload = BASE64.encode([0x7fu8; 160]);
        let played = tokio::time::timeout(WAIT, async {
            loop {
                // Media sent before negotiation finishes is dropped, so keep talking.
                caller
                    .send(Message::text(json!({"event": "media", "media": {"payload": &payload}}).to_string()))
                    .await
                    .unwrap();
                if let Ok(Some(Ok(Message::Text(text)))) =
                    tokio::time::timeout(Duration::from_millis(100), caller.next()).await
                {
                    break serde_json::from_str::<Value>(&text).unwrap();
                }
            }
        })
        .await
        .expect("agent audio played back");

        assert_eq!(played, json!({"event": "media", "streamId": "MZ-e2e", "payload": payload}));
        assert_eq!(state.get_metrics_snapshot().sessions_started, 1);
        assert_eq!(state.sessions.len(), 1);

        caller.close(None).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while !state.sessions.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session removed after hang-up");

        server_handle.stop(false).await;
    }

    #[actix_web::test]
    async fn test_upgrade_refused_at_capacity() {
        let mut config = AppConfig::default();
        config.bridge.max_concurrent_sessions = 1;
        let state = web::Data::new(AppState::new(config));
        let _held = state
            .sessions
            .register(Arc::new(SessionHandle::new("held".to_string())))
            .unwrap();

        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/media-stream", web::get().to(media_stream)),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/media-stream").to_request();
        let resp = actix_test::call_service(&app, req).await;

        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.get_metrics_snapshot().sessions_rejected, 1);
        assert_eq!(state.sessions.len(), 1);
    }

    #[actix_web::test]
    async fn test_failed_handshake_leaves_no_session() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/media-stream", web::get().to(media_stream)),
        )
        .await;

        // Plain GET without upgrade headers.
        let req = actix_test::TestRequest::get().uri("/media-stream").to_request();
        let resp = actix_test::call_service(&app, req).await;

        assert!(resp.status().is_client_error());
        assert!(state.sessions.is_empty());
        assert_eq!(state.get_metrics_snapshot().sessions_started, 0);
    }
}
