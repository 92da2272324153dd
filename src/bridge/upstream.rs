//! # Upstream Leg
//!
//! Client for the AI speech endpoint's realtime WebSocket protocol. Messages
//! are JSON objects dispatched on their `type` field.
//!
//! ## Outbound:
//! - `session.update`: input/output audio formats and voice, sent on connect
//! - `response.create`: the agent's instructions with no prior context, sent
//!   on connect; sent again (bare) after every commit
//! - `input_audio_buffer.append`: one base64 audio chunk
//! - `input_audio_buffer.commit`: the caller's utterance is complete
//!
//! ## Inbound:
//! Only audio deltas, session acknowledgments, completions and errors are
//! modelled; every other event type decodes to [`ServerEvent::Other`].
//!
//! The socket is split after the handshake: [`UpstreamWriter`] belongs to the
//! caller→upstream pump and [`UpstreamReader`] to the upstream→caller pump, so
//! neither direction ever waits on the other.

use crate::bridge::hooks::UpstreamCredentials;
use crate::codec::{AudioEncoding, AudioFormat, AudioFrame};
use crate::error::BridgeError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The agent's voice and behavior, sent during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProfile {
    pub instructions: String,
    pub voice: String,
    pub modalities: Vec<String>,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            instructions: "You are a helpful phone assistant. Keep answers short and speak naturally.".to_string(),
            voice: "alloy".to_string(),
            modalities: vec!["audio".to_string(), "text".to_string()],
        }
    }
}

/// Wire descriptor of an audio format, e.g. `{"type": "audio/pcmu"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WireFormat {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
}

impl From<AudioFormat> for WireFormat {
    fn from(format: AudioFormat) -> Self {
        match format.encoding {
            AudioEncoding::Mulaw => WireFormat {
                kind: "audio/pcmu",
                rate: None,
            },
            AudioEncoding::Alaw => WireFormat {
                kind: "audio/pcma",
                rate: None,
            },
            AudioEncoding::Pcm16 => WireFormat {
                kind: "audio/pcm",
                rate: Some(format.sample_rate),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    pub input_format: WireFormat,
    pub output_format: WireFormat,
    pub voice: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<&'static str>,
}

/// Messages the bridge sends upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionParams },
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseParams },
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    CommitAudio,
}

impl ClientEvent {
    pub fn session_update(profile: &AgentProfile, input: AudioFormat, output: AudioFormat) -> Self {
        ClientEvent::SessionUpdate {
            session: SessionParams {
                input_format: input.into(),
                output_format: output.into(),
                voice: profile.voice.clone(),
            },
        }
    }

    /// The opening response: instructions, modalities and no prior conversation.
    pub fn initial_response(profile: &AgentProfile) -> Self {
        ClientEvent::ResponseCreate {
            response: ResponseParams {
                instructions: Some(profile.instructions.clone()),
                modalities: Some(profile.modalities.clone()),
                conversation: Some("none"),
            },
        }
    }

    /// The response requested after a commit, over the accumulated context.
    pub fn flush_response() -> Self {
        ClientEvent::ResponseCreate {
            response: ResponseParams::default(),
        }
    }

    pub fn append(frame: &AudioFrame) -> Self {
        ClientEvent::AppendAudio {
            audio: BASE64.encode(frame.data()),
        }
    }
}

/// Events the bridge reacts to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Option<Value>,
    },
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Option<Value>,
    },
    #[serde(rename = "response.output_audio.delta", alias = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Option<Value>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(other)]
    Other,
}

impl ServerEvent {
    /// Acknowledgment or first data frame: the upstream is ready for audio.
    pub fn signals_ready(&self) -> bool {
        matches!(
            self,
            ServerEvent::SessionCreated { .. } | ServerEvent::SessionUpdated { .. } | ServerEvent::AudioDelta { .. }
        )
    }
}

pub fn parse_server_event(text: &str) -> Result<ServerEvent, BridgeError> {
    serde_json::from_str(text).map_err(|e| BridgeError::MalformedFrame(format!("invalid upstream event: {}", e)))
}

/// Decode an audio delta into a frame tagged with the upstream output format.
pub fn decode_delta(delta: &str, format: AudioFormat) -> Result<AudioFrame, BridgeError> {
    let bytes = BASE64
        .decode(delta.as_bytes())
        .map_err(|e| BridgeError::MalformedFrame(format!("invalid base64 audio delta: {}", e)))?;
    if bytes.is_empty() {
        return Err(BridgeError::MalformedFrame("empty audio delta".to_string()));
    }
    Ok(AudioFrame::new(bytes, format))
}

/// Dial the upstream endpoint and split the socket.
///
/// The whole handshake is bounded by `timeout`; any failure is
/// `UpstreamUnavailable` and is not retried.
pub async fn connect(
    credentials: &UpstreamCredentials,
    timeout: Duration,
) -> Result<(UpstreamWriter, UpstreamReader), BridgeError> {
    let mut request = credentials
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| BridgeError::UpstreamUnavailable(format!("invalid upstream url: {}", e)))?;

    if credentials.has_token() {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.token))
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("invalid upstream token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
    }
    request
        .headers_mut()
        .insert("openai-beta", HeaderValue::from_static("realtime=v1"));

    let (socket, response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| BridgeError::UpstreamUnavailable(format!("connect timed out after {:?}", timeout)))?
        .map_err(|e| BridgeError::UpstreamUnavailable(e.to_string()))?;

    info!(url = %credentials.url, status = %response.status(), "Upstream connected");

    let (sink, stream) = socket.split();
    Ok((UpstreamWriter { sink }, UpstreamReader { stream }))
}

/// Sending half of the upstream socket.
pub struct UpstreamWriter {
    sink: SplitSink<WsStream, Message>,
}

impl UpstreamWriter {
    pub async fn send(&mut self, event: &ClientEvent) -> Result<(), BridgeError> {
        let text = serde_json::to_string(event)
            .map_err(|e| BridgeError::MalformedFrame(format!("failed to encode upstream event: {}", e)))?;
        self.sink
            .send(Message::text(text))
            .await
            .map_err(|e| BridgeError::upstream_closed(e.to_string()))
    }

    /// The two negotiation messages, in order.
    pub async fn negotiate(
        &mut self,
        profile: &AgentProfile,
        input: AudioFormat,
        output: AudioFormat,
    ) -> Result<(), BridgeError> {
        self.send(&ClientEvent::session_update(profile, input, output)).await?;
        self.send(&ClientEvent::initial_response(profile)).await?;
        debug!(input = %input, output = %output, voice = %profile.voice, "Upstream negotiation sent");
        Ok(())
    }

    pub async fn append(&mut self, frame: &AudioFrame) -> Result<(), BridgeError> {
        self.send(&ClientEvent::append(frame)).await
    }

    /// Commit the buffered input and ask for a response to it.
    pub async fn commit(&mut self) -> Result<(), BridgeError> {
        self.send(&ClientEvent::CommitAudio).await?;
        self.send(&ClientEvent::flush_response()).await
    }

    /// Start the closing handshake. Errors are ignored: the socket may
    /// already be gone.
    pub async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "Upstream close handshake failed");
        }
    }
}

/// Receiving half of the upstream socket.
pub struct UpstreamReader {
    stream: SplitStream<WsStream>,
}

impl UpstreamReader {
    /// Next decoded event. `Ok(None)` once the upstream has closed.
    ///
    /// A frame that does not parse is a recoverable error; a socket error is
    /// not.
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>, BridgeError> {
        loop {
            let message = match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(BridgeError::upstream_closed(e.to_string())),
                Some(Ok(message)) => message,
            };

            match message {
                Message::Text(text) => return parse_server_event(&text).map(Some),
                Message::Close(frame) => {
                    debug!(frame = ?frame, "Upstream sent close");
                    return Ok(None);
                }
                Message::Binary(bytes) => {
                    debug!(len = bytes.len(), "Ignoring binary upstream message");
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pcm24k() -> AudioFormat {
        AudioFormat::new(AudioEncoding::Pcm16, 24000)
    }

    #[test]
    fn test_session_update_shape() {
        let profile = AgentProfile {
            voice: "verse".to_string(),
            ..AgentProfile::default()
        };
        let event = ClientEvent::session_update(&profile, AudioFormat::telephony_mulaw(), pcm24k());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "session.update",
                "session": {
                    "inputFormat": {"type": "audio/pcmu"},
                    "outputFormat": {"type": "audio/pcm", "rate": 24000},
                    "voice": "verse"
                }
            })
        );
    }

    #[test]
    fn test_initial_and_flush_responses_differ() {
        let profile = AgentProfile::default();
        let initial = serde_json::to_value(ClientEvent::initial_response(&profile)).unwrap();
        assert_eq!(initial["type"], "response.create");
        assert_eq!(initial["response"]["conversation"], "none");
        assert_eq!(initial["response"]["instructions"], profile.instructions.as_str());
        assert_eq!(initial["response"]["modalities"], json!(["audio", "text"]));

        let flush = serde_json::to_value(ClientEvent::flush_response()).unwrap();
        assert_eq!(flush, json!({"type": "response.create", "response": {}}));
    }

    #[test]
    fn test_append_and_commit_shape() {
        let frame = AudioFrame::new(vec![0xFFu8; 3], AudioFormat::telephony_mulaw());
        assert_eq!(
            serde_json::to_value(ClientEvent::append(&frame)).unwrap(),
            json!({"type": "input_audio_buffer.append", "audio": "////"})
        );
        assert_eq!(
            serde_json::to_value(ClientEvent::CommitAudio).unwrap(),
            json!({"type": "input_audio_buffer.commit"})
        );
    }

    #[test]
    fn test_server_event_filtering() {
        assert_eq!(
            parse_server_event(r#"{"type":"response.output_audio.delta","response_id":"r1","delta":"AAA="}"#).unwrap(),
            ServerEvent::AudioDelta {
                delta: "AAA=".to_string()
            }
        );
        assert!(matches!(
            parse_server_event(r#"{"type":"response.audio.delta","delta":"AAA="}"#).unwrap(),
            ServerEvent::AudioDelta { .. }
        ));
        assert!(matches!(
            parse_server_event(r#"{"type":"error","error":{"message":"bad"}}"#).unwrap(),
            ServerEvent::Error { error: Some(_) }
        ));
        assert_eq!(
            parse_server_event(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap(),
            ServerEvent::Other
        );
        assert!(parse_server_event(r#"{"type":"session.created","session":{"id":"s"}}"#)
            .unwrap()
            .signals_ready());
        assert!(!ServerEvent::Other.signals_ready());

        let err = parse_server_event("{not json").unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_decode_delta() {
        let frame = decode_delta("AAD/fw==", pcm24k()).unwrap();
        assert_eq!(frame.data(), &[0x00, 0x00, 0xFF, 0x7F]);
        assert_eq!(frame.format(), pcm24k());

        assert!(decode_delta("@@@", pcm24k()).unwrap_err().is_recoverable());
        assert!(decode_delta("", pcm24k()).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let creds = UpstreamCredentials::new(format!("ws://{}", addr), "token");
        let result = connect(&creds, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(BridgeError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_connect_sends_auth_headers() {
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut seen = None;
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                seen = Some((
                    req.headers().get("authorization").cloned(),
                    req.headers().get("openai-beta").cloned(),
                ));
                Ok(resp)
            };
            let _ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();
            seen
        });

        let creds = UpstreamCredentials::new(format!("ws://{}", addr), "sk-test");
        let (_writer, _reader) = connect(&creds, Duration::from_secs(2)).await.unwrap();

        let (auth, beta) = server.await.unwrap().unwrap();
        assert_eq!(auth.unwrap(), "Bearer sk-test");
        assert_eq!(beta.unwrap(), "realtime=v1");
    }
}
