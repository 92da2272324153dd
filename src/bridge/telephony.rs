//! # Telephony Leg
//!
//! The telephony provider's media-stream line protocol: one JSON envelope per
//! WebSocket text message, dispatched on its `event` field.
//!
//! ```json
//! {"event": "start", "streamId": "MZ18ad…", "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}}
//! {"event": "media", "payload": "//////////…"}
//! {"event": "stop"}
//! ```
//!
//! Providers that nest the details (`start.streamSid`, `media.payload`) are
//! accepted too. Envelopes are decoded once here; everything past this module
//! works on [`TelephonyEvent`].
//!
//! The leg is split in two halves joined by a queue and a channel:
//! - [`TelephonyEndpoint`]: held by the socket. Decodes envelopes into the
//!   inbound queue and receives [`TelephonyCommand`]s to write back.
//! - [`TelephonyLeg`]: held by the session. Pops caller events and sends
//!   commands.

use crate::bridge::handle::{SessionHandle, SessionStats};
use crate::bridge::queue::{Evictable, FrameQueue, PushOutcome};
use crate::codec::{AudioEncoding, AudioFormat, AudioFrame};
use crate::error::BridgeError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaFormatDescriptor {
    encoding: AudioEncoding,
    sample_rate: u32,
    #[serde(default = "default_channels")]
    channels: u8,
}

fn default_channels() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartDetails {
    #[serde(default, alias = "streamSid")]
    stream_id: Option<String>,
    #[serde(default)]
    media_format: Option<MediaFormatDescriptor>,
}

#[derive(Debug, Deserialize)]
struct MediaDetails {
    payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundEnvelope {
    Connected {},
    Start {
        #[serde(default, rename = "streamId", alias = "streamSid")]
        stream_id: Option<String>,
        #[serde(default, rename = "mediaFormat")]
        media_format: Option<MediaFormatDescriptor>,
        #[serde(default)]
        start: Option<StartDetails>,
    },
    Media {
        #[serde(default)]
        payload: Option<String>,
        #[serde(default)]
        media: Option<MediaDetails>,
    },
    Stop {},
    Mark {
        #[serde(default)]
        mark: Option<MarkDetails>,
    },
}

#[derive(Debug, Deserialize)]
struct MarkDetails {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum OutboundEnvelope<'a> {
    Media {
        #[serde(rename = "streamId", skip_serializing_if = "Option::is_none")]
        stream_id: Option<&'a str>,
        payload: String,
    },
}

/// A caller-side event after envelope decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyEvent {
    Start { stream_id: String, format: AudioFormat },
    Media(AudioFrame),
    Stop,
    Mark(Option<String>),
}

impl TelephonyEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TelephonyEvent::Start { .. } => "start",
            TelephonyEvent::Media(_) => "media",
            TelephonyEvent::Stop => "stop",
            TelephonyEvent::Mark(_) => "mark",
        }
    }
}

impl Evictable for TelephonyEvent {
    fn evictable(&self) -> bool {
        matches!(self, TelephonyEvent::Media(_))
    }
}

/// What the session asks the telephony socket to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyCommand {
    /// Play one frame to the caller.
    Media(AudioFrame),
    /// Hang up the media stream.
    Close,
}

/// Stateful envelope decoder for one media stream.
///
/// Remembers the format announced by `start` so later `media` payloads can be
/// tagged with it. The first `start` wins; the format is never renegotiated.
#[derive(Debug)]
pub struct TelephonyDecoder {
    default_format: AudioFormat,
    announced: Option<AudioFormat>,
    stream_id: Option<String>,
}

impl TelephonyDecoder {
    pub fn new(default_format: AudioFormat) -> Self {
        Self {
            default_format,
            announced: None,
            stream_id: None,
        }
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// Format media frames are currently tagged with.
    pub fn format(&self) -> AudioFormat {
        self.announced.unwrap_or(self.default_format)
    }

    /// Decode one text message. `Ok(None)` means the envelope was valid but
    /// carries nothing the session needs.
    pub fn decode(&mut self, text: &str) -> Result<Option<TelephonyEvent>, BridgeError> {
        let envelope: InboundEnvelope = serde_json::from_str(text)
            .map_err(|e| BridgeError::MalformedFrame(format!("invalid telephony envelope: {}", e)))?;

        match envelope {
            InboundEnvelope::Connected {} => {
                debug!("Telephony transport connected");
                Ok(None)
            }
            InboundEnvelope::Start {
                stream_id,
                media_format,
                start,
            } => {
                let (nested_id, nested_format) = match start {
                    Some(details) => (details.stream_id, details.media_format),
                    None => (None, None),
                };
                let stream_id = stream_id
                    .or(nested_id)
                    .ok_or_else(|| BridgeError::MalformedFrame("start without stream id".to_string()))?;
                let descriptor = media_format
                    .or(nested_format)
                    .ok_or_else(|| BridgeError::MalformedFrame("start without media format".to_string()))?;
                if descriptor.channels != 1 {
                    return Err(BridgeError::MalformedFrame(format!(
                        "unsupported channel count {}",
                        descriptor.channels
                    )));
                }

                let format = AudioFormat::new(descriptor.encoding, descriptor.sample_rate);
                if self.announced.is_none() {
                    self.announced = Some(format);
                    self.stream_id = Some(stream_id.clone());
                }
                Ok(Some(TelephonyEvent::Start { stream_id, format }))
            }
            InboundEnvelope::Media { payload, media } => {
                let payload = payload
                    .or(media.map(|m| m.payload))
                    .ok_or_else(|| BridgeError::MalformedFrame("media without payload".to_string()))?;
                let bytes = BASE64
                    .decode(payload.as_bytes())
                    .map_err(|e| BridgeError::MalformedFrame(format!("invalid base64 payload: {}", e)))?;
                if bytes.is_empty() {
                    return Err(BridgeError::MalformedFrame("empty media payload".to_string()));
                }
                Ok(Some(TelephonyEvent::Media(AudioFrame::new(bytes, self.format()))))
            }
            InboundEnvelope::Stop {} => Ok(Some(TelephonyEvent::Stop)),
            InboundEnvelope::Mark { mark } => Ok(Some(TelephonyEvent::Mark(mark.and_then(|m| m.name)))),
        }
    }
}

/// Wrap one outbound frame in the provider's media envelope.
pub fn encode_media(stream_id: Option<&str>, frame: &AudioFrame) -> Result<String, BridgeError> {
    let envelope = OutboundEnvelope::Media {
        stream_id,
        payload: BASE64.encode(frame.data()),
    };
    serde_json::to_string(&envelope)
        .map_err(|e| BridgeError::MalformedFrame(format!("failed to encode media envelope: {}", e)))
}

/// Session-side half of the telephony leg.
///
/// The command channel holds at most `queue_capacity` commands. A sender
/// waiting on it leaves newer agent audio in the session's drop-oldest queue.
#[derive(Clone)]
pub struct TelephonyLeg {
    pub inbound: Arc<FrameQueue<TelephonyEvent>>,
    pub commands: mpsc::Sender<TelephonyCommand>,
}

/// Socket-side half of the telephony leg.
///
/// Dropping it closes the inbound queue, which the session reads as the
/// caller hanging up.
pub struct TelephonyEndpoint {
    handle: Arc<SessionHandle>,
    inbound: Arc<FrameQueue<TelephonyEvent>>,
    commands: Option<mpsc::Receiver<TelephonyCommand>>,
    decoder: TelephonyDecoder,
}

/// Create both halves of a telephony leg for the session behind `handle`.
pub fn leg_pair(
    handle: Arc<SessionHandle>,
    queue_capacity: usize,
    default_format: AudioFormat,
) -> (TelephonyLeg, TelephonyEndpoint) {
    let inbound = Arc::new(FrameQueue::new(queue_capacity));
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));

    let leg = TelephonyLeg {
        inbound: inbound.clone(),
        commands: tx,
    };
    let endpoint = TelephonyEndpoint {
        handle,
        inbound,
        commands: Some(rx),
        decoder: TelephonyDecoder::new(default_format),
    };
    (leg, endpoint)
}

impl TelephonyEndpoint {
    pub fn session_id(&self) -> &str {
        self.handle.id()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.decoder.stream_id()
    }

    /// The command receiver; can be taken once.
    pub fn take_commands(&mut self) -> Option<mpsc::Receiver<TelephonyCommand>> {
        self.commands.take()
    }

    /// Decode one envelope and queue it for the session.
    ///
    /// Errors are frame-level: the caller logs them and keeps the socket open.
    pub fn receive_text(&mut self, text: &str) -> Result<(), BridgeError> {
        let event = match self.decoder.decode(text) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(e) => {
                SessionStats::incr(&self.handle.stats.malformed_frames);
                return Err(e);
            }
        };

        if matches!(event, TelephonyEvent::Media(_)) {
            SessionStats::incr(&self.handle.stats.frames_from_caller);
        }
        let kind = event.kind();
        match self.inbound.push(event) {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest => SessionStats::incr(&self.handle.stats.frames_dropped),
            PushOutcome::Rejected => {
                SessionStats::incr(&self.handle.stats.frames_dropped);
                warn!(event = kind, "Inbound queue full of control events; telephony event discarded");
            }
            PushOutcome::Closed => debug!("Inbound queue closed; telephony event discarded"),
        }
        Ok(())
    }

    /// Render an outbound frame as a text message for the socket.
    pub fn encode_outbound(&self, frame: &AudioFrame) -> Result<String, BridgeError> {
        encode_media(self.decoder.stream_id(), frame)
    }

    /// The socket is gone; let the session know.
    pub fn close(&self) {
        self.inbound.close();
    }
}

impl Drop for TelephonyEndpoint {
    fn drop(&mut self) {
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> TelephonyDecoder {
        TelephonyDecoder::new(AudioFormat::telephony_mulaw())
    }

    const START: &str = r#"{"event":"start","streamId":"MZ123","mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":1}}"#;

    #[test]
    fn test_start_announces_format() {
        let mut decoder = decoder();
        let event = decoder.decode(START).unwrap().unwrap();
        assert_eq!(
            event,
            TelephonyEvent::Start {
                stream_id: "MZ123".to_string(),
                format: AudioFormat::telephony_mulaw(),
            }
        );
        assert_eq!(decoder.stream_id(), Some("MZ123"));
    }

    #[test]
    fn test_nested_start_and_media_shape() {
        let mut decoder = decoder();
        let start = r#"{"event":"start","sequenceNumber":"1","start":{"streamSid":"MZ9","mediaFormat":{"encoding":"audio/x-alaw","sampleRate":8000,"channels":1}},"streamSid":"MZ9"}"#;
        match decoder.decode(start).unwrap() {
            Some(TelephonyEvent::Start { stream_id, format }) => {
                assert_eq!(stream_id, "MZ9");
                assert_eq!(format.encoding, AudioEncoding::Alaw);
            }
            other => panic!("unexpected {:?}", other),
        }

        let media = r#"{"event":"media","streamSid":"MZ9","media":{"track":"inbound","chunk":"1","timestamp":"5","payload":"1dXV"}}"#;
        match decoder.decode(media).unwrap() {
            Some(TelephonyEvent::Media(frame)) => {
                assert_eq!(frame.data(), &[0xD5, 0xD5, 0xD5]);
                assert_eq!(frame.format().encoding, AudioEncoding::Alaw);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_media_tagged_with_announced_format() {
        let mut decoder = TelephonyDecoder::new(AudioFormat::new(AudioEncoding::Pcm16, 8000));
        decoder.decode(START).unwrap();

        let media = format!(r#"{{"event":"media","payload":"{}"}}"#, BASE64.encode([0xFFu8; 160]));
        match decoder.decode(&media).unwrap() {
            Some(TelephonyEvent::Media(frame)) => {
                assert_eq!(frame.len(), 160);
                assert_eq!(frame.format(), AudioFormat::telephony_mulaw());
                assert_eq!(frame.duration_ms(), 20);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_second_start_does_not_renegotiate() {
        let mut decoder = decoder();
        decoder.decode(START).unwrap();
        let again = r#"{"event":"start","streamId":"MZ456","mediaFormat":{"encoding":"pcm16","sampleRate":8000}}"#;
        assert!(decoder.decode(again).unwrap().is_some());
        assert_eq!(decoder.stream_id(), Some("MZ123"));
        assert_eq!(decoder.format(), AudioFormat::telephony_mulaw());
    }

    #[test]
    fn test_malformed_envelopes_are_frame_errors() {
        let mut decoder = decoder();
        for bad in [
            "not json",
            r#"{"event":"dance"}"#,
            r#"{"payload":"AAAA"}"#,
            r#"{"event":"start","mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":8000}}"#,
            r#"{"event":"start","streamId":"x","mediaFormat":{"encoding":"opus","sampleRate":48000}}"#,
            r#"{"event":"start","streamId":"x","mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":2}}"#,
            r#"{"event":"media"}"#,
            r#"{"event":"media","payload":"%%%not-base64%%%"}"#,
            r#"{"event":"media","payload":""}"#,
        ] {
            let err = decoder.decode(bad).unwrap_err();
            assert!(err.is_recoverable(), "{} should be recoverable", bad);
        }
    }

    #[test]
    fn test_control_envelopes() {
        let mut decoder = decoder();
        assert!(decoder.decode(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#).unwrap().is_none());
        assert_eq!(decoder.decode(r#"{"event":"stop","streamSid":"MZ123"}"#).unwrap(), Some(TelephonyEvent::Stop));
        assert_eq!(
            decoder.decode(r#"{"event":"mark","mark":{"name":"greeting"}}"#).unwrap(),
            Some(TelephonyEvent::Mark(Some("greeting".to_string())))
        );
    }

    #[test]
    fn test_outbound_media_envelope() {
        let frame = AudioFrame::new(vec![0xFFu8, 0x7F], AudioFormat::telephony_mulaw());
        let text = encode_media(Some("MZ123"), &frame).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamId"], "MZ123");
        assert_eq!(value["payload"], "/38=");

        let anonymous: serde_json::Value = serde_json::from_str(&encode_media(None, &frame).unwrap()).unwrap();
        assert!(anonymous.get("streamId").is_none());
    }

    #[tokio::test]
    async fn test_endpoint_queues_events_and_counts() {
        let handle = Arc::new(SessionHandle::new("sess".into()));
        let (leg, mut endpoint) = leg_pair(handle.clone(), 8, AudioFormat::telephony_mulaw());

        endpoint.receive_text(START).unwrap();
        endpoint
            .receive_text(&format!(r#"{{"event":"media","payload":"{}"}}"#, BASE64.encode([0xFFu8; 4])))
            .unwrap();
        assert!(endpoint.receive_text(r#"{"event":"media","payload":"***"}"#).is_err());
        endpoint.receive_text(r#"{"event":"stop"}"#).unwrap();

        assert_eq!(leg.inbound.pop().await.map(|e| e.kind()), Some("start"));
        assert_eq!(leg.inbound.pop().await.map(|e| e.kind()), Some("media"));
        assert_eq!(leg.inbound.pop().await.map(|e| e.kind()), Some("stop"));

        let stats = handle.stats.snapshot();
        assert_eq!(stats.frames_from_caller, 1);
        assert_eq!(stats.malformed_frames, 1);
    }

    #[tokio::test]
    async fn test_dropping_endpoint_closes_inbound() {
        let handle = Arc::new(SessionHandle::new("sess".into()));
        let (leg, endpoint) = leg_pair(handle, 4, AudioFormat::telephony_mulaw());
        drop(endpoint);
        assert_eq!(leg.inbound.pop().await, None);
        assert!(leg.commands.send(TelephonyCommand::Close).await.is_err());
    }

    #[test]
    fn test_command_channel_is_bounded_by_queue_capacity() {
        let handle = Arc::new(SessionHandle::new("sess".into()));
        let (leg, _endpoint) = leg_pair(handle, 2, AudioFormat::telephony_mulaw());
        let frame = AudioFrame::new(vec![0xFF; 160], AudioFormat::telephony_mulaw());

        assert!(leg.commands.try_send(TelephonyCommand::Media(frame.clone())).is_ok());
        assert!(leg.commands.try_send(TelephonyCommand::Media(frame.clone())).is_ok());
        assert!(matches!(
            leg.commands.try_send(TelephonyCommand::Media(frame)),
            Err(mpsc::error::TrySendError::Full(_))
        ));
    }
}
