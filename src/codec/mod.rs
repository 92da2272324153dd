//! # Frame Codec
//!
//! Stateless conversion of single audio frames between the encodings the two
//! legs of a call speak. Every frame is self-contained: one G.711 byte is one
//! sample and there is no prediction state carried from one frame to the next,
//! so a codec never buffers across calls.
//!
//! ## Key Components:
//! - **AudioFormat / AudioFrame**: immutable format tag and encoded sample block
//! - **Codec**: one companded encoding ⇄ 16-bit linear PCM (`g711`)
//! - **CodecRegistry**: the set of codecs a process knows about
//! - **Transcoder**: the conversion path resolved once per call direction
//!
//! ## Adding a codec:
//! Implement [`Codec`] for the new encoding and register it. The session never
//! looks at encodings itself; it only asks the registry for a [`Transcoder`].

pub mod g711;
pub mod pcm;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use g711::{G711Codec, G711Law};

/// Errors produced while converting a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Empty or truncated sample block.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The frame is not tagged with the format this path was resolved for.
    #[error("frame format {actual} does not match expected {expected}")]
    FormatMismatch {
        expected: AudioFormat,
        actual: AudioFormat,
    },

    /// No conversion path exists between the two formats.
    #[error("no conversion from {from} to {to}")]
    UnsupportedConversion { from: AudioFormat, to: AudioFormat },

    /// The encoding is valid but no codec is registered for it.
    #[error("no codec registered for {0}")]
    UnknownEncoding(AudioEncoding),
}

/// Sample encodings understood by the bridge.
///
/// The serialized names are the short forms used in configuration files; the
/// aliases cover the MIME-style names telephony providers announce in their
/// `start` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioEncoding {
    /// G.711 μ-law, 8 bits per sample.
    #[serde(rename = "g711_ulaw", alias = "audio/x-mulaw", alias = "pcmu")]
    Mulaw,
    /// G.711 A-law, 8 bits per sample.
    #[serde(rename = "g711_alaw", alias = "audio/x-alaw", alias = "pcma")]
    Alaw,
    /// Signed 16-bit little-endian linear PCM.
    #[serde(rename = "pcm16", alias = "audio/pcm", alias = "audio/l16")]
    Pcm16,
}

impl AudioEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Mulaw => "g711_ulaw",
            AudioEncoding::Alaw => "g711_alaw",
            AudioEncoding::Pcm16 => "pcm16",
        }
    }

    /// Bits used to store one sample on the wire.
    pub fn bit_depth(&self) -> u8 {
        match self {
            AudioEncoding::Mulaw | AudioEncoding::Alaw => 8,
            AudioEncoding::Pcm16 => 16,
        }
    }

    /// Whether this is the linear representation codecs decode into.
    pub fn is_linear(&self) -> bool {
        matches!(self, AudioEncoding::Pcm16)
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format descriptor for one direction of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
}

impl AudioFormat {
    pub fn new(encoding: AudioEncoding, sample_rate: u32) -> Self {
        Self {
            encoding,
            sample_rate,
        }
    }

    /// 8 kHz μ-law, the native format of PSTN media streams.
    pub fn telephony_mulaw() -> Self {
        Self::new(AudioEncoding::Mulaw, 8000)
    }

    pub fn bit_depth(&self) -> u8 {
        self.encoding.bit_depth()
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bit_depth() as usize / 8
    }

    /// Same sample rate, linear PCM encoding.
    pub fn as_linear(&self) -> Self {
        Self::new(AudioEncoding::Pcm16, self.sample_rate)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}Hz", self.encoding, self.sample_rate)
    }
}

/// An immutable block of encoded samples plus the format it is encoded in.
///
/// Transformations never mutate a frame; they consume it and return a new
/// one. The payload is a [`Bytes`] so moving a frame between queues and legs
/// never copies sample data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
    format: AudioFormat,
}

impl AudioFrame {
    pub fn new(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        Self {
            data: data.into(),
            format,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / self.format.bytes_per_sample()
    }

    /// Playback duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.format.sample_rate == 0 {
            return 0;
        }
        self.sample_count() as u64 * 1000 / self.format.sample_rate as u64
    }
}

/// One companded encoding and its conversion to and from linear PCM.
///
/// Implementations must be pure: the output depends only on the input frame.
pub trait Codec: Send + Sync {
    /// The companded encoding this codec handles.
    fn encoding(&self) -> AudioEncoding;

    /// Convert a linear PCM frame into `target`, which must use this codec's
    /// encoding and the frame's sample rate.
    fn encode(&self, frame: &AudioFrame, target: AudioFormat) -> Result<AudioFrame, CodecError>;

    /// Convert a frame encoded in `source` (this codec's encoding) to linear
    /// PCM at the same sample rate.
    fn decode(&self, frame: &AudioFrame, source: AudioFormat) -> Result<AudioFrame, CodecError>;
}

/// Codecs available to sessions, keyed by the encoding they handle.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<AudioEncoding, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.encoding(), codec);
    }

    pub fn get(&self, encoding: AudioEncoding) -> Result<Arc<dyn Codec>, CodecError> {
        self.codecs
            .get(&encoding)
            .cloned()
            .ok_or(CodecError::UnknownEncoding(encoding))
    }

    pub fn encodings(&self) -> Vec<AudioEncoding> {
        self.codecs.keys().copied().collect()
    }

    /// Resolve the conversion path from `source` to `target`.
    ///
    /// Identical formats resolve to passthrough. Different sample rates never
    /// resolve: resampling is not something the bridge does.
    pub fn transcoder(&self, source: AudioFormat, target: AudioFormat) -> Result<Transcoder, CodecError> {
        if source == target {
            return Ok(Transcoder {
                source,
                target,
                path: TranscodePath::Passthrough,
            });
        }

        if source.sample_rate != target.sample_rate {
            return Err(CodecError::UnsupportedConversion {
                from: source,
                to: target,
            });
        }

        let path = match (source.encoding.is_linear(), target.encoding.is_linear()) {
            (false, true) => TranscodePath::Decode(self.get(source.encoding)?),
            (true, false) => TranscodePath::Encode(self.get(target.encoding)?),
            (false, false) => TranscodePath::Bridge {
                decoder: self.get(source.encoding)?,
                encoder: self.get(target.encoding)?,
            },
            (true, true) => {
                return Err(CodecError::UnsupportedConversion {
                    from: source,
                    to: target,
                })
            }
        };

        Ok(Transcoder {
            source,
            target,
            path,
        })
    }
}

impl Default for CodecRegistry {
    /// Registry with both G.711 laws.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(G711Codec::new(G711Law::Mulaw)));
        registry.register(Arc::new(G711Codec::new(G711Law::Alaw)));
        registry
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("encodings", &self.encodings())
            .finish()
    }
}

enum TranscodePath {
    Passthrough,
    Decode(Arc<dyn Codec>),
    Encode(Arc<dyn Codec>),
    Bridge {
        decoder: Arc<dyn Codec>,
        encoder: Arc<dyn Codec>,
    },
}

/// Conversion for one direction of a call, fixed at negotiation.
pub struct Transcoder {
    source: AudioFormat,
    target: AudioFormat,
    path: TranscodePath,
}

impl Transcoder {
    pub fn is_passthrough(&self) -> bool {
        matches!(self.path, TranscodePath::Passthrough)
    }

    /// Convert one frame. Passthrough hands the same frame back untouched.
    pub fn apply(&self, frame: AudioFrame) -> Result<AudioFrame, CodecError> {
        if frame.format() != self.source {
            return Err(CodecError::FormatMismatch {
                expected: self.source,
                actual: frame.format(),
            });
        }

        match &self.path {
            TranscodePath::Passthrough => Ok(frame),
            TranscodePath::Decode(codec) => codec.decode(&frame, self.source),
            TranscodePath::Encode(codec) => codec.encode(&frame, self.target),
            TranscodePath::Bridge { decoder, encoder } => {
                let linear = decoder.decode(&frame, self.source)?;
                encoder.encode(&linear, self.target)
            }
        }
    }
}

impl fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transcoder")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("passthrough", &self.is_passthrough())
            .finish()
    }
}
