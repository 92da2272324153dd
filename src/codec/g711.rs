//! # G.711 Companding
//!
//! μ-law and A-law conversion between 8-bit companded samples and 16-bit
//! linear PCM, per ITU-T G.711. Both laws are lossy; a round trip through
//! encode/decode lands within half a quantization step of the input.

use super::{pcm, AudioEncoding, AudioFormat, AudioFrame, Codec, CodecError};

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// A-law segment end points, on the input shifted right by 3.
const ALAW_SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

/// Encode one linear sample as μ-law.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };

    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    // Exponent is the position of the highest set bit above bit 7.
    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

/// Expand one μ-law byte to a linear sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode one linear sample as A-law.
pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut value = (sample as i32) >> 3;
    let mask = if value >= 0 {
        0xD5
    } else {
        value = -value - 1;
        0x55
    };

    let segment = ALAW_SEGMENT_END
        .iter()
        .position(|&end| value <= end)
        .unwrap_or(ALAW_SEGMENT_END.len());

    if segment >= ALAW_SEGMENT_END.len() {
        return (0x7F ^ mask) as u8;
    }

    let mut encoded = (segment as i32) << 4;
    if segment < 2 {
        encoded |= (value >> 1) & 0x0F;
    } else {
        encoded |= (value >> segment) & 0x0F;
    }
    (encoded ^ mask) as u8
}

/// Expand one A-law byte to a linear sample.
pub fn alaw_to_linear(byte: u8) -> i16 {
    let byte = (byte ^ 0x55) as i32;
    let mut magnitude = (byte & 0x0F) << 4;
    let segment = (byte & 0x70) >> 4;

    match segment {
        0 => magnitude += 8,
        1 => magnitude += 0x108,
        _ => {
            magnitude += 0x108;
            magnitude <<= segment - 1;
        }
    }

    if byte & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Which G.711 companding law a codec applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Law {
    Mulaw,
    Alaw,
}

/// G.711 codec for one law.
#[derive(Debug, Clone, Copy)]
pub struct G711Codec {
    law: G711Law,
}

impl G711Codec {
    pub fn new(law: G711Law) -> Self {
        Self { law }
    }

    fn compress(&self, sample: i16) -> u8 {
        match self.law {
            G711Law::Mulaw => linear_to_mulaw(sample),
            G711Law::Alaw => linear_to_alaw(sample),
        }
    }

    fn expand(&self, byte: u8) -> i16 {
        match self.law {
            G711Law::Mulaw => mulaw_to_linear(byte),
            G711Law::Alaw => alaw_to_linear(byte),
        }
    }

    fn check_format(&self, format: AudioFormat) -> Result<(), CodecError> {
        if format.encoding != self.encoding() {
            return Err(CodecError::UnsupportedConversion {
                from: format,
                to: AudioFormat::new(self.encoding(), format.sample_rate),
            });
        }
        Ok(())
    }
}

impl Codec for G711Codec {
    fn encoding(&self) -> AudioEncoding {
        match self.law {
            G711Law::Mulaw => AudioEncoding::Mulaw,
            G711Law::Alaw => AudioEncoding::Alaw,
        }
    }

    fn encode(&self, frame: &AudioFrame, target: AudioFormat) -> Result<AudioFrame, CodecError> {
        self.check_format(target)?;
        let expected = target.as_linear();
        if frame.format() != expected {
            return Err(CodecError::FormatMismatch {
                expected,
                actual: frame.format(),
            });
        }

        let samples = pcm::bytes_to_samples(frame.data())?;
        let encoded: Vec<u8> = samples.iter().map(|&s| self.compress(s)).collect();
        Ok(AudioFrame::new(encoded, target))
    }

    fn decode(&self, frame: &AudioFrame, source: AudioFormat) -> Result<AudioFrame, CodecError> {
        self.check_format(source)?;
        if frame.format() != source {
            return Err(CodecError::FormatMismatch {
                expected: source,
                actual: frame.format(),
            });
        }
        if frame.is_empty() {
            return Err(CodecError::MalformedFrame("empty G.711 block".to_string()));
        }

        let samples: Vec<i16> = frame.data().iter().map(|&b| self.expand(b)).collect();
        Ok(AudioFrame::new(pcm::samples_to_bytes(&samples), source.as_linear()))
    }
}
