//! 16-bit linear PCM sample packing.
//!
//! Linear audio travels as signed 16-bit little-endian samples, the same
//! layout the upstream speech endpoint uses for `pcm16`.

use super::CodecError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Unpack little-endian bytes into samples.
///
/// An odd byte count means the last sample was cut in half, which is reported
/// as a malformed frame rather than silently dropping the trailing byte.
pub fn bytes_to_samples(data: &[u8]) -> Result<Vec<i16>, CodecError> {
    if data.is_empty() {
        return Err(CodecError::MalformedFrame("empty PCM block".to_string()));
    }
    if data.len() % 2 != 0 {
        return Err(CodecError::MalformedFrame(format!(
            "PCM block of {} bytes is not a whole number of 16-bit samples",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Pack samples as little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = out.write_i16::<LittleEndian>(sample);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let bytes = samples_to_bytes(&[1, -2, i16::MAX, i16::MIN]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF, 0xFF, 0x7F, 0x00, 0x80]);
        assert_eq!(bytes_to_samples(&bytes).unwrap(), vec![1, -2, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_truncated_and_empty_blocks() {
        assert!(matches!(bytes_to_samples(&[0x01]), Err(CodecError::MalformedFrame(_))));
        assert!(matches!(bytes_to_samples(&[0x01, 0x02, 0x03]), Err(CodecError::MalformedFrame(_))));
        assert!(matches!(bytes_to_samples(&[]), Err(CodecError::MalformedFrame(_))));
    }
}
