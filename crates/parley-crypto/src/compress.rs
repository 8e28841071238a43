use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;

use parley_core::error::ParleyError;

/// Payload compression codec. Gzip outputs are base64-wrapped whenever they
/// land in a string-typed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    None,
    Gzip,
}

impl Codec {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Codec::None),
            "gzip" => Some(Codec::Gzip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Gzip => "gzip",
        }
    }
}

/// Compress `data` with the codec. `None` is the identity.
pub fn compress(data: &[u8], codec: Codec) -> Result<Vec<u8>, ParleyError> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| ParleyError::Internal(format!("gzip: {e}")))
        }
    }
}

/// Decompress `data` with the codec.
pub fn decompress(data: &[u8], codec: Codec) -> Result<Vec<u8>, ParleyError> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ParleyError::StreamParse(format!("gunzip: {e}")))?;
            Ok(out)
        }
    }
}

/// Compress and base64-wrap for embedding in a string field. `None` passes
/// UTF-8 through untouched.
pub fn compress_to_string(data: &[u8], codec: Codec) -> Result<String, ParleyError> {
    match codec {
        Codec::None => String::from_utf8(data.to_vec())
            .map_err(|e| ParleyError::Serialization(format!("non-utf8 payload: {e}"))),
        Codec::Gzip => Ok(BASE64.encode(compress(data, Codec::Gzip)?)),
    }
}

/// Inverse of `compress_to_string`.
pub fn decompress_from_string(s: &str, codec: Codec) -> Result<Vec<u8>, ParleyError> {
    match codec {
        Codec::None => Ok(s.as_bytes().to_vec()),
        Codec::Gzip => {
            let raw = BASE64
                .decode(s.trim())
                .map_err(|e| ParleyError::StreamParse(format!("base64: {e}")))?;
            decompress(&raw, Codec::Gzip)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let packed = compress(&data, Codec::Gzip).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, Codec::Gzip).unwrap(), data);
    }

    #[test]
    fn none_is_identity() {
        let data = b"hello";
        assert_eq!(compress(data, Codec::None).unwrap(), data);
        assert_eq!(decompress(data, Codec::None).unwrap(), data);
    }

    #[test]
    fn string_wrapping_round_trip() {
        let data = "bonjour le monde".as_bytes();
        let s = compress_to_string(data, Codec::Gzip).unwrap();
        assert_eq!(decompress_from_string(&s, Codec::Gzip).unwrap(), data);

        let s = compress_to_string(data, Codec::None).unwrap();
        assert_eq!(s, "bonjour le monde");
    }

    #[test]
    fn corrupt_gzip_is_a_stream_error() {
        let err = decompress(b"definitely not gzip", Codec::Gzip).unwrap_err();
        assert_eq!(err.kind(), "stream");
    }
}
