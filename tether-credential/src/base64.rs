//! RFC 4648 base64 codec, no embedded line breaks.
//!
//! Thin wrapper over the `base64` crate's standard engine: encode always
//! pads to a 4-character boundary and never inserts whitespace; decode is
//! strict about the alphabet but tolerant of trailing `=`.

use crate::error::Error;
use base64::engine::general_purpose::{GeneralPurposeConfig, STANDARD};
use base64::engine::{DecodePaddingMode, GeneralPurpose};
use base64::Engine;

/// Decode engine sharing the standard alphabet with `STANDARD` but
/// indifferent to whether padding is present. `STANDARD`'s decoder
/// requires canonical padding, so trimming trailing `=` (as the spec's
/// "ignore trailing `=`" calls for) would otherwise make it reject
/// well-formed input whose length needed padding.
const DECODE: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Encode `data` as standard (RFC 4648 §4) base64 with `=` padding.
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode standard base64 text. Characters outside the alphabet (other
/// than padding) produce `Error::InvalidArgument`; trailing `=` is
/// tolerated whether present, partial, or absent.
pub fn decode(text: &str) -> Result<Vec<u8>, Error> {
    DECODE
        .decode(text)
        .map_err(|e| Error::InvalidArgument(format!("invalid base64 encoding: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_arbitrary_bytes() {
        for len in 0..64 {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let encoded = encode(&data);
            assert!(!encoded.contains('\n') && !encoded.contains('\r'));
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn encode_pads_to_four_char_boundary() {
        assert_eq!(encode(b"hello world\0").len() % 4, 0);
    }

    #[test]
    fn decode_rejects_invalid_alphabet() {
        assert!(decode("not valid base64!!").is_err());
    }

    #[test]
    fn decode_tolerates_trailing_padding() {
        let encoded = encode(b"hi");
        assert!(encoded.ends_with('='));
        assert_eq!(decode(&encoded).unwrap(), b"hi");
    }

    #[test]
    fn decode_also_accepts_padding_stripped_manually() {
        let encoded = encode(b"hi");
        let stripped = encoded.trim_end_matches('=');
        assert_eq!(decode(stripped).unwrap(), b"hi");
    }
}
