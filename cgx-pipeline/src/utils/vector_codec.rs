//! Binary vector encoding
//!
//! Vectors are stored as packed little-endian `f32` with no header; readers
//! must know the dimensionality out of band (it is recorded on the solution).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("vector blob is {len} bytes, expected {expected} for dimension {dim}")]
pub struct VectorCodecError {
    pub len: usize,
    pub dim: usize,
    pub expected: usize,
}

pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a blob holding exactly `dim` values
pub fn decode_vector(bytes: &[u8], dim: usize) -> Result<Vec<f32>, VectorCodecError> {
    let expected = dim * 4;
    if bytes.len() != expected {
        return Err(VectorCodecError {
            len: bytes.len(),
            dim,
            expected,
        });
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_tolerance() {
        let original = vec![0.0f32, -1.5, 3.25e-7, 1234.5678, f32::MIN_POSITIVE];
        let decoded = decode_vector(&encode_vector(&original), original.len()).unwrap();

        for (a, b) in original.iter().zip(&decoded) {
            assert!((a - b).abs() <= 1e-6, "{} != {}", a, b);
        }
    }

    #[test]
    fn test_little_endian_layout() {
        assert_eq!(encode_vector(&[1.0]), vec![0x00, 0x00, 0x80, 0x3f]);
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        let err = decode_vector(&[0u8; 10], 3).unwrap_err();
        assert_eq!(err.expected, 12);
        assert_eq!(err.len, 10);
    }
}
