// =============================================================================
// Conflux Matrix Sync Engine - Utilities
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Byte-level helpers shared by the key-value storage layer: big-endian
//   counters, 0xff-separated composite keys and value decoding.
//
// =============================================================================

pub mod error;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

/// Increments a big-endian encoded u64 counter, starting at 1 when no
/// previous value exists. Zero is reserved to mean "before anything".
pub fn increment(old: Option<&[u8]>) -> Vec<u8> {
    let number = match old.map(TryInto::try_into) {
        Some(Ok(bytes)) => {
            let number = u64::from_be_bytes(bytes);
            number.wrapping_add(1)
        }
        _ => 1,
    };

    number.to_be_bytes().to_vec()
}

pub fn u64_from_bytes(bytes: &[u8]) -> std::result::Result<u64, std::array::TryFromSliceError> {
    let array: [u8; 8] = bytes.try_into()?;
    Ok(u64::from_be_bytes(array))
}

pub fn string_from_bytes(bytes: &[u8]) -> std::result::Result<String, std::string::FromUtf8Error> {
    String::from_utf8(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_starts_at_one() {
        assert_eq!(increment(None), 1u64.to_be_bytes().to_vec());
    }

    #[test]
    fn increment_advances() {
        let first = increment(None);
        let second = increment(Some(&first));
        assert_eq!(u64_from_bytes(&second).unwrap(), 2);
    }

    #[test]
    fn u64_from_bytes_rejects_bad_length() {
        assert!(u64_from_bytes(&[1, 2, 3]).is_err());
    }
}
