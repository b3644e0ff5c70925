//! CBOR encoding helpers.
//!
//! Every persisted record and every wire message goes through these two
//! functions so the encoding stays in one place.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CoreError;

/// Serialize a value to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CoreError> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Group;
    use crate::types::GroupId;

    #[test]
    fn test_group_survives_cbor() {
        let group = Group::composite(
            GroupId::new("g1"),
            "friends",
            [GroupId::new("a"), GroupId::new("b")],
        );
        let bytes = to_cbor(&group).unwrap();
        let decoded: Group = from_cbor(&bytes).unwrap();
        assert_eq!(group, decoded);
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let result: Result<Group, _> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CoreError::DecodingError(_))));
    }
}
