//! Wire vectors for the operation encoding.
//!
//! Other implementations talking to Trellis devices must produce and accept
//! these exact bytes: CBOR, externally tagged by variant name, fields in
//! declaration order.

use serde_json::json;
use trellis_core::{DeviceKey, GroupId, ObjectKey};
use trellis_sync::Operation;

/// A known operation and its expected encoding.
#[derive(Debug, Clone)]
pub struct WireVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    pub operation: Operation,
    /// Expected CBOR encoding (hex).
    pub expected_hex: &'static str,
}

fn notes_key() -> ObjectKey {
    ObjectKey::from_raw("__data/notes/1/")
}

/// Get all wire vectors.
pub fn all_vectors() -> Vec<WireVector> {
    vec![
        WireVector {
            name: "DeleteGroup",
            operation: Operation::DeleteGroup {
                group: GroupId::new("g1"),
            },
            expected_hex: "a16b44656c65746547726f7570a16567726f7570626731",
        },
        WireVector {
            name: "AddChild",
            operation: Operation::AddChild {
                group: GroupId::new("g1"),
                child: GroupId::new("g2"),
            },
            expected_hex: "a1684164644368696c64a26567726f7570626731656368696c64626732",
        },
        WireVector {
            name: "DeleteData",
            operation: Operation::DeleteData { key: notes_key() },
            expected_hex: "a16a44656c65746544617461a1636b65796f5f5f646174612f6e6f7465732f312f",
        },
        WireVector {
            name: "DeleteDevice",
            operation: Operation::DeleteDevice {
                device: DeviceKey::from_bytes([7; 32]),
            },
            expected_hex: concat!(
                "a16c44656c657465446576696365a166646576696365",
                "9820",
                "0707070707070707070707070707070707070707070707070707070707070707"
            ),
        },
        WireVector {
            name: "UpdateData without triple",
            operation: Operation::UpdateData {
                key: notes_key(),
                value: json!({"text": "hi"}),
                permissions: None,
            },
            expected_hex: concat!(
                "a16a55706461746544617461a3",
                "636b65796f5f5f646174612f6e6f7465732f312f",
                "6576616c7565a164746578746268696b",
                "7065726d697373696f6e73f6"
            ),
        },
    ]
}

/// Check every vector, returning the names of those that fail.
pub fn verify_all_vectors() -> Vec<&'static str> {
    all_vectors()
        .into_iter()
        .filter(|v| {
            let encoded = v.operation.to_bytes().map(hex::encode).ok();
            let decoded = hex::decode(v.expected_hex)
                .ok()
                .and_then(|bytes| Operation::from_bytes(&bytes).ok());
            encoded.as_deref() != Some(v.expected_hex) || decoded.as_ref() != Some(&v.operation)
        })
        .map(|v| v.name)
        .collect()
}
