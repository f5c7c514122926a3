//! Persistence format for sequencer state.
//!
//! The file is JSON with a prominent warning and a SHA-256 checksum over the
//! sequence list. Hand edits break the checksum and the file is refused on
//! load.
//!
//! ```json
//! {
//!   "warning": "SECURITY CRITICAL ...",
//!   "version": 1,
//!   "checksum": "<sha256 hex>",
//!   "sequences": [ { "id": "...", "authId": "...", "nextNonce": "AAAAAAAAAAE=", ... } ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, VaultError};
use crate::sequencer::{NonceSequence, SequenceMap};

const WARNING: &str = "SECURITY CRITICAL: nonce sequence state. Do not edit, copy or restore \
this file from a backup; doing so can cause nonce reuse and expose encrypted data.";

const FORMAT_VERSION: u32 = 1;

/// Converts sequencer state to and from text.
pub trait SequenceSerializer: Send + Sync {
    fn serialize(&self, sequences: &SequenceMap) -> Result<String>;

    fn deserialize(&self, contents: &str) -> Result<SequenceMap>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SequenceDocument {
    warning: String,
    version: u32,
    checksum: String,
    sequences: Vec<NonceSequence>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSequenceSerializer;

fn checksum(sequences: &[NonceSequence]) -> Result<String> {
    let body = serde_json::to_vec(sequences)
        .map_err(|e| VaultError::sequence(format!("serializing sequences: {e}")))?;
    Ok(hex::encode(Sha256::digest(&body)))
}

impl SequenceSerializer for JsonSequenceSerializer {
    fn serialize(&self, sequences: &SequenceMap) -> Result<String> {
        let sequences: Vec<NonceSequence> = sequences.values().cloned().collect();
        let document = SequenceDocument {
            warning: WARNING.to_string(),
            version: FORMAT_VERSION,
            checksum: checksum(&sequences)?,
            sequences,
        };
        serde_json::to_string_pretty(&document)
            .map_err(|e| VaultError::sequence(format!("serializing sequences: {e}")))
    }

    fn deserialize(&self, contents: &str) -> Result<SequenceMap> {
        if contents.trim().is_empty() {
            return Ok(SequenceMap::new());
        }
        let document: SequenceDocument = serde_json::from_str(contents)
            .map_err(|e| VaultError::sequence(format!("malformed sequence file: {e}")))?;
        if document.version != FORMAT_VERSION {
            return Err(VaultError::sequence(format!(
                "unsupported sequence file version {}",
                document.version
            )));
        }
        if checksum(&document.sequences)? != document.checksum {
            return Err(VaultError::sequence(
                "sequence file checksum mismatch, the file was modified outside vaultfs",
            ));
        }

        let mut map = SequenceMap::new();
        for sequence in document.sequences {
            if map.insert(sequence.key(), sequence).is_some() {
                return Err(VaultError::sequence("duplicate entries in sequence file"));
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::Nonce;
    use crate::sequencer::SequenceStatus;
    use proptest::prelude::*;

    fn sequence(id: &str, auth: &str, status: SequenceStatus, next: Option<u64>, max: Option<u64>) -> NonceSequence {
        NonceSequence {
            id: id.to_string(),
            auth_id: auth.to_string(),
            next_nonce: next.map(Nonce::from_u64),
            max_nonce: max.map(Nonce::from_u64),
            status,
        }
    }

    #[test]
    fn document_is_marked_security_critical() {
        let mut map = SequenceMap::new();
        let s = sequence("aa", "bb", SequenceStatus::Active, Some(1), Some(9));
        map.insert(s.key(), s);
        let text = JsonSequenceSerializer.serialize(&map).unwrap();
        assert!(text.contains("SECURITY CRITICAL"));
        assert!(text.contains("\"nextNonce\": \"AAAAAAAAAAE=\""));
    }

    #[test]
    fn edited_file_is_rejected() {
        let mut map = SequenceMap::new();
        let s = sequence("aa", "bb", SequenceStatus::Active, Some(1), Some(9));
        map.insert(s.key(), s);
        let text = JsonSequenceSerializer.serialize(&map).unwrap();
        let edited = text.replace("\"Active\"", "\"New\"");
        let err = JsonSequenceSerializer.deserialize(&edited).unwrap_err();
        assert!(matches!(err, VaultError::Sequence(_)));
    }

    #[test]
    fn empty_file_is_empty_map() {
        assert!(JsonSequenceSerializer.deserialize("  \n").unwrap().is_empty());
    }

    fn status() -> impl Strategy<Value = SequenceStatus> {
        prop_oneof![
            Just(SequenceStatus::New),
            Just(SequenceStatus::Active),
            Just(SequenceStatus::Revoked),
        ]
    }

    proptest! {
        #[test]
        fn roundtrip(entries in prop::collection::vec(
            ("[0-9a-f]{32}", "[0-9a-f]{32}", status(), any::<Option<u64>>(), any::<Option<u64>>()),
            1..8,
        )) {
            let mut map = SequenceMap::new();
            for (id, auth, status, next, max) in entries {
                let s = sequence(&id, &auth, status, next, max);
                map.insert(s.key(), s);
            }
            let text = JsonSequenceSerializer.serialize(&map).unwrap();
            prop_assert_eq!(JsonSequenceSerializer.deserialize(&text).unwrap(), map);
        }
    }
}
