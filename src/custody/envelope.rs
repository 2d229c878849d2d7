//! Wrapped key envelope
//!
//! The envelope is what a caller keeps next to its ciphertext. It names the
//! master key version that wrapped the key so unwrap keeps working after
//! rotation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use super::crypto::{AUTH_TAG_LEN, NONCE_LEN};
use crate::types::{CustodyError, Result};

/// A data-encryption key wrapped under one master key version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyEnvelope {
    /// Encrypted key bytes (base64), without the tag
    pub ciphertext: String,

    /// Per-call AEAD nonce (base64, 12 bytes)
    pub nonce: String,

    /// Authentication tag (base64, 16 bytes)
    pub tag: String,

    /// Master key version used to wrap
    pub key_version: u32,

    /// Algorithm identifier
    pub algorithm: String,
}

impl WrappedKeyEnvelope {
    /// Build an envelope from sealed output (ciphertext with appended tag).
    pub(crate) fn from_sealed(
        sealed: &[u8],
        nonce: &[u8; NONCE_LEN],
        key_version: u32,
        algorithm: &str,
    ) -> Result<Self> {
        if sealed.len() < AUTH_TAG_LEN {
            return Err(CustodyError::Internal(
                "Sealed output shorter than auth tag".into(),
            ));
        }
        let (ciphertext, tag) = sealed.split_at(sealed.len() - AUTH_TAG_LEN);

        Ok(Self {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
            tag: BASE64.encode(tag),
            key_version,
            algorithm: algorithm.to_string(),
        })
    }

    /// Decode into (ciphertext with appended tag, nonce).
    pub(crate) fn decode_sealed(&self) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
        let mut sealed = BASE64
            .decode(&self.ciphertext)
            .map_err(|e| CustodyError::MalformedEnvelope(format!("ciphertext: {e}")))?;

        let tag = BASE64
            .decode(&self.tag)
            .map_err(|e| CustodyError::MalformedEnvelope(format!("tag: {e}")))?;
        if tag.len() != AUTH_TAG_LEN {
            return Err(CustodyError::MalformedEnvelope(format!(
                "tag must be {} bytes, got {}",
                AUTH_TAG_LEN,
                tag.len()
            )));
        }

        let nonce: [u8; NONCE_LEN] = BASE64
            .decode(&self.nonce)
            .map_err(|e| CustodyError::MalformedEnvelope(format!("nonce: {e}")))?
            .try_into()
            .map_err(|_| CustodyError::MalformedEnvelope("nonce must be 12 bytes".into()))?;

        sealed.extend_from_slice(&tag);
        Ok((sealed, nonce))
    }
}

/// Associated data binding a wrapped key to its version and algorithm.
pub(crate) fn associated_data(key_version: u32, algorithm: &str) -> Vec<u8> {
    format!("kacls:wrap:v{key_version}:{algorithm}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_sealed_splits_tag() {
        let sealed = [7u8; 48];
        let nonce = [1u8; NONCE_LEN];
        let envelope = WrappedKeyEnvelope::from_sealed(&sealed, &nonce, 3, "X").unwrap();

        assert_eq!(BASE64.decode(&envelope.ciphertext).unwrap().len(), 32);
        assert_eq!(BASE64.decode(&envelope.tag).unwrap().len(), AUTH_TAG_LEN);
        assert_eq!(envelope.key_version, 3);

        let (decoded, decoded_nonce) = envelope.decode_sealed().unwrap();
        assert_eq!(decoded, sealed.to_vec());
        assert_eq!(decoded_nonce, nonce);
    }

    #[test]
    fn test_short_nonce_is_malformed() {
        let envelope = WrappedKeyEnvelope {
            ciphertext: BASE64.encode([0u8; 32]),
            nonce: BASE64.encode([0u8; 8]),
            tag: BASE64.encode([0u8; AUTH_TAG_LEN]),
            key_version: 1,
            algorithm: "X".into(),
        };
        assert!(matches!(
            envelope.decode_sealed(),
            Err(CustodyError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_serializes_camel_case() {
        let envelope = WrappedKeyEnvelope {
            ciphertext: "c".into(),
            nonce: "n".into(),
            tag: "t".into(),
            key_version: 2,
            algorithm: "a".into(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"keyVersion\":2"));
    }
}
