use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{Map, Value};
use tracing::trace;

use crate::identity::SWARM_KEY_BYTES;

/// Wire version of the swarm envelope.
pub const ENVELOPE_VERSION: u8 = 1;
/// AES-GCM nonce length.
const NONCE_LEN: usize = 12;
/// Accepted clock skew between sender and receiver, seconds.
pub const DEFAULT_MAX_SKEW_SECONDS: i64 = 300;
/// Domain separator bound into the AAD so swarm ciphertext cannot be
/// replayed into another protocol using the same key.
const AAD_DOMAIN: &[u8] = b"HYDRA_SWARM_AAD:v1";

/// Authenticated symmetric envelope around every mesh datagram.
///
/// Layout: `version(1) | timestamp_be(8) | nonce(12) | ciphertext`.
/// Version and timestamp ride in the clear but are bound as AAD, so a
/// successful open implies integrity, confidentiality, and freshness
/// within the skew window. `open` answers `None` on any failure - the
/// caller can never distinguish tampering from noise, by contract.
pub struct SwarmEnvelope {
    cipher: Aes256Gcm,
    max_skew_seconds: i64,
}

impl SwarmEnvelope {
    pub fn new(key: &[u8; SWARM_KEY_BYTES]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
            max_skew_seconds: DEFAULT_MAX_SKEW_SECONDS,
        }
    }

    #[cfg(test)]
    fn with_max_skew(key: &[u8; SWARM_KEY_BYTES], max_skew_seconds: i64) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
            max_skew_seconds,
        }
    }

    /// Serialise the map to canonical JSON and seal it.
    pub fn seal(&self, payload: &Map<String, Value>) -> Vec<u8> {
        self.seal_at(payload, Utc::now().timestamp())
    }

    fn seal_at(&self, payload: &Map<String, Value>, timestamp: i64) -> Vec<u8> {
        let plaintext = serde_json::to_vec(payload).expect("json maps serialize");

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let aad = build_aad(timestamp);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .expect("AES-GCM encryption over in-memory buffers cannot fail");

        let mut wire = Vec::with_capacity(1 + 8 + NONCE_LEN + ciphertext.len());
        wire.push(ENVELOPE_VERSION);
        wire.extend_from_slice(&timestamp.to_be_bytes());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        wire
    }

    /// Open a sealed datagram. `None` on any authentication, parse, or
    /// freshness failure.
    pub fn open(&self, wire: &[u8]) -> Option<Map<String, Value>> {
        self.open_at(wire, Utc::now().timestamp())
    }

    fn open_at(&self, wire: &[u8], now: i64) -> Option<Map<String, Value>> {
        if wire.len() < 1 + 8 + NONCE_LEN {
            return None;
        }
        if wire[0] != ENVELOPE_VERSION {
            trace!(version = wire[0], "unknown envelope version");
            return None;
        }

        let timestamp = i64::from_be_bytes(wire[1..9].try_into().ok()?);
        if (now - timestamp).abs() > self.max_skew_seconds {
            trace!(timestamp, now, "stale envelope");
            return None;
        }

        let nonce = &wire[9..9 + NONCE_LEN];
        let ciphertext = &wire[9 + NONCE_LEN..];
        let aad = build_aad(timestamp);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .ok()?;

        match serde_json::from_slice(&plaintext) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

fn build_aad(timestamp: i64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_DOMAIN.len() + 9);
    aad.extend_from_slice(AAD_DOMAIN);
    aad.push(ENVELOPE_VERSION);
    aad.extend_from_slice(&timestamp.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; SWARM_KEY_BYTES] = *b"swarm key material for the mesh!";

    fn payload() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("op".to_string(), Value::String("PING".to_string()));
        map.insert("src".to_string(), Value::String("abc123".to_string()));
        map
    }

    #[test]
    fn seal_then_open_roundtrips() {
        let envelope = SwarmEnvelope::new(&KEY);
        let opened = envelope.open(&envelope.seal(&payload())).unwrap();
        assert_eq!(opened["op"], "PING");
        assert_eq!(opened["src"], "abc123");
    }

    #[test]
    fn tampered_ciphertext_opens_to_none() {
        let envelope = SwarmEnvelope::new(&KEY);
        let mut wire = envelope.seal(&payload());
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(envelope.open(&wire).is_none());
    }

    #[test]
    fn wrong_key_opens_to_none() {
        let sealer = SwarmEnvelope::new(&KEY);
        let other = SwarmEnvelope::new(b"a completely different swarm key");
        assert!(other.open(&sealer.seal(&payload())).is_none());
    }

    #[test]
    fn stale_timestamp_opens_to_none() {
        let envelope = SwarmEnvelope::with_max_skew(&KEY, 60);
        let now = Utc::now().timestamp();
        let wire = envelope.seal_at(&payload(), now - 3600);
        assert!(envelope.open_at(&wire, now).is_none());
        // Tampering with the cleartext timestamp breaks the AAD binding
        // instead of refreshing the packet.
        let mut rewound = envelope.seal_at(&payload(), now - 3600);
        rewound[1..9].copy_from_slice(&now.to_be_bytes());
        assert!(envelope.open_at(&rewound, now).is_none());
    }

    #[test]
    fn truncated_and_garbage_input_open_to_none() {
        let envelope = SwarmEnvelope::new(&KEY);
        assert!(envelope.open(&[]).is_none());
        assert!(envelope.open(&[1, 2, 3]).is_none());
        assert!(envelope.open(&vec![0u8; 64]).is_none());
    }
}
