use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

const NODE_KEY_FILE: &str = "node.key";
const NODE_PUB_FILE: &str = "node.pub";
const SWARM_KEY_FILE: &str = "swarm.key";

/// Bytes in the symmetric swarm secret.
pub const SWARM_KEY_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("persisted identity material at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("identity storage failure at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("key encoding failure: {0}")]
    Encoding(String),
}

/// Long-lived node identity: an ed25519 keypair persisted under the
/// data directory plus the symmetric swarm secret that envelopes every
/// mesh packet.
///
/// A missing key file is generated on first start; a present but
/// unparseable one is fatal. Regenerating silently would change the
/// node's fingerprint and orphan its peers.
pub struct NodeIdentity {
    signing_key: SigningKey,
    swarm_key: [u8; SWARM_KEY_BYTES],
    fingerprint: String,
}

impl NodeIdentity {
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, IdentityError> {
        fs::create_dir_all(data_dir).map_err(|source| IdentityError::Storage {
            path: data_dir.to_path_buf(),
            source,
        })?;

        let signing_key = load_or_generate_keypair(data_dir)?;
        let swarm_key = load_or_generate_swarm_key(data_dir)?;
        let fingerprint = fingerprint_of(&signing_key.verifying_key())?;

        info!(node_id = %fingerprint, "node identity ready");
        Ok(Self {
            signing_key,
            swarm_key,
            fingerprint,
        })
    }

    /// First 16 hex chars of SHA-256 over the SPKI encoding of the
    /// public key. Doubles as the node id on the wire.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn swarm_key(&self) -> &[u8; SWARM_KEY_BYTES] {
        &self.swarm_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_pem(&self) -> Result<String, IdentityError> {
        self.signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| IdentityError::Encoding(err.to_string()))
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("fingerprint", &self.fingerprint)
            .field("swarm_key", &"[REDACTED]")
            .finish()
    }
}

fn fingerprint_of(key: &VerifyingKey) -> Result<String, IdentityError> {
    let spki = key
        .to_public_key_der()
        .map_err(|err| IdentityError::Encoding(err.to_string()))?;
    let digest = Sha256::digest(spki.as_bytes());
    Ok(hex::encode(&digest[..8]))
}

fn load_or_generate_keypair(data_dir: &Path) -> Result<SigningKey, IdentityError> {
    let key_path = data_dir.join(NODE_KEY_FILE);
    if key_path.exists() {
        let pem = fs::read_to_string(&key_path).map_err(|source| IdentityError::Storage {
            path: key_path.clone(),
            source,
        })?;
        return SigningKey::from_pkcs8_pem(&pem).map_err(|err| IdentityError::Corrupt {
            path: key_path,
            reason: err.to_string(),
        });
    }

    let signing_key = SigningKey::generate(&mut OsRng);
    let private_pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|err| IdentityError::Encoding(err.to_string()))?;
    write_secret(&key_path, private_pem.as_bytes())?;

    let public_pem = signing_key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|err| IdentityError::Encoding(err.to_string()))?;
    write_secret(&data_dir.join(NODE_PUB_FILE), public_pem.as_bytes())?;

    info!(path = %key_path.display(), "generated node keypair");
    Ok(signing_key)
}

fn load_or_generate_swarm_key(data_dir: &Path) -> Result<[u8; SWARM_KEY_BYTES], IdentityError> {
    let swarm_path = data_dir.join(SWARM_KEY_FILE);
    if swarm_path.exists() {
        let armoured = fs::read_to_string(&swarm_path).map_err(|source| IdentityError::Storage {
            path: swarm_path.clone(),
            source,
        })?;
        let bytes = URL_SAFE
            .decode(armoured.trim())
            .map_err(|err| IdentityError::Corrupt {
                path: swarm_path.clone(),
                reason: err.to_string(),
            })?;
        return bytes.try_into().map_err(|_| IdentityError::Corrupt {
            path: swarm_path,
            reason: format!("expected {SWARM_KEY_BYTES} key bytes"),
        });
    }

    let mut key = [0u8; SWARM_KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    write_secret(&swarm_path, URL_SAFE.encode(key).as_bytes())?;
    info!(path = %swarm_path.display(), "generated swarm key");
    Ok(key)
}

/// Write key material with owner-only permissions.
fn write_secret(path: &Path, contents: &[u8]) -> Result<(), IdentityError> {
    let storage = |source| IdentityError::Storage {
        path: path.to_path_buf(),
        source,
    };
    fs::write(path, contents).map_err(storage)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(storage)?;
    }
    Ok(())
}
