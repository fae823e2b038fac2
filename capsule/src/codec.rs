use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::manifest::{CapabilityKind, CapabilityManifest};

/// How many hex chars of the SHA-256 digest form the content address.
pub const HASH_PREFIX_LEN: usize = 16;

/// Compressed, armoured capability source together with its content
/// address and uncompressed size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Genome {
    pub armoured: String,
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("genome is not valid base64: {0}")]
    Armour(#[from] base64::DecodeError),
    #[error("genome failed to decompress: {0}")]
    Inflate(#[from] std::io::Error),
    #[error("genome is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Content address of an uncompressed source: first 64 bits of SHA-256,
/// rendered as 16 lowercase hex chars.
pub fn genome_hash(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    hex::encode(&digest[..HASH_PREFIX_LEN / 2])
}

/// Compress a source into its wire form. The result is ASCII-safe.
pub fn compress(source: &str) -> Genome {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(source.as_bytes())
        .expect("writing to an in-memory encoder cannot fail");
    let compressed = encoder
        .finish()
        .expect("finishing an in-memory encoder cannot fail");

    Genome {
        armoured: STANDARD.encode(compressed),
        hash: genome_hash(source),
        size: source.len() as u64,
    }
}

/// Recover the original source from its armoured form.
pub fn decompress(armoured: &str) -> Result<String, CodecError> {
    let compressed = STANDARD.decode(armoured.trim())?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut source = Vec::new();
    decoder.read_to_end(&mut source)?;
    Ok(String::from_utf8(source)?)
}

/// Decompress and compare against an expected content address. Any
/// failure along the way reads as a mismatch rather than an error.
pub fn verify(armoured: &str, expected_hash: &str) -> bool {
    match decompress(armoured) {
        Ok(source) => genome_hash(&source) == expected_hash,
        Err(_) => false,
    }
}

/// Pure manifest builder: computes the genome, hash, and size from the
/// source and fills defaults for everything the caller left out.
#[allow(clippy::too_many_arguments)]
pub fn build_manifest(
    id: &str,
    name: &str,
    kind: CapabilityKind,
    source: &str,
    dependencies: Vec<String>,
    provides: Vec<String>,
    exports: Vec<String>,
    description: &str,
) -> CapabilityManifest {
    let genome = compress(source);
    let mut provides = provides;
    if !provides.iter().any(|p| p == id) {
        provides.push(id.to_string());
    }

    CapabilityManifest {
        id: id.to_string(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
        description: description.to_string(),
        author: String::new(),
        kind,
        dependencies,
        provides,
        genome: genome.armoured,
        genome_hash: genome.hash,
        genome_size: genome.size,
        priority: kind.default_priority(),
        hot_swappable: true,
        entry_point: None,
        exports,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn roundtrip_preserves_source() {
        let source = "threshold = 3\nlabel = \"hydra\"\n";
        let genome = compress(source);
        assert!(genome.armoured.is_ascii());
        assert_eq!(decompress(&genome.armoured).unwrap(), source);
        assert_eq!(genome.size, source.len() as u64);
    }

    #[test]
    fn hash_is_sha256_prefix() {
        let source = "X = 1";
        let expected = hex::encode(&Sha256::digest(source.as_bytes())[..8]);
        assert_eq!(genome_hash(source), expected);
        assert_eq!(genome_hash(source).len(), 16);
    }

    #[test]
    fn verify_accepts_matching_hash() {
        let genome = compress("payload");
        assert!(verify(&genome.armoured, &genome.hash));
    }

    #[test]
    fn verify_rejects_wrong_hash_without_raising() {
        let genome = compress("payload");
        assert!(!verify(&genome.armoured, "0000000000000000"));
        assert!(!verify("!!not base64!!", &genome.hash));
        assert!(!verify("AAAA", &genome.hash));
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(matches!(decompress("%%%"), Err(CodecError::Armour(_))));
        // Valid base64, not valid zlib.
        assert!(matches!(
            decompress(&STANDARD.encode(b"plain bytes")),
            Err(CodecError::Inflate(_))
        ));
    }

    #[test]
    fn builder_fills_hash_size_and_self_provide() {
        let manifest = build_manifest(
            "plugin.x",
            "x",
            CapabilityKind::Plugin,
            "X = 1",
            vec![],
            vec![],
            vec!["X".to_string()],
            "",
        );
        manifest.validate().expect("built manifest validates");
        assert_eq!(manifest.genome_hash, genome_hash("X = 1"));
        assert_eq!(manifest.genome_size, 5);
        assert!(manifest.provides.contains(&"plugin.x".to_string()));
        assert_eq!(manifest.priority, CapabilityKind::Plugin.default_priority());
    }
}
