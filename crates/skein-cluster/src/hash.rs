//! Key hashing for ring lookups and virtual-node placement.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RegistryError;

const FNV_OFFSET_32: u32 = 0x811c_9dc5;
const FNV_PRIME_32: u32 = 0x0100_0193;

/// Algorithm used to hash routing keys onto the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// FNV-1, 32-bit.
    Fnv1,
    /// FNV-1a, 32-bit.
    #[default]
    Fnv1a,
    /// MurmurHash3 x86_32, seed 0.
    Murmur3,
}

impl HashAlgorithm {
    /// Hashes `key`.
    pub fn hash(self, key: &[u8]) -> u32 {
        match self {
            HashAlgorithm::Fnv1 => fnv1_32(key),
            HashAlgorithm::Fnv1a => fnv1a_32(key),
            HashAlgorithm::Murmur3 => murmur3_32(key, 0),
        }
    }

    /// Configuration name.
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Fnv1 => "fnv1",
            HashAlgorithm::Fnv1a => "fnv1a",
            HashAlgorithm::Murmur3 => "murmur3",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fnv1" | "fnv1_32" => Ok(HashAlgorithm::Fnv1),
            "fnv1a" | "fnv1a_32" => Ok(HashAlgorithm::Fnv1a),
            "murmur3" | "murmur" => Ok(HashAlgorithm::Murmur3),
            _ => Err(RegistryError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// FNV-1, 32-bit.
pub fn fnv1_32(key: &[u8]) -> u32 {
    key.iter().fold(FNV_OFFSET_32, |h, &b| {
        h.wrapping_mul(FNV_PRIME_32) ^ u32::from(b)
    })
}

/// FNV-1a, 32-bit.
pub fn fnv1a_32(key: &[u8]) -> u32 {
    key.iter().fold(FNV_OFFSET_32, |h, &b| {
        (h ^ u32::from(b)).wrapping_mul(FNV_PRIME_32)
    })
}

/// MurmurHash3, x86 32-bit variant.
pub fn murmur3_32(key: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mix = |k: u32| k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);

    let mut h = seed;
    let blocks = key.chunks_exact(4);
    let tail = blocks.remainder();
    for block in blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h ^= mix(k);
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    if !tail.is_empty() {
        let k = tail
            .iter()
            .enumerate()
            .fold(0u32, |k, (i, &b)| k | (u32::from(b) << (8 * i)));
        h ^= mix(k);
    }

    h ^= key.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

/// Ring positions for a physical node.
///
/// Digests `"<salt>@<identity>#<counter>"` with SHA-256 for counter = 0, 1, ...
/// and slices each digest into eight little-endian 32-bit words until `count`
/// positions have been produced. Every process derives the same positions.
pub fn vnode_hashes(salt: &str, identity: &str, count: usize) -> Vec<u32> {
    let mut out = Vec::with_capacity(count);
    let mut counter = 0u64;
    while out.len() < count {
        let digest = Sha256::digest(format!("{salt}@{identity}#{counter}").as_bytes());
        out.extend(
            digest
                .chunks_exact(4)
                .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                .take(count - out.len()),
        );
        counter += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_vectors() {
        assert_eq!(fnv1_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1_32(b"a"), 0x050c5d7e);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1_32(b"foobar"), 0x31f0b262);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_murmur3_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e28b7);
        assert_eq!(murmur3_32(b"", 0xffffffff), 0x81f16f39);
        assert_eq!(murmur3_32(&[0, 0, 0, 0], 0), 0x2362f9de);
        assert_eq!(murmur3_32(b"aaaa", 0x9747b28c), 0x5a97808a);
        assert_eq!(murmur3_32(b"Hello, world!", 0x9747b28c), 0x24884cba);
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("FNV1A".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Fnv1a);
        assert_eq!("murmur3".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Murmur3);
        assert!("md5".parse::<HashAlgorithm>().is_err());
        assert_eq!(HashAlgorithm::Fnv1.to_string(), "fnv1");
    }

    #[test]
    fn test_vnode_hashes_deterministic() {
        let a = vnode_hashes("skein", "10.0.0.1:9000.1", 200);
        let b = vnode_hashes("skein", "10.0.0.1:9000.1", 200);
        assert_eq!(a.len(), 200);
        assert_eq!(a, b);
        assert_ne!(a, vnode_hashes("other", "10.0.0.1:9000.1", 200));
    }

    #[test]
    fn test_vnode_hashes_prefix_stable() {
        // fewer vnodes is a prefix of more vnodes
        let few = vnode_hashes("s", "n", 5);
        let many = vnode_hashes("s", "n", 21);
        assert_eq!(&many[..5], &few[..]);
    }

    #[test]
    fn test_vnode_first_word_matches_digest() {
        let digest = Sha256::digest(b"salt@id#0");
        let expected = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        assert_eq!(vnode_hashes("salt", "id", 1), vec![expected]);
    }
}
