use crate::error::Result;
use crate::ring::Ring;
use sha2::{Digest, Sha256};

/// Places an identifier (a node address or a user key) on a ring of `2^bits` positions.
pub fn ring_id(identifier: &str, bits: u32) -> Result<u64> {
    let ring = Ring::new(bits)?;
    let hash = generate_hash64(identifier.as_bytes())?;

    Ok(ring.wrap(hash))
}

pub fn generate_hash64(input: &[u8]) -> Result<u64> {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let hash = hasher.finalize();
    let hash_bytes = &hash[..8];
    let hash_array: [u8; 8] = hash_bytes.try_into()?;
    let output = u64::from_be_bytes(hash_array);

    Ok(output)
}

#[test]
fn test_generate_hash64() -> Result<()> {
    let key = "key".to_owned();
    let hash = generate_hash64(key.as_bytes())?;
    let hash_retry = generate_hash64(key.as_bytes())?;

    assert_eq!(hash, hash_retry);
    Ok(())
}

#[test]
fn test_ring_id_stays_on_ring() -> Result<()> {
    for bits in [1, 8, 16, 63] {
        let id = ring_id("10.0.0.7:50051", bits)?;
        assert!(id < 1u64 << bits);
        assert_eq!(id, ring_id("10.0.0.7:50051", bits)?);
    }
    Ok(())
}

#[test]
fn test_ring_id_rejects_bad_width() {
    assert!(ring_id("key", 0).is_err());
    assert!(ring_id("key", 64).is_err());
}
