use ethereum_types::H256;
use sha3::{Digest, Keccak256};

/// Computes the keccak-256 hash of the given data.
pub fn keccak(data: impl AsRef<[u8]>) -> H256 {
    H256(Keccak256::new_with_prefix(data).finalize().into())
}

/// Computes the keccak-256 hash of the concatenation of the given parts.
pub fn keccak_concat<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> H256 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    H256(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn keccak_of_empty_input() {
        assert_eq!(
            keccak([]),
            H256(hex!(
                "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
            ))
        );
    }

    #[test]
    fn concat_matches_plain_hash() {
        let joined = keccak(b"hello world");
        let parts = keccak_concat([b"hello ".as_slice(), b"world".as_slice()]);
        assert_eq!(joined, parts);
    }
}
