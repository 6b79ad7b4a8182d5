use data_encoding::BASE64;
use sha1::{Digest, Sha1};

/// Derives the identifier for a canonically serialized value.
///
/// Identifiers are the standard-alphabet base64 (with padding) of the SHA-1
/// of the bytes. Document ids hash the encoded document; reference and node
/// ids hash the signer's PEM public key, so they are stable across updates.
pub fn digest(bytes: &[u8]) -> String {
    BASE64.encode(Sha1::digest(bytes).as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_fixed_vector() {
        // sha1("hello") = aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d
        assert_eq!(digest(b"hello"), "qvTGHdzF6KLavt4PO0gs2a6pQ00=");
    }

    #[test]
    fn test_digest_is_stable() {
        let a = digest(b"some bytes");
        let b = digest(b"some bytes");
        assert_eq!(a, b);
        assert_ne!(a, digest(b"other bytes"));
    }
}
