//! Construction and validation of signed node identity records.

use ceres_proto::{digest, NodeMeta};
use p256::SecretKey;

use crate::crypto;
use crate::error::{NodeError, Result};

/// Derives the stable node id for a PEM public key.
pub fn node_id(public_key_pem: &str) -> String {
    digest(public_key_pem.as_bytes())
}

/// Signs `meta` (with its signature field cleared) and returns the encoded
/// detached signature.
pub(crate) fn sign(meta: &NodeMeta, key: &SecretKey) -> String {
    crypto::encode_signature(&crypto::sign(&meta.signable_bytes(), key))
}

/// Validates a peer-supplied identity record: every required field present,
/// the id matching the public key, and the detached signature verifying
/// under that key. Records failing any check are rejected outright.
pub fn validate(meta: &NodeMeta) -> Result<()> {
    if meta.id.is_empty() {
        return Err(NodeError::InvalidArgument("node meta missing id".into()));
    }
    if meta.signature.is_empty() {
        return Err(NodeError::InvalidArgument(format!(
            "node meta {} missing signature",
            meta.id
        )));
    }
    if meta.cert.is_empty() {
        return Err(NodeError::InvalidArgument(format!(
            "node meta {} missing cert",
            meta.id
        )));
    }
    if meta.public_key.is_empty() {
        return Err(NodeError::InvalidArgument(format!(
            "node meta {} missing public key",
            meta.id
        )));
    }
    if meta.updated == 0 {
        return Err(NodeError::InvalidArgument(format!(
            "node meta {} missing updated",
            meta.id
        )));
    }
    if meta.addrs.is_empty() {
        return Err(NodeError::InvalidArgument(format!(
            "node meta {} missing addrs",
            meta.id
        )));
    }

    if node_id(&meta.public_key) != meta.id {
        return Err(NodeError::InvalidArgument(format!(
            "node meta id {} does not match its public key",
            meta.id
        )));
    }

    let public_key = crypto::unmarshal_public(&meta.public_key)?;
    let signature = crypto::decode_signature(&meta.signature)?;
    if !crypto::verify(&meta.signable_bytes(), &public_key, &signature) {
        return Err(NodeError::SignatureInvalid(format!(
            "node meta {}",
            meta.id
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_meta(key: &SecretKey) -> NodeMeta {
        let public_key = crypto::marshal_public(&crypto::public_key(key)).unwrap();
        let mut meta = NodeMeta {
            id: node_id(&public_key),
            public_key,
            cert: "-----BEGIN CERTIFICATE-----".to_string(),
            addrs: vec!["127.0.0.1:4000".to_string()],
            updated: 1,
            signature: String::new(),
        };
        meta.signature = sign(&meta, key);
        meta
    }

    #[test]
    fn test_validate_accepts_signed_meta() {
        let key = crypto::generate_key();
        validate(&signed_meta(&key)).unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let key = crypto::generate_key();
        let meta = signed_meta(&key);

        for tamper in [
            |m: &mut NodeMeta| m.id.clear(),
            |m: &mut NodeMeta| m.signature.clear(),
            |m: &mut NodeMeta| m.cert.clear(),
            |m: &mut NodeMeta| m.public_key.clear(),
            |m: &mut NodeMeta| m.updated = 0,
            |m: &mut NodeMeta| m.addrs.clear(),
        ] {
            let mut meta = meta.clone();
            tamper(&mut meta);
            assert!(matches!(
                validate(&meta),
                Err(NodeError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_validate_rejects_id_mismatch() {
        let key = crypto::generate_key();
        let mut meta = signed_meta(&key);
        meta.id = node_id("some other key");
        assert!(matches!(
            validate(&meta),
            Err(NodeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_rejects_tampered_record() {
        let key = crypto::generate_key();
        let mut meta = signed_meta(&key);
        // Changing any signed field invalidates the signature.
        meta.addrs = vec!["10.0.0.1:1".to_string()];
        assert!(matches!(
            validate(&meta),
            Err(NodeError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_foreign_signature() {
        let key = crypto::generate_key();
        let other = crypto::generate_key();
        let mut meta = signed_meta(&key);
        meta.signature = sign(&meta, &other);
        assert!(matches!(
            validate(&meta),
            Err(NodeError::SignatureInvalid(_))
        ));
    }
}
