use std::collections::BTreeMap;

use prost::Message;

/// Content type marking a document as a directory.
pub const DIRECTORY: &str = "directory";

/// An immutable, content-addressed document.
///
/// The document id is [`digest`](crate::digest) of the encoded document,
/// children included, so a directory's id covers its whole (direct) tree.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Document {
    /// Opaque payload bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    /// Short content type; [`DIRECTORY`] denotes a directory document.
    #[prost(string, tag = "2")]
    pub content_type: String,
    /// Child name to child document id, populated only for directories.
    ///
    /// Kept ordered so the encoding is a function of the logical value. The
    /// store never checks that children exist locally; the network may
    /// serve them later.
    #[prost(btree_map = "string, string", tag = "3")]
    pub children: BTreeMap<String, String>,
}

/// A signed mutable pointer from a stable identity to a document or to
/// another reference.
///
/// The reference id is [`digest`](crate::digest) of `public_key`, so one
/// signer always updates the same slot; a strictly newer `timestamp`
/// supersedes the stored value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reference {
    /// `document:<id>` or `reference:<id>`.
    #[prost(string, tag = "1")]
    pub value: String,
    /// PEM (PKIX) public key of the signer.
    #[prost(string, tag = "2")]
    pub public_key: String,
    /// Seconds since epoch; resolves concurrent updates monotonically.
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    /// Base64 of the ASN.1 DER ECDSA signature over [`signable_bytes`].
    ///
    /// [`signable_bytes`]: Reference::signable_bytes
    #[prost(string, tag = "4")]
    pub signature: String,
}

impl Reference {
    /// The canonical bytes covered by `signature`: the reference encoded
    /// with its signature field cleared.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut cleared = self.clone();
        cleared.signature.clear();
        cleared.encode_to_vec()
    }
}

/// A signed, self-describing identity record for a node.
///
/// Bundles identity, certificate, reachability, freshness and authenticity:
/// two nodes that share a `NodeMeta` can authenticate a direct TLS session
/// against the embedded certificate without any central trust anchor.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeMeta {
    /// [`digest`](crate::digest) of `public_key`.
    #[prost(string, tag = "1")]
    pub id: String,
    /// PEM (PKIX) public key of the node.
    #[prost(string, tag = "2")]
    pub public_key: String,
    /// Self-signed X.509 certificate, PEM.
    #[prost(string, tag = "3")]
    pub cert: String,
    /// Advertised `host:port` addresses, in dialing order.
    #[prost(string, repeated, tag = "4")]
    pub addrs: Vec<String>,
    /// Seconds since epoch at construction; newer records replace older.
    #[prost(int64, tag = "5")]
    pub updated: i64,
    /// Base64 of the ASN.1 DER ECDSA signature over [`signable_bytes`].
    ///
    /// [`signable_bytes`]: NodeMeta::signable_bytes
    #[prost(string, tag = "6")]
    pub signature: String,
}

impl NodeMeta {
    /// The canonical bytes covered by `signature`: the record encoded with
    /// its signature field cleared.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut cleared = self.clone();
        cleared.signature.clear();
        cleared.encode_to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest;

    #[test]
    fn test_document_encoding_is_deterministic() {
        let mut a = Document {
            data: Vec::new(),
            content_type: DIRECTORY.to_string(),
            children: BTreeMap::new(),
        };
        a.children.insert("zebra".to_string(), "id-z".to_string());
        a.children.insert("alpha".to_string(), "id-a".to_string());

        let mut b = Document {
            data: Vec::new(),
            content_type: DIRECTORY.to_string(),
            children: BTreeMap::new(),
        };
        // Same entries, opposite insertion order.
        b.children.insert("alpha".to_string(), "id-a".to_string());
        b.children.insert("zebra".to_string(), "id-z".to_string());

        assert_eq!(a.encode_to_vec(), b.encode_to_vec());
        assert_eq!(digest(&a.encode_to_vec()), digest(&b.encode_to_vec()));
    }

    #[test]
    fn test_document_roundtrip() {
        let mut doc = Document {
            data: b"hello".to_vec(),
            content_type: "text/plain".to_string(),
            children: BTreeMap::new(),
        };
        doc.children.insert("a".to_string(), "X".to_string());

        let decoded = Document::decode(doc.encode_to_vec().as_slice()).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn test_signable_bytes_clears_signature() {
        let mut reference = Reference {
            value: "document:X".to_string(),
            public_key: "key".to_string(),
            timestamp: 42,
            signature: String::new(),
        };
        let unsigned = reference.encode_to_vec();
        reference.signature = "c2ln".to_string();
        assert_eq!(reference.signable_bytes(), unsigned);

        let mut meta = NodeMeta {
            id: "id".to_string(),
            public_key: "key".to_string(),
            cert: "cert".to_string(),
            addrs: vec!["127.0.0.1:4000".to_string()],
            updated: 42,
            signature: String::new(),
        };
        let unsigned = meta.encode_to_vec();
        meta.signature = "c2ln".to_string();
        assert_eq!(meta.signable_bytes(), unsigned);
    }
}
