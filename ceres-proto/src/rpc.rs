//! RPC message pairs and the framed envelope.
//!
//! Two logical services share one listener: the node-to-node service
//! (`Hello`, `HeartBeat`, `Meta`) and the client-to-node service (`Get`,
//! `Add`, `GetPeers`, `AddPeer`, `GetReference`, `AddReference`). Each
//! frame on the wire carries exactly one [`Request`] or [`Response`]
//! envelope; failures travel as the [`RpcError`] response body.

use crate::messages::{Document, NodeMeta, Reference};

/// Opens the mutual handshake between two nodes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloRequest {
    /// The caller's signed identity record.
    #[prost(message, optional, tag = "1")]
    pub meta: Option<NodeMeta>,
}

/// Handshake answer: the callee's identity plus its view of the mesh.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloResponse {
    #[prost(message, optional, tag = "1")]
    pub meta: Option<NodeMeta>,
    /// Peers the callee is currently connected to.
    #[prost(message, repeated, tag = "2")]
    pub connected_peers: Vec<NodeMeta>,
    /// Peers the callee only knows about.
    #[prost(message, repeated, tag = "3")]
    pub known_peers: Vec<NodeMeta>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartBeatRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartBeatResponse {}

/// Fetches a node's identity record; the one RPC the insecure bootstrap
/// dial is allowed to make.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetaRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRequest {
    #[prost(string, tag = "1")]
    pub document_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetResponse {
    #[prost(message, optional, tag = "1")]
    pub document: Option<Document>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddRequest {
    #[prost(message, optional, tag = "1")]
    pub document: Option<Document>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddResponse {
    #[prost(string, tag = "1")]
    pub document_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPeersRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPeersResponse {
    /// Every peer the node has been told about, connected or not.
    #[prost(message, repeated, tag = "1")]
    pub peers: Vec<NodeMeta>,
}

/// Asks the node to bootstrap-join the peer listening at `addr`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddPeerRequest {
    #[prost(string, tag = "1")]
    pub addr: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddPeerResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetReferenceRequest {
    #[prost(string, tag = "1")]
    pub reference_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetReferenceResponse {
    /// Empty when the reference is not locally indexed; a network-wide
    /// lookup is a future extension.
    #[prost(message, optional, tag = "1")]
    pub reference: Option<Reference>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddReferenceRequest {
    /// `document:<id>` or `reference:<id>`.
    #[prost(string, tag = "1")]
    pub record: String,
    /// PEM-encoded EC private key the node signs the reference with.
    #[prost(string, tag = "2")]
    pub priv_key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddReferenceResponse {
    #[prost(string, tag = "1")]
    pub reference_id: String,
}

/// Error kinds a node reports over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorKind {
    Unknown = 0,
    NotFound = 1,
    InvalidArgument = 2,
    SignatureInvalid = 3,
    Internal = 4,
    Unimplemented = 5,
}

/// A failed RPC, carried as a response body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(enumeration = "ErrorKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind as i32,
            message: message.into(),
        }
    }
}

/// One request frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(oneof = "request::Body", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9")]
    pub body: Option<request::Body>,
}

pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Hello(super::HelloRequest),
        #[prost(message, tag = "2")]
        HeartBeat(super::HeartBeatRequest),
        #[prost(message, tag = "3")]
        Meta(super::MetaRequest),
        #[prost(message, tag = "4")]
        Get(super::GetRequest),
        #[prost(message, tag = "5")]
        Add(super::AddRequest),
        #[prost(message, tag = "6")]
        GetPeers(super::GetPeersRequest),
        #[prost(message, tag = "7")]
        AddPeer(super::AddPeerRequest),
        #[prost(message, tag = "8")]
        GetReference(super::GetReferenceRequest),
        #[prost(message, tag = "9")]
        AddReference(super::AddReferenceRequest),
    }
}

/// One response frame; tags mirror the request bodies.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(oneof = "response::Body", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 15")]
    pub body: Option<response::Body>,
}

pub mod response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Hello(super::HelloResponse),
        #[prost(message, tag = "2")]
        HeartBeat(super::HeartBeatResponse),
        #[prost(message, tag = "3")]
        Meta(crate::NodeMeta),
        #[prost(message, tag = "4")]
        Get(super::GetResponse),
        #[prost(message, tag = "5")]
        Add(super::AddResponse),
        #[prost(message, tag = "6")]
        GetPeers(super::GetPeersResponse),
        #[prost(message, tag = "7")]
        AddPeer(super::AddPeerResponse),
        #[prost(message, tag = "8")]
        GetReference(super::GetReferenceResponse),
        #[prost(message, tag = "9")]
        AddReference(super::AddReferenceResponse),
        #[prost(message, tag = "15")]
        Error(super::RpcError),
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;
    use crate::Document;

    #[test]
    fn test_request_envelope_roundtrip() {
        let req = Request {
            body: Some(request::Body::Add(AddRequest {
                document: Some(Document {
                    data: b"hi".to_vec(),
                    content_type: "text/plain".to_string(),
                    children: Default::default(),
                }),
            })),
        };
        let decoded = Request::decode(req.encode_to_vec().as_slice()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn test_error_response_roundtrip() {
        let resp = Response {
            body: Some(response::Body::Error(RpcError::new(
                ErrorKind::NotFound,
                "no such document",
            ))),
        };
        let decoded = Response::decode(resp.encode_to_vec().as_slice()).unwrap();
        match decoded.body {
            Some(response::Body::Error(err)) => {
                assert_eq!(err.kind(), ErrorKind::NotFound);
                assert_eq!(err.message, "no such document");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_error_kind_collapses() {
        let err = RpcError {
            kind: 999,
            message: String::new(),
        };
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }
}
