//! Framed RPC client over TLS.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use ceres_proto::rpc::{
    request, response, AddPeerRequest, AddReferenceRequest, AddRequest, ErrorKind, GetPeersRequest,
    GetReferenceRequest, GetRequest, HeartBeatRequest, HelloRequest, HelloResponse, MetaRequest,
    Request, Response,
};
use ceres_proto::{Document, NodeMeta, Reference};

use crate::error::{NodeError, Result};

/// Deadline on outbound dials (TCP connect and TLS handshake each).
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline on a heartbeat exchange; one miss evicts the peer.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline on other request/response exchanges. `Hello` answers can carry
/// a recursive handshake on the remote side, so this is deliberately
/// looser than the heartbeat deadline.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

type TlsFramed = Framed<tokio_rustls::client::TlsStream<TcpStream>, LengthDelimitedCodec>;

/// A connected RPC client for one peer.
///
/// Clones share the underlying connection; one request is in flight at a
/// time and the transport closes when the last clone is dropped.
#[derive(Clone)]
pub struct PeerClient {
    inner: Arc<Inner>,
}

struct Inner {
    addr: String,
    framed: Mutex<TlsFramed>,
}

impl fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerClient")
            .field("addr", &self.inner.addr)
            .finish()
    }
}

impl PeerClient {
    /// Dials `addr` (`host:port`) under the given TLS configuration.
    pub async fn dial(addr: &str, tls: Arc<rustls::ClientConfig>) -> Result<Self> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::Timeout)?
            .map_err(|source| NodeError::Dial {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;

        let server_name = rustls::pki_types::ServerName::try_from(host_of(addr))
            .map_err(|_| NodeError::InvalidArgument(format!("invalid host in {addr}")))?;
        let connector = TlsConnector::from(tls);
        let stream = timeout(DIAL_TIMEOUT, connector.connect(server_name, stream))
            .await
            .map_err(|_| NodeError::Timeout)??;
        debug!(addr = %addr, "connection established");

        Ok(PeerClient {
            inner: Arc::new(Inner {
                addr: addr.to_string(),
                framed: Mutex::new(Framed::new(stream, LengthDelimitedCodec::new())),
            }),
        })
    }

    /// The address this client dialed.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub async fn hello(&self, meta: NodeMeta) -> Result<HelloResponse> {
        match self
            .call(request::Body::Hello(HelloRequest { meta: Some(meta) }))
            .await?
        {
            response::Body::Hello(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub async fn heart_beat(&self) -> Result<()> {
        match self
            .call_with_deadline(
                request::Body::HeartBeat(HeartBeatRequest {}),
                HEARTBEAT_TIMEOUT,
            )
            .await?
        {
            response::Body::HeartBeat(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn meta(&self) -> Result<NodeMeta> {
        match self.call(request::Body::Meta(MetaRequest {})).await? {
            response::Body::Meta(meta) => Ok(meta),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get(&self, document_id: &str) -> Result<Document> {
        let req = GetRequest {
            document_id: document_id.to_string(),
        };
        match self.call(request::Body::Get(req)).await? {
            response::Body::Get(resp) => resp
                .document
                .ok_or_else(|| NodeError::NotFound(document_id.to_string())),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add(&self, document: Document) -> Result<String> {
        let req = AddRequest {
            document: Some(document),
        };
        match self.call(request::Body::Add(req)).await? {
            response::Body::Add(resp) => Ok(resp.document_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_peers(&self) -> Result<Vec<NodeMeta>> {
        match self
            .call(request::Body::GetPeers(GetPeersRequest {}))
            .await?
        {
            response::Body::GetPeers(resp) => Ok(resp.peers),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_peer(&self, addr: &str) -> Result<()> {
        let req = AddPeerRequest {
            addr: addr.to_string(),
        };
        match self.call(request::Body::AddPeer(req)).await? {
            response::Body::AddPeer(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_reference(&self, reference_id: &str) -> Result<Option<Reference>> {
        let req = GetReferenceRequest {
            reference_id: reference_id.to_string(),
        };
        match self.call(request::Body::GetReference(req)).await? {
            response::Body::GetReference(resp) => Ok(resp.reference),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_reference(&self, record: &str, priv_key_pem: &str) -> Result<String> {
        let req = AddReferenceRequest {
            record: record.to_string(),
            priv_key: priv_key_pem.to_string(),
        };
        match self.call(request::Body::AddReference(req)).await? {
            response::Body::AddReference(resp) => Ok(resp.reference_id),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&self, body: request::Body) -> Result<response::Body> {
        self.call_with_deadline(body, RPC_TIMEOUT).await
    }

    async fn call_with_deadline(
        &self,
        body: request::Body,
        deadline: Duration,
    ) -> Result<response::Body> {
        let req = Request { body: Some(body) };
        let mut buf = BytesMut::with_capacity(req.encoded_len());
        req.encode(&mut buf).expect("encoding never fails");

        let frame = timeout(deadline, async {
            let mut framed = self.inner.framed.lock().await;
            framed.send(buf.freeze()).await?;
            match framed.next().await {
                Some(frame) => frame.map_err(NodeError::from),
                None => Err(NodeError::ConnectionClosed),
            }
        })
        .await
        .map_err(|_| NodeError::Timeout)??;

        let resp = Response::decode(frame.freeze())?;
        match resp.body {
            Some(response::Body::Error(err)) => Err(NodeError::from_wire(err)),
            Some(body) => Ok(body),
            None => Err(NodeError::Remote {
                kind: ErrorKind::Unimplemented,
                message: "empty response".into(),
            }),
        }
    }
}

fn unexpected(body: response::Body) -> NodeError {
    NodeError::Remote {
        kind: ErrorKind::Unknown,
        message: format!("unexpected response body: {body:?}"),
    }
}

/// The host portion of a `host:port` address, suitable as a TLS server
/// name (IPs included).
fn host_of(addr: &str) -> String {
    match addr.parse::<std::net::SocketAddr>() {
        Ok(socket_addr) => socket_addr.ip().to_string(),
        Err(_) => addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| addr.to_string()),
    }
}
