//! The RPC surface: accept loop, per-connection tasks, and dispatch.
//!
//! Both service groups — node-to-node (`Hello`, `HeartBeat`, `Meta`) and
//! client-to-node (`Get`, `Add`, `GetPeers`, `AddPeer`, `GetReference`,
//! `AddReference`) — are multiplexed on the same TLS listener. Each
//! accepted connection gets its own task; requests on one connection are
//! answered in order.

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ceres_proto::rpc::{
    request, response, AddPeerRequest, AddPeerResponse, AddReferenceRequest, AddReferenceResponse,
    AddRequest, AddResponse, ErrorKind, GetPeersResponse, GetReferenceRequest,
    GetReferenceResponse, GetRequest, GetResponse, HeartBeatResponse, HelloRequest, HelloResponse,
    Request, Response, RpcError,
};

use crate::crypto;
use crate::error::{NodeError, Result};
use crate::server::Server;

impl Server {
    /// The accept loop. Owns every connection task and tears them all
    /// down before returning, so [`close`](Server::close) can rely on the
    /// store being released once this task finishes.
    pub(crate) async fn serve(
        self,
        listener: TcpListener,
        acceptor: TlsAcceptor,
        shutdown: CancellationToken,
    ) {
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let server = self.clone();
                        let acceptor = acceptor.clone();
                        conns.spawn(async move {
                            if let Err(err) = server.handle_conn(stream, acceptor).await {
                                debug!(%remote, "connection ended: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("accept failed, stopping listener: {err}");
                        break;
                    }
                },
            }
            // Reap finished connection tasks without blocking the loop.
            while conns.try_join_next().is_some() {}
        }
        conns.shutdown().await;
    }

    async fn handle_conn(&self, stream: TcpStream, acceptor: TlsAcceptor) -> Result<()> {
        stream.set_nodelay(true)?;
        let stream = acceptor.accept(stream).await?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        while let Some(frame) = framed.next().await {
            let req = Request::decode(frame?.freeze())?;
            let resp = self.handle_request(req).await;
            let mut buf = BytesMut::with_capacity(resp.encoded_len());
            resp.encode(&mut buf).expect("encoding never fails");
            framed.send(buf.freeze()).await?;
        }
        Ok(())
    }

    async fn handle_request(&self, req: Request) -> Response {
        let body = match req.body {
            Some(body) => body,
            None => {
                return error_response(ErrorKind::Unimplemented, "unrecognized request body")
            }
        };

        let result = match body {
            request::Body::Hello(req) => self.handle_hello(req).await.map(response::Body::Hello),
            request::Body::HeartBeat(_) => {
                Ok(response::Body::HeartBeat(HeartBeatResponse {}))
            }
            request::Body::Meta(_) => self.node_meta().map(response::Body::Meta),
            request::Body::Get(req) => self.handle_get(req).map(response::Body::Get),
            request::Body::Add(req) => self.handle_add(req).map(response::Body::Add),
            request::Body::GetPeers(_) => Ok(response::Body::GetPeers(GetPeersResponse {
                peers: self.peers(),
            })),
            request::Body::AddPeer(req) => {
                self.handle_add_peer(req).await.map(response::Body::AddPeer)
            }
            request::Body::GetReference(req) => {
                Ok(response::Body::GetReference(self.handle_get_reference(req)))
            }
            request::Body::AddReference(req) => self
                .handle_add_reference(req)
                .map(response::Body::AddReference),
        };

        match result {
            Ok(body) => Response { body: Some(body) },
            Err(err) => {
                debug!("request failed: {err}");
                error_response(err.wire_kind(), err.to_string())
            }
        }
    }

    /// The server half of the handshake: greet, absorb the caller into the
    /// mesh (which may dial back), then answer with our identity and our
    /// current view of connected and merely-known peers.
    async fn handle_hello(&self, req: HelloRequest) -> Result<HelloResponse> {
        let meta = self.node_meta()?;
        let caller = req
            .meta
            .ok_or_else(|| NodeError::InvalidArgument("hello missing node meta".into()))?;
        self.add_node(caller).await?;

        let (connected_peers, known_peers) = {
            let state = self.inner.state.lock().unwrap();
            let connected = state
                .peers
                .keys()
                .filter_map(|id| state.peer_meta.get(id).cloned())
                .collect();
            let known = state
                .peer_meta
                .iter()
                .filter(|(id, _)| !state.peers.contains_key(*id))
                .map(|(_, meta)| meta.clone())
                .collect();
            (connected, known)
        };

        Ok(HelloResponse {
            meta: Some(meta),
            connected_peers,
            known_peers,
        })
    }

    fn handle_get(&self, req: GetRequest) -> Result<GetResponse> {
        let document = self.store()?.get_document(&req.document_id)?;
        Ok(GetResponse {
            document: Some(document),
        })
    }

    fn handle_add(&self, req: AddRequest) -> Result<AddResponse> {
        let document = req
            .document
            .ok_or_else(|| NodeError::InvalidArgument("add missing document".into()))?;
        let document_id = self.store()?.put_document(&document)?;
        Ok(AddResponse { document_id })
    }

    async fn handle_add_peer(&self, req: AddPeerRequest) -> Result<AddPeerResponse> {
        self.bootstrap_add_peer(&req.addr).await?;
        Ok(AddPeerResponse {})
    }

    fn handle_get_reference(&self, req: GetReferenceRequest) -> GetReferenceResponse {
        GetReferenceResponse {
            reference: self.get_reference(&req.reference_id),
        }
    }

    fn handle_add_reference(&self, req: AddReferenceRequest) -> Result<AddReferenceResponse> {
        let key = crypto::unmarshal_private(&req.priv_key)?;
        let reference_id = self.add_reference(&req.record, &key)?;
        Ok(AddReferenceResponse { reference_id })
    }
}

fn error_response(kind: ErrorKind, message: impl Into<String>) -> Response {
    Response {
        body: Some(response::Body::Error(RpcError::new(kind, message))),
    }
}
