//! Mesh membership: authenticated joins, gossip, and heartbeats.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use ceres_proto::rpc::HelloResponse;
use ceres_proto::NodeMeta;

use crate::client::PeerClient;
use crate::error::{NodeError, Result};
use crate::node_meta;
use crate::server::Server;
use crate::tls;

/// Interval between heartbeats on an established peer connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

impl Server {
    /// Learns about a node and, capacity permitting, connects to it.
    ///
    /// The metadata is upserted and persisted even when no connection is
    /// attempted. A freshly seen node is dialed against its embedded
    /// certificate, greeted with `Hello`, installed if no connection won
    /// the race first, and its gossip is folded into the mesh.
    #[tracing::instrument(skip(self, meta), fields(id = %meta.id))]
    pub async fn add_node(&self, meta: NodeMeta) -> Result<()> {
        let local = self.node_meta()?;
        if local.id == meta.id {
            return Ok(());
        }
        node_meta::validate(&meta)?;
        debug!("add node");

        let fresh = self.upsert_peer_meta(&meta);
        self.store()?.put_node_meta(&meta)?;
        if !fresh {
            return Ok(());
        }
        if self.num_connections() >= self.config().max_peers as usize {
            return Ok(());
        }

        let client = self.connect_node(&meta).await?;
        let resp = client.hello(local).await?;
        let answered = resp.meta.as_ref().map(|m| m.id.as_str());
        if answered != Some(meta.id.as_str()) {
            return Err(NodeError::InvalidArgument(format!(
                "hello answered by {answered:?}, expected {}",
                meta.id
            )));
        }

        if !self.install_peer(&meta.id, client.clone()) {
            // Lost a duplicate-connect race, or the peer cap filled while
            // dialing. Dropping the client closes the extra transport.
            debug!(id = %meta.id, "dropping redundant connection");
            return Ok(());
        }
        self.spawn_heartbeat(meta.id.clone(), client);
        info!(id = %meta.id, "peer connected");

        self.add_nodes(resp).await;
        Ok(())
    }

    /// Adds gossiped peers from a `Hello` response, known peers first:
    /// connecting to the frontier before reinforcing existing links grows
    /// the breadth of the mesh before its depth. Individual failures are
    /// logged and skipped; one dead gossiped node must not poison the
    /// handshake that carried it.
    #[tracing::instrument(skip_all)]
    pub(crate) async fn add_nodes(&self, resp: HelloResponse) {
        for meta in resp.known_peers.into_iter().chain(resp.connected_peers) {
            let id = meta.id.clone();
            if let Err(err) = Box::pin(self.add_node(meta)).await {
                debug!(id = %id, "gossiped peer not added: {err}");
            }
        }
    }

    /// Joins a mesh knowing only an address: dial insecurely, fetch the
    /// signed `NodeMeta`, drop the bootstrap transport, then reconnect
    /// authenticated via [`add_node`](Server::add_node).
    #[tracing::instrument(skip(self))]
    pub async fn bootstrap_add_peer(&self, addr: &str) -> Result<()> {
        let meta = {
            let bootstrap = PeerClient::dial(addr, tls::tls_config_insecure()?).await?;
            bootstrap.meta().await?
            // The insecure transport closes here.
        };
        self.add_node(meta).await
    }

    /// Dials each advertised address in order, trusting only the peer's
    /// own certificate; the first successful dial wins.
    #[tracing::instrument(skip(self, meta), fields(id = %meta.id))]
    async fn connect_node(&self, meta: &NodeMeta) -> Result<PeerClient> {
        let config = tls::tls_config_pinned(&meta.cert)?;
        let mut last_err = None;
        for addr in &meta.addrs {
            match PeerClient::dial(addr, config.clone()).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    debug!(addr = %addr, "dial failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            NodeError::InvalidArgument(format!("node {} has no addresses", meta.id))
        }))
    }

    /// Inserts or refreshes a peer record; returns whether the id is newly
    /// seen. An existing record is only replaced by a strictly newer one.
    fn upsert_peer_meta(&self, meta: &NodeMeta) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        match state.peer_meta.get(&meta.id) {
            Some(existing) => {
                if existing.updated < meta.updated {
                    state.peer_meta.insert(meta.id.clone(), meta.clone());
                }
                false
            }
            None => {
                state.peer_meta.insert(meta.id.clone(), meta.clone());
                true
            }
        }
    }

    /// Installs a connected peer under the state lock, unless a racing
    /// connection already did or the peer cap is reached.
    fn install_peer(&self, id: &str, client: PeerClient) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.peers.contains_key(id)
            || state.peers.len() >= self.config().max_peers as usize
        {
            return false;
        }
        state.peers.insert(id.to_string(), client);
        true
    }

    /// Starts the liveness loop for a connected peer. The heartbeat task
    /// is the sole deleter of the peer entry: on the first failed beat it
    /// removes the peer, closes the transport, and exits.
    fn spawn_heartbeat(&self, id: String, client: PeerClient) {
        let server = self.clone();
        let peer_id = id.clone();
        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = client.heart_beat().await {
                    warn!(id = %peer_id, "heartbeat failed: {err}");
                    server.remove_peer(&peer_id);
                    return;
                }
                sleep(HEARTBEAT_INTERVAL).await;
            }
        });
        self.inner
            .state
            .lock()
            .unwrap()
            .heartbeats
            .insert(id, handle);
    }

    /// Drops a peer's client handle (closing the transport) and forgets
    /// its heartbeat. The metadata stays; the peer can be re-added later.
    pub(crate) fn remove_peer(&self, id: &str) {
        let (client, heartbeat) = {
            let mut state = self.inner.state.lock().unwrap();
            (state.peers.remove(id), state.heartbeats.remove(id))
        };
        drop(client);
        // The handle belongs to the calling task; dropping it detaches.
        drop(heartbeat);
    }
}
