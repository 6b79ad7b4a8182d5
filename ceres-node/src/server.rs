//! Server state and lifecycle.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use p256::SecretKey;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ceres_proto::{digest, NodeMeta, Reference};
use ceres_store::{Store, CONFIG_CERT, CONFIG_KEY, CONFIG_PRIVATE_KEY};

use crate::client::PeerClient;
use crate::config::NodeConfig;
use crate::crypto;
use crate::error::{NodeError, Result};
use crate::node_meta;
use crate::tls;

/// A ceres node: the content-addressed document store, the signed
/// reference index, and the peer mesh, behind one RPC listener.
///
/// Cloning shares the node. All mutable state lives in one mutex, never
/// held across I/O.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: NodeConfig,
    pub(crate) secret: SecretKey,
    pub(crate) cert_pem: String,
    pub(crate) tls_key_pem: String,
    pub(crate) state: Mutex<State>,
}

#[derive(Default)]
pub(crate) struct State {
    /// `None` once the node is closed.
    pub(crate) store: Option<Store>,
    /// Every peer we have ever been told about, by node id.
    pub(crate) peer_meta: HashMap<String, NodeMeta>,
    /// Peers currently connected, by node id.
    pub(crate) peers: HashMap<String, PeerClient>,
    /// Heartbeat tasks, one-to-one with `peers`.
    pub(crate) heartbeats: HashMap<String, JoinHandle<()>>,
    /// Local reference index, by reference id.
    pub(crate) references: HashMap<String, Reference>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) serve_task: Option<JoinHandle<()>>,
    pub(crate) shutdown: Option<CancellationToken>,
}

impl Server {
    /// Opens a node rooted at `config.path`, creating the directory (mode
    /// 0700) and the key material on first run. Reopening an existing path
    /// restores the identity, the certificate, and all persisted records.
    pub fn open(config: NodeConfig) -> Result<Self> {
        if config.path.as_os_str().is_empty() {
            return Err(NodeError::InvalidArgument(
                "config path must not be empty".into(),
            ));
        }
        create_dir_0700(&config.path)?;
        let store = Store::open(&config.path)?;
        let (secret, cert_pem, tls_key_pem) = load_or_generate_cert(&store)?;

        let state = State {
            references: load_references(&store),
            peer_meta: load_peer_meta(&store),
            store: Some(store),
            ..State::default()
        };

        Ok(Server {
            inner: Arc::new(Inner {
                config,
                secret,
                cert_pem,
                tls_key_pem,
                state: Mutex::new(state),
            }),
        })
    }

    /// Binds `addr` and starts serving both RPC groups over TLS. Returns
    /// once the listener is bound; serving continues in the background
    /// until [`close`](Server::close).
    pub async fn listen(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let tls = tls::tls_server_config(&self.inner.cert_pem, &self.inner.tls_key_pem)?;
        let acceptor = TlsAcceptor::from(tls);

        let shutdown = CancellationToken::new();
        let server = self.clone();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { server.serve(listener, acceptor, token).await });

        let mut state = self.inner.state.lock().unwrap();
        if state.serve_task.is_some() {
            task.abort();
            return Err(NodeError::InvalidArgument(
                "node is already listening".into(),
            ));
        }
        state.local_addr = Some(local_addr);
        state.serve_task = Some(task);
        state.shutdown = Some(shutdown);
        info!(%local_addr, "listening");
        Ok(())
    }

    /// Shuts the node down: stops serving, drops every peer connection and
    /// heartbeat, and closes the store. Always callable; afterwards
    /// operations fail with [`NodeError::Closed`].
    pub async fn close(&self) -> Result<()> {
        let (serve_task, shutdown, peers, heartbeats) = {
            let mut state = self.inner.state.lock().unwrap();
            state.local_addr = None;
            state.store = None;
            (
                state.serve_task.take(),
                state.shutdown.take(),
                std::mem::take(&mut state.peers),
                std::mem::take(&mut state.heartbeats),
            )
        };

        for handle in heartbeats.values() {
            handle.abort();
        }
        if let Some(token) = shutdown {
            token.cancel();
        }
        if let Some(task) = serve_task {
            // The serve task tears down its connection tasks before
            // returning, so nothing holds the store past this await.
            let _ = task.await;
        }
        for (_, handle) in heartbeats {
            let _ = handle.await;
        }
        drop(peers);
        info!("node closed");
        Ok(())
    }

    /// Builds a freshly constructed, freshly signed identity record for
    /// this node.
    pub fn node_meta(&self) -> Result<NodeMeta> {
        let public_key = crypto::marshal_public(&crypto::public_key(&self.inner.secret))?;
        let id = node_meta::node_id(&public_key);

        let mut addrs = Vec::new();
        if let Some(addr) = self.local_addr() {
            if addr.ip().is_unspecified() {
                addrs.push(format!("{}:{}", outbound_or_loopback(), addr.port()));
            } else {
                addrs.push(addr.to_string());
            }
        }

        let mut meta = NodeMeta {
            id,
            public_key,
            cert: self.inner.cert_pem.clone(),
            addrs,
            updated: now_unix(),
            signature: String::new(),
        };
        meta.signature = node_meta::sign(&meta, &self.inner.secret);
        Ok(meta)
    }

    /// The number of currently connected peers.
    pub fn num_connections(&self) -> usize {
        self.inner.state.lock().unwrap().peers.len()
    }

    /// Every peer this node has been told about, connected or not.
    pub fn peers(&self) -> Vec<NodeMeta> {
        self.inner
            .state
            .lock()
            .unwrap()
            .peer_meta
            .values()
            .cloned()
            .collect()
    }

    /// The bound listener address, once [`listen`](Server::listen) ran.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().unwrap().local_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Signs `record` with `key` and installs the resulting reference in
    /// the local index; returns the stable reference id for the key.
    pub fn add_reference(&self, record: &str, key: &SecretKey) -> Result<String> {
        if !record.starts_with("document:") && !record.starts_with("reference:") {
            return Err(NodeError::InvalidArgument(
                "record must start with 'document:' or 'reference:'".into(),
            ));
        }

        let public_key = crypto::marshal_public(&crypto::public_key(key))?;
        let mut reference = Reference {
            value: record.to_string(),
            public_key,
            timestamp: now_unix(),
            signature: String::new(),
        };
        reference.signature =
            crypto::encode_signature(&crypto::sign(&reference.signable_bytes(), key));

        let reference_id = digest(reference.public_key.as_bytes());
        self.insert_reference(&reference_id, reference)?;
        Ok(reference_id)
    }

    /// Returns the locally indexed reference, if any. An unknown id yields
    /// `None`; a network-wide lookup is a future extension.
    pub fn get_reference(&self, reference_id: &str) -> Option<Reference> {
        self.inner
            .state
            .lock()
            .unwrap()
            .references
            .get(reference_id)
            .cloned()
    }

    /// Installs a reference unless the stored one for the same id is as
    /// new or newer, then persists it.
    fn insert_reference(&self, reference_id: &str, reference: Reference) -> Result<()> {
        let store = self.store()?;
        {
            let mut state = self.inner.state.lock().unwrap();
            match state.references.get(reference_id) {
                Some(existing) if existing.timestamp >= reference.timestamp => return Ok(()),
                _ => {
                    state
                        .references
                        .insert(reference_id.to_string(), reference.clone());
                }
            }
        }
        store.put_reference(reference_id, &reference)?;
        Ok(())
    }

    /// The store handle, while the node is open.
    pub(crate) fn store(&self) -> Result<Store> {
        self.inner
            .state
            .lock()
            .unwrap()
            .store
            .clone()
            .ok_or(NodeError::Closed)
    }
}

fn load_or_generate_cert(store: &Store) -> Result<(SecretKey, String, String)> {
    let loaded = (
        store.get_config(CONFIG_PRIVATE_KEY)?,
        store.get_config(CONFIG_CERT)?,
        store.get_config(CONFIG_KEY)?,
    );
    if let (Some(private_der), Some(cert), Some(key)) = loaded {
        let secret = crypto::private_from_der(&private_der)?;
        let cert_pem = string_config(cert, CONFIG_CERT)?;
        let key_pem = string_config(key, CONFIG_KEY)?;
        return Ok((secret, cert_pem, key_pem));
    }

    let secret = crypto::generate_key();
    let (cert_pem, key_pem) = crypto::self_signed_cert(&secret, outbound_or_loopback())?;
    let private_der = crypto::private_der(&secret)?;
    store.put_config(&[
        (CONFIG_PRIVATE_KEY, private_der.as_slice()),
        (CONFIG_CERT, cert_pem.as_bytes()),
        (CONFIG_KEY, key_pem.as_bytes()),
    ])?;
    info!("generated node key and certificate");
    Ok((secret, cert_pem, key_pem))
}

fn string_config(value: Vec<u8>, name: &str) -> Result<String> {
    String::from_utf8(value)
        .map_err(|_| NodeError::InvalidArgument(format!("stored {name} is not UTF-8")))
}

/// Loads persisted references, dropping records that no longer verify.
fn load_references(store: &Store) -> HashMap<String, Reference> {
    let records = match store.references() {
        Ok(records) => records,
        Err(err) => {
            warn!("failed to load references: {err}");
            return HashMap::new();
        }
    };
    let mut references = HashMap::new();
    for (id, reference) in records {
        if let Err(err) = verify_reference(&id, &reference) {
            warn!(id = %id, "dropping stored reference: {err}");
            continue;
        }
        references.insert(id, reference);
    }
    references
}

/// Checks a reference against its embedded public key and the store key it
/// was found under.
fn verify_reference(reference_id: &str, reference: &Reference) -> Result<()> {
    if digest(reference.public_key.as_bytes()) != reference_id {
        return Err(NodeError::InvalidArgument(format!(
            "reference id {reference_id} does not match its public key"
        )));
    }
    let public_key = crypto::unmarshal_public(&reference.public_key)?;
    let signature = crypto::decode_signature(&reference.signature)?;
    if !crypto::verify(&reference.signable_bytes(), &public_key, &signature) {
        return Err(NodeError::SignatureInvalid(format!(
            "reference {reference_id}"
        )));
    }
    Ok(())
}

/// Loads persisted peer records, dropping any that fail validation. Only
/// metadata is restored; no connections are initiated here.
fn load_peer_meta(store: &Store) -> HashMap<String, NodeMeta> {
    let records = match store.node_metas() {
        Ok(records) => records,
        Err(err) => {
            warn!("failed to load peer meta: {err}");
            return HashMap::new();
        }
    };
    let mut peer_meta = HashMap::new();
    for meta in records {
        if let Err(err) = node_meta::validate(&meta) {
            warn!(id = %meta.id, "dropping stored peer meta: {err}");
            continue;
        }
        peer_meta.insert(meta.id.clone(), meta);
    }
    peer_meta
}

fn create_dir_0700(path: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// The probed outbound IP, or loopback when the probe has no route.
fn outbound_or_loopback() -> IpAddr {
    crypto::outbound_ip().unwrap_or_else(|err| {
        warn!("outbound address probe failed, using loopback: {err}");
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_empty_path() {
        let config = NodeConfig {
            path: "".into(),
            max_peers: 1,
        };
        assert!(matches!(
            Server::open(config),
            Err(NodeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_node_meta_is_self_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let node = Server::open(NodeConfig::new(dir.path())).unwrap();

        let meta = node.node_meta().unwrap();
        assert_eq!(meta.id, node_meta::node_id(&meta.public_key));
        // Not listening yet, so no addresses; everything else must hold.
        assert!(meta.addrs.is_empty());
        assert_ne!(meta.updated, 0);

        let public_key = crypto::unmarshal_public(&meta.public_key).unwrap();
        let signature = crypto::decode_signature(&meta.signature).unwrap();
        assert!(crypto::verify(
            &meta.signable_bytes(),
            &public_key,
            &signature
        ));
    }

    #[test]
    fn test_reference_rejects_bad_record() {
        let dir = tempfile::tempdir().unwrap();
        let node = Server::open(NodeConfig::new(dir.path())).unwrap();
        let key = crypto::generate_key();

        assert!(matches!(
            node.add_reference("bogus:X", &key),
            Err(NodeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reference_local_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let node = Server::open(NodeConfig::new(dir.path())).unwrap();
        let key = crypto::generate_key();

        let reference_id = node.add_reference("document:X", &key).unwrap();
        let expected = digest(
            crypto::marshal_public(&crypto::public_key(&key))
                .unwrap()
                .as_bytes(),
        );
        assert_eq!(reference_id, expected);

        let reference = node.get_reference(&reference_id).unwrap();
        assert_eq!(reference.value, "document:X");
        verify_reference(&reference_id, &reference).unwrap();

        assert!(node.get_reference("missing").is_none());
    }
}
