use std::time::{Duration, Instant};

use anyhow::Result;

use ceres_node::{crypto, tls_config_insecure, NodeConfig, PeerClient, Server};
use ceres_proto::{digest, Document, DIRECTORY};

/// Window for eventually-consistent assertions to settle.
const SETTLE: Duration = Duration::from_secs(15);

struct TestCluster {
    nodes: Vec<Server>,
    _dirs: Vec<tempfile::TempDir>,
}

impl TestCluster {
    /// Spins up `n` nodes on ephemeral loopback ports and bootstraps each
    /// of them into node 0; gossip takes it from there.
    async fn new(n: usize, max_peers: u32) -> Result<Self> {
        let mut nodes = Vec::new();
        let mut dirs = Vec::new();
        for _ in 0..n {
            let dir = tempfile::tempdir()?;
            let node = Server::open(NodeConfig {
                path: dir.path().into(),
                max_peers,
            })?;
            node.listen("127.0.0.1:0").await?;
            nodes.push(node);
            dirs.push(dir);
        }

        let bootstrap_addr = nodes[0]
            .local_addr()
            .expect("node 0 is listening")
            .to_string();
        for node in &nodes[1..] {
            node.bootstrap_add_peer(&bootstrap_addr).await?;
        }

        Ok(TestCluster {
            nodes,
            _dirs: dirs,
        })
    }

    /// A wire client for node `i`, connecting the way the shell client
    /// does (trust-anything TLS).
    async fn client(&self, i: usize) -> Result<PeerClient> {
        let addr = self.nodes[i].local_addr().expect("node is listening");
        Ok(PeerClient::dial(&addr.to_string(), tls_config_insecure()?).await?)
    }

    async fn close(&self) {
        for node in &self.nodes {
            node.close().await.expect("close never fails");
        }
    }
}

/// Polls `f` until it holds or the settle window runs out.
async fn succeeds_soon(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + SETTLE;
    loop {
        if f() {
            return;
        }
        if Instant::now() > deadline {
            panic!("never settled: {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_node_put_get() -> Result<()> {
    let cluster = TestCluster::new(1, 10).await?;
    let client = cluster.client(0).await?;

    let doc = Document {
        data: b"hi".to_vec(),
        content_type: "text/plain".to_string(),
        children: Default::default(),
    };
    let document_id = client.add(doc.clone()).await?;
    let fetched = client.get(&document_id).await?;
    assert_eq!(fetched.data, b"hi");
    assert_eq!(fetched, doc);

    // A missing id surfaces NotFound over the wire.
    let missing = client.get("no-such-document").await;
    assert!(matches!(missing, Err(ceres_node::NodeError::NotFound(_))));

    cluster.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_directory_document() -> Result<()> {
    let cluster = TestCluster::new(1, 10).await?;
    let client = cluster.client(0).await?;

    let x = client
        .add(Document {
            data: b"child a".to_vec(),
            content_type: "text/plain".to_string(),
            children: Default::default(),
        })
        .await?;
    let y = client
        .add(Document {
            data: b"child b".to_vec(),
            content_type: "text/plain".to_string(),
            children: Default::default(),
        })
        .await?;

    let mut dir = Document {
        data: Vec::new(),
        content_type: DIRECTORY.to_string(),
        children: Default::default(),
    };
    dir.children.insert("a".to_string(), x.clone());
    dir.children.insert("b".to_string(), y.clone());

    let z = client.add(dir.clone()).await?;
    let fetched = client.get(&z).await?;
    assert_eq!(fetched.content_type, DIRECTORY);
    assert_eq!(fetched.children.get("a"), Some(&x));
    assert_eq!(fetched.children.get("b"), Some(&y));

    cluster.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cluster_fully_connects() -> Result<()> {
    const NODES: usize = 5;
    let cluster = TestCluster::new(NODES, 10).await?;

    for (i, node) in cluster.nodes.iter().enumerate() {
        let node = node.clone();
        succeeds_soon(&format!("node {i} connects to {} peers", NODES - 1), || {
            node.num_connections() == NODES - 1
        })
        .await;
    }

    cluster.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cluster_max_peers() -> Result<()> {
    const NODES: usize = 5;
    const MAX_PEERS: u32 = 3;
    let cluster = TestCluster::new(NODES, MAX_PEERS).await?;

    for (i, node) in cluster.nodes.iter().enumerate() {
        let node = node.clone();
        succeeds_soon(&format!("node {i} caps at {MAX_PEERS} peers"), || {
            node.num_connections() == MAX_PEERS as usize
        })
        .await;
        // The cap holds at all times, not just eventually.
        assert!(node.num_connections() <= MAX_PEERS as usize);
    }

    cluster.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_peer_over_wire() -> Result<()> {
    let cluster = TestCluster::new(1, 10).await?;
    let other_dir = tempfile::tempdir()?;
    let other = Server::open(NodeConfig {
        path: other_dir.path().into(),
        max_peers: 10,
    })?;
    other.listen("127.0.0.1:0").await?;

    let client = cluster.client(0).await?;
    let other_addr = other.local_addr().expect("node is listening");
    client.add_peer(&other_addr.to_string()).await?;

    let (a, b) = (cluster.nodes[0].clone(), other.clone());
    succeeds_soon("bootstrap join connects both nodes", || {
        a.num_connections() == 1 && b.num_connections() == 1
    })
    .await;

    let peers = client.get_peers().await?;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, other.node_meta()?.id);

    other.close().await?;
    cluster.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_peer_unreachable_fails_fast() -> Result<()> {
    let cluster = TestCluster::new(1, 10).await?;
    let client = cluster.client(0).await?;

    let started = Instant::now();
    // Port 1 on loopback refuses immediately.
    let result = client.add_peer("127.0.0.1:1").await;
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));

    cluster.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reference_round_trip() -> Result<()> {
    let cluster = TestCluster::new(1, 10).await?;
    let client = cluster.client(0).await?;

    let key = crypto::generate_key();
    let key_pem = crypto::marshal_private(&key)?;
    let public_pem = crypto::marshal_public(&crypto::public_key(&key))?;

    let reference_id = client.add_reference("document:X", &key_pem).await?;
    assert_eq!(reference_id, digest(public_pem.as_bytes()));

    let reference = client
        .get_reference(&reference_id)
        .await?
        .expect("reference was just added");
    assert_eq!(reference.value, "document:X");
    assert_eq!(reference.public_key, public_pem);

    // The stored signature verifies under the signing key.
    let signature = crypto::decode_signature(&reference.signature)?;
    assert!(crypto::verify(
        &reference.signable_bytes(),
        &crypto::public_key(&key),
        &signature
    ));

    // Unknown references come back empty rather than failing.
    assert!(client.get_reference("unknown").await?.is_none());

    // Malformed records are rejected.
    let bad = client.add_reference("bogus:X", &key_pem).await;
    assert!(matches!(bad, Err(ceres_node::NodeError::InvalidArgument(_))));

    cluster.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_preserves_identity_and_records() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = NodeConfig {
        path: dir.path().into(),
        max_peers: 10,
    };
    let key = crypto::generate_key();

    let (meta_before, document_id, reference_id) = {
        let node = Server::open(config.clone())?;
        node.listen("127.0.0.1:0").await?;
        let addr = node.local_addr().unwrap().to_string();
        let client = PeerClient::dial(&addr, tls_config_insecure()?).await?;

        let document_id = client
            .add(Document {
                data: b"durable".to_vec(),
                content_type: "text/plain".to_string(),
                children: Default::default(),
            })
            .await?;
        let reference_id = node.add_reference(&format!("document:{document_id}"), &key)?;

        let meta = node.node_meta()?;
        node.close().await?;
        (meta, document_id, reference_id)
    };

    let node = Server::open(config)?;
    let meta_after = node.node_meta()?;
    assert_eq!(meta_after.id, meta_before.id);
    assert_eq!(meta_after.public_key, meta_before.public_key);
    assert_eq!(meta_after.cert, meta_before.cert);

    // Records survive the restart: references reload into the index and
    // documents stay fetchable over the wire.
    let reference = node
        .get_reference(&reference_id)
        .expect("reference survives restart");
    assert_eq!(reference.value, format!("document:{document_id}"));

    node.listen("127.0.0.1:0").await?;
    let addr = node.local_addr().unwrap().to_string();
    let client = PeerClient::dial(&addr, tls_config_insecure()?).await?;
    assert_eq!(client.get(&document_id).await?.data, b"durable");

    node.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_self_is_noop() -> Result<()> {
    let cluster = TestCluster::new(1, 10).await?;
    let node = &cluster.nodes[0];

    node.add_node(node.node_meta()?).await?;
    assert_eq!(node.num_connections(), 0);
    assert!(node.peers().is_empty());

    cluster.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_meta_does_not_replace() -> Result<()> {
    let cluster = TestCluster::new(2, 10).await?;
    let (a, b) = (&cluster.nodes[0], &cluster.nodes[1]);
    let b_id = b.node_meta()?.id;

    let stored = |node: &Server| {
        node.peers()
            .into_iter()
            .find(|m| m.id == b_id)
            .expect("peer b is known")
    };

    // `updated` has second granularity, so sleep past a boundary to get a
    // strictly newer record.
    let stale = b.node_meta()?;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let fresh = b.node_meta()?;
    assert!(stale.updated < fresh.updated);

    a.add_node(fresh.clone()).await?;
    assert_eq!(stored(a).updated, fresh.updated);

    // Re-offering the stale record leaves the newer one in place.
    a.add_node(stale).await?;
    assert_eq!(stored(a).updated, fresh.updated);

    cluster.close().await;
    Ok(())
}
