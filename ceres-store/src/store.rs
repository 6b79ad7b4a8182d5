use std::fmt;
use std::path::Path;
use std::sync::Arc;

use prost::Message;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use ceres_proto::{digest, Document, NodeMeta, Reference};

use crate::error::{Result, StoreError};

/// All records live in one ordered keyspace, namespaced by key prefix.
const RECORDS_V0: TableDefinition<&str, &[u8]> = TableDefinition::new("records-v0");

const DB_FILE: &str = "ceres.db";

const DOCUMENT_PREFIX: &str = "/document/";
const REFERENCE_PREFIX: &str = "/reference/";
const NODE_META_PREFIX: &str = "/NodeMeta/";
const CONFIG_PREFIX: &str = "/config/";

/// Config key for the DER-encoded EC private key.
pub const CONFIG_PRIVATE_KEY: &str = "privateKey";
/// Config key for the PEM certificate.
pub const CONFIG_CERT: &str = "cert";
/// Config key for the PEM private key paired with the certificate for TLS.
pub const CONFIG_KEY: &str = "key";

/// Handle to a node's database. Cloning shares the underlying database;
/// it closes when the last clone is dropped.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (creating if necessary) the database under `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path.join(DB_FILE))?;
        let txn = db.begin_write()?;
        {
            txn.open_table(RECORDS_V0)?;
        }
        txn.commit()?;
        Ok(Store { db: Arc::new(db) })
    }

    /// Stores a document and returns its content-derived id.
    ///
    /// Idempotent: re-adding a document overwrites the same key with the
    /// same bytes.
    #[tracing::instrument(skip_all)]
    pub fn put_document(&self, doc: &Document) -> Result<String> {
        let bytes = doc.encode_to_vec();
        let id = digest(&bytes);
        self.put_raw(&format!("{DOCUMENT_PREFIX}{id}"), &bytes)?;
        debug!(id = %id, size = bytes.len(), "stored document");
        Ok(id)
    }

    #[tracing::instrument(skip(self))]
    pub fn get_document(&self, id: &str) -> Result<Document> {
        let key = format!("{DOCUMENT_PREFIX}{id}");
        let bytes = self
            .get_raw(&key)?
            .ok_or_else(|| StoreError::NotFound(key))?;
        Ok(Document::decode(bytes.as_slice())?)
    }

    /// Stores a reference if it is newer than the stored one for the same
    /// id. Returns whether the record was written; the read and the write
    /// happen in one transaction.
    #[tracing::instrument(skip(self, reference))]
    pub fn put_reference(&self, id: &str, reference: &Reference) -> Result<bool> {
        let key = format!("{REFERENCE_PREFIX}{id}");
        let bytes = reference.encode_to_vec();
        let txn = self.db.begin_write()?;
        let written = {
            let mut table = txn.open_table(RECORDS_V0)?;
            let newer = match table.get(key.as_str())? {
                Some(existing) => {
                    let existing = Reference::decode(existing.value())?;
                    reference.timestamp > existing.timestamp
                }
                None => true,
            };
            if newer {
                table.insert(key.as_str(), bytes.as_slice())?;
            }
            newer
        };
        txn.commit()?;
        Ok(written)
    }

    pub fn get_reference(&self, id: &str) -> Result<Option<Reference>> {
        match self.get_raw(&format!("{REFERENCE_PREFIX}{id}"))? {
            Some(bytes) => Ok(Some(Reference::decode(bytes.as_slice())?)),
            None => Ok(None),
        }
    }

    /// All persisted references, as `(reference_id, reference)` pairs.
    pub fn references(&self) -> Result<Vec<(String, Reference)>> {
        self.scan_prefix(REFERENCE_PREFIX)?
            .into_iter()
            .map(|(id, bytes)| Ok((id, Reference::decode(bytes.as_slice())?)))
            .collect()
    }

    /// Persists the identity record of an acknowledged peer.
    #[tracing::instrument(skip(self, meta), fields(id = %meta.id))]
    pub fn put_node_meta(&self, meta: &NodeMeta) -> Result<()> {
        self.put_raw(
            &format!("{NODE_META_PREFIX}{}", meta.id),
            &meta.encode_to_vec(),
        )
    }

    /// All persisted peer identity records.
    pub fn node_metas(&self) -> Result<Vec<NodeMeta>> {
        self.scan_prefix(NODE_META_PREFIX)?
            .into_iter()
            .map(|(_, bytes)| Ok(NodeMeta::decode(bytes.as_slice())?))
            .collect()
    }

    pub fn get_config(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.get_raw(&format!("{CONFIG_PREFIX}{name}"))
    }

    /// Writes several config entries in one atomic transaction.
    pub fn put_config(&self, entries: &[(&str, &[u8])]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS_V0)?;
            for (name, value) in entries {
                table.insert(format!("{CONFIG_PREFIX}{name}").as_str(), *value)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn put_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS_V0)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS_V0)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Returns `(key suffix, value)` pairs for every record under `prefix`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let end = prefix_end(prefix);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS_V0)?;
        let mut out = Vec::new();
        for item in table.range(prefix..end.as_str())? {
            let (key, value) = item?;
            out.push((
                key.value()[prefix.len()..].to_string(),
                value.value().to_vec(),
            ));
        }
        Ok(out)
    }
}

/// The smallest key strictly greater than every key with `prefix`.
fn prefix_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    let last = bytes.last_mut().expect("prefixes are non-empty");
    // Prefixes end in '/', so the increment stays within ASCII.
    *last += 1;
    String::from_utf8(bytes).expect("prefixes are ASCII")
}
