//! Document store contract used by the guard and the backup engine, plus two
//! implementations: an in-memory store and a directory of JSON files.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

use crate::error::StoreError;

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

/// Push feed for one document. Holds `None` while the document is absent.
pub type DocumentSubscription = watch::Receiver<Option<Document>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Create or fully overwrite the document's fields.
    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError>;

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError>;

    async fn subscribe(&self, collection: &str, id: &str)
        -> Result<DocumentSubscription, StoreError>;

    /// Names of every collection currently holding documents.
    async fn collection_names(&self) -> Result<Vec<String>, StoreError>;
}

type DocKey = (String, String);

#[derive(Default)]
struct Watchers {
    senders: Mutex<HashMap<DocKey, watch::Sender<Option<Document>>>>,
}

impl Watchers {
    fn subscribe(
        &self,
        collection: &str,
        id: &str,
        current: Option<Document>,
    ) -> DocumentSubscription {
        let mut senders = self.senders.lock();
        let key = (collection.to_string(), id.to_string());
        if let Some(sender) = senders.get(&key) {
            return sender.subscribe();
        }
        let (tx, rx) = watch::channel(current);
        senders.insert(key, tx);
        rx
    }

    fn publish(&self, collection: &str, doc: Document) {
        let mut senders = self.senders.lock();
        let key = (collection.to_string(), doc.id.clone());
        let closed = match senders.get(&key) {
            Some(sender) => sender.send(Some(doc)).is_err(),
            None => false,
        };
        if closed {
            // every receiver is gone
            senders.remove(&key);
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, Fields>>>,
    watchers: Watchers,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of documents across all collections.
    pub fn document_count(&self) -> usize {
        self.collections.read().values().map(BTreeMap::len).sum()
    }

    /// Cloned view of all collections, for comparisons.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, Fields>> {
        self.collections.read().clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document {
                id: id.to_string(),
                fields: fields.clone(),
            }))
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields.clone());
        self.watchers.publish(
            collection,
            Document {
                id: id.to_string(),
                fields,
            },
        );
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<DocumentSubscription, StoreError> {
        let current = self.get(collection, id).await?;
        Ok(self.watchers.subscribe(collection, id, current))
    }

    async fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .collections
            .read()
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }
}

/// Stores each collection as `<root>/<collection>.json`, an object keyed by
/// document id. Subscriptions only see writes made through this instance.
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    watchers: Watchers,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            watchers: Watchers::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: &str) -> Result<PathBuf, StoreError> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::Unavailable(format!(
                "invalid collection name {collection:?}"
            )));
        }
        Ok(self.root.join(format!("{collection}.json")))
    }

    fn read_collection(&self, collection: &str) -> Result<BTreeMap<String, Fields>, StoreError> {
        let path = self.collection_path(collection)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
            collection: collection.to_string(),
            source,
        })
    }

    fn write_collection(
        &self,
        collection: &str,
        docs: &BTreeMap<String, Fields>,
    ) -> Result<(), StoreError> {
        let path = self.collection_path(collection)?;
        let json = serde_json::to_vec_pretty(docs).map_err(|source| StoreError::Corrupt {
            collection: collection.to_string(),
            source,
        })?;
        let mut staging = tempfile::NamedTempFile::new_in(&self.root)?;
        staging.write_all(&json)?;
        staging.as_file().sync_all()?;
        staging.persist(&path).map_err(|err| StoreError::Io(err.error))?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let mut docs = self.read_collection(collection)?;
        Ok(docs.remove(id).map(|fields| Document {
            id: id.to_string(),
            fields,
        }))
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        {
            let _guard = self.write_lock.lock();
            let mut docs = self.read_collection(collection)?;
            docs.insert(id.to_string(), fields.clone());
            self.write_collection(collection, &docs)?;
        }
        self.watchers.publish(
            collection,
            Document {
                id: id.to_string(),
                fields,
            },
        );
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .read_collection(collection)?
            .into_iter()
            .map(|(id, fields)| Document { id, fields })
            .collect())
    }

    async fn subscribe(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<DocumentSubscription, StoreError> {
        let current = self.get(collection, id).await?;
        Ok(self.watchers.subscribe(collection, id, current))
    }

    async fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !self.read_collection(stem)?.is_empty() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
