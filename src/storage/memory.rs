use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::ResourcePath;
use crate::storage::mime;
use crate::storage::resource::{CollectionMeta, DatabaseResource, DocumentMeta, Permissions};
use crate::storage::store::{Mutation, Store, TxnId};
use crate::xml::parser::check_well_formed;

/// Reference storage engine keeping the whole tree in memory.
///
/// Staged mutations live in a per-transaction log. Commit replays the log onto a
/// copy of the tree and swaps the copy in, so a failing step leaves the tree untouched.
pub struct InMemoryStore {
    tree: RwLock<BTreeMap<ResourcePath, DatabaseResource>>,
    pending: Mutex<HashMap<TxnId, Vec<Mutation>>>,
    next_txn: AtomicU64,
    counters: StoreCounters,
}

#[derive(Default)]
struct StoreCounters {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    closed: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub closed: u64,
    pub open: usize,
}

impl InMemoryStore {
    /// Creates a store holding only the `/db` root collection.
    pub fn new() -> Self {
        let root = ResourcePath::root().child("db");
        let mut tree = BTreeMap::new();
        tree.insert(
            root.clone(),
            DatabaseResource::Collection(CollectionMeta {
                path: root,
                created: Utc::now(),
                permissions: Permissions::default(),
            }),
        );

        InMemoryStore {
            tree: RwLock::new(tree),
            pending: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
            counters: StoreCounters::default(),
        }
    }

    /// Stores a document, creating missing collections, in its own transaction.
    pub fn insert_document(&self, path: &str, mime_type: &str, content: impl Into<Bytes>) -> Result<()> {
        let path = ResourcePath::parse(path)?;
        let txn = self.begin()?;
        let staged = self.stage_ancestors(txn, &path).and_then(|_| {
            self.apply(txn, Mutation::StoreDocument {
                path: path.clone(),
                mime_type: mime_type.to_string(),
                content: content.into(),
            })
        });
        let result = staged.and_then(|_| self.commit(txn));
        if result.is_err() {
            let _ = self.abort(txn);
        }
        self.close(txn);
        result
    }

    pub fn create_collection(&self, path: &str) -> Result<()> {
        let path = ResourcePath::parse(path)?;
        let txn = self.begin()?;
        let result = self
            .stage_ancestors(txn, &path)
            .and_then(|_| self.apply(txn, Mutation::CreateCollection { path: path.clone() }))
            .and_then(|_| self.commit(txn));
        if result.is_err() {
            let _ = self.abort(txn);
        }
        self.close(txn);
        result
    }

    fn stage_ancestors(&self, txn: TxnId, path: &ResourcePath) -> Result<()> {
        for ancestor in path.ancestors() {
            if self.staged(txn, &ancestor).is_none() {
                self.apply(txn, Mutation::CreateCollection { path: ancestor })?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            begun: self.counters.begun.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            open: self.pending.lock().len(),
        }
    }

    fn apply_to(
        tree: &mut BTreeMap<ResourcePath, DatabaseResource>,
        mutation: Mutation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match mutation {
            Mutation::CreateCollection { path } => {
                match tree.get(&path) {
                    Some(DatabaseResource::Collection(_)) => return Ok(()),
                    Some(_) => return Err(conflict(&path, "a document already exists there")),
                    None => {}
                }
                require_parent_collection(tree, &path)?;
                tree.insert(
                    path.clone(),
                    DatabaseResource::Collection(CollectionMeta {
                        path,
                        created: now,
                        permissions: Permissions::default(),
                    }),
                );
            }
            Mutation::StoreDocument { path, mime_type, content } => {
                let collection = require_parent_collection(tree, &path)?;
                let (created, permissions) = match tree.get(&path) {
                    Some(DatabaseResource::Collection(_)) => {
                        return Err(conflict(&path, "a collection already exists there"));
                    }
                    Some(existing) => (existing.created(), existing.permissions().clone()),
                    None => (now, Permissions::default()),
                };
                let meta = DocumentMeta {
                    path: path.clone(),
                    collection,
                    mime_type: mime_type.clone(),
                    created,
                    last_modified: now,
                    permissions,
                    content,
                };
                let resource = if mime::is_xml_type(&mime_type) {
                    DatabaseResource::XmlDocument(meta)
                } else {
                    DatabaseResource::BinaryDocument(meta)
                };
                tree.insert(path, resource);
            }
            Mutation::ReplaceContent { path, content } => match tree.get_mut(&path) {
                Some(DatabaseResource::XmlDocument(d)) | Some(DatabaseResource::BinaryDocument(d)) => {
                    d.content = content;
                    d.last_modified = now;
                }
                _ => return Err(conflict(&path, "no document to update")),
            },
            Mutation::RemoveDocument { path } => match tree.get(&path) {
                Some(DatabaseResource::XmlDocument(_)) | Some(DatabaseResource::BinaryDocument(_)) => {
                    tree.remove(&path);
                }
                _ => return Err(conflict(&path, "no document to remove")),
            },
            Mutation::RemoveCollection { path } => {
                if !matches!(tree.get(&path), Some(DatabaseResource::Collection(_))) {
                    return Err(conflict(&path, "no collection to remove"));
                }
                tree.retain(|key, _| !key.is_descendant_or_self(&path));
            }
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn conflict(path: &ResourcePath, reason: &str) -> Error {
    Error::new(ErrorKind::TransactionFailure, format!("Cannot apply change to {}: {}", path, reason))
}

fn require_parent_collection(
    tree: &BTreeMap<ResourcePath, DatabaseResource>,
    path: &ResourcePath,
) -> Result<ResourcePath> {
    let parent = path
        .parent()
        .filter(|p| !p.is_root())
        .ok_or_else(|| conflict(path, "resources must live below a collection"))?;
    match tree.get(&parent) {
        Some(DatabaseResource::Collection(_)) => Ok(parent),
        _ => Err(conflict(path, "parent collection does not exist")),
    }
}

impl Store for InMemoryStore {
    fn resource(&self, path: &ResourcePath) -> Option<DatabaseResource> {
        self.tree.read().get(path).cloned()
    }

    fn children(&self, collection: &ResourcePath) -> Vec<DatabaseResource> {
        let tree = self.tree.read();
        let depth = collection.len() + 1;
        let mut children: Vec<DatabaseResource> = tree
            .range(collection.clone()..)
            .take_while(|(key, _)| key.is_descendant_or_self(collection))
            .filter(|(key, _)| key.len() == depth)
            .map(|(_, resource)| resource.clone())
            .collect();
        children.sort_by_key(|r| (!r.is_collection(), r.path().clone()));
        children
    }

    fn begin(&self) -> Result<TxnId> {
        let txn = TxnId(self.next_txn.fetch_add(1, Ordering::SeqCst));
        self.pending.lock().insert(txn, Vec::new());
        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        Ok(txn)
    }

    fn apply(&self, txn: TxnId, mutation: Mutation) -> Result<()> {
        if let Mutation::StoreDocument { path, mime_type, content } = &mutation {
            if mime::is_xml_type(mime_type) {
                let text = std::str::from_utf8(content).map_err(|_| {
                    Error::bad_request(format!("Document {} is not valid UTF-8", path))
                })?;
                check_well_formed(text)?;
            }
        }

        let mut pending = self.pending.lock();
        let log = pending.get_mut(&txn).ok_or_else(|| {
            Error::new(ErrorKind::TransactionFailure, format!("Unknown transaction {}", txn))
        })?;
        log.push(mutation);
        Ok(())
    }

    fn staged(&self, txn: TxnId, path: &ResourcePath) -> Option<DatabaseResource> {
        let mut view = self.resource(path);
        let pending = self.pending.lock();
        let Some(log) = pending.get(&txn) else {
            return view;
        };

        let now = Utc::now();
        for mutation in log {
            match mutation {
                Mutation::CreateCollection { path: p } if p == path => {
                    if view.is_none() {
                        view = Some(DatabaseResource::Collection(CollectionMeta {
                            path: p.clone(),
                            created: now,
                            permissions: Permissions::default(),
                        }));
                    }
                }
                Mutation::StoreDocument { path: p, mime_type, content } if p == path => {
                    let meta = DocumentMeta {
                        path: p.clone(),
                        collection: p.parent().unwrap_or_else(ResourcePath::root),
                        mime_type: mime_type.clone(),
                        created: view.as_ref().map(|r| r.created()).unwrap_or(now),
                        last_modified: now,
                        permissions: Permissions::default(),
                        content: content.clone(),
                    };
                    view = Some(if mime::is_xml_type(mime_type) {
                        DatabaseResource::XmlDocument(meta)
                    } else {
                        DatabaseResource::BinaryDocument(meta)
                    });
                }
                Mutation::ReplaceContent { path: p, content } if p == path => {
                    if let Some(DatabaseResource::XmlDocument(d)) | Some(DatabaseResource::BinaryDocument(d)) = view.as_mut() {
                        d.content = content.clone();
                        d.last_modified = now;
                    }
                }
                Mutation::RemoveDocument { path: p } if p == path => view = None,
                Mutation::RemoveCollection { path: p } if path.is_descendant_or_self(p) => view = None,
                _ => {}
            }
        }
        view
    }

    fn commit(&self, txn: TxnId) -> Result<()> {
        let log = self.pending.lock().remove(&txn).ok_or_else(|| {
            Error::new(ErrorKind::TransactionFailure, format!("Unknown transaction {}", txn))
        })?;

        let mut tree = self.tree.write();
        let mut next = tree.clone();
        let now = Utc::now();
        let count = log.len();
        for mutation in log {
            Self::apply_to(&mut next, mutation, now)?;
        }
        *tree = next;

        self.counters.committed.fetch_add(1, Ordering::Relaxed);
        debug!(%txn, mutations = count, "committed");
        Ok(())
    }

    fn abort(&self, txn: TxnId) -> Result<()> {
        if self.pending.lock().remove(&txn).is_none() {
            warn!(%txn, "abort of a transaction with no staged state");
        }
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self, txn: TxnId) {
        self.pending.lock().remove(&txn);
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
    }
}
