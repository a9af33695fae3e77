use std::fmt;
use bytes::Bytes;
use crate::core::error::Result;
use crate::core::types::ResourcePath;
use crate::storage::resource::DatabaseResource;

/// Storage-side transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// A single staged change to the document tree.
#[derive(Debug, Clone)]
pub enum Mutation {
    CreateCollection { path: ResourcePath },
    StoreDocument { path: ResourcePath, mime_type: String, content: Bytes },
    ReplaceContent { path: ResourcePath, content: Bytes },
    RemoveDocument { path: ResourcePath },
    RemoveCollection { path: ResourcePath },
}

impl Mutation {
    pub fn path(&self) -> &ResourcePath {
        match self {
            Mutation::CreateCollection { path }
            | Mutation::StoreDocument { path, .. }
            | Mutation::ReplaceContent { path, .. }
            | Mutation::RemoveDocument { path }
            | Mutation::RemoveCollection { path } => path,
        }
    }
}

/// The storage engine as seen by the request core.
///
/// Mutations are staged against a transaction and become visible only on
/// `commit`, which applies all of them or none. `abort` discards staged work;
/// `close` releases whatever the engine still holds for the transaction.
pub trait Store: Send + Sync {
    fn resource(&self, path: &ResourcePath) -> Option<DatabaseResource>;

    /// Direct children of a collection, collections first.
    fn children(&self, collection: &ResourcePath) -> Vec<DatabaseResource>;

    fn begin(&self) -> Result<TxnId>;

    fn apply(&self, txn: TxnId, mutation: Mutation) -> Result<()>;

    /// View of `path` including the transaction's own staged writes.
    fn staged(&self, txn: TxnId, path: &ResourcePath) -> Option<DatabaseResource>;

    fn commit(&self, txn: TxnId) -> Result<()>;

    fn abort(&self, txn: TxnId) -> Result<()>;

    fn close(&self, txn: TxnId);

    /// Every collection and document below `collection`, in path order, so
    /// each collection precedes its contents.
    fn descendants(&self, collection: &ResourcePath) -> Vec<ResourcePath> {
        let mut found = Vec::new();
        let mut pending = vec![collection.clone()];
        while let Some(current) = pending.pop() {
            for child in self.children(&current) {
                if child.is_collection() {
                    pending.push(child.path().clone());
                }
                found.push(child.path().clone());
            }
        }
        found.sort();
        found
    }

    /// Every XML document at or below `collection`, depth first.
    fn xml_documents_under(&self, collection: &ResourcePath) -> Vec<ResourcePath> {
        let mut found = Vec::new();
        let mut pending = vec![collection.clone()];
        while let Some(current) = pending.pop() {
            for child in self.children(&current) {
                match child {
                    DatabaseResource::Collection(c) => pending.push(c.path),
                    DatabaseResource::XmlDocument(d) => found.push(d.path),
                    DatabaseResource::BinaryDocument(_) => {}
                }
            }
        }
        found.sort();
        found
    }
}
