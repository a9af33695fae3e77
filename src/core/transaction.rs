use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use bytes::Bytes;
use tracing::{debug, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::ResourcePath;
use crate::storage::resource::DatabaseResource;
use crate::storage::store::{Mutation, Store, TxnId};

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
    Closed,
}

#[derive(Default)]
struct TransactionCounters {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    closed: AtomicU64,
}

/// A unit of all-or-nothing work against the store.
///
/// Exactly one of [`commit`](Transaction::commit) or [`abort`](Transaction::abort)
/// ends the active phase; [`close`](Transaction::close) always follows and runs at
/// most once. Dropping the handle closes it, aborting first if nothing ended it.
pub struct Transaction<'m> {
    id: TxnId,
    state: TransactionState,
    operations: usize,
    store: &'m dyn Store,
    counters: &'m TransactionCounters,
}

impl<'m> Transaction<'m> {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of mutations staged so far.
    pub fn operations(&self) -> usize {
        self.operations
    }

    pub fn apply(&mut self, mutation: Mutation) -> Result<()> {
        self.check_active()?;
        self.store.apply(self.id, mutation)?;
        self.operations += 1;
        Ok(())
    }

    pub fn create_collection(&mut self, path: &ResourcePath) -> Result<()> {
        self.apply(Mutation::CreateCollection { path: path.clone() })
    }

    pub fn store_document(&mut self, path: &ResourcePath, mime_type: &str, content: Bytes) -> Result<()> {
        self.apply(Mutation::StoreDocument {
            path: path.clone(),
            mime_type: mime_type.to_string(),
            content,
        })
    }

    pub fn replace_content(&mut self, path: &ResourcePath, content: Bytes) -> Result<()> {
        self.apply(Mutation::ReplaceContent { path: path.clone(), content })
    }

    pub fn remove_document(&mut self, path: &ResourcePath) -> Result<()> {
        self.apply(Mutation::RemoveDocument { path: path.clone() })
    }

    pub fn remove_collection(&mut self, path: &ResourcePath) -> Result<()> {
        self.apply(Mutation::RemoveCollection { path: path.clone() })
    }

    /// Read your own writes: the resource as this transaction currently sees it.
    pub fn read(&self, path: &ResourcePath) -> Option<DatabaseResource> {
        self.store.staged(self.id, path)
    }

    /// Creates every missing ancestor collection of `path`, top down.
    pub fn ensure_collections(&mut self, path: &ResourcePath) -> Result<()> {
        for ancestor in path.ancestors() {
            match self.read(&ancestor) {
                Some(DatabaseResource::Collection(_)) => {}
                Some(_) => {
                    return Err(Error::bad_request(format!(
                        "Cannot create collection {}: a document exists at that path",
                        ancestor
                    )));
                }
                None => self.create_collection(&ancestor)?,
            }
        }
        Ok(())
    }

    /// # Panics
    ///
    /// If the transaction is no longer active.
    pub fn commit(&mut self) -> Result<()> {
        self.expect_active("commit");
        match self.store.commit(self.id) {
            Ok(()) => {
                self.state = TransactionState::Committed;
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                debug!(txn = %self.id, operations = self.operations, "transaction committed");
                Ok(())
            }
            Err(err) => {
                // A failed commit leaves nothing applied.
                self.state = TransactionState::Aborted;
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);
                warn!(txn = %self.id, error = %err, "commit failed");
                Err(Error::new(ErrorKind::TransactionFailure, err.context))
            }
        }
    }

    /// # Panics
    ///
    /// If the transaction is no longer active.
    pub fn abort(&mut self) -> Result<()> {
        self.expect_active("abort");
        self.state = TransactionState::Aborted;
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(txn = %self.id, operations = self.operations, "transaction aborted");
        self.store.abort(self.id)
    }

    /// Idempotent. An active transaction is aborted before closing.
    pub fn close(&mut self) {
        match self.state {
            TransactionState::Closed => return,
            TransactionState::Active => {
                if let Err(err) = self.abort() {
                    warn!(txn = %self.id, error = %err, "abort during close failed");
                }
            }
            _ => {}
        }
        self.store.close(self.id);
        self.state = TransactionState::Closed;
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn check_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::new(
                ErrorKind::TransactionFailure,
                format!("Transaction {} is not active", self.id),
            ));
        }
        Ok(())
    }

    fn expect_active(&self, operation: &str) {
        if self.state != TransactionState::Active {
            panic!("{} called on {} in state {:?}", operation, self.id, self.state);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Transaction manager for coordinating transactions
pub struct TransactionManager {
    store: Arc<dyn Store>,
    counters: TransactionCounters,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        TransactionManager {
            store,
            counters: TransactionCounters::default(),
        }
    }

    pub fn begin(&self) -> Result<Transaction<'_>> {
        let id = self.store.begin()?;
        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        debug!(txn = %id, "transaction started");
        Ok(Transaction {
            id,
            state: TransactionState::Active,
            operations: 0,
            store: self.store.as_ref(),
            counters: &self.counters,
        })
    }

    /// Runs `work` inside a transaction: commit on success, abort on any error,
    /// close in every case.
    pub fn run<T>(&self, work: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin()?;
        let outcome = work(&mut tx).and_then(|value| tx.commit().map(|_| value));
        if outcome.is_err() && tx.state() == TransactionState::Active {
            if let Err(err) = tx.abort() {
                warn!(txn = %tx.id(), error = %err, "abort failed");
            }
        }
        tx.close();
        outcome
    }

    /// Get transaction statistics
    pub fn stats(&self) -> TransactionStats {
        let begun = self.counters.begun.load(Ordering::Relaxed);
        let closed = self.counters.closed.load(Ordering::Relaxed);
        TransactionStats {
            begun,
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            closed,
            open: begun.saturating_sub(closed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub closed: u64,
    pub open: u64,
}
