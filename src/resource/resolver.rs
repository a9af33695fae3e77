use std::sync::Arc;
use tracing::debug;
use crate::core::error::{Error, Result};
use crate::core::types::ResourcePath;
use crate::resource::locked::LockedResource;
use crate::storage::lock::{LockManager, LockMode};
use crate::storage::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Exactly the requested path.
    Direct,
    /// The requested path if it exists, otherwise the nearest executable ancestor.
    ExecutableSearch,
}

/// Outcome of resolution.
///
/// For an executable found above the requested path, `servlet_path` is the
/// executable's own path and `path_info` the stripped remainder (`/extra`).
#[derive(Debug)]
pub struct Located {
    pub resource: LockedResource,
    pub servlet_path: ResourcePath,
    pub path_info: String,
}

enum Probe {
    Executable(Located),
    Stop,
    Continue,
}

/// Maps request paths onto locked database resources.
#[derive(Clone)]
pub struct ResourceResolver {
    store: Arc<dyn Store>,
    locks: LockManager,
}

impl ResourceResolver {
    pub fn new(store: Arc<dyn Store>, locks: LockManager) -> Self {
        ResourceResolver { store, locks }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Locks `path` and reads it. Returns `None`, holding nothing, if absent.
    pub fn open(&self, path: &ResourcePath, mode: LockMode) -> Result<Option<LockedResource>> {
        let lock = self.locks.acquire(path, mode)?;
        match self.store.resource(path) {
            Some(resource) => Ok(Some(LockedResource::new(resource, lock))),
            None => Ok(None),
        }
    }

    pub fn resolve(&self, path: &ResourcePath, mode: ResolveMode) -> Result<Located> {
        if let Some(resource) = self.open(path, LockMode::Read)? {
            return Ok(Located {
                resource,
                servlet_path: path.clone(),
                path_info: String::new(),
            });
        }

        if mode == ResolveMode::ExecutableSearch {
            if let Some(found) = self.search_upward(path)? {
                return Ok(found);
            }
        }
        Err(Error::not_found(format!("Document {} not found", path)))
    }

    /// An executable at `path` itself or, when nothing exists there, above it.
    ///
    /// Unlike [`resolve`](Self::resolve), an existing non-executable resource at
    /// `path` yields `None` rather than being returned.
    pub fn find_executable(&self, path: &ResourcePath) -> Result<Option<Located>> {
        match self.open(path, LockMode::Read)? {
            Some(resource) if resource.resource().is_executable() => Ok(Some(Located {
                resource,
                servlet_path: path.clone(),
                path_info: String::new(),
            })),
            Some(_) => Ok(None),
            None => self.search_upward(path),
        }
    }

    fn search_upward(&self, path: &ResourcePath) -> Result<Option<Located>> {
        let mut current = path.parent();
        while let Some(candidate) = current {
            if candidate.is_root() {
                break;
            }
            match self.probe(path, &candidate)? {
                Probe::Executable(found) => {
                    debug!(%path, servlet_path = %found.servlet_path, "executable found above request path");
                    return Ok(Some(found));
                }
                Probe::Stop => {
                    debug!(%path, stopped_at = %candidate, "plain document blocks executable search");
                    return Ok(None);
                }
                Probe::Continue => current = candidate.parent(),
            }
        }
        Ok(None)
    }

    /// Every rejected candidate's lock is dropped before this returns.
    fn probe(&self, requested: &ResourcePath, candidate: &ResourcePath) -> Result<Probe> {
        let Some(resource) = self.open(candidate, LockMode::Read)? else {
            return Ok(Probe::Continue);
        };
        if resource.resource().is_executable() {
            return Ok(Probe::Executable(Located {
                servlet_path: candidate.clone(),
                path_info: requested.trim_from_beginning(candidate),
                resource,
            }));
        }
        if resource.resource().is_collection() {
            return Ok(Probe::Continue);
        }
        Ok(Probe::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::mime;

    fn path(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn resolver() -> ResourceResolver {
        let store = InMemoryStore::new();
        store.insert_document("/db/a/b.xml", mime::XML, "<b/>").unwrap();
        store.insert_document("/db/apps/run.xq", mime::XQUERY, "1 + 1").unwrap();
        store.insert_document("/db/apps/data.bin", mime::BINARY, vec![0u8, 1, 2]).unwrap();
        ResourceResolver::new(Arc::new(store), LockManager::default())
    }

    #[test]
    fn direct_returns_documents_and_collections() {
        let resolver = resolver();
        let doc = resolver.resolve(&path("/db/a/b.xml"), ResolveMode::Direct).unwrap();
        assert_eq!(doc.resource.lock_mode(), LockMode::Read);
        assert!(!doc.resource.resource().is_collection());

        let coll = resolver.resolve(&path("/db/a"), ResolveMode::Direct).unwrap();
        assert!(coll.resource.resource().is_collection());
        drop((doc, coll));

        let err = resolver.resolve(&path("/db/a/none.xml"), ResolveMode::Direct).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(resolver.locks().stats().held(), 0);
    }

    #[test]
    fn search_finds_executable_ancestor_with_path_info() {
        let resolver = resolver();
        let found = resolver
            .resolve(&path("/db/apps/run.xq/users/42"), ResolveMode::ExecutableSearch)
            .unwrap();
        assert_eq!(found.servlet_path, path("/db/apps/run.xq"));
        assert_eq!(found.path_info, "/users/42");
        assert_eq!(resolver.locks().stats().held(), 1);
        drop(found);
        assert_eq!(resolver.locks().stats().held(), 0);
    }

    #[test]
    fn plain_document_stops_the_search() {
        let resolver = resolver();
        let err = resolver
            .resolve(&path("/db/a/b.xml/extra"), ResolveMode::ExecutableSearch)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let binary = resolver.resolve(&path("/db/apps/data.bin/x"), ResolveMode::ExecutableSearch);
        assert!(binary.is_err());

        let stats = resolver.locks().stats();
        assert_eq!(stats.acquired, stats.released);
    }

    #[test]
    fn literal_resource_wins_over_search() {
        let resolver = resolver();
        let found = resolver.resolve(&path("/db/a/b.xml"), ResolveMode::ExecutableSearch).unwrap();
        assert_eq!(found.servlet_path, path("/db/a/b.xml"));
        assert!(found.path_info.is_empty());
    }

    #[test]
    fn find_executable_ignores_plain_literals() {
        let resolver = resolver();
        assert!(resolver.find_executable(&path("/db/a")).unwrap().is_none());
        assert!(resolver.find_executable(&path("/db/a/b.xml")).unwrap().is_none());
        assert!(resolver.find_executable(&path("/db/nothing/here")).unwrap().is_none());
        let found = resolver.find_executable(&path("/db/apps/run.xq")).unwrap().unwrap();
        assert!(found.resource.resource().is_executable());
    }
}
