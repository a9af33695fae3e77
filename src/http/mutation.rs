use std::collections::BTreeSet;
use tracing::{debug, info};
use crate::core::error::{Error, Result};
use crate::core::types::ResourcePath;
use crate::http::dispatcher::{check_submission, RequestDispatcher};
use crate::http::params::RequestParams;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::serialize::xupdate_result;
use crate::storage::lock::{LockMode, ResourceLock};
use crate::storage::mime;
use crate::storage::resource::{Access, DatabaseResource};
use crate::xml::parser::Element;

/// Write path. Every mutation runs in one transaction while the affected
/// resources are write-locked; locks are taken parent before child.
impl RequestDispatcher {
    pub(super) fn do_put(&self, request: &Request, path: &ResourcePath) -> Result<Response> {
        if let Some(response) = self.check_for_query_target(request, path)? {
            return Ok(response);
        }
        if self.store.resource(path).is_some_and(|r| r.is_collection()) {
            return Err(Error::bad_request(
                "A PUT request is not allowed against a plain collection path.",
            ));
        }
        let (Some(parent), Some(name)) = (path.parent(), path.last_segment()) else {
            return Err(Error::bad_request(format!("Bad path: {}", path)));
        };
        if parent.is_root() {
            return Err(Error::bad_request(format!("Bad path: {}", path)));
        }
        let mime_type = request
            .content_type()
            .unwrap_or_else(|| mime::for_name(name))
            .to_string();

        let collection_lock = self.resolver.locks().write(&parent)?;
        let document_lock = self.resolver.locks().write(path)?;
        let target = self.store.resource(path).or_else(|| self.store.resource(&parent));
        if let Some(target) = &target {
            self.require_write(request, target)?;
        }

        let content = request.body.clone();
        let size = content.len();
        self.transactions.run(|tx| {
            tx.ensure_collections(path)?;
            tx.store_document(path, &mime_type, content)
        })?;
        drop(document_lock);
        drop(collection_lock);

        self.pool.invalidate(path);
        info!(%path, mime_type = %mime_type, size, "document stored");
        Ok(Response::new(201))
    }

    pub(super) fn do_delete(&self, request: &Request, path: &ResourcePath) -> Result<Response> {
        if let Some(response) = self.check_for_query_target(request, path)? {
            return Ok(response);
        }
        let Some(locked) = self.resolver.open(path, LockMode::Write)? else {
            return Err(Error::not_found(format!(
                "No document or collection found for path: {}",
                path
            )));
        };
        self.require_write(request, locked.resource())?;

        let is_collection = locked.resource().is_collection();
        let contents = if is_collection { self.lock_descendants(path)? } else { Vec::new() };
        self.transactions.run(|tx| {
            if is_collection {
                tx.remove_collection(path)
            } else {
                tx.remove_document(path)
            }
        })?;
        drop(contents);
        drop(locked);

        self.pool.invalidate(path);
        info!(%path, is_collection, "resource removed");
        Ok(Response::ok())
    }

    /// Applies an XUpdate document to the XML documents at or below `path`.
    pub(super) fn xupdate(&self, request: &Request, path: &ResourcePath, xupdate: &Element) -> Result<Response> {
        check_submission(self.config.xupdate_submission, &request.subject, "XUpdate")?;
        let Some(processor) = &self.update_processor else {
            return Err(Error::permission_denied("XUpdate submission is disabled"));
        };
        let params = RequestParams::from_request(request, &self.config)?;

        let mut targets = match self.store.resource(path) {
            Some(DatabaseResource::Collection(_)) => self.store.xml_documents_under(path),
            Some(_) => vec![path.clone()],
            None => self.store.xml_documents_under(&ResourcePath::root()),
        };
        targets.sort();
        targets.dedup();

        let mut locks = Vec::with_capacity(targets.len());
        for target in &targets {
            locks.push(self.resolver.locks().write(target)?);
            if let Some(resource) = self.store.resource(target) {
                self.require_write(request, &resource)?;
            }
        }
        debug!(targets = targets.len(), "xupdate targets locked");

        let modifications = self
            .transactions
            .run(|tx| processor.process(xupdate, &targets, tx))?;
        drop(locks);

        for target in &targets {
            self.pool.invalidate(target);
        }
        info!(%path, modifications, "xupdate applied");
        Ok(xupdate_result(modifications, &params.encoding))
    }

    /// Write-locks everything below `collection`, whose own write lock the
    /// caller holds. Paths are taken in sorted order, parents first, and the
    /// listing is repeated until nothing new appeared while locking.
    fn lock_descendants(&self, collection: &ResourcePath) -> Result<Vec<ResourceLock>> {
        let mut locked = BTreeSet::new();
        let mut locks = Vec::new();
        loop {
            let pending: Vec<ResourcePath> = self
                .store
                .descendants(collection)
                .into_iter()
                .filter(|path| !locked.contains(path))
                .collect();
            if pending.is_empty() {
                debug!(%collection, resources = locks.len(), "collection contents locked");
                return Ok(locks);
            }
            for path in pending {
                locks.push(self.resolver.locks().write(&path)?);
                locked.insert(path);
            }
        }
    }

    fn require_write(&self, request: &Request, resource: &DatabaseResource) -> Result<()> {
        if self.policy.permits(&request.subject, resource, Access::Write) {
            return Ok(());
        }
        Err(Error::permission_denied(format!(
            "Account '{}' not allowed requested access to document '{}'",
            request.subject.name,
            resource.path()
        )))
    }
}
