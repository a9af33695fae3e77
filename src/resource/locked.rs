use crate::core::types::ResourcePath;
use crate::storage::lock::{LockMode, ResourceLock};
use crate::storage::resource::DatabaseResource;

/// A resource snapshot together with the lock taken before it was read.
///
/// The lock is released when this value is dropped, or earlier through
/// [`LockedResource::release`].
#[derive(Debug)]
pub struct LockedResource {
    resource: DatabaseResource,
    lock: ResourceLock,
}

impl LockedResource {
    pub(crate) fn new(resource: DatabaseResource, lock: ResourceLock) -> Self {
        LockedResource { resource, lock }
    }

    pub fn resource(&self) -> &DatabaseResource {
        &self.resource
    }

    pub fn path(&self) -> &ResourcePath {
        self.resource.path()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock.mode()
    }

    /// Drops the lock and keeps the snapshot.
    pub fn release(self) -> DatabaseResource {
        let LockedResource { resource, lock } = self;
        lock.release();
        resource
    }
}
