use std::fmt;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::core::types::{ResourcePath, Subject};
use crate::storage::mime;

/// Owner, group and unix-style mode bits recorded on every resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub owner: String,
    pub group: String,
    pub mode: u16,
}

impl Permissions {
    pub fn new(owner: impl Into<String>, group: impl Into<String>, mode: u16) -> Self {
        Permissions { owner: owner.into(), group: group.into(), mode }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions::new("admin", "dba", 0o755)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const FLAGS: [char; 3] = ['r', 'w', 'x'];
        for shift in (0..9).rev() {
            let set = self.mode & (1 << shift) != 0;
            let flag = FLAGS[2 - (shift % 3) as usize];
            write!(f, "{}", if set { flag } else { '-' })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMeta {
    pub path: ResourcePath,
    pub created: DateTime<Utc>,
    pub permissions: Permissions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMeta {
    pub path: ResourcePath,
    /// Collection the document currently lives in. Held by path, not by ownership.
    pub collection: ResourcePath,
    pub mime_type: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub permissions: Permissions,
    pub content: Bytes,
}

impl DocumentMeta {
    pub fn name(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseResource {
    Collection(CollectionMeta),
    XmlDocument(DocumentMeta),
    BinaryDocument(DocumentMeta),
}

impl DatabaseResource {
    pub fn path(&self) -> &ResourcePath {
        match self {
            DatabaseResource::Collection(c) => &c.path,
            DatabaseResource::XmlDocument(d) | DatabaseResource::BinaryDocument(d) => &d.path,
        }
    }

    pub fn document(&self) -> Option<&DocumentMeta> {
        match self {
            DatabaseResource::Collection(_) => None,
            DatabaseResource::XmlDocument(d) | DatabaseResource::BinaryDocument(d) => Some(d),
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, DatabaseResource::Collection(_))
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.document().map(|d| d.mime_type.as_str())
    }

    /// A binary resource holding query source.
    pub fn is_executable(&self) -> bool {
        match self {
            DatabaseResource::BinaryDocument(d) => mime::is_executable_type(&d.mime_type),
            _ => false,
        }
    }

    pub fn created(&self) -> DateTime<Utc> {
        match self {
            DatabaseResource::Collection(c) => c.created,
            DatabaseResource::XmlDocument(d) | DatabaseResource::BinaryDocument(d) => d.created,
        }
    }

    /// Collections report their creation time.
    pub fn last_modified(&self) -> DateTime<Utc> {
        match self {
            DatabaseResource::Collection(c) => c.created,
            DatabaseResource::XmlDocument(d) | DatabaseResource::BinaryDocument(d) => d.last_modified,
        }
    }

    pub fn permissions(&self) -> &Permissions {
        match self {
            DatabaseResource::Collection(c) => &c.permissions,
            DatabaseResource::XmlDocument(d) | DatabaseResource::BinaryDocument(d) => &d.permissions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Authorization decisions, supplied by the security subsystem.
pub trait AccessPolicy: Send + Sync {
    fn permits(&self, subject: &Subject, resource: &DatabaseResource, access: Access) -> bool;
}

pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn permits(&self, _subject: &Subject, _resource: &DatabaseResource, _access: Access) -> bool {
        true
    }
}
