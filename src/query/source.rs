use std::borrow::Cow;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use crate::core::error::{Error, Result};
use crate::core::types::ResourcePath;

/// Where a query's text comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySource {
    Inline(String),
    Stored {
        path: ResourcePath,
        last_modified: DateTime<Utc>,
        content: Bytes,
    },
}

impl QuerySource {
    pub fn text(&self) -> Result<Cow<'_, str>> {
        match self {
            QuerySource::Inline(text) => Ok(Cow::Borrowed(text)),
            QuerySource::Stored { path, content, .. } => std::str::from_utf8(content)
                .map(Cow::Borrowed)
                .map_err(|_| Error::bad_request(format!("Query source {} is not valid UTF-8", path))),
        }
    }

    pub fn path(&self) -> Option<&ResourcePath> {
        match self {
            QuerySource::Inline(_) => None,
            QuerySource::Stored { path, .. } => Some(path),
        }
    }

    pub fn fingerprint(&self) -> QueryFingerprint {
        match self {
            QuerySource::Inline(text) => QueryFingerprint::Inline(text.clone()),
            QuerySource::Stored { path, last_modified, .. } => QueryFingerprint::Stored {
                path: path.clone(),
                last_modified: last_modified.timestamp_millis(),
            },
        }
    }
}

/// Cache key of compiled queries.
///
/// Inline queries are keyed by their exact text; stored queries by location and
/// modification time, so an edited resource never hits stale instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryFingerprint {
    Inline(String),
    Stored { path: ResourcePath, last_modified: i64 },
}

impl QueryFingerprint {
    pub fn path(&self) -> Option<&ResourcePath> {
        match self {
            QueryFingerprint::Inline(_) => None,
            QueryFingerprint::Stored { path, .. } => Some(path),
        }
    }
}
