use std::fmt;
use std::sync::Arc;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, Result};

/// Segment-addressed location of a collection or document in the database tree.
///
/// Comparisons are always segment-wise, so `/db/a` is never an ancestor of `/db/ab`.
/// The empty path (no segments) is the root above `/db`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourcePath {
    segments: Arc<[String]>,
}

impl ResourcePath {
    pub fn root() -> Self {
        ResourcePath { segments: Arc::from(Vec::new()) }
    }

    pub fn parse(path: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" => continue,
                "." | ".." => {
                    return Err(Error::bad_request(format!("Bad path: {}", path)));
                }
                s => segments.push(s.to_string()),
            }
        }
        Ok(ResourcePath { segments: Arc::from(segments) })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Path with the final segment stripped; `None` once the root is reached.
    pub fn parent(&self) -> Option<ResourcePath> {
        if self.segments.is_empty() {
            return None;
        }
        let parent = self.segments[..self.segments.len() - 1].to_vec();
        Some(ResourcePath { segments: Arc::from(parent) })
    }

    pub fn child(&self, name: &str) -> ResourcePath {
        let mut segments = self.segments.to_vec();
        segments.push(name.to_string());
        ResourcePath { segments: Arc::from(segments) }
    }

    /// Strict descendant test, segment by segment.
    pub fn is_child_of(&self, ancestor: &ResourcePath) -> bool {
        self.segments.len() > ancestor.segments.len() && self.starts_with(ancestor)
    }

    pub fn is_descendant_or_self(&self, ancestor: &ResourcePath) -> bool {
        self.starts_with(ancestor)
    }

    fn starts_with(&self, prefix: &ResourcePath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments.iter().zip(prefix.segments.iter()).all(|(a, b)| a == b)
    }

    /// Remainder of `self` after `prefix`, rendered as `/a/b` (empty when equal).
    pub fn trim_from_beginning(&self, prefix: &ResourcePath) -> String {
        if !self.starts_with(prefix) {
            return self.to_string();
        }
        self.segments[prefix.segments.len()..]
            .iter()
            .map(|s| format!("/{}", s))
            .collect()
    }

    /// Ancestors from the top down, excluding the root and `self`.
    pub fn ancestors(&self) -> Vec<ResourcePath> {
        (1..self.segments.len())
            .map(|n| ResourcePath { segments: Arc::from(self.segments[..n].to_vec()) })
            .collect()
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in self.segments.iter() {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl Serialize for ResourcePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ResourcePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ResourcePath::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// The principal a request runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub authenticated: bool,
}

impl Subject {
    pub const GUEST: &'static str = "guest";

    pub fn guest() -> Self {
        Subject { name: Self::GUEST.to_string(), authenticated: false }
    }

    pub fn user(name: impl Into<String>) -> Self {
        Subject { name: name.into(), authenticated: true }
    }

    pub fn is_guest(&self) -> bool {
        !self.authenticated || self.name == Self::GUEST
    }
}
