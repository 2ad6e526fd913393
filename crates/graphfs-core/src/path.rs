//! Hierarchical node addresses.
//!
//! A [`Path`] is a partition root identifier followed by zero or more
//! [`PathElement`]s. The textual form is `root/elem/elem`; a bare `root`
//! names the partition root node.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// One component of a path. Also the key of a tree or graph edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathElement(String);

/// Edges are keyed the same way path components are.
pub type EdgeKey = PathElement;

impl PathElement {
    /// Build an element, rejecting empty names and the `/` separator.
    pub fn new(name: impl Into<String>) -> Result<Self, GraphError> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(GraphError::InvalidArgument(format!("invalid path element {:?}", name)));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PathElement {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Immutable node address; compares by root then component sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path {
    root: String,
    elements: Vec<PathElement>,
}

impl Path {
    /// The root node of partition `root`.
    pub fn root(root: impl Into<String>) -> Result<Self, GraphError> {
        let root = root.into();
        if root.is_empty() || root.contains('/') {
            return Err(GraphError::InvalidArgument(format!("invalid partition root {:?}", root)));
        }
        Ok(Self { root, elements: Vec::new() })
    }

    /// Parse `root/a/b`.
    pub fn parse(s: &str) -> Result<Self, GraphError> {
        let mut parts = s.split('/');
        let root = parts.next().unwrap_or_default();
        let mut path = Self::root(root)?;
        for part in parts {
            path.elements.push(PathElement::new(part)?);
        }
        Ok(path)
    }

    pub fn partition(&self) -> &str {
        &self.root
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }

    /// Last component, or None for a partition root.
    pub fn name(&self) -> Option<&PathElement> {
        self.elements.last()
    }

    pub fn parent(&self) -> Option<Path> {
        if self.elements.is_empty() {
            return None;
        }
        Some(Self {
            root: self.root.clone(),
            elements: self.elements[..self.elements.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, element: PathElement) -> Path {
        let mut elements = self.elements.clone();
        elements.push(element);
        Self { root: self.root.clone(), elements }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for element in &self.elements {
            write!(f, "/{}", element)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
