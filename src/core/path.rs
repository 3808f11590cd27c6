//! Paths from the clone root to a node, carried by every error.
//!
//! Graphs can be six figures deep, so paths are persistent cons lists:
//! extending a path is O(1) and child paths share their parent chain.

use std::fmt;
use std::sync::Arc;

/// One step from a node to one of its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Named field of a struct shape.
    Field(&'static str),
    /// Element of a sequence or set.
    Index(usize),
    /// Key side of the n-th entry of a map.
    Key(usize),
    /// Value side of the n-th entry of a map.
    Value(usize),
    /// Target of a shared handle (`Arc`-like indirection).
    Deref,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => write!(f, ".{name}"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
            PathSegment::Key(i) => write!(f, "{{key {i}}}"),
            PathSegment::Value(i) => write!(f, "{{value {i}}}"),
            PathSegment::Deref => write!(f, ".*"),
        }
    }
}

#[derive(Debug)]
struct PathNode {
    segment: PathSegment,
    parent: Option<Arc<PathNode>>,
}

// The default recursive drop would overflow the stack on very deep
// paths; unlink the chain iteratively while we hold the last reference.
impl Drop for PathNode {
    fn drop(&mut self) {
        let mut parent = self.parent.take();
        while let Some(node) = parent {
            match Arc::try_unwrap(node) {
                Ok(mut inner) => parent = inner.parent.take(),
                Err(_) => break,
            }
        }
    }
}

/// Chain of segments from the root to one node of the graph.
#[derive(Debug, Clone, Default)]
pub struct FieldPath {
    head: Option<Arc<PathNode>>,
}

impl FieldPath {
    /// Path of the root object itself.
    pub fn root() -> Self {
        FieldPath { head: None }
    }

    pub fn is_root(&self) -> bool {
        self.head.is_none()
    }

    /// Extends the path by one segment, sharing the existing chain.
    pub fn child(&self, segment: PathSegment) -> Self {
        FieldPath {
            head: Some(Arc::new(PathNode {
                segment,
                parent: self.head.clone(),
            })),
        }
    }

    /// Segments in root-to-leaf order.
    pub fn segments(&self) -> Vec<PathSegment> {
        let mut out = Vec::new();
        let mut cur = self.head.as_deref();
        while let Some(node) = cur {
            out.push(node.segment.clone());
            cur = node.parent.as_deref();
        }
        out.reverse();
        out
    }

    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head.as_deref();
        while let Some(node) = cur {
            n += 1;
            cur = node.parent.as_deref();
        }
        n
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root")?;
        for segment in self.segments() {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}
