//! Mitosis: identity-preserving deep copies of arbitrary object graphs
//!
//! **Mitosis clones a graph without any cooperation from the types in it.**
//!
//! No derive, no `Clone` bound on node types, no serialization round
//! trip. Types are described once in a process-wide registry and the
//! engine does the rest, preserving the properties a naive recursive
//! copy loses.
//!
//! # Guarantees
//!
//! - **Identity-preserving**: two references to one source allocation
//!   become two references to one clone allocation; cycles through
//!   lock-bearing handles come out as cycles
//! - **Construction-free**: clones are populated field by field, never
//!   by re-running constructors or validation logic
//! - **All-or-nothing**: a failed operation returns an error carrying
//!   the field path from the root; partial graphs are never returned
//! - **Deterministic**: parallel and sequential execution produce the
//!   same value
//!
//! # Describing types
//!
//! Scalars, `String` and `&'static str` work out of the box. Everything
//! else is registered once, before the first clone:
//!
//! - [`ShapeBuilder`] describes a struct field by field
//! - [`register_vec`], [`register_hash_map`] and the other adapter
//!   functions instantiate container policies per element type
//! - [`register_arc`], [`register_arc_mutex`] and [`register_arc_rwlock`]
//!   describe shared handles whose aliasing must survive the clone
//! - [`register_policy`] installs an arbitrary user copy function
//!
//! # Example
//!
//! ```
//! use mitosis::{clone_graph, register_vec, ShapeBuilder};
//!
//! struct Account {
//!     name: String,
//!     scores: Vec<u64>,
//! }
//!
//! ShapeBuilder::<Account>::new()
//!     .with_default(|| Account { name: String::new(), scores: Vec::new() })
//!     .field("name", |a: &Account| &a.name, |a, v| a.name = v)
//!     .field("scores", |a: &Account| &a.scores, |a, v| a.scores = v)
//!     .register();
//! register_vec::<u64>();
//!
//! let source = Account { name: "ada".into(), scores: vec![3, 7] };
//! let copy = clone_graph(&source).unwrap();
//! assert_eq!(copy.name, "ada");
//! assert_eq!(copy.scores, vec![3, 7]);
//! ```
//!
//! # Field access
//!
//! Fields are reached through registered projection closures by
//! default. A host that accepts unsafe offset-based access can call
//! [`grant_raw_access`] once at startup; shapes whose every field
//! carries an offset then clone through raw unconstructed shells and
//! need no default constructor at all.

pub mod core;

pub use crate::core::access::{AccessMode, access_mode, grant_raw_access};
pub use crate::core::adapters::{
    register_arc, register_arc_mutex, register_arc_rwlock, register_boxed, register_btree_map,
    register_btree_set, register_hash_map, register_hash_set, register_option, register_passthrough,
    register_value, register_vec, register_vec_deque,
};
pub use crate::core::config::{Cloner, UnsupportedField, clone_graph};
pub use crate::core::engine::CopyScope;
pub use crate::core::error::CloneError;
pub use crate::core::path::{FieldPath, PathSegment};
pub use crate::core::policy::{
    AnyRef, AnyValue, ChildSource, CompositeSpec, Policy, SharedSpec, TypeMatcher, register_policy,
};
pub use crate::core::shape::ShapeBuilder;
