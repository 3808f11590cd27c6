//! Core modules of the cloning engine.
//!
//! Everything lives here: type descriptions, copy policies, the
//! identity map and the traversal machine itself.

pub mod access;
pub mod adapters;
pub mod alloc;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod path;
pub mod policy;
pub mod shape;
