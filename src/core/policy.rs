//! Copy policy registry: for any encountered value, resolve the policy
//! that knows how to copy it.
//!
//! Resolution is deterministic: per-call overrides outrank global user
//! overrides, which outrank built-ins; within each tier an exact
//! `TypeId` match outranks a predicate match (the predicate form is
//! this crate's analog of a type-and-subtypes scope). Built-ins are
//! keyed by exact `TypeId` and include the shape-backed generic struct
//! policy, which plays the total-fallback role: a type that resolves to
//! nothing at all has no registered description and is reported as an
//! allocation failure at its path.
//!
//! The global table is process-wide and read-mostly: operations take an
//! `Arc` snapshot, registration clones and swaps the table under a
//! write lock, and readers never block on registration beyond the swap.

use std::any::{Any, TypeId};
use std::sync::{Arc, OnceLock, RwLock};

use rustc_hash::FxHashMap;

use crate::core::access::AccessMode;
use crate::core::engine::CopyScope;
use crate::core::error::CloneError;
use crate::core::path::{FieldPath, PathSegment};

/// An owned, type-erased cloned value.
pub type AnyValue = Box<dyn Any + Send + Sync>;

/// A borrowed, type-erased view of a source node.
pub type AnyRef<'g> = &'g (dyn Any + Send + Sync);

/// One-shot copy function for self-contained values; `None` signals a
/// runtime type mismatch between the policy and the value.
pub type ValueFn = Arc<dyn Fn(AnyRef<'_>) -> Option<AnyValue> + Send + Sync>;

/// User-registered copy function. May delegate sub-objects back into
/// the engine through the scope.
pub type UserCopyFn = Arc<
    dyn Fn(AnyRef<'_>, &mut CopyScope<'_>) -> Result<AnyValue, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// Runtime-value predicate backing [`TypeMatcher::Predicate`].
pub type PredicateFn = Arc<dyn Fn(AnyRef<'_>) -> bool + Send + Sync>;

/// A child of a composite source, in deterministic enumeration order.
pub enum ChildSource<'g> {
    Read {
        segment: PathSegment,
        type_name: &'static str,
        value: AnyRef<'g>,
    },
    /// Declared state the active access mechanism cannot read.
    Unreadable {
        segment: PathSegment,
        reason: String,
    },
}

/// A type copied by allocating an unpopulated shell, cloning each child
/// and writing it into the shell by ordinal, then finishing the shell
/// into the real value. Structs, sequences, sets, maps, options and
/// boxes all fit this contract.
pub trait CompositeSpec: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Allocates an unpopulated shell for a clone of `src`.
    fn allocate(&self, src: AnyRef<'_>, mode: AccessMode, path: &FieldPath)
    -> Result<AnyValue, CloneError>;

    /// Enumerates the children of `src`. Ordinals index this list.
    fn children<'g>(&self, src: AnyRef<'g>, path: &FieldPath)
    -> Result<Vec<ChildSource<'g>>, CloneError>;

    /// Writes the clone of child `ordinal` into the shell.
    fn write_child(
        &self,
        shell: &mut AnyValue,
        ordinal: usize,
        value: AnyValue,
        path: &FieldPath,
    ) -> Result<(), CloneError>;

    /// Converts a populated shell into the finished value.
    fn finish(&self, shell: AnyValue, path: &FieldPath) -> Result<AnyValue, CloneError>;
}

/// A reference-counted handle whose target is cloned at most once per
/// operation, keyed by allocation identity.
pub trait SharedSpec: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Identity of the source allocation (stable while the source graph
    /// is borrowed). `None` when `src` is not the handle type this spec
    /// was registered for.
    fn identity(&self, src: AnyRef<'_>) -> Option<usize>;

    /// Duplicates a clone handle (refcount bump, never a deep copy).
    fn dup_handle(&self, handle: &(dyn Any + Send + Sync)) -> Option<AnyValue>;

    /// Creates a shell handle whose target can be populated after the
    /// handle already circulates, making cycles through it safe.
    /// Returns `None` for plain handles whose target must be cloned
    /// before any handle can exist.
    fn reserve(&self, path: &FieldPath) -> Result<Option<AnyValue>, CloneError>;

    /// Populates the target of a shell handle from the source target.
    fn populate<'g>(
        &self,
        src: AnyRef<'g>,
        shell: &(dyn Any + Send + Sync),
        scope: &mut CopyScope<'_>,
    ) -> Result<(), CloneError>;

    /// Clones the target first and wraps it in a fresh handle; used for
    /// plain handles where `reserve` returned `None`.
    fn clone_deferred<'g>(
        &self,
        src: AnyRef<'g>,
        scope: &mut CopyScope<'_>,
    ) -> Result<AnyValue, CloneError>;
}

/// Resolved copy policy for one runtime type.
#[derive(Clone)]
pub enum Policy {
    /// Shared, never duplicated: the clone is the same underlying
    /// allocation (interned constants, platform singletons).
    Passthrough(ValueFn),
    /// Self-contained value copied in one step.
    Value(ValueFn),
    /// Field-by-field or element-by-element composite.
    Composite(Arc<dyn CompositeSpec>),
    /// Identity-tracked shared handle.
    Shared(Arc<dyn SharedSpec>),
    /// User-registered override.
    Custom(UserCopyFn),
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Policy::Passthrough(_) => "Passthrough",
            Policy::Value(_) => "Value",
            Policy::Composite(_) => "Composite",
            Policy::Shared(_) => "Shared",
            Policy::Custom(_) => "Custom",
        })
    }
}

/// Matches the types a user policy applies to.
#[derive(Clone)]
pub enum TypeMatcher {
    Exact(TypeId),
    /// Open-ended match over the runtime value; ranks below every exact
    /// match of the same tier.
    Predicate(PredicateFn),
}

impl TypeMatcher {
    pub fn exact<T: Any>() -> Self {
        TypeMatcher::Exact(TypeId::of::<T>())
    }

    pub fn predicate(f: impl Fn(AnyRef<'_>) -> bool + Send + Sync + 'static) -> Self {
        TypeMatcher::Predicate(Arc::new(f))
    }

    fn matches(&self, src: AnyRef<'_>) -> bool {
        match self {
            TypeMatcher::Exact(id) => *id == src.type_id(),
            TypeMatcher::Predicate(f) => f(src),
        }
    }
}

/// Prioritized policy table; one global instance plus an optional
/// per-call override tier held in the operation context.
#[derive(Default, Clone)]
pub struct PolicyTable {
    user_exact: FxHashMap<TypeId, Policy>,
    user_predicates: Vec<(PredicateFn, Policy)>,
    builtin: FxHashMap<TypeId, Policy>,
}

impl PolicyTable {
    pub(crate) fn insert_user(&mut self, matcher: TypeMatcher, policy: Policy) {
        match matcher {
            TypeMatcher::Exact(id) => {
                self.user_exact.insert(id, policy);
            }
            TypeMatcher::Predicate(f) => self.user_predicates.push((f, policy)),
        }
    }

    pub(crate) fn insert_builtin(&mut self, id: TypeId, policy: Policy) {
        self.builtin.insert(id, policy);
    }

    fn lookup(&self, src: AnyRef<'_>) -> Option<Policy> {
        let id = src.type_id();
        if let Some(p) = self.user_exact.get(&id) {
            return Some(p.clone());
        }
        for (pred, p) in &self.user_predicates {
            if pred(src) {
                return Some(p.clone());
            }
        }
        self.builtin.get(&id).cloned()
    }
}

/// Per-call override: a matcher plus the copy function it selects.
#[derive(Clone)]
pub struct PolicyOverride {
    pub matcher: TypeMatcher,
    pub copy: UserCopyFn,
}

static REGISTRY: OnceLock<RwLock<Arc<PolicyTable>>> = OnceLock::new();

fn registry() -> &'static RwLock<Arc<PolicyTable>> {
    REGISTRY.get_or_init(|| {
        let mut table = PolicyTable::default();
        crate::core::adapters::install_primitives(&mut table);
        RwLock::new(Arc::new(table))
    })
}

/// Snapshot of the global table for one operation; later registrations
/// do not affect calls already in flight.
pub(crate) fn snapshot() -> Arc<PolicyTable> {
    registry()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn mutate(f: impl FnOnce(&mut PolicyTable)) {
    let lock = registry();
    let mut guard = lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut table = PolicyTable::clone(&guard);
    f(&mut table);
    *guard = Arc::new(table);
}

/// Registers a process-wide user copy policy. Takes effect for clone
/// calls made after registration; overrides outrank every built-in for
/// matching types.
pub fn register_policy<F>(matcher: TypeMatcher, copy: F)
where
    F: Fn(AnyRef<'_>, &mut CopyScope<'_>) -> Result<AnyValue, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync
        + 'static,
{
    log::debug!("registering user copy policy");
    mutate(|table| table.insert_user(matcher, Policy::Custom(Arc::new(copy))));
}

/// Registers a built-in policy under its exact `TypeId`. Used by the
/// shape registry and the container/handle adapters.
pub(crate) fn register_builtin(id: TypeId, policy: Policy) {
    mutate(|table| table.insert_builtin(id, policy));
}

/// Resolves the copy policy for `src`, total over every registered
/// type; an unregistered type is undescribable and reported as an
/// allocation failure.
pub(crate) fn resolve(
    overrides: &[PolicyOverride],
    table: &PolicyTable,
    src: AnyRef<'_>,
    type_name: &'static str,
    path: &FieldPath,
) -> Result<Policy, CloneError> {
    for o in overrides {
        if o.matcher.matches(src) {
            return Ok(Policy::Custom(o.copy.clone()));
        }
    }
    table.lookup(src).ok_or_else(|| CloneError::AllocationFailure {
        type_name,
        path: path.clone(),
        reason: "no copy policy, adapter or shape registered for this type".to_string(),
    })
}
