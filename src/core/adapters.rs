//! Built-in copy policies: pass-through handles, `Clone`-based values,
//! sequence/set/map adapters, `Option`/`Box` indirections, and the
//! identity-tracked shared handles (`Arc`, `Arc<Mutex<_>>`,
//! `Arc<RwLock<_>>`).
//!
//! Rust generics are open-ended, so container and handle policies are
//! registered per concrete instantiation by monomorphized registration
//! functions; primitive scalars are pre-installed when the registry is
//! first touched.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock};

use crate::core::access::AccessMode;
use crate::core::engine::CopyScope;
use crate::core::error::CloneError;
use crate::core::path::{FieldPath, PathSegment};
use crate::core::policy::{
    self, AnyRef, AnyValue, ChildSource, CompositeSpec, Policy, PolicyTable, SharedSpec, ValueFn,
};

fn mismatch(type_name: &'static str, path: &FieldPath, reason: &str) -> CloneError {
    CloneError::FieldAccessFailure {
        type_name,
        path: path.clone(),
        reason: reason.to_string(),
    }
}

fn value_fn<T: Clone + Any + Send + Sync>() -> ValueFn {
    Arc::new(|src| {
        src.downcast_ref::<T>()
            .map(|t| Box::new(t.clone()) as AnyValue)
    })
}

/// Registers `T` as a self-contained value copied via `Clone`.
pub fn register_value<T: Clone + Any + Send + Sync>() {
    policy::register_builtin(TypeId::of::<T>(), Policy::Value(value_fn::<T>()));
}

/// Registers `T` as a pass-through type: the clone shares the original
/// allocation (refcount bump for handles, bit copy for `Copy` data).
/// Use for interned constants and platform singletons that must never
/// be duplicated.
///
/// The sharing guarantee is exactly as strong as `T::clone`: it must be
/// identity-preserving, like `Arc`'s refcount bump. Registering a type
/// whose `Clone` allocates a fresh copy silently duplicates the value
/// instead of sharing it.
pub fn register_passthrough<T: Clone + Any + Send + Sync>() {
    policy::register_builtin(TypeId::of::<T>(), Policy::Passthrough(value_fn::<T>()));
}

pub(crate) fn install_primitives(table: &mut PolicyTable) {
    macro_rules! prim {
        ($($t:ty),* $(,)?) => {
            $( table.insert_builtin(TypeId::of::<$t>(), Policy::Value(value_fn::<$t>())); )*
        };
    }
    prim!(
        u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, (),
        String, &'static str,
    );
}

// ---- sequences and sets ----

/// Source-side view of a sequence-like container.
pub trait SeqSource<T>: Any + Send + Sync {
    fn len(&self) -> usize;
    fn iter_refs<'a>(&'a self) -> Box<dyn Iterator<Item = &'a T> + 'a>;
}

impl<T: Any + Send + Sync> SeqSource<T> for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }
    fn iter_refs<'a>(&'a self) -> Box<dyn Iterator<Item = &'a T> + 'a> {
        Box::new(self.iter())
    }
}

impl<T: Any + Send + Sync> SeqSource<T> for VecDeque<T> {
    fn len(&self) -> usize {
        VecDeque::len(self)
    }
    fn iter_refs<'a>(&'a self) -> Box<dyn Iterator<Item = &'a T> + 'a> {
        Box::new(self.iter())
    }
}

impl<T: Any + Send + Sync + Eq + Hash> SeqSource<T> for HashSet<T> {
    fn len(&self) -> usize {
        HashSet::len(self)
    }
    fn iter_refs<'a>(&'a self) -> Box<dyn Iterator<Item = &'a T> + 'a> {
        Box::new(self.iter())
    }
}

impl<T: Any + Send + Sync + Ord> SeqSource<T> for BTreeSet<T> {
    fn len(&self) -> usize {
        BTreeSet::len(self)
    }
    fn iter_refs<'a>(&'a self) -> Box<dyn Iterator<Item = &'a T> + 'a> {
        Box::new(self.iter())
    }
}

struct SeqShell<T> {
    slots: Vec<Option<T>>,
}

struct SeqSpec<C, T> {
    _marker: PhantomData<fn() -> (C, T)>,
}

impl<C, T> CompositeSpec for SeqSpec<C, T>
where
    C: SeqSource<T> + FromIterator<T>,
    T: Any + Send + Sync,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    fn allocate(
        &self,
        src: AnyRef<'_>,
        _mode: AccessMode,
        path: &FieldPath,
    ) -> Result<AnyValue, CloneError> {
        let seq = src
            .downcast_ref::<C>()
            .ok_or_else(|| mismatch(self.type_name(), path, "value does not match adapter type"))?;
        let slots = (0..seq.len()).map(|_| None).collect();
        Ok(Box::new(SeqShell::<T> { slots }))
    }

    fn children<'g>(
        &self,
        src: AnyRef<'g>,
        path: &FieldPath,
    ) -> Result<Vec<ChildSource<'g>>, CloneError> {
        let seq = src
            .downcast_ref::<C>()
            .ok_or_else(|| mismatch(self.type_name(), path, "value does not match adapter type"))?;
        Ok(seq
            .iter_refs()
            .enumerate()
            .map(|(i, value)| ChildSource::Read {
                segment: PathSegment::Index(i),
                type_name: std::any::type_name::<T>(),
                value,
            })
            .collect())
    }

    fn write_child(
        &self,
        shell: &mut AnyValue,
        ordinal: usize,
        value: AnyValue,
        path: &FieldPath,
    ) -> Result<(), CloneError> {
        let shell = shell
            .downcast_mut::<SeqShell<T>>()
            .ok_or_else(|| mismatch(self.type_name(), path, "shell has the wrong type"))?;
        let value = value
            .downcast::<T>()
            .map_err(|_| mismatch(self.type_name(), path, "element clone has the wrong type"))?;
        shell.slots[ordinal] = Some(*value);
        Ok(())
    }

    fn finish(&self, shell: AnyValue, path: &FieldPath) -> Result<AnyValue, CloneError> {
        let shell = shell
            .downcast::<SeqShell<T>>()
            .map_err(|_| mismatch(self.type_name(), path, "shell has the wrong type"))?;
        let items: Option<Vec<T>> = shell.slots.into_iter().collect();
        let items =
            items.ok_or_else(|| mismatch(self.type_name(), path, "element was never populated"))?;
        let collected: C = items.into_iter().collect();
        Ok(Box::new(collected))
    }
}

fn register_seq<C, T>()
where
    C: SeqSource<T> + FromIterator<T>,
    T: Any + Send + Sync,
{
    policy::register_builtin(
        TypeId::of::<C>(),
        Policy::Composite(Arc::new(SeqSpec::<C, T> {
            _marker: PhantomData,
        })),
    );
}

pub fn register_vec<T: Any + Send + Sync>() {
    register_seq::<Vec<T>, T>();
}

pub fn register_vec_deque<T: Any + Send + Sync>() {
    register_seq::<VecDeque<T>, T>();
}

pub fn register_hash_set<T: Any + Send + Sync + Eq + Hash>() {
    register_seq::<HashSet<T>, T>();
}

pub fn register_btree_set<T: Any + Send + Sync + Ord>() {
    register_seq::<BTreeSet<T>, T>();
}

// ---- key-value maps ----

/// Source-side view of a map-like container.
pub trait MapSource<K, V>: Any + Send + Sync {
    fn len(&self) -> usize;
    fn iter_pairs<'a>(&'a self) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a>;
}

impl<K: Any + Send + Sync + Eq + Hash, V: Any + Send + Sync> MapSource<K, V> for HashMap<K, V> {
    fn len(&self) -> usize {
        HashMap::len(self)
    }
    fn iter_pairs<'a>(&'a self) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a> {
        Box::new(self.iter())
    }
}

impl<K: Any + Send + Sync + Ord, V: Any + Send + Sync> MapSource<K, V> for BTreeMap<K, V> {
    fn len(&self) -> usize {
        BTreeMap::len(self)
    }
    fn iter_pairs<'a>(&'a self) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a> {
        Box::new(self.iter())
    }
}

struct MapShell<K, V> {
    pairs: Vec<(Option<K>, Option<V>)>,
}

struct MapSpec<M, K, V> {
    _marker: PhantomData<fn() -> (M, K, V)>,
}

impl<M, K, V> CompositeSpec for MapSpec<M, K, V>
where
    M: MapSource<K, V> + FromIterator<(K, V)>,
    K: Any + Send + Sync,
    V: Any + Send + Sync,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn allocate(
        &self,
        src: AnyRef<'_>,
        _mode: AccessMode,
        path: &FieldPath,
    ) -> Result<AnyValue, CloneError> {
        let map = src
            .downcast_ref::<M>()
            .ok_or_else(|| mismatch(self.type_name(), path, "value does not match adapter type"))?;
        let pairs = (0..map.len()).map(|_| (None, None)).collect();
        Ok(Box::new(MapShell::<K, V> { pairs }))
    }

    fn children<'g>(
        &self,
        src: AnyRef<'g>,
        path: &FieldPath,
    ) -> Result<Vec<ChildSource<'g>>, CloneError> {
        let map = src
            .downcast_ref::<M>()
            .ok_or_else(|| mismatch(self.type_name(), path, "value does not match adapter type"))?;
        let mut out = Vec::with_capacity(map.len() * 2);
        for (i, (key, value)) in map.iter_pairs().enumerate() {
            out.push(ChildSource::Read {
                segment: PathSegment::Key(i),
                type_name: std::any::type_name::<K>(),
                value: key,
            });
            out.push(ChildSource::Read {
                segment: PathSegment::Value(i),
                type_name: std::any::type_name::<V>(),
                value,
            });
        }
        Ok(out)
    }

    fn write_child(
        &self,
        shell: &mut AnyValue,
        ordinal: usize,
        value: AnyValue,
        path: &FieldPath,
    ) -> Result<(), CloneError> {
        let shell = shell
            .downcast_mut::<MapShell<K, V>>()
            .ok_or_else(|| mismatch(self.type_name(), path, "shell has the wrong type"))?;
        let pair = &mut shell.pairs[ordinal / 2];
        if ordinal % 2 == 0 {
            let key = value
                .downcast::<K>()
                .map_err(|_| mismatch(self.type_name(), path, "key clone has the wrong type"))?;
            pair.0 = Some(*key);
        } else {
            let value = value
                .downcast::<V>()
                .map_err(|_| mismatch(self.type_name(), path, "value clone has the wrong type"))?;
            pair.1 = Some(*value);
        }
        Ok(())
    }

    fn finish(&self, shell: AnyValue, path: &FieldPath) -> Result<AnyValue, CloneError> {
        let shell = shell
            .downcast::<MapShell<K, V>>()
            .map_err(|_| mismatch(self.type_name(), path, "shell has the wrong type"))?;
        // Keys and values were cloned before insertion; rebuilding the
        // map here keys every entry under its cloned key.
        let mut pairs = Vec::with_capacity(shell.pairs.len());
        for (key, value) in shell.pairs {
            match (key, value) {
                (Some(key), Some(value)) => pairs.push((key, value)),
                _ => {
                    return Err(mismatch(self.type_name(), path, "entry was never populated"));
                }
            }
        }
        let collected: M = pairs.into_iter().collect();
        Ok(Box::new(collected))
    }
}

fn register_map_source<M, K, V>()
where
    M: MapSource<K, V> + FromIterator<(K, V)>,
    K: Any + Send + Sync,
    V: Any + Send + Sync,
{
    policy::register_builtin(
        TypeId::of::<M>(),
        Policy::Composite(Arc::new(MapSpec::<M, K, V> {
            _marker: PhantomData,
        })),
    );
}

pub fn register_hash_map<K, V>()
where
    K: Any + Send + Sync + Eq + Hash,
    V: Any + Send + Sync,
{
    register_map_source::<HashMap<K, V>, K, V>();
}

pub fn register_btree_map<K, V>()
where
    K: Any + Send + Sync + Ord,
    V: Any + Send + Sync,
{
    register_map_source::<BTreeMap<K, V>, K, V>();
}

// ---- option and box indirections ----

struct OptionShell<T> {
    expect_some: bool,
    value: Option<T>,
}

struct OptionSpec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> CompositeSpec for OptionSpec<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Option<T>>()
    }

    fn allocate(
        &self,
        src: AnyRef<'_>,
        _mode: AccessMode,
        path: &FieldPath,
    ) -> Result<AnyValue, CloneError> {
        let opt = src
            .downcast_ref::<Option<T>>()
            .ok_or_else(|| mismatch(self.type_name(), path, "value does not match adapter type"))?;
        Ok(Box::new(OptionShell::<T> {
            expect_some: opt.is_some(),
            value: None,
        }))
    }

    fn children<'g>(
        &self,
        src: AnyRef<'g>,
        path: &FieldPath,
    ) -> Result<Vec<ChildSource<'g>>, CloneError> {
        let opt = src
            .downcast_ref::<Option<T>>()
            .ok_or_else(|| mismatch(self.type_name(), path, "value does not match adapter type"))?;
        Ok(match opt {
            Some(value) => vec![ChildSource::Read {
                segment: PathSegment::Index(0),
                type_name: std::any::type_name::<T>(),
                value,
            }],
            None => Vec::new(),
        })
    }

    fn write_child(
        &self,
        shell: &mut AnyValue,
        _ordinal: usize,
        value: AnyValue,
        path: &FieldPath,
    ) -> Result<(), CloneError> {
        let shell = shell
            .downcast_mut::<OptionShell<T>>()
            .ok_or_else(|| mismatch(self.type_name(), path, "shell has the wrong type"))?;
        let value = value
            .downcast::<T>()
            .map_err(|_| mismatch(self.type_name(), path, "inner clone has the wrong type"))?;
        shell.value = Some(*value);
        Ok(())
    }

    fn finish(&self, shell: AnyValue, path: &FieldPath) -> Result<AnyValue, CloneError> {
        let shell = shell
            .downcast::<OptionShell<T>>()
            .map_err(|_| mismatch(self.type_name(), path, "shell has the wrong type"))?;
        if shell.expect_some && shell.value.is_none() {
            return Err(mismatch(self.type_name(), path, "inner value was never populated"));
        }
        Ok(Box::new(shell.value))
    }
}

pub fn register_option<T: Any + Send + Sync>() {
    policy::register_builtin(
        TypeId::of::<Option<T>>(),
        Policy::Composite(Arc::new(OptionSpec::<T> {
            _marker: PhantomData,
        })),
    );
}

struct BoxShell<T> {
    value: Option<T>,
}

struct BoxSpec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> CompositeSpec for BoxSpec<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Box<T>>()
    }

    fn allocate(
        &self,
        _src: AnyRef<'_>,
        _mode: AccessMode,
        _path: &FieldPath,
    ) -> Result<AnyValue, CloneError> {
        Ok(Box::new(BoxShell::<T> { value: None }))
    }

    fn children<'g>(
        &self,
        src: AnyRef<'g>,
        path: &FieldPath,
    ) -> Result<Vec<ChildSource<'g>>, CloneError> {
        let boxed = src
            .downcast_ref::<Box<T>>()
            .ok_or_else(|| mismatch(self.type_name(), path, "value does not match adapter type"))?;
        Ok(vec![ChildSource::Read {
            segment: PathSegment::Deref,
            type_name: std::any::type_name::<T>(),
            value: boxed.as_ref(),
        }])
    }

    fn write_child(
        &self,
        shell: &mut AnyValue,
        _ordinal: usize,
        value: AnyValue,
        path: &FieldPath,
    ) -> Result<(), CloneError> {
        let shell = shell
            .downcast_mut::<BoxShell<T>>()
            .ok_or_else(|| mismatch(self.type_name(), path, "shell has the wrong type"))?;
        let value = value
            .downcast::<T>()
            .map_err(|_| mismatch(self.type_name(), path, "target clone has the wrong type"))?;
        shell.value = Some(*value);
        Ok(())
    }

    fn finish(&self, shell: AnyValue, path: &FieldPath) -> Result<AnyValue, CloneError> {
        let shell = shell
            .downcast::<BoxShell<T>>()
            .map_err(|_| mismatch(self.type_name(), path, "shell has the wrong type"))?;
        let value = shell
            .value
            .ok_or_else(|| mismatch(self.type_name(), path, "target was never populated"))?;
        Ok(Box::new(Box::new(value)))
    }
}

pub fn register_boxed<T: Any + Send + Sync>() {
    policy::register_builtin(
        TypeId::of::<Box<T>>(),
        Policy::Composite(Arc::new(BoxSpec::<T> {
            _marker: PhantomData,
        })),
    );
}

// ---- shared handles ----

/// Plain `Arc<T>`: targets are immutable through the handle, so sharing
/// is acyclic and the target clone can be built before the new handle
/// exists. A cycle through one (possible via interior mutability deeper
/// down) is detected and reported rather than looping.
struct PlainArcSpec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> SharedSpec for PlainArcSpec<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Arc<T>>()
    }

    fn identity(&self, src: AnyRef<'_>) -> Option<usize> {
        src.downcast_ref::<Arc<T>>()
            .map(|arc| Arc::as_ptr(arc) as usize)
    }

    fn dup_handle(&self, handle: &(dyn Any + Send + Sync)) -> Option<AnyValue> {
        handle
            .downcast_ref::<Arc<T>>()
            .map(|arc| Box::new(arc.clone()) as AnyValue)
    }

    fn reserve(&self, _path: &FieldPath) -> Result<Option<AnyValue>, CloneError> {
        Ok(None)
    }

    fn populate<'g>(
        &self,
        _src: AnyRef<'g>,
        _shell: &(dyn Any + Send + Sync),
        _scope: &mut CopyScope<'_>,
    ) -> Result<(), CloneError> {
        // Plain handles never reserve a shell; nothing to populate.
        Ok(())
    }

    fn clone_deferred<'g>(
        &self,
        src: AnyRef<'g>,
        scope: &mut CopyScope<'_>,
    ) -> Result<AnyValue, CloneError> {
        let arc = src.downcast_ref::<Arc<T>>().ok_or_else(|| {
            mismatch(self.type_name(), scope.path(), "value does not match adapter type")
        })?;
        let target: &T = arc.as_ref();
        let clone = scope.copy(target)?;
        let clone = clone.downcast::<T>().map_err(|_| {
            mismatch(self.type_name(), scope.path(), "target clone has the wrong type")
        })?;
        Ok(Box::new(Arc::new(*clone)))
    }
}

/// Registers the plain shared handle `Arc<T>`.
pub fn register_arc<T: Any + Send + Sync>() {
    policy::register_builtin(
        TypeId::of::<Arc<T>>(),
        Policy::Shared(Arc::new(PlainArcSpec::<T> {
            _marker: PhantomData,
        })),
    );
}

/// `Arc<Mutex<T>>`: the recommended graph-node form. The shell handle
/// exists before its target is populated, so cycles and shared
/// references through it resolve safely.
struct MutexArcSpec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync + Default> SharedSpec for MutexArcSpec<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Arc<Mutex<T>>>()
    }

    fn identity(&self, src: AnyRef<'_>) -> Option<usize> {
        src.downcast_ref::<Arc<Mutex<T>>>()
            .map(|arc| Arc::as_ptr(arc) as usize)
    }

    fn dup_handle(&self, handle: &(dyn Any + Send + Sync)) -> Option<AnyValue> {
        handle
            .downcast_ref::<Arc<Mutex<T>>>()
            .map(|arc| Box::new(arc.clone()) as AnyValue)
    }

    fn reserve(&self, _path: &FieldPath) -> Result<Option<AnyValue>, CloneError> {
        Ok(Some(Box::new(Arc::new(Mutex::new(T::default())))))
    }

    fn populate<'g>(
        &self,
        src: AnyRef<'g>,
        shell: &(dyn Any + Send + Sync),
        scope: &mut CopyScope<'_>,
    ) -> Result<(), CloneError> {
        let src_arc = src.downcast_ref::<Arc<Mutex<T>>>().ok_or_else(|| {
            mismatch(self.type_name(), scope.path(), "value does not match adapter type")
        })?;
        let shell_arc = shell.downcast_ref::<Arc<Mutex<T>>>().ok_or_else(|| {
            mismatch(self.type_name(), scope.path(), "shell handle has the wrong type")
        })?;
        // The source lock is held while this node's subtree is copied,
        // mirroring the per-original synchronization of parallel mode.
        let guard = src_arc.lock().map_err(|_| {
            mismatch(self.type_name(), scope.path(), "source mutex poisoned")
        })?;
        let clone = scope.copy(&*guard)?;
        drop(guard);
        let clone = clone.downcast::<T>().map_err(|_| {
            mismatch(self.type_name(), scope.path(), "target clone has the wrong type")
        })?;
        let mut shell_guard = shell_arc.lock().map_err(|_| {
            mismatch(self.type_name(), scope.path(), "shell mutex poisoned")
        })?;
        *shell_guard = *clone;
        Ok(())
    }

    fn clone_deferred<'g>(
        &self,
        src: AnyRef<'g>,
        scope: &mut CopyScope<'_>,
    ) -> Result<AnyValue, CloneError> {
        let shell: AnyValue = Box::new(Arc::new(Mutex::new(T::default())));
        self.populate(src, shell.as_ref(), scope)?;
        Ok(shell)
    }
}

/// Registers the cycle-capable shared node `Arc<Mutex<T>>`.
pub fn register_arc_mutex<T: Any + Send + Sync + Default>() {
    policy::register_builtin(
        TypeId::of::<Arc<Mutex<T>>>(),
        Policy::Shared(Arc::new(MutexArcSpec::<T> {
            _marker: PhantomData,
        })),
    );
}

/// `Arc<RwLock<T>>`: like the mutex form, read-locking the source.
struct RwLockArcSpec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync + Default> SharedSpec for RwLockArcSpec<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Arc<RwLock<T>>>()
    }

    fn identity(&self, src: AnyRef<'_>) -> Option<usize> {
        src.downcast_ref::<Arc<RwLock<T>>>()
            .map(|arc| Arc::as_ptr(arc) as usize)
    }

    fn dup_handle(&self, handle: &(dyn Any + Send + Sync)) -> Option<AnyValue> {
        handle
            .downcast_ref::<Arc<RwLock<T>>>()
            .map(|arc| Box::new(arc.clone()) as AnyValue)
    }

    fn reserve(&self, _path: &FieldPath) -> Result<Option<AnyValue>, CloneError> {
        Ok(Some(Box::new(Arc::new(RwLock::new(T::default())))))
    }

    fn populate<'g>(
        &self,
        src: AnyRef<'g>,
        shell: &(dyn Any + Send + Sync),
        scope: &mut CopyScope<'_>,
    ) -> Result<(), CloneError> {
        let src_arc = src.downcast_ref::<Arc<RwLock<T>>>().ok_or_else(|| {
            mismatch(self.type_name(), scope.path(), "value does not match adapter type")
        })?;
        let shell_arc = shell.downcast_ref::<Arc<RwLock<T>>>().ok_or_else(|| {
            mismatch(self.type_name(), scope.path(), "shell handle has the wrong type")
        })?;
        let guard = src_arc.read().map_err(|_| {
            mismatch(self.type_name(), scope.path(), "source rwlock poisoned")
        })?;
        let clone = scope.copy(&*guard)?;
        drop(guard);
        let clone = clone.downcast::<T>().map_err(|_| {
            mismatch(self.type_name(), scope.path(), "target clone has the wrong type")
        })?;
        let mut shell_guard = shell_arc.write().map_err(|_| {
            mismatch(self.type_name(), scope.path(), "shell rwlock poisoned")
        })?;
        *shell_guard = *clone;
        Ok(())
    }

    fn clone_deferred<'g>(
        &self,
        src: AnyRef<'g>,
        scope: &mut CopyScope<'_>,
    ) -> Result<AnyValue, CloneError> {
        let shell: AnyValue = Box::new(Arc::new(RwLock::new(T::default())));
        self.populate(src, shell.as_ref(), scope)?;
        Ok(shell)
    }
}

/// Registers the cycle-capable shared node `Arc<RwLock<T>>`.
pub fn register_arc_rwlock<T: Any + Send + Sync + Default>() {
    policy::register_builtin(
        TypeId::of::<Arc<RwLock<T>>>(),
        Policy::Shared(Arc::new(RwLockArcSpec::<T> {
            _marker: PhantomData,
        })),
    );
}
