//! The clone engine: an iterative traversal machine over type-erased
//! values.
//!
//! Owned Rust values cannot be mutated once moved into their parents,
//! so the machine populates an arena of unfinished shells first and
//! assembles parents from finished children afterwards. Each composite
//! node becomes a shell slot plus a writeback recording where the
//! finished value belongs; writebacks execute deepest-first at
//! finalize, which is sufficient because owned values cannot form
//! cycles. Cyclic structure is only expressible through shared handles,
//! and those resolve through the per-operation identity map instead of
//! the writeback list.
//!
//! Sequential mode drives a FIFO queue on the calling thread. Parallel
//! mode spawns one task per composite node on a bounded pool; the first
//! failure trips a cancellation flag, remaining tasks drain without
//! effect, and finalize never runs. Both modes produce the same value.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::core::access::AccessMode;
use crate::core::config::UnsupportedField;
use crate::core::error::CloneError;
use crate::core::identity::{IdentityMap, Reservation};
use crate::core::path::{FieldPath, PathSegment};
use crate::core::policy::{
    self, AnyRef, AnyValue, ChildSource, CompositeSpec, Policy, PolicyOverride, PolicyTable,
    SharedSpec,
};

/// Everything one top-level clone call shares across its tasks and any
/// nested sub-operations started by shared handles or user policies.
pub(crate) struct OpCtx {
    pub(crate) table: Arc<PolicyTable>,
    pub(crate) overrides: Vec<PolicyOverride>,
    pub(crate) identity: IdentityMap,
    pub(crate) mode: AccessMode,
    pub(crate) on_unsupported: UnsupportedField,
    pub(crate) deadline: Option<Instant>,
    pub(crate) cancelled: AtomicBool,
    pub(crate) pool: Option<rayon::ThreadPool>,
}

impl OpCtx {
    fn check_abort(&self, path: &FieldPath) -> Result<(), CloneError> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(CloneError::OperationAborted {
                path: path.clone(),
                reason: "a concurrent task failed".to_string(),
            });
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            self.cancelled.store(true, Ordering::Relaxed);
            return Err(CloneError::OperationAborted {
                path: path.clone(),
                reason: "deadline exceeded".to_string(),
            });
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Where a finished clone belongs.
#[derive(Clone, Copy)]
enum Dest {
    /// The operation result.
    Root,
    /// Child `child` of the shell in slot `slot`.
    Slot { slot: usize, child: usize },
}

/// An unfinished composite clone.
struct ShellSlot {
    spec: Arc<dyn CompositeSpec>,
    path: FieldPath,
    shell: Mutex<Option<AnyValue>>,
}

/// Deferred move of a finished slot into its destination.
struct Writeback {
    slot: usize,
    dest: Dest,
    depth: usize,
}

/// One unit of work: enumerate the children of a composite source and
/// dispatch each one.
struct Task<'g> {
    src: AnyRef<'g>,
    spec: Arc<dyn CompositeSpec>,
    slot: usize,
    path: FieldPath,
    depth: usize,
}

/// One traversal run. Nested sub-operations get their own machine over
/// the same context, so the identity map spans all of them.
pub(crate) struct Machine<'c> {
    ctx: &'c OpCtx,
    slots: Mutex<Vec<Arc<ShellSlot>>>,
    writebacks: Mutex<Vec<Writeback>>,
    out: Mutex<Option<AnyValue>>,
    first_error: Mutex<Option<CloneError>>,
}

impl<'c> Machine<'c> {
    pub(crate) fn new(ctx: &'c OpCtx) -> Self {
        Machine {
            ctx,
            slots: Mutex::new(Vec::new()),
            writebacks: Mutex::new(Vec::new()),
            out: Mutex::new(None),
            first_error: Mutex::new(None),
        }
    }

    /// Runs a full operation rooted at `src` and returns the finished
    /// clone. `parallel` engages the context's pool; nested
    /// sub-operations always run sequentially on the calling thread.
    pub(crate) fn run<'g>(
        &self,
        src: AnyRef<'g>,
        type_name: &'static str,
        root: FieldPath,
        parallel: bool,
    ) -> Result<AnyValue, CloneError> {
        match (parallel, &self.ctx.pool) {
            (true, Some(pool)) => self.drive_parallel(pool, src, type_name, &root)?,
            _ => self.drive_sequential(src, type_name, &root)?,
        }
        self.finalize()?;
        let taken = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        taken.ok_or_else(|| CloneError::FieldAccessFailure {
            type_name,
            path: root,
            reason: "operation finished without producing a result".to_string(),
        })
    }

    fn drive_sequential<'g>(
        &self,
        src: AnyRef<'g>,
        type_name: &'static str,
        root: &FieldPath,
    ) -> Result<(), CloneError> {
        let mut queue: VecDeque<Task<'g>> = VecDeque::new();
        let mut staged = Vec::new();
        self.dispatch(src, type_name, root.clone(), 0, Dest::Root, &mut staged)?;
        queue.extend(staged);
        while let Some(task) = queue.pop_front() {
            let mut staged = Vec::new();
            self.run_task(&task, &mut staged)?;
            queue.extend(staged);
        }
        Ok(())
    }

    fn drive_parallel<'g>(
        &self,
        pool: &rayon::ThreadPool,
        src: AnyRef<'g>,
        type_name: &'static str,
        root: &FieldPath,
    ) -> Result<(), CloneError> {
        pool.scope(|scope| {
            let mut staged = Vec::new();
            match self.dispatch(src, type_name, root.clone(), 0, Dest::Root, &mut staged) {
                Ok(()) => {
                    for task in staged {
                        self.spawn_task(scope, task);
                    }
                }
                Err(err) => self.record_failure(err),
            }
        });
        let first = self
            .first_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn spawn_task<'s, 'g>(&'s self, scope: &rayon::Scope<'s>, task: Task<'g>)
    where
        'g: 's,
        'c: 's,
    {
        scope.spawn(move |scope| {
            if self.ctx.is_cancelled() {
                return;
            }
            let mut staged = Vec::new();
            match self.run_task(&task, &mut staged) {
                Ok(()) => {
                    for next in staged {
                        self.spawn_task(scope, next);
                    }
                }
                Err(err) => self.record_failure(err),
            }
        });
    }

    fn record_failure(&self, err: CloneError) {
        self.ctx.cancelled.store(true, Ordering::Relaxed);
        let mut first = self
            .first_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if first.is_none() {
            log::debug!("clone operation failing: {err}");
            *first = Some(err);
        }
    }

    /// Enumerates the children of one composite source and dispatches
    /// each one into the shell at `task.slot`.
    fn run_task<'g>(&self, task: &Task<'g>, staged: &mut Vec<Task<'g>>) -> Result<(), CloneError> {
        self.ctx.check_abort(&task.path)?;
        let children = task.spec.children(task.src, &task.path)?;
        for (ordinal, child) in children.into_iter().enumerate() {
            match child {
                ChildSource::Read {
                    segment,
                    type_name,
                    value,
                } => {
                    let dest = Dest::Slot {
                        slot: task.slot,
                        child: ordinal,
                    };
                    self.dispatch(
                        value,
                        type_name,
                        task.path.child(segment),
                        task.depth + 1,
                        dest,
                        staged,
                    )?;
                }
                ChildSource::Unreadable { segment, reason } => match self.ctx.on_unsupported {
                    UnsupportedField::Fail => {
                        return Err(CloneError::FieldAccessFailure {
                            type_name: task.spec.type_name(),
                            path: task.path.child(segment),
                            reason,
                        });
                    }
                    UnsupportedField::SkipWithDefault => {
                        log::warn!(
                            "skipping unreadable field at {}: {reason}",
                            task.path.child(segment)
                        );
                    }
                },
            }
        }
        Ok(())
    }

    /// Resolves the policy for one source value and either produces its
    /// clone immediately or stages a composite task.
    fn dispatch<'g>(
        &self,
        src: AnyRef<'g>,
        type_name: &'static str,
        path: FieldPath,
        depth: usize,
        dest: Dest,
        staged: &mut Vec<Task<'g>>,
    ) -> Result<(), CloneError> {
        self.ctx.check_abort(&path)?;
        let policy = policy::resolve(&self.ctx.overrides, &self.ctx.table, src, type_name, &path)?;
        match policy {
            Policy::Passthrough(copy) | Policy::Value(copy) => {
                let value = copy(src).ok_or_else(|| CloneError::FieldAccessFailure {
                    type_name,
                    path: path.clone(),
                    reason: "value does not match its registered policy".to_string(),
                })?;
                self.write_direct(dest, value, &path)
            }
            Policy::Custom(copy) => {
                let mut scope = CopyScope {
                    ctx: self.ctx,
                    path: path.clone(),
                };
                let value = match copy(src, &mut scope) {
                    Ok(value) => value,
                    Err(source) => {
                        // A failure of a nested engine call keeps its own
                        // variant instead of being rewrapped.
                        return Err(match source.downcast::<CloneError>() {
                            Ok(inner) => *inner,
                            Err(source) => CloneError::UserPolicyFailure { path, source },
                        });
                    }
                };
                self.write_direct(dest, value, &path)
            }
            Policy::Shared(spec) => self.dispatch_shared(&spec, src, type_name, path, dest),
            Policy::Composite(spec) => {
                let shell = spec.allocate(src, self.ctx.mode, &path)?;
                let slot = {
                    let mut slots = self
                        .slots
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    slots.push(Arc::new(ShellSlot {
                        spec: spec.clone(),
                        path: path.clone(),
                        shell: Mutex::new(Some(shell)),
                    }));
                    slots.len() - 1
                };
                self.writebacks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(Writeback { slot, dest, depth });
                staged.push(Task {
                    src,
                    spec,
                    slot,
                    path,
                    depth,
                });
                Ok(())
            }
        }
    }

    /// Identity-tracked handling of a shared handle. The clone handle
    /// for a given source identity is created exactly once; every other
    /// occurrence reuses it, which is what preserves aliasing and makes
    /// cycles terminate.
    fn dispatch_shared(
        &self,
        spec: &Arc<dyn SharedSpec>,
        src: AnyRef<'_>,
        type_name: &'static str,
        path: FieldPath,
        dest: Dest,
    ) -> Result<(), CloneError> {
        let key = spec
            .identity(src)
            .ok_or_else(|| CloneError::FieldAccessFailure {
                type_name,
                path: path.clone(),
                reason: "value does not match its registered handle policy".to_string(),
            })?;
        let reservation = self
            .ctx
            .identity
            .reserve(key, spec.as_ref(), || self.ctx.is_cancelled());
        match reservation {
            Reservation::Existing(dup) => self.write_direct(dest, dup, &path),
            Reservation::Cancelled => Err(CloneError::OperationAborted {
                path,
                reason: "a concurrent task failed".to_string(),
            }),
            Reservation::SelfCycle => Err(CloneError::AllocationFailure {
                type_name,
                path,
                reason: "cycle through a plain shared handle; only handles with interior \
                         mutability can exist before their target does"
                    .to_string(),
            }),
            Reservation::Owner => {
                // The owner allocates; every losing racer reuses, so no
                // clone handle is ever created twice per identity.
                let outcome = self.populate_reserved(spec, src, type_name, &path, dest, key);
                if outcome.is_err() {
                    self.ctx.identity.fail(key);
                }
                outcome
            }
        }
    }

    /// Owner side of a shared-handle reservation: allocate the shell
    /// (if the handle kind supports one), publish it, populate the
    /// target, mark the entry populated. The caller clears the
    /// reservation on error.
    fn populate_reserved(
        &self,
        spec: &Arc<dyn SharedSpec>,
        src: AnyRef<'_>,
        type_name: &'static str,
        path: &FieldPath,
        dest: Dest,
        key: usize,
    ) -> Result<(), CloneError> {
        match spec.reserve(path)? {
            Some(handle) => {
                let shell_mismatch = || CloneError::FieldAccessFailure {
                    type_name,
                    path: path.clone(),
                    reason: "shell handle does not match its policy".to_string(),
                };
                let populate_handle =
                    spec.dup_handle(handle.as_ref()).ok_or_else(shell_mismatch)?;
                let dest_handle = spec.dup_handle(handle.as_ref()).ok_or_else(shell_mismatch)?;
                // The shell handle circulates before its target exists,
                // so a cycle back to this node resolves to it.
                self.ctx.identity.promote(key, handle);
                self.write_direct(dest, dest_handle, path)?;
                let mut scope = CopyScope {
                    ctx: self.ctx,
                    path: path.child(PathSegment::Deref),
                };
                spec.populate(src, populate_handle.as_ref(), &mut scope)?;
                self.ctx.identity.complete(key, None);
                Ok(())
            }
            None => {
                // Plain handle: the target clone must exist before any
                // handle can, so clone it through a nested operation.
                let mut scope = CopyScope {
                    ctx: self.ctx,
                    path: path.clone(),
                };
                let handle = spec.clone_deferred(src, &mut scope)?;
                let dup = spec.dup_handle(handle.as_ref()).ok_or_else(|| {
                    CloneError::FieldAccessFailure {
                        type_name,
                        path: path.clone(),
                        reason: "cloned handle does not match its policy".to_string(),
                    }
                })?;
                self.write_direct(dest, dup, path)?;
                self.ctx.identity.complete(key, Some(handle));
                Ok(())
            }
        }
    }

    /// Writes a finished clone into its destination: either the
    /// operation result or a child ordinal of an unfinished shell.
    fn write_direct(
        &self,
        dest: Dest,
        value: AnyValue,
        path: &FieldPath,
    ) -> Result<(), CloneError> {
        match dest {
            Dest::Root => {
                let mut out = self
                    .out
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *out = Some(value);
                Ok(())
            }
            Dest::Slot { slot, child } => {
                let slot = {
                    let slots = self
                        .slots
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    slots[slot].clone()
                };
                let mut shell = slot
                    .shell
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match shell.as_mut() {
                    Some(shell) => slot.spec.write_child(shell, child, value, &slot.path),
                    None => Err(CloneError::FieldAccessFailure {
                        type_name: slot.spec.type_name(),
                        path: path.clone(),
                        reason: "destination shell was already finished".to_string(),
                    }),
                }
            }
        }
    }

    /// Finishes every shell and moves it into its destination, deepest
    /// slots first so children complete before their parents consume
    /// them. Runs single-threaded after all tasks have drained.
    fn finalize(&self) -> Result<(), CloneError> {
        let mut writebacks = std::mem::take(
            &mut *self
                .writebacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        writebacks.sort_by_key(|wb| std::cmp::Reverse(wb.depth));
        for wb in writebacks {
            let slot = {
                let slots = self
                    .slots
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                slots[wb.slot].clone()
            };
            let shell = slot
                .shell
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
                .ok_or_else(|| CloneError::FieldAccessFailure {
                    type_name: slot.spec.type_name(),
                    path: slot.path.clone(),
                    reason: "shell was finished twice".to_string(),
                })?;
            let finished = slot.spec.finish(shell, &slot.path)?;
            self.write_direct(wb.dest, finished, &slot.path)?;
        }
        Ok(())
    }
}

/// Handle into the engine for user policies and shared-handle
/// population: nested copies started through it join the surrounding
/// operation, sharing its identity map, deadline and policy table.
pub struct CopyScope<'c> {
    ctx: &'c OpCtx,
    path: FieldPath,
}

impl CopyScope<'_> {
    /// The path of the value the active policy was invoked for.
    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Clones a sub-value under the surrounding operation. A shared
    /// handle already cloned elsewhere in the operation resolves to the
    /// same clone handle here.
    pub fn copy(&mut self, src: AnyRef<'_>) -> Result<AnyValue, CloneError> {
        let machine = Machine::new(self.ctx);
        machine.run(src, "value", self.path.clone(), false)
    }
}

/// Entry point used by the public clone calls.
pub(crate) fn run_operation(
    ctx: &OpCtx,
    src: AnyRef<'_>,
    type_name: &'static str,
) -> Result<AnyValue, CloneError> {
    let machine = Machine::new(ctx);
    machine.run(src, type_name, FieldPath::root(), true)
}
