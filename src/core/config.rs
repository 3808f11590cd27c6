//! Per-call configuration and the public clone entry points.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use crate::core::access;
use crate::core::engine::{self, CopyScope, OpCtx};
use crate::core::error::CloneError;
use crate::core::identity::IdentityMap;
use crate::core::path::FieldPath;
use crate::core::policy::{self, AnyRef, AnyValue, PolicyOverride, TypeMatcher};

/// What to do when a declared field cannot be read under the active
/// access mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsupportedField {
    /// Abort the operation; partial graphs are never returned.
    #[default]
    Fail,
    /// Leave the field at its shell default and keep going.
    SkipWithDefault,
}

/// Configured clone call. The zero-configuration path is the free
/// [`clone_graph`] function; the builder exists for parallelism,
/// deadlines and per-call policy overrides.
///
/// ```no_run
/// use std::time::Duration;
///
/// let cloner = mitosis::Cloner::new()
///     .parallelism(4)
///     .timeout(Duration::from_secs(5));
/// ```
#[derive(Default)]
pub struct Cloner {
    parallelism: usize,
    timeout: Option<Duration>,
    overrides: Vec<PolicyOverride>,
    on_unsupported_field: UnsupportedField,
}

impl Cloner {
    pub fn new() -> Self {
        Cloner::default()
    }

    /// Worker count for this call. `0` and `1` both mean sequential on
    /// the calling thread; higher values build a bounded pool that
    /// lives for the duration of the call.
    pub fn parallelism(mut self, workers: usize) -> Self {
        self.parallelism = workers;
        self
    }

    /// Deadline for the whole operation. A clone that overruns it is
    /// abandoned and reports [`CloneError::OperationAborted`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Per-call copy policy, outranking every process-wide
    /// registration for matching values. The function may delegate
    /// sub-values back into the engine through the scope it receives.
    pub fn override_policy<F>(mut self, matcher: TypeMatcher, copy: F) -> Self
    where
        F: Fn(
                AnyRef<'_>,
                &mut CopyScope<'_>,
            )
                -> Result<AnyValue, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.overrides.push(PolicyOverride {
            matcher,
            copy: Arc::new(copy),
        });
        self
    }

    pub fn on_unsupported_field(mut self, handling: UnsupportedField) -> Self {
        self.on_unsupported_field = handling;
        self
    }

    /// Deep copy of the graph reachable from `root`. The source is only
    /// read; the result is a fully populated, independently owned graph
    /// whose internal aliasing mirrors the source.
    pub fn clone_graph<T: Any + Send + Sync>(&self, root: &T) -> Result<T, CloneError> {
        let type_name = std::any::type_name::<T>();
        let pool = match self.parallelism {
            0 | 1 => None,
            workers => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .build()
                    .map_err(|err| CloneError::OperationAborted {
                        path: FieldPath::root(),
                        reason: format!("worker pool could not be built: {err}"),
                    })?,
            ),
        };
        let ctx = OpCtx {
            table: policy::snapshot(),
            overrides: self.overrides.clone(),
            identity: IdentityMap::default(),
            mode: access::access_mode(),
            on_unsupported: self.on_unsupported_field,
            deadline: self.timeout.map(|t| Instant::now() + t),
            cancelled: AtomicBool::new(false),
            pool,
        };
        let started = Instant::now();
        let out = engine::run_operation(&ctx, root, type_name)?;
        log::debug!(
            "cloned {type_name} in {:?} (parallelism {})",
            started.elapsed(),
            self.parallelism
        );
        match out.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) => Err(CloneError::FieldAccessFailure {
                type_name,
                path: FieldPath::root(),
                reason: "operation result has an unexpected type".to_string(),
            }),
        }
    }
}

/// Deep copy of `root` with default settings: sequential, no deadline,
/// no per-call overrides.
pub fn clone_graph<T: Any + Send + Sync>(root: &T) -> Result<T, CloneError> {
    Cloner::new().clone_graph(root)
}
