//! Allocation strategy: produce an unpopulated shell of a shaped type
//! without running its constructors, so cloning never re-triggers
//! validation logic or construction side effects.
//!
//! Strategies in order: raw allocation of unconstructed memory (needs
//! the raw capability and offset coverage of every field), then the
//! registered default constructor, then failure. A failed allocation
//! aborts the whole operation; partial graphs are never returned.

use std::sync::Arc;

use crate::core::access::AccessMode;
use crate::core::error::CloneError;
use crate::core::path::FieldPath;
use crate::core::shape::TypeShape;
use crate::core::policy::AnyValue;

/// Raw, field-by-field initialized memory for one instance. Tracks
/// which fields were written so an aborted operation drops exactly the
/// state that exists.
pub(crate) struct RawShell {
    ptr: *mut u8,
    shape: Arc<TypeShape>,
    written: Vec<bool>,
}

// The allocation is exclusively owned by the shell and every field type
// was bounded by Send + Sync at registration.
unsafe impl Send for RawShell {}
unsafe impl Sync for RawShell {}

impl RawShell {
    pub(crate) fn alloc(shape: &Arc<TypeShape>) -> Result<Self, String> {
        let layout = shape.layout;
        let ptr = if layout.size() == 0 {
            std::ptr::NonNull::<u8>::dangling().as_ptr()
        } else {
            // Not zeroed: every field must be written before assembly.
            let ptr = unsafe { std::alloc::alloc(layout) };
            if ptr.is_null() {
                return Err(format!("allocator returned null for layout {layout:?}"));
            }
            ptr
        };
        Ok(RawShell {
            ptr,
            shape: shape.clone(),
            written: vec![false; shape.fields.len()],
        })
    }

    /// Writes the clone of field `ordinal` at its registered offset.
    /// Hands the value back on a runtime type mismatch.
    pub(crate) fn write(&mut self, ordinal: usize, value: AnyValue) -> Result<(), AnyValue> {
        let field = &self.shape.fields[ordinal];
        let Some(raw) = &field.raw else {
            // Raw shells are only allocated for raw-ready shapes.
            return Err(value);
        };
        if self.written[ordinal] {
            unsafe { (raw.drop_in_place)(self.ptr, raw.offset) };
            self.written[ordinal] = false;
        }
        unsafe { (raw.write)(self.ptr, raw.offset, value)? };
        self.written[ordinal] = true;
        Ok(())
    }

    /// Converts the fully written shell into an owned boxed value; on a
    /// gap, reports the first unwritten field name.
    pub(crate) fn assemble(self) -> Result<AnyValue, &'static str> {
        for (i, field) in self.shape.fields.iter().enumerate() {
            if !self.written[i] {
                return Err(field.name);
            }
        }
        // Ownership of the allocation moves into the assembled box. The
        // field-dropping Drop impl must not run, but the bookkeeping
        // fields still need their own destructors.
        let mut shell = std::mem::ManuallyDrop::new(self);
        let ptr = shell.ptr;
        let assemble = shell.shape.assemble;
        unsafe {
            std::ptr::drop_in_place(&mut shell.shape);
            std::ptr::drop_in_place(&mut shell.written);
        }
        Ok(unsafe { assemble(ptr) })
    }
}

impl Drop for RawShell {
    fn drop(&mut self) {
        for (i, field) in self.shape.fields.iter().enumerate() {
            if self.written[i]
                && let Some(raw) = &field.raw
            {
                unsafe { (raw.drop_in_place)(self.ptr, raw.offset) };
            }
        }
        if self.shape.layout.size() != 0 {
            unsafe { std::alloc::dealloc(self.ptr, self.shape.layout) };
        }
    }
}

/// Allocates a shell for a shaped type under the active mechanism.
pub(crate) fn allocate_struct(
    shape: &Arc<TypeShape>,
    mode: AccessMode,
    path: &FieldPath,
) -> Result<AnyValue, CloneError> {
    if mode == AccessMode::Raw && shape.raw_ready() {
        let shell = RawShell::alloc(shape).map_err(|reason| CloneError::AllocationFailure {
            type_name: shape.type_name,
            path: path.clone(),
            reason,
        })?;
        return Ok(Box::new(shell));
    }
    if let Some(default_fn) = &shape.default_fn {
        return Ok(default_fn());
    }
    let reason = if shape.raw_ready() {
        "no default constructor registered and the raw capability is not active".to_string()
    } else {
        "no default constructor registered and the shape is not fully offset-addressable"
            .to_string()
    };
    Err(CloneError::AllocationFailure {
        type_name: shape.type_name,
        path: path.clone(),
        reason,
    })
}
