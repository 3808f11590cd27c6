//! Registered type shapes: the per-type field descriptions the generic
//! struct policy copies from.
//!
//! A shape is produced once per distinct type and cached for the
//! process lifetime; type layout does not change between calls. Each
//! field carries up to two access routes — safe projection closures and
//! a raw offset vtable — and the active [`AccessMode`] decides which
//! one get/set goes through.

use std::alloc::Layout;
use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::access::AccessMode;
use crate::core::alloc::{self, RawShell};
use crate::core::error::CloneError;
use crate::core::path::{FieldPath, PathSegment};
use crate::core::policy::{self, AnyRef, AnyValue, ChildSource, CompositeSpec, Policy};

/// Type-erased borrow of one field out of a shape's type.
pub(crate) trait FieldGet: Send + Sync {
    fn get<'a>(&self, obj: &'a (dyn Any + Send + Sync)) -> Option<&'a (dyn Any + Send + Sync)>;
}

struct ProjGet<T, F, G> {
    proj: G,
    _marker: PhantomData<fn(&T) -> &F>,
}

impl<T, F, G> FieldGet for ProjGet<T, F, G>
where
    T: Any + Send + Sync,
    F: Any + Send + Sync,
    G: for<'x> Fn(&'x T) -> &'x F + Send + Sync,
{
    fn get<'a>(&self, obj: &'a (dyn Any + Send + Sync)) -> Option<&'a (dyn Any + Send + Sync)> {
        obj.downcast_ref::<T>()
            .map(|t| (self.proj)(t) as &(dyn Any + Send + Sync))
    }
}

/// Type-erased setter; hands the value back on a runtime type mismatch.
pub(crate) type SetFn =
    Box<dyn Fn(&mut (dyn Any + Send + Sync), AnyValue) -> Result<(), AnyValue> + Send + Sync>;

/// Offset-based access route, monomorphized per field type at
/// registration.
pub(crate) struct RawFieldVtable {
    pub(crate) offset: usize,
    pub(crate) field_type_id: TypeId,
    pub(crate) get_ref: unsafe fn(*const u8, usize) -> *const (dyn Any + Send + Sync),
    pub(crate) write: unsafe fn(*mut u8, usize, AnyValue) -> Result<(), AnyValue>,
    pub(crate) drop_in_place: unsafe fn(*mut u8, usize),
}

unsafe fn raw_get_ref<F: Any + Send + Sync>(
    base: *const u8,
    offset: usize,
) -> *const (dyn Any + Send + Sync) {
    unsafe { base.add(offset) }.cast::<F>() as *const (dyn Any + Send + Sync)
}

unsafe fn raw_write<F: Any + Send + Sync>(
    base: *mut u8,
    offset: usize,
    value: AnyValue,
) -> Result<(), AnyValue> {
    let value = value.downcast::<F>()?;
    unsafe { base.add(offset).cast::<F>().write(*value) };
    Ok(())
}

unsafe fn raw_drop<F: Any + Send + Sync>(base: *mut u8, offset: usize) {
    unsafe { std::ptr::drop_in_place(base.add(offset).cast::<F>()) };
}

/// One piece of declared state of a shaped type.
pub struct FieldDescriptor {
    pub(crate) name: &'static str,
    pub(crate) field_type: &'static str,
    pub(crate) get: Option<Box<dyn FieldGet>>,
    pub(crate) set: Option<SetFn>,
    pub(crate) raw: Option<RawFieldVtable>,
}

/// Cached description of one type's declared state.
pub struct TypeShape {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) fields: Vec<FieldDescriptor>,
    pub(crate) default_fn: Option<Box<dyn Fn() -> AnyValue + Send + Sync>>,
    pub(crate) layout: Layout,
    pub(crate) assemble: unsafe fn(*mut u8) -> AnyValue,
}

impl TypeShape {
    /// Whether every field can be reached by offset, i.e. whether a raw
    /// unconstructed shell can be fully populated for this type.
    pub(crate) fn raw_ready(&self) -> bool {
        self.fields.iter().all(|f| f.raw.is_some())
    }
}

unsafe fn assemble_box<T: Any + Send + Sync>(ptr: *mut u8) -> AnyValue {
    unsafe { Box::from_raw(ptr.cast::<T>()) }
}

/// Registers the shape of `T`: its fields, their access routes, and
/// optionally a default constructor for accessor-mode shells.
pub struct ShapeBuilder<T> {
    fields: Vec<FieldDescriptor>,
    default_fn: Option<Box<dyn Fn() -> AnyValue + Send + Sync>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> ShapeBuilder<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        ShapeBuilder {
            fields: Vec::new(),
            default_fn: None,
            _marker: PhantomData,
        }
    }

    /// Default constructor used for shells under the accessor mechanism.
    pub fn with_default(mut self, f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.default_fn = Some(Box::new(move || Box::new(f()) as AnyValue));
        self
    }

    /// A field reachable through safe projection closures.
    pub fn field<F, G, S>(mut self, name: &'static str, get: G, set: S) -> Self
    where
        F: Any + Send + Sync,
        G: for<'x> Fn(&'x T) -> &'x F + Send + Sync + 'static,
        S: Fn(&mut T, F) + Send + Sync + 'static,
    {
        let erased_set: SetFn = Box::new(move |obj, value| {
            let Some(t) = obj.downcast_mut::<T>() else {
                return Err(value);
            };
            let value = value.downcast::<F>()?;
            set(t, *value);
            Ok(())
        });
        self.fields.push(FieldDescriptor {
            name,
            field_type: std::any::type_name::<F>(),
            get: Some(Box::new(ProjGet {
                proj: get,
                _marker: PhantomData,
            })),
            set: Some(erased_set),
            raw: None,
        });
        self
    }

    /// A field reachable only by offset, e.g. state with no safe
    /// projection. Requires the raw access capability at clone time.
    pub fn raw_field<F: Any + Send + Sync>(mut self, name: &'static str, offset: usize) -> Self {
        self.fields.push(FieldDescriptor {
            name,
            field_type: std::any::type_name::<F>(),
            get: None,
            set: None,
            raw: Some(RawFieldVtable {
                offset,
                field_type_id: TypeId::of::<F>(),
                get_ref: raw_get_ref::<F>,
                write: raw_write::<F>,
                drop_in_place: raw_drop::<F>,
            }),
        });
        self
    }

    /// A field with both access routes; the offset route lets raw-mode
    /// shells skip the default constructor entirely.
    pub fn field_at<F, G, S>(self, name: &'static str, offset: usize, get: G, set: S) -> Self
    where
        F: Any + Send + Sync,
        G: for<'x> Fn(&'x T) -> &'x F + Send + Sync + 'static,
        S: Fn(&mut T, F) + Send + Sync + 'static,
    {
        let mut builder = self.field::<F, G, S>(name, get, set);
        let descriptor = builder
            .fields
            .last_mut()
            .unwrap_or_else(|| unreachable!("field() always pushes a descriptor"));
        descriptor.raw = Some(RawFieldVtable {
            offset,
            field_type_id: TypeId::of::<F>(),
            get_ref: raw_get_ref::<F>,
            write: raw_write::<F>,
            drop_in_place: raw_drop::<F>,
        });
        builder
    }

    /// Finalizes the shape and installs the generic struct policy for
    /// `T` in the process-wide registry.
    pub fn register(self) {
        let shape = Arc::new(TypeShape {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            fields: self.fields,
            default_fn: self.default_fn,
            layout: Layout::new::<T>(),
            assemble: assemble_box::<T>,
        });
        log::debug!(
            "registered shape for {} ({} fields, raw-ready: {})",
            shape.type_name,
            shape.fields.len(),
            shape.raw_ready()
        );
        policy::register_builtin(
            TypeId::of::<T>(),
            Policy::Composite(Arc::new(StructSpec { shape })),
        );
    }
}

/// Generic field-by-field copy of a shaped type: allocate a shell,
/// clone every declared field into it, finish. The least specific
/// built-in policy.
pub(crate) struct StructSpec {
    shape: Arc<TypeShape>,
}

impl StructSpec {
    fn type_mismatch(&self, path: &FieldPath) -> CloneError {
        CloneError::FieldAccessFailure {
            type_name: self.shape.type_name,
            path: path.clone(),
            reason: "runtime value does not match the registered shape".to_string(),
        }
    }
}

impl CompositeSpec for StructSpec {
    fn type_name(&self) -> &'static str {
        self.shape.type_name
    }

    fn allocate(
        &self,
        _src: AnyRef<'_>,
        mode: AccessMode,
        path: &FieldPath,
    ) -> Result<AnyValue, CloneError> {
        alloc::allocate_struct(&self.shape, mode, path)
    }

    fn children<'g>(
        &self,
        src: AnyRef<'g>,
        path: &FieldPath,
    ) -> Result<Vec<ChildSource<'g>>, CloneError> {
        if src.type_id() != self.shape.type_id {
            return Err(self.type_mismatch(path));
        }
        let mode = crate::core::access::access_mode();
        let base = src as *const (dyn Any + Send + Sync) as *const u8;
        let mut out = Vec::with_capacity(self.shape.fields.len());
        for field in &self.shape.fields {
            let segment = PathSegment::Field(field.name);
            if let Some(get) = &field.get {
                match get.get(src) {
                    Some(value) => out.push(ChildSource::Read {
                        segment,
                        type_name: field.field_type,
                        value,
                    }),
                    None => return Err(self.type_mismatch(path)),
                }
                continue;
            }
            match (&field.raw, mode) {
                (Some(raw), AccessMode::Raw) => {
                    // Type checked above; the offset vtable was built for
                    // exactly this layout.
                    let value: AnyRef<'g> = unsafe { &*(raw.get_ref)(base, raw.offset) };
                    out.push(ChildSource::Read {
                        segment,
                        type_name: field.field_type,
                        value,
                    });
                }
                _ => out.push(ChildSource::Unreadable {
                    segment,
                    reason: format!(
                        "field `{}` is only reachable by offset and the raw capability is not active",
                        field.name
                    ),
                }),
            }
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
        let field = &self.shape.fields[ordinal];
        if let Some(raw_shell) = shell.downcast_mut::<RawShell>() {
            return raw_shell
                .write(ordinal, value)
                .map_err(|_| CloneError::FieldAccessFailure {
                    type_name: self.shape.type_name,
                    path: path.clone(),
                    reason: format!("clone of field `{}` has the wrong runtime type", field.name),
                });
        }
        if let Some(set) = &field.set {
            return set(shell.as_mut(), value).map_err(|_| CloneError::FieldAccessFailure {
                type_name: self.shape.type_name,
                path: path.clone(),
                reason: format!("clone of field `{}` has the wrong runtime type", field.name),
            });
        }
        // Mixed shapes land here: the shell came from the default
        // constructor, but this field is offset-only. With the raw
        // capability active, replace the constructed field in place.
        if let Some(raw) = &field.raw
            && crate::core::access::access_mode() == AccessMode::Raw
        {
            if (**shell).type_id() != self.shape.type_id {
                return Err(self.type_mismatch(path));
            }
            // The old value must only be dropped once the replacement is
            // known to write; an aborted operation still drops the shell
            // whole.
            if (*value).type_id() != raw.field_type_id {
                return Err(CloneError::FieldAccessFailure {
                    type_name: self.shape.type_name,
                    path: path.clone(),
                    reason: format!(
                        "clone of field `{}` has the wrong runtime type",
                        field.name
                    ),
                });
            }
            let base = shell.as_mut() as *mut (dyn Any + Send + Sync) as *mut u8;
            unsafe { (raw.drop_in_place)(base, raw.offset) };
            return unsafe { (raw.write)(base, raw.offset, value) }.map_err(|_| {
                CloneError::FieldAccessFailure {
                    type_name: self.shape.type_name,
                    path: path.clone(),
                    reason: format!(
                        "clone of field `{}` has the wrong runtime type",
                        field.name
                    ),
                }
            });
        }
        Err(CloneError::FieldAccessFailure {
            type_name: self.shape.type_name,
            path: path.clone(),
            reason: format!(
                "field `{}` has no setter under the accessor mechanism",
                field.name
            ),
        })
    }

    fn finish(&self, shell: AnyValue, path: &FieldPath) -> Result<AnyValue, CloneError> {
        match shell.downcast::<RawShell>() {
            Ok(raw_shell) => {
                raw_shell
                    .assemble()
                    .map_err(|missing| CloneError::FieldAccessFailure {
                        type_name: self.shape.type_name,
                        path: path.clone(),
                        reason: format!("field `{missing}` was never populated"),
                    })
            }
            // Accessor-mode shells are the finished value already.
            Err(shell) => Ok(shell),
        }
    }
}
