//! Field access capability probe.
//!
//! Two mechanisms exist for reaching a registered field: safe
//! projection closures, and raw offset-based access that can populate
//! shells allocated without running any constructor. The raw mechanism
//! must be granted explicitly by the hosting process before the first
//! clone; it is never ambient. The selection is made once and is
//! immutable for the process lifetime.

use std::sync::OnceLock;

/// The mechanism every field get/set goes through for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Offset-based reads and writes; shells are raw, unconstructed
    /// memory initialized field by field.
    Raw,
    /// Projection-closure reads and writes; shells come from registered
    /// default constructors.
    Accessor,
}

static MODE: OnceLock<AccessMode> = OnceLock::new();

/// Grants the raw field-access capability. Must be called before the
/// first clone operation; returns `false` if the mechanism was already
/// fixed, in which case the grant has no effect.
pub fn grant_raw_access() -> bool {
    let granted = MODE.set(AccessMode::Raw).is_ok();
    if granted {
        log::debug!("field access mechanism fixed: raw");
    } else {
        log::warn!("raw access grant ignored: mechanism already fixed to {:?}", access_mode());
    }
    granted
}

/// The active mechanism. First use without a prior grant locks in the
/// accessor mechanism.
pub fn access_mode() -> AccessMode {
    *MODE.get_or_init(|| {
        log::debug!("field access mechanism fixed: accessor");
        AccessMode::Accessor
    })
}
