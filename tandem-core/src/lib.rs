//! # tandem-core: document model and delta engine
//!
//! Documents are arbitrary JSON trees ([`Document`]). The sync layer never
//! inspects them directly; it only asks a [`DeltaEngine`] to compute the
//! difference between two documents and to apply such a difference in place.
//!
//! ```text
//!   shadow ──┐
//!            ├── diff() ──► Delta ──► patch(target, delta)
//!   local ───┘
//! ```
//!
//! [`JsonDiffPatch`] is the bundled engine. Its deltas use the jsondiffpatch
//! layout, with move-aware array diffing and object identity by `_id`/`id`.

mod array;
pub mod delta;
pub mod diffpatch;

pub use delta::{Delta, DeltaEngine, DeltaError, DiffOptions};
pub use diffpatch::JsonDiffPatch;

/// A shared JSON document.
///
/// `Clone` is a full structural copy: two documents never share substructure,
/// so patching one can never be observed through the other.
pub type Document = serde_json::Value;
