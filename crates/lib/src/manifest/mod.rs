//! The runtime manifest.
//!
//! Written once into the runtime stage when composition finishes and read-only
//! afterwards. It is what `strata run` and `strata inspect` consume.

mod types;

pub use types::*;
