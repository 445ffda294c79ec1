//! Pure, deterministic logic: plan model, safety gate, fingerprints, ranking.
//!
//! Nothing in this module performs I/O. Every function is a deterministic
//! mapping over immutable inputs and can be called concurrently without
//! coordination.

pub mod fingerprint;
pub mod gate;
pub mod plan;
pub mod rank;
