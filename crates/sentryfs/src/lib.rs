//! Core library for sentryfs, an integrity-checking overlay filesystem.
//!
//! sentryfs mirrors a backing directory and augments it with three
//! guarantees the backing filesystem does not provide:
//!
//! * arbitrary user extended attributes, persisted in a SQLite sidecar;
//! * per-file (or per-block) FNV-1a-64 content checksums that detect
//!   out-of-band corruption of backing files;
//! * append-only (WORM) semantics on configured subtrees.
//!
//! The [`engine::Overlay`] type is the entry point: one value per mount,
//! driven by a dispatch adapter (see the `sentryfs-fuse` crate) that
//! forwards filesystem operations to it.

pub mod blocks;
pub mod digest;
pub mod engine;
pub mod error;
pub mod handle;
pub mod paths;
pub mod sidecar;
pub mod worm;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use digest::Fnv64;
pub use engine::{Granularity, Overlay, OverlayConfig, VerifyMode};
pub use error::{OverlayError, Result};
pub use worm::WormPolicy;
