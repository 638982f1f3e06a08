//! Test utilities for sentryfs.
//!
//! Provides a tempdir-backed overlay fixture so engine tests can run
//! end-to-end without mounting anything.

use tempfile::TempDir;

use crate::{
    engine::{Granularity, Overlay, OverlayConfig, VerifyMode},
    worm::WormPolicy,
};

/// An overlay over a throwaway backing directory.
///
/// The temporary directory is kept alive for the overlay's lifetime and
/// cleaned up when this struct is dropped.
#[derive(Debug)]
pub struct TestOverlay {
    /// The engine under test.
    pub overlay: Overlay,
    /// The backing directory, for out-of-band manipulation in tests.
    pub backing: TempDir,
}

impl TestOverlay {
    /// Default fixture: strict verification, whole-file checksums, no
    /// append-only subtrees.
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    /// Fixture with the configuration adjusted by `adjust`.
    pub fn with(adjust: impl FnOnce(&mut OverlayConfig)) -> Self {
        let backing = TempDir::with_prefix("sentryfs-test-").unwrap();
        let mut config = OverlayConfig::new(backing.path());
        adjust(&mut config);
        let overlay = Overlay::open(config).unwrap();
        Self { overlay, backing }
    }

    /// Fixture with append-only prefixes from a CSV list.
    pub fn with_worm(csv: &str) -> Self {
        Self::with(|config| config.worm = WormPolicy::from_csv(csv))
    }

    /// Fixture in relaxed verification mode.
    pub fn relaxed() -> Self {
        Self::with(|config| config.verify = VerifyMode::Relaxed)
    }

    /// Fixture with per-block checksums.
    pub fn block_mode() -> Self {
        Self::with(|config| config.granularity = Granularity::Block)
    }
}

impl Default for TestOverlay {
    fn default() -> Self {
        Self::new()
    }
}
