//! Artifact bundles: the only channel between stages.
//!
//! Stages publish named bundles of immutable artifacts; downstream stages
//! declare which bundles they consume and download snapshots of them.

mod store;

pub use store::{ArtifactStore, BundleSnapshot};

/// Bundle holding per-target libraries and the shared header.
pub const NATIVE_LIBS: &str = "native-libs";

/// Bundle holding universal libraries plus the per-arch inputs they merged.
pub const MERGED_LIBS: &str = "merged-libs";

/// Bundle holding the packaged binding.
pub const PACKAGE: &str = "package";

/// Bundle holding release archives.
pub const RELEASE: &str = "release";
