// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;
use thiserror::Error;

/// Conditions the engine cannot recover from.
///
/// These travel inside `anyhow::Error` up to the process boundary, where they
/// are reported once before exiting with a non-zero status. Swapchain
/// staleness is NOT represented here; it has its own non-error outcome types.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("no physical device offers Vulkan 1.3 with a graphics+present queue and the required features")]
    NoSuitableDevice,

    #[error("required GPU capability missing: {0}")]
    MissingCapability(String),

    #[error("no supported format for {what} (tried {candidates})")]
    UnsupportedFormat { what: &'static str, candidates: String },

    #[error("no memory type in mask {type_bits:#b} satisfies {intent}")]
    NoCompatibleMemoryType { type_bits: u32, intent: &'static str },

    #[error("GPU did not signal {what} within {timeout_ms} ms (device hang?)")]
    GpuTimeout { what: &'static str, timeout_ms: u64 },

    #[error("unsupported image layout transition {old} -> {new} ({aspect})")]
    UnsupportedTransition {
        old: String,
        new: String,
        aspect: &'static str,
    },

    #[error("format {format} does not support linear-filtered blits; cannot generate mipmaps")]
    UnsupportedBlitFormat { format: String },

    #[error("failed to load asset {path}: {reason}")]
    AssetLoad { path: PathBuf, reason: String },
}
