//! Compile-time build metadata for the `--version` surface.

/// Crate version from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision captured by `build.rs`.
pub const GIT_COMMIT: &str = env!("STEWARD_BUILD_GIT_HASH");

/// Build timestamp captured by `build.rs`.
pub const BUILD_TIMESTAMP: &str = env!("STEWARD_BUILD_TIMESTAMP");

/// Multi-line version block printed by `steward --version`.
pub fn cli_version_text() -> String {
    format!("steward {VERSION}\ncommit: {GIT_COMMIT}\nbuilt: {BUILD_TIMESTAMP}")
}
