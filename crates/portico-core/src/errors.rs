//! Error types shared across the runtime.
//!
//! The caller-visible loader API reports failure through empty return values
//! (see the loader crate); these types carry the detail for diagnostics and
//! for the registration hook results.

use thiserror::Error;

/// Errors raised while resolving or loading plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No plugin with the given name or alias is known to the loader.
    #[error("no plugin with the name or alias [{0}]")]
    NotFound(String),

    /// An alias resolves to more than one plugin.
    #[error("failed to resolve the alias [{alias}] because it refers to multiple plugins: {candidates:?}")]
    AmbiguousAlias {
        alias: String,
        candidates: Vec<String>,
    },

    /// The operating system refused to open the library.
    #[error("failed to open library: {0}")]
    LoadFailed(String),

    /// Dynamic loading is not available on this platform.
    #[error("dynamic plugin loading is not supported on this platform")]
    UnsupportedPlatform,
}

/// Errors raised by the registration hook while validating a descriptor.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The descriptor compiled to a different size or alignment in the
    /// library than in the host, so no field of it can be trusted.
    #[error(
        "descriptor layout mismatch: size expected {expected_size} received {received_size}, \
         alignment expected {expected_align} received {received_align}"
    )]
    AbiSkew {
        expected_size: usize,
        received_size: usize,
        expected_align: usize,
        received_align: usize,
    },

    /// A descriptor arrived without its primary key.
    #[error("descriptor has an empty symbol")]
    EmptySymbol,

    /// Exactly one of factory and deleter was provided.
    #[error("descriptor for [{0}] must provide factory and deleter together")]
    HalfLifecycle(String),

    /// A legacy library reported a protocol version the host never shipped.
    #[error("library reports an impossible legacy protocol version [{0}]")]
    ImpossibleLegacyVersion(u32),
}
