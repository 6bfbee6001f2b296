//! Core data model for the portico plugin runtime.
//!
//! This crate defines everything the loader and the plugin-author SDK agree
//! on: the plugin descriptor produced by registration, the shared-ownership
//! handles for libraries and plugin instances, the typed interface query,
//! and the registration protocol types that cross the library boundary.
//!
//! It deliberately has no dynamic-loading dependency. The close operation of
//! a [`LibraryHandle`] is injected by whoever opened the library, which keeps
//! the ownership and teardown machinery testable without touching the
//! operating-system loader.

pub mod abi;
pub mod descriptor;
pub mod errors;
pub mod handle;
pub mod legacy;
pub mod library;
pub mod utility;

pub use abi::{HostVTable, RegistrationTicket, HOOK_API_VERSION};
pub use descriptor::{InterfaceCast, PluginDescriptor, PluginRegistration};
pub use errors::{PluginError, RegistrationError};
pub use handle::{EnableFromSelf, InterfaceRef, PluginHandle, SelfSlot, WeakPluginHandle};
pub use library::{LibraryHandle, WeakLibraryHandle};
pub use utility::{demangle, interface_key, symbol_of};
