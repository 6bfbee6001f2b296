//! Author-facing SDK for portico plugins.
//!
//! A plugin crate declares each plugin class with [`portico_plugin!`] and,
//! when built as a shared library, exports the registration entry pair with
//! [`portico_export!`]:
//!
//! ```
//! use portico_sdk::portico_plugin;
//! use std::sync::Mutex;
//!
//! pub trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! #[derive(Default)]
//! pub struct FriendlyGreeter {
//!     name: Mutex<String>,
//! }
//!
//! impl Greeter for FriendlyGreeter {
//!     fn greet(&self) -> String {
//!         format!("hello, {}", self.name.lock().unwrap())
//!     }
//! }
//!
//! portico_plugin! {
//!     plugin: FriendlyGreeter,
//!     interfaces: [Greeter],
//!     aliases: ["friendly"],
//! }
//! ```
//!
//! Plugin classes must be `Default` (the factory default-constructs them)
//! and `Send + Sync` (handles may be shared across threads); state that
//! changes after construction goes behind interior mutability. Interfaces
//! are the traits the class implements; listing a trait the class does not
//! implement fails to compile.

mod macros;

pub use portico_core::abi::{HostVTable, RegistrationTicket, HOOK_API_VERSION};
pub use portico_core::{EnableFromSelf, PluginDescriptor, PluginRegistration, SelfSlot};

// Macro internals; not part of the public surface.
#[doc(hidden)]
pub use portico_core as core;
