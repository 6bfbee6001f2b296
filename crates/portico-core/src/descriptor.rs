//! The plugin descriptor: the record a registration delivers for one
//! plugin class.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::errors::RegistrationError;
use crate::utility::interface_key;

/// Allocates a fresh, untyped plugin instance.
pub type FactoryFn = fn() -> *mut ();

/// Destroys an instance produced by the matching [`FactoryFn`].
///
/// Must be invoked from code belonging to the same library that allocated
/// the instance.
pub type DeleterFn = unsafe fn(*mut ());

/// A type-erased up-cast function for one interface of one plugin class.
///
/// Under multiple embedding the instance pointer and an interface pointer
/// may differ, and for trait objects the interface pointer carries a vtable,
/// so every interface gets its own monomorphic conversion function. The
/// function is stored erased and recovered through [`Any`], which makes the
/// recovery validate the interface's [`TypeId`](std::any::TypeId) even when
/// two interfaces share an identity string.
#[derive(Clone)]
pub struct InterfaceCast {
    caster: Arc<dyn Any + Send + Sync>,
}

impl InterfaceCast {
    /// Wrap a monomorphic up-cast function for the interface `I`.
    pub fn new<I: ?Sized + 'static>(cast: fn(*mut ()) -> *mut I) -> Self {
        Self {
            caster: Arc::new(cast),
        }
    }

    /// Recover the typed up-cast function.
    ///
    /// Returns `None` when this entry was built for a different interface
    /// than `I`.
    pub fn as_cast<I: ?Sized + 'static>(&self) -> Option<fn(*mut ()) -> *mut I> {
        self.caster.downcast_ref::<fn(*mut ()) -> *mut I>().copied()
    }
}

impl fmt::Debug for InterfaceCast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InterfaceCast")
    }
}

/// Map from interface identity string to its up-cast function.
pub type InterfaceCastingMap = HashMap<String, InterfaceCast>;

/// Everything the registration protocol delivers for one plugin class.
///
/// Descriptors are produced by the SDK macros inside a plugin library and
/// validated, completed (`name`, `demangled_interfaces`), and stored by the
/// host's registration hook.
#[derive(Clone, Debug, Default)]
pub struct PluginDescriptor {
    /// Opaque type identity of the plugin class. Primary key.
    pub symbol: String,

    /// Human-readable form of `symbol`. Filled by the host after the
    /// descriptor is received.
    pub name: String,

    /// Alternative lookup names. Unique within this descriptor, never
    /// globally unique.
    pub aliases: BTreeSet<String>,

    /// Interface identity string to up-cast function.
    pub interfaces: InterfaceCastingMap,

    /// Human-readable mirror of the keys of `interfaces`. Filled by the
    /// host.
    pub demangled_interfaces: BTreeSet<String>,

    /// Allocates a new instance. Either both of `factory` and `deleter` are
    /// set or neither is; a descriptor with neither cannot be instantiated.
    pub factory: Option<FactoryFn>,

    /// Destroys an instance allocated by `factory`.
    pub deleter: Option<DeleterFn>,

    /// Name of the exported symbol that identifies the library a statically
    /// registered plugin came from.
    pub marker_symbol: Option<String>,
}

impl PluginDescriptor {
    /// Start a descriptor for the plugin class identified by `symbol`.
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    /// Record that the plugin implements the interface `I`.
    pub fn add_interface<I: ?Sized + 'static>(&mut self, cast: fn(*mut ()) -> *mut I) {
        self.interfaces
            .insert(interface_key::<I>().to_string(), InterfaceCast::new(cast));
    }

    /// Whether this descriptor declares the interface identified by `key`.
    pub fn implements_key(&self, key: &str) -> bool {
        self.interfaces.contains_key(key)
    }

    /// Whether [`factory`](Self::factory) and [`deleter`](Self::deleter) are
    /// both present.
    pub fn can_instantiate(&self) -> bool {
        self.factory.is_some() && self.deleter.is_some()
    }

    /// Check the structural invariants a registration must satisfy.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.symbol.is_empty() {
            return Err(RegistrationError::EmptySymbol);
        }
        if self.factory.is_some() != self.deleter.is_some() {
            return Err(RegistrationError::HalfLifecycle(self.symbol.clone()));
        }
        Ok(())
    }

    /// Fold another registration of the same plugin class into this one.
    ///
    /// The same class may be registered more than once, each time
    /// contributing a different subset of interfaces or aliases. Existing
    /// interface entries are never overwritten.
    pub fn merge_from(&mut self, other: PluginDescriptor) {
        for (key, cast) in other.interfaces {
            self.interfaces.entry(key).or_insert(cast);
        }
        self.demangled_interfaces.extend(other.demangled_interfaces);
        self.aliases.extend(other.aliases);
    }

    /// Reset every field to its empty state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Implemented (via the SDK macros) by every type registered as a plugin.
pub trait PluginRegistration {
    /// Build the registration record for this plugin class.
    fn descriptor() -> PluginDescriptor;
}

/// Referenced by the SDK macros to reject plugin classes that do not meet
/// the instance contract: handles may be shared across threads, so the
/// instances behind them must be `Send + Sync`.
pub fn assert_plugin_bounds<T: Send + Sync + Default + 'static>() {}
