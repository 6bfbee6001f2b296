//! Process-wide scratch state for the registration protocol.
//!
//! These statics are shared by every loader in the process, which is why at
//! most one `load_library` runs at a time: the whole operation happens under
//! [`LOADING_MUTEX`], so registrations deposited during a load are drained
//! by that same load before any other loader can observe them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::warn;

use portico_core::PluginDescriptor;

/// Serializes `load_library` process-wide. Held for the full duration of a
/// load so that overlapping loads cannot steal one another's registrations.
pub(crate) static LOADING_MUTEX: Mutex<()> = Mutex::new(());

/// While true, the registration hook deposits into [`DYNAMIC_PLUGINS`];
/// otherwise into [`NATIVE_PLUGINS`]. Set by the loader for the span of a
/// library load.
pub(crate) static REGISTERING_DYNAMIC: AtomicBool = AtomicBool::new(false);

/// Cleared by the registration hook when any descriptor of the current load
/// fails validation; consulted by the loader afterwards for a diagnostic.
pub(crate) static REGISTRATION_OKAY: AtomicBool = AtomicBool::new(true);

/// Plugins that belong to the host executable or anything statically linked
/// into it. Every loader snapshots these at construction.
pub(crate) static NATIVE_PLUGINS: Lazy<Mutex<Registry>> =
    Lazy::new(|| Mutex::new(Registry::default()));

/// Plugins deposited by the library currently being loaded. Drained and
/// cleared by the same `load_library` call that triggered the deposit.
pub(crate) static DYNAMIC_PLUGINS: Lazy<Mutex<Registry>> =
    Lazy::new(|| Mutex::new(Registry::default()));

/// Weak mirror of every descriptor a currently-loaded library has produced.
pub(crate) static ARCHIVE: Lazy<Mutex<Archive>> = Lazy::new(|| Mutex::new(Archive::default()));

/// A rendezvous table from plugin symbol to descriptor.
///
/// The registry owns its descriptors outright until a loader drains or
/// copies them out.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) plugins: HashMap<String, PluginDescriptor>,
}

impl Registry {
    /// Deposit a descriptor, merging with an existing registration of the
    /// same plugin class instead of overwriting it.
    pub(crate) fn absorb(&mut self, descriptor: PluginDescriptor) {
        match self.plugins.entry(descriptor.symbol.clone()) {
            Entry::Occupied(mut existing) => existing.get_mut().merge_from(descriptor),
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
            }
        }
    }

    /// Move every descriptor out, leaving the registry empty.
    pub(crate) fn drain(&mut self) -> Vec<PluginDescriptor> {
        self.plugins.drain().map(|(_, info)| info).collect()
    }

    /// Copy every descriptor out, leaving the registry untouched.
    pub(crate) fn snapshot(&self) -> Vec<PluginDescriptor> {
        self.plugins.values().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.plugins.clear();
    }
}

/// Records, per loaded library handle, the descriptors it produced, so a
/// second loader that opens the same library can reuse them instead of
/// re-running registration.
///
/// References are weak: strong ownership of descriptors lives only in
/// loaders and live plugin handles, which breaks the cycle between a
/// library owning its descriptors and descriptors owning callables that
/// reach back into the library.
#[derive(Default)]
pub(crate) struct Archive {
    pub(crate) handle_to_plugins: HashMap<usize, Vec<Weak<PluginDescriptor>>>,
    pub(crate) symbol_to_handle: HashMap<String, usize>,
}

impl Archive {
    /// Record the descriptors a library produced.
    ///
    /// A library that produced no plugins gets no entry at all: the archive
    /// relies on plugin libraries cleaning themselves out on unload, so
    /// entries for non-plugin libraries would pollute it.
    pub(crate) fn record(&mut self, infos: &[Arc<PluginDescriptor>], handle: usize) {
        if infos.is_empty() {
            return;
        }
        let entry = self.handle_to_plugins.entry(handle).or_default();
        for info in infos {
            entry.push(Arc::downgrade(info));
            self.symbol_to_handle.insert(info.symbol.clone(), handle);
        }
    }

    /// Remove every entry recorded for the descriptor identified by
    /// `symbol`. Invoked from the cleanup hook during library unload.
    pub(crate) fn remove_symbol(&mut self, symbol: &str) {
        let Some(handle) = self.symbol_to_handle.remove(symbol) else {
            return;
        };
        if let Some(entries) = self.handle_to_plugins.get_mut(&handle) {
            entries.retain(|weak| match weak.upgrade() {
                Some(info) => info.symbol != symbol,
                None => false,
            });
            if entries.is_empty() {
                self.handle_to_plugins.remove(&handle);
            }
        }
    }
}

/// Log-and-continue guard for descriptors that fail structural validation.
pub(crate) fn validate_or_warn(descriptor: &PluginDescriptor) -> bool {
    if let Err(err) = descriptor.validate() {
        warn!(symbol = %descriptor.symbol, %err, "rejecting plugin registration");
        return false;
    }
    true
}
