//! The host side of the registration protocol.

use std::mem;
use std::sync::atomic::Ordering;

use tracing::{error, warn};

use portico_core::abi::{HostVTable, RegistrationTicket, HOOK_API_VERSION};
use portico_core::{demangle, PluginDescriptor, PluginRegistration, RegistrationError};

use crate::registry::{
    self, ARCHIVE, DYNAMIC_PLUGINS, NATIVE_PLUGINS, REGISTERING_DYNAMIC, REGISTRATION_OKAY,
};

/// The function table handed to every plugin library's registration entry.
pub(crate) static HOST_VTABLE: HostVTable = HostVTable {
    api_version: HOOK_API_VERSION,
    register: register_plugin,
    cleanup: cleanup_plugin,
};

/// The registration hook.
///
/// `size` and `align` are `size_of`/`align_of` of [`PluginDescriptor`] as
/// compiled into the registering library; a mismatch against the host's own
/// values means the two builds do not agree on the descriptor layout, and
/// the registration is refused before any other field is touched.
///
/// Registering a plugin class whose `symbol` is already present does not
/// overwrite: the incoming interfaces and aliases are merged into the
/// existing record, because the same class may be registered several times,
/// each contributing a different subset.
pub fn register_plugin(
    mut descriptor: PluginDescriptor,
    size: usize,
    align: usize,
) -> Option<RegistrationTicket> {
    if size != mem::size_of::<PluginDescriptor>() || align != mem::align_of::<PluginDescriptor>() {
        let err = RegistrationError::AbiSkew {
            expected_size: mem::size_of::<PluginDescriptor>(),
            received_size: size,
            expected_align: mem::align_of::<PluginDescriptor>(),
            received_align: align,
        };
        error!(%err, "the library cannot be safely registered against this host");
        REGISTRATION_OKAY.store(false, Ordering::SeqCst);
        return None;
    }

    if !registry::validate_or_warn(&descriptor) {
        REGISTRATION_OKAY.store(false, Ordering::SeqCst);
        return None;
    }

    // Fill the host-side fields of the descriptor.
    descriptor.name = demangle(&descriptor.symbol);
    descriptor.demangled_interfaces = descriptor.interfaces.keys().map(|k| demangle(k)).collect();
    // An alias may never duplicate the plugin's own name.
    let name = descriptor.name.clone();
    descriptor.aliases.remove(&name);

    let ticket = RegistrationTicket::new(descriptor.symbol.clone());

    let registry = if REGISTERING_DYNAMIC.load(Ordering::SeqCst) {
        &DYNAMIC_PLUGINS
    } else {
        &NATIVE_PLUGINS
    };
    registry.lock().absorb(descriptor);

    Some(ticket)
}

/// The cleanup hook. A library passes back each ticket it retained while
/// unloading; the archive entries for that descriptor are removed so later
/// loads of the same path re-run registration instead of reusing lapsed
/// records.
pub fn cleanup_plugin(ticket: RegistrationTicket) {
    ARCHIVE.lock().remove_symbol(ticket.symbol());
}

/// Register a plugin class that is compiled into the host binary.
///
/// Call this before constructing loaders, typically from `main`; it is the
/// host-side counterpart of the registration a shared library performs
/// through its entry point. The plugin lands in the native registry and
/// becomes visible to every loader created afterwards.
pub fn register_native<T: PluginRegistration>() -> bool {
    // Taking the load mutex keeps the mode flag stable: a concurrent
    // `load_library` must not see this registration in its drain.
    let _guard = registry::LOADING_MUTEX.lock();
    register_plugin(
        T::descriptor(),
        mem::size_of::<PluginDescriptor>(),
        mem::align_of::<PluginDescriptor>(),
    )
    .is_some()
}

/// Whether every registration of the most recent `load_library` call (or
/// direct hook invocation) passed validation.
pub fn registration_okay() -> bool {
    REGISTRATION_OKAY.load(Ordering::SeqCst)
}

/// Soft diagnostic for hosts that want to surface a failed registration
/// without aborting the load.
pub(crate) fn warn_if_registration_failed(path: &std::path::Path) {
    if !registration_okay() {
        warn!(
            path = %path.display(),
            "a plugin registration error was encountered while loading this library"
        );
    }
}
