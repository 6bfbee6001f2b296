//! Invocation of the legacy (v1) registration hook.

use std::mem;
use std::path::Path;
use std::ptr;

use tracing::{error, warn};

use portico_core::legacy::{self, LegacyInfoFn, V1Descriptor, LEGACY_API_VERSION, LEGACY_INFO_SYMBOL};
use portico_core::{PluginDescriptor, RegistrationError};

use crate::library::RawLibrary;

/// Retrieve plugins from a library built against protocol v1, migrating
/// them to the current descriptor shape.
///
/// Returns an empty list when the library does not export the legacy hook,
/// reports an impossible protocol version, or was compiled against a
/// different record layout.
pub(crate) fn read_legacy_plugins(library: RawLibrary, path: &Path) -> Vec<PluginDescriptor> {
    let Some(hook) = (unsafe { library.symbol::<LegacyInfoFn>(LEGACY_INFO_SYMBOL) }) else {
        return Vec::new();
    };

    warn!(
        path = %path.display(),
        "this library registers plugins through a deprecated hook; please rebuild it \
         against the current portico SDK"
    );

    let mut table: *const Vec<V1Descriptor> = ptr::null();
    let mut version = LEGACY_API_VERSION;
    let mut size = mem::size_of::<V1Descriptor>();
    let mut align = mem::align_of::<V1Descriptor>();

    unsafe { hook(&mut table, &mut version, &mut size, &mut align) };

    if version != LEGACY_API_VERSION {
        let err = RegistrationError::ImpossibleLegacyVersion(version);
        error!(path = %path.display(), %err, "ignoring the library");
        return Vec::new();
    }

    if size != mem::size_of::<V1Descriptor>() || align != mem::align_of::<V1Descriptor>() {
        let err = RegistrationError::AbiSkew {
            expected_size: mem::size_of::<V1Descriptor>(),
            received_size: size,
            expected_align: mem::align_of::<V1Descriptor>(),
            received_align: align,
        };
        error!(
            path = %path.display(),
            %err,
            "plugins from this library cannot be safely loaded"
        );
        return Vec::new();
    }

    if table.is_null() {
        error!(
            path = %path.display(),
            "the library failed to provide legacy plugin records for unknown reasons; \
             please report this as a bug"
        );
        return Vec::new();
    }

    let records = unsafe { &*table };
    records.iter().map(legacy::migrate).collect()
}
