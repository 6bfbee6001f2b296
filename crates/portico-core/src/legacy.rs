//! Support for libraries built against the first registration protocol.
//!
//! Protocol v1 predates the `symbol` primary key and the host-called entry
//! point: a v1 library exports [`LEGACY_INFO_SYMBOL`], an out-parameter
//! function through which the loader retrieves a pointer to the library's
//! static table of [`V1Descriptor`] records, alongside the protocol
//! version and the record size and alignment as compiled into the library.
//! Records are migrated in place to the current descriptor shape.

use std::collections::BTreeSet;

use crate::descriptor::{DeleterFn, FactoryFn, InterfaceCastingMap, PluginDescriptor};
use crate::utility::demangle;

/// Version reported through the legacy hook.
pub const LEGACY_API_VERSION: u32 = 1;

/// Exported symbol of the legacy information hook.
pub const LEGACY_INFO_SYMBOL: &[u8] = b"portico_plugin_info_v1\0";

/// Signature of the function behind [`LEGACY_INFO_SYMBOL`].
///
/// The loader presets the version, size, and alignment out-parameters with
/// its own values; the library overwrites them with the values it was
/// compiled against and stores the address of its descriptor table in the
/// first parameter.
pub type LegacyInfoFn =
    unsafe extern "C" fn(*mut *const Vec<V1Descriptor>, *mut u32, *mut usize, *mut usize);

/// Registration record shape of protocol v1, keyed by `name` only.
#[derive(Clone, Debug, Default)]
pub struct V1Descriptor {
    pub name: String,
    pub aliases: BTreeSet<String>,
    pub interfaces: InterfaceCastingMap,
    pub factory: Option<FactoryFn>,
    pub deleter: Option<DeleterFn>,
}

/// Migrate a v1 record to the current descriptor shape.
///
/// The old `name` becomes the `symbol`, the human-readable `name` is
/// rederived, and the demangled interface mirror is rebuilt. v1 libraries
/// predate marker probing, so no marker symbol is recorded.
pub fn migrate(old: &V1Descriptor) -> PluginDescriptor {
    let mut info = PluginDescriptor::new(old.name.clone());
    info.name = demangle(&old.name);
    info.aliases = old.aliases.clone();
    for (key, cast) in &old.interfaces {
        info.demangled_interfaces.insert(demangle(key));
        info.interfaces.insert(key.clone(), cast.clone());
    }
    info.factory = old.factory;
    info.deleter = old.deleter;
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::InterfaceCast;
    use crate::utility::interface_key;

    trait Probe {}

    #[derive(Default)]
    struct Relic;
    impl Probe for Relic {}

    fn relic_cast(ptr: *mut ()) -> *mut dyn Probe {
        ptr.cast::<Relic>() as *mut dyn Probe
    }

    #[test]
    fn migrate_fills_current_shape() {
        let mut old = V1Descriptor {
            name: "legacy_crate::Relic".to_string(),
            ..V1Descriptor::default()
        };
        old.aliases.insert("relic".to_string());
        old.interfaces.insert(
            interface_key::<dyn Probe>().to_string(),
            InterfaceCast::new::<dyn Probe>(relic_cast),
        );

        let info = migrate(&old);
        assert_eq!(info.symbol, "legacy_crate::Relic");
        assert_eq!(info.name, "Relic");
        assert!(info.aliases.contains("relic"));
        assert!(info.implements_key(interface_key::<dyn Probe>()));
        assert!(info.demangled_interfaces.contains("Probe"));
        assert!(info.marker_symbol.is_none());
        assert!(!info.can_instantiate());
    }
}
