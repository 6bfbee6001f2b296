//! The self-reference capability: an instance obtaining a share of its own
//! handle through a weak back-reference.

use portico_loader::{register_native, Loader};
use portico_sdk::{portico_plugin, EnableFromSelf, SelfSlot};

#[derive(Default)]
pub struct SelfAware {
    slot: SelfSlot,
}

impl EnableFromSelf for SelfAware {
    fn self_slot(&self) -> &SelfSlot {
        &self.slot
    }
}

portico_plugin! {
    plugin: SelfAware,
    interfaces: [EnableFromSelf],
}

#[test]
fn instances_can_reach_their_own_handle() {
    assert!(register_native::<SelfAware>());

    let loader = Loader::new();
    let plugin = loader.instantiate("SelfAware").unwrap();

    let again = {
        let aware = plugin.query_interface::<dyn EnableFromSelf>().unwrap();
        aware.plugin_from_self().unwrap()
    };
    assert!(plugin.same_instance(&again));

    // The installed back-reference is weak: once external shares are gone,
    // the instance is destroyed.
    let weak = plugin.downgrade();
    drop(again);
    drop(plugin);
    assert!(weak.upgrade().is_none());
}
