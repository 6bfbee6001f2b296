//! The registration entry protocol, exercised in-process: the generated
//! entry point registers through the host's hooks, and the exit entry
//! passes the retained tickets back to the cleanup hook.

use std::sync::atomic::{AtomicU64, Ordering};

use portico_core::abi::{HostVTable, HOOK_API_VERSION};
use portico_loader::hook::{cleanup_plugin, register_plugin};
use portico_loader::Loader;
use portico_sdk::{portico_export, portico_plugin};

pub trait Counter: Send + Sync {
    fn add(&self, amount: u64);
    fn total(&self) -> u64;
}

#[derive(Default)]
pub struct TallyCounter {
    count: AtomicU64,
}

impl Counter for TallyCounter {
    fn add(&self, amount: u64) {
        self.count.fetch_add(amount, Ordering::SeqCst);
    }

    fn total(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

portico_plugin! {
    plugin: TallyCounter,
    interfaces: [Counter],
    aliases: ["tally"],
}

portico_export!(TallyCounter);

#[test]
fn entry_point_round_trip() {
    // An entry invoked by a host speaking an unknown protocol version must
    // register nothing.
    static MISMATCHED: HostVTable = HostVTable {
        api_version: HOOK_API_VERSION + 1,
        register: register_plugin,
        cleanup: cleanup_plugin,
    };
    unsafe { portico_plugin_hook_v2(&MISMATCHED) };
    assert!(Loader::new().all_plugins().is_empty());

    static HOST: HostVTable = HostVTable {
        api_version: HOOK_API_VERSION,
        register: register_plugin,
        cleanup: cleanup_plugin,
    };
    unsafe { portico_plugin_hook_v2(&HOST) };

    let loader = Loader::new();
    assert_eq!(loader.lookup("tally"), Some("TallyCounter"));

    let plugin = loader.instantiate("tally").unwrap();
    let counter = plugin.query_interface::<dyn Counter>().unwrap();
    counter.add(3);
    counter.add(4);
    assert_eq!(counter.total(), 7);

    // The exit entry drains the retained tickets through the cleanup hook.
    unsafe { portico_plugin_exit_v2() };
}
