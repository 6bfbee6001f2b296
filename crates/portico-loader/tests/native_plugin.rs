//! End-to-end exercise of a natively registered plugin: registration,
//! lookup, instantiation, interface queries, and share semantics.

use std::sync::Mutex;

use portico_loader::{register_native, Loader};
use portico_sdk::portico_plugin;

pub trait TestInterface: Send + Sync {
    fn input(&self, input: &str);
    fn output(&self) -> String;
}

#[derive(Default)]
pub struct TestImplementation {
    value: Mutex<String>,
}

impl TestInterface for TestImplementation {
    fn input(&self, input: &str) {
        *self.value.lock().unwrap() = input.to_string();
    }

    fn output(&self) -> String {
        self.value.lock().unwrap().clone()
    }
}

portico_plugin! {
    plugin: TestImplementation,
    interfaces: [TestInterface],
}

#[test]
fn native_plugin_load() {
    assert!(register_native::<TestImplementation>());

    let loader = Loader::new();
    assert_eq!(loader.all_plugins().len(), 1);
    assert_eq!(
        loader.lookup("TestImplementation"),
        Some("TestImplementation")
    );
    assert!(loader.interfaces_implemented().contains("TestInterface"));
    assert!(loader
        .plugins_implementing("TestInterface", true)
        .contains("TestImplementation"));
    assert!(loader
        .plugins_implementing_interface::<dyn TestInterface>()
        .contains("TestImplementation"));

    let plugin = loader.instantiate("TestImplementation").unwrap();
    let test = plugin.query_interface::<dyn TestInterface>().unwrap();
    test.input("some test string");
    assert_eq!(test.output(), "some test string");

    // A second share keeps the instance alive when the first is released.
    let copy = plugin.clone();
    drop(plugin);

    let test = copy.query_interface::<dyn TestInterface>().unwrap();
    assert_eq!(test.output(), "some test string");

    // A shared interface capability outlives the handle it was taken from.
    let shared = copy.query_interface_shared::<dyn TestInterface>().unwrap();
    drop(copy);
    assert_eq!(shared.output(), "some test string");

    // Instances are independent.
    let other = loader.instantiate("TestImplementation").unwrap();
    assert_eq!(other.query_interface::<dyn TestInterface>().unwrap().output(), "");
}
