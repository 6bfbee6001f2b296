//! Shared-ownership plugin handles and the typed interface query.

use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::descriptor::{DeleterFn, PluginDescriptor};
use crate::library::LibraryHandle;
use crate::utility::interface_key;

struct PluginInstance {
    /// Untyped pointer to the instance produced by the descriptor's factory.
    instance: *mut (),
    deleter: Option<DeleterFn>,
    descriptor: Arc<PluginDescriptor>,
    /// Must be declared after `descriptor`: fields drop in declaration
    /// order, and the deleter and the descriptor's function pointers point
    /// into the library, so the library share has to be released last.
    library: Option<LibraryHandle>,
}

// Instances reach a handle only through registrations, which require the
// plugin class to be `Send + Sync` (see `assert_plugin_bounds`). Interface
// access hands out shared references only.
unsafe impl Send for PluginInstance {}
unsafe impl Sync for PluginInstance {}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        // The instance dies first; the library share is still alive here
        // and drops afterwards with the rest of the fields.
        if let Some(deleter) = self.deleter {
            unsafe { deleter(self.instance) };
        }
    }
}

/// A live plugin instance bundled with everything that keeps it valid.
///
/// Cloning shares the instance. When the last clone is dropped the
/// descriptor's deleter destroys the instance, and only then is the
/// library share released.
#[derive(Clone)]
pub struct PluginHandle {
    inner: Arc<PluginInstance>,
}

impl PluginHandle {
    /// Instantiate the plugin described by `descriptor`.
    ///
    /// Returns `None` when the descriptor carries no factory/deleter pair.
    pub fn new(descriptor: Arc<PluginDescriptor>, library: Option<LibraryHandle>) -> Option<Self> {
        let factory = descriptor.factory?;
        let deleter = descriptor.deleter?;
        let instance = factory();
        Some(Self {
            inner: Arc::new(PluginInstance {
                instance,
                deleter: Some(deleter),
                descriptor,
                library,
            }),
        })
    }

    /// The registration record this instance was built from.
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.inner.descriptor
    }

    /// The canonical plugin name.
    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    /// The library share this handle keeps alive, if the plugin came from a
    /// dynamically loaded library.
    pub fn library(&self) -> Option<&LibraryHandle> {
        self.inner.library.as_ref()
    }

    /// Whether the plugin declares the interface `I`.
    pub fn implements<I: ?Sized + 'static>(&self) -> bool {
        self.inner.descriptor.implements_key(interface_key::<I>())
    }

    /// Query the instance for the interface `I`.
    ///
    /// Returns a reference valid for as long as this handle is borrowed, or
    /// `None` when the plugin does not declare `I`.
    pub fn query_interface<I: ?Sized + 'static>(&self) -> Option<&I> {
        let cast = self
            .inner
            .descriptor
            .interfaces
            .get(interface_key::<I>())?
            .as_cast::<I>()?;
        unsafe { cast(self.inner.instance).as_ref() }
    }

    /// Query the instance for the interface `I`, returning a share that
    /// keeps this plugin handle (and therefore the instance and its
    /// library) alive for as long as the capability is held.
    pub fn query_interface_shared<I: ?Sized + 'static>(&self) -> Option<InterfaceRef<I>> {
        let cast = self
            .inner
            .descriptor
            .interfaces
            .get(interface_key::<I>())?
            .as_cast::<I>()?;
        let ptr = NonNull::new(cast(self.inner.instance))?;
        Some(InterfaceRef {
            ptr,
            handle: self.clone(),
        })
    }

    /// A non-owning reference to this instance.
    pub fn downgrade(&self) -> WeakPluginHandle {
        WeakPluginHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live shares of this instance.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles wrap the same instance.
    pub fn same_instance(&self, other: &PluginHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.inner.descriptor.name)
            .field("shares", &self.share_count())
            .finish()
    }
}

/// Non-owning counterpart of [`PluginHandle`].
///
/// Installed into plugins that declare [`EnableFromSelf`] so an instance can
/// hand out shares of its own handle without creating a reference cycle.
#[derive(Clone, Default)]
pub struct WeakPluginHandle {
    inner: Weak<PluginInstance>,
}

impl WeakPluginHandle {
    /// An empty weak handle that never upgrades.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recover a strong share while the instance is still alive.
    pub fn upgrade(&self) -> Option<PluginHandle> {
        self.inner.upgrade().map(|inner| PluginHandle { inner })
    }
}

/// A shared capability pointer obtained from
/// [`PluginHandle::query_interface_shared`].
///
/// Dereferences to the interface and retains a share of the plugin handle,
/// so the instance cannot be destroyed while any `InterfaceRef` exists.
pub struct InterfaceRef<I: ?Sized> {
    ptr: NonNull<I>,
    handle: PluginHandle,
}

impl<I: ?Sized> InterfaceRef<I> {
    /// The plugin handle this capability keeps alive.
    pub fn handle(&self) -> &PluginHandle {
        &self.handle
    }
}

impl<I: ?Sized> Clone for InterfaceRef<I> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            handle: self.handle.clone(),
        }
    }
}

impl<I: ?Sized> std::ops::Deref for InterfaceRef<I> {
    type Target = I;

    fn deref(&self) -> &I {
        unsafe { self.ptr.as_ref() }
    }
}

// Only shared access to the interface is possible through an InterfaceRef,
// and the owning handle is itself Send + Sync.
unsafe impl<I: ?Sized + Sync> Send for InterfaceRef<I> {}
unsafe impl<I: ?Sized + Sync> Sync for InterfaceRef<I> {}

/// Storage for the weak back-reference of [`EnableFromSelf`].
#[derive(Default)]
pub struct SelfSlot {
    slot: Mutex<Option<WeakPluginHandle>>,
}

impl SelfSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the back-reference. Called by the loader right after the
    /// instance is created.
    pub fn install(&self, weak: WeakPluginHandle) {
        *self.slot.lock() = Some(weak);
    }

    /// A strong share of the owning handle, while one exists.
    pub fn get(&self) -> Option<PluginHandle> {
        self.slot.lock().as_ref()?.upgrade()
    }
}

/// Interface through which an instance can obtain a share of the plugin
/// handle that owns it.
///
/// Plugins opt in by embedding a [`SelfSlot`] and listing `EnableFromSelf`
/// among their registered interfaces; the loader installs the weak
/// back-reference during instantiation.
pub trait EnableFromSelf: Send + Sync {
    /// The slot the loader installs the back-reference into.
    fn self_slot(&self) -> &SelfSlot;

    /// A share of the handle pointing at this very instance.
    ///
    /// Returns `None` before the loader has installed the back-reference or
    /// after the last external share was released.
    fn plugin_from_self(&self) -> Option<PluginHandle> {
        self.self_slot().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    trait Store: Send + Sync {
        fn put(&self, value: &str);
        fn get(&self) -> String;
    }

    #[derive(Default)]
    struct MemoryStore {
        value: StdMutex<String>,
    }

    impl Store for MemoryStore {
        fn put(&self, value: &str) {
            *self.value.lock().unwrap() = value.to_string();
        }

        fn get(&self) -> String {
            self.value.lock().unwrap().clone()
        }
    }

    static DELETED: AtomicUsize = AtomicUsize::new(0);

    fn store_factory() -> *mut () {
        Box::into_raw(Box::new(MemoryStore::default())).cast()
    }

    unsafe fn store_deleter(ptr: *mut ()) {
        DELETED.fetch_add(1, Ordering::SeqCst);
        drop(Box::from_raw(ptr.cast::<MemoryStore>()));
    }

    fn store_cast(ptr: *mut ()) -> *mut dyn Store {
        ptr.cast::<MemoryStore>() as *mut dyn Store
    }

    fn store_descriptor() -> Arc<PluginDescriptor> {
        let mut descriptor = PluginDescriptor::new("tests::MemoryStore");
        descriptor.name = "MemoryStore".to_string();
        descriptor.add_interface::<dyn Store>(store_cast);
        descriptor.factory = Some(store_factory);
        descriptor.deleter = Some(store_deleter as DeleterFn);
        Arc::new(descriptor)
    }

    #[test]
    fn query_interface_round_trip() {
        let handle = PluginHandle::new(store_descriptor(), None).unwrap();
        let store = handle.query_interface::<dyn Store>().unwrap();
        store.put("hello");
        assert_eq!(store.get(), "hello");
        assert!(handle.implements::<dyn Store>());
    }

    #[test]
    fn unknown_interface_is_a_miss() {
        trait Other {}
        let handle = PluginHandle::new(store_descriptor(), None).unwrap();
        assert!(handle.query_interface::<dyn Other>().is_none());
        assert!(!handle.implements::<dyn Other>());
    }

    #[test]
    fn descriptor_without_factory_yields_no_handle() {
        let descriptor = Arc::new(PluginDescriptor::new("tests::Inert"));
        assert!(PluginHandle::new(descriptor, None).is_none());
    }

    #[test]
    fn clones_share_the_instance() {
        let handle = PluginHandle::new(store_descriptor(), None).unwrap();
        handle.query_interface::<dyn Store>().unwrap().put("kept");

        let copy = handle.clone();
        assert!(handle.same_instance(&copy));
        drop(handle);

        let store = copy.query_interface::<dyn Store>().unwrap();
        assert_eq!(store.get(), "kept");
    }

    #[test]
    fn interface_ref_outlives_the_handle() {
        let handle = PluginHandle::new(store_descriptor(), None).unwrap();
        handle.query_interface::<dyn Store>().unwrap().put("still here");

        let shared = handle.query_interface_shared::<dyn Store>().unwrap();
        drop(handle);

        assert_eq!(shared.get(), "still here");
        assert_eq!(shared.handle().share_count(), 1);
    }

    #[test]
    fn deleter_runs_once_and_before_library_release() {
        // Dedicated plugin type so the counters are not shared with the
        // other tests in this module.
        #[derive(Default)]
        struct Tracked;

        static TRACKED_DELETED: AtomicUsize = AtomicUsize::new(0);
        static CLOSED: AtomicBool = AtomicBool::new(false);
        static DELETED_BEFORE_CLOSE: AtomicBool = AtomicBool::new(false);

        fn tracked_factory() -> *mut () {
            Box::into_raw(Box::new(Tracked)).cast()
        }
        unsafe fn tracked_deleter(ptr: *mut ()) {
            TRACKED_DELETED.fetch_add(1, Ordering::SeqCst);
            drop(Box::from_raw(ptr.cast::<Tracked>()));
        }

        let mut descriptor = PluginDescriptor::new("tests::Tracked");
        descriptor.name = "Tracked".to_string();
        descriptor.factory = Some(tracked_factory);
        descriptor.deleter = Some(tracked_deleter as DeleterFn);

        let library = LibraryHandle::new(0x2000 as *mut c_void, "/tmp/libtracked.so", || {
            // By the time the library share drops, the instance must
            // already be gone.
            DELETED_BEFORE_CLOSE.store(
                TRACKED_DELETED.load(Ordering::SeqCst) == 1,
                Ordering::SeqCst,
            );
            CLOSED.store(true, Ordering::SeqCst);
        });

        let handle = PluginHandle::new(Arc::new(descriptor), Some(library.clone())).unwrap();
        let copy = handle.clone();
        drop(library);

        drop(handle);
        assert!(!CLOSED.load(Ordering::SeqCst));
        assert_eq!(TRACKED_DELETED.load(Ordering::SeqCst), 0);

        drop(copy);
        assert!(CLOSED.load(Ordering::SeqCst));
        assert_eq!(TRACKED_DELETED.load(Ordering::SeqCst), 1);
        assert!(DELETED_BEFORE_CLOSE.load(Ordering::SeqCst));
    }

    #[test]
    fn weak_handle_upgrades_while_alive() {
        let handle = PluginHandle::new(store_descriptor(), None).unwrap();
        let weak = handle.downgrade();
        assert!(weak.upgrade().is_some());
        drop(handle);
        assert!(weak.upgrade().is_none());
        assert!(WeakPluginHandle::new().upgrade().is_none());
    }

    #[test]
    fn self_slot_hands_out_shares_without_a_cycle() {
        #[derive(Default)]
        struct Aware {
            slot: SelfSlot,
        }

        impl EnableFromSelf for Aware {
            fn self_slot(&self) -> &SelfSlot {
                &self.slot
            }
        }

        fn aware_factory() -> *mut () {
            Box::into_raw(Box::new(Aware::default())).cast()
        }
        unsafe fn aware_deleter(ptr: *mut ()) {
            drop(Box::from_raw(ptr.cast::<Aware>()));
        }
        fn aware_cast(ptr: *mut ()) -> *mut dyn EnableFromSelf {
            ptr.cast::<Aware>() as *mut dyn EnableFromSelf
        }

        let mut descriptor = PluginDescriptor::new("tests::Aware");
        descriptor.name = "Aware".to_string();
        descriptor.add_interface::<dyn EnableFromSelf>(aware_cast);
        descriptor.factory = Some(aware_factory);
        descriptor.deleter = Some(aware_deleter as DeleterFn);

        let handle = PluginHandle::new(Arc::new(descriptor), None).unwrap();
        let aware = handle.query_interface::<dyn EnableFromSelf>().unwrap();

        // Nothing installed yet.
        assert!(aware.plugin_from_self().is_none());

        aware.self_slot().install(handle.downgrade());
        let again = aware.plugin_from_self().unwrap();
        assert!(handle.same_instance(&again));

        // The back-reference is weak: dropping the external shares destroys
        // the instance.
        let weak = handle.downgrade();
        drop(again);
        drop(handle);
        assert!(weak.upgrade().is_none());
    }
}
