//! Thin wrapper over the operating-system loader.
//!
//! Libraries are opened with lazy symbol binding and local scope so plugins
//! cannot pollute one another's symbol namespaces. The raw handle doubles
//! as the identity key: the OS returns the same handle for repeated opens
//! of the same library, incrementing a reference count that each close
//! decrements.

#[cfg(unix)]
mod imp {
    use std::ffi::c_void;
    use std::mem::ManuallyDrop;
    use std::path::Path;

    use libloading::os::unix::{Library, Symbol, RTLD_LAZY, RTLD_LOCAL};

    use portico_core::PluginError;

    /// An open library identified by its raw `dlopen` handle.
    ///
    /// Plain data, no `Drop`: the reference count is only decremented by an
    /// explicit [`close`](RawLibrary::close), so non-owning views are safe.
    #[derive(Clone, Copy)]
    pub(crate) struct RawLibrary {
        raw: *mut c_void,
    }

    impl RawLibrary {
        pub(crate) fn open(path: &Path) -> Result<Self, PluginError> {
            let library = unsafe { Library::open(Some(path), RTLD_LAZY | RTLD_LOCAL) }
                .map_err(|err| PluginError::LoadFailed(err.to_string()))?;
            Ok(Self {
                raw: library.into_raw(),
            })
        }

        /// A non-owning view over an already-open library, for symbol
        /// lookups only.
        pub(crate) fn borrowed(raw: *mut c_void) -> Self {
            Self { raw }
        }

        pub(crate) fn raw(&self) -> *mut c_void {
            self.raw
        }

        pub(crate) fn key(&self) -> usize {
            self.raw as usize
        }

        /// Resolve an exported symbol, copying it out of the library.
        ///
        /// # Safety
        ///
        /// `T` must match the actual type of the exported item.
        pub(crate) unsafe fn symbol<T: Copy>(&self, name: &[u8]) -> Option<T> {
            let library = ManuallyDrop::new(Library::from_raw(self.raw));
            let symbol: Symbol<T> = library.get(name).ok()?;
            Some(*symbol)
        }

        /// Whether the library exports a symbol with this name.
        pub(crate) fn has_symbol(&self, name: &[u8]) -> bool {
            unsafe { self.symbol::<*mut c_void>(name) }.is_some()
        }

        /// Decrement the OS reference count, closing the library when it
        /// reaches zero.
        pub(crate) fn close(self) {
            drop(unsafe { Library::from_raw(self.raw) });
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::ffi::c_void;
    use std::path::Path;

    use portico_core::PluginError;

    /// Stub for platforms without a supported dynamic loader. Loads fail
    /// with a diagnostic; native plugins keep working.
    #[derive(Clone, Copy)]
    pub(crate) struct RawLibrary {
        raw: *mut c_void,
    }

    impl RawLibrary {
        pub(crate) fn open(_path: &Path) -> Result<Self, PluginError> {
            Err(PluginError::UnsupportedPlatform)
        }

        pub(crate) fn borrowed(raw: *mut c_void) -> Self {
            Self { raw }
        }

        pub(crate) fn raw(&self) -> *mut c_void {
            self.raw
        }

        pub(crate) fn key(&self) -> usize {
            self.raw as usize
        }

        pub(crate) unsafe fn symbol<T: Copy>(&self, _name: &[u8]) -> Option<T> {
            None
        }

        pub(crate) fn has_symbol(&self, _name: &[u8]) -> bool {
            false
        }

        pub(crate) fn close(self) {}
    }
}

pub(crate) use imp::RawLibrary;

use portico_core::abi::{PluginExitFn, PLUGIN_EXIT_SYMBOL};

/// Close a library the loader opened: give the library a chance to pass its
/// registration tickets back through the cleanup hook, then drop the OS
/// reference count.
pub(crate) fn close_library(raw: RawLibrary) {
    if let Some(exit) = unsafe { raw.symbol::<PluginExitFn>(PLUGIN_EXIT_SYMBOL) } {
        unsafe { exit() };
    }
    raw.close();
}
