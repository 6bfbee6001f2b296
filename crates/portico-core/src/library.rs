//! Shared-ownership wrapper around a loaded library's handle.
//!
//! As long as any clone of a [`LibraryHandle`] exists, the library stays
//! mapped and every function pointer into it (factories, deleters, up-casts)
//! remains valid. The close operation is injected by whoever opened the
//! library and runs exactly once, when the last clone is dropped.

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};

type CloseFn = Box<dyn FnOnce()>;

struct LibraryBinary {
    raw: *mut c_void,
    path: PathBuf,
    loaded_at: DateTime<Utc>,
    /// Taken and invoked exactly once, from [`Drop`].
    close: Option<CloseFn>,
}

// Dynamic library handles are process-global, and the `close` closure is
// only touched from `Drop`, which has exclusive access.
unsafe impl Send for LibraryBinary {}
unsafe impl Sync for LibraryBinary {}

impl Drop for LibraryBinary {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

/// Reference-counted share of a loaded library.
///
/// Held strongly by the owning loader's tables and by every plugin handle
/// manufactured from the library; held weakly by the archive and by the
/// loader's handle-dedup table.
#[derive(Clone)]
pub struct LibraryHandle {
    inner: Arc<LibraryBinary>,
}

impl LibraryHandle {
    /// Wrap a raw library handle.
    ///
    /// `close` runs exactly once, when the last clone of this handle is
    /// dropped. `raw` is used only as an identity key by the caller.
    pub fn new(
        raw: *mut c_void,
        path: impl Into<PathBuf>,
        close: impl FnOnce() + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(LibraryBinary {
                raw,
                path: path.into(),
                loaded_at: Utc::now(),
                close: Some(Box::new(close)),
            }),
        }
    }

    /// The raw operating-system handle, for identity comparisons only.
    pub fn raw(&self) -> *mut c_void {
        self.inner.raw
    }

    /// The raw handle as a map key.
    pub fn key(&self) -> usize {
        self.inner.raw as usize
    }

    /// The path the library was opened from.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// When this handle was first created.
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.inner.loaded_at
    }

    /// Number of live shares of this library.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles refer to the same share group.
    pub fn same_library(&self, other: &LibraryHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A non-owning share that does not keep the library mapped.
    pub fn downgrade(&self) -> WeakLibraryHandle {
        WeakLibraryHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("path", &self.inner.path)
            .field("shares", &self.share_count())
            .finish()
    }
}

/// Non-owning counterpart of [`LibraryHandle`].
#[derive(Clone, Default)]
pub struct WeakLibraryHandle {
    inner: Weak<LibraryBinary>,
}

impl WeakLibraryHandle {
    /// An empty weak handle that never upgrades.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recover a strong share while the library is still open.
    pub fn upgrade(&self) -> Option<LibraryHandle> {
        self.inner.upgrade().map(|inner| LibraryHandle { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handle(closed: &'static AtomicUsize) -> LibraryHandle {
        LibraryHandle::new(0x1000 as *mut c_void, "/tmp/libmock.so", move || {
            closed.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn close_runs_once_on_last_drop() {
        static CLOSED: AtomicUsize = AtomicUsize::new(0);

        let handle = counting_handle(&CLOSED);
        let copy = handle.clone();
        assert_eq!(handle.share_count(), 2);

        drop(handle);
        assert_eq!(CLOSED.load(Ordering::SeqCst), 0);

        drop(copy);
        assert_eq!(CLOSED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn weak_handle_does_not_keep_library_open() {
        static CLOSED: AtomicUsize = AtomicUsize::new(0);

        let handle = counting_handle(&CLOSED);
        let weak = handle.downgrade();
        assert!(weak.upgrade().is_some());

        drop(handle);
        assert_eq!(CLOSED.load(Ordering::SeqCst), 1);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn upgraded_share_counts() {
        static CLOSED: AtomicUsize = AtomicUsize::new(0);

        let handle = counting_handle(&CLOSED);
        let weak = handle.downgrade();
        let second = weak.upgrade().unwrap();
        assert!(handle.same_library(&second));
        assert_eq!(handle.share_count(), 2);
    }

    #[test]
    fn empty_weak_never_upgrades() {
        assert!(WeakLibraryHandle::new().upgrade().is_none());
    }

    #[test]
    fn identity_accessors() {
        static CLOSED: AtomicUsize = AtomicUsize::new(0);

        let handle = counting_handle(&CLOSED);
        assert_eq!(handle.key(), 0x1000);
        assert_eq!(handle.path(), Path::new("/tmp/libmock.so"));
    }
}
