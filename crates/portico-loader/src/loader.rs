//! The application-visible plugin loader.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use portico_core::abi::{PluginEntryFn, PLUGIN_ENTRY_SYMBOL};
use portico_core::legacy::LEGACY_INFO_SYMBOL;
use portico_core::{
    EnableFromSelf, LibraryHandle, PluginDescriptor, PluginError, PluginHandle, WeakLibraryHandle,
};

use crate::hook;
use crate::legacy::read_legacy_plugins;
use crate::library::{close_library, RawLibrary};
use crate::registry::{
    ARCHIVE, DYNAMIC_PLUGINS, LOADING_MUTEX, NATIVE_PLUGINS, REGISTERING_DYNAMIC, REGISTRATION_OKAY,
};
use crate::summary::{LibrarySummary, LoaderSummary, PluginSummary};

/// Per-library bookkeeping of the plugins it provided to this loader.
#[derive(Clone, Debug)]
pub(crate) struct LibraryRecord {
    pub(crate) names: BTreeSet<String>,
    pub(crate) path: PathBuf,
    pub(crate) loaded_at: DateTime<Utc>,
}

/// Opens libraries, resolves plugin names and aliases, and manufactures
/// plugin handles.
///
/// Each loader owns a private view of the libraries it loaded; two loaders
/// that open the same library each keep their own reference count on it,
/// and the operating system closes it only once every loader has forgotten
/// it and every plugin handle built from it has been released.
pub struct Loader {
    /// Alias to the set of canonical names it may refer to.
    aliases: BTreeMap<String, BTreeSet<String>>,

    /// Canonical name to descriptor.
    ///
    /// Must be declared before `plugin_to_library`: fields drop in
    /// declaration order, and descriptors hold function pointers into the
    /// libraries, so they have to be destroyed before the library shares.
    plugins: HashMap<String, Arc<PluginDescriptor>>,

    /// Canonical name to the share of the library that provides it. `None`
    /// for native plugins, which are part of the host itself.
    plugin_to_library: HashMap<String, Option<LibraryHandle>>,

    /// Raw handle to the weak share this loader created for it. Weak, so
    /// entries lapse on their own when the library is released; an alive
    /// entry means this loader already manages a reference count for the
    /// library and must not create a second one.
    library_handles: HashMap<usize, WeakLibraryHandle>,

    /// Raw handle to the plugins it provided; drives forgetting.
    library_to_plugins: HashMap<usize, LibraryRecord>,
}

impl Loader {
    /// Create a loader and populate it with every native plugin registered
    /// so far.
    pub fn new() -> Self {
        let mut loader = Self {
            aliases: BTreeMap::new(),
            plugins: HashMap::new(),
            plugin_to_library: HashMap::new(),
            library_handles: HashMap::new(),
            library_to_plugins: HashMap::new(),
        };
        let native: Vec<Arc<PluginDescriptor>> = NATIVE_PLUGINS
            .lock()
            .snapshot()
            .into_iter()
            .map(Arc::new)
            .collect();
        loader.store_plugins(native, None);
        loader
    }

    /// Load the library at `path` and take ownership of the plugins it
    /// declares.
    ///
    /// Returns the canonical names of the plugins received. An empty set
    /// means the library could not be opened or declared no plugins; both
    /// cases leave the loader unchanged and emit a diagnostic. Loading the
    /// same path twice yields the same set without duplicating state or
    /// increasing the library's reference count beyond a single load.
    pub fn load_library(&mut self, path: impl AsRef<Path>) -> BTreeSet<String> {
        let path = path.as_ref();

        // The registries and the mode flag are process-wide scratch space,
        // so at most one load may run at a time, and the registrations it
        // triggers must be drained before the mutex is released.
        let _guard = LOADING_MUTEX.lock();
        REGISTRATION_OKAY.store(true, Ordering::SeqCst);
        REGISTERING_DYNAMIC.store(true, Ordering::SeqCst);

        let loaded = self.load_library_locked(path);

        REGISTERING_DYNAMIC.store(false, Ordering::SeqCst);
        DYNAMIC_PLUGINS.lock().clear();
        hook::warn_if_registration_failed(path);

        loaded
    }

    fn load_library_locked(&mut self, path: &Path) -> BTreeSet<String> {
        let raw = match RawLibrary::open(path) {
            Ok(raw) => raw,
            Err(err) => {
                error!(path = %path.display(), %err, "error while loading the library");
                return BTreeSet::new();
            }
        };

        let handle = self.adopt_handle(raw, path);
        let received = self.receive_plugins(&handle, path);
        let mut loaded = self.store_plugins(received, Some(handle.clone()));

        if loaded.is_empty() {
            // The library may have been linked into the host at build time,
            // in which case its plugins registered natively at program
            // start. Probe for their marker symbols to find out.
            loaded = probe_native_markers(&handle);
            if loaded.is_empty() {
                warn!(path = %path.display(), "the library failed to load any plugins");
            }
        }

        loaded
    }

    /// Wrap a freshly opened raw handle, reusing the share this loader
    /// already holds for the same library.
    ///
    /// This is the single point of authority on this loader's reference
    /// count per library: repeated opens of an already-managed library are
    /// balanced with an immediate close so exactly one close remains owed,
    /// performed by the share's drop.
    fn adopt_handle(&mut self, raw: RawLibrary, path: &Path) -> LibraryHandle {
        let key = raw.key();
        if let Some(existing) = self
            .library_handles
            .get(&key)
            .and_then(WeakLibraryHandle::upgrade)
        {
            raw.close();
            return existing;
        }

        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let handle = LibraryHandle::new(raw.raw(), canonical, move || close_library(raw));
        self.library_handles.insert(key, handle.downgrade());
        handle
    }

    /// Collect the descriptors the library provides: from the archive when
    /// another loader already read them, otherwise by running the library's
    /// registration and draining the dynamic registry.
    fn receive_plugins(
        &self,
        handle: &LibraryHandle,
        path: &Path,
    ) -> Vec<Arc<PluginDescriptor>> {
        let key = handle.key();

        {
            let archive = ARCHIVE.lock();
            if let Some(weaks) = archive.handle_to_plugins.get(&key) {
                let mut infos = Vec::with_capacity(weaks.len());
                for weak in weaks {
                    match weak.upgrade() {
                        Some(info) => infos.push(info),
                        None => error!(
                            path = %path.display(),
                            "an archived descriptor for this library has lapsed while the \
                             library is loaded; this should never happen, please report \
                             this bug"
                        ),
                    }
                }
                return infos;
            }
        }

        let view = RawLibrary::borrowed(handle.raw());
        let mut infos: Vec<Arc<PluginDescriptor>> = Vec::new();

        let entry = unsafe { view.symbol::<PluginEntryFn>(PLUGIN_ENTRY_SYMBOL) };
        match entry {
            Some(entry) => unsafe { entry(&hook::HOST_VTABLE) },
            // The legacy hook is consulted only when the current
            // registration protocol is absent.
            None => {
                if view.has_symbol(LEGACY_INFO_SYMBOL) {
                    infos.extend(read_legacy_plugins(view, path).into_iter().map(Arc::new));
                }
            }
        }

        infos.extend(DYNAMIC_PLUGINS.lock().drain().into_iter().map(Arc::new));

        ARCHIVE.lock().record(&infos, key);
        infos
    }

    /// Insert received descriptors into this loader's tables and return the
    /// set of canonical names stored.
    fn store_plugins(
        &mut self,
        infos: Vec<Arc<PluginDescriptor>>,
        library: Option<LibraryHandle>,
    ) -> BTreeSet<String> {
        let mut new_plugins = BTreeSet::new();

        for info in infos {
            for alias in &info.aliases {
                self.aliases
                    .entry(alias.clone())
                    .or_default()
                    .insert(info.name.clone());
            }
            new_plugins.insert(info.name.clone());
            self.plugin_to_library
                .insert(info.name.clone(), library.clone());
            self.plugins.insert(info.name.clone(), info);
        }

        if let Some(handle) = library {
            if !new_plugins.is_empty() {
                self.library_to_plugins.insert(
                    handle.key(),
                    LibraryRecord {
                        names: new_plugins.clone(),
                        path: handle.path().to_path_buf(),
                        loaded_at: handle.loaded_at(),
                    },
                );
            }
        }

        new_plugins
    }

    /// Resolve a plugin name or alias to the canonical plugin name.
    fn resolve(&self, name_or_alias: &str) -> Result<&str, PluginError> {
        if let Some((name, _)) = self.plugins.get_key_value(name_or_alias) {
            return Ok(name);
        }

        match self.aliases.get(name_or_alias) {
            Some(candidates) if candidates.len() == 1 => match candidates.first() {
                Some(name) => Ok(name),
                None => Err(PluginError::NotFound(name_or_alias.to_string())),
            },
            Some(candidates) if candidates.len() > 1 => Err(PluginError::AmbiguousAlias {
                alias: name_or_alias.to_string(),
                candidates: candidates.iter().cloned().collect(),
            }),
            _ => Err(PluginError::NotFound(name_or_alias.to_string())),
        }
    }

    /// Resolve a name or alias to the canonical plugin name.
    ///
    /// Returns `None` for unknown names, and for aliases that refer to more
    /// than one plugin (with a diagnostic listing the colliding plugins).
    pub fn lookup(&self, name_or_alias: &str) -> Option<&str> {
        match self.resolve(name_or_alias) {
            Ok(name) => Some(name),
            Err(err @ PluginError::AmbiguousAlias { .. }) => {
                warn!(%err, "failed to resolve plugin");
                None
            }
            Err(_) => {
                debug!(name_or_alias, "no plugin known under this name or alias");
                None
            }
        }
    }

    /// Every known canonical plugin name, in lexicographic order.
    pub fn all_plugins(&self) -> BTreeSet<String> {
        self.plugins.keys().cloned().collect()
    }

    /// Every interface implemented by any known plugin, in human-readable
    /// form.
    pub fn interfaces_implemented(&self) -> BTreeSet<String> {
        self.plugins
            .values()
            .flat_map(|info| info.demangled_interfaces.iter().cloned())
            .collect()
    }

    /// Plugins that implement the given interface. `demangled` selects
    /// whether `interface` is the human-readable or the raw identity form.
    pub fn plugins_implementing(&self, interface: &str, demangled: bool) -> BTreeSet<String> {
        self.plugins
            .values()
            .filter(|info| {
                if demangled {
                    info.demangled_interfaces.contains(interface)
                } else {
                    info.implements_key(interface)
                }
            })
            .map(|info| info.name.clone())
            .collect()
    }

    /// Plugins that implement the interface `I`.
    pub fn plugins_implementing_interface<I: ?Sized + 'static>(&self) -> BTreeSet<String> {
        self.plugins_implementing(portico_core::interface_key::<I>(), false)
    }

    /// Every canonical name reachable through `alias`, plus the alias
    /// itself if it happens to also be a plugin name.
    pub fn plugins_with_alias(&self, alias: &str) -> BTreeSet<String> {
        let mut result = self.aliases.get(alias).cloned().unwrap_or_default();
        if self.plugins.contains_key(alias) {
            result.insert(alias.to_string());
        }
        result
    }

    /// The aliases declared by the named plugin.
    pub fn aliases_of(&self, name: &str) -> BTreeSet<String> {
        self.plugins
            .get(name)
            .map(|info| info.aliases.clone())
            .unwrap_or_default()
    }

    /// Instantiate a plugin by name or alias.
    ///
    /// Returns `None` when the name is unknown (no diagnostic; polling for
    /// optional plugins is normal), the alias is ambiguous, or the
    /// descriptor cannot be instantiated.
    pub fn instantiate(&self, name_or_alias: &str) -> Option<PluginHandle> {
        let resolved = match self.resolve(name_or_alias) {
            Ok(name) => name,
            Err(err @ PluginError::AmbiguousAlias { .. }) => {
                warn!(%err, "cannot instantiate");
                return None;
            }
            Err(_) => return None,
        };

        let Some(info) = self.plugins.get(resolved) else {
            error!(
                resolved,
                "a resolved plugin name is missing from the plugin table; this should \
                 not be possible, please report this bug"
            );
            debug_assert!(false, "resolved name absent from plugin table");
            return None;
        };

        let Some(library) = self.plugin_to_library.get(resolved) else {
            error!(
                resolved,
                "a resolved plugin name is missing from the library table; this should \
                 not be possible, please report this bug"
            );
            debug_assert!(false, "resolved name absent from library table");
            return None;
        };

        if !info.can_instantiate() {
            debug!(resolved, "the descriptor does not carry a factory");
            return None;
        }

        let handle = PluginHandle::new(Arc::clone(info), library.clone())?;

        // Give instances that ask for it a way back to their own handle.
        // The back-reference is weak, so it cannot keep the instance alive
        // by itself.
        if let Some(aware) = handle.query_interface::<dyn EnableFromSelf>() {
            aware.self_slot().install(handle.downgrade());
        }

        Some(handle)
    }

    /// Remove this loader's participation in the library at `path`.
    ///
    /// Descriptors and aliases for its plugins are dropped and the library
    /// share is released; the operating system closes the library once
    /// every loader has forgotten it and every plugin handle built from it
    /// has been released. Returns false when this loader does not know the
    /// path.
    pub fn forget_library(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let key = self
            .library_to_plugins
            .iter()
            .find(|(_, record)| record.path == canonical)
            .map(|(key, _)| *key);
        match key {
            Some(key) => self.forget_handle(key),
            None => false,
        }
    }

    /// Forget the library that provides the named plugin.
    ///
    /// Returns false for unknown names and for native plugins: native code
    /// is part of the host itself and cannot be unloaded.
    pub fn forget_library_of_plugin(&mut self, name_or_alias: &str) -> bool {
        let resolved = match self.resolve(name_or_alias) {
            Ok(name) => name.to_string(),
            Err(_) => return false,
        };
        let Some(Some(handle)) = self.plugin_to_library.get(&resolved) else {
            return false;
        };
        let key = handle.key();
        self.forget_handle(key)
    }

    fn forget_handle(&mut self, key: usize) -> bool {
        let Some(record) = self.library_to_plugins.remove(&key) else {
            return false;
        };

        for name in &record.names {
            if let Some(info) = self.plugins.get(name) {
                for alias in &info.aliases {
                    let now_empty = match self.aliases.get_mut(alias) {
                        Some(names) => {
                            names.remove(name);
                            names.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        self.aliases.remove(alias);
                    }
                }
            }
        }

        for name in &record.names {
            // The descriptor must be dropped before the library share: its
            // deleter is a function pointer into the library.
            self.plugins.remove(name);
            self.plugin_to_library.remove(name);
        }

        // `library_handles` holds weak shares and clears itself as the
        // strong shares lapse.
        true
    }

    /// A human-readable dump of the loader state. Diagnostic output, not
    /// machine-parseable.
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        let interfaces = self.interfaces_implemented();

        let _ = writeln!(out, "Loader state");
        let _ = writeln!(out, "\tKnown interfaces: {}", interfaces.len());
        for interface in &interfaces {
            let _ = writeln!(out, "\t\t{interface}");
        }

        let _ = writeln!(out, "\tKnown plugins: {}", self.plugins.len());
        for name in self.all_plugins() {
            let Some(info) = self.plugins.get(&name) else {
                continue;
            };
            let _ = writeln!(out, "\t\t[{name}]");
            if info.aliases.is_empty() {
                let _ = writeln!(out, "\t\t\thas no aliases");
            } else {
                let plural = if info.aliases.len() == 1 { "alias" } else { "aliases" };
                let _ = writeln!(out, "\t\t\thas {} {plural}:", info.aliases.len());
                for alias in &info.aliases {
                    let _ = writeln!(out, "\t\t\t\t[{alias}]");
                }
            }
            let plural = if info.demangled_interfaces.len() == 1 {
                "interface"
            } else {
                "interfaces"
            };
            let _ = writeln!(
                out,
                "\t\t\timplements {} {plural}:",
                info.demangled_interfaces.len()
            );
            for interface in &info.demangled_interfaces {
                let _ = writeln!(out, "\t\t\t\t{interface}");
            }
        }

        let collisions: BTreeMap<&String, &BTreeSet<String>> = self
            .aliases
            .iter()
            .filter(|(_, names)| names.len() > 1)
            .collect();
        if !collisions.is_empty() {
            let _ = writeln!(
                out,
                "\tThere are {} aliases with a name collision:",
                collisions.len()
            );
            for (alias, names) in collisions {
                let _ = writeln!(out, "\t\t[{alias}] collides between:");
                for name in names {
                    let _ = writeln!(out, "\t\t\t[{name}]");
                }
            }
        }

        out
    }

    /// A serializable snapshot of the loader state.
    pub fn summary(&self) -> LoaderSummary {
        let mut plugins: Vec<PluginSummary> = self
            .plugins
            .values()
            .map(|info| PluginSummary {
                name: info.name.clone(),
                aliases: info.aliases.iter().cloned().collect(),
                interfaces: info.demangled_interfaces.iter().cloned().collect(),
                library: self
                    .plugin_to_library
                    .get(&info.name)
                    .and_then(|handle| handle.as_ref())
                    .map(|handle| handle.path().to_path_buf()),
            })
            .collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));

        let mut libraries: Vec<LibrarySummary> = self
            .library_to_plugins
            .values()
            .map(|record| LibrarySummary {
                path: record.path.clone(),
                loaded_at: record.loaded_at,
                plugins: record.names.iter().cloned().collect(),
            })
            .collect();
        libraries.sort_by(|a, b| a.path.cmp(&b.path));

        LoaderSummary { plugins, libraries }
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

/// Find native plugins whose marker symbol is exported by this library,
/// meaning the library is the one that contributed them at program start.
fn probe_native_markers(handle: &LibraryHandle) -> BTreeSet<String> {
    let view = RawLibrary::borrowed(handle.raw());
    let mut found = BTreeSet::new();

    let native = NATIVE_PLUGINS.lock();
    for info in native.plugins.values() {
        let Some(marker) = &info.marker_symbol else {
            continue;
        };
        let mut symbol = Vec::with_capacity(marker.len() + 1);
        symbol.extend_from_slice(marker.as_bytes());
        symbol.push(0);
        if view.has_symbol(&symbol) {
            found.insert(info.name.clone());
        }
    }

    found
}
