//! Loader failure paths: unopenable libraries, libraries without plugins,
//! and unknown names.

use std::path::{Path, PathBuf};

use portico_loader::Loader;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A shared library that exists on most systems but declares no plugins.
fn plain_system_library() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &[
        "/lib/x86_64-linux-gnu/libz.so.1",
        "/usr/lib/x86_64-linux-gnu/libz.so.1",
        "/lib/aarch64-linux-gnu/libz.so.1",
        "/usr/lib/aarch64-linux-gnu/libz.so.1",
        "/usr/lib64/libz.so.1",
        "/usr/lib/libz.so.1",
        "/usr/lib/libz.dylib",
    ];
    CANDIDATES
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

#[test]
fn unopenable_library_yields_empty_set() {
    init_logging();

    let mut loader = Loader::new();
    let before = loader.all_plugins();

    let loaded = loader.load_library("/nonexistent/libportico_missing.so");
    assert!(loaded.is_empty());
    // A failed open leaves the loader untouched.
    assert_eq!(loader.all_plugins(), before);
    assert!(!loader.forget_library("/nonexistent/libportico_missing.so"));
}

#[test]
fn library_without_plugins_yields_empty_set() {
    init_logging();

    let Some(path) = plain_system_library() else {
        // No known system library on this machine; nothing to exercise.
        return;
    };

    let mut loader = Loader::new();
    let before = loader.all_plugins();

    let loaded = loader.load_library(&path);
    assert!(loaded.is_empty());
    assert_eq!(loader.all_plugins(), before);

    // Loading again behaves the same way.
    let again = loader.load_library(&path);
    assert!(again.is_empty());

    // The library contributed nothing, so there is nothing to forget.
    assert!(!loader.forget_library(&path));
}

#[test]
fn unknown_names_resolve_to_nothing() {
    let loader = Loader::new();
    assert_eq!(loader.lookup("no-such-plugin"), None);
    assert!(loader.instantiate("no-such-plugin").is_none());
    assert!(loader.aliases_of("no-such-plugin").is_empty());
    assert!(loader.plugins_with_alias("no-such-plugin").is_empty());
    assert!(loader
        .plugins_implementing("no-such-interface", true)
        .is_empty());
}
