//! Serializable snapshots of loader state for host diagnostics.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One known plugin, as seen by a loader.
#[derive(Clone, Debug, Serialize)]
pub struct PluginSummary {
    /// Canonical plugin name.
    pub name: String,

    /// Declared aliases.
    pub aliases: Vec<String>,

    /// Implemented interfaces, human-readable form.
    pub interfaces: Vec<String>,

    /// Path of the providing library; `None` for native plugins.
    pub library: Option<PathBuf>,
}

/// One library this loader currently participates in.
#[derive(Clone, Debug, Serialize)]
pub struct LibrarySummary {
    pub path: PathBuf,
    pub loaded_at: DateTime<Utc>,
    pub plugins: Vec<String>,
}

/// Snapshot of everything a loader knows.
#[derive(Clone, Debug, Serialize)]
pub struct LoaderSummary {
    pub plugins: Vec<PluginSummary>,
    pub libraries: Vec<LibrarySummary>,
}
