//! Installed-package versions resolved from the project lockfile.
//!
//! External imports are pinned to the version recorded in `Cargo.lock`;
//! packages the lockfile does not know are omitted rather than guessed.

use std::path::Path;

use ahash::AHashMap;

/// Package name → pinned version, read once per session.
#[derive(Debug, Default)]
pub struct PackageIndex {
    versions: AHashMap<String, String>,
}

impl PackageIndex {
    /// Parse `<root>/Cargo.lock`. Missing or malformed lockfiles yield
    /// an empty index; the tracker then simply records nothing external.
    pub fn from_lockfile(root: &Path) -> PackageIndex {
        let Ok(raw) = std::fs::read_to_string(root.join("Cargo.lock")) else {
            return PackageIndex::default();
        };
        let Ok(doc) = raw.parse::<toml::Value>() else {
            tracing::warn!("unreadable lockfile, external dependencies not pinned");
            return PackageIndex::default();
        };
        let mut versions = AHashMap::new();
        if let Some(packages) = doc.get("package").and_then(|v| v.as_array()) {
            for package in packages {
                let name = package.get("name").and_then(|v| v.as_str());
                let version = package.get("version").and_then(|v| v.as_str());
                if let (Some(name), Some(version)) = (name, version) {
                    versions.insert(name.to_string(), version.to_string());
                }
            }
        }
        PackageIndex { versions }
    }

    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.versions.get(name).map(String::as_str)
    }

    /// Canonical descriptor of the installed package set: sorted
    /// `name version` lines. Environment identity derives from this.
    pub fn descriptor(&self) -> String {
        let mut lines: Vec<String> = self
            .versions
            .iter()
            .map(|(name, version)| format!("{name} {version}"))
            .collect();
        lines.sort_unstable();
        lines.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
