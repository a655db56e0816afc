use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::SharedBackend;
use crate::error::{KilnError, Result};
use crate::package::Package;

/// Long-lived packages keyed by name, each rooted at `<root>/<name>`.
///
/// The same name always resolves to the same [`Package`] instance, so its
/// cached build state and in-flight build are shared by every request.
pub struct PackageRegistry {
    root: PathBuf,
    backend: SharedBackend,
    build_timeout: Option<Duration>,
    packages: Mutex<HashMap<String, Package>>,
}

impl PackageRegistry {
    pub fn new(root: impl Into<PathBuf>, backend: SharedBackend) -> Self {
        Self {
            root: root.into(),
            backend,
            build_timeout: None,
            packages: Mutex::new(HashMap::new()),
        }
    }

    /// Bounds every shared build of the registry's packages.
    pub fn with_build_timeout(mut self, build_timeout: Option<Duration>) -> Self {
        self.build_timeout = build_timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, name: &str) -> Result<Package> {
        validate_name(name)?;

        let mut packages = self.packages.lock().unwrap();
        if let Some(package) = packages.get(name) {
            return Ok(package.clone());
        }

        let directory = self.root.join(name);
        if !directory.is_dir() {
            return Err(KilnError::UnknownPackage(name.to_string()));
        }

        tracing::debug!(package = name, directory = %directory.display(), "registering package");

        let package = self.package(name, directory);
        packages.insert(name.to_string(), package.clone());
        Ok(package)
    }

    /// A package for a one-off directory that is not tracked by the registry.
    pub fn ephemeral(&self, name: &str, directory: impl Into<PathBuf>) -> Package {
        self.package(name, directory)
    }

    fn package(&self, name: &str, directory: impl Into<PathBuf>) -> Package {
        Package::with_build_timeout(name, directory, self.backend.clone(), self.build_timeout)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.packages.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(KilnError::InvalidWorkspace(format!(
            "invalid package name `{name}`"
        )))
    }
}
