//! Spec loading and run-level configuration.

use crate::model::Spec;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Options for one run, layered over the spec's own config.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Permit requests to loopback/private/link-local targets.
    pub allow_local_targets: bool,
    /// Run independent behaviors of the same dependency level
    /// concurrently.
    pub parallel: bool,
    /// Only run behaviors whose name contains this (case-insensitive),
    /// plus their dependencies.
    pub filter: Option<String>,
    /// Only run behaviors carrying one of these tags, plus their
    /// dependencies.
    pub tags: Vec<String>,
}

/// Loads spec documents from disk.
#[derive(Debug, Default)]
pub struct SpecLoader;

impl SpecLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a single spec file.
    ///
    /// `.json` files go through `serde_json`; everything else is read
    /// as YAML.
    pub fn load_spec<P: AsRef<Path>>(&self, path: P) -> Result<Spec> {
        let path = path.as_ref();
        info!("Loading spec from {}", path.display());

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read spec file: {}", path.display()))?;

        let spec = if is_json(path) {
            Spec::from_json(&content)
                .with_context(|| format!("Failed to parse JSON spec from {}", path.display()))?
        } else {
            Spec::from_yaml(&content)
                .with_context(|| format!("Failed to parse YAML spec from {}", path.display()))?
        };

        debug!(
            "Loaded spec '{}' with {} behavior(s)",
            spec.name,
            spec.behaviors().len()
        );
        Ok(spec)
    }

    /// Load every spec file in `dir`, sorted by path.
    ///
    /// Files that fail to parse are skipped.
    pub fn load_specs_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<Spec>> {
        let dir = dir.as_ref();
        info!("Loading specs from directory: {}", dir.display());

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_spec_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut specs = Vec::with_capacity(paths.len());
        for path in &paths {
            match self.load_spec(path) {
                Ok(spec) => specs.push(spec),
                Err(err) => debug!("Skipping {}: {:#}", path.display(), err),
            }
        }

        info!("Loaded {} spec(s) from {}", specs.len(), dir.display());
        Ok(specs)
    }
}

/// `.yaml`, `.yml` or `.json`.
pub fn is_spec_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext, "yaml" | "yml" | "json"))
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}
