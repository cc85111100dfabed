// Pipeline Environment
// Substitution state, per-step metadata overrides and the temp
// directory registry shared by a run

use crate::definition::{sanitize_name, ServiceMeta};
use crate::error::Result;

use serde::Deserialize;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File consulted when no environment path is given.
pub const DEFAULT_ENVIRONMENT_FILE: &str = "gantry.env.yml";

/// Temp files and keyed temp directories registered for removal at
/// teardown. Behind a mutex because workers may request directories
/// concurrently.
#[derive(Debug, Default)]
struct TempRegistry {
    files: Vec<PathBuf>,
    paths: HashMap<String, PathBuf>,
}

/// The substitution environment of a run.
///
/// Substitution values distinguish three states: absent (no map entry),
/// explicit null (`Some(None)`) and explicit empty string — the
/// preprocessor's emptiness tests depend on all three.
#[derive(Debug, Default)]
pub struct Environment {
    substitutions: HashMap<String, Option<String>>,
    /// Per-step metadata overlaid onto the definition after decoding.
    pub steps: HashMap<String, ServiceMeta>,
    project_name: String,
    temp_dir_root: Option<PathBuf>,
    temp_dir_no_autoclean: bool,
    temp: Mutex<TempRegistry>,
}

/// Raw shape of the environment file; merged into [`Environment`]
/// after decoding.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvironmentFile {
    #[serde(default)]
    substitutions: HashMap<String, Option<String>>,
    #[serde(default, alias = "temp_dir", alias = "temp-dir")]
    tempdir: Option<PathBuf>,
    #[serde(
        default,
        alias = "temp_dir_no_autoclean",
        alias = "tempdir-no-autoclean"
    )]
    tempdir_no_autoclean: bool,
    #[serde(default)]
    steps: HashMap<String, ServiceMeta>,
    #[serde(default, alias = "project-name")]
    project_name: Option<String>,
}

impl Environment {
    /// Load an environment.
    ///
    /// With no explicit path, `gantry.env.yml` is used when present and
    /// defaults otherwise. A missing file at an explicit path is
    /// returned to the caller unchanged; entry points decide whether to
    /// tolerate it. Programmatic substitutions and the ignored/selected
    /// sets are applied before and after the file overlay so they win
    /// over file contents.
    pub fn load(
        path: Option<&Path>,
        substitutions: &HashMap<String, Option<String>>,
        ignored: &[String],
        selected: &[String],
    ) -> Result<Self> {
        let mut env = Environment::default();
        env.apply_overrides(substitutions, ignored, selected);

        let resolved = match path {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let fallback = Path::new(DEFAULT_ENVIRONMENT_FILE);
                fallback.is_file().then(|| fallback.to_path_buf())
            }
        };

        if let Some(path) = resolved {
            let raw = fs::read_to_string(&path)?;
            let file: EnvironmentFile = serde_yaml::from_str(&raw)?;
            env.overlay(file);
        }

        env.apply_overrides(substitutions, ignored, selected);
        Ok(env)
    }

    fn overlay(&mut self, file: EnvironmentFile) {
        self.substitutions.extend(file.substitutions);
        self.steps.extend(file.steps);
        if let Some(tempdir) = file.tempdir {
            self.temp_dir_root = Some(tempdir);
        }
        if file.tempdir_no_autoclean {
            self.temp_dir_no_autoclean = true;
        }
        if let Some(project_name) = file.project_name {
            self.project_name = project_name;
        }
    }

    fn apply_overrides(
        &mut self,
        substitutions: &HashMap<String, Option<String>>,
        ignored: &[String],
        selected: &[String],
    ) {
        for (name, value) in substitutions {
            self.substitutions.insert(name.clone(), value.clone());
        }
        self.update_steps_meta(ignored, |meta| meta.ignore = true);
        self.update_steps_meta(selected, |meta| meta.selected = true);
    }

    /// Ensure every named step has a metadata entry and apply the flag,
    /// even before the definition has been loaded.
    fn update_steps_meta(&mut self, names: &[String], apply: impl Fn(&mut ServiceMeta)) {
        for name in names {
            apply(self.steps.entry(name.clone()).or_default());
        }
    }

    /// Current value of a substitution. `None` means the variable is
    /// absent; `Some(None)` means it is present with a null value.
    pub fn substitution(&self, name: &str) -> Option<&Option<String>> {
        self.substitutions.get(name)
    }

    pub fn set_substitution(&mut self, name: &str, value: Option<String>) {
        self.substitutions.insert(name.to_string(), value);
    }

    pub fn substitutions(&self) -> &HashMap<String, Option<String>> {
        &self.substitutions
    }

    /// The project name, defaulting to a sanitized form of the working
    /// directory's file name. Names networks and container prefixes.
    pub fn project_name(&self) -> String {
        if !self.project_name.is_empty() {
            return self.project_name.clone();
        }
        std::env::current_dir()
            .ok()
            .and_then(|dir| dir.file_name().map(|name| name.to_string_lossy().into_owned()))
            .map(|name| sanitize_name(&name))
            .unwrap_or_else(|| "gantry".to_string())
    }

    pub fn set_project_name(&mut self, name: &str) {
        self.project_name = name.to_string();
    }

    /// Create-or-fetch the temp directory registered under `prefix`.
    /// Directories are created mode 0777 under the configured root (or
    /// the system temp dir) and registered for removal at teardown.
    pub fn temp_dir(&self, prefix: &str) -> io::Result<PathBuf> {
        let mut registry = self.temp.lock().unwrap();
        if let Some(path) = registry.paths.get(prefix) {
            return Ok(path.clone());
        }

        let root = self
            .temp_dir_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let dir = tempfile::Builder::new()
            .prefix(&format!("gantry_{}_", sanitize_name(prefix)))
            .tempdir_in(root)?;
        let path = dir.keep();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o777))?;
        }

        registry.paths.insert(prefix.to_string(), path.clone());
        Ok(path)
    }

    /// Register a file for removal at teardown.
    pub fn register_temp_file(&self, path: PathBuf) {
        self.temp.lock().unwrap().files.push(path);
    }

    /// Remove registered temp files and directories. Best-effort:
    /// failures are logged, never surfaced. Idempotent.
    pub fn clean_up(&self) {
        let mut registry = self.temp.lock().unwrap();

        for file in registry.files.drain(..) {
            if let Err(e) = fs::remove_file(&file) {
                tracing::warn!(path = %file.display(), error = %e, "failed to remove temp file");
            }
        }

        if self.temp_dir_no_autoclean {
            registry.paths.clear();
            return;
        }
        for (_, path) in registry.paths.drain() {
            if let Err(e) = fs::remove_dir_all(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove temp dir");
            }
        }
    }
}
