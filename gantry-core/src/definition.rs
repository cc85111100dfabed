// Definition Loader
// Decodes the pipeline definition into the unified step model and
// merges it with the environment's per-step metadata

use crate::environment::Environment;
use crate::error::{GantryError, Result};
use crate::logger::{Color, LogConfig};
use crate::preprocessor::Preprocessor;
use crate::types::{MappingWithEquals, StringMapOrStringSlice, StringOrStringSlice, StringSet};

use serde::{Deserialize, Serialize};

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Files consulted, in order, when no definition path is given.
pub const DEFAULT_DEFINITION_FILES: [&str; 2] = ["gantry.def.yml", "docker-compose.yml"];

/// Whether a service survives gantry's exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepAlive {
    Yes,
    #[default]
    No,
    /// Any pre-existing container is killed and removed before start,
    /// but teardown leaves the new one running.
    Replace,
}

/// One-shot step or long-running service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Service,
    #[default]
    Step,
}

/// Per-step overrides carried by the environment and overlaid onto the
/// decoded definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMeta {
    /// Elide the step from scheduling entirely.
    #[serde(default)]
    pub ignore: bool,
    /// A non-zero exit does not fail the pipeline.
    #[serde(default, alias = "ignore-failure")]
    pub ignore_failure: bool,
    #[serde(default, alias = "keep-alive")]
    pub keep_alive: KeepAlive,
    #[serde(default)]
    pub stdout: LogConfig,
    #[serde(default)]
    pub stderr: LogConfig,
    /// Participates in selective-run filtering.
    #[serde(default)]
    pub selected: bool,
    #[serde(default, rename = "type")]
    pub kind: StepKind,
}

/// Build instructions; their presence means the image is built rather
/// than pulled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub args: MappingWithEquals,
}

/// A containerized unit of the pipeline. Services and steps share this
/// model; `detach` and `meta.kind` record which section an entry came
/// from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, rename = "build")]
    pub build_info: Option<BuildInfo>,
    #[serde(default)]
    pub command: StringOrStringSlice,
    #[serde(default)]
    pub entrypoint: StringOrStringSlice,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: StringMapOrStringSlice,
    #[serde(default, alias = "depends-on")]
    pub depends_on: StringSet,
    #[serde(default)]
    pub after: StringSet,
    /// Reserved; verified on decode, ignored by the scheduler.
    #[serde(default)]
    pub role: Option<String>,
    #[serde(skip)]
    pub detach: bool,
    #[serde(skip)]
    pub meta: ServiceMeta,
    #[serde(skip)]
    pub color: Color,
}

impl Step {
    /// The merged dependency edge set (`after` and `depends_on`).
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.after
            .iter()
            .chain(self.depends_on.iter())
            .map(String::as_str)
            .collect()
    }

    /// Container name used for `run`, `kill` and `rm` engine calls.
    pub fn container_name(&self, project: &str) -> String {
        format!("{}_{}", project, self.name)
    }

    /// The step's colored log prefix.
    pub fn prefix(&self) -> String {
        self.color.prefix(&self.name)
    }
}

/// Raw shape of the definition document: two sibling maps.
#[derive(Debug, Default, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    services: HashMap<String, Step>,
    #[serde(default)]
    steps: HashMap<String, Step>,
}

/// The decoded and merged pipeline definition.
#[derive(Debug, Default)]
pub struct Definition {
    pub version: Option<String>,
    /// All services and steps under one metadata model, keyed by name.
    pub steps: HashMap<String, Step>,
}

impl Definition {
    /// Load a definition with the built-in directive set.
    pub fn load(path: Option<&Path>, env: &mut Environment) -> Result<Definition> {
        Self::load_with(&Preprocessor::new(), path, env)
    }

    /// Load a definition through a caller-provided preprocessor.
    pub fn load_with(
        preprocessor: &Preprocessor,
        path: Option<&Path>,
        env: &mut Environment,
    ) -> Result<Definition> {
        let path = resolve_definition_path(path)?;
        let raw = fs::read_to_string(&path)?;
        Self::parse(preprocessor, &raw, env)
    }

    /// Preprocess and decode raw definition text, then merge with the
    /// environment's metadata.
    pub fn parse(
        preprocessor: &Preprocessor,
        raw: &str,
        env: &mut Environment,
    ) -> Result<Definition> {
        let text = preprocessor.apply(raw, env)?;
        let file: DefinitionFile = serde_yaml::from_str(&text)?;
        Self::merge(file, env)
    }

    fn merge(file: DefinitionFile, env: &Environment) -> Result<Definition> {
        for name in file.steps.keys() {
            if file.services.contains_key(name) {
                return Err(GantryError::reference(format!(
                    "duplicate step name '{}' appears in both services and steps",
                    name
                )));
            }
        }

        let mut steps = HashMap::with_capacity(file.services.len() + file.steps.len());
        for (name, mut step) in file.services {
            step.detach = true;
            step.meta.kind = StepKind::Service;
            steps.insert(name, step);
        }
        for (name, mut step) in file.steps {
            step.detach = false;
            step.meta.kind = StepKind::Step;
            step.meta.keep_alive = KeepAlive::No;
            steps.insert(name, step);
        }

        // Stable name and color assignment regardless of map order.
        let mut names: Vec<String> = steps.keys().cloned().collect();
        names.sort();
        for (index, name) in names.iter().enumerate() {
            let step = steps.get_mut(name).expect("name taken from the map");
            step.name = name.clone();
            if step.image.is_empty() {
                step.image = sanitize_name(name);
            }
            step.color = Color::from_index(index);
        }

        // Overlay the environment's per-name metadata. Unknown selected
        // names are fatal; unknown ignored names are tolerated.
        for (name, meta) in &env.steps {
            match steps.get_mut(name) {
                Some(step) => {
                    let kind = step.meta.kind;
                    step.meta = meta.clone();
                    step.meta.kind = kind;
                }
                None if meta.selected => {
                    return Err(GantryError::reference(format!(
                        "no such service or step '{}'",
                        name
                    )));
                }
                None => {}
            }
        }

        Ok(Definition {
            version: file.version,
            steps,
        })
    }
}

fn resolve_definition_path(path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    for candidate in DEFAULT_DEFINITION_FILES {
        let candidate = Path::new(candidate);
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
    }
    Err(GantryError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!(
            "no definition file found (tried {})",
            DEFAULT_DEFINITION_FILES.join(", ")
        ),
    )))
}

/// Lowercased form with everything outside `[a-z0-9_.-]` replaced, used
/// for default image tags and project names.
pub fn sanitize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str, env: &mut Environment) -> Result<Definition> {
        Definition::parse(&Preprocessor::new(), raw, env)
    }

    #[test]
    fn test_services_and_steps_are_unified() {
        let raw = "services:\n  db:\n    image: postgres\nsteps:\n  migrate:\n    image: migrator\n    after: [db]\n";
        let mut env = Environment::default();
        let def = parse(raw, &mut env).unwrap();

        let db = &def.steps["db"];
        assert!(db.detach);
        assert_eq!(db.meta.kind, StepKind::Service);
        assert_eq!(db.image, "postgres");

        let migrate = &def.steps["migrate"];
        assert!(!migrate.detach);
        assert_eq!(migrate.meta.kind, StepKind::Step);
        assert_eq!(migrate.meta.keep_alive, KeepAlive::No);
        assert!(migrate.after.contains("db"));
    }

    #[test]
    fn test_duplicate_name_across_sections_fails() {
        let raw = "services:\n  db:\n    image: postgres\nsteps:\n  db:\n    image: other\n";
        let mut env = Environment::default();
        let err = parse(raw, &mut env).unwrap_err();
        assert!(err.to_string().contains("duplicate step name 'db'"));
    }

    #[test]
    fn test_image_defaults_to_sanitized_name() {
        let raw = "steps:\n  Build App:\n    command: make\n";
        let mut env = Environment::default();
        let def = parse(raw, &mut env).unwrap();
        assert_eq!(def.steps["Build App"].image, "build_app");
    }

    #[test]
    fn test_colors_assigned_deterministically() {
        let raw = "steps:\n  a: {}\n  b: {}\n";
        let mut env = Environment::default();
        let first = parse(raw, &mut env).unwrap();

        let mut env = Environment::default();
        let second = parse(raw, &mut env).unwrap();

        assert_eq!(first.steps["a"].color, second.steps["a"].color);
        assert_eq!(first.steps["b"].color, second.steps["b"].color);
        assert_ne!(first.steps["a"].color, first.steps["b"].color);
    }

    #[test]
    fn test_environment_meta_is_overlaid() {
        let raw = "services:\n  db:\n    image: postgres\n";
        let mut env = Environment::default();
        env.steps.insert(
            "db".to_string(),
            ServiceMeta {
                keep_alive: KeepAlive::Replace,
                ignore_failure: true,
                ..ServiceMeta::default()
            },
        );

        let def = parse(raw, &mut env).unwrap();
        let db = &def.steps["db"];
        assert_eq!(db.meta.keep_alive, KeepAlive::Replace);
        assert!(db.meta.ignore_failure);
        // the section still decides the kind
        assert_eq!(db.meta.kind, StepKind::Service);
    }

    #[test]
    fn test_unknown_selected_name_is_fatal() {
        let raw = "steps:\n  a: {}\n";
        let mut env = Environment::default();
        env.steps.insert(
            "ghost".to_string(),
            ServiceMeta {
                selected: true,
                ..ServiceMeta::default()
            },
        );
        let err = parse(raw, &mut env).unwrap_err();
        assert!(err.to_string().contains("no such service or step 'ghost'"));
    }

    #[test]
    fn test_unknown_ignored_name_is_tolerated() {
        let raw = "steps:\n  a: {}\n";
        let mut env = Environment::default();
        env.steps.insert(
            "ghost".to_string(),
            ServiceMeta {
                ignore: true,
                ..ServiceMeta::default()
            },
        );
        assert!(parse(raw, &mut env).is_ok());
    }

    #[test]
    fn test_tolerant_fields_decode() {
        let raw = concat!(
            "steps:\n",
            "  build:\n",
            "    command: make all\n",
            "    entrypoint: [sh, -c]\n",
            "    environment:\n",
            "      MODE: release\n",
            "    build:\n",
            "      context: .\n",
            "      args: [VERSION=1, BARE]\n",
            "    after: other\n",
            "  other: {}\n",
        );
        let mut env = Environment::default();
        let def = parse(raw, &mut env).unwrap();
        let build = &def.steps["build"];

        assert_eq!(build.command.0, vec!["make all".to_string()]);
        assert_eq!(build.entrypoint.0, vec!["sh".to_string(), "-c".to_string()]);
        assert_eq!(build.environment.0, vec!["MODE=release".to_string()]);
        assert!(build.after.contains("other"));

        let info = build.build_info.as_ref().unwrap();
        assert_eq!(info.context.as_deref(), Some("."));
        assert_eq!(info.args.get("VERSION"), Some(&Some("1".to_string())));
        assert_eq!(info.args.get("BARE"), Some(&None));
    }

    #[test]
    fn test_dependencies_merges_both_fields() {
        let raw = "steps:\n  a: {}\n  b: {}\n  c:\n    after: [a]\n    depends_on: [b]\n";
        let mut env = Environment::default();
        let def = parse(raw, &mut env).unwrap();
        let deps = def.steps["c"].dependencies();
        assert!(deps.contains("a"));
        assert!(deps.contains("b"));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My Service!"), "my_service_");
        assert_eq!(sanitize_name("db-1.2"), "db-1.2");
    }
}
