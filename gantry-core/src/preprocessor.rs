// Definition Preprocessor
// Applies `#!` directives and variable expansion to the raw definition
// text before it reaches the YAML decoder

use crate::environment::Environment;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while extracting or executing directives.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("unknown directive '{0}'")]
    UnknownDirective(String),

    #[error("invalid directive '{line}': {message}")]
    Syntax { line: String, message: String },

    #[error("{function}: expected between {min} and {max} argument(s), got {got}")]
    Arity {
        function: String,
        min: usize,
        max: usize,
        got: usize,
    },

    #[error("{function}: a ${{VARIABLE}} argument is required")]
    MissingVariable { function: String },

    #[error("directive name '{0}' is already registered")]
    DuplicateName(String),

    #[error("{function}: {message}")]
    Failed { function: String, message: String },
}

/// A parsed `#! NAME [${VAR} [ARG …]]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub variable: Option<String>,
    pub args: Vec<String>,
}

impl Directive {
    /// Parse the payload following `#!`, already trimmed.
    fn parse(payload: &str) -> Result<Self, PreprocessError> {
        let mut tokens = payload.split(' ').filter(|token| !token.is_empty());
        let name = tokens.next().ok_or_else(|| PreprocessError::Syntax {
            line: payload.to_string(),
            message: "empty directive".to_string(),
        })?;

        let mut variable = None;
        let mut args = Vec::new();
        if let Some(token) = tokens.next() {
            let inner = token
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
                .filter(|inner| !inner.is_empty())
                .ok_or_else(|| PreprocessError::Syntax {
                    line: payload.to_string(),
                    message: format!("expected ${{VARIABLE}}, got '{}'", token),
                })?;
            variable = Some(inner.to_string());
            args = tokens.map(str::to_string).collect();
        }

        Ok(Directive {
            name: name.to_string(),
            variable,
            args,
        })
    }

    fn require_variable(&self) -> Result<&str, PreprocessError> {
        self.variable
            .as_deref()
            .ok_or_else(|| PreprocessError::MissingVariable {
                function: self.name.clone(),
            })
    }
}

/// Handler invoked for a matched directive.
pub type Handler =
    Box<dyn Fn(&mut Environment, &Directive) -> Result<(), PreprocessError> + Send + Sync>;

/// A registered directive: one handler reachable under one or more names.
pub struct Function {
    names: Vec<String>,
    description: String,
    min_args: usize,
    max_args: usize,
    requires_variable: bool,
    handler: Handler,
}

impl Function {
    pub fn new(
        names: &[&str],
        description: &str,
        min_args: usize,
        max_args: usize,
        requires_variable: bool,
        handler: Handler,
    ) -> Self {
        Self {
            names: names.iter().map(|name| name.to_string()).collect(),
            description: description.to_string(),
            min_args,
            max_args,
            requires_variable,
            handler,
        }
    }

    /// The names this directive answers to, in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn check(&self, directive: &Directive) -> Result<(), PreprocessError> {
        if self.requires_variable && directive.variable.is_none() {
            return Err(PreprocessError::MissingVariable {
                function: directive.name.clone(),
            });
        }
        if directive.args.len() < self.min_args || directive.args.len() > self.max_args {
            return Err(PreprocessError::Arity {
                function: directive.name.clone(),
                min: self.min_args,
                max: self.max_args,
                got: directive.args.len(),
            });
        }
        Ok(())
    }
}

/// The directive engine. Carries the built-in set and anything the
/// caller registers on top.
pub struct Preprocessor {
    functions: HashMap<String, Arc<Function>>,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Preprocessor {
    /// A preprocessor with the built-in directives registered.
    pub fn new() -> Self {
        let mut preprocessor = Self {
            functions: HashMap::new(),
        };
        for function in builtins() {
            preprocessor
                .register(function)
                .expect("built-in directive names are distinct");
        }
        preprocessor
    }

    /// Register an additional directive. Fails if any of its names is
    /// already taken.
    pub fn register(&mut self, function: Function) -> Result<(), PreprocessError> {
        for name in &function.names {
            if self.functions.contains_key(name) {
                return Err(PreprocessError::DuplicateName(name.clone()));
            }
        }
        let function = Arc::new(function);
        for name in &function.names {
            self.functions.insert(name.clone(), Arc::clone(&function));
        }
        Ok(())
    }

    /// The registered directives, each listed once even when it is
    /// reachable under several names, ordered by primary name.
    pub fn directives(&self) -> Vec<&Function> {
        let mut seen = HashSet::new();
        let mut entries: Vec<&Function> = self
            .functions
            .values()
            .filter(|function| seen.insert(Arc::as_ptr(function)))
            .map(|function| function.as_ref())
            .collect();
        entries.sort_by(|a, b| a.names[0].cmp(&b.names[0]));
        entries
    }

    /// Run the directive pass and variable expansion over raw text.
    ///
    /// Directives execute in textual order against the environment,
    /// short-circuiting on the first error; comments are dropped; the
    /// remaining lines are expanded with the possibly-mutated
    /// substitution map and rejoined with single newlines.
    pub fn apply(&self, input: &str, env: &mut Environment) -> Result<String, PreprocessError> {
        let mut directives = Vec::new();
        let mut normals = Vec::new();

        for line in input.lines() {
            let trimmed = line.trim_start();
            if let Some(payload) = trimmed.strip_prefix("#!") {
                directives.push(Directive::parse(payload.trim())?);
            } else if trimmed.starts_with('#') {
                // comment
            } else {
                normals.push(line);
            }
        }

        for directive in &directives {
            let function = self.functions.get(&directive.name).ok_or_else(|| {
                PreprocessError::UnknownDirective(directive.name.clone())
            })?;
            function.check(directive)?;
            (function.handler)(env, directive)?;
        }

        let expanded: Vec<String> = normals
            .iter()
            .map(|line| expand(line, env.substitutions()))
            .collect();
        Ok(expanded.join("\n"))
    }
}

/// Expand `$VAR` and `${VAR}` using the substitution map. Unknown or
/// null-valued variables expand to the empty string; a bare `$` with
/// neither braces nor an identifier stays literal.
pub fn expand(line: &str, substitutions: &HashMap<String, Option<String>>) -> String {
    let lookup = |name: &str| -> String {
        substitutions
            .get(name)
            .and_then(|value| value.clone())
            .unwrap_or_default()
    };

    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    out.push_str(&lookup(&name));
                } else {
                    // unterminated placeholder, keep it literal
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some(&next) if next.is_ascii_alphabetic() || next == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name));
            }
            _ => out.push('$'),
        }
    }

    out
}

/// The built-in directive set.
fn builtins() -> Vec<Function> {
    vec![
        Function::new(
            &["SET_IF_EMPTY"],
            "Set the variable to the given value unless it already has a non-empty value",
            1,
            1,
            true,
            Box::new(|env, directive| {
                let var = directive.require_variable()?;
                if !has_non_empty_value(env, var) {
                    env.set_substitution(var, Some(directive.args[0].clone()));
                }
                Ok(())
            }),
        ),
        Function::new(
            &["CHECK_IF_DIR_EXISTS"],
            "Fail unless the variable names an existing directory",
            0,
            0,
            true,
            Box::new(|env, directive| {
                let var = directive.require_variable()?;
                check_dir_exists(env, &directive.name, var)
            }),
        ),
        Function::new(
            &["TEMP_DIR_IF_EMPTY"],
            "Assign a freshly created temp directory unless the variable already names a directory",
            0,
            0,
            true,
            Box::new(|env, directive| {
                let var = directive.require_variable()?;
                if has_non_empty_value(env, var) {
                    return check_dir_exists(env, &directive.name, var);
                }
                let path = env.temp_dir(var).map_err(|e| PreprocessError::Failed {
                    function: directive.name.clone(),
                    message: format!("failed to create temp dir for ${{{}}}: {}", var, e),
                })?;
                env.set_substitution(var, Some(path.display().to_string()));
                Ok(())
            }),
        ),
    ]
}

fn has_non_empty_value(env: &Environment, var: &str) -> bool {
    matches!(env.substitution(var), Some(Some(value)) if !value.is_empty())
}

fn check_dir_exists(env: &Environment, function: &str, var: &str) -> Result<(), PreprocessError> {
    let value = match env.substitution(var) {
        Some(Some(value)) if !value.is_empty() => value.clone(),
        _ => {
            return Err(PreprocessError::Failed {
                function: function.to_string(),
                message: format!("variable ${{{}}} has no value", var),
            })
        }
    };
    let path = absolutize(Path::new(&value));
    if path.is_dir() {
        Ok(())
    } else {
        Err(PreprocessError::Failed {
            function: function.to_string(),
            message: format!(
                "'{}' is not an existing directory (variable ${{{}}})",
                path.display(),
                var
            ),
        })
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}
