//! Command-line templates for external tools.
//!
//! Arguments may contain placeholders that are resolved per unit:
//!
//! | Placeholder       | Resolves to                                   |
//! |-------------------|-----------------------------------------------|
//! | `{input:<kind>}`  | path of a declared input artifact             |
//! | `{output:<kind>}` | path where the tool must write a declared output |
//! | `{prefix}`        | `<stage dir>/<unit>`, for tools taking a prefix |
//! | `{workdir}`       | the unit's stage directory                    |
//! | `{unit}`          | the unit id                                   |
//! | `{threads}`       | threads granted to one tool invocation        |
//! | `{control}`       | the rendered control file                     |

use crate::core::{ArtifactKind, UnitId};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([a-z]+)(?::([A-Za-z0-9_.\-]+))?\}").expect("placeholder pattern is valid")
});

/// A parsed placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// `{input:<kind>}`
    Input(ArtifactKind),
    /// `{output:<kind>}`
    Output(ArtifactKind),
    /// `{prefix}`
    Prefix,
    /// `{workdir}`
    Workdir,
    /// `{unit}`
    Unit,
    /// `{threads}`
    Threads,
    /// `{control}`
    Control,
}

impl Placeholder {
    fn parse(name: &str, arg: Option<&str>) -> Result<Self, String> {
        match (name, arg) {
            ("input", Some(kind)) => kind.parse().map(Self::Input),
            ("output", Some(kind)) => kind.parse().map(Self::Output),
            ("prefix", None) => Ok(Self::Prefix),
            ("workdir", None) => Ok(Self::Workdir),
            ("unit", None) => Ok(Self::Unit),
            ("threads", None) => Ok(Self::Threads),
            ("control", None) => Ok(Self::Control),
            (name, Some(arg)) => Err(format!("unknown placeholder '{{{name}:{arg}}}'")),
            (name, None) => Err(format!("unknown placeholder '{{{name}}}'")),
        }
    }
}

/// Lists every placeholder in `text`.
///
/// # Errors
///
/// Returns a message naming the first unknown placeholder.
pub fn placeholders(text: &str) -> Result<Vec<Placeholder>, String> {
    PLACEHOLDER
        .captures_iter(text)
        .map(|caps| Placeholder::parse(&caps[1], caps.get(2).map(|m| m.as_str())))
        .collect()
}

/// Values substituted into a template for one unit.
#[derive(Debug, Clone)]
pub struct CommandContext<'a> {
    /// Resolved input paths.
    pub inputs: &'a BTreeMap<ArtifactKind, PathBuf>,
    /// Paths the tool must write.
    pub outputs: &'a BTreeMap<ArtifactKind, PathBuf>,
    /// The unit's stage directory.
    pub workdir: &'a Path,
    /// The unit.
    pub unit: &'a UnitId,
    /// Threads per invocation.
    pub threads: usize,
    /// The rendered control file, if the stage has one.
    pub control: Option<&'a Path>,
}

impl CommandContext<'_> {
    /// Returns `<workdir>/<unit>`.
    #[must_use]
    pub fn prefix(&self) -> PathBuf {
        self.workdir.join(self.unit.to_string())
    }

    /// Substitutes every placeholder in `text`.
    ///
    /// # Errors
    ///
    /// Returns a message when a placeholder is unknown or refers to an
    /// artifact the stage does not declare.
    pub fn render(&self, text: &str) -> Result<String, String> {
        let mut error = None;
        let rendered = PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| {
            match self.resolve(&caps[1], caps.get(2).map(|m| m.as_str())) {
                Ok(value) => value,
                Err(e) => {
                    if error.is_none() {
                        error = Some(e);
                    }
                    String::new()
                }
            }
        });
        match error {
            Some(e) => Err(e),
            None => Ok(rendered.into_owned()),
        }
    }

    fn resolve(&self, name: &str, arg: Option<&str>) -> Result<String, String> {
        let lookup = |map: &BTreeMap<ArtifactKind, PathBuf>, kind: &ArtifactKind, side: &str| {
            map.get(kind)
                .map(|p| p.display().to_string())
                .ok_or_else(|| format!("{side} '{kind}' is not declared by this stage"))
        };
        match Placeholder::parse(name, arg)? {
            Placeholder::Input(kind) => lookup(self.inputs, &kind, "input"),
            Placeholder::Output(kind) => lookup(self.outputs, &kind, "output"),
            Placeholder::Prefix => Ok(self.prefix().display().to_string()),
            Placeholder::Workdir => Ok(self.workdir.display().to_string()),
            Placeholder::Unit => Ok(self.unit.to_string()),
            Placeholder::Threads => Ok(self.threads.to_string()),
            Placeholder::Control => self
                .control
                .map(|p| p.display().to_string())
                .ok_or_else(|| "stage has no control file".to_string()),
        }
    }
}

/// Program and argument template of one external tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    /// Executable name or path.
    pub program: String,
    /// Argument templates.
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    /// Creates a new template.
    #[must_use]
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Lists placeholders used by the program and its arguments.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first unknown placeholder.
    pub fn placeholders(&self) -> Result<Vec<Placeholder>, String> {
        let mut found = placeholders(&self.program)?;
        for arg in &self.args {
            found.extend(placeholders(arg)?);
        }
        Ok(found)
    }

    /// Renders program and arguments for one unit.
    ///
    /// # Errors
    ///
    /// See [`CommandContext::render`].
    pub fn render(&self, ctx: &CommandContext<'_>) -> Result<(String, Vec<String>), String> {
        let program = ctx.render(&self.program)?;
        let args = self.args.iter().map(|a| ctx.render(a)).collect::<Result<Vec<_>, _>>()?;
        Ok((program, args))
    }
}
