//! Project scaffolding
//!
//! Generates a ready-to-build server crate that depends on this framework and
//! ships one example tool. Templates are embedded at compile time.
//!
//! The generated manifest depends on the released framework version by
//! default. `FrameworkSource::Path` or `FrameworkSource::Git` point it at a
//! local checkout or a repository instead, for unreleased builds.

use std::fs;
use std::path::{Path, PathBuf};

use minijinja::{Environment, context};
use tracing::info;

use crate::core::error::{Result, ServerError};

const DEFAULT_AUTHOR: &str = "AIO MCP user";
const DEFAULT_GITHUB: &str = "https://github.com/your-username/your-repo";

/// (output path relative to the project root, template name, template source)
const TEMPLATES: &[(&str, &str, &str)] = &[
    (
        "Cargo.toml",
        "Cargo.toml",
        include_str!("../../templates/Cargo.toml.j2"),
    ),
    (
        "src/main.rs",
        "main.rs",
        include_str!("../../templates/main.rs.j2"),
    ),
    (
        "README.md",
        "README.md",
        include_str!("../../templates/README.md.j2"),
    ),
    (
        "config.json",
        "config.json",
        include_str!("../../templates/config.json.j2"),
    ),
];

/// Where a generated project takes the framework crate from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FrameworkSource {
    /// The published release matching this build
    #[default]
    Registry,
    /// A local checkout. Relative paths are resolved against the parent directory.
    Path(PathBuf),
    /// A git repository URL
    Git(String),
}

impl FrameworkSource {
    /// Right-hand side of the dependency line in the generated `Cargo.toml`.
    fn dependency(&self, parent_dir: &Path) -> String {
        match self {
            FrameworkSource::Registry => format!("\"{}\"", env!("CARGO_PKG_VERSION")),
            FrameworkSource::Path(path) => {
                let path = if path.is_relative() {
                    parent_dir.join(path)
                } else {
                    path.clone()
                };
                format!("{{ path = \"{}\" }}", escape_literal(&path.to_string_lossy()))
            }
            FrameworkSource::Git(url) => format!("{{ git = \"{}\" }}", escape_literal(url)),
        }
    }
}

/// Options for `create_project`. Only the name is required.
#[derive(Debug, Clone, Default)]
pub struct ProjectOptions {
    pub name: String,
    pub author: Option<String>,
    pub github: Option<String>,
    pub description: Option<String>,
    pub framework: FrameworkSource,
}

impl ProjectOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn github(mut self, github: impl Into<String>) -> Self {
        self.github = Some(github.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn framework_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.framework = FrameworkSource::Path(path.into());
        self
    }

    pub fn framework_git(mut self, url: impl Into<String>) -> Self {
        self.framework = FrameworkSource::Git(url.into());
        self
    }
}

/// Create a new server project named `options.name` under `parent_dir`.
///
/// Returns the path of the created project directory.
///
/// # Errors
/// - `ServerError::Config` for an empty or path-like project name
/// - `ServerError::ProjectExists` if the target directory is already there
/// - `ServerError::Template` / `ServerError::Io` if rendering or writing fails
pub fn create_project(parent_dir: &Path, options: &ProjectOptions) -> Result<PathBuf> {
    let name = options.name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(ServerError::Config(format!(
            "invalid project name '{}'",
            options.name
        )));
    }

    let root = parent_dir.join(name);
    if root.exists() {
        return Err(ServerError::ProjectExists(root));
    }

    let description = options
        .description
        .clone()
        .unwrap_or_else(|| format!("{name} - built on the AIO MCP server framework"));
    let author = options.author.as_deref().unwrap_or(DEFAULT_AUTHOR);
    let github = options.github.as_deref().unwrap_or(DEFAULT_GITHUB);

    let mut env = Environment::new();
    for (_, template_name, source) in TEMPLATES {
        env.add_template(template_name, source)?;
    }
    let ctx = context! {
        name => escape_literal(name),
        crate_name => crate_name(name),
        description => escape_literal(&description),
        author => escape_literal(author),
        github => escape_literal(github),
        framework_version => env!("CARGO_PKG_VERSION"),
        framework_dependency => options.framework.dependency(parent_dir),
    };

    // Render everything before touching the filesystem
    let mut rendered = Vec::with_capacity(TEMPLATES.len());
    for (path, template_name, _) in TEMPLATES {
        let mut body = env.get_template(template_name)?.render(&ctx)?;
        if !body.ends_with('\n') {
            body.push('\n');
        }
        rendered.push((root.join(path), body));
    }

    fs::create_dir_all(root.join("src"))?;
    for (path, body) in rendered {
        fs::write(&path, body)?;
    }

    info!(project = %root.display(), "Created MCP server project");
    Ok(root)
}

/// Cargo package name for a project: lowercase, with runs of anything outside
/// `[a-z0-9_-]` collapsed into a single dash.
fn crate_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "mcp-server".to_string()
    } else if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("mcp-{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Escape a value for a double-quoted TOML or Rust string literal.
fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}
