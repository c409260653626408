//! Dependency manifest detection and requirement extraction.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::requirement::Requirement;

/// Supported manifest kinds, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ManifestKind {
    /// Plain pinned list.
    #[serde(rename = "requirements.txt")]
    PinnedList,
    /// Build-script package definition.
    #[serde(rename = "setup.py")]
    BuildScript,
    /// Declarative project manifest.
    #[serde(rename = "pyproject.toml")]
    ProjectManifest,
}

impl ManifestKind {
    /// Fixed, total detection order. First match wins.
    pub const PRIORITY: [ManifestKind; 3] = [
        ManifestKind::PinnedList,
        ManifestKind::BuildScript,
        ManifestKind::ProjectManifest,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::PinnedList => "requirements.txt",
            Self::BuildScript => "setup.py",
            Self::ProjectManifest => "pyproject.toml",
        }
    }
}

/// A detected manifest file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub kind: ManifestKind,
    pub path: PathBuf,
}

impl Manifest {
    /// Directory the manifest lives in.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Requirements this manifest declares.
    pub fn requirements(&self) -> Result<RequirementSet> {
        match self.kind {
            ManifestKind::PinnedList => {
                let mut set = RequirementSet::new();
                pinned_list_requirements(&self.path, &mut HashSet::new(), &mut set)?;
                Ok(set)
            }
            ManifestKind::BuildScript => Ok(build_script_requirements(&read(&self.path)?)),
            ManifestKind::ProjectManifest => project_manifest_requirements(&read(&self.path)?)
                .with_context(|| format!("parsing {}", self.path.display())),
        }
    }
}

/// Requirements extracted from a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementSet {
    pub requirements: Vec<Requirement>,
    /// False when some entry (editable install, URL, computed list, dynamic
    /// field) could not be turned into a checkable requirement.
    pub complete: bool,
}

impl RequirementSet {
    fn new() -> Self {
        Self {
            requirements: Vec::new(),
            complete: true,
        }
    }

    fn push_line(&mut self, line: &str) {
        match Requirement::parse(line) {
            Some(req) => self.requirements.push(req),
            None => self.complete = false,
        }
    }

    /// Whether checking the inventory against this set alone proves the
    /// dependencies are installed.
    pub fn is_conclusive(&self) -> bool {
        self.complete && !self.requirements.is_empty()
    }
}

/// Find the highest-priority manifest in `dir`.
pub fn detect(dir: &Path) -> Option<Manifest> {
    ManifestKind::PRIORITY.iter().find_map(|kind| {
        let path = dir.join(kind.file_name());
        path.is_file().then(|| Manifest { kind: *kind, path })
    })
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

// Installer options that neither add nor hide requirements.
const NEUTRAL_OPTIONS: [&str; 13] = [
    "-i",
    "--index-url",
    "--extra-index-url",
    "--no-index",
    "-f",
    "--find-links",
    "--trusted-host",
    "--pre",
    "--prefer-binary",
    "--only-binary",
    "--no-binary",
    "--require-hashes",
    "--use-feature",
];

/// Pinned list lines, following `-r` includes relative to the including
/// file. Each file is read at most once.
fn pinned_list_requirements(
    path: &Path,
    seen: &mut HashSet<PathBuf>,
    set: &mut RequirementSet,
) -> Result<()> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(key) {
        return Ok(());
    }

    let raw = read(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    for line in raw.lines() {
        let line = line.split(" #").next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if !line.starts_with('-') {
            // per-requirement options such as `--hash=...`
            let line = line.split(" --").next().unwrap_or("").trim();
            set.push_line(line);
            continue;
        }

        let (option, value) = split_option(line);
        match option {
            "-r" | "--requirement" if !value.is_empty() => {
                pinned_list_requirements(&dir.join(value), seen, set)?;
            }
            // constraint files pin versions without adding packages
            "-c" | "--constraint" => {}
            opt if NEUTRAL_OPTIONS.contains(&opt) => {}
            _ => set.complete = false,
        }
    }
    Ok(())
}

/// Splits `-r base.txt` and `--requirement=base.txt` into option and value.
fn split_option(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let value = line[end..].trim_start_matches(|c: char| c.is_whitespace() || c == '=');
    (&line[..end], value.trim())
}

/// Static extraction from `setup.py`: the `name=` literal (the package the
/// script installs) plus every string literal inside `install_requires=[...]`.
/// A computed name or requirement list makes the set incomplete.
fn build_script_requirements(raw: &str) -> RequirementSet {
    let mut set = RequirementSet::new();

    match keyword_string(raw, "name") {
        Some(name) => set.push_line(&name),
        None => set.complete = false,
    }

    if after_keyword(raw, "install_requires").is_some() {
        match keyword_list(raw, "install_requires") {
            Some(list) => {
                for literal in string_literals(list) {
                    set.push_line(&literal);
                }
            }
            None => set.complete = false,
        }
    }

    set
}

/// `project.name` plus `project.dependencies`. Optional-dependency groups
/// are extras the installer does not pull in, so they are not required.
fn project_manifest_requirements(raw: &str) -> Result<RequirementSet> {
    let doc: toml::Value = toml::from_str(raw)?;
    let mut set = RequirementSet::new();

    let Some(project) = doc.get("project") else {
        set.complete = false;
        return Ok(set);
    };

    match project.get("name").and_then(|v| v.as_str()) {
        Some(name) => set.push_line(name),
        None => set.complete = false,
    }

    let dynamic_deps = project
        .get("dynamic")
        .and_then(|v| v.as_array())
        .is_some_and(|fields| fields.iter().any(|f| f.as_str() == Some("dependencies")));
    if dynamic_deps {
        set.complete = false;
    }

    if let Some(deps) = project.get("dependencies") {
        match deps.as_array() {
            Some(deps) => {
                for dep in deps {
                    match dep.as_str() {
                        Some(line) => set.push_line(line),
                        None => set.complete = false,
                    }
                }
            }
            None => set.complete = false,
        }
    }

    Ok(set)
}

/// Position right after `keyword` `=` (skipping whitespace), if present.
fn after_keyword<'a>(raw: &'a str, keyword: &str) -> Option<&'a str> {
    let mut search = raw;
    while let Some(idx) = search.find(keyword) {
        let before_ok = search[..idx]
            .chars()
            .last()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '_'));
        let rest = search[idx + keyword.len()..].trim_start();
        if before_ok {
            if let Some(value) = rest.strip_prefix('=') {
                if !value.starts_with('=') {
                    return Some(value.trim_start());
                }
            }
        }
        search = &search[idx + keyword.len()..];
    }
    None
}

fn keyword_string(raw: &str, keyword: &str) -> Option<String> {
    let value = after_keyword(raw, keyword)?;
    string_literals(value).into_iter().next().filter(|_| {
        value.starts_with('"') || value.starts_with('\'')
    })
}

fn keyword_list<'a>(raw: &'a str, keyword: &str) -> Option<&'a str> {
    let value = after_keyword(raw, keyword)?.strip_prefix('[')?;
    let mut quote: Option<char> = None;
    for (i, c) in value.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, ']') => return Some(&value[..i]),
            _ => {}
        }
    }
    None
}

fn string_literals(src: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut quote: Option<char> = None;
    let mut current = String::new();
    for c in src.chars() {
        match quote {
            Some(q) if c == q => {
                out.push(std::mem::take(&mut current));
                quote = None;
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None => {}
        }
    }
    out
}
