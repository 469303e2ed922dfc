//! Project file loading.

use crate::model::Project;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Loads a project from a single YAML file or from every YAML file of a
/// directory.
#[derive(Debug, Default)]
pub struct ProjectLoader {
    /// Files and directories loaded by [`ProjectLoader::load_all`].
    pub paths: Vec<PathBuf>,
}

impl ProjectLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load one project file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Project> {
        let path = path.as_ref();
        info!("Loading project from {}", path.display());

        let (project, _) = read_project(path)?;
        debug!(
            "Loaded {} apis, {} scenarios, {} suites from {}",
            project.apis.len(),
            project.scenarios.len(),
            project.suites.len(),
            path.display()
        );
        Ok(project)
    }

    /// Load and merge every `.yaml` / `.yml` file of `dir`, in file name
    /// order. The `config` section is taken from the first file that has
    /// one.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Project> {
        let dir = dir.as_ref();
        info!("Loading project files from directory: {}", dir.display());

        let mut files = Vec::new();
        for entry in fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_project_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut merged = Project::default();
        let mut config_from: Option<PathBuf> = None;
        for path in &files {
            let (project, has_config) = read_project(path)?;
            if has_config {
                match &config_from {
                    None => {
                        merged.config = project.config.clone();
                        config_from = Some(path.clone());
                    }
                    Some(first) => warn!(
                        "Ignoring config section of {}, already taken from {}",
                        path.display(),
                        first.display()
                    ),
                }
            }
            merged.merge(project);
        }

        info!("Loaded {} project files from {}", files.len(), dir.display());
        Ok(merged)
    }

    /// Load a file or a directory.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Project> {
        let path = path.as_ref();
        if path.is_dir() {
            self.load_dir(path)
        } else {
            self.load_file(path)
        }
    }

    /// Load every configured path into one project.
    pub fn load_all(&self) -> Result<Project> {
        let mut merged = Project::default();
        let mut has_config = false;
        for path in &self.paths {
            let project = self.load(path)?;
            if !has_config {
                merged.config = project.config.clone();
                has_config = true;
            }
            merged.merge(project);
        }
        Ok(merged)
    }
}

/// Parse `path`, reporting whether it carries a `config` section.
fn read_project(path: &Path) -> Result<(Project, bool)> {
    let content = fs::read_to_string(path)
        .context(format!("Failed to read project file: {}", path.display()))?;
    let raw: serde_yaml::Value = serde_yaml::from_str(&content)
        .context(format!("Failed to parse YAML from {}", path.display()))?;
    let has_config = raw.get("config").is_some();
    let project: Project = serde_yaml::from_value(raw)
        .context(format!("Invalid project definition in {}", path.display()))?;
    Ok((project, has_config))
}

/// Return `true` for `.yaml` / `.yml` files.
fn is_project_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}
