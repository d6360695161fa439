use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::Builder;

use crate::error::KiraError;

/// On-disk layout: a project-local root holding target collections and
/// mapping tables, and a shared cache for mapping tables reused across projects.
#[derive(Debug, Clone)]
pub struct Store {
    project_root: Utf8PathBuf,
    cache_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, KiraError> {
        let cwd = std::env::current_dir().map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let project_root = Utf8PathBuf::from_path_buf(cwd.join(".kira-genedoc"))
            .map_err(|_| KiraError::Filesystem("invalid project path".to_string()))?;

        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("kira-genedoc")).ok()
            })
            .ok_or_else(|| {
                KiraError::Filesystem("unable to resolve cache directory".to_string())
            })?;

        Ok(Self {
            project_root,
            cache_root,
        })
    }

    pub fn new_with_paths(project_root: Utf8PathBuf, cache_root: Utf8PathBuf) -> Self {
        Self {
            project_root,
            cache_root,
        }
    }

    /// Keeps the shared cache but moves the project root.
    pub fn with_project_root(mut self, project_root: Utf8PathBuf) -> Self {
        self.project_root = project_root;
        self
    }

    pub fn project_root(&self) -> &Utf8Path {
        &self.project_root
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn targets_dir(&self) -> Utf8PathBuf {
        self.project_root.join("targets")
    }

    pub fn target_path(&self, name: &str) -> Utf8PathBuf {
        self.targets_dir().join(format!("{name}.jsonl"))
    }

    pub fn project_mapping_path(&self, file: &Utf8Path) -> Utf8PathBuf {
        self.project_root.join("mappings").join(file)
    }

    pub fn cache_mapping_path(&self, file: &Utf8Path) -> Utf8PathBuf {
        self.cache_root.join("mappings").join(file)
    }

    /// Absolute paths are used as-is; relative ones are looked up in the
    /// project store first, then in the shared cache. The project location is
    /// returned when neither exists so the load error names it.
    pub fn resolve_mapping_path(&self, file: &Utf8Path) -> Utf8PathBuf {
        if file.is_absolute() || file.as_std_path().exists() {
            return file.to_path_buf();
        }
        let project = self.project_mapping_path(file);
        if project.as_std_path().exists() {
            return project;
        }
        let cache = self.cache_mapping_path(file);
        if cache.as_std_path().exists() {
            return cache;
        }
        project
    }

    pub fn ensure_project_root(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.project_root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn list_targets(&self) -> Result<Vec<String>, KiraError> {
        let dir = self.targets_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries =
            fs::read_dir(dir.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.extension().map(|ext| ext == "jsonl").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Writes through a temp file in the destination directory and renames it
    /// into place, so readers never observe a half-written file.
    pub fn write_atomic<F>(path: &Utf8Path, write: F) -> Result<(), KiraError>
    where
        F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
    {
        let parent = path
            .parent()
            .ok_or_else(|| KiraError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix("kira-genedoc")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file_mut());
            write(&mut writer).map_err(|err| KiraError::Filesystem(err.to_string()))?;
            writer
                .flush()
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        temp.persist(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(())
    }
}
