use std::io;
use std::path::PathBuf;

use tracing::debug;

/// Durable blob storage for generated scripts, keyed by name.
///
/// The analysis worker writes through the planning tools; the execution
/// worker reads by the name recorded on the analysis.
pub trait ScriptStore: Send + Sync {
    fn read_script(&self, name: &str) -> io::Result<String>;
    fn write_script(&self, name: &str, content: &str) -> io::Result<()>;
    fn list_scripts(&self) -> io::Result<Vec<String>>;
}

/// Filesystem-backed script store: one file per script under `dir`.
pub struct FsScriptStore {
    dir: PathBuf,
}

impl FsScriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Script names are plain file names; anything path-like is rejected so
    /// a generated name can never escape the store directory.
    fn path_for(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid script name: {name}"),
            ));
        }
        Ok(self.dir.join(name))
    }
}

impl ScriptStore for FsScriptStore {
    fn read_script(&self, name: &str) -> io::Result<String> {
        std::fs::read_to_string(self.path_for(name)?)
    }

    fn write_script(&self, name: &str, content: &str) -> io::Result<()> {
        let path = self.path_for(name)?;
        std::fs::write(&path, content)?;
        debug!(script = name, bytes = content.len(), "script saved");
        Ok(())
    }

    fn list_scripts(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
