//! JSON file registry.
//!
//! Every call re-reads the file so separate processes observe each other's
//! records. Mutations hold an exclusive lock on a sibling `<name>.lock` file
//! across the read, change and rename, so handles in different processes
//! never overwrite each other's entries.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Registry, RegistryEntry, RegistryError};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize)]
struct RegistryDocument {
    version: u32,
    #[serde(default)]
    entries: Vec<RegistryEntry>,
}

/// Registry persisted as a JSON document on the local file system.
#[derive(Debug)]
pub struct FileRegistry {
    path: Utf8PathBuf,
    guard: Mutex<()>,
}

impl FileRegistry {
    /// Creates a registry backed by `path`. The file is created lazily.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn update<T>(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, RegistryEntry>) -> T,
    ) -> Result<T, RegistryError> {
        self.exclusive(|| {
            let mut entries = self.read()?;
            let outcome = mutate(&mut entries);
            self.write(&entries)?;
            Ok(outcome)
        })
    }

    fn exclusive<T>(
        &self,
        work: impl FnOnce() -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let _held = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self.open_parent()?;
        let lock_name = format!("{}.lock", self.file_name()?);
        let lock_file = dir
            .open_with(&lock_name, OpenOptions::new().create(true).write(true))
            .map_err(|err| self.io_error(&err))?;
        let mut lock = RwLock::new(lock_file.into_std());
        let _locked = lock.write().map_err(|err| self.io_error(&err))?;
        work()
    }

    fn open_parent(&self) -> Result<Dir, RegistryError> {
        let parent = self.parent();
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| self.io_error(&err))?;
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| self.io_error(&err))
    }

    fn snapshot(&self) -> Result<BTreeMap<String, RegistryEntry>, RegistryError> {
        let _held = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.read()
    }

    fn parent(&self) -> &Utf8Path {
        match self.path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        }
    }

    fn file_name(&self) -> Result<&str, RegistryError> {
        self.path.file_name().ok_or_else(|| RegistryError::Io {
            path: self.path.clone(),
            message: String::from("registry path is missing a filename"),
        })
    }

    fn io_error(&self, err: &io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }

    fn read(&self) -> Result<BTreeMap<String, RegistryEntry>, RegistryError> {
        let file_name = self.file_name()?;
        let dir = match Dir::open_ambient_dir(self.parent(), ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(self.io_error(&err)),
        };
        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(self.io_error(&err)),
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let document: RegistryDocument =
            serde_json::from_str(&contents).map_err(|err| RegistryError::Corrupt {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        if document.version != FORMAT_VERSION {
            return Err(RegistryError::Corrupt {
                path: self.path.clone(),
                message: format!("unsupported registry version {}", document.version),
            });
        }
        Ok(document
            .entries
            .into_iter()
            .map(|entry| (entry.id(), entry))
            .collect())
    }

    fn write(&self, entries: &BTreeMap<String, RegistryEntry>) -> Result<(), RegistryError> {
        let file_name = self.file_name()?;
        let dir = self.open_parent()?;

        let document = RegistryDocument {
            version: FORMAT_VERSION,
            entries: entries.values().cloned().collect(),
        };
        let rendered =
            serde_json::to_string_pretty(&document).map_err(|err| RegistryError::Corrupt {
                path: self.path.clone(),
                message: err.to_string(),
            })?;

        let staging = format!(".{file_name}.{}.tmp", Uuid::new_v4().simple());
        dir.write(&staging, rendered)
            .map_err(|err| self.io_error(&err))?;
        dir.rename(&staging, &dir, file_name)
            .map_err(|err| self.io_error(&err))
    }
}

impl Registry for FileRegistry {
    fn register(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        self.update(|entries| {
            entries.entry(entry.id()).or_insert(entry);
        })
    }

    fn deregister(&self, id: &str) -> Result<bool, RegistryError> {
        self.exclusive(|| {
            let mut entries = self.read()?;
            if entries.remove(id).is_none() {
                return Ok(false);
            }
            self.write(&entries)?;
            Ok(true)
        })
    }

    fn get(&self, id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.snapshot()?.remove(id))
    }

    fn list_all(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self.snapshot()?.into_values().collect())
    }
}
