use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use super::Persona;
use crate::storage::{LockOptions, StoreError};

/// All personas found in one directory, keyed by lower-cased name.
///
/// Iteration (and therefore trigger resolution) follows lower-cased name
/// order, so two personas sharing a trigger always resolve the same way.
#[derive(Debug)]
pub struct PersonaRegistry {
    dir: PathBuf,
    default_name: String,
    default_timezone: String,
    lock: LockOptions,
    personas: BTreeMap<String, Persona>,
}

impl PersonaRegistry {
    pub fn new(dir: impl Into<PathBuf>, default_name: &str, lock: LockOptions) -> Self {
        Self {
            dir: dir.into(),
            default_name: default_name.to_lowercase(),
            default_timezone: "UTC".to_string(),
            lock,
            personas: BTreeMap::new(),
        }
    }

    pub fn with_default_timezone(mut self, tz: &str) -> Self {
        self.default_timezone = tz.to_string();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-read every `*.toml` file. Files load in sorted order; when two
    /// share a name the later file wins.
    pub fn reload(&mut self) {
        self.personas.clear();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => {
                warn!("Personas directory missing: {}", self.dir.display());
                return;
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().map(|x| x == "toml").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            match Persona::load(&path, &self.default_timezone, self.lock) {
                Ok(persona) => {
                    let key = persona.name.to_lowercase();
                    if let Some(previous) = self.personas.get(&key) {
                        warn!(
                            "Duplicate persona name '{}' in {} overrides {}",
                            persona.name,
                            path.display(),
                            previous.path.display()
                        );
                    }
                    self.personas.insert(key, persona);
                }
                Err(e) => error!("Failed to load persona {}: {}", path.display(), e),
            }
        }
        debug!("Loaded {} personas from {}", self.personas.len(), self.dir.display());
    }

    pub fn all(&self) -> impl Iterator<Item = &Persona> {
        self.personas.values()
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn get_default(&self) -> Option<&Persona> {
        self.personas.get(&self.default_name)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Persona> {
        self.personas.get(&name.to_lowercase())
    }

    pub fn get_by_name_mut(&mut self, name: &str) -> Option<&mut Persona> {
        self.personas.get_mut(&name.to_lowercase())
    }

    /// Case-insensitive exact match against each persona's triggers.
    pub fn find_by_trigger(&self, token: &str) -> Option<&Persona> {
        self.personas.values().find(|p| p.has_trigger(token))
    }

    /// Persist the runtime block of the named persona.
    pub fn write_runtime(&self, name: &str) -> Result<(), StoreError> {
        match self.get_by_name(name) {
            Some(persona) => persona.write_runtime(),
            None => Ok(()),
        }
    }
}
