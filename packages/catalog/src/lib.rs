// ABOUTME: Lab catalogue registry for the Rangelab training platform
// ABOUTME: Loads lab definitions from config/labs.json at compile time

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to load lab catalogue: {0}")]
    LoadError(String),
    #[error("Lab not found: {0}")]
    NotFound(String),
    #[error("Invalid lab definition: {0}")]
    InvalidConfig(String),
}

type Result<T> = std::result::Result<T, CatalogError>;

/// Resource limits for a lab's sandbox, in the human-readable form
/// accepted by container engines (e.g. "512m", "1.0").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory: String,
    pub cpus: String,
}

/// One exercise in the catalogue. The orchestrator consumes the
/// provisioning fields (image, ports, env_vars, limits, session_minutes,
/// per_user_cap, backend, active); the rest are descriptive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lab {
    pub id: String,
    pub name: String,
    pub difficulty: String,
    pub points: u32,
    pub image: String,
    pub ports: Vec<u16>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub limits: ResourceLimits,
    pub session_minutes: i64,
    pub per_user_cap: i64,
    pub backend: String,
    pub active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogConfig {
    version: String,
    labs: Vec<Lab>,
}

pub struct LabCatalog {
    labs: HashMap<String, Lab>,
}

impl LabCatalog {
    /// Create a new LabCatalog by loading labs from the embedded config file
    pub fn new() -> Result<Self> {
        let config_json = include_str!("../config/labs.json");
        let config: CatalogConfig = serde_json::from_str(config_json)
            .map_err(|e| CatalogError::LoadError(e.to_string()))?;

        let mut labs = HashMap::new();
        for lab in config.labs {
            if lab.ports.is_empty() {
                return Err(CatalogError::InvalidConfig(format!(
                    "lab {} declares no ports",
                    lab.id
                )));
            }
            labs.insert(lab.id.clone(), lab);
        }

        Ok(Self { labs })
    }

    /// Build a catalogue from an explicit lab list (test and embedding use)
    pub fn from_labs(labs: Vec<Lab>) -> Self {
        Self {
            labs: labs.into_iter().map(|l| (l.id.clone(), l)).collect(),
        }
    }

    /// Get a lab by ID
    pub fn get(&self, id: &str) -> Option<&Lab> {
        self.labs.get(id)
    }

    /// List all labs
    pub fn list(&self) -> Vec<&Lab> {
        self.labs.values().collect()
    }

    /// List labs currently open for provisioning
    pub fn list_active(&self) -> Vec<&Lab> {
        self.labs.values().filter(|lab| lab.active).collect()
    }

    /// Check if a lab exists
    pub fn exists(&self, id: &str) -> bool {
        self.labs.contains_key(id)
    }

    /// Validate that a lab ID references a valid lab
    pub fn validate_lab_id(&self, lab_id: &str) -> Result<()> {
        if self.exists(lab_id) {
            Ok(())
        } else {
            Err(CatalogError::NotFound(lab_id.to_string()))
        }
    }
}
