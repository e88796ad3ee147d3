use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::graph::DependencyGraph;
use super::probe::ProbeSpec;
use crate::errors::{Error, Result};

/// Services managed by the orchestrator, as declared by the operator.
///
/// ```yaml
/// services:
///   - id: postgres
///     probe: { kind: tcp, address: "127.0.0.1:5432" }
///     common_names: [postgres, localhost]
///   - id: pgbouncer
///     depends_on: [postgres]
///     tls: false
///     restart_command: [docker, compose, restart, pgbouncer]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceManifest {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// TLS required unless explicitly disabled
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default)]
    pub probe: ProbeSpec,
    /// Database/login user written into the bootstrap record; defaults to the id
    #[serde(default)]
    pub username: Option<String>,
    /// Names the service's PKI role allows; defaults to the id, localhost and 127.0.0.1
    #[serde(default)]
    pub common_names: Vec<String>,
    #[serde(default)]
    pub extra_fields: BTreeMap<String, String>,
    /// Command the supervisor runs when the orchestrator requests a restart
    #[serde(default)]
    pub restart_command: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            tls: true,
            probe: ProbeSpec::None,
            username: None,
            common_names: Vec::new(),
            extra_fields: BTreeMap::new(),
            restart_command: Vec::new(),
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    pub fn with_probe(mut self, probe: ProbeSpec) -> Self {
        self.probe = probe;
        self
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.id)
    }

    pub fn role_names(&self) -> Vec<String> {
        if self.common_names.is_empty() {
            vec![self.id.clone(), "localhost".to_string(), "127.0.0.1".to_string()]
        } else {
            self.common_names.clone()
        }
    }
}

impl ServiceManifest {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(contents)
            .map_err(|e| Error::config(format!("Invalid service manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io(e, format!("Failed to read manifest {}", path.display())))?;
        Self::from_yaml(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        for service in &self.services {
            crate::secrets::validate_path(&service.id)?;
            if service.id == super::ORCHESTRATOR_NODE {
                return Err(Error::config(format!(
                    "service id '{}' is reserved for the orchestrator",
                    service.id
                )));
            }
        }
        self.graph().map(|_| ())
    }

    pub fn get(&self, id: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Dependency graph of the manifest services alone.
    pub fn graph(&self) -> Result<DependencyGraph> {
        DependencyGraph::new(self.services.iter().map(|s| (s.id.clone(), s.depends_on.clone())))
    }
}
