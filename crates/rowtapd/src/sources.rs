//! Configured sources: source id -> connection descriptor.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rowtap_connectors::ConnectionDescriptor;

/// The sources this daemon serves. The id doubles as the connector cache key.
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    sources: BTreeMap<String, ConnectionDescriptor>,
}

impl SourceCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sources file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid sources file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let sources: BTreeMap<String, ConnectionDescriptor> = serde_json::from_str(raw)?;
        for (id, descriptor) in &sources {
            if id.is_empty() {
                bail!("Source ids must not be empty");
            }
            if descriptor.table.is_empty() {
                bail!("Source '{}' has no table", id);
            }
        }
        Ok(Self { sources })
    }

    pub fn get(&self, id: &str) -> Option<&ConnectionDescriptor> {
        self.sources.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl FromIterator<(String, ConnectionDescriptor)> for SourceCatalog {
    fn from_iter<I: IntoIterator<Item = (String, ConnectionDescriptor)>>(iter: I) -> Self {
        Self {
            sources: iter.into_iter().collect(),
        }
    }
}
