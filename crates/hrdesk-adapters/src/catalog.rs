use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::validate::ValidationError;

const FALLBACK_CATEGORY: &str = "other";

/// Known halls and issue categories, loaded from `catalog.yaml`.
///
/// An empty list disables the corresponding check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub halls: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl Catalog {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing catalog yaml")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading catalog {}", path.display()))
    }

    fn find<'a>(list: &'a [String], value: &str) -> Option<&'a String> {
        let value = value.trim();
        list.iter().find(|known| known.trim().eq_ignore_ascii_case(value))
    }

    pub fn resolve_hall(&self, hall: &str) -> Result<String, ValidationError> {
        if self.halls.is_empty() {
            return Ok(hall.to_string());
        }
        Self::find(&self.halls, hall)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownHall(hall.to_string()))
    }

    /// Canonical spelling of `category`, falling back to the catalog's "Other" entry.
    pub fn resolve_category(&self, category: &str) -> Result<String, ValidationError> {
        if self.categories.is_empty() {
            return Ok(category.to_string());
        }
        Self::find(&self.categories, category)
            .or_else(|| Self::find(&self.categories, FALLBACK_CATEGORY))
            .cloned()
            .ok_or_else(|| ValidationError::UnknownCategory(category.to_string()))
    }
}
