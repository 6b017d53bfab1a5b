//! Worker profiles and the profile catalog.
//!
//! A [`WorkerProfile`] is a reusable agent configuration (model, capabilities,
//! tool grants, system prompt). Profiles may name a parent through `extends`;
//! [`ProfileCatalog::build`] resolves those chains once so readers always see
//! fully materialised profiles. The catalog is immutable and is replaced
//! wholesale on reload.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A named, reusable agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    /// Unique key.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Backend model identifier.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub supports_vision: Option<bool>,
    #[serde(default)]
    pub supports_web: Option<bool>,
    /// Routing tags matched against task text.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Tool name -> allowed.
    #[serde(default)]
    pub tools: BTreeMap<String, bool>,
    /// Permission grants passed through to the worker process.
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Parent profile id whose unset fields this profile inherits.
    #[serde(default)]
    pub extends: Option<String>,
}

impl WorkerProfile {
    /// Create a bare profile with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn vision(&self) -> bool {
        self.supports_vision.unwrap_or(false)
    }

    pub fn web(&self) -> bool {
        self.supports_web.unwrap_or(false)
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Fill every unset field from `parent`.
    fn inherit_from(&mut self, parent: &Self) {
        if self.name.is_empty() {
            self.name.clone_from(&parent.name);
        }
        if self.description.is_empty() {
            self.description.clone_from(&parent.description);
        }
        if self.model.is_none() {
            self.model.clone_from(&parent.model);
        }
        if self.supports_vision.is_none() {
            self.supports_vision = parent.supports_vision;
        }
        if self.supports_web.is_none() {
            self.supports_web = parent.supports_web;
        }
        for tag in &parent.tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
        for (tool, allowed) in &parent.tools {
            self.tools.entry(tool.clone()).or_insert(*allowed);
        }
        for perm in &parent.permissions {
            if !self.permissions.contains(perm) {
                self.permissions.push(perm.clone());
            }
        }
        if self.system_prompt.is_none() {
            self.system_prompt.clone_from(&parent.system_prompt);
        }
        if self.temperature.is_none() {
            self.temperature = parent.temperature;
        }
    }
}

/// Immutable, ordered catalog of resolved profiles.
#[derive(Debug, Clone, Default)]
pub struct ProfileCatalog {
    profiles: Vec<WorkerProfile>,
    index: HashMap<String, usize>,
}

impl ProfileCatalog {
    /// Build a catalog, resolving `extends` chains.
    ///
    /// Order is preserved from the input. Duplicate ids, unknown parents and
    /// inheritance cycles are rejected.
    pub fn build(profiles: Vec<WorkerProfile>) -> Result<Self> {
        let mut index = HashMap::with_capacity(profiles.len());
        for (i, profile) in profiles.iter().enumerate() {
            if profile.id.is_empty() {
                return Err(Error::Profile("profile id must not be empty".to_string()));
            }
            if index.insert(profile.id.clone(), i).is_some() {
                return Err(Error::Profile(format!("duplicate profile id: {}", profile.id)));
            }
        }

        let mut resolved = Vec::with_capacity(profiles.len());
        for profile in &profiles {
            resolved.push(resolve(profile, &profiles, &index)?);
        }

        Ok(Self {
            profiles: resolved,
            index,
        })
    }

    pub fn get(&self, id: &str) -> Option<&WorkerProfile> {
        self.index.get(id).map(|&i| &self.profiles[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Profiles in configuration order.
    pub fn profiles(&self) -> &[WorkerProfile] {
        &self.profiles
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.profiles.iter().map(|p| p.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn resolve(
    profile: &WorkerProfile,
    all: &[WorkerProfile],
    index: &HashMap<String, usize>,
) -> Result<WorkerProfile> {
    let mut out = profile.clone();
    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(profile.id.as_str());

    let mut parent_id = profile.extends.as_deref();
    while let Some(pid) = parent_id {
        if !seen.insert(pid) {
            return Err(Error::Profile(format!(
                "inheritance cycle through profile '{pid}' (from '{}')",
                profile.id
            )));
        }
        let parent = index.get(pid).map(|&i| &all[i]).ok_or_else(|| {
            Error::Profile(format!(
                "profile '{}' extends unknown profile '{pid}'",
                profile.id
            ))
        })?;
        out.inherit_from(parent);
        parent_id = parent.extends.as_deref();
    }

    Ok(out)
}
