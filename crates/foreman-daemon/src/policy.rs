//! Spawn policy evaluation.
//!
//! Pure functions over [`SpawnPolicyConfig`]. A field is resolved from the
//! profile's own entry, then the `default` entry, then a built-in default per
//! pathway (auto=false, on-demand/manual/warm-pool=true), so an unconfigured
//! profile can be used interactively but is never started at boot.

use std::fmt;

use serde::{Deserialize, Serialize};

use foreman_core::config::{SpawnPolicyConfig, SpawnPolicyEntry};

/// The route through which a spawn is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnPathway {
    /// Started by the daemon at boot.
    Auto,
    /// Started because a task needs it.
    OnDemand,
    /// Started by an explicit user command.
    Manual,
    /// Pre-spawned to sit idle in the warm pool.
    WarmPool,
}

impl SpawnPathway {
    pub const ALL: [Self; 4] = [Self::Auto, Self::OnDemand, Self::Manual, Self::WarmPool];

    const fn builtin_default(self) -> bool {
        match self {
            Self::Auto => false,
            Self::OnDemand | Self::Manual | Self::WarmPool => true,
        }
    }

    const fn field(self, entry: &SpawnPolicyEntry) -> Option<bool> {
        match self {
            Self::Auto => entry.auto_spawn,
            Self::OnDemand => entry.on_demand,
            Self::Manual => entry.allow_manual,
            Self::WarmPool => entry.warm_pool,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::OnDemand => "on-demand",
            Self::Manual => "manual",
            Self::WarmPool => "warm-pool",
        }
    }
}

impl fmt::Display for SpawnPathway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a caller wants a worker to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureReason {
    Manual,
    OnDemand,
}

impl From<EnsureReason> for SpawnPathway {
    fn from(reason: EnsureReason) -> Self {
        match reason {
            EnsureReason::Manual => Self::Manual,
            EnsureReason::OnDemand => Self::OnDemand,
        }
    }
}

/// Fully resolved policy for one profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectivePolicy {
    pub auto_spawn: bool,
    pub on_demand: bool,
    pub allow_manual: bool,
    pub warm_pool: bool,
    pub reuse_existing: bool,
}

/// Decide whether `profile_id` may be spawned through `pathway`.
pub fn can_spawn(policy: &SpawnPolicyConfig, profile_id: &str, pathway: SpawnPathway) -> bool {
    policy
        .profiles
        .get(profile_id)
        .and_then(|entry| pathway.field(entry))
        .or_else(|| pathway.field(&policy.default))
        .unwrap_or_else(|| pathway.builtin_default())
}

/// Whether an existing instance should be handed back instead of relaunching.
pub fn reuse_existing(policy: &SpawnPolicyConfig, profile_id: &str) -> bool {
    policy
        .profiles
        .get(profile_id)
        .and_then(|entry| entry.reuse_existing)
        .or(policy.default.reuse_existing)
        .unwrap_or(true)
}

pub fn effective(policy: &SpawnPolicyConfig, profile_id: &str) -> EffectivePolicy {
    EffectivePolicy {
        auto_spawn: can_spawn(policy, profile_id, SpawnPathway::Auto),
        on_demand: can_spawn(policy, profile_id, SpawnPathway::OnDemand),
        allow_manual: can_spawn(policy, profile_id, SpawnPathway::Manual),
        warm_pool: can_spawn(policy, profile_id, SpawnPathway::WarmPool),
        reuse_existing: reuse_existing(policy, profile_id),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(auto: Option<bool>, on_demand: Option<bool>) -> SpawnPolicyEntry {
        SpawnPolicyEntry {
            auto_spawn: auto,
            on_demand,
            ..SpawnPolicyEntry::default()
        }
    }

    #[test]
    fn unconfigured_profile_uses_builtin_defaults() {
        let policy = SpawnPolicyConfig::default();
        assert!(!can_spawn(&policy, "any", SpawnPathway::Auto));
        assert!(can_spawn(&policy, "any", SpawnPathway::OnDemand));
        assert!(can_spawn(&policy, "any", SpawnPathway::Manual));
        assert!(can_spawn(&policy, "any", SpawnPathway::WarmPool));
        assert!(reuse_existing(&policy, "any"));
    }

    #[test]
    fn default_entry_overrides_builtin() {
        let policy = SpawnPolicyConfig {
            default: entry(Some(true), Some(false)),
            ..SpawnPolicyConfig::default()
        };
        assert!(can_spawn(&policy, "any", SpawnPathway::Auto));
        assert!(!can_spawn(&policy, "any", SpawnPathway::OnDemand));
        assert!(can_spawn(&policy, "any", SpawnPathway::Manual));
    }

    #[test]
    fn profile_entry_overrides_default() {
        let mut policy = SpawnPolicyConfig {
            default: entry(Some(true), Some(false)),
            ..SpawnPolicyConfig::default()
        };
        policy
            .profiles
            .insert("vision".to_string(), entry(Some(false), None));

        assert!(!can_spawn(&policy, "vision", SpawnPathway::Auto));
        // falls through to the default entry
        assert!(!can_spawn(&policy, "vision", SpawnPathway::OnDemand));
        assert!(can_spawn(&policy, "coder", SpawnPathway::Auto));
    }

    #[test]
    fn every_pathway_is_independently_configurable() {
        for pathway in SpawnPathway::ALL {
            let mut denied = SpawnPolicyEntry::default();
            match pathway {
                SpawnPathway::Auto => denied.auto_spawn = Some(false),
                SpawnPathway::OnDemand => denied.on_demand = Some(false),
                SpawnPathway::Manual => denied.allow_manual = Some(false),
                SpawnPathway::WarmPool => denied.warm_pool = Some(false),
            }
            let mut policy = SpawnPolicyConfig::default();
            policy.profiles.insert("p".to_string(), denied);
            assert!(!can_spawn(&policy, "p", pathway), "{pathway} should be denied");
            for other in SpawnPathway::ALL.into_iter().filter(|o| *o != pathway) {
                assert_eq!(
                    can_spawn(&policy, "p", other),
                    other.builtin_default(),
                    "{other} should be untouched"
                );
            }
        }
    }

    #[test]
    fn effective_policy_resolves_all_fields() {
        let mut policy = SpawnPolicyConfig::default();
        policy.profiles.insert(
            "docs".to_string(),
            SpawnPolicyEntry {
                reuse_existing: Some(false),
                warm_pool: Some(false),
                ..SpawnPolicyEntry::default()
            },
        );
        let eff = effective(&policy, "docs");
        assert!(!eff.auto_spawn);
        assert!(eff.on_demand);
        assert!(!eff.warm_pool);
        assert!(!eff.reuse_existing);
    }

    #[test]
    fn ensure_reason_maps_to_pathway() {
        assert_eq!(SpawnPathway::from(EnsureReason::Manual), SpawnPathway::Manual);
        assert_eq!(
            SpawnPathway::from(EnsureReason::OnDemand),
            SpawnPathway::OnDemand
        );
    }
}
