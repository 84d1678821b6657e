//! Subscription tier gating
//!
//! Tiers decide which personas (and therefore which voice models) a
//! subscriber may reach. A tier may inherit lower tiers, in which case its
//! allowed set is derived as the union of its own list and every inherited
//! tier's set. The derivation happens once in [`TierGate::new`], so a higher
//! tier can never lose a persona a lower tier grants.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::persona::PersonaProfile;
use crate::{Error, Result};

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum Tier {
    /// Entry tier ("basic")
    #[serde(rename = "tier1", alias = "basic")]
    Tier1,
    /// Full tier ("proof_plus")
    #[serde(rename = "tier2", alias = "proof_plus")]
    Tier2,
}

impl Tier {
    /// Tier callers fall back to when the requested tier is unknown
    #[must_use]
    pub const fn most_restrictive() -> Self {
        Self::Tier1
    }

    /// Canonical identifier
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tier1 => "tier1",
            Self::Tier2 => "tier2",
        }
    }

    /// Parse a tier, defaulting to the most restrictive one when unknown
    #[must_use]
    pub fn parse_or_restrictive(s: &str) -> Self {
        s.parse().unwrap_or_else(|e| {
            tracing::warn!(tier = %s, error = %e, "unknown tier, using most restrictive");
            Self::most_restrictive()
        })
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tier1" | "basic" => Ok(Self::Tier1),
            "tier2" | "proof_plus" | "proof+" | "proofplus" => Ok(Self::Tier2),
            other => Err(Error::Config(format!("unknown tier: {other}"))),
        }
    }
}

/// Tier a persona requires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredTier {
    /// Requires at least tier 1
    Tier1,
    /// Requires tier 2
    Tier2,
    /// Reachable from every tier
    #[default]
    All,
}

impl RequiredTier {
    /// The concrete tier, or `None` for [`RequiredTier::All`]
    #[must_use]
    pub const fn tier(self) -> Option<Tier> {
        match self {
            Self::Tier1 => Some(Tier::Tier1),
            Self::Tier2 => Some(Tier::Tier2),
            Self::All => None,
        }
    }
}

/// Static configuration of one tier
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierConfig {
    /// Tier identifier
    pub tier: Tier,

    /// Maximum number of personas the tier exposes
    pub max_personas: usize,

    /// Personas granted by this tier (empty = no id restriction)
    #[serde(default)]
    pub allowed_persona_ids: BTreeSet<String>,

    /// Capability flags unlocked by this tier
    #[serde(default)]
    pub features: BTreeSet<String>,

    /// Lower tiers this tier is a superset of
    #[serde(default)]
    pub inherits: Vec<Tier>,
}

/// Tier with its inheritance closure resolved
#[derive(Debug, Clone)]
struct ResolvedTier {
    max_personas: usize,
    /// Directly inherited tiers
    parents: Vec<Tier>,
    /// The tier itself plus every transitively inherited tier
    closure: BTreeSet<Tier>,
    allowed_ids: BTreeSet<String>,
    features: BTreeSet<String>,
}

/// Computes the personas and voices a subscription tier may use
#[derive(Debug, Clone)]
pub struct TierGate {
    tiers: BTreeMap<Tier, ResolvedTier>,
}

impl TierGate {
    /// Build a gate from tier configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on duplicate tiers, unknown or cyclic
    /// inheritance, a zero persona limit, or a superset tier whose limit is
    /// below the combined limits of the tiers it inherits
    pub fn new(configs: Vec<TierConfig>) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::Config("no tiers configured".to_string()));
        }

        let mut by_tier = BTreeMap::new();
        for config in configs {
            if config.max_personas == 0 {
                return Err(Error::Config(format!(
                    "tier {} must expose at least one persona",
                    config.tier
                )));
            }
            if by_tier.insert(config.tier, config).is_some() {
                return Err(Error::Config("duplicate tier configuration".to_string()));
            }
        }

        let mut tiers = BTreeMap::new();
        for (&tier, config) in &by_tier {
            let closure = inheritance_closure(tier, &by_tier)?;

            let parent_limit: usize = config
                .inherits
                .iter()
                .filter_map(|parent| by_tier.get(parent))
                .map(|parent| parent.max_personas)
                .sum();
            if config.max_personas < parent_limit {
                return Err(Error::Config(format!(
                    "tier {tier} allows {} personas but inherits {parent_limit}",
                    config.max_personas
                )));
            }

            let mut allowed_ids = BTreeSet::new();
            let mut features = BTreeSet::new();
            for member in &closure {
                if let Some(c) = by_tier.get(member) {
                    allowed_ids.extend(c.allowed_persona_ids.iter().cloned());
                    features.extend(c.features.iter().cloned());
                }
            }

            tiers.insert(
                tier,
                ResolvedTier {
                    max_personas: config.max_personas,
                    parents: config.inherits.clone(),
                    closure,
                    allowed_ids,
                    features,
                },
            );
        }

        tracing::debug!(tiers = tiers.len(), "tier gate configured");

        Ok(Self { tiers })
    }

    /// Resolve the personas a tier identifier may use
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the tier is unknown or not configured
    pub fn resolve_allowed_personas(
        &self,
        tier: &str,
        catalog: &[PersonaProfile],
    ) -> Result<Vec<PersonaProfile>> {
        self.resolve(tier.parse()?, catalog)
    }

    /// Resolve the personas a tier may use
    ///
    /// Personas granted by inherited tiers are always kept; the tier's own
    /// additions fill the remaining slots by descending priority. The result
    /// preserves catalog order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the tier is not configured
    pub fn resolve(&self, tier: Tier, catalog: &[PersonaProfile]) -> Result<Vec<PersonaProfile>> {
        let ids = self.resolve_ids(tier, catalog)?;
        Ok(catalog
            .iter()
            .filter(|p| ids.contains(p.id.as_str()))
            .cloned()
            .collect())
    }

    fn resolve_ids(&self, tier: Tier, catalog: &[PersonaProfile]) -> Result<HashSet<String>> {
        let resolved = self.get(tier)?;

        let mut ids = HashSet::new();
        for parent in &resolved.parents {
            ids.extend(self.resolve_ids(*parent, catalog)?);
        }

        let mut additions: Vec<&PersonaProfile> = catalog
            .iter()
            .filter(|p| !ids.contains(p.id.as_str()))
            .filter(|p| is_eligible(resolved, p))
            .collect();
        // Stable sort keeps catalog order among equal priorities
        additions.sort_by(|a, b| b.priority.cmp(&a.priority));

        let free = resolved.max_personas.saturating_sub(ids.len());
        ids.extend(
            additions
                .into_iter()
                .take(free)
                .map(|p| p.id.as_str().to_string()),
        );

        Ok(ids)
    }

    /// Voice model ids reachable from a tier
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the tier is not configured
    pub fn allowed_voice_profiles(
        &self,
        tier: Tier,
        catalog: &[PersonaProfile],
    ) -> Result<Vec<String>> {
        Ok(self
            .resolve(tier, catalog)?
            .into_iter()
            .map(|p| p.voice_model_id)
            .collect())
    }

    /// Capability flags unlocked by a tier (including inherited ones)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the tier is not configured
    pub fn features(&self, tier: Tier) -> Result<&BTreeSet<String>> {
        Ok(&self.get(tier)?.features)
    }

    /// Whether a tier unlocks a capability flag
    #[must_use]
    pub fn has_feature(&self, tier: Tier, feature: &str) -> bool {
        self.tiers
            .get(&tier)
            .is_some_and(|t| t.features.contains(feature))
    }

    /// Configured tiers, lowest first
    pub fn tiers(&self) -> impl Iterator<Item = Tier> + '_ {
        self.tiers.keys().copied()
    }

    fn get(&self, tier: Tier) -> Result<&ResolvedTier> {
        self.tiers
            .get(&tier)
            .ok_or_else(|| Error::Config(format!("tier {tier} is not configured")))
    }
}

fn is_eligible(resolved: &ResolvedTier, persona: &PersonaProfile) -> bool {
    let tier_ok = persona
        .required_tier
        .tier()
        .is_none_or(|required| resolved.closure.contains(&required));

    tier_ok && (resolved.allowed_ids.is_empty() || resolved.allowed_ids.contains(persona.id.as_str()))
}

fn inheritance_closure(root: Tier, configs: &BTreeMap<Tier, TierConfig>) -> Result<BTreeSet<Tier>> {
    let mut closure = BTreeSet::new();
    let mut stack = vec![(root, vec![root])];

    while let Some((tier, path)) = stack.pop() {
        closure.insert(tier);
        let config = configs
            .get(&tier)
            .ok_or_else(|| Error::Config(format!("tier {root} inherits unknown tier {tier}")))?;

        for &parent in &config.inherits {
            if path.contains(&parent) {
                return Err(Error::Config(format!(
                    "tier inheritance cycle through {parent}"
                )));
            }
            let mut next = path.clone();
            next.push(parent);
            stack.push((parent, next));
        }
    }

    Ok(closure)
}

/// Default tier layout: tier 2 is derived from tier 1
#[must_use]
pub fn default_tiers() -> Vec<TierConfig> {
    let set = |items: &[&str]| items.iter().map(ToString::to_string).collect();

    vec![
        TierConfig {
            tier: Tier::Tier1,
            max_personas: 5,
            allowed_persona_ids: set(&["sovren-ai", "cfo", "cmo", "cto", "clo"]),
            features: set(&["voice_calls", "executive_routing"]),
            inherits: Vec::new(),
        },
        TierConfig {
            tier: Tier::Tier2,
            max_personas: 9,
            allowed_persona_ids: set(&["coo", "chro", "cso"]),
            features: set(&["call_recording", "transcription", "priority_synthesis"]),
            inherits: vec![Tier::Tier1],
        },
    ]
}
