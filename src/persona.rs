//! Persona catalog
//!
//! A persona is a named role (the system-level SOVREN AI persona or one of
//! the executive personas) that can be assigned to a call and owns a voice
//! model. Profiles are built from a static catalog at startup and live only
//! in memory.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tier::RequiredTier;
use crate::{Error, Result};

/// Identifier of the always-on system persona
pub const SYSTEM_PERSONA_ID: &str = "sovren-ai";

/// Capacity marker for personas that accept any number of calls
pub const UNBOUNDED_CALLS: u32 = u32::MAX;

/// Stable persona key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PersonaId(String);

impl PersonaId {
    /// Create a persona id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersonaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PersonaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PersonaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for PersonaId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PersonaId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for PersonaId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Whether a persona can currently take calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Availability {
    /// Idle and reachable
    #[default]
    Available,
    /// Handling calls but may take more while under capacity
    Busy,
    /// Locked into a call that must not be shared
    InCall,
    /// Not reachable
    Offline,
}

impl Availability {
    /// Whether the status admits new calls (capacity permitting)
    #[must_use]
    pub const fn accepts_calls(self) -> bool {
        matches!(self, Self::Available | Self::Busy)
    }
}

/// Persona classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonaKind {
    /// The system-level persona, used as the routing fallback
    System,
    /// An executive role persona
    #[default]
    Executive,
}

/// Voice characteristics of a persona's model
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VoiceTraits {
    /// Voice gender label
    pub gender: Option<String>,

    /// Speaking style (e.g. "authoritative", "warm")
    pub style: Option<String>,

    /// Primary language (BCP 47 code)
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for VoiceTraits {
    fn default() -> Self {
        Self {
            gender: None,
            style: None,
            language: default_language(),
        }
    }
}

/// A persona as seen by routing and synthesis
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PersonaProfile {
    /// Stable key
    pub id: PersonaId,

    /// Human name of the persona
    pub display_name: String,

    /// Role label (e.g. "Chief Financial Officer")
    pub display_role: String,

    /// Classification
    #[serde(default)]
    pub kind: PersonaKind,

    /// Preference in ties (higher wins)
    #[serde(default)]
    pub priority: i32,

    /// Keywords this persona specializes in
    #[serde(default)]
    pub specializations: BTreeSet<String>,

    /// Current availability
    #[serde(default)]
    pub availability: Availability,

    /// Calls currently assigned
    #[serde(default)]
    pub current_load: u32,

    /// Concurrent call limit
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: u32,

    /// Voice model used for synthesis
    pub voice_model_id: String,

    /// Subscription tier needed to reach this persona
    #[serde(default)]
    pub required_tier: RequiredTier,

    /// Voice characteristics
    #[serde(default)]
    pub voice: VoiceTraits,
}

impl PersonaProfile {
    /// Whether the persona can take one more call right now
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.availability.accepts_calls() && self.current_load < self.max_concurrent_calls
    }

    /// Whether the persona accepts any number of calls
    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.max_concurrent_calls == UNBOUNDED_CALLS
    }

    /// Whether the persona lists a specialization (case-insensitive)
    #[must_use]
    pub fn specializes_in(&self, keyword: &str) -> bool {
        let keyword = keyword.to_lowercase();
        self.specializations
            .iter()
            .any(|s| s.to_lowercase() == keyword)
    }

    /// Check catalog invariants for this profile
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the id or voice model is empty, the call
    /// limit is zero, or the load already exceeds the limit
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(Error::Config("persona id must not be empty".to_string()));
        }
        if self.voice_model_id.trim().is_empty() {
            return Err(Error::Config(format!(
                "persona {} has no voice model",
                self.id
            )));
        }
        if self.max_concurrent_calls == 0 {
            return Err(Error::Config(format!(
                "persona {} must allow at least one concurrent call",
                self.id
            )));
        }
        if self.current_load > self.max_concurrent_calls {
            return Err(Error::Config(format!(
                "persona {} starts above capacity",
                self.id
            )));
        }
        Ok(())
    }
}

/// Validate a whole catalog: per-profile checks plus unique ids
///
/// # Errors
///
/// Returns `Error::Config` on the first invalid profile or duplicate id
pub fn validate_catalog(catalog: &[PersonaProfile]) -> Result<()> {
    if catalog.is_empty() {
        return Err(Error::Config("persona catalog is empty".to_string()));
    }

    let mut seen = BTreeSet::new();
    for persona in catalog {
        persona.validate()?;
        if !seen.insert(persona.id.as_str()) {
            return Err(Error::Config(format!("duplicate persona id: {}", persona.id)));
        }
    }
    Ok(())
}

// Default value functions

const fn default_max_concurrent_calls() -> u32 {
    3
}

fn default_language() -> String {
    "en".to_string()
}

#[allow(clippy::too_many_arguments)]
fn executive(
    id: &str,
    name: &str,
    role: &str,
    priority: i32,
    specializations: &[&str],
    voice_model_id: &str,
    required_tier: RequiredTier,
    gender: &str,
    style: &str,
) -> PersonaProfile {
    PersonaProfile {
        id: PersonaId::from(id),
        display_name: name.to_string(),
        display_role: role.to_string(),
        kind: PersonaKind::Executive,
        priority,
        specializations: specializations.iter().map(ToString::to_string).collect(),
        availability: Availability::Available,
        current_load: 0,
        max_concurrent_calls: default_max_concurrent_calls(),
        voice_model_id: voice_model_id.to_string(),
        required_tier,
        voice: VoiceTraits {
            gender: Some(gender.to_string()),
            style: Some(style.to_string()),
            language: default_language(),
        },
    }
}

/// The system-level persona with unbounded capacity
#[must_use]
pub fn system_persona() -> PersonaProfile {
    PersonaProfile {
        id: PersonaId::from(SYSTEM_PERSONA_ID),
        display_name: "SOVREN AI".to_string(),
        display_role: "Chief of Staff".to_string(),
        kind: PersonaKind::System,
        priority: 10,
        specializations: ["general", "scheduling", "triage"]
            .iter()
            .map(ToString::to_string)
            .collect(),
        availability: Availability::Available,
        current_load: 0,
        max_concurrent_calls: UNBOUNDED_CALLS,
        voice_model_id: "sovren_ai_voice".to_string(),
        required_tier: RequiredTier::All,
        voice: VoiceTraits {
            gender: Some("neutral".to_string()),
            style: Some("professional".to_string()),
            language: default_language(),
        },
    }
}

/// Built-in persona catalog: the system persona plus the executive team
#[must_use]
pub fn default_catalog() -> Vec<PersonaProfile> {
    use RequiredTier::{Tier1, Tier2};

    vec![
        system_persona(),
        executive(
            "cfo",
            "Sarah Chen",
            "Chief Financial Officer",
            9,
            &["budget", "finance", "revenue", "forecast", "audit"],
            "cfo_sarah_chen",
            Tier1,
            "female",
            "authoritative",
        ),
        executive(
            "cmo",
            "Marcus Rivera",
            "Chief Marketing Officer",
            7,
            &["marketing", "campaign", "brand", "growth"],
            "cmo_marcus_rivera",
            Tier1,
            "male",
            "friendly",
        ),
        executive(
            "cto",
            "Alex Kim",
            "Chief Technology Officer",
            8,
            &["technology", "engineering", "infrastructure", "security"],
            "cto_alex_kim",
            Tier1,
            "male",
            "professional",
        ),
        executive(
            "clo",
            "Diana Blackstone",
            "Chief Legal Officer",
            6,
            &["legal", "contract", "compliance", "litigation"],
            "clo_diana_blackstone",
            Tier1,
            "female",
            "authoritative",
        ),
        executive(
            "coo",
            "James Wright",
            "Chief Operating Officer",
            6,
            &["operations", "logistics", "supply", "process"],
            "coo_james_wright",
            Tier2,
            "male",
            "professional",
        ),
        executive(
            "chro",
            "Lisa Martinez",
            "Chief Human Resources Officer",
            4,
            &["hiring", "people", "culture", "benefits"],
            "chro_lisa_martinez",
            Tier2,
            "female",
            "warm",
        ),
        executive(
            "cso",
            "Robert Taylor",
            "Chief Strategy Officer",
            5,
            &["strategy", "partnership", "acquisition", "competition"],
            "cso_robert_taylor",
            Tier2,
            "male",
            "authoritative",
        ),
    ]
}
