use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Runtime id of the built-in assistant.
pub const CORE_RUNTIME_ID: &str = "synth";
/// Reserved identity key of the built-in assistant.
pub const CORE_IDENTITY_KEY: &str = "zen-001";
/// Identity key used when a runtime yields nothing usable, and the bucket orphaned threads
/// fall into.
pub const DEFAULT_IDENTITY_KEY: &str = CORE_IDENTITY_KEY;

pub const METADATA_IDENTITY_KEY: &str = "identity_key";
pub const METADATA_IS_CORE: &str = "is_core";
pub const METADATA_SYSTEM_PROMPT: &str = "system_prompt";

/// The assistant identity a user talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub key: String,
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RuntimeDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            key: id.clone(),
            id,
            name: name.into(),
            provider: provider.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn core() -> Self {
        Self::new(CORE_RUNTIME_ID, "Zen", "threadline").with_metadata(METADATA_IS_CORE, "true")
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_core(&self) -> bool {
        self.id.trim().eq_ignore_ascii_case(CORE_RUNTIME_ID)
            || self.key.trim().eq_ignore_ascii_case(CORE_RUNTIME_ID)
            || self
                .metadata
                .get(METADATA_IS_CORE)
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.metadata
            .get(METADATA_SYSTEM_PROMPT)
            .map(|prompt| prompt.trim())
            .filter(|prompt| !prompt.is_empty())
    }
}

impl Default for RuntimeDescriptor {
    fn default() -> Self {
        Self::core()
    }
}

/// Normalized, case-insensitive key that buckets threads by runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Trims and lowercases `raw`; blank input yields `None`.
    pub fn new(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() || normalized.chars().any(char::is_whitespace) {
            return None;
        }
        Some(Self(normalized))
    }

    pub fn default_key() -> Self {
        Self(DEFAULT_IDENTITY_KEY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_IDENTITY_KEY
    }

    /// Key with any instance suffix removed, so `lin-001` and `lin-002` share `lin`.
    pub fn family(&self) -> &str {
        family_prefix(&self.0)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Resolves the identity key of a runtime.
///
/// Priority: explicit `identity_key` metadata, then the core runtime's reserved key, then a
/// slug of the runtime id, then a slug of its display name, then the default key. Load-time
/// filtering and write-time tagging both go through here.
pub fn resolve_identity_key(runtime: &RuntimeDescriptor) -> IdentityKey {
    if let Some(explicit) = runtime
        .metadata
        .get(METADATA_IDENTITY_KEY)
        .and_then(|raw| IdentityKey::new(&slugify(raw)))
    {
        return explicit;
    }

    if runtime.is_core() {
        return IdentityKey(CORE_IDENTITY_KEY.to_string());
    }

    [runtime.id.as_str(), runtime.name.as_str()]
        .into_iter()
        .find_map(|raw| IdentityKey::new(&slugify(raw)))
        .unwrap_or_else(IdentityKey::default_key)
}

/// Strips a trailing `-NNN` instance suffix (three or more digits).
pub fn family_prefix(raw: &str) -> &str {
    match raw.rsplit_once('-') {
        Some((family, suffix))
            if !family.is_empty()
                && suffix.len() >= 3
                && suffix.chars().all(|ch| ch.is_ascii_digit()) =>
        {
            family
        }
        _ => raw,
    }
}

fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            slug.push(ch);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}
