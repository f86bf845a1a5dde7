use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A capability an agent declares.
///
/// Declared as `"tag"` it matches exactly that tag. Declared as `"tag*"` it
/// matches every tag starting with `tag` (so `"translate.*"` covers
/// `"translate.fr"`, and a bare `"*"` covers everything).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    Exact(String),
    Prefix(String),
}

impl Capability {
    pub fn matches(&self, tag: &str) -> bool {
        match self {
            Capability::Exact(exact) => exact == tag,
            Capability::Prefix(prefix) => tag.starts_with(prefix.as_str()),
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("capability must not be empty".to_string());
        }
        match s.strip_suffix('*') {
            Some(prefix) if prefix.contains('*') => {
                Err(format!("wildcard only allowed at the end: {}", s))
            }
            Some(prefix) => Ok(Capability::Prefix(prefix.to_string())),
            None if s.contains('*') => Err(format!("wildcard only allowed at the end: {}", s)),
            None => Ok(Capability::Exact(s.to_string())),
        }
    }
}

impl TryFrom<String> for Capability {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.to_string()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Exact(exact) => write!(f, "{}", exact),
            Capability::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}

/// The set of capabilities declared by one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Parse declared capability strings, rejecting the whole set on the first bad entry.
    pub fn parse<I, S>(declared: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        declared
            .into_iter()
            .map(|s| s.as_ref().parse::<Capability>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.0.iter().any(|cap| cap.matches(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|c| c.to_string()).collect()
    }
}

/// Validate a required capability tag on a job. Tags are concrete; wildcards
/// belong to agent declarations only.
pub fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.trim().is_empty() {
        return Err("capability tag must not be empty".to_string());
    }
    if tag.contains('*') {
        return Err(format!("capability tag must not contain wildcards: {}", tag));
    }
    if tag.trim() != tag {
        return Err(format!("capability tag has surrounding whitespace: {:?}", tag));
    }
    Ok(())
}
