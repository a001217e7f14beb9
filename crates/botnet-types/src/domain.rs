//! Domain classification shared by gossip and message routing.
//!
//! Every component that needs to know whether a name is a local bot, a
//! federated node, or garbage goes through [`classify_domain`]. Gossip source
//! attribution and message routing must agree on this answer, so there is
//! exactly one implementation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reserved prefix carried by every federated domain.
pub const FEDERATION_PREFIX: &str = "botnet.";

/// Result of classifying a domain name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainClass {
    /// A short on-node bot name with no dot.
    Local,
    /// A dotted name under the federation prefix.
    Federated,
    /// Anything else: empty, dotted without the prefix, or with empty labels.
    Invalid,
}

impl DomainClass {
    /// Returns `true` unless the class is [`DomainClass::Invalid`].
    pub fn is_valid(self) -> bool {
        !matches!(self, DomainClass::Invalid)
    }

    /// Lowercase name stored in the `from_type` / `to_type` columns.
    pub fn as_str(self) -> &'static str {
        match self {
            DomainClass::Local => "local",
            DomainClass::Federated => "federated",
            DomainClass::Invalid => "invalid",
        }
    }
}

impl fmt::Display for DomainClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(DomainClass::Local),
            "federated" => Ok(DomainClass::Federated),
            "invalid" => Ok(DomainClass::Invalid),
            _ => Err(format!("unknown domain class: {}", s)),
        }
    }
}

/// Classifies a domain name.
///
/// - no dot → [`DomainClass::Local`]
/// - starts with [`FEDERATION_PREFIX`] and every label after it is non-empty
///   → [`DomainClass::Federated`]
/// - any other name (including the empty string) → [`DomainClass::Invalid`]
///
/// The function is total and case-sensitive; it performs no trimming.
pub fn classify_domain(name: &str) -> DomainClass {
    if name.is_empty() {
        return DomainClass::Invalid;
    }
    if !name.contains('.') {
        return DomainClass::Local;
    }
    match name.strip_prefix(FEDERATION_PREFIX) {
        Some(rest) if !rest.is_empty() && rest.split('.').all(|label| !label.is_empty()) => {
            DomainClass::Federated
        }
        _ => DomainClass::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_free_names_are_local() {
        for name in ["khaar", "a", "bot-01", "BOTNET", "botnet", "local_agent"] {
            assert_eq!(classify_domain(name), DomainClass::Local, "{name}");
        }
    }

    #[test]
    fn prefixed_dotted_names_are_federated() {
        for name in [
            "botnet.example.com",
            "botnet.new.example",
            "botnet.x",
            "botnet.a.b.c.d",
        ] {
            assert_eq!(classify_domain(name), DomainClass::Federated, "{name}");
        }
    }

    #[test]
    fn other_dotted_names_are_invalid() {
        for name in [
            "example.com",
            "evil.botnet.com",
            "Botnet.example.com",
            "botnet.",
            "botnet..example",
            "botnet.example.",
            ".botnet.example",
            "bot.net",
            ".",
            "",
        ] {
            assert_eq!(classify_domain(name), DomainClass::Invalid, "{name:?}");
        }
    }

    #[test]
    fn whitespace_is_not_trimmed() {
        assert_eq!(classify_domain(" botnet.example"), DomainClass::Invalid);
        assert_eq!(classify_domain("bot name"), DomainClass::Local);
    }

    #[test]
    fn classification_is_deterministic() {
        let names = ["khaar", "botnet.a.b", "a.b", ""];
        for name in names {
            assert_eq!(classify_domain(name), classify_domain(name));
        }
    }

    #[test]
    fn class_round_trips_through_str() {
        for class in [DomainClass::Local, DomainClass::Federated, DomainClass::Invalid] {
            assert_eq!(class.to_string().parse::<DomainClass>(), Ok(class));
        }
        assert!("remote".parse::<DomainClass>().is_err());
    }
}
