//! Newtype domain identifiers.
//!
//! Every concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example,
//! a [`PhaseName`] with a [`SiteId`] even though both are strings under the hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: string-backed
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a computation phase by its registered name.
    ///
    /// Names are unique per pipeline; they key the phase's one-time
    /// initialization flag (`PHASE:<name>`) and the `next_phase` cursor in the
    /// cache.
    PhaseName
}

string_id! {
    /// Identifies a participating site (a local party).
    ///
    /// The remote role receives its input keyed by site identifier.
    SiteId
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed, generated internally
// ---------------------------------------------------------------------------

/// Identifies a single external call handled by a node.
///
/// Generated fresh for every call; propagated through spans so all activity
/// from one call (including chained local-only phases) can be correlated. It
/// is never persisted in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    /// Generates a new random call identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// The fixed role a node plays in a run.
///
/// Roles come from configuration; they are never elected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A party holding private per-site input.
    Local,
    /// The single aggregator receiving every site's per-round output.
    Remote,
}

impl Role {
    /// Upper-case label used in cache keys and log file names.
    pub fn as_label(self) -> &'static str {
        match self {
            Role::Local => "LOCAL",
            Role::Remote => "REMOTE",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    /// Parses a role case-insensitively (`"local"`, `"REMOTE"`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Role::Local),
            "remote" => Ok(Role::Remote),
            other => Err(format!("invalid role '{other}', use one of: local, remote")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_ids_reject_empty() {
        assert!(PhaseName::new("").is_none());
        assert_eq!(PhaseName::new("collect").unwrap().as_str(), "collect");
        assert!(SiteId::new(String::new()).is_none());
    }

    #[test]
    fn test_role_parses_case_insensitively() {
        assert_eq!("LOCAL".parse::<Role>(), Ok(Role::Local));
        assert_eq!("remote".parse::<Role>(), Ok(Role::Remote));
        assert!("aggregator".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_label() {
        assert_eq!(Role::Remote.to_string(), "REMOTE");
        assert_eq!(
            serde_json::to_value(Role::Local).unwrap(),
            serde_json::json!("local")
        );
    }

    #[test]
    fn test_call_ids_are_unique() {
        assert_ne!(CallId::new_random(), CallId::new_random());
    }
}
