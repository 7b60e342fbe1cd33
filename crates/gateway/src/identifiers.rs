//! Newtype domain identifiers.
//!
//! Every gateway concept that has an identity is represented as a distinct
//! newtype wrapping a `String`. This prevents accidentally interchanging, for
//! example, a [`SessionId`] with a [`UserId`] even though both are strings
//! under the hood.

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
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
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

string_id! {
    /// Identifies a logical exploration session.
    ///
    /// Supplied by callers that want several validations to share counters, or
    /// generated by the gateway (see [`SessionId::generate`]) for pool slots
    /// and sessions that arrive without one.
    SessionId
}

impl SessionId {
    /// Generates a fresh identifier of the form `<prefix>_<uuid>`.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}_{}", Uuid::new_v4().simple()))
    }
}

string_id! {
    /// Identifies the end user on whose behalf a guarded operation runs.
    ///
    /// Quota accounting is keyed on this value.
    UserId
}

string_id! {
    /// Names a protected resource guarded by its own circuit breaker
    /// (e.g. `"MCP_OPERATIONS"`).
    ResourceName
}

impl ResourceName {
    pub(crate) fn from_static(name: &'static str) -> Self {
        Self(name.to_string())
    }
}

string_id! {
    /// A lower-cased host name (e.g. `"kalshi.com"`).
    ///
    /// Used for allow-list matching and per-domain quota buckets.
    DomainName
}

impl DomainName {
    /// Extracts the host of `raw` as a [`DomainName`].
    ///
    /// Returns `None` when `raw` is not an absolute URL or has no host.
    pub fn from_url(raw: &str) -> Option<Self> {
        let parsed = url::Url::parse(raw).ok()?;
        parsed.host_str().and_then(|h| Self::new(h.to_ascii_lowercase()))
    }

    /// Canonical form of an allow-list entry: trimmed, stripped of leading
    /// and trailing dots, lower-cased. `None` if nothing is left.
    pub fn normalize_entry(raw: &str) -> Option<String> {
        let entry = raw.trim().trim_matches('.');
        (!entry.is_empty()).then(|| entry.to_ascii_lowercase())
    }

    /// Returns `true` if this domain equals `allowed` or is a subdomain of it.
    ///
    /// `allowed` is normalised first; an entry that normalises to nothing
    /// matches no domain.
    pub fn is_within(&self, allowed: &str) -> bool {
        let Some(allowed) = Self::normalize_entry(allowed) else {
            return false;
        };
        self.0 == allowed
            || (self.0.len() > allowed.len()
                && self.0.ends_with(allowed.as_str())
                && self.0.as_bytes()[self.0.len() - allowed.len() - 1] == b'.')
    }
}
