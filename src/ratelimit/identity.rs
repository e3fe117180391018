//! Identity key extraction.

use std::fmt;

/// Request property used when no identity rule is configured.
pub const DEFAULT_IDENTITY_PROPERTY: &str = "ip";

/// Something an identity key can be read from.
///
/// Implemented by the transport adapters for their request types.
pub trait IdentitySource {
    /// Value of a named request property, such as the peer address.
    fn property(&self, name: &str) -> Option<String>;

    /// Value of a named request header.
    fn header(&self, name: &str) -> Option<String>;
}

/// How a request is turned into an identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityRule {
    /// Use a request property
    Property(String),
    /// Use a request header
    Header(String),
}

impl IdentityRule {
    /// Build the rule from the two mutually exclusive options.
    ///
    /// Returns `None` when both are set.
    pub fn from_options(property: Option<&str>, header: Option<&str>) -> Option<Self> {
        match (property, header) {
            (Some(_), Some(_)) => None,
            (None, Some(header)) => Some(IdentityRule::Header(header.to_string())),
            (Some(property), None) => Some(IdentityRule::Property(property.to_string())),
            (None, None) => Some(IdentityRule::default()),
        }
    }

    /// Derive the identity key for a request.
    ///
    /// Requests with no value for the rule all share the empty key.
    pub fn key_for<R: IdentitySource + ?Sized>(&self, request: &R) -> String {
        let value = match self {
            IdentityRule::Property(name) => request.property(name),
            IdentityRule::Header(name) => request.header(name),
        };
        value.unwrap_or_default()
    }
}

impl Default for IdentityRule {
    fn default() -> Self {
        IdentityRule::Property(DEFAULT_IDENTITY_PROPERTY.to_string())
    }
}

impl fmt::Display for IdentityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityRule::Property(name) => write!(f, "property:{}", name),
            IdentityRule::Header(name) => write!(f, "header:{}", name),
        }
    }
}
