//! Workflow entity ids
//!
//! Definitions and instances are addressed by prefixed strings
//! (`wfd_<uuid>` / `wfi_<uuid>`) so an id names its entity kind wherever
//! it travels: coordination keys, task argument bundles, log lines. The
//! wrapped UUIDs are v7, keeping ids sortable by creation time under the
//! database indexes. Once assigned at submission an instance id is
//! treated as an opaque string and preserved verbatim by every layer.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when parsing workflow entity ids
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdParseError {
    /// The `wfd_`/`wfi_` prefix is missing or names another entity kind
    #[error("expected '{expected}_' prefix in id '{input}'")]
    BadPrefix {
        expected: &'static str,
        input: String,
    },

    /// The part after the prefix is not a UUID
    #[error("invalid UUID in id: {0}")]
    InvalidUuid(#[from] uuid::Error),
}

/// Strip `{prefix}_` from an id string, rejecting foreign prefixes
fn strip_id_prefix<'a>(prefix: &'static str, input: &'a str) -> Result<&'a str, IdParseError> {
    input
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(|| IdParseError::BadPrefix {
            expected: prefix,
            input: input.to_string(),
        })
}

// =============================================================================
// Definition Id
// =============================================================================

/// Identifier of a registered workflow definition (`wfd_<uuid>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DefinitionId(Uuid);

impl DefinitionId {
    /// Prefix carried by the string form
    pub const PREFIX: &'static str = "wfd";

    /// Assign a fresh, time-ordered definition id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap a UUID read back from the definition store
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The bare UUID, as persisted in the definitions table key
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for DefinitionId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(strip_id_prefix(Self::PREFIX, s)?)?))
    }
}

impl TryFrom<String> for DefinitionId {
    type Error = IdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DefinitionId> for String {
    fn from(id: DefinitionId) -> Self {
        id.to_string()
    }
}

// =============================================================================
// Instance Id
// =============================================================================

/// Identifier of a workflow instance (`wfi_<uuid>`)
///
/// Assigned by the engine at submission; coordination keys and status
/// endpoints carry the string form unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Prefix carried by the string form
    pub const PREFIX: &'static str = "wfi";

    /// Assign a fresh, time-ordered instance id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap a UUID read back from the instances table
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The bare UUID, as persisted in the instances table key
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for InstanceId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(strip_id_prefix(Self::PREFIX, s)?)?))
    }
}

impl TryFrom<String> for InstanceId {
    type Error = IdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_prefix() {
        let def = DefinitionId::new();
        let instance = InstanceId::new();

        assert!(def.to_string().starts_with("wfd_"));
        assert!(instance.to_string().starts_with("wfi_"));
    }

    #[test]
    fn test_parse_roundtrip() {
        let id = InstanceId::new();
        let parsed: InstanceId = id.to_string().parse().expect("Should parse own display");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_foreign_prefix_rejected() {
        let result = "wfd_01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90".parse::<InstanceId>();
        match result {
            Err(IdParseError::BadPrefix { expected, input }) => {
                assert_eq!(expected, "wfi");
                assert!(input.starts_with("wfd_"));
            }
            _ => panic!("Expected BadPrefix error"),
        }
    }

    #[test]
    fn test_bare_uuid_rejected() {
        // Opaque ids always travel with their prefix; a raw UUID is not one
        let result = "01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90".parse::<DefinitionId>();
        assert!(matches!(result, Err(IdParseError::BadPrefix { .. })));
    }

    #[test]
    fn test_invalid_uuid_rejected() {
        let result = "wfd_not-a-valid-uuid".parse::<DefinitionId>();
        assert!(matches!(result, Err(IdParseError::InvalidUuid(_))));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let id = DefinitionId::new();
        let json = serde_json::to_string(&id).expect("Should serialize");
        assert_eq!(json, format!("\"{id}\""));

        let parsed: DefinitionId = serde_json::from_str(&json).expect("Should deserialize");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_serde_rejects_wrong_kind() {
        let def = DefinitionId::new();
        let json = serde_json::to_string(&def).unwrap();
        assert!(serde_json::from_str::<InstanceId>(&json).is_err());
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        // UUID v7 encodes a millisecond timestamp in the high bits
        assert!(a.as_uuid().as_bytes()[..6] <= b.as_uuid().as_bytes()[..6]);
    }
}
