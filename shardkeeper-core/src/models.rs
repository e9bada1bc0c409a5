//! Data models stored in & exchanged with the consistent store.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The declared specification of an item.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemSpec {
    /// The unique id of this item.
    pub id: String,
    /// The desired number of replicas of this item.
    #[serde(default)]
    pub replication: i32,
    /// Names of underlying resources (e.g. journals) which this item is built upon.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    /// Arbitrary labels attached to this item, available to placement predicates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// An opaque payload owned by the domain of the item.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl ItemSpec {
    /// Validate the structure of this spec.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.id.is_empty() {
            return Err(AppError::InvalidInput("item id must not be empty".into()));
        }
        if self.id.chars().any(char::is_control) {
            return Err(AppError::InvalidInput(format!("item id {:?} must not contain control characters", self.id)));
        }
        if self.replication < 0 {
            return Err(AppError::InvalidInput(format!(
                "item {} replication must be non-negative, got {}",
                self.id, self.replication
            )));
        }
        if let Some(name) = self.references.iter().find(|name| name.is_empty()) {
            return Err(AppError::InvalidInput(format!("item {} has an empty reference {:?}", self.id, name)));
        }
        Ok(())
    }

    /// The desired number of replicas, clamping invalid negative values to zero.
    pub fn desired_replicas(&self) -> usize {
        self.replication.max(0) as usize
    }

    /// Encode this spec for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("error encoding item spec")
    }

    /// Decode a spec from storage.
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("error decoding item spec")
    }
}

/// The specification a member registers itself with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    /// The failure zone of this member.
    #[serde(default)]
    pub zone: String,
    /// The maximum number of item assignments this member will accept.
    pub item_limit: u32,
}

impl MemberSpec {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("error encoding member spec")
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("error decoding member spec")
    }
}

/// The status reported for an assignment by the member holding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentStatus {
    #[serde(rename = "not-ready")]
    NotReady,
    #[serde(rename = "ready")]
    Ready,
}

impl Default for AssignmentStatus {
    fn default() -> Self {
        Self::NotReady
    }
}

/// The value of an assignment key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentValue {
    /// The replication slot of this assignment.
    pub slot: u32,
    #[serde(default)]
    pub status: AssignmentStatus,
}

impl AssignmentValue {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("error encoding assignment")
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("error decoding assignment")
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.status, AssignmentStatus::Ready)
    }
}

/// A declaration of desired item state, as found in a human-editable apply document.
///
/// A `revision` of 0 declares a new item. Any other revision must match the revision at which
/// the item was last read.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemDecl {
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,
    #[serde(flatten)]
    pub spec: ItemSpec,
}

fn is_false(val: &bool) -> bool {
    !*val
}

impl ItemDecl {
    /// Validate this declaration.
    pub fn validate(&self) -> Result<(), AppError> {
        self.spec.validate()?;
        if self.delete && self.revision == 0 {
            return Err(AppError::InvalidInput(format!("item {} can not be deleted without an expected revision", self.spec.id)));
        }
        Ok(())
    }
}

/// Parse a YAML apply document into a list of declarations.
pub fn parse_decls(doc: &str) -> Result<Vec<ItemDecl>, AppError> {
    if doc.trim().is_empty() {
        return Ok(vec![]);
    }
    serde_yaml::from_str(doc).map_err(|err| AppError::InvalidInput(format!("malformed apply document: {}", err)))
}

/// Encode the given declarations as a YAML apply document.
pub fn encode_decls(decls: &[ItemDecl]) -> Result<String> {
    serde_yaml::to_string(decls).context("error encoding apply document")
}

/// Validate a full list of declarations, including uniqueness of ids.
pub fn validate_decls(decls: &[ItemDecl]) -> Result<(), AppError> {
    let mut seen = HashSet::with_capacity(decls.len());
    for decl in decls {
        decl.validate()?;
        if !seen.insert(decl.spec.id.as_str()) {
            return Err(AppError::InvalidInput(format!("item {} is declared more than once", decl.spec.id)));
        }
    }
    Ok(())
}
