//! Service Document - stored form of a registry entry

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One entry of the `services` collection.
///
/// Output categories are kept as raw keys so that unknown categories can be
/// reported as configuration errors instead of being silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDocument {
    /// Stage type (unique key).
    #[serde(rename = "stageType", alias = "_id")]
    pub stage_type: String,
    /// Required parent stage type, `null` for root stages.
    #[serde(default)]
    pub parent: Option<String>,
    /// Output slot templates by category; a `null` list means no slots.
    #[serde(default)]
    pub output: BTreeMap<String, Option<Vec<String>>>,
    /// Parameter keys the stage requires.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
}
