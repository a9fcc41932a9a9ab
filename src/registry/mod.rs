//! Stage Registry - the static catalog of pipeline stages
//!
//! For each stage type the registry records the stage type its parent must
//! have (or none, for roots), the parameter keys it requires, and the
//! ordered output slots it writes, split into the `data` and `visuals`
//! categories.
//!
//! The registry is loaded once at process start and is read-only after
//! that. Every structural problem in the configuration is reported as
//! [`Error::Config`] at load time, so no stage ever runs against a schema
//! that cannot type-check.
//!
//! ## Configuration format
//!
//! ```json
//! [
//!   { "stageType": "Import", "parent": null, "output": { "data": ["seqs.fmt"] } },
//!   { "stageType": "QC", "parent": "Import",
//!     "output": { "data": ["table.fmt", "reps.fmt"], "visuals": ["qc.viz"] },
//!     "params": ["trunc_q"] }
//! ]
//! ```

mod document;

pub use document::ServiceDocument;

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name of a pipeline stage, drawn from the registry's closed set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageType(String);

impl StageType {
    /// Create a stage type tag.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the tag as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for StageType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for StageType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StageType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Output category of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    /// Data artifacts, written directly under the output root.
    Data,
    /// Visualizations, written under `<output root>/Visuals`.
    Visuals,
}

impl OutputCategory {
    /// Both categories, in allocation order.
    pub const ALL: [Self; 2] = [Self::Data, Self::Visuals];

    /// Configuration key for the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Visuals => "visuals",
        }
    }

    /// Parse a configuration key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for anything other than `data` or `visuals`.
    pub fn parse(key: &str) -> Result<Self> {
        match key {
            "data" => Ok(Self::Data),
            "visuals" => Ok(Self::Visuals),
            other => Err(Error::Config(format!(
                "unknown output category '{other}' (expected 'data' or 'visuals')"
            ))),
        }
    }
}

impl fmt::Display for OutputCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named output file a stage writes, relative to its category root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSlot {
    template: String,
    category: OutputCategory,
}

impl OutputSlot {
    /// Relative path template (also the slot's name).
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Category the slot belongs to.
    #[must_use]
    pub const fn category(&self) -> OutputCategory {
        self.category
    }
}

/// Static schema entry for one stage type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    stage_type: StageType,
    required_parent: Option<StageType>,
    slots: Vec<OutputSlot>,
    required_params: Vec<String>,
}

impl StageDefinition {
    /// Stage type this definition describes.
    #[must_use]
    pub const fn stage_type(&self) -> &StageType {
        &self.stage_type
    }

    /// Stage type the parent node must have, `None` for root stages.
    #[must_use]
    pub const fn required_parent(&self) -> Option<&StageType> {
        self.required_parent.as_ref()
    }

    /// True when the stage starts a lineage.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.required_parent.is_none()
    }

    /// All output slots, data slots first, each category in declaration order.
    #[must_use]
    pub fn slots(&self) -> &[OutputSlot] {
        &self.slots
    }

    /// Output slots of one category, in declaration order.
    pub fn slots_in(&self, category: OutputCategory) -> impl Iterator<Item = &OutputSlot> {
        self.slots.iter().filter(move |s| s.category == category)
    }

    /// Parameter keys that must be present before the stage may run.
    #[must_use]
    pub fn required_params(&self) -> &[String] {
        &self.required_params
    }

    fn from_document(doc: ServiceDocument) -> Result<Self> {
        let stage = doc.stage_type.trim().to_string();
        if stage.is_empty() {
            return Err(Error::Config("stage type must not be empty".into()));
        }

        let mut slots = Vec::new();
        let mut categories = BTreeMap::new();
        for (key, templates) in doc.output {
            let category = OutputCategory::parse(&key)
                .map_err(|e| Error::Config(format!("stage '{stage}': {e}")))?;
            categories.insert(category, templates.unwrap_or_default());
        }
        let mut seen = BTreeSet::new();
        for (category, templates) in categories {
            for template in templates {
                validate_template(&stage, &template)?;
                if !seen.insert(template.clone()) {
                    return Err(Error::Config(format!(
                        "stage '{stage}': output slot '{template}' declared twice"
                    )));
                }
                slots.push(OutputSlot { template, category });
            }
        }

        let required_parent = doc
            .parent
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(StageType::from);

        Ok(Self {
            stage_type: StageType(stage),
            required_parent,
            slots,
            required_params: doc.params,
        })
    }

    fn to_document(&self) -> ServiceDocument {
        let mut output = BTreeMap::new();
        for category in OutputCategory::ALL {
            let templates: Vec<String> = self
                .slots_in(category)
                .map(|s| s.template.clone())
                .collect();
            if !templates.is_empty() {
                output.insert(category.as_str().to_string(), Some(templates));
            }
        }
        ServiceDocument {
            stage_type: self.stage_type.0.clone(),
            parent: self.required_parent.as_ref().map(|p| p.0.clone()),
            output,
            params: self.required_params.clone(),
        }
    }
}

fn validate_template(stage: &str, template: &str) -> Result<()> {
    let path = Path::new(template);
    if template.is_empty() || path.is_absolute() {
        return Err(Error::Config(format!(
            "stage '{stage}': output slot '{template}' must be a non-empty relative path"
        )));
    }
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::Config(format!(
            "stage '{stage}': output slot '{template}' must stay inside its category root"
        )));
    }
    Ok(())
}

/// Immutable catalog of every stage type the pipeline knows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    stages: BTreeMap<StageType, StageDefinition>,
}

impl Registry {
    /// Build the registry from service documents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on duplicate or empty stage types, unknown
    /// output categories, invalid slot templates, required parents that are
    /// not registered, or required-parent chains that loop.
    pub fn load(documents: impl IntoIterator<Item = ServiceDocument>) -> Result<Self> {
        let mut stages = BTreeMap::new();
        for doc in documents {
            let definition = StageDefinition::from_document(doc)?;
            let key = definition.stage_type.clone();
            if stages.insert(key.clone(), definition).is_some() {
                return Err(Error::Config(format!("stage type '{key}' declared twice")));
            }
        }

        let registry = Self { stages };
        registry.check_parent_chains()?;
        tracing::debug!(stages = registry.len(), "stage registry loaded");
        Ok(registry)
    }

    /// Parse a JSON array of service documents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed JSON or any [`Registry::load`] failure.
    pub fn from_json(json: &str) -> Result<Self> {
        let documents: Vec<ServiceDocument> = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid registry document: {e}")))?;
        Self::load(documents)
    }

    /// Read and parse a registry file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or is invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read registry {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Service documents describing this registry, ordered by stage type.
    #[must_use]
    pub fn to_documents(&self) -> Vec<ServiceDocument> {
        self.stages.values().map(StageDefinition::to_document).collect()
    }

    /// Look up a stage definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownStage`] if the stage type is not registered.
    pub fn get_definition(&self, stage: &str) -> Result<&StageDefinition> {
        self.stages
            .get(stage)
            .ok_or_else(|| Error::UnknownStage {
                stage: stage.to_string(),
            })
    }

    /// True if the stage type is registered.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.get_definition(stage).is_ok()
    }

    /// Registered stage types, sorted.
    pub fn stage_types(&self) -> impl Iterator<Item = &StageType> {
        self.stages.keys()
    }

    /// Stage types whose required parent is `stage`.
    pub fn child_stages<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a StageType> + 'a {
        self.stages
            .values()
            .filter(move |d| d.required_parent().is_some_and(|p| p.as_str() == stage))
            .map(StageDefinition::stage_type)
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True when no stage is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn check_parent_chains(&self) -> Result<()> {
        for definition in self.stages.values() {
            let mut seen = BTreeSet::new();
            let mut current = definition;
            seen.insert(current.stage_type.as_str());
            while let Some(parent) = current.required_parent() {
                current = self.stages.get(parent).ok_or_else(|| {
                    Error::Config(format!(
                        "stage '{}' requires unknown parent stage '{parent}'",
                        current.stage_type
                    ))
                })?;
                if !seen.insert(current.stage_type.as_str()) {
                    return Err(Error::Config(format!(
                        "required-parent chain of stage '{}' loops back to '{parent}'",
                        definition.stage_type
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"[
        {"stageType": "Import", "parent": null, "output": {"data": ["seqs.fmt"], "visuals": null}},
        {"stageType": "QC", "parent": "Import",
         "output": {"data": ["table.fmt", "reps.fmt"], "visuals": ["qc.viz"]},
         "params": ["trunc_q"]}
    ]"#;

    #[test]
    fn test_load_and_lookup() {
        let registry = Registry::from_json(PIPELINE).unwrap();
        assert_eq!(registry.len(), 2);

        let qc = registry.get_definition("QC").unwrap();
        assert_eq!(qc.required_parent().map(StageType::as_str), Some("Import"));
        assert_eq!(qc.slots_in(OutputCategory::Data).count(), 2);
        assert_eq!(qc.slots_in(OutputCategory::Visuals).count(), 1);
        assert_eq!(qc.required_params(), ["trunc_q".to_string()]);

        let import = registry.get_definition("Import").unwrap();
        assert!(import.is_root());
        assert_eq!(import.slots().len(), 1);
    }

    #[test]
    fn test_unknown_stage() {
        let registry = Registry::from_json(PIPELINE).unwrap();
        let err = registry.get_definition("Lefse").unwrap_err();
        assert!(matches!(err, Error::UnknownStage { stage } if stage == "Lefse"));
    }

    #[test]
    fn test_duplicate_stage_is_config_error() {
        let json = r#"[{"stageType": "A"}, {"stageType": "A"}]"#;
        assert!(matches!(Registry::from_json(json), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_category_is_config_error() {
        let json = r#"[{"stageType": "A", "output": {"plots": ["x.png"]}}]"#;
        let err = Registry::from_json(json).unwrap_err();
        assert!(err.to_string().contains("plots"));
    }

    #[test]
    fn test_unregistered_parent_is_config_error() {
        let json = r#"[{"stageType": "B", "parent": "A"}]"#;
        assert!(matches!(Registry::from_json(json), Err(Error::Config(_))));
    }

    #[test]
    fn test_parent_cycle_is_config_error() {
        let json = r#"[{"stageType": "A", "parent": "B"}, {"stageType": "B", "parent": "A"}]"#;
        let err = Registry::from_json(json).unwrap_err();
        assert!(err.to_string().contains("loops"));
    }

    #[test]
    fn test_escaping_template_is_config_error() {
        for bad in ["../x.fmt", "/abs/x.fmt", ""] {
            let json = format!(r#"[{{"stageType": "A", "output": {{"data": ["{bad}"]}}}}]"#);
            assert!(
                matches!(Registry::from_json(&json), Err(Error::Config(_))),
                "template {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_documents_round_trip() {
        let registry = Registry::from_json(PIPELINE).unwrap();
        let reloaded = Registry::load(registry.to_documents()).unwrap();
        assert_eq!(registry, reloaded);
    }

    #[test]
    fn test_child_stages() {
        let registry = Registry::from_json(PIPELINE).unwrap();
        let children: Vec<_> = registry.child_stages("Import").collect();
        assert_eq!(children, vec![&StageType::from("QC")]);
    }
}
