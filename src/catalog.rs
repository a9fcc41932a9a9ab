//! Sample and metadata catalog
//!
//! Some stages join auxiliary covariate data (diagnosis, age, site...) onto
//! their inputs. The catalog holds those documents outside the lineage
//! graph and answers simple predicate queries over them:
//!
//! ```text
//! samples:   { "run_accession": "ERR100", "sample_alias": "S-01", ... }
//! metadata:  { "sample": "S-01", "dx": "CD", "age": 31, ... }
//! ```

use std::path::Path;

use serde_json::Value;

use crate::{Error, Result};

/// A catalog document (a JSON object).
pub type Document = serde_json::Map<String, Value>;

/// Conjunction of field-equality clauses. Dotted fields address nested
/// objects (`"location.site"`). An empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    clauses: Vec<(String, Value)>,
}

impl DocumentFilter {
    /// Create a filter that matches every document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    #[must_use]
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    /// Evaluate the filter against a document.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses
            .iter()
            .all(|(field, value)| lookup(doc, field) == Some(value))
    }
}

fn lookup<'d>(doc: &'d Document, field: &str) -> Option<&'d Value> {
    let mut parts = field.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// A named, read-only collection of documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentCollection {
    name: String,
    documents: Vec<Document>,
}

impl DocumentCollection {
    /// Create a collection from documents.
    #[must_use]
    pub fn new(name: impl Into<String>, documents: Vec<Document>) -> Self {
        Self {
            name: name.into(),
            documents,
        }
    }

    /// Parse a JSON array of objects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is not an array of objects.
    pub fn from_json(name: impl Into<String>, json: &str) -> Result<Self> {
        let name = name.into();
        let values: Vec<Value> = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("collection '{name}': {e}")))?;
        let documents = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| match v {
                Value::Object(doc) => Ok(doc),
                _ => Err(Error::Config(format!(
                    "collection '{name}': entry {i} is not an object"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { name, documents })
    }

    /// Read a collection file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn from_path(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read collection {}: {e}", path.display()))
        })?;
        Self::from_json(name, &json)
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// True if the collection holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Lazily iterate documents matching `filter`; every call starts over.
    pub fn query<'a>(&'a self, filter: &'a DocumentFilter) -> impl Iterator<Item = &'a Document> + 'a {
        self.documents.iter().filter(move |d| filter.matches(d))
    }

    /// First document matching `filter`.
    #[must_use]
    pub fn find_one(&self, filter: &DocumentFilter) -> Option<&Document> {
        self.documents.iter().find(|d| filter.matches(d))
    }
}

/// Result of a best-effort covariate lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Covariate {
    /// The covariate was recorded for the sample.
    Known(Value),
    /// Some link in the lookup chain is missing.
    Unknown,
}

impl Covariate {
    /// Sentinel label used for unknown covariates.
    pub const UNKNOWN_LABEL: &'static str = "unknown";

    /// True for `Known`.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    /// Render the covariate as a label, `"unknown"` when absent.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Known(Value::String(s)) => s.clone(),
            Self::Known(other) => other.to_string(),
            Self::Unknown => Self::UNKNOWN_LABEL.to_string(),
        }
    }
}

/// Joins sequencing runs to sample metadata.
#[derive(Debug, Clone, Default)]
pub struct SampleCatalog {
    samples: DocumentCollection,
    metadata: DocumentCollection,
}

impl SampleCatalog {
    /// Field in `samples` holding the run accession.
    pub const RUN_FIELD: &'static str = "run_accession";
    /// Field in `samples` holding the sample alias.
    pub const ALIAS_FIELD: &'static str = "sample_alias";
    /// Field in `metadata` referencing the sample alias.
    pub const SAMPLE_FIELD: &'static str = "sample";

    /// Create a catalog over a samples and a metadata collection.
    #[must_use]
    pub const fn new(samples: DocumentCollection, metadata: DocumentCollection) -> Self {
        Self { samples, metadata }
    }

    /// The samples collection.
    #[must_use]
    pub const fn samples(&self) -> &DocumentCollection {
        &self.samples
    }

    /// The metadata collection.
    #[must_use]
    pub const fn metadata(&self) -> &DocumentCollection {
        &self.metadata
    }

    /// Sample alias recorded for a run.
    #[must_use]
    pub fn sample_alias(&self, run_accession: &str) -> Option<&str> {
        self.samples
            .find_one(&DocumentFilter::new().where_eq(Self::RUN_FIELD, run_accession))?
            .get(Self::ALIAS_FIELD)?
            .as_str()
    }

    /// Metadata document for a run.
    #[must_use]
    pub fn metadata_for(&self, run_accession: &str) -> Option<&Document> {
        let alias = self.sample_alias(run_accession)?;
        self.metadata
            .find_one(&DocumentFilter::new().where_eq(Self::SAMPLE_FIELD, alias))
    }

    /// Best-effort covariate lookup.
    ///
    /// Any missing link (unknown run, no metadata, absent or null field)
    /// yields [`Covariate::Unknown`] instead of an error, so a stage can
    /// still run over samples with incomplete metadata.
    #[must_use]
    pub fn covariate(&self, run_accession: &str, field: &str) -> Covariate {
        match self
            .metadata_for(run_accession)
            .and_then(|doc| lookup(doc, field))
        {
            Some(Value::Null) | None => {
                tracing::debug!(run_accession, field, "covariate unknown");
                Covariate::Unknown
            }
            Some(value) => Covariate::Known(value.clone()),
        }
    }

    /// Strict covariate lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DocumentNotFound`] naming the first missing link.
    pub fn require_covariate(&self, run_accession: &str, field: &str) -> Result<Value> {
        let alias = self
            .sample_alias(run_accession)
            .ok_or_else(|| Error::DocumentNotFound {
                collection: self.samples.name.clone(),
                key: format!("{}={run_accession}", Self::RUN_FIELD),
            })?;
        let doc = self
            .metadata
            .find_one(&DocumentFilter::new().where_eq(Self::SAMPLE_FIELD, alias))
            .ok_or_else(|| Error::DocumentNotFound {
                collection: self.metadata.name.clone(),
                key: format!("{}={alias}", Self::SAMPLE_FIELD),
            })?;
        match lookup(doc, field) {
            Some(Value::Null) | None => Err(Error::DocumentNotFound {
                collection: self.metadata.name.clone(),
                key: format!("{alias}.{field}"),
            }),
            Some(value) => Ok(value.clone()),
        }
    }

    /// Runs whose metadata records a non-null `field`.
    pub fn runs_with<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.samples.documents.iter().filter_map(move |doc| {
            let run = doc.get(Self::RUN_FIELD)?.as_str()?;
            self.covariate(run, field).is_known().then_some(run)
        })
    }
}
