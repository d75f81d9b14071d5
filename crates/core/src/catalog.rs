use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::document::{DocumentGroup, DocumentType};

/// The typed shape a metric's answer is normalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Numeric,
    Date,
    Text,
}

/// A natural-language question bound to a canonical metric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionQuery {
    pub metric: String,
    pub question: String,
    pub kind: ValueKind,
}

impl ExtractionQuery {
    pub fn new(metric: &str, question: &str, kind: ValueKind) -> Self {
        Self {
            metric: metric.to_string(),
            question: question.to_string(),
            kind,
        }
    }
}

/// The golden list for `current_labs` documents, in request order.
pub const CURRENT_LABS_QUERIES: &[(&str, &str, ValueKind)] = &[
    ("potassium", "What is the Potassium?", ValueKind::Numeric),
    ("bun", "What is the BUN?", ValueKind::Numeric),
    ("phosphorus", "What is the Phosphorus?", ValueKind::Numeric),
    ("hemoglobin", "What is the Hemoglobin?", ValueKind::Numeric),
    ("platelets", "What is the Platelet count?", ValueKind::Numeric),
    ("pt", "What is the PT?", ValueKind::Numeric),
    ("inr", "What is the INR?", ValueKind::Numeric),
    ("ptt", "What is the PTT?", ValueKind::Numeric),
    ("pth", "What is the PTH?", ValueKind::Numeric),
    ("a1c", "What is the Hemoglobin A1c?", ValueKind::Numeric),
    ("albumin", "What is the Albumin?", ValueKind::Numeric),
    ("bilirubin", "What is the Total Bilirubin?", ValueKind::Numeric),
    ("cholesterol", "What is the Cholesterol?", ValueKind::Numeric),
    ("urine_protein", "What is the Urine Protein?", ValueKind::Numeric),
    ("urine_rbc", "What is the Urine RBC?", ValueKind::Numeric),
    ("urine_wbc", "What is the Urine WBC?", ValueKind::Numeric),
    ("urine_hemoglobin", "What is the Urine Hemoglobin?", ValueKind::Numeric),
    ("lab_date", "What is the lab collection date?", ValueKind::Date),
];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to parse catalog TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to render catalog TOML: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("Catalog for '{0}' has no queries")]
    Empty(DocumentType),
    #[error("Catalog for '{document_type}' repeats metric '{metric}'")]
    DuplicateMetric { document_type: DocumentType, metric: String },
    #[error("Catalog declared twice for '{0}'")]
    DuplicateCatalog(DocumentType),
    #[error("'{0}' is a narrative document type and cannot be extracted")]
    NarrativeType(DocumentType),
}

/// Ordered, immutable query list for one extractable document type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCatalog {
    pub document_type: DocumentType,
    #[serde(rename = "query")]
    queries: Vec<ExtractionQuery>,
}

impl QueryCatalog {
    pub fn new(document_type: DocumentType, queries: Vec<ExtractionQuery>) -> Result<Self, CatalogError> {
        if queries.is_empty() {
            return Err(CatalogError::Empty(document_type));
        }
        if document_type.group() == Some(DocumentGroup::Narrative) {
            return Err(CatalogError::NarrativeType(document_type));
        }
        let mut seen = HashSet::new();
        for q in &queries {
            if !seen.insert(q.metric.as_str()) {
                return Err(CatalogError::DuplicateMetric {
                    document_type,
                    metric: q.metric.clone(),
                });
            }
        }
        Ok(Self { document_type, queries })
    }

    pub fn current_labs() -> Self {
        Self {
            document_type: DocumentType::current_labs(),
            queries: CURRENT_LABS_QUERIES
                .iter()
                .map(|(metric, question, kind)| ExtractionQuery::new(metric, question, *kind))
                .collect(),
        }
    }

    pub fn queries(&self) -> &[ExtractionQuery] {
        &self.queries
    }

    pub fn query(&self, metric: &str) -> Option<&ExtractionQuery> {
        self.queries.iter().find(|q| q.metric == metric)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Why a document bypasses extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Recognized clinical type whose catalog does not exist yet.
    NoCatalog,
    /// Narrative or operational type, never extracted.
    Narrative,
    /// Tag outside the known vocabulary.
    Unrecognized,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoCatalog => write!(f, "no_catalog"),
            SkipReason::Narrative => write!(f, "narrative"),
            SkipReason::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

impl FromStr for SkipReason {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_catalog" => Ok(SkipReason::NoCatalog),
            "narrative" => Ok(SkipReason::Narrative),
            "unrecognized" => Ok(SkipReason::Unrecognized),
            other => Err(format!("Unknown skip reason: '{other}'")),
        }
    }
}

/// Routing decision for a declared document type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Route<'a> {
    Extract(&'a QueryCatalog),
    Skip(SkipReason),
}

#[derive(Debug, Deserialize, Serialize)]
struct CatalogFile {
    #[serde(default, rename = "catalog")]
    catalogs: Vec<QueryCatalog>,
}

/// All query catalogs known to the process, keyed by document type.
///
/// Loaded once at start and shared read-only; a document type becomes
/// extractable by gaining an entry here.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSet {
    catalogs: BTreeMap<DocumentType, QueryCatalog>,
}

impl Default for CatalogSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CatalogSet {
    pub fn builtin() -> Self {
        let labs = QueryCatalog::current_labs();
        Self {
            catalogs: BTreeMap::from([(labs.document_type.clone(), labs)]),
        }
    }

    pub fn new(catalogs: Vec<QueryCatalog>) -> Result<Self, CatalogError> {
        let mut map = BTreeMap::new();
        for catalog in catalogs {
            // Re-validate: deserialized catalogs bypass `QueryCatalog::new`.
            let catalog = QueryCatalog::new(catalog.document_type, catalog.queries)?;
            if map.contains_key(&catalog.document_type) {
                return Err(CatalogError::DuplicateCatalog(catalog.document_type));
            }
            map.insert(catalog.document_type.clone(), catalog);
        }
        Ok(Self { catalogs: map })
    }

    pub fn from_toml(toml_content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(toml_content)?;
        Self::new(file.catalogs)
    }

    pub fn to_toml(&self) -> Result<String, CatalogError> {
        let file = CatalogFile {
            catalogs: self.catalogs.values().cloned().collect(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    pub fn get(&self, document_type: &DocumentType) -> Option<&QueryCatalog> {
        self.catalogs.get(document_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryCatalog> {
        self.catalogs.values()
    }

    /// Total over every tag: narrative types always skip, catalogued types
    /// extract, and everything else skips with the reason recorded.
    pub fn route(&self, document_type: &DocumentType) -> Route<'_> {
        let group = document_type.group();
        if group == Some(DocumentGroup::Narrative) {
            return Route::Skip(SkipReason::Narrative);
        }
        match (self.catalogs.get(document_type), group) {
            (Some(catalog), _) => Route::Extract(catalog),
            (None, Some(DocumentGroup::Clinical)) => Route::Skip(SkipReason::NoCatalog),
            (None, _) => Route::Skip(SkipReason::Unrecognized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::KNOWN_DOCUMENT_TYPES;

    fn tag(s: &str) -> DocumentType {
        s.parse().unwrap()
    }

    #[test]
    fn golden_list_has_eighteen_entries_ending_with_date() {
        let labs = QueryCatalog::current_labs();
        assert_eq!(labs.len(), 18);
        let last = labs.queries().last().unwrap();
        assert_eq!(last.metric, "lab_date");
        assert_eq!(last.kind, ValueKind::Date);
        assert_eq!(labs.query("potassium").unwrap().question, "What is the Potassium?");
    }

    #[test]
    fn current_labs_is_the_only_builtin_extractable_type() {
        let set = CatalogSet::builtin();
        assert!(matches!(set.route(&tag("current_labs")), Route::Extract(c) if c.len() == 18));
        assert_eq!(set.route(&tag("medication_list")), Route::Skip(SkipReason::NoCatalog));
        assert_eq!(set.route(&tag("insurance_card")), Route::Skip(SkipReason::NoCatalog));
    }

    #[test]
    fn narrative_types_always_skip() {
        let set = CatalogSet::builtin();
        for t in ["social_work_summary", "dietitian_summary", "care_plan_notes", "dialysis_shift"] {
            assert_eq!(set.route(&tag(t)), Route::Skip(SkipReason::Narrative), "{t}");
        }
    }

    #[test]
    fn unknown_types_skip_instead_of_failing() {
        let set = CatalogSet::builtin();
        assert_eq!(set.route(&tag("vaccination_record")), Route::Skip(SkipReason::Unrecognized));
    }

    #[test]
    fn routing_is_total_over_known_vocabulary() {
        let set = CatalogSet::builtin();
        for (t, _) in KNOWN_DOCUMENT_TYPES {
            let extract = matches!(set.route(&tag(t)), Route::Extract(_));
            assert_eq!(extract, *t == "current_labs", "{t}");
        }
    }

    #[test]
    fn adding_a_catalog_makes_a_type_extractable() {
        let toml = r#"
            [[catalog]]
            document_type = "medication_list"

            [[catalog.query]]
            metric = "tacrolimus_dose"
            question = "What is the Tacrolimus dose?"
            kind = "numeric"
        "#;
        let set = CatalogSet::from_toml(toml).unwrap();
        match set.route(&tag("medication_list")) {
            Route::Extract(c) => assert_eq!(c.queries()[0].metric, "tacrolimus_dose"),
            other => panic!("expected extract, got {other:?}"),
        }
        // current_labs is not implicitly kept when a file replaces the set.
        assert_eq!(set.route(&tag("current_labs")), Route::Skip(SkipReason::NoCatalog));
    }

    #[test]
    fn narrative_catalog_is_rejected() {
        let toml = r#"
            [[catalog]]
            document_type = "dialysis_shift"

            [[catalog.query]]
            metric = "weight"
            question = "What is the pre-treatment weight?"
            kind = "numeric"
        "#;
        assert!(matches!(CatalogSet::from_toml(toml), Err(CatalogError::NarrativeType(_))));
    }

    #[test]
    fn duplicate_metric_is_rejected() {
        let queries = vec![
            ExtractionQuery::new("bun", "What is the BUN?", ValueKind::Numeric),
            ExtractionQuery::new("bun", "What is the urea nitrogen?", ValueKind::Numeric),
        ];
        assert!(matches!(
            QueryCatalog::new(tag("current_labs"), queries),
            Err(CatalogError::DuplicateMetric { .. })
        ));
    }

    #[test]
    fn builtin_catalog_renders_and_reloads() {
        let set = CatalogSet::builtin();
        let rendered = set.to_toml().unwrap();
        assert!(rendered.contains("What is the Potassium?"));
        assert_eq!(CatalogSet::from_toml(&rendered).unwrap(), set);
    }

    #[test]
    fn skip_reason_roundtrip() {
        for r in [SkipReason::NoCatalog, SkipReason::Narrative, SkipReason::Unrecognized] {
            assert_eq!(r.to_string().parse::<SkipReason>().unwrap(), r);
        }
    }
}
