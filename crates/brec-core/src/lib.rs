//! Core brand model, name normalization, evidence parsing and the brand registry.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

pub const CRATE_NAME: &str = "brec-core";

pub const HOLDING_COLUMN: &str = "Main Holding Name";
pub const BRAND_COLUMN: &str = "Brand Name";
pub const DATE_ADDED_COLUMN: &str = "Date d'ajout";
pub const SECTOR_COLUMN: &str = "Secteur d'activité";
pub const DEPARTMENT_COLUMN: &str = "Département";
pub const STATUS_COLUMN: &str = "Statut d'Appartenance verifié";
pub const REVIEW_COLUMN: &str = "À VÉRIFIER";

/// Pipeline-owned columns, in output order.
pub const PIPELINE_COLUMNS: [&str; 5] = [
    DATE_ADDED_COLUMN,
    SECTOR_COLUMN,
    DEPARTMENT_COLUMN,
    STATUS_COLUMN,
    REVIEW_COLUMN,
];

pub const UNKNOWN: &str = "Unknown";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Canonical form used for brand identity: accents, case and punctuation removed.
pub fn normalize_brand_name(name: &str) -> String {
    name.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Ownership status produced by the verify stage or at discovery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VerificationStatus {
    #[default]
    Unset,
    Ok,
    Flagged,
}

impl VerificationStatus {
    /// An absent confidence never confirms ownership.
    pub fn from_confidence(confidence: Option<f64>, accept_threshold: f64) -> Self {
        match confidence {
            Some(c) if c >= accept_threshold => Self::Ok,
            _ => Self::Flagged,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Ok => "OK",
            Self::Flagged => "NON",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match normalize_brand_name(label).as_str() {
            "ok" => Self::Ok,
            "non" | "averifier" | "flagged" => Self::Flagged,
            _ => Self::Unset,
        }
    }
}

/// Outcome of the independent re-verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReviewFlag {
    #[default]
    Unset,
    Yes,
    No,
}

impl ReviewFlag {
    /// `Yes` means a human should look at the pair; an absent confidence needs review too.
    pub fn from_confidence(confidence: Option<f64>, accept_threshold: f64) -> Self {
        match confidence {
            Some(c) if c >= accept_threshold => Self::No,
            _ => Self::Yes,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Yes => "OUI",
            Self::No => "NON",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match normalize_brand_name(label).as_str() {
            "oui" | "yes" => Self::Yes,
            "non" | "no" => Self::No,
            _ => Self::Unset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub sector: String,
    pub department: String,
}

impl Default for Classification {
    fn default() -> Self {
        Self::unknown()
    }
}

impl Classification {
    pub fn new(sector: &str, department: &str) -> Self {
        Self {
            sector: known_or_unknown(sector),
            department: known_or_unknown(department),
        }
    }

    pub fn unknown() -> Self {
        Self {
            sector: UNKNOWN.to_string(),
            department: UNKNOWN.to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !is_unknown(&self.sector) && !is_unknown(&self.department)
    }

    /// Replace only the parts that are still unknown.
    pub fn fill_missing_from(&mut self, other: &Classification) {
        if is_unknown(&self.sector) && !is_unknown(&other.sector) {
            self.sector = other.sector.clone();
        }
        if is_unknown(&self.department) && !is_unknown(&other.department) {
            self.department = other.department.clone();
        }
    }
}

fn is_unknown(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.eq_ignore_ascii_case(UNKNOWN)
}

fn known_or_unknown(value: &str) -> String {
    if is_unknown(value) {
        UNKNOWN.to_string()
    } else {
        value.trim().to_string()
    }
}

/// Content of a `Date d'ajout` cell. Dates the pipeline did not write are kept as found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateAdded {
    Date(NaiveDate),
    Raw(String),
}

impl DateAdded {
    /// `None` for an empty cell.
    pub fn from_cell(cell: &str) -> Option<Self> {
        let cell = cell.trim();
        if cell.is_empty() {
            return None;
        }
        Some(match NaiveDate::parse_from_str(cell, DATE_FORMAT) {
            Ok(date) => Self::Date(date),
            Err(_) => Self::Raw(cell.to_string()),
        })
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(date) => Some(*date),
            Self::Raw(_) => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Date(date) => date.format(DATE_FORMAT).to_string(),
            Self::Raw(text) => text.clone(),
        }
    }
}

/// One row of the reconciled dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandRecord {
    pub holding: String,
    pub brand: String,
    pub verification: VerificationStatus,
    pub review: ReviewFlag,
    pub date_added: Option<DateAdded>,
    pub sector: String,
    pub department: String,
    /// Values of input columns the pipeline does not own, aligned with `Dataset::extra_columns`.
    pub extra: Vec<String>,
}

impl BrandRecord {
    pub fn sourced(holding: impl Into<String>, brand: impl Into<String>) -> Self {
        Self {
            holding: holding.into(),
            brand: brand.into(),
            verification: VerificationStatus::Unset,
            review: ReviewFlag::Unset,
            date_added: None,
            sector: String::new(),
            department: String::new(),
            extra: Vec::new(),
        }
    }

    pub fn discovered(
        holding: impl Into<String>,
        brand: impl Into<String>,
        verification: VerificationStatus,
        date_added: NaiveDate,
        classification: Classification,
    ) -> Self {
        Self {
            holding: holding.into(),
            brand: brand.into(),
            verification,
            review: ReviewFlag::Unset,
            date_added: Some(DateAdded::Date(date_added)),
            sector: classification.sector,
            department: classification.department,
            extra: Vec::new(),
        }
    }

    pub fn normalized_key(&self) -> String {
        normalize_brand_name(&self.brand)
    }

    /// Rows missing a holding or a brand are carried to the output but never queried or indexed.
    pub fn is_inert(&self) -> bool {
        self.holding.trim().is_empty() || self.brand.trim().is_empty()
    }
}

/// Distinct brand names of one holding, in dataset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldingBrands {
    pub holding: String,
    pub brands: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub extra_columns: Vec<String>,
    /// Header order of the input file. Empty for datasets built in memory.
    pub column_order: Vec<String>,
    pub records: Vec<BrandRecord>,
}

impl Dataset {
    pub fn new(extra_columns: Vec<String>, records: Vec<BrandRecord>) -> Self {
        Self {
            extra_columns,
            column_order: Vec::new(),
            records,
        }
    }

    pub fn with_column_order(mut self, column_order: Vec<String>) -> Self {
        self.column_order = column_order;
        self
    }

    /// Output header: the input order with missing pipeline columns appended, or
    /// holding, brand, extras and pipeline columns when no input order is known.
    pub fn output_columns(&self) -> Vec<&str> {
        if self.column_order.is_empty() {
            let mut columns = vec![HOLDING_COLUMN, BRAND_COLUMN];
            columns.extend(self.extra_columns.iter().map(String::as_str));
            columns.extend(PIPELINE_COLUMNS);
            return columns;
        }
        let mut columns: Vec<&str> = self.column_order.iter().map(String::as_str).collect();
        for required in [HOLDING_COLUMN, BRAND_COLUMN].into_iter().chain(PIPELINE_COLUMNS) {
            if !columns.contains(&required) {
                columns.push(required);
            }
        }
        columns
    }

    pub fn from_records(records: Vec<BrandRecord>) -> Self {
        Self::new(Vec::new(), records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn holdings(&self) -> Vec<HoldingBrands> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        let mut out: Vec<HoldingBrands> = Vec::new();
        for record in self.records.iter().filter(|r| !r.is_inert()) {
            let slot = *index.entry(record.holding.as_str()).or_insert_with(|| {
                out.push(HoldingBrands {
                    holding: record.holding.clone(),
                    brands: Vec::new(),
                });
                out.len() - 1
            });
            if seen.insert((record.holding.as_str(), record.brand.as_str())) {
                out[slot].brands.push(record.brand.clone());
            }
        }
        out
    }

    pub fn registry(&self) -> BrandRegistry {
        BrandRegistry::from_records(self.records.iter().filter(|r| !r.is_inert()))
    }

    /// Rows for an exact `(holding, brand)` pair. Input files may repeat a pair.
    pub fn matching_mut<'a>(
        &'a mut self,
        holding: &'a str,
        brand: &'a str,
    ) -> impl Iterator<Item = &'a mut BrandRecord> + 'a {
        self.records
            .iter_mut()
            .filter(move |r| r.holding == holding && r.brand == brand)
    }

    pub fn push(&mut self, mut record: BrandRecord) {
        record.extra.resize(self.extra_columns.len(), String::new());
        self.records.push(record);
    }
}

/// Expected shape of a response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldLayout {
    /// `brand:confidence`
    Scored,
    /// `brand:confidence:sector:department`, falling back to `Scored`.
    Classified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub brand: String,
    pub confidence: Option<f64>,
    pub classification: Classification,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LineErrorReason {
    #[error("empty brand name")]
    EmptyBrand,
    #[error("missing confidence")]
    MissingConfidence,
    #[error("non-numeric confidence `{0}`")]
    InvalidConfidence(String),
    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line_no}: {reason} (`{line}`)")]
pub struct LineError {
    pub line_no: usize,
    pub line: String,
    pub reason: LineErrorReason,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("response is not a structured brand list: {0}")]
    Json(#[from] serde_json::Error),
}

const SEPARATOR: char = ':';
const LIST_MARKERS: &[char] = &['-', '*', '•'];

/// Parsed assertions plus the lines that could not be used.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evidence {
    pub assertions: Vec<Assertion>,
    pub rejected: Vec<LineError>,
}

impl Evidence {
    /// Structured JSON bodies are schema-checked; anything else goes through the line parser.
    pub fn from_response(text: &str, layout: FieldLayout) -> Self {
        let body = strip_code_fence(text);
        if body.starts_with('[') || body.starts_with('{') {
            if let Ok(evidence) = decode_structured(body, layout) {
                return evidence;
            }
        }
        parse_evidence(text, layout)
    }

    pub fn is_empty(&self) -> bool {
        self.assertions.is_empty()
    }
}

pub fn parse_evidence(text: &str, layout: FieldLayout) -> Evidence {
    let mut evidence = Evidence::default();
    for item in assertion_lines(text, layout) {
        match item {
            Ok(assertion) => evidence.assertions.push(assertion),
            Err(err) => evidence.rejected.push(err),
        }
    }
    evidence
}

/// Lazily parse every line carrying a separator. Lines without one are skipped silently.
pub fn assertion_lines(
    text: &str,
    layout: FieldLayout,
) -> impl Iterator<Item = Result<Assertion, LineError>> + '_ {
    text.lines()
        .enumerate()
        .filter(|(_, line)| line.contains(SEPARATOR))
        .map(move |(idx, line)| {
            parse_line(line, layout).map_err(|reason| LineError {
                line_no: idx + 1,
                line: line.trim().to_string(),
                reason,
            })
        })
}

fn parse_line(line: &str, layout: FieldLayout) -> Result<Assertion, LineErrorReason> {
    let cleaned = line.trim().trim_start_matches(LIST_MARKERS).trim();
    // Classified lines keep their first four fields; anything after the department is dropped.
    let fields: Vec<&str> = match layout {
        FieldLayout::Scored => cleaned.splitn(2, SEPARATOR).map(str::trim).collect(),
        FieldLayout::Classified => cleaned.split(SEPARATOR).map(str::trim).collect(),
    };

    let (brand, raw_confidence, classification) = match (layout, fields.as_slice()) {
        (FieldLayout::Classified, [brand, confidence, sector, department, ..]) => {
            (*brand, *confidence, Classification::new(sector, department))
        }
        (_, [brand, confidence, ..]) => (*brand, *confidence, Classification::unknown()),
        _ => return Err(LineErrorReason::MissingConfidence),
    };

    if brand.is_empty() {
        return Err(LineErrorReason::EmptyBrand);
    }
    Ok(Assertion {
        brand: brand.to_string(),
        confidence: parse_confidence(raw_confidence)?,
        classification,
    })
}

/// `NaN` is how the services say "no reliable data"; it maps to an absent confidence.
fn parse_confidence(raw: &str) -> Result<Option<f64>, LineErrorReason> {
    if raw.is_empty() {
        return Err(LineErrorReason::MissingConfidence);
    }
    let value: f64 = raw
        .parse()
        .map_err(|_| LineErrorReason::InvalidConfidence(raw.to_string()))?;
    check_confidence(Some(value))
}

fn check_confidence(value: Option<f64>) -> Result<Option<f64>, LineErrorReason> {
    match value {
        None => Ok(None),
        Some(v) if v.is_nan() => Ok(None),
        Some(v) if (0.0..=1.0).contains(&v) => Ok(Some(v)),
        Some(v) => Err(LineErrorReason::ConfidenceOutOfRange(v)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StructuredBody {
    List(Vec<StructuredRecord>),
    Wrapped { brands: Vec<StructuredRecord> },
}

#[derive(Debug, Deserialize)]
struct StructuredRecord {
    brand: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    sector: Option<String>,
    #[serde(default)]
    department: Option<String>,
}

/// Decode a `[{brand, confidence, sector, department}]` body. Invalid records are reported
/// as rejected entries numbered by their position in the list.
pub fn decode_structured(text: &str, layout: FieldLayout) -> Result<Evidence, SchemaError> {
    let records = match serde_json::from_str::<StructuredBody>(strip_code_fence(text))? {
        StructuredBody::List(records) => records,
        StructuredBody::Wrapped { brands } => brands,
    };

    let mut evidence = Evidence::default();
    for (idx, record) in records.into_iter().enumerate() {
        let brand = record.brand.trim().to_string();
        let checked = if brand.is_empty() {
            Err(LineErrorReason::EmptyBrand)
        } else {
            check_confidence(record.confidence)
        };
        match checked {
            Ok(confidence) => {
                let classification = match layout {
                    FieldLayout::Classified => Classification::new(
                        record.sector.as_deref().unwrap_or_default(),
                        record.department.as_deref().unwrap_or_default(),
                    ),
                    FieldLayout::Scored => Classification::unknown(),
                };
                evidence.assertions.push(Assertion {
                    brand,
                    confidence,
                    classification,
                });
            }
            Err(reason) => evidence.rejected.push(LineError {
                line_no: idx + 1,
                line: brand,
                reason,
            }),
        }
    }
    Ok(evidence)
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Why a proposed brand was not admitted into the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    #[error("confidence below the discovery floor")]
    LowConfidence,
    #[error("brand name has no alphanumeric characters")]
    EmptyKey,
    #[error("brand already listed under this holding")]
    KnownInHolding,
    #[error("brand name already listed under another holding")]
    KnownRawName,
    #[error("an equivalent spelling is already listed")]
    KnownNormalizedName,
}

/// Membership indices over the dataset: exact pairs, raw names and normalized keys.
#[derive(Debug, Clone, Default)]
pub struct BrandRegistry {
    by_holding: HashMap<String, HashSet<String>>,
    raw_names: HashSet<String>,
    normalized: HashSet<String>,
    pairs: usize,
}

impl BrandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a BrandRecord>) -> Self {
        let mut registry = Self::new();
        for record in records {
            registry.insert(record);
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs == 0
    }

    pub fn exists_exact(&self, holding: &str, brand: &str) -> bool {
        self.by_holding
            .get(holding)
            .is_some_and(|brands| brands.contains(brand))
    }

    pub fn exists_brand_anywhere(&self, brand: &str) -> bool {
        self.raw_names.contains(brand)
    }

    pub fn exists_normalized_anywhere(&self, brand: &str) -> bool {
        self.normalized.contains(&normalize_brand_name(brand))
    }

    pub fn check_admission(&self, holding: &str, brand: &str) -> Result<(), Rejection> {
        let key = normalize_brand_name(brand);
        if key.is_empty() {
            Err(Rejection::EmptyKey)
        } else if self.exists_exact(holding, brand) {
            Err(Rejection::KnownInHolding)
        } else if self.exists_brand_anywhere(brand) {
            Err(Rejection::KnownRawName)
        } else if self.normalized.contains(&key) {
            Err(Rejection::KnownNormalizedName)
        } else {
            Ok(())
        }
    }

    /// Index a record in all three views. Returns `false` when the pair was already known.
    pub fn insert(&mut self, record: &BrandRecord) -> bool {
        let key = record.normalized_key();
        let fresh = self
            .by_holding
            .entry(record.holding.clone())
            .or_default()
            .insert(record.brand.clone());
        self.raw_names.insert(record.brand.clone());
        self.normalized.insert(key);
        if fresh {
            self.pairs += 1;
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assertion(brand: &str, confidence: f64) -> Assertion {
        Assertion {
            brand: brand.to_string(),
            confidence: Some(confidence),
            classification: Classification::unknown(),
        }
    }

    #[test]
    fn normalization_ignores_accents_case_and_punctuation() {
        let a = normalize_brand_name("Seven-Up");
        assert_eq!(a, "sevenup");
        assert_eq!(normalize_brand_name("SEVEN UP"), a);
        assert_eq!(normalize_brand_name("Sëven Up"), a);
        assert_eq!(normalize_brand_name(""), "");
        assert_eq!(normalize_brand_name("L'Oréal Paris"), "lorealparis");
    }

    #[test]
    fn normalization_is_idempotent() {
        for input in ["Häagen-Dazs", "  Crème Brûlée & Co. ", "7UP", "Ø", "ÉCOLE № 5", ""] {
            let once = normalize_brand_name(input);
            assert_eq!(normalize_brand_name(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn scored_lines_parse_with_noise() {
        let text = "- Widgetco: 0.8\nBadLine\n  * Gizmo :0.3  \nHeader line without score:\nNada:NaN\n";
        let evidence = parse_evidence(text, FieldLayout::Scored);
        assert_eq!(
            evidence.assertions,
            vec![
                assertion("Widgetco", 0.8),
                assertion("Gizmo", 0.3),
                Assertion {
                    brand: "Nada".into(),
                    confidence: None,
                    classification: Classification::unknown(),
                },
            ]
        );
        assert_eq!(evidence.rejected.len(), 1);
        assert_eq!(evidence.rejected[0].line_no, 4);
        assert_eq!(evidence.rejected[0].reason, LineErrorReason::MissingConfidence);
    }

    #[test]
    fn bad_confidence_skips_only_that_line() {
        let text = "Alpha:high\nBeta:0.9\nGamma:1.7\n:0.5\nDelta:0.75:extra";
        let evidence = parse_evidence(text, FieldLayout::Scored);
        assert_eq!(evidence.assertions, vec![assertion("Beta", 0.9)]);
        let reasons: Vec<_> = evidence.rejected.iter().map(|e| e.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                LineErrorReason::InvalidConfidence("high".into()),
                LineErrorReason::ConfidenceOutOfRange(1.7),
                LineErrorReason::EmptyBrand,
                LineErrorReason::InvalidConfidence("0.75:extra".into()),
            ]
        );
    }

    #[test]
    fn classified_lines_fall_back_to_scored() {
        let text = "Seven Up:0.9:FMCG:Liquides\nPepsi:0.6\nMirinda:0.7:FMCG\nTango:0.8: :Unknown\nEvian:0.9:FMCG:Liquides:Eaux";
        let evidence = parse_evidence(text, FieldLayout::Classified);
        let got: Vec<_> = evidence
            .assertions
            .iter()
            .map(|a| {
                (
                    a.brand.as_str(),
                    a.confidence,
                    a.classification.sector.as_str(),
                    a.classification.department.as_str(),
                )
            })
            .collect();
        assert_eq!(
            got,
            vec![
                ("Seven Up", Some(0.9), "FMCG", "Liquides"),
                ("Pepsi", Some(0.6), UNKNOWN, UNKNOWN),
                ("Mirinda", Some(0.7), UNKNOWN, UNKNOWN),
                ("Tango", Some(0.8), UNKNOWN, UNKNOWN),
                ("Evian", Some(0.9), "FMCG", "Liquides"),
            ]
        );
        assert!(evidence.rejected.is_empty());
    }

    #[test]
    fn lazy_iterator_yields_one_item_per_candidate_line() {
        let items: Vec<_> = assertion_lines("A:0.1\nnope\nB:x\nC:1", FieldLayout::Scored).collect();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        assert!(items[2].is_ok());
    }

    #[test]
    fn structured_bodies_are_schema_checked() {
        let body = r#"```json
[
  {"brand": "NewBrand", "confidence": 0.6, "sector": "FMCG", "department": "Snacks"},
  {"brand": "Nameless", "confidence": 3.0},
  {"brand": "   ", "confidence": 0.9},
  {"brand": "Shadow", "confidence": null}
]
```"#;
        let evidence = Evidence::from_response(body, FieldLayout::Classified);
        assert_eq!(evidence.assertions.len(), 2);
        assert_eq!(evidence.assertions[0].classification, Classification::new("FMCG", "Snacks"));
        assert_eq!(evidence.assertions[1].confidence, None);
        assert_eq!(evidence.rejected.len(), 2);
        assert_eq!(evidence.rejected[0].line_no, 2);

        let wrapped = r#"{"brands": [{"brand": "Widgetco", "confidence": 0.8, "sector": "Tech"}]}"#;
        let evidence = Evidence::from_response(wrapped, FieldLayout::Scored);
        assert_eq!(evidence.assertions, vec![assertion("Widgetco", 0.8)]);
    }

    #[test]
    fn unstructured_json_lookalike_falls_back_to_lines() {
        let evidence = Evidence::from_response("{not json}\nAcme:0.5", FieldLayout::Scored);
        assert_eq!(evidence.assertions, vec![assertion("Acme", 0.5)]);
    }

    #[test]
    fn status_labels_round_trip_and_accept_legacy_spellings() {
        for status in [VerificationStatus::Unset, VerificationStatus::Ok, VerificationStatus::Flagged] {
            assert_eq!(VerificationStatus::from_label(status.label()), status);
        }
        assert_eq!(VerificationStatus::from_label("À vérifier"), VerificationStatus::Flagged);
        for flag in [ReviewFlag::Unset, ReviewFlag::Yes, ReviewFlag::No] {
            assert_eq!(ReviewFlag::from_label(flag.label()), flag);
        }
    }

    #[test]
    fn thresholds_are_inclusive() {
        assert_eq!(VerificationStatus::from_confidence(Some(0.7), 0.7), VerificationStatus::Ok);
        assert_eq!(VerificationStatus::from_confidence(Some(0.69), 0.7), VerificationStatus::Flagged);
        assert_eq!(VerificationStatus::from_confidence(None, 0.7), VerificationStatus::Flagged);
        assert_eq!(ReviewFlag::from_confidence(Some(0.7), 0.7), ReviewFlag::No);
        assert_eq!(ReviewFlag::from_confidence(Some(0.5), 0.7), ReviewFlag::Yes);
        assert_eq!(ReviewFlag::from_confidence(None, 0.7), ReviewFlag::Yes);
    }

    #[test]
    fn registry_answers_all_three_views() {
        let dataset = Dataset::from_records(vec![
            BrandRecord::sourced("PepsiCo", "Seven Up"),
            BrandRecord::sourced("PepsiCo", "Lay's"),
            BrandRecord::sourced("Danone", "Evian"),
        ]);
        let registry = dataset.registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.exists_exact("PepsiCo", "Lay's"));
        assert!(!registry.exists_exact("Danone", "Lay's"));
        assert!(registry.exists_brand_anywhere("Evian"));
        assert!(!registry.exists_brand_anywhere("evian"));
        assert!(registry.exists_normalized_anywhere("EVIAN"));
        assert!(!registry.exists_normalized_anywhere("7-up"));
        assert!(registry.exists_normalized_anywhere("Sëven-Up"));

        assert_eq!(registry.check_admission("PepsiCo", "Seven Up"), Err(Rejection::KnownInHolding));
        assert_eq!(registry.check_admission("Danone", "Seven Up"), Err(Rejection::KnownRawName));
        assert_eq!(registry.check_admission("Danone", "LAYS"), Err(Rejection::KnownNormalizedName));
        assert_eq!(registry.check_admission("Danone", "?!"), Err(Rejection::EmptyKey));
        assert_eq!(registry.check_admission("Danone", "Volvic"), Ok(()));
    }

    #[test]
    fn registry_insert_is_visible_immediately() {
        let mut registry = BrandRegistry::new();
        assert!(registry.insert(&BrandRecord::sourced("A", "Crème")));
        assert!(!registry.insert(&BrandRecord::sourced("A", "Crème")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.check_admission("B", "creme"), Err(Rejection::KnownNormalizedName));
    }

    #[test]
    fn holdings_group_in_first_appearance_order_without_repeats() {
        let dataset = Dataset::from_records(vec![
            BrandRecord::sourced("B", "b1"),
            BrandRecord::sourced("A", "a1"),
            BrandRecord::sourced("B", "b2"),
            BrandRecord::sourced("B", "b1"),
        ]);
        let holdings = dataset.holdings();
        assert_eq!(
            holdings,
            vec![
                HoldingBrands {
                    holding: "B".into(),
                    brands: vec!["b1".into(), "b2".into()],
                },
                HoldingBrands {
                    holding: "A".into(),
                    brands: vec!["a1".into()],
                },
            ]
        );
    }

    #[test]
    fn rows_without_holding_or_brand_are_left_out_of_queries() {
        let dataset = Dataset::from_records(vec![
            BrandRecord::sourced("Acme", "Widgetco"),
            BrandRecord::sourced("", "Orphan"),
            BrandRecord::sourced("Globex", " "),
        ]);
        assert_eq!(dataset.len(), 3);
        assert!(dataset.records[1].is_inert());
        let holdings = dataset.holdings();
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].holding, "Acme");
        let registry = dataset.registry();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.check_admission("Acme", "Orphan"), Ok(()));
    }

    #[test]
    fn date_cells_keep_text_they_cannot_parse() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert_eq!(DateAdded::from_cell(" 2026-03-02 "), Some(DateAdded::Date(date)));
        assert_eq!(DateAdded::from_cell(""), None);
        let raw = DateAdded::from_cell("02/03/2026").unwrap();
        assert_eq!(raw, DateAdded::Raw("02/03/2026".into()));
        assert_eq!(raw.as_date(), None);
        assert_eq!(raw.render(), "02/03/2026");
    }

    #[test]
    fn output_columns_follow_input_order() {
        let dataset = Dataset::new(vec!["Pays".into()], Vec::new()).with_column_order(vec![
            "Pays".into(),
            BRAND_COLUMN.into(),
            STATUS_COLUMN.into(),
            HOLDING_COLUMN.into(),
        ]);
        assert_eq!(
            dataset.output_columns(),
            vec![
                "Pays",
                BRAND_COLUMN,
                STATUS_COLUMN,
                HOLDING_COLUMN,
                DATE_ADDED_COLUMN,
                SECTOR_COLUMN,
                DEPARTMENT_COLUMN,
                REVIEW_COLUMN,
            ]
        );
        let in_memory = Dataset::new(vec!["Pays".into()], Vec::new());
        assert_eq!(&in_memory.output_columns()[..3], &[HOLDING_COLUMN, BRAND_COLUMN, "Pays"]);
    }

    #[test]
    fn classification_fill_only_touches_unknown_parts() {
        let mut c = Classification::new("FMCG", "");
        c.fill_missing_from(&Classification::new("Retail", "Snacks"));
        assert_eq!(c, Classification::new("FMCG", "Snacks"));
        assert!(c.is_complete());
    }
}
