//! Reconciliation pipeline: verify existing brands, discover new ones, independent review.
//! Also owns run configuration, the source registry file and per-run reports.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use brec_core::{
    BrandRecord, Dataset, DateAdded, HoldingBrands, Evidence, Rejection, ReviewFlag, VerificationStatus,
};
use brec_sources::{
    source_from_spec, EvidenceSource, SourceContext, SourceError, SourceReply, SourceRole,
    SourceSpec,
};
use brec_storage::{read_dataset, write_dataset, HttpClientConfig, ResponseArchive};
use chrono::{DateTime, Local, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "brec-reconcile";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSpec>,
}

impl SourceRegistry {
    /// First enabled source declared for `role`.
    pub fn source_for(&self, role: SourceRole) -> Result<&SourceSpec> {
        self.sources
            .iter()
            .find(|s| s.enabled && s.role == role)
            .with_context(|| format!("no enabled {role:?} source declared in sources.yaml"))
    }
}

pub async fn load_source_registry(workspace_root: &Path) -> Result<SourceRegistry> {
    let path = workspace_root.join("sources.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub verify_accept: f64,
    pub discovery_floor: f64,
    pub review_accept: f64,
    pub near_duplicate: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            verify_accept: 0.7,
            discovery_floor: 0.5,
            review_accept: 0.7,
            near_duplicate: 0.93,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub workspace_root: PathBuf,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub review_pause: Duration,
    pub fill_classification: bool,
    pub thresholds: Thresholds,
    pub perplexity_api_key: Option<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            input_path: PathBuf::from("Holding.csv"),
            output_path: PathBuf::from("results_verified.csv"),
            archive_dir: None,
            user_agent: "brec-bot/0.1".to_string(),
            http_timeout_secs: 60,
            review_pause: Duration::from_millis(2000),
            fill_classification: true,
            thresholds: Thresholds::default(),
            perplexity_api_key: None,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let thresholds = defaults.thresholds;
        Self {
            workspace_root: std::env::var("BREC_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            input_path: std::env::var("BREC_INPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.input_path),
            output_path: std::env::var("BREC_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            archive_dir: std::env::var("BREC_ARCHIVE_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            user_agent: std::env::var("BREC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("BREC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            review_pause: Duration::from_millis(env_parse(
                "BREC_REVIEW_PAUSE_MS",
                defaults.review_pause.as_millis() as u64,
            )),
            fill_classification: std::env::var("BREC_FILL_CLASSIFICATION")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(defaults.fill_classification),
            thresholds: Thresholds {
                verify_accept: env_parse("BREC_VERIFY_THRESHOLD", thresholds.verify_accept),
                discovery_floor: env_parse("BREC_DISCOVERY_FLOOR", thresholds.discovery_floor),
                review_accept: env_parse("BREC_REVIEW_THRESHOLD", thresholds.review_accept),
                near_duplicate: env_parse(
                    "BREC_NEAR_DUPLICATE_THRESHOLD",
                    thresholds.near_duplicate,
                ),
            },
            perplexity_api_key: std::env::var("PERPLEXITY_API_KEY").ok(),
        }
    }

    /// Relative paths are taken from the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn source_context(&self) -> SourceContext {
        SourceContext {
            workspace_root: self.workspace_root.clone(),
            http: HttpClientConfig {
                timeout: Duration::from_secs(self.http_timeout_secs),
                user_agent: Some(self.user_agent.clone()),
                ..Default::default()
            },
            perplexity_api_key: self.perplexity_api_key.clone(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Verify,
    Discover,
    Review,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Discover => "discover",
            Self::Review => "review",
        }
    }
}

/// Which stages a pipeline invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineScope {
    Full,
    Only(Stage),
}

impl PipelineScope {
    pub fn stages(self) -> Vec<Stage> {
        match self {
            Self::Full => vec![Stage::Verify, Stage::Discover, Stage::Review],
            Self::Only(stage) => vec![stage],
        }
    }

    pub fn includes(self, stage: Stage) -> bool {
        self.stages().contains(&stage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrandRef {
    pub holding: String,
    pub brand: String,
}

/// Counters for one stage. A holding whose query failed is listed by name and its
/// brands are counted in `skipped_brands`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub source_id: String,
    pub holdings_queried: usize,
    pub failed_holdings: Vec<String>,
    pub skipped_brands: usize,
    pub assertions: usize,
    pub rejected_lines: usize,
    pub updated: usize,
    pub unmatched: usize,
    pub admitted: Vec<BrandRef>,
    pub classification_lookups: usize,
    pub rejections: BTreeMap<Rejection, usize>,
}

impl StageReport {
    pub fn new(stage: Stage, source_id: &str) -> Self {
        Self {
            stage,
            source_id: source_id.to_string(),
            holdings_queried: 0,
            failed_holdings: Vec::new(),
            skipped_brands: 0,
            assertions: 0,
            rejected_lines: 0,
            updated: 0,
            unmatched: 0,
            admitted: Vec::new(),
            classification_lookups: 0,
            rejections: BTreeMap::new(),
        }
    }

    fn reject(&mut self, reason: Rejection) {
        *self.rejections.entry(reason).or_default() += 1;
    }

    pub fn rejected_admissions(&self) -> usize {
        self.rejections.values().sum()
    }
}

pub struct Reconciler {
    config: ReconcileConfig,
    primary: Option<Box<dyn EvidenceSource>>,
    reviewer: Option<Box<dyn EvidenceSource>>,
    archive: Option<ResponseArchive>,
    run_date: NaiveDate,
    captured_at: DateTime<Utc>,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        let archive = config
            .archive_dir
            .as_ref()
            .map(|dir| ResponseArchive::new(config.resolve(dir)));
        Self {
            archive,
            primary: None,
            reviewer: None,
            run_date: Local::now().date_naive(),
            captured_at: Utc::now(),
            config,
        }
    }

    pub fn with_primary(mut self, source: Box<dyn EvidenceSource>) -> Self {
        self.primary = Some(source);
        self
    }

    pub fn with_reviewer(mut self, source: Box<dyn EvidenceSource>) -> Self {
        self.reviewer = Some(source);
        self
    }

    pub fn with_run_date(mut self, run_date: NaiveDate) -> Self {
        self.run_date = run_date;
        self
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    fn primary(&self) -> Result<&dyn EvidenceSource> {
        self.primary
            .as_deref()
            .context("no primary evidence source configured")
    }

    fn reviewer(&self) -> Result<&dyn EvidenceSource> {
        self.reviewer
            .as_deref()
            .context("no reviewer evidence source configured")
    }

    pub async fn run(&self, dataset: &mut Dataset, scope: PipelineScope) -> Result<Vec<StageReport>> {
        let mut reports = Vec::new();
        for stage in scope.stages() {
            let span = info_span!("stage", stage = stage.as_str());
            let report = match stage {
                Stage::Verify => self.verify_existing(dataset).instrument(span).await?,
                Stage::Discover => self.discover_new_brands(dataset).instrument(span).await?,
                Stage::Review => self.final_review(dataset).instrument(span).await?,
            };
            info!(
                stage = stage.as_str(),
                queried = report.holdings_queried,
                failed = report.failed_holdings.len(),
                updated = report.updated,
                admitted = report.admitted.len(),
                "stage finished"
            );
            reports.push(report);
        }
        Ok(reports)
    }

    /// Query the primary source once per holding with its full brand list and record
    /// OK/FLAGGED on exact `(holding, brand)` matches.
    pub async fn verify_existing(&self, dataset: &mut Dataset) -> Result<StageReport> {
        let source = self.primary()?;
        let threshold = self.config.thresholds.verify_accept;
        let mut report = StageReport::new(Stage::Verify, source.source_id());

        for group in dataset.holdings() {
            let span = info_span!("verify_holding", holding = %group.holding, brands = group.brands.len());
            let outcome = source.verify(&group.holding, &group.brands).instrument(span).await;
            let Some(evidence) = self
                .absorb(Stage::Verify, &group, outcome, &mut report)
                .await
            else {
                continue;
            };

            for assertion in evidence.assertions {
                let status = VerificationStatus::from_confidence(assertion.confidence, threshold);
                let mut matched = 0usize;
                for record in dataset.matching_mut(&group.holding, &assertion.brand) {
                    record.verification = status;
                    matched += 1;
                }
                if matched == 0 {
                    debug!(holding = %group.holding, brand = %assertion.brand, "assertion for a brand not under this holding");
                    report.unmatched += 1;
                } else {
                    debug!(holding = %group.holding, brand = %assertion.brand, status = status.label(), "verification recorded");
                    report.updated += matched;
                }
            }
        }
        Ok(report)
    }

    /// Ask the primary source for every brand of each holding and admit the ones that clear
    /// the confidence floor and are unknown under any spelling.
    pub async fn discover_new_brands(&self, dataset: &mut Dataset) -> Result<StageReport> {
        let source = self.primary()?;
        let thresholds = self.config.thresholds;
        let mut report = StageReport::new(Stage::Discover, source.source_id());
        let mut registry = dataset.registry();

        for group in dataset.holdings() {
            let span = info_span!("discover_holding", holding = %group.holding);
            let outcome = source.discover(&group.holding).instrument(span).await;
            let Some(evidence) = self
                .absorb(Stage::Discover, &group, outcome, &mut report)
                .await
            else {
                continue;
            };
            let holding = group.holding;

            for assertion in evidence.assertions {
                let confidence = match assertion.confidence {
                    Some(c) if c >= thresholds.discovery_floor => c,
                    _ => {
                        debug!(holding = %holding, brand = %assertion.brand, confidence = ?assertion.confidence, "below discovery floor");
                        report.reject(Rejection::LowConfidence);
                        continue;
                    }
                };
                if let Err(reason) = registry.check_admission(&holding, &assertion.brand) {
                    debug!(holding = %holding, brand = %assertion.brand, %reason, "not admitted");
                    report.reject(reason);
                    continue;
                }

                let mut classification = assertion.classification;
                if self.config.fill_classification && !classification.is_complete() {
                    report.classification_lookups += 1;
                    match source.classify(&assertion.brand).await {
                        Ok(found) => classification.fill_missing_from(&found),
                        Err(err) => {
                            warn!(brand = %assertion.brand, error = %err, "classification lookup failed")
                        }
                    }
                }

                let record = BrandRecord::discovered(
                    holding.clone(),
                    assertion.brand.clone(),
                    VerificationStatus::from_confidence(Some(confidence), thresholds.verify_accept),
                    self.run_date,
                    classification,
                );
                registry.insert(&record);
                info!(holding = %holding, brand = %record.brand, confidence, status = record.verification.label(), "admitted new brand");
                dataset.push(record);
                report.admitted.push(BrandRef {
                    holding: holding.clone(),
                    brand: assertion.brand,
                });
            }
        }
        Ok(report)
    }

    /// Re-verify every holding's current brand list with the reviewer source.
    /// Brands the reviewer does not mention keep their previous flag.
    pub async fn final_review(&self, dataset: &mut Dataset) -> Result<StageReport> {
        let source = self.reviewer()?;
        let threshold = self.config.thresholds.review_accept;
        let pause = self.config.review_pause;
        let mut report = StageReport::new(Stage::Review, source.source_id());

        for (idx, group) in dataset.holdings().into_iter().enumerate() {
            if idx > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            let span = info_span!("review_holding", holding = %group.holding, brands = group.brands.len());
            let outcome = source.verify(&group.holding, &group.brands).instrument(span).await;
            let Some(evidence) = self
                .absorb(Stage::Review, &group, outcome, &mut report)
                .await
            else {
                continue;
            };

            for assertion in evidence.assertions {
                let flag = ReviewFlag::from_confidence(assertion.confidence, threshold);
                let mut matched = 0usize;
                for record in dataset.matching_mut(&group.holding, &assertion.brand) {
                    record.review = flag;
                    matched += 1;
                }
                if matched == 0 {
                    report.unmatched += 1;
                } else {
                    debug!(holding = %group.holding, brand = %assertion.brand, flag = flag.label(), "review recorded");
                    report.updated += matched;
                }
            }
        }
        Ok(report)
    }

    /// Book-keeping shared by all stages: failure accounting, archiving and line rejects.
    async fn absorb(
        &self,
        stage: Stage,
        group: &HoldingBrands,
        outcome: Result<SourceReply, SourceError>,
        report: &mut StageReport,
    ) -> Option<Evidence> {
        let holding = group.holding.as_str();
        report.holdings_queried += 1;
        let reply = match outcome {
            Ok(reply) => reply,
            Err(err) => {
                warn!(stage = stage.as_str(), holding, brands = group.brands.len(), error = %err, "query failed, holding skipped");
                report.failed_holdings.push(holding.to_string());
                report.skipped_brands += group.brands.len();
                return None;
            }
        };

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.store(self.captured_at, stage.as_str(), &reply.raw).await {
                warn!(stage = stage.as_str(), holding, error = %err, "could not archive response");
            }
        }
        for rejected in &reply.evidence.rejected {
            warn!(stage = stage.as_str(), holding, error = %rejected, "discarding response line");
        }
        report.rejected_lines += reply.evidence.rejected.len();
        report.assertions += reply.evidence.assertions.len();
        Some(reply.evidence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKind {
    /// Same normalized key under two holdings.
    Collision,
    Similar,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearDuplicate {
    pub kind: DuplicateKind,
    pub score: f64,
    pub holding_a: String,
    pub brand_a: String,
    pub holding_b: String,
    pub brand_b: String,
}

/// Read-only cross-holding comparison of normalized brand keys.
pub struct NearDuplicateAudit {
    threshold: f64,
}

impl NearDuplicateAudit {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn audit(&self, dataset: &Dataset) -> Vec<NearDuplicate> {
        let mut seen = HashSet::new();
        let entries: Vec<(&str, &str, String)> = dataset
            .records
            .iter()
            .filter(|r| !r.is_inert())
            .filter(|r| seen.insert((r.holding.as_str(), r.brand.as_str())))
            .map(|r| (r.holding.as_str(), r.brand.as_str(), r.normalized_key()))
            .filter(|(_, _, key)| !key.is_empty())
            .collect();

        let mut findings = Vec::new();
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let (holding_a, brand_a, key_a) = &entries[i];
                let (holding_b, brand_b, key_b) = &entries[j];
                if holding_a == holding_b {
                    continue;
                }
                let (kind, score) = if key_a == key_b {
                    (DuplicateKind::Collision, 1.0)
                } else {
                    let score = jaro_winkler(key_a, key_b);
                    if score < self.threshold {
                        continue;
                    }
                    (DuplicateKind::Similar, score)
                };
                findings.push(NearDuplicate {
                    kind,
                    score,
                    holding_a: holding_a.to_string(),
                    brand_a: brand_a.to_string(),
                    holding_b: holding_b.to_string(),
                    brand_b: brand_b.to_string(),
                });
            }
        }
        findings
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_date: NaiveDate,
    pub input_path: String,
    pub output_path: String,
    pub records: usize,
    pub stages: Vec<StageReport>,
    pub near_duplicates: Vec<NearDuplicate>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Load the input, run `scope`, write the output dataset and the run reports.
pub async fn run_pipeline(config: ReconcileConfig, scope: PipelineScope) -> Result<RunSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let registry = load_source_registry(&config.workspace_root).await?;
    let ctx = config.source_context();

    let mut reconciler = Reconciler::new(config.clone());
    if scope.includes(Stage::Verify) || scope.includes(Stage::Discover) {
        let spec = registry.source_for(SourceRole::Primary)?;
        reconciler = reconciler.with_primary(
            source_from_spec(spec, &ctx)
                .with_context(|| format!("building source {}", spec.source_id))?,
        );
    }
    if scope.includes(Stage::Review) {
        let spec = registry.source_for(SourceRole::Reviewer)?;
        reconciler = reconciler.with_reviewer(
            source_from_spec(spec, &ctx)
                .with_context(|| format!("building source {}", spec.source_id))?,
        );
    }

    let input_path = config.resolve(&config.input_path);
    let output_path = config.resolve(&config.output_path);
    let mut dataset = read_dataset(&input_path)?;
    info!(%run_id, records = dataset.len(), input = %input_path.display(), "dataset loaded");

    let stages = reconciler.run(&mut dataset, scope).await?;
    write_dataset(&output_path, &dataset)?;
    info!(records = dataset.len(), output = %output_path.display(), "dataset written");

    let near_duplicates = NearDuplicateAudit::new(config.thresholds.near_duplicate).audit(&dataset);
    if !near_duplicates.is_empty() {
        warn!(count = near_duplicates.len(), "brands with near-identical names under different holdings");
    }

    let reports_dir = config.workspace_root.join("reports").join(run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let manifest_path = export_parquet_snapshot(&reports_dir, &dataset, &near_duplicates).await?;

    let summary = RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        run_date: reconciler.run_date(),
        input_path: input_path.display().to_string(),
        output_path: output_path.display().to_string(),
        records: dataset.len(),
        stages,
        near_duplicates,
        reports_dir: reports_dir.display().to_string(),
        parquet_manifest: manifest_path.display().to_string(),
    };
    write_reports(&reports_dir, &summary, &dataset).await?;
    Ok(summary)
}

pub async fn run_from_env(scope: PipelineScope) -> Result<RunSummary> {
    run_pipeline(ReconcileConfig::from_env(), scope).await
}

pub async fn write_reports(reports_dir: &Path, summary: &RunSummary, dataset: &Dataset) -> Result<()> {
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(reports_dir.join("brief.md"), render_brief(summary, dataset))
        .await
        .context("writing brief.md")?;
    Ok(())
}

fn render_brief(summary: &RunSummary, dataset: &Dataset) -> String {
    let mut lines = vec![
        "# Brand Reconciliation Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Run date: {}", summary.run_date),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Records: {}", summary.records),
        String::new(),
        "## Stages".to_string(),
    ];
    for stage in &summary.stages {
        lines.push(format!(
            "- {} ({}): {} holdings queried, {} failed ({} brands skipped), {} assertions, {} updated, {} admitted, {} rejected",
            stage.stage.as_str(),
            stage.source_id,
            stage.holdings_queried,
            stage.failed_holdings.len(),
            stage.skipped_brands,
            stage.assertions,
            stage.updated,
            stage.admitted.len(),
            stage.rejected_admissions(),
        ));
    }

    let admitted: Vec<&BrandRef> = summary.stages.iter().flat_map(|s| &s.admitted).collect();
    if !admitted.is_empty() {
        lines.push(String::new());
        lines.push("## New Brands".to_string());
        lines.extend(admitted.iter().map(|b| format!("- {} / {}", b.holding, b.brand)));
    }

    let to_review: Vec<&BrandRecord> = dataset
        .records
        .iter()
        .filter(|r| r.review == ReviewFlag::Yes)
        .collect();
    if !to_review.is_empty() {
        lines.push(String::new());
        lines.push("## To Review".to_string());
        lines.extend(to_review.iter().map(|r| format!("- {} / {}", r.holding, r.brand)));
    }

    let failed: Vec<String> = summary
        .stages
        .iter()
        .flat_map(|s| s.failed_holdings.iter().map(move |h| format!("- {}: {}", s.stage.as_str(), h)))
        .collect();
    if !failed.is_empty() {
        lines.push(String::new());
        lines.push("## Failed Holdings".to_string());
        lines.extend(failed);
    }

    if !summary.near_duplicates.is_empty() {
        lines.push(String::new());
        lines.push("## Near Duplicates".to_string());
        lines.extend(summary.near_duplicates.iter().map(|d| {
            format!(
                "- {} / {} ~ {} / {} ({:.2})",
                d.holding_a, d.brand_a, d.holding_b, d.brand_b, d.score
            )
        }));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn export_parquet_snapshot(
    reports_dir: &Path,
    dataset: &Dataset,
    near_duplicates: &[NearDuplicate],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let brands_path = snapshot_dir.join("brands.parquet");
    let duplicates_path = snapshot_dir.join("near_duplicates.parquet");
    write_brands_parquet(&brands_path, dataset)?;
    write_near_duplicates_parquet(&duplicates_path, near_duplicates)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("brands", reports_dir, &brands_path)?,
            manifest_entry("near_duplicates", reports_dir, &duplicates_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Markdown index of the most recent runs under `<workspace>/reports`.
pub fn report_recent_runs_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_summary.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Brand Reconciliation Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("run_summary.json");
        let brief_path = dir.path().join("brief.md");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let stages = summary
            .get("stages")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let count_in = |field: &str| -> usize {
            stages
                .iter()
                .filter_map(|s| s.get(field).and_then(|v| v.as_array()).map(Vec::len))
                .sum()
        };
        let records = summary.get("records").and_then(|v| v.as_u64()).unwrap_or(0);
        let run_date = summary
            .get("run_date")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let stage_names = stages
            .iter()
            .filter_map(|s| s.get("stage").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- run date: {run_date}"));
        lines.push(format!("- stages: {stage_names}"));
        lines.push(format!("- records: {records}"));
        lines.push(format!("- new brands: {}", count_in("admitted")));
        lines.push(format!("- failed holdings: {}", count_in("failed_holdings")));
        lines.push(format!("- summary: `{}`", summary_path.display()));
        if brief_path.exists() {
            lines.push(format!("- brief: `{}`", brief_path.display()));
        }
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn status_name(status: VerificationStatus) -> Option<&'static str> {
    match status {
        VerificationStatus::Unset => None,
        VerificationStatus::Ok => Some("ok"),
        VerificationStatus::Flagged => Some("flagged"),
    }
}

fn review_name(flag: ReviewFlag) -> Option<&'static str> {
    match flag {
        ReviewFlag::Unset => None,
        ReviewFlag::Yes => Some("yes"),
        ReviewFlag::No => Some("no"),
    }
}

fn write_brands_parquet(path: &Path, dataset: &Dataset) -> Result<()> {
    let records = &dataset.records;
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("holding", DataType::Utf8, false),
        ArrowField::new("brand", DataType::Utf8, false),
        ArrowField::new("normalized_key", DataType::Utf8, false),
        ArrowField::new("verification_status", DataType::Utf8, true),
        ArrowField::new("review_flag", DataType::Utf8, true),
        ArrowField::new("date_added", DataType::Utf8, true),
        ArrowField::new("sector", DataType::Utf8, false),
        ArrowField::new("department", DataType::Utf8, false),
    ]));

    let holdings = StringArray::from(records.iter().map(|r| Some(r.holding.as_str())).collect::<Vec<_>>());
    let brands = StringArray::from(records.iter().map(|r| Some(r.brand.as_str())).collect::<Vec<_>>());
    let keys = StringArray::from(records.iter().map(|r| Some(r.normalized_key())).collect::<Vec<_>>());
    let statuses = StringArray::from(records.iter().map(|r| status_name(r.verification)).collect::<Vec<_>>());
    let reviews = StringArray::from(records.iter().map(|r| review_name(r.review)).collect::<Vec<_>>());
    let dates = StringArray::from(
        records
            .iter()
            .map(|r| r.date_added.as_ref().map(DateAdded::render))
            .collect::<Vec<_>>(),
    );
    let sectors = StringArray::from(records.iter().map(|r| Some(r.sector.as_str())).collect::<Vec<_>>());
    let departments =
        StringArray::from(records.iter().map(|r| Some(r.department.as_str())).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(holdings),
            Arc::new(brands),
            Arc::new(keys),
            Arc::new(statuses),
            Arc::new(reviews),
            Arc::new(dates),
            Arc::new(sectors),
            Arc::new(departments),
        ],
    )
    .context("building brands record batch")?;
    write_parquet(path, batch)
}

fn write_near_duplicates_parquet(path: &Path, findings: &[NearDuplicate]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("score", DataType::Float64, false),
        ArrowField::new("holding_a", DataType::Utf8, false),
        ArrowField::new("brand_a", DataType::Utf8, false),
        ArrowField::new("holding_b", DataType::Utf8, false),
        ArrowField::new("brand_b", DataType::Utf8, false),
    ]));

    let kinds = StringArray::from(
        findings
            .iter()
            .map(|d| match d.kind {
                DuplicateKind::Collision => Some("collision"),
                DuplicateKind::Similar => Some("similar"),
            })
            .collect::<Vec<_>>(),
    );
    let scores = Float64Array::from(findings.iter().map(|d| d.score).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(kinds),
            Arc::new(scores),
            Arc::new(text_column(findings, |d| &d.holding_a)),
            Arc::new(text_column(findings, |d| &d.brand_a)),
            Arc::new(text_column(findings, |d| &d.holding_b)),
            Arc::new(text_column(findings, |d| &d.brand_b)),
        ],
    )
    .context("building near_duplicates record batch")?;
    write_parquet(path, batch)
}

fn text_column<'a>(
    findings: &'a [NearDuplicate],
    pick: impl Fn(&'a NearDuplicate) -> &'a String,
) -> StringArray {
    StringArray::from(findings.iter().map(|d| Some(pick(d).as_str())).collect::<Vec<_>>())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use brec_core::Classification;

    fn record(holding: &str, brand: &str) -> BrandRecord {
        BrandRecord::sourced(holding, brand)
    }

    #[test]
    fn audit_reports_cross_holding_collisions_only() {
        let dataset = Dataset::from_records(vec![
            record("Acme", "Widgetco"),
            record("Acme", "Widget Co"),
            record("Globex", "WIDGET-CO"),
            record("Globex", "Nutella"),
        ]);
        let findings = NearDuplicateAudit::new(0.93).audit(&dataset);
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|d| d.kind == DuplicateKind::Collision));
        assert!(findings.iter().all(|d| d.holding_a != d.holding_b));
        assert!(findings.iter().all(|d| d.score == 1.0));
    }

    #[test]
    fn audit_flags_similar_spellings_above_threshold() {
        let dataset = Dataset::from_records(vec![
            record("Acme", "Lindt"),
            record("Globex", "Lindts"),
            record("Initech", "Gadget"),
        ]);
        let findings = NearDuplicateAudit::new(0.93).audit(&dataset);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, DuplicateKind::Similar);
        assert_eq!(findings[0].brand_b, "Lindts");
        assert!(findings[0].score >= 0.93 && findings[0].score < 1.0);

        assert!(NearDuplicateAudit::new(0.99).audit(&dataset).is_empty());
    }

    #[test]
    fn scope_lists_stages_in_pipeline_order() {
        assert_eq!(
            PipelineScope::Full.stages(),
            vec![Stage::Verify, Stage::Discover, Stage::Review]
        );
        assert!(PipelineScope::Only(Stage::Review).includes(Stage::Review));
        assert!(!PipelineScope::Only(Stage::Review).includes(Stage::Verify));
    }

    #[test]
    fn source_registry_picks_first_enabled_source_per_role() {
        let registry: SourceRegistry = serde_yaml::from_str(
            r#"
sources:
  - source_id: search-old
    role: primary
    kind: perplexica
    enabled: false
  - source_id: search
    role: primary
    kind: perplexica
    endpoint: http://localhost:3000
  - source_id: review
    role: reviewer
    kind: perplexity
    model: sonar
"#,
        )
        .unwrap();
        assert_eq!(registry.source_for(SourceRole::Primary).unwrap().source_id, "search");
        assert_eq!(registry.source_for(SourceRole::Reviewer).unwrap().source_id, "review");

        let primaries_only = SourceRegistry {
            sources: vec![registry.sources[1].clone()],
        };
        assert!(primaries_only.source_for(SourceRole::Reviewer).is_err());
    }

    #[test]
    fn relative_paths_resolve_against_workspace() {
        let config = ReconcileConfig {
            workspace_root: PathBuf::from("/data/run"),
            ..Default::default()
        };
        assert_eq!(
            config.resolve(Path::new("Holding.csv")),
            PathBuf::from("/data/run/Holding.csv")
        );
        assert_eq!(config.resolve(Path::new("/tmp/out.csv")), PathBuf::from("/tmp/out.csv"));
    }

    #[test]
    fn stage_report_serializes_rejections_by_reason() {
        let mut report = StageReport::new(Stage::Discover, "search");
        report.reject(Rejection::LowConfidence);
        report.reject(Rejection::KnownNormalizedName);
        report.reject(Rejection::LowConfidence);
        assert_eq!(report.rejected_admissions(), 3);

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["stage"], "discover");
        assert_eq!(value["rejections"]["low_confidence"], 2);
        assert_eq!(value["rejections"]["known_normalized_name"], 1);
    }

    #[tokio::test]
    async fn snapshot_manifest_matches_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut dataset = Dataset::from_records(vec![record("Acme", "Widgetco")]);
        dataset.push(BrandRecord::discovered(
            "Acme",
            "NewBrand",
            VerificationStatus::Flagged,
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            Classification::new("FMCG", "Snacks"),
        ));

        let manifest_path = export_parquet_snapshot(dir.path(), &dataset, &[]).await.unwrap();
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        for entry in files {
            let bytes = std::fs::read(dir.path().join(entry["path"].as_str().unwrap())).unwrap();
            assert_eq!(entry["bytes"].as_u64().unwrap(), bytes.len() as u64);
            assert_eq!(entry["sha256"].as_str().unwrap(), hex::encode(Sha256::digest(&bytes)));
        }
    }

    #[test]
    fn recent_runs_index_reads_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("reports").join("run-1");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(
            run_dir.join("run_summary.json"),
            serde_json::json!({
                "run_date": "2026-03-02",
                "records": 3,
                "stages": [
                    {"stage": "verify", "admitted": [], "failed_holdings": ["Globex"]},
                    {"stage": "discover", "admitted": [{"holding": "Acme", "brand": "NewBrand"}], "failed_holdings": []}
                ]
            })
            .to_string(),
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("reports").join("scratch")).unwrap();

        let markdown = report_recent_runs_markdown(5, Some(dir.path().to_path_buf())).unwrap();
        assert!(markdown.contains("## Run `run-1`"));
        assert!(markdown.contains("- stages: verify, discover"));
        assert!(markdown.contains("- new brands: 1"));
        assert!(markdown.contains("- failed holdings: 1"));
        assert!(!markdown.contains("scratch"));
    }
}
