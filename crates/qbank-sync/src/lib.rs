//! Reconciliation pipeline: sanitize batch fields and patch them into the
//! persisted question store, one record at a time.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use qbank_adapters::load_batch;
use qbank_core::{json_kind, Document, QuestionPatch, Record, EXAMPLES_FIELD, SOLUTION_FIELD};
use qbank_storage::{JsonFileStore, PgQuestionStore, QuestionStore, StoreError, StoreFlush};
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "qbank-sync";

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern is valid"));

fn sanitize_pass(input: &str) -> String {
    let decoded = html_escape::decode_html_entities(input);
    TAG_PATTERN.replace_all(&decoded, "").into_owned()
}

/// Decode HTML entities, then strip inline tags.
///
/// Passes repeat until the text stops changing, so doubly escaped input such
/// as `&amp;lt;b&amp;gt;` is fully cleaned and the result is a fixed point.
/// Every pass that changes the text makes it shorter, which bounds the loop.
pub fn sanitize_text(input: &str) -> String {
    let mut current = sanitize_pass(input);
    loop {
        let next = sanitize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// How batch text is treated before it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    /// Entity decoding and tag stripping (`clean`).
    Sanitize,
    /// Shape-checked but written as-is (`populate`).
    Raw,
}

impl TextMode {
    fn apply(self, text: &str) -> String {
        match self {
            TextMode::Sanitize => sanitize_text(text),
            TextMode::Raw => text.to_string(),
        }
    }
}

impl fmt::Display for TextMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextMode::Sanitize => f.write_str("sanitize"),
            TextMode::Raw => f.write_str("raw"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("entry missing 'questionid' field")]
    MissingKey,
    #[error("no document found with questionid {0}")]
    LookupMiss(i64),
    #[error("{field} {message}")]
    Sanitization { field: String, message: String },
    #[error("lookup failed: {0}")]
    StoreRead(#[source] StoreError),
    #[error("update failed: {0}")]
    StoreWrite(#[source] StoreError),
}

fn shape_error(field: impl Into<String>, message: impl Into<String>) -> RecordError {
    RecordError::Sanitization {
        field: field.into(),
        message: message.into(),
    }
}

fn required_text(
    example: &Document,
    field: &str,
    at: usize,
    mode: TextMode,
) -> Result<String, RecordError> {
    match example.get(field) {
        Some(JsonValue::String(text)) => Ok(mode.apply(text)),
        Some(other) => Err(shape_error(
            format!("examples[{at}].{field}"),
            format!("is {}, expected text", json_kind(other)),
        )),
        None => Err(shape_error(format!("examples[{at}].{field}"), "is missing")),
    }
}

/// Transform the text fields of every example in a raw batch value.
///
/// Each example object is copied as-is and only `expected_input`,
/// `expected_output` and a string `explanation` are rewritten; any other key
/// is kept untouched. A missing or null `explanation` stays that way.
pub fn examples_from_value(value: &JsonValue, mode: TextMode) -> Result<Vec<Document>, RecordError> {
    let JsonValue::Array(items) = value else {
        return Err(shape_error(
            EXAMPLES_FIELD,
            format!("is {}, expected an array", json_kind(value)),
        ));
    };

    items
        .iter()
        .enumerate()
        .map(|(at, item)| {
            let JsonValue::Object(example) = item else {
                return Err(shape_error(
                    format!("examples[{at}]"),
                    format!("is {}, expected an object", json_kind(item)),
                ));
            };
            let mut out = example.clone();
            for field in ["expected_input", "expected_output"] {
                let text = required_text(example, field, at, mode)?;
                out.insert(field.into(), JsonValue::String(text));
            }
            match example.get("explanation") {
                None | Some(JsonValue::Null) => {}
                Some(JsonValue::String(text)) => {
                    out.insert("explanation".into(), JsonValue::String(mode.apply(text)));
                }
                Some(other) => {
                    return Err(shape_error(
                        format!("examples[{at}].explanation"),
                        format!("is {}, expected text", json_kind(other)),
                    ))
                }
            }
            Ok(out)
        })
        .collect()
}

/// Derive the update payload for one record from the fields it carries.
pub fn build_patch(record: &Record, mode: TextMode) -> Result<QuestionPatch, RecordError> {
    let examples = match &record.examples {
        None | Some(JsonValue::Null) => None,
        Some(value) => Some(examples_from_value(value, mode)?),
    };
    let solution = match &record.solution {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(text)) => Some(mode.apply(text)),
        Some(other) => {
            return Err(shape_error(
                SOLUTION_FIELD,
                format!("is {}, expected text", json_kind(other)),
            ))
        }
    };
    Ok(QuestionPatch { examples, solution })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    MissingKey,
    EmptyPatch,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Updated,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Updated {
        questionid: i64,
        fields: Vec<String>,
    },
    Skipped {
        questionid: Option<i64>,
        reason: SkipReason,
    },
    Failed {
        questionid: Option<i64>,
        error: String,
    },
}

impl RecordOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            RecordOutcome::Updated { .. } => OutcomeKind::Updated,
            RecordOutcome::Skipped { .. } => OutcomeKind::Skipped,
            RecordOutcome::Failed { .. } => OutcomeKind::Failed,
        }
    }

    pub fn questionid(&self) -> Option<i64> {
        match self {
            RecordOutcome::Updated { questionid, .. } => Some(*questionid),
            RecordOutcome::Skipped { questionid, .. } | RecordOutcome::Failed { questionid, .. } => {
                *questionid
            }
        }
    }
}

enum Applied {
    Updated(QuestionPatch),
    Unchanged,
    EmptyPatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub questionid: Option<i64>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub mode: TextMode,
    pub backend: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<RecordFailure>,
    pub outcomes: Vec<RecordOutcome>,
}

impl ReconciliationReport {
    fn from_outcomes(
        run_id: Uuid,
        mode: TextMode,
        backend: &str,
        started_at: DateTime<Utc>,
        outcomes: Vec<RecordOutcome>,
    ) -> Self {
        let count = |kind: OutcomeKind| outcomes.iter().filter(|o| o.kind() == kind).count();
        let failures = outcomes
            .iter()
            .filter_map(|o| match o {
                RecordOutcome::Failed { questionid, error } => Some(RecordFailure {
                    questionid: *questionid,
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect();
        Self {
            run_id,
            mode,
            backend: backend.to_string(),
            started_at,
            finished_at: Utc::now(),
            updated: count(OutcomeKind::Updated),
            skipped: count(OutcomeKind::Skipped),
            failed: count(OutcomeKind::Failed),
            failures,
            outcomes,
        }
    }

    pub fn kinds(&self) -> Vec<OutcomeKind> {
        self.outcomes.iter().map(RecordOutcome::kind).collect()
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, RecordOutcome::Skipped { reason: r, .. } if *r == reason))
            .count()
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Question Bank Reconciliation".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Mode: {}", self.mode),
            format!("- Store: {}", self.backend),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Updated: {}", self.updated),
            format!(
                "- Skipped: {} (not found {}, missing key {}, empty {}, unchanged {})",
                self.skipped,
                self.skipped_for(SkipReason::NotFound),
                self.skipped_for(SkipReason::MissingKey),
                self.skipped_for(SkipReason::EmptyPatch),
                self.skipped_for(SkipReason::Unchanged),
            ),
            format!("- Failed: {}", self.failed),
        ];
        if !self.failures.is_empty() {
            lines.push(String::new());
            lines.push("## Failures".to_string());
            for failure in &self.failures {
                let id = failure
                    .questionid
                    .map_or_else(|| "<none>".to_string(), |id| id.to_string());
                lines.push(format!("- {id}: {}", failure.error));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Applies batch records to an injected store, strictly in source order.
pub struct Reconciler {
    store: Arc<dyn QuestionStore>,
    mode: TextMode,
}

impl Reconciler {
    pub fn new(store: Arc<dyn QuestionStore>) -> Self {
        Self {
            store,
            mode: TextMode::Sanitize,
        }
    }

    pub fn with_mode(mut self, mode: TextMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> TextMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<dyn QuestionStore> {
        &self.store
    }

    pub async fn reconcile(&self, records: &[Record]) -> ReconciliationReport {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id, mode = %self.mode, backend = self.store.backend());

        let outcomes = async {
            let mut outcomes = Vec::with_capacity(records.len());
            for record in records {
                outcomes.push(self.reconcile_record(record).await);
            }
            outcomes
        }
        .instrument(span)
        .await;

        let report = ReconciliationReport::from_outcomes(
            run_id,
            self.mode,
            self.store.backend(),
            started_at,
            outcomes,
        );
        info!(
            %run_id,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "reconciliation complete"
        );
        report
    }

    /// Reconcile one record; every error is folded into the outcome.
    pub async fn reconcile_record(&self, record: &Record) -> RecordOutcome {
        let questionid = record.questionid;
        match self.try_reconcile(record).await {
            Ok(Applied::Updated(patch)) => {
                let id = questionid.unwrap_or_default();
                info!("Updated document with questionid {id}");
                RecordOutcome::Updated {
                    questionid: id,
                    fields: patch.field_names().into_iter().map(String::from).collect(),
                }
            }
            Ok(Applied::Unchanged) => {
                info!(?questionid, "document already up to date");
                RecordOutcome::Skipped {
                    questionid,
                    reason: SkipReason::Unchanged,
                }
            }
            Ok(Applied::EmptyPatch) => {
                info!(?questionid, "no examples or solution in entry");
                RecordOutcome::Skipped {
                    questionid,
                    reason: SkipReason::EmptyPatch,
                }
            }
            Err(RecordError::LookupMiss(id)) => {
                info!("No document found with questionid {id}");
                RecordOutcome::Skipped {
                    questionid,
                    reason: SkipReason::NotFound,
                }
            }
            Err(RecordError::MissingKey) => {
                warn!(slug = ?record.slug, "Entry missing 'questionid' field");
                RecordOutcome::Skipped {
                    questionid,
                    reason: SkipReason::MissingKey,
                }
            }
            Err(err) => {
                error!(?questionid, "Error: {err}");
                RecordOutcome::Failed {
                    questionid,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn try_reconcile(&self, record: &Record) -> Result<Applied, RecordError> {
        let questionid = record.questionid.ok_or(RecordError::MissingKey)?;
        let persisted = self
            .store
            .find_one(questionid)
            .await
            .map_err(RecordError::StoreRead)?
            .ok_or(RecordError::LookupMiss(questionid))?;

        let patch = build_patch(record, self.mode)?;
        if patch.is_empty() {
            return Ok(Applied::EmptyPatch);
        }
        if patch.is_applied_to(&persisted) {
            return Ok(Applied::Unchanged);
        }

        let matched = self
            .store
            .update_one(questionid, &patch)
            .await
            .map_err(RecordError::StoreWrite)?;
        if matched == 0 {
            return Err(RecordError::LookupMiss(questionid));
        }
        Ok(Applied::Updated(patch))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Json,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "file" => Ok(StoreBackend::Json),
            "postgres" | "postgresql" | "pg" => Ok(StoreBackend::Postgres),
            other => bail!("unknown store backend {other:?} (expected json or postgres)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QbankConfig {
    pub store_backend: StoreBackend,
    pub store_path: PathBuf,
    pub database_url: Option<String>,
    pub reports_dir: PathBuf,
    pub write_reports: bool,
}

impl Default for QbankConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Json,
            store_path: PathBuf::from("./questions.json"),
            database_url: None,
            reports_dir: PathBuf::from("./reports"),
            write_reports: true,
        }
    }
}

impl QbankConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            store_backend: match std::env::var("QBANK_STORE") {
                Ok(value) => value.parse::<StoreBackend>().context("parsing QBANK_STORE")?,
                Err(_) => defaults.store_backend,
            },
            store_path: std::env::var("QBANK_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            reports_dir: std::env::var("QBANK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            write_reports: std::env::var("QBANK_WRITE_REPORTS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(defaults.write_reports),
        })
    }
}

/// Connect the store named by `config`.
pub async fn open_store(config: &QbankConfig) -> Result<Arc<dyn QuestionStore>> {
    match config.store_backend {
        StoreBackend::Json => {
            let store = JsonFileStore::open(&config.store_path)
                .await
                .with_context(|| format!("opening json store {}", config.store_path.display()))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set for the postgres store")?;
            let store = PgQuestionStore::connect(url)
                .await
                .context("connecting to postgres")?;
            Ok(Arc::new(store))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileRunSummary {
    pub report: ReconciliationReport,
    pub flushed: Option<StoreFlush>,
    pub reports_dir: Option<PathBuf>,
}

/// Load a batch, reconcile it against `store`, persist buffered writes and
/// write run reports.
///
/// Batch loading errors abort before any record is touched; per-record
/// problems only show up in the report.
pub async fn run_reconciliation(
    config: &QbankConfig,
    store: Arc<dyn QuestionStore>,
    batch_path: &Path,
    mode: TextMode,
) -> Result<ReconcileRunSummary> {
    let records = load_batch(batch_path)?;
    info!(path = %batch_path.display(), records = records.len(), %mode, "batch loaded");

    let reconciler = Reconciler::new(store).with_mode(mode);
    let report = reconciler.reconcile(&records).await;
    let flushed = reconciler
        .store()
        .flush()
        .await
        .context("persisting store changes")?;
    if let Some(flush) = &flushed {
        info!(
            path = %flush.path.display(),
            sha256 = %flush.content_hash,
            documents = flush.documents,
            "store saved"
        );
    }

    let reports_dir = if config.write_reports {
        Some(write_reports(&config.reports_dir, &report).await?)
    } else {
        None
    };

    Ok(ReconcileRunSummary {
        report,
        flushed,
        reports_dir,
    })
}

pub async fn run_reconciliation_from_env(batch_path: &Path, mode: TextMode) -> Result<ReconcileRunSummary> {
    let config = QbankConfig::from_env()?;
    let store = open_store(&config).await?;
    run_reconciliation(&config, store, batch_path, mode).await
}

/// Write `reconciliation.json` and `summary.md` under `<root>/<run_id>/`.
pub async fn write_reports(root: &Path, report: &ReconciliationReport) -> Result<PathBuf> {
    let dir = root.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing reconciliation report")?;
    fs::write(dir.join("reconciliation.json"), json)
        .await
        .context("writing reconciliation.json")?;
    fs::write(dir.join("summary.md"), report.to_markdown())
        .await
        .context("writing summary.md")?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use qbank_storage::MemoryStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(value: JsonValue) -> Document {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn record(value: JsonValue) -> Record {
        Record::from_document(doc(value))
    }

    #[test]
    fn entities_decode_before_tags_are_stripped() {
        assert_eq!(sanitize_text("&lt;b&gt;hi&lt;/b&gt;"), "hi");
        assert_eq!(sanitize_text("<p>a &amp; b</p>"), "a & b");
        assert_eq!(sanitize_text("s = &quot;()&quot;"), "s = \"()\"");
        assert_eq!(sanitize_text("it&#39;s"), "it's");
    }

    #[test]
    fn doubly_escaped_markup_is_fully_removed() {
        assert_eq!(sanitize_text("&amp;lt;b&amp;gt;hi"), "hi");
    }

    #[test]
    fn lone_angle_brackets_survive() {
        assert_eq!(sanitize_text("a &lt; b &amp;&amp; c"), "a < b && c");
        assert_eq!(sanitize_text("x > 3"), "x > 3");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn sanitize_is_idempotent(input in "[a-z <>/&;#0-9qutlgmp]{0,40}") {
            let once = sanitize_text(&input);
            prop_assert_eq!(sanitize_text(&once), once);
        }

        #[test]
        fn sanitize_is_idempotent_on_arbitrary_text(input in any::<String>()) {
            let once = sanitize_text(&input);
            prop_assert_eq!(sanitize_text(&once), once);
        }
    }

    #[test]
    fn explanation_absent_stays_absent() {
        let examples = examples_from_value(
            &json!([
                { "expected_input": "&lt;x&gt;", "expected_output": "1" },
                { "expected_input": "a", "expected_output": "b", "explanation": "<i>why</i>" }
            ]),
            TextMode::Sanitize,
        )
        .expect("examples");
        assert!(examples[0].get("explanation").is_none());
        assert_eq!(examples[0]["expected_input"], json!(""));
        assert_eq!(examples[1]["explanation"], json!("why"));
    }

    #[tokio::test]
    async fn extra_example_keys_survive_raw_and_sanitize() {
        for (mode, explanation) in [
            (TextMode::Raw, "<b>why</b>"),
            (TextMode::Sanitize, "why"),
        ] {
            let store = Arc::new(MemoryStore::from_documents([doc(json!({ "questionid": 1 }))]));
            let report = Reconciler::new(store.clone())
                .with_mode(mode)
                .reconcile(&[record(json!({
                    "questionid": 1,
                    "examples": [{
                        "example_num": "1",
                        "expected_input": "a",
                        "expected_output": "b",
                        "explanation": "<b>why</b>",
                        "image": "x.png"
                    }]
                }))])
                .await;

            assert_eq!(report.updated, 1, "{mode}");
            let stored = store.find_one(1).await.expect("find").expect("present");
            assert_eq!(
                stored["examples"],
                json!([{
                    "example_num": "1",
                    "expected_input": "a",
                    "expected_output": "b",
                    "explanation": explanation,
                    "image": "x.png"
                }]),
                "{mode}"
            );
        }
    }

    #[test]
    fn null_explanation_is_kept_as_null() {
        let examples = examples_from_value(
            &json!([{ "expected_input": "a", "expected_output": "b", "explanation": null }]),
            TextMode::Sanitize,
        )
        .expect("examples");
        assert_eq!(examples[0].get("explanation"), Some(&JsonValue::Null));
    }

    #[test]
    fn wrong_shapes_are_sanitization_errors() {
        let err = examples_from_value(&json!([{ "expected_input": 3, "expected_output": "x" }]), TextMode::Sanitize)
            .expect_err("number input");
        assert_eq!(err.to_string(), "examples[0].expected_input is a number, expected text");

        let err = examples_from_value(&json!([{ "expected_input": "x" }]), TextMode::Raw)
            .expect_err("missing output");
        assert!(matches!(err, RecordError::Sanitization { .. }));

        let err = build_patch(&record(json!({ "questionid": 1, "solution": ["x"] })), TextMode::Sanitize)
            .expect_err("array solution");
        assert_eq!(err.to_string(), "solution is an array, expected text");
    }

    #[test]
    fn raw_mode_keeps_markup() {
        let patch = build_patch(
            &record(json!({ "questionid": 1, "solution": "<b>x</b> &amp;" })),
            TextMode::Raw,
        )
        .expect("patch");
        assert_eq!(patch.solution.as_deref(), Some("<b>x</b> &amp;"));
    }

    #[tokio::test]
    async fn partial_update_preserves_absent_solution() {
        let store = Arc::new(MemoryStore::from_documents([doc(json!({
            "questionid": 5,
            "examples": [],
            "solution": "S"
        }))]));
        let reconciler = Reconciler::new(store.clone());
        let report = reconciler
            .reconcile(&[record(json!({
                "questionid": 5,
                "examples": [{ "expected_input": "a", "expected_output": "b" }]
            }))])
            .await;

        assert_eq!(report.kinds(), vec![OutcomeKind::Updated]);
        let stored = store.find_one(5).await.expect("find").expect("present");
        assert_eq!(stored["solution"], json!("S"));
        assert_eq!(stored["examples"][0]["expected_output"], json!("b"));
    }

    #[tokio::test]
    async fn unknown_ids_are_skipped_not_inserted() {
        let store = Arc::new(MemoryStore::from_documents([doc(json!({ "questionid": 1 }))]));
        let report = Reconciler::new(store.clone())
            .reconcile(&[record(json!({ "questionid": 77, "solution": "x" }))])
            .await;

        assert_eq!(
            report.outcomes,
            vec![RecordOutcome::Skipped {
                questionid: Some(77),
                reason: SkipReason::NotFound
            }]
        );
        assert_eq!(store.len().await, 1);
        assert!(store.find_one(77).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn one_bad_record_does_not_stop_the_batch() {
        let store = Arc::new(MemoryStore::from_documents([
            doc(json!({ "questionid": 1, "solution": "a" })),
            doc(json!({ "questionid": 2, "solution": "b" })),
            doc(json!({ "questionid": 3, "solution": "c" })),
        ]));
        let report = Reconciler::new(store.clone())
            .reconcile(&[
                record(json!({ "questionid": 1, "solution": "one" })),
                record(json!({ "questionid": 2, "examples": "not a list" })),
                record(json!({ "questionid": 3, "solution": "three" })),
            ])
            .await;

        assert_eq!(
            report.kinds(),
            vec![OutcomeKind::Updated, OutcomeKind::Failed, OutcomeKind::Updated]
        );
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].questionid, Some(2));
        assert_eq!(
            store.find_one(3).await.expect("find").expect("present")["solution"],
            json!("three")
        );
        assert_eq!(
            store.find_one(2).await.expect("find").expect("present")["solution"],
            json!("b")
        );
    }

    #[tokio::test]
    async fn empty_and_keyless_entries_are_skipped() {
        let store = Arc::new(MemoryStore::from_documents([doc(json!({ "questionid": 1, "solution": "S" }))]));
        let report = Reconciler::new(store.clone())
            .reconcile(&[
                record(json!({ "questionid": 1, "slug": "two-sum" })),
                record(json!({ "slug": "keyless", "solution": "x" })),
            ])
            .await;
        assert_eq!(report.skipped, 2);
        assert_eq!(report.skipped_for(SkipReason::EmptyPatch), 1);
        assert_eq!(report.skipped_for(SkipReason::MissingKey), 1);
        assert_eq!(
            store.find_one(1).await.expect("find").expect("present")["solution"],
            json!("S")
        );
    }

    #[tokio::test]
    async fn rerun_reports_unchanged() {
        let store = Arc::new(MemoryStore::from_documents([doc(json!({ "questionid": 1 }))]));
        let batch = [record(json!({ "questionid": 1, "solution": "&lt;p&gt;x&lt;/p&gt;" }))];
        let reconciler = Reconciler::new(store.clone());

        let first = reconciler.reconcile(&batch).await;
        let second = reconciler.reconcile(&batch).await;
        assert_eq!(first.updated, 1);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped_for(SkipReason::Unchanged), 1);
        assert_ne!(first.run_id, second.run_id);
    }

    struct RejectingStore {
        inner: MemoryStore,
        reject: i64,
    }

    #[async_trait]
    impl QuestionStore for RejectingStore {
        fn backend(&self) -> &'static str {
            "rejecting"
        }

        async fn find_one(&self, questionid: i64) -> Result<Option<Document>, StoreError> {
            self.inner.find_one(questionid).await
        }

        async fn update_one(&self, questionid: i64, patch: &QuestionPatch) -> Result<u64, StoreError> {
            if questionid == self.reject {
                return Err(StoreError::Rejected("write conflict".into()));
            }
            self.inner.update_one(questionid, patch).await
        }
    }

    #[tokio::test]
    async fn store_rejection_is_recorded_as_failure() {
        let store = Arc::new(RejectingStore {
            inner: MemoryStore::from_documents([
                doc(json!({ "questionid": 1 })),
                doc(json!({ "questionid": 2 })),
            ]),
            reject: 1,
        });
        let report = Reconciler::new(store)
            .reconcile(&[
                record(json!({ "questionid": 1, "solution": "x" })),
                record(json!({ "questionid": 2, "solution": "y" })),
            ])
            .await;
        assert_eq!(report.kinds(), vec![OutcomeKind::Failed, OutcomeKind::Updated]);
        assert_eq!(
            report.failures[0].error,
            "update failed: store rejected update: write conflict"
        );
    }

    struct UnreadableStore;

    #[async_trait]
    impl QuestionStore for UnreadableStore {
        fn backend(&self) -> &'static str {
            "unreadable"
        }

        async fn find_one(&self, questionid: i64) -> Result<Option<Document>, StoreError> {
            Err(StoreError::NotAnObject { questionid })
        }

        async fn update_one(&self, _questionid: i64, _patch: &QuestionPatch) -> Result<u64, StoreError> {
            panic!("update_one must not run after a failed lookup");
        }
    }

    #[tokio::test]
    async fn lookup_error_is_recorded_as_failure() {
        let report = Reconciler::new(Arc::new(UnreadableStore))
            .reconcile(&[
                record(json!({ "questionid": 8, "solution": "x" })),
                record(json!({ "questionid": 9, "solution": "y" })),
            ])
            .await;
        assert_eq!(report.kinds(), vec![OutcomeKind::Failed, OutcomeKind::Failed]);
        assert_eq!(report.failures[0].questionid, Some(8));
        assert!(report.failures[0].error.starts_with("lookup failed: "));
    }

    /// Finds every document but matches none on write, as when a row is
    /// deleted between the lookup and the update.
    struct VanishingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl QuestionStore for VanishingStore {
        fn backend(&self) -> &'static str {
            "vanishing"
        }

        async fn find_one(&self, questionid: i64) -> Result<Option<Document>, StoreError> {
            self.inner.find_one(questionid).await
        }

        async fn update_one(&self, _questionid: i64, _patch: &QuestionPatch) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn write_matching_nothing_is_skipped_as_not_found() {
        let store = Arc::new(VanishingStore {
            inner: MemoryStore::from_documents([doc(json!({ "questionid": 4, "solution": "old" }))]),
        });
        let report = Reconciler::new(store.clone())
            .reconcile(&[record(json!({ "questionid": 4, "solution": "new" }))])
            .await;
        assert_eq!(
            report.outcomes,
            vec![RecordOutcome::Skipped {
                questionid: Some(4),
                reason: SkipReason::NotFound
            }]
        );
        assert_eq!(report.failed, 0);
        assert_eq!(
            store.find_one(4).await.expect("find").expect("present")["solution"],
            json!("old")
        );
    }

    #[tokio::test]
    async fn reports_are_written_per_run() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::from_documents([doc(json!({ "questionid": 1 }))]));
        let report = Reconciler::new(store)
            .reconcile(&[record(json!({ "questionid": 1, "solution": [1] }))])
            .await;

        let out = write_reports(dir.path(), &report).await.expect("reports");
        assert!(out.ends_with(report.run_id.to_string()));
        let json: JsonValue = serde_json::from_str(
            &std::fs::read_to_string(out.join("reconciliation.json")).expect("read"),
        )
        .expect("json");
        assert_eq!(json["failed"], json!(1));
        assert_eq!(json["outcomes"][0]["outcome"], json!("failed"));
        let summary = std::fs::read_to_string(out.join("summary.md")).expect("summary");
        assert!(summary.contains("## Failures"));
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("JSON".parse::<StoreBackend>().expect("json"), StoreBackend::Json);
        assert_eq!("pg".parse::<StoreBackend>().expect("pg"), StoreBackend::Postgres);
        assert!("mongo".parse::<StoreBackend>().is_err());
    }
}
