//! Batch document adapters: loading and writing question batches, attaching
//! solution files by slug, and pulling examples out of problem HTML.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use qbank_core::{json_kind, Example, Record, CONTENT_FIELD};
use qbank_storage::{write_atomically, StoreError};
use regex::Regex;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "qbank-adapters";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("{} does not exist", .path.display())]
    NotFound { path: PathBuf },
    #[error("malformed batch document {}: {message}", .path.display())]
    Format { path: PathBuf, message: String },
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid slug pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Write(#[from] StoreError),
}

fn io_error(action: &'static str, path: &Path, source: std::io::Error) -> BatchError {
    if source.kind() == ErrorKind::NotFound {
        BatchError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        BatchError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Load a batch document: a JSON array of question objects, in file order.
pub fn load_batch(path: impl AsRef<Path>) -> Result<Vec<Record>, BatchError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|err| io_error("reading", path, err))?;
    let records = parse_batch(&text).map_err(|message| BatchError::Format {
        path: path.to_path_buf(),
        message,
    })?;
    debug!(path = %path.display(), records = records.len(), "loaded batch");
    Ok(records)
}

pub fn parse_batch(text: &str) -> Result<Vec<Record>, String> {
    let value: JsonValue = serde_json::from_str(text).map_err(|err| err.to_string())?;
    let JsonValue::Array(items) = value else {
        return Err("expected a JSON array of objects".to_string());
    };
    items
        .into_iter()
        .enumerate()
        .map(|(pos, item)| match item {
            JsonValue::Object(doc) => Ok(Record::from_document(doc)),
            other => Err(format!("element {pos} is {}, not an object", json_kind(&other))),
        })
        .collect()
}

/// Write records back out as a pretty-printed JSON array.
pub async fn write_batch(path: impl AsRef<Path>, records: &[Record]) -> Result<(), BatchError> {
    let path = path.as_ref();
    let array = JsonValue::Array(
        records
            .iter()
            .map(|r| JsonValue::Object(r.to_document()))
            .collect(),
    );
    let mut bytes = serde_json::to_vec_pretty(&array).map_err(|err| BatchError::Format {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    bytes.push(b'\n');
    write_atomically(path, &bytes).await?;
    info!(path = %path.display(), records = records.len(), "wrote batch");
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolutionMatchSummary {
    pub matched: usize,
    pub unmatched: usize,
    pub missing_slug: usize,
}

/// Pattern for solution files belonging to `slug`: `<digits>-<slug>.<ext>`.
pub fn solution_file_pattern(slug: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"^\d+-{}\.\w+$", regex::escape(slug)))
}

/// Regular file names in `dir`, sorted ascending.
pub fn list_solution_files(dir: &Path) -> Result<Vec<String>, BatchError> {
    let entries = fs::read_dir(dir).map_err(|err| io_error("listing", dir, err))?;
    let mut names = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

/// Pick the solution file for `slug` among `files`.
///
/// When several files match, the lexicographically smallest name wins, so the
/// choice does not depend on directory listing order.
pub fn select_solution_file<'a>(
    slug: &str,
    files: &'a [String],
) -> Result<Option<&'a str>, BatchError> {
    let pattern = solution_file_pattern(slug)?;
    Ok(files
        .iter()
        .filter(|name| pattern.is_match(name))
        .min()
        .map(String::as_str))
}

/// Attach solution file contents to each record by slug.
///
/// Matched records get the file text as `solution`; unmatched ones get an
/// explicit `null`. Records without a slug pass through unchanged.
pub fn match_solutions(
    records: Vec<Record>,
    solutions_dir: impl AsRef<Path>,
) -> Result<(Vec<Record>, SolutionMatchSummary), BatchError> {
    let dir = solutions_dir.as_ref();
    let files = list_solution_files(dir)?;
    let mut summary = SolutionMatchSummary::default();
    let mut out = Vec::with_capacity(records.len());

    for mut record in records {
        let Some(slug) = record.slug.clone() else {
            warn!(questionid = ?record.questionid, "record has no slug; solution left as is");
            summary.missing_slug += 1;
            out.push(record);
            continue;
        };

        match select_solution_file(&slug, &files)? {
            Some(name) => {
                let path = dir.join(name);
                let content =
                    fs::read_to_string(&path).map_err(|err| io_error("reading", &path, err))?;
                debug!(%slug, file = name, "matched solution file");
                record.solution = Some(JsonValue::String(content));
                summary.matched += 1;
            }
            None => {
                debug!(%slug, "no solution file");
                record.solution = Some(JsonValue::Null);
                summary.unmatched += 1;
            }
        }
        out.push(record);
    }

    info!(
        matched = summary.matched,
        unmatched = summary.unmatched,
        missing_slug = summary.missing_slug,
        "solution matching complete"
    );
    Ok((out, summary))
}

static EXAMPLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<strong class="example">Example (\d+):</strong>.*?<strong>Input:</strong>\s*(.*?)\s*<strong>Output:</strong>\s*(.*?)\s*(?:<strong>Explanation:</strong>\s*(.*?))?</pre>"#,
    )
    .expect("example pattern is valid")
});

/// Extract `Example N:` blocks from problem-statement HTML.
///
/// Captured text keeps its markup and entities; cleaning happens later.
pub fn parse_examples(html: &str) -> Vec<Example> {
    EXAMPLE_PATTERN
        .captures_iter(html)
        .enumerate()
        .map(|(index, caps)| Example {
            example_num: u32::try_from(index + 1).ok(),
            expected_input: caps.get(2).map_or("", |m| m.as_str()).trim().to_string(),
            expected_output: caps.get(3).map_or("", |m| m.as_str()).trim().to_string(),
            explanation: caps.get(4).map(|m| m.as_str().trim().to_string()),
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExampleExtractSummary {
    pub extracted: usize,
    pub without_content: usize,
    pub examples: usize,
}

/// Fill `examples` from each record's HTML `content`.
pub fn extract_examples(records: Vec<Record>) -> (Vec<Record>, ExampleExtractSummary) {
    let mut summary = ExampleExtractSummary::default();
    let records = records
        .into_iter()
        .map(|mut record| {
            match record.source.get(CONTENT_FIELD) {
                Some(JsonValue::String(html)) => {
                    let examples = parse_examples(html);
                    summary.extracted += 1;
                    summary.examples += examples.len();
                    record.examples = Some(JsonValue::Array(
                        examples.iter().map(Example::to_value).collect(),
                    ));
                }
                Some(_) => {
                    warn!(questionid = ?record.questionid, "content is not text; skipped");
                    summary.without_content += 1;
                }
                None => summary.without_content += 1,
            }
            record
        })
        .collect();
    (records, summary)
}
