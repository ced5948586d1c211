//! Core question-bank domain model shared by the maintenance tools.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "qbank-core";

pub const KEY_FIELD: &str = "questionid";
pub const SLUG_FIELD: &str = "slug";
pub const EXAMPLES_FIELD: &str = "examples";
pub const SOLUTION_FIELD: &str = "solution";
pub const CONTENT_FIELD: &str = "content";

/// A schemaless document as held by the persisted store.
pub type Document = Map<String, JsonValue>;

/// One worked example attached to a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_num: Option<u32>,
    pub expected_input: String,
    pub expected_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl Example {
    pub fn new(expected_input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            example_num: None,
            expected_input: expected_input.into(),
            expected_output: expected_output.into(),
            explanation: None,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn to_document(&self) -> Document {
        let mut out = Document::new();
        if let Some(num) = self.example_num {
            out.insert("example_num".into(), JsonValue::from(num));
        }
        out.insert(
            "expected_input".into(),
            JsonValue::String(self.expected_input.clone()),
        );
        out.insert(
            "expected_output".into(),
            JsonValue::String(self.expected_output.clone()),
        );
        if let Some(explanation) = &self.explanation {
            out.insert(
                "explanation".into(),
                JsonValue::String(explanation.clone()),
            );
        }
        out
    }

    pub fn to_value(&self) -> JsonValue {
        JsonValue::Object(self.to_document())
    }
}

/// Short description of a JSON value's type for shape errors.
pub fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Read-only snapshot of one question as it appears in a batch document.
///
/// `examples` and `solution` are kept as raw JSON so shape problems surface
/// per record during reconciliation rather than failing the whole batch.
/// The whole source object is kept in `source`; `to_document` overlays the
/// interpreted fields onto it, so unknown keys and key order survive a
/// rewrite.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub questionid: Option<i64>,
    pub slug: Option<String>,
    pub examples: Option<JsonValue>,
    pub solution: Option<JsonValue>,
    pub source: Document,
}

impl Record {
    pub fn from_document(doc: Document) -> Self {
        let questionid = doc.get(KEY_FIELD).and_then(JsonValue::as_i64);
        let slug = doc
            .get(SLUG_FIELD)
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let examples = doc.get(EXAMPLES_FIELD).filter(|v| !v.is_null()).cloned();
        let solution = doc.get(SOLUTION_FIELD).filter(|v| !v.is_null()).cloned();
        Self {
            questionid,
            slug,
            examples,
            solution,
            source: doc,
        }
    }

    /// The source object with every set field written over it.
    ///
    /// Existing keys keep their position; fields the source lacked are
    /// appended. A field left as `None` keeps whatever the source held.
    pub fn to_document(&self) -> Document {
        let mut doc = self.source.clone();
        if let Some(id) = self.questionid {
            doc.insert(KEY_FIELD.into(), JsonValue::from(id));
        }
        if let Some(slug) = &self.slug {
            doc.insert(SLUG_FIELD.into(), JsonValue::String(slug.clone()));
        }
        if let Some(examples) = &self.examples {
            doc.insert(EXAMPLES_FIELD.into(), examples.clone());
        }
        if let Some(solution) = &self.solution {
            doc.insert(SOLUTION_FIELD.into(), solution.clone());
        }
        doc
    }

    /// Solution text as present in the batch; JSON `null` counts as absent.
    pub fn has_solution(&self) -> bool {
        matches!(&self.solution, Some(v) if !v.is_null())
    }

    pub fn has_examples(&self) -> bool {
        matches!(&self.examples, Some(v) if !v.is_null())
    }
}

/// Partial update for one persisted question. Only present fields are set.
///
/// Examples are whole example objects, so keys the tools do not interpret
/// (`example_num`, images, ...) are written back as they came in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuestionPatch {
    pub examples: Option<Vec<Document>>,
    pub solution: Option<String>,
}

impl QuestionPatch {
    pub fn is_empty(&self) -> bool {
        self.examples.is_none() && self.solution.is_none()
    }

    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.examples.is_some() {
            names.push(EXAMPLES_FIELD);
        }
        if self.solution.is_some() {
            names.push(SOLUTION_FIELD);
        }
        names
    }

    /// The `$set`-style field map for this patch.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(examples) = &self.examples {
            doc.insert(
                EXAMPLES_FIELD.into(),
                JsonValue::Array(examples.iter().cloned().map(JsonValue::Object).collect()),
            );
        }
        if let Some(solution) = &self.solution {
            doc.insert(SOLUTION_FIELD.into(), JsonValue::String(solution.clone()));
        }
        doc
    }

    /// True when every field this patch sets already holds the same value in `doc`.
    pub fn is_applied_to(&self, doc: &Document) -> bool {
        self.to_document()
            .iter()
            .all(|(key, value)| doc.get(key) == Some(value))
    }

    /// Merge the patch into `doc`, leaving untouched keys as they are.
    pub fn apply_to(&self, doc: &mut Document) {
        for (key, value) in self.to_document() {
            doc.insert(key, value);
        }
    }
}
