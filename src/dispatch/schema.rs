//! Declared shapes for agent YAML output, plus the coercion helpers used
//! at the agent boundary.
//!
//! This is the only place in the pipeline where forgiving parsing is
//! acceptable: `failure` is an alias for `failed`, numeric fields accept
//! quoted digits, and an accidental one-entry mapping like `{AC7: "text"}`
//! collapses to the string `"AC7: text"`. Nothing outside this module
//! extends that tolerance.

use serde_yaml::Value;

/// Expected kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    Seq,
    Map,
    /// A closed string set; validation applies [`normalize_result`]-style
    /// aliases before matching.
    Enum(&'static [&'static str]),
}

/// One field of a declared schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// A named schema an agent reply must satisfy.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl OutputSchema {
    /// Validate a parsed YAML document against this schema. Returns the
    /// first violation as a message; `Ok(())` means every required field
    /// is present and every present field has an acceptable kind.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let map = value
            .as_mapping()
            .ok_or_else(|| format!("{}: output is not a mapping", self.name))?;

        for field in &self.fields {
            let entry = map.get(Value::from(field.name));
            match entry {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(format!("{}: missing required field '{}'", self.name, field.name));
                    }
                }
                Some(v) => {
                    if !kind_matches(field.kind, v) {
                        return Err(format!(
                            "{}: field '{}' has unexpected shape",
                            self.name, field.name
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn kind_matches(kind: FieldKind, value: &Value) -> bool {
    match kind {
        FieldKind::Str => as_string(value).is_some(),
        FieldKind::Int => as_u64(value).is_some(),
        FieldKind::Seq => value.is_sequence(),
        FieldKind::Map => value.is_mapping(),
        FieldKind::Enum(options) => match as_string(value) {
            Some(s) => {
                let normalized = normalize_result(&s);
                options.iter().any(|o| *o == normalized)
            }
            None => false,
        },
    }
}

// ── Schemas ───────────────────────────────────────────────────────────

pub fn create_story_schema() -> OutputSchema {
    OutputSchema {
        name: "create-story",
        fields: vec![
            FieldSpec::required("result", FieldKind::Enum(&["success", "failed"])),
            FieldSpec::optional("story_file", FieldKind::Str),
            FieldSpec::optional("story_key", FieldKind::Str),
            FieldSpec::optional("story_title", FieldKind::Str),
            FieldSpec::optional("error", FieldKind::Str),
        ],
    }
}

pub fn dev_story_schema() -> OutputSchema {
    OutputSchema {
        name: "dev-story",
        fields: vec![
            FieldSpec::required("result", FieldKind::Enum(&["success", "failed"])),
            FieldSpec::optional("ac_met", FieldKind::Seq),
            FieldSpec::optional("ac_failures", FieldKind::Seq),
            FieldSpec::optional("files_modified", FieldKind::Seq),
            FieldSpec::required("tests", FieldKind::Enum(&["pass", "fail"])),
            FieldSpec::optional("notes", FieldKind::Str),
        ],
    }
}

pub fn code_review_schema() -> OutputSchema {
    OutputSchema {
        name: "code-review",
        fields: vec![
            FieldSpec::required(
                "verdict",
                FieldKind::Enum(&["SHIP_IT", "NEEDS_MINOR_FIXES", "NEEDS_MAJOR_REWORK"]),
            ),
            FieldSpec::optional("issues", FieldKind::Int),
            FieldSpec::required("issue_list", FieldKind::Seq),
            FieldSpec::optional("notes", FieldKind::Str),
        ],
    }
}

// Phase schemas share the same machinery.

pub fn analysis_schema() -> OutputSchema {
    OutputSchema {
        name: "analysis",
        fields: vec![
            FieldSpec::required("problem_statement", FieldKind::Str),
            FieldSpec::required("target_users", FieldKind::Str),
            FieldSpec::required("core_features", FieldKind::Seq),
            FieldSpec::required("success_metrics", FieldKind::Seq),
            FieldSpec::required("constraints", FieldKind::Seq),
        ],
    }
}

pub fn planning_schema() -> OutputSchema {
    OutputSchema {
        name: "planning",
        fields: vec![
            FieldSpec::required("functional_requirements", FieldKind::Seq),
            FieldSpec::required("non_functional_requirements", FieldKind::Seq),
            FieldSpec::required("user_stories", FieldKind::Seq),
            FieldSpec::required("tech_stack", FieldKind::Map),
            FieldSpec::required("domain_model", FieldKind::Map),
            FieldSpec::optional("out_of_scope", FieldKind::Seq),
        ],
    }
}

pub fn architecture_schema() -> OutputSchema {
    OutputSchema {
        name: "architecture",
        fields: vec![FieldSpec::required("architecture_decisions", FieldKind::Seq)],
    }
}

pub fn stories_schema() -> OutputSchema {
    OutputSchema {
        name: "stories",
        fields: vec![
            FieldSpec::required("epics", FieldKind::Seq),
            FieldSpec::required("stories", FieldKind::Seq),
        ],
    }
}

// ── Coercions ─────────────────────────────────────────────────────────

/// Map the `failure` alias onto `failed`; everything else passes through.
pub fn normalize_result(s: &str) -> String {
    if s.eq_ignore_ascii_case("failure") {
        "failed".to_string()
    } else {
        s.to_string()
    }
}

/// Scalar → string. Numbers and bools stringify; sequences and mappings
/// do not.
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Number → u64, accepting quoted digits (`line: "42"`).
pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Sequence of strings, coercing each entry. A one-entry mapping such as
/// `{AC7: "login still broken"}` becomes `"AC7: login still broken"`.
pub fn as_string_seq(value: &Value) -> Vec<String> {
    let Some(seq) = value.as_sequence() else {
        return Vec::new();
    };
    seq.iter().filter_map(coerce_entry_to_string).collect()
}

fn coerce_entry_to_string(value: &Value) -> Option<String> {
    if let Some(s) = as_string(value) {
        return Some(s);
    }
    if let Some(map) = value.as_mapping() {
        if map.len() == 1 {
            let (k, v) = map.iter().next()?;
            let key = as_string(k)?;
            let val = as_string(v)?;
            return Some(format!("{key}: {val}"));
        }
    }
    None
}

/// Fetch a field from a YAML mapping.
pub fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    value.as_mapping()?.get(Value::from(name))
}

/// Fetch a field as a coerced string.
pub fn str_field(value: &Value, name: &str) -> Option<String> {
    field(value, name).and_then(as_string)
}

/// Fetch a field as a coerced string sequence.
pub fn seq_field(value: &Value, name: &str) -> Vec<String> {
    field(value, name).map(as_string_seq).unwrap_or_default()
}
