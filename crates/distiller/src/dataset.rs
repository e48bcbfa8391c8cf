//! Question/answer dataset loading

use distillr_common::config::DataArgs;
use distillr_common::{DistillError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::info;

const QUESTION_FALLBACKS: &[&str] = &["prompt", "instruction", "question"];
const ANSWER_FALLBACKS: &[&str] = &["answer", "output", "response"];

/// One dataset row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    /// Position in the dataset file
    pub index: usize,
    pub question: String,
    /// Reference answer, if the dataset has one
    pub answer: Option<String>,
}

/// Load question/answer pairs from a `.json` array or a `.jsonl` file
pub fn load_qa_pairs(args: &DataArgs) -> Result<Vec<QaPair>> {
    let path = &args.dataset_path;
    let content = std::fs::read_to_string(path).map_err(|e| {
        DistillError::invalid_input(format!("Failed to read dataset {}: {}", path.display(), e))
    })?;

    let rows = if is_jsonl(path) {
        parse_jsonl(&content)?
    } else {
        parse_json_array(&content)?
    };

    let limit = args.max_samples.unwrap_or(usize::MAX);
    let mut pairs = Vec::with_capacity(rows.len().min(limit));

    for (index, (location, row)) in rows.into_iter().enumerate().take(limit) {
        let question = field(&row, &args.question_field, QUESTION_FALLBACKS).ok_or_else(|| {
            DistillError::invalid_input(format!(
                "{} of {} has no '{}' field",
                location,
                path.display(),
                args.question_field
            ))
        })?;
        let answer = field(&row, &args.answer_field, ANSWER_FALLBACKS);

        pairs.push(QaPair {
            index,
            question,
            answer,
        });
    }

    info!(path = %path.display(), pairs = pairs.len(), "Loaded dataset");
    Ok(pairs)
}

fn is_jsonl(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("jsonl"))
}

/// Rows tagged with a human-readable location for error messages
fn parse_jsonl(content: &str) -> Result<Vec<(String, Value)>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let location = format!("line {}", i + 1);
            let value = serde_json::from_str(line).map_err(|e| {
                DistillError::invalid_input(format!("Invalid JSON on {}: {}", location, e))
            })?;
            Ok((location, value))
        })
        .collect()
}

fn parse_json_array(content: &str) -> Result<Vec<(String, Value)>> {
    match serde_json::from_str::<Value>(content)? {
        Value::Array(rows) => Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| (format!("row {}", i), row))
            .collect()),
        _ => Err(DistillError::invalid_input(
            "JSON dataset must be an array of objects",
        )),
    }
}

/// First non-empty value among `primary` and `fallbacks`
fn field(row: &Value, primary: &str, fallbacks: &[&str]) -> Option<String> {
    std::iter::once(primary)
        .chain(fallbacks.iter().copied())
        .filter_map(|key| match row.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .next()
}
