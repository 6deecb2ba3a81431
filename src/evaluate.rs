//! Grading strategies: numerical answer, string answer, tabular
//! classification match, and external checker script.
//!
//! All four share the [`Evaluator`] contract and return a pass flag plus a
//! structured details document that lands in the task record.

use regex::Regex;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::exec::{ExecOpts, ProcessExecutor};
use crate::task::{ResultSpec, Task};
use crate::workspace::Workspace;

/// Absolute tolerance for numerical comparisons.
const NUMERIC_TOLERANCE: f64 = 1e-9;

/// Column names probed, in order, before falling back to the last column.
const TARGET_COLUMNS: [&str; 6] = ["target", "result", "Durum", "label", "class", "classification"];

/// Strategy contract: decide pass/fail for a task run.
pub trait Evaluator {
    fn evaluate(&self, task: &Task, run_output: &str, workspace: &Workspace) -> (bool, Value);
}

/// Grade a run with the evaluator matching the task's result spec.
pub fn evaluate_result(
    task: &Task,
    run_output: &str,
    workspace: &Workspace,
    executor: &ProcessExecutor,
) -> (bool, Value) {
    match &task.result {
        ResultSpec::Numerical { .. } => NumericalEvaluator.evaluate(task, run_output, workspace),
        ResultSpec::String { .. } => StringEvaluator.evaluate(task, run_output, workspace),
        ResultSpec::Classification { .. } => {
            ClassificationEvaluator.evaluate(task, run_output, workspace)
        }
        ResultSpec::Checker { .. } => CheckerEvaluator::new(executor.clone())
            .evaluate(task, run_output, workspace),
    }
}

// ---------- Numerical ----------

pub struct NumericalEvaluator;

impl Evaluator for NumericalEvaluator {
    fn evaluate(&self, task: &Task, run_output: &str, _workspace: &Workspace) -> (bool, Value) {
        let ResultSpec::Numerical { expected } = &task.result else {
            return (false, json!({"error": "numerical evaluator used on a non-numerical task"}));
        };
        let pattern = Regex::new(r"ANSWER=(\d+(?:\.\d+)?)").expect("answer regex");

        let mut details = json!({
            "expected_answer": expected,
            "extraction_successful": false,
            "extracted_answer": Value::Null,
            "comparison_result": false,
        });

        let Some(captures) = pattern.captures(run_output) else {
            warn!(task_id = %task.id, "no ANSWER= pattern found in output");
            details["error"] = json!("No answer pattern found in output");
            return (false, details);
        };
        let Ok(actual) = captures[1].parse::<f64>() else {
            details["error"] = json!(format!("could not parse extracted value '{}'", &captures[1]));
            return (false, details);
        };

        let passed = (actual - expected).abs() < NUMERIC_TOLERANCE;
        details["extraction_successful"] = json!(true);
        details["extracted_answer"] = json!(actual);
        details["comparison_result"] = json!(passed);
        if passed {
            info!(task_id = %task.id, actual, "numerical evaluation passed");
        } else {
            warn!(task_id = %task.id, actual, expected, "numerical evaluation failed");
        }
        (passed, details)
    }
}

// ---------- String ----------

pub struct StringEvaluator;

impl Evaluator for StringEvaluator {
    fn evaluate(&self, task: &Task, run_output: &str, _workspace: &Workspace) -> (bool, Value) {
        let ResultSpec::String { expected, case_sensitive } = &task.result else {
            return (false, json!({"error": "string evaluator used on a non-string task"}));
        };

        let mut details = json!({
            "expected_answer": expected,
            "extraction_successful": false,
            "extracted_answer": Value::Null,
            "comparison_result": false,
            "case_sensitive": case_sensitive,
        });

        let Some((pattern_used, extracted)) = extract_string_answer(run_output) else {
            warn!(task_id = %task.id, "no ANSWER= pattern found in output");
            details["error"] = json!("No answer pattern found in output");
            return (false, details);
        };

        let matches = if *case_sensitive {
            extracted == *expected
        } else {
            extracted.to_lowercase() == expected.to_lowercase()
        };
        details["extraction_successful"] = json!(true);
        details["extracted_answer"] = json!(extracted);
        details["pattern_used"] = json!(pattern_used);
        details["comparison_result"] = json!(matches);
        if matches {
            info!(task_id = %task.id, answer = %extracted, "string evaluation passed");
        } else {
            warn!(task_id = %task.id, answer = %extracted, expected = %expected, "string evaluation failed");
        }
        (matches, details)
    }
}

/// Quoted value first (double then single), then bare value to end of line,
/// then a last-resort bare token.
fn extract_string_answer(output: &str) -> Option<(&'static str, String)> {
    let attempts: [(&'static str, &str); 4] = [
        ("double-quoted", r#"ANSWER="([^"\r\n]+)""#),
        ("single-quoted", r"ANSWER='([^'\r\n]+)'"),
        ("bare-line", r"ANSWER=([^\r\n]+)"),
        ("bare-token", r"ANSWER=(\S+)"),
    ];
    for (name, pattern) in attempts {
        let re = Regex::new(pattern).expect("answer regex");
        if let Some(captures) = re.captures(output) {
            let value = captures[1].trim().to_string();
            if !value.is_empty() {
                return Some((name, value));
            }
        }
    }
    None
}

// ---------- Classification ----------

pub struct ClassificationEvaluator;

impl Evaluator for ClassificationEvaluator {
    fn evaluate(&self, task: &Task, _run_output: &str, workspace: &Workspace) -> (bool, Value) {
        let ResultSpec::Classification { ground_truth_file, threshold } = &task.result else {
            return (false, json!({"error": "classification evaluator used on a non-classification task"}));
        };
        let Some(task_file) = &task.inputs.file else {
            return (false, json!({"error": "task_file not specified for classification"}));
        };

        // Both files sit flat in the workspace root.
        let result_path = workspace.root.join(file_name(task_file));
        let truth_path = workspace.root.join(file_name(ground_truth_file));
        if !result_path.is_file() {
            return (false, json!({"error": format!("Result file not found: {}", result_path.display())}));
        }
        if !truth_path.is_file() {
            return (false, json!({"error": format!("Ground truth file not found: {}", truth_path.display())}));
        }

        let (result_rows, truth_rows) = match (read_table(&result_path), read_table(&truth_path)) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(err), _) | (_, Err(err)) => return (false, json!({"error": err})),
        };

        if result_rows.rows.len() != truth_rows.rows.len() {
            return (
                false,
                json!({"error": format!(
                    "Row count mismatch: result={}, ground_truth={}",
                    result_rows.rows.len(),
                    truth_rows.rows.len()
                )}),
            );
        }
        if result_rows.rows.is_empty() {
            return (false, json!({"error": "No data rows found in files"}));
        }

        let result_col = target_column(&result_rows.headers);
        let truth_col = target_column(&truth_rows.headers);

        let total = result_rows.rows.len();
        let matches = result_rows
            .rows
            .iter()
            .zip(&truth_rows.rows)
            .filter(|(result_row, truth_row)| {
                let result_value = result_row.get(result_col.1).map(|v| v.trim()).unwrap_or("");
                let truth_value = truth_row.get(truth_col.1).map(|v| v.trim()).unwrap_or("");
                result_value == truth_value
            })
            .count();

        let score = matches as f64 / total as f64;
        let passed = score >= *threshold;
        let details = json!({
            "matches": matches,
            "total": total,
            "score": score,
            "threshold": threshold,
            "result_file": result_path.display().to_string(),
            "ground_truth_file": truth_path.display().to_string(),
            "result_target_column": result_col.0,
            "truth_target_column": truth_col.0,
        });
        if passed {
            info!(task_id = %task.id, score, "classification evaluation passed");
        } else {
            warn!(task_id = %task.id, score, threshold, "classification evaluation failed");
        }
        (passed, details)
    }
}

struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Read a delimited file as header-qualified rows, trying UTF-16 (by BOM)
/// before UTF-8.
fn read_table(path: &Path) -> Result<Table, String> {
    let bytes = std::fs::read(path).map_err(|err| format!("could not read {}: {err}", path.display()))?;
    let text = decode_text(&bytes)
        .ok_or_else(|| format!("Could not read {} with UTF-16 or UTF-8 encoding", path.display()))?;

    let mut records = parse_delimited(&text);
    if records.is_empty() {
        return Ok(Table { headers: Vec::new(), rows: Vec::new() });
    }
    let headers = records.remove(0);
    Ok(Table { headers, rows: records })
}

fn decode_text(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&[0xFF, 0xFE]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16(&units).ok();
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16(&units).ok();
    }
    // Strip a UTF-8 BOM if present.
    let body = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF][..]).unwrap_or(bytes);
    String::from_utf8(body.to_vec()).ok()
}

/// Minimal CSV parsing: comma-separated, double-quote quoting with `""`
/// escapes. Blank trailing lines are dropped.
fn parse_delimited(text: &str) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else {
            match c {
                '"' if field.is_empty() => in_quotes = true,
                ',' => row.push(std::mem::take(&mut field)),
                '\r' => {}
                '\n' => {
                    row.push(std::mem::take(&mut field));
                    if row.iter().any(|f| !f.is_empty()) {
                        rows.push(std::mem::take(&mut row));
                    } else {
                        row.clear();
                    }
                }
                _ => field.push(c),
            }
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        if row.iter().any(|f| !f.is_empty()) {
            rows.push(row);
        }
    }
    rows
}

/// `(name, index)` of the grading column.
fn target_column(headers: &[String]) -> (String, usize) {
    for candidate in TARGET_COLUMNS {
        if let Some(index) = headers.iter().position(|h| h == candidate) {
            return (candidate.to_string(), index);
        }
    }
    let index = headers.len().saturating_sub(1);
    let name = headers.last().cloned().unwrap_or_default();
    (name, index)
}

fn file_name(path: &str) -> String {
    Path::new(path.trim_matches('/'))
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

// ---------- Checker ----------

pub struct CheckerEvaluator {
    executor: ProcessExecutor,
}

impl CheckerEvaluator {
    pub fn new(executor: ProcessExecutor) -> Self {
        CheckerEvaluator { executor }
    }
}

impl Evaluator for CheckerEvaluator {
    fn evaluate(&self, task: &Task, _run_output: &str, workspace: &Workspace) -> (bool, Value) {
        let ResultSpec::Checker { checker_script } = &task.result else {
            return (false, json!({"error": "checker evaluator used on a non-checker task"}));
        };

        let script_path = workspace.root.join(file_name(checker_script));
        if !script_path.is_file() {
            return (false, json!({"error": format!("Checker script not found: {}", script_path.display())}));
        }
        let python = workspace.python_path();
        if !python.is_file() {
            return (false, json!({"error": format!("Python interpreter not found: {}", python.display())}));
        }

        info!(task_id = %task.id, script = %script_path.display(), "running checker script");
        let result = self.executor.execute(
            ExecOpts::new(
                vec![python.display().to_string(), script_path.display().to_string()],
                Duration::from_secs(task.script_timeout_seconds),
                "checker",
            )
            .cwd(&workspace.root),
        );

        if let Some(err) = &result.error {
            return (false, json!({"error": format!("Checker script failed to run: {err}")}));
        }
        if result.timed_out {
            return (
                false,
                json!({"error": format!("Checker script timed out after {}s", task.script_timeout_seconds)}),
            );
        }

        let stdout = result.stdout.trim().to_string();
        let passed = stdout == "TRUE";
        let details = json!({
            "checker_script": script_path.display().to_string(),
            "return_code": result.exit_code,
            "stdout": stdout,
            "stderr": result.stderr.trim(),
            "success_condition": "stdout == 'TRUE'",
            "condition_met": passed,
        });
        if passed {
            info!(task_id = %task.id, "checker evaluation passed");
        } else {
            warn!(task_id = %task.id, stdout = %details["stdout"], "checker evaluation failed");
        }
        (passed, details)
    }
}

// ---------- Unit tests ----------
