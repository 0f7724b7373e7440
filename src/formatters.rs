use std::collections::BTreeMap;
use std::str::FromStr;

use serde_json::json;

use crate::error::{Result, ScanError};
use crate::types::{Category, Issue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(ScanError::Config(format!("unknown output format '{}'", other))),
        }
    }
}

pub fn format_issues(issues: &[Issue], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(format_issues_as_text(issues)),
        OutputFormat::Json => format_issues_as_json(issues),
    }
}

/// Issue counts per category, every category present.
pub fn summarize(issues: &[Issue]) -> BTreeMap<Category, usize> {
    let mut counts: BTreeMap<Category, usize> = Category::ALL.iter().map(|c| (*c, 0)).collect();
    for issue in issues {
        *counts.entry(issue.category).or_insert(0) += 1;
    }
    counts
}

pub fn format_issues_as_text(issues: &[Issue]) -> String {
    let mut output = String::new();

    for issue in issues {
        output.push_str(&format!("{}:{}: [{}] {}\n", issue.file, issue.line, issue.category, issue.message));
        if !issue.code_line.trim().is_empty() {
            output.push_str(&format!("    {}\n", issue.code_line.trim()));
        }
    }

    if issues.is_empty() {
        output.push_str("No issues found\n");
        return output;
    }

    output.push('\n');
    for (category, count) in summarize(issues).into_iter().filter(|(_, n)| *n > 0) {
        output.push_str(&format!("{:>18}: {}\n", category.as_str(), count));
    }
    output.push_str(&format!("{} issue(s) found\n", issues.len()));
    output
}

pub fn format_issues_as_json(issues: &[Issue]) -> Result<String> {
    let summary: serde_json::Map<String, serde_json::Value> = summarize(issues)
        .into_iter()
        .map(|(category, count)| (category.as_str().to_string(), json!(count)))
        .collect();

    let result = json!({
        "issues": issues,
        "summary": summary,
        "total": issues.len()
    });

    Ok(serde_json::to_string_pretty(&result)?)
}
