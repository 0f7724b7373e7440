use once_cell::sync::Lazy;
use regex::Regex;

use crate::ast::NodeKind;
use crate::config::Config;
use crate::error::Result;
use crate::types::{AssignmentKind, Category, Issue};
use crate::utils;

use super::{DetectionContext, Detector};

static PLAIN_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[A-Za-z_]\w*\s*=\s*([^=].*)$").unwrap());

/// Integer type limits under LP64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange {
    pub name: &'static str,
    pub min: i128,
    pub max: i128,
}

impl IntRange {
    /// Limits for a declared type such as `unsigned long int`, `None` for
    /// anything that is not a plain integer type.
    pub fn of(declared_type: &str) -> Option<IntRange> {
        let words: Vec<&str> = declared_type
            .split_whitespace()
            .filter(|w| !["const", "volatile", "static", "register", "extern", "auto"].contains(w))
            .collect();
        if words.is_empty() || words.iter().any(|w| !["unsigned", "signed", "char", "short", "int", "long"].contains(w)) {
            return None;
        }
        let unsigned = words.contains(&"unsigned");
        let explicit_signed = words.contains(&"signed");
        let longs = words.iter().filter(|w| **w == "long").count();

        let (name, bits) = if words.contains(&"char") {
            match (unsigned, explicit_signed) {
                (true, _) => ("unsigned char", 8),
                (false, true) => ("signed char", 8),
                (false, false) => ("char", 8),
            }
        } else if words.contains(&"short") {
            (if unsigned { "unsigned short" } else { "short" }, 16)
        } else if longs >= 2 {
            (if unsigned { "unsigned long long" } else { "long long" }, 64)
        } else if longs == 1 {
            (if unsigned { "unsigned long" } else { "long" }, 64)
        } else {
            (if unsigned { "unsigned int" } else { "int" }, 32)
        };

        Some(if unsigned {
            IntRange { name, min: 0, max: (1i128 << bits) - 1 }
        } else {
            IntRange { name, min: -(1i128 << (bits - 1)), max: (1i128 << (bits - 1)) - 1 }
        })
    }

    pub fn contains(&self, value: i128) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Integer literals stored into variables that cannot represent them.
pub struct NumericRangeDetector;

impl NumericRangeDetector {
    fn check(
        &self,
        ctx: &DetectionContext,
        line: usize,
        name: &str,
        declared_type: &str,
        literal: &str,
    ) -> Option<Issue> {
        let literal = literal.trim();
        // Explicit casts and character literals are deliberate
        if literal.starts_with('(') && utils::strip_casts(literal) != literal || literal.starts_with('\'') {
            return None;
        }
        let range = IntRange::of(declared_type)?;
        let shown = match utils::parse_int_literal(literal) {
            Some(value) if range.contains(value) => return None,
            Some(value) if literal.trim_end_matches(['u', 'U', 'l', 'L']) != value.to_string() => {
                format!("{} ({})", literal, value)
            }
            Some(_) => literal.to_string(),
            None if utils::is_oversized_int_literal(literal) => literal.to_string(),
            None => return None,
        };
        Some(ctx.issue(
            line,
            Category::RangeOverflow,
            format!(
                "Value {} does not fit {} '{}', range is ({}, {})",
                shown, range.name, name, range.min, range.max
            ),
        ))
    }

    fn detect_tree(&self, ctx: &DetectionContext) -> Vec<Issue> {
        let mut issues = Vec::new();
        for decl in ctx.tree.declarations() {
            if decl.is_pointer || decl.is_array {
                continue;
            }
            if let Some(init) = decl.initializer {
                let line = decl.position.line;
                issues.extend(self.check(ctx, line, decl.name, &decl.declared_type, init.text()));
            }
        }

        for node in ctx.tree.find_all(&NodeKind::AssignmentExpression) {
            let (Some(left), Some(right)) = (node.child_by_field("left"), node.child_by_field("right")) else {
                continue;
            };
            if left.kind() != &NodeKind::Identifier {
                continue;
            }
            let operator = node.text().get(left.text().len()..).unwrap_or("").trim_start();
            if !operator.starts_with('=') {
                continue;
            }
            let line = node.start().line;
            let Some(var) = ctx.symbols.variable_at(left.text(), line) else {
                continue;
            };
            if var.decl.is_pointer || var.decl.is_array {
                continue;
            }
            issues.extend(self.check(ctx, line, var.name(), &var.decl.declared_type, right.text()));
        }
        issues
    }

    fn detect_lines(&self, ctx: &DetectionContext) -> Vec<Issue> {
        let mut issues = Vec::new();
        for var in &ctx.symbols.variables {
            if var.decl.is_pointer || var.decl.is_array {
                continue;
            }
            for change in &var.value_history {
                let literal = match change.kind {
                    AssignmentKind::Initializer => Some(change.source_text.as_str()),
                    AssignmentKind::Assignment => PLAIN_ASSIGNMENT
                        .captures(&change.source_text)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str()),
                    _ => None,
                };
                if let Some(literal) = literal {
                    issues.extend(self.check(ctx, change.line, var.name(), &var.decl.declared_type, literal));
                }
            }
        }
        issues
    }
}

impl Detector for NumericRangeDetector {
    fn name(&self) -> &'static str {
        "numeric_range"
    }

    fn description(&self) -> &'static str {
        "Integer literals outside the range of the variable's type"
    }

    fn is_enabled(&self, config: &Config) -> bool {
        config.categories.numeric_range
    }

    fn detect(&self, ctx: &DetectionContext) -> Result<Vec<Issue>> {
        Ok(if ctx.has_tree() { self.detect_tree(ctx) } else { self.detect_lines(ctx) })
    }
}
