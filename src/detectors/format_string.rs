use once_cell::sync::Lazy;
use regex::Regex;

use crate::ast::NodeKind;
use crate::config::Config;
use crate::error::Result;
use crate::types::{Category, Issue};
use crate::utils;

use super::{DetectionContext, Detector};

static BARE_IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_]\w*$").unwrap());

/// Statements spanning more lines than this are not followed.
const MAX_STATEMENT_LINES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Printf,
    Scanf,
}

/// Position of the format argument for each checked function.
fn format_index(name: &str) -> Option<(usize, Family)> {
    Some(match name {
        "printf" => (0, Family::Printf),
        "fprintf" | "sprintf" => (1, Family::Printf),
        "snprintf" => (2, Family::Printf),
        "scanf" => (0, Family::Scanf),
        "fscanf" | "sscanf" => (1, Family::Scanf),
        _ => return None,
    })
}

/// Contents of a string literal argument, concatenating adjacent pieces.
/// `None` when the argument is not a literal.
fn literal_contents(arg: &str) -> Option<String> {
    let arg = arg.trim();
    if !(arg.starts_with('"') || arg.starts_with("L\"") || arg.starts_with("u8\"")) {
        return None;
    }
    let mut out = String::new();
    let mut chars = arg.chars().peekable();
    let mut inside = false;
    while let Some(c) = chars.next() {
        match (inside, c) {
            (false, '"') => inside = true,
            (false, c) if c.is_whitespace() || c.is_alphanumeric() => {}
            (false, _) => return None,
            (true, '\\') => {
                out.push(c);
                if let Some(n) = chars.next() {
                    out.push(n);
                }
            }
            (true, '"') => inside = false,
            (true, c) => out.push(c),
        }
    }
    Some(out)
}

/// Number of arguments a format string consumes.
fn count_arguments(format: &str, family: Family) -> usize {
    let chars: Vec<char> = format.chars().collect();
    let mut count = 0;
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '%' {
            i += 1;
            continue;
        }
        i += 1;
        if chars.get(i) == Some(&'%') {
            i += 1;
            continue;
        }

        let mut consumes = 1;
        if family == Family::Scanf && chars.get(i) == Some(&'*') {
            consumes = 0;
            i += 1;
        }
        // flags
        while i < chars.len() && "-+ #0'".contains(chars[i]) {
            i += 1;
        }
        // width
        if family == Family::Printf && chars.get(i) == Some(&'*') {
            count += 1;
            i += 1;
        }
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        // precision
        if family == Family::Printf && chars.get(i) == Some(&'.') {
            i += 1;
            if chars.get(i) == Some(&'*') {
                count += 1;
                i += 1;
            }
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
        while i < chars.len() && "hlLjztq".contains(chars[i]) {
            i += 1;
        }

        match chars.get(i) {
            Some('[') if family == Family::Scanf => {
                i += 1;
                if chars.get(i) == Some(&'^') {
                    i += 1;
                }
                if chars.get(i) == Some(&']') {
                    i += 1;
                }
                while i < chars.len() && chars[i] != ']' {
                    i += 1;
                }
                count += consumes;
                i += 1;
            }
            Some(c) if "diouxXeEfFgGaAcspn".contains(*c) => {
                count += consumes;
                i += 1;
            }
            _ => {}
        }
    }
    count
}

/// Printf and scanf calls whose literal format disagrees with their arguments.
pub struct FormatStringDetector;

impl FormatStringDetector {
    fn check_call(&self, ctx: &DetectionContext, line: usize, name: &str, args: &[&str], issues: &mut Vec<Issue>) {
        let Some((index, family)) = format_index(name) else {
            return;
        };
        let Some(format) = args.get(index).and_then(|a| literal_contents(a)) else {
            return;
        };

        let required = count_arguments(&format, family);
        let provided = args.len() - index - 1;
        if required != provided {
            issues.push(ctx.issue(
                line,
                Category::Format,
                format!("{} format requires {} arguments but {} provided", name, required, provided),
            ));
        }

        if family == Family::Scanf {
            for arg in &args[index + 1..] {
                let arg = arg.trim();
                if !BARE_IDENTIFIER.is_match(arg) {
                    continue;
                }
                let Some(var) = ctx.symbols.variable_at(arg, line) else {
                    continue;
                };
                if !var.decl.is_pointer && !var.decl.is_array {
                    issues.push(ctx.issue(
                        line,
                        Category::Format,
                        format!("{} argument '{}' is missing '&'", name, arg),
                    ));
                }
            }
        }
    }

    fn detect_tree(&self, ctx: &DetectionContext) -> Vec<Issue> {
        let mut issues = Vec::new();
        for call in ctx.tree.calls() {
            let Some((index, _)) = format_index(call.name) else {
                continue;
            };
            let literal = call
                .arguments
                .get(index)
                .is_some_and(|a| matches!(a.kind(), NodeKind::StringLiteral | NodeKind::ConcatenatedString));
            if !literal {
                continue;
            }
            let args: Vec<&str> = call.arguments.iter().map(|a| a.text()).collect();
            self.check_call(ctx, call.position.line, call.name, &args, &mut issues);
        }
        issues
    }

    fn detect_lines(&self, ctx: &DetectionContext) -> Vec<Issue> {
        let code = &ctx.text.code;
        let masked = &ctx.text.masked;
        let mut issues = Vec::new();

        for line in 0..masked.len() {
            // Locate calls on the masked view, read arguments from the code view
            let end = statement_end(masked, line);
            let masked_text = masked[line..=end].join(" ");
            let code_text = code[line..=end].join(" ");
            let first_len = masked[line].len();

            for call in utils::find_calls(&masked_text) {
                if call.column >= first_len || format_index(&call.name).is_none() {
                    continue;
                }
                let Some(open) = masked_text[call.column..].find('(').map(|o| call.column + o) else {
                    continue;
                };
                let Some(close) = utils::find_matching(&code_text, open) else {
                    continue;
                };
                let args = utils::split_arguments(&code_text[open + 1..close]);
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                self.check_call(ctx, line, &call.name, &args, &mut issues);
            }
        }
        issues
    }
}

/// Last line of the statement starting on `line`, by parenthesis balance.
fn statement_end(masked: &[String], line: usize) -> usize {
    let mut depth = 0i32;
    let last = (line + MAX_STATEMENT_LINES - 1).min(masked.len().saturating_sub(1));
    for (i, l) in masked.iter().enumerate().take(last + 1).skip(line) {
        depth += l.matches('(').count() as i32 - l.matches(')').count() as i32;
        if depth <= 0 {
            return i;
        }
    }
    last
}

impl Detector for FormatStringDetector {
    fn name(&self) -> &'static str {
        "format_string"
    }

    fn description(&self) -> &'static str {
        "printf/scanf format strings that disagree with their arguments"
    }

    fn is_enabled(&self, config: &Config) -> bool {
        config.categories.format_strings
    }

    fn detect(&self, ctx: &DetectionContext) -> Result<Vec<Issue>> {
        Ok(if ctx.has_tree() { self.detect_tree(ctx) } else { self.detect_lines(ctx) })
    }
}
