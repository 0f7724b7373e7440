use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::error::Result;
use crate::types::{Category, Issue, Position};
use crate::utils::{self, find_block, find_matching};

use super::{DetectionContext, Detector};

const MAX_ITERATIONS: usize = 100_000;
const DIVERGENCE: i128 = 10_000_000_000;
const LOOKAHEAD_LINES: usize = 3;

static EXIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:break|return|goto)\b|\b(?:exit|abort|_Exit|longjmp)\s*\(").unwrap());
static FOR_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bfor\s*\(").unwrap());
static WHILE_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bwhile\s*\(").unwrap());
static DO_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bdo\b").unwrap());
static CONDITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\(?\s*([A-Za-z_]\w*)\s*(<=|>=|==|!=|<|>)\s*(.+?)\s*\)?\s*$").unwrap());
static FOR_INIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*((?:[A-Za-z_]\w*\s+)*?)([A-Za-z_]\w*)\s*=\s*([^,]+?)\s*$").unwrap());
static INCREMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:([A-Za-z_]\w*)\s*(\+\+|--)|(\+\+|--)\s*([A-Za-z_]\w*))\s*$").unwrap());
static COMPOUND: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*([A-Za-z_]\w*)\s*([+\-*/])=\s*(.+?)\s*$").unwrap());
static REASSIGN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z_]\w*)\s*=\s*([A-Za-z_]\w*)\s*([+\-*/])\s*(.+?)\s*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    For,
    While,
    DoWhile,
}

#[derive(Debug, Clone)]
struct LoopShape {
    kind: LoopKind,
    line: usize,
    /// Text between the header parentheses.
    header: String,
    body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Cmp {
    fn parse(op: &str) -> Option<Cmp> {
        Some(match op {
            "<" => Cmp::Lt,
            "<=" => Cmp::Le,
            ">" => Cmp::Gt,
            ">=" => Cmp::Ge,
            "==" => Cmp::Eq,
            "!=" => Cmp::Ne,
            _ => return None,
        })
    }

    fn holds(&self, v: i128, bound: i128) -> bool {
        match self {
            Cmp::Lt => v < bound,
            Cmp::Le => v <= bound,
            Cmp::Gt => v > bound,
            Cmp::Ge => v >= bound,
            Cmp::Eq => v == bound,
            Cmp::Ne => v != bound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Add(i128),
    Mul(i128),
    Div(i128),
}

/// Whether a counter starting at `init` leaves the loop within the ceiling.
fn terminates(init: i128, cmp: Cmp, bound: i128, step: Step) -> bool {
    if let Step::Add(k) = step {
        let toward = match cmp {
            Cmp::Lt | Cmp::Le => k > 0,
            Cmp::Gt | Cmp::Ge => k < 0,
            Cmp::Eq => k != 0,
            Cmp::Ne => k != 0 && (bound - init) % k == 0 && (bound - init) / k >= 0,
        };
        if toward {
            return true;
        }
    }

    let limit = DIVERGENCE.max(bound.saturating_abs().saturating_mul(2));
    let mut v = init;
    for _ in 0..MAX_ITERATIONS {
        if !cmp.holds(v, bound) {
            return true;
        }
        let next = match step {
            Step::Add(k) => v.checked_add(k),
            Step::Mul(k) => v.checked_mul(k),
            Step::Div(0) => None,
            Step::Div(k) => v.checked_div(k),
        };
        match next {
            Some(n) if n.saturating_abs() <= limit => v = n,
            _ => return false,
        }
    }
    false
}

fn parse_step(var: &str, update: &str) -> Option<Step> {
    if let Some(cap) = INCREMENT.captures(update) {
        let (name, op) = match (cap.get(1), cap.get(2)) {
            (Some(n), Some(op)) => (n.as_str(), op.as_str()),
            _ => (cap.get(4)?.as_str(), cap.get(3)?.as_str()),
        };
        if name != var {
            return None;
        }
        return Some(if op == "++" { Step::Add(1) } else { Step::Add(-1) });
    }
    let (name, op, amount) = if let Some(cap) = COMPOUND.captures(update) {
        (cap.get(1)?.as_str(), cap.get(2)?.as_str(), cap.get(3)?.as_str())
    } else {
        let cap = REASSIGN.captures(update)?;
        if cap.get(1)?.as_str() != cap.get(2)?.as_str() {
            return None;
        }
        (cap.get(1)?.as_str(), cap.get(3)?.as_str(), cap.get(4)?.as_str())
    };
    if name != var {
        return None;
    }
    let k = utils::parse_int_literal(amount)?;
    Some(match op {
        "+" => Step::Add(k),
        "-" => Step::Add(-k),
        "*" => Step::Mul(k),
        _ => Step::Div(k),
    })
}

fn writes_variable(body: &str, var: &str) -> bool {
    let v = regex::escape(var);
    Regex::new(&format!(
        r"\b{v}\s*(?:[+\-*/%&|^]|<<|>>)?=[^=]|\b{v}\s*(?:\+\+|--)|(?:\+\+|--)\s*{v}\b|&\s*{v}\b"
    ))
    .map(|re| re.is_match(body))
    .unwrap_or(true)
}

fn is_constant_true(cond: &str) -> bool {
    let c = cond.trim();
    c == "true" || utils::parse_int_literal(c).is_some_and(|v| v != 0)
}

/// Text of `lines` between two positions, end exclusive.
fn span_text(lines: &[String], start: Position, end: Position) -> String {
    let mut text = String::new();
    for line in start.line..=end.line.min(lines.len().saturating_sub(1)) {
        let l = &lines[line];
        let from = if line == start.line { start.column.min(l.len()) } else { 0 };
        let to = if line == end.line { end.column.min(l.len()) } else { l.len() };
        if line > start.line {
            text.push('\n');
        }
        text.push_str(l.get(from..to.max(from)).unwrap_or(""));
    }
    text
}

pub struct DeadLoopDetector;

impl DeadLoopDetector {
    fn analyze(&self, ctx: &DetectionContext, shape: &LoopShape) -> Option<String> {
        let exits = EXIT.is_match(&shape.body);

        let infinite = match shape.kind {
            LoopKind::For => {
                let parts: Vec<&str> = shape.header.splitn(3, ';').collect();
                parts.len() == 3 && (parts[1].trim().is_empty() || is_constant_true(parts[1]))
            }
            LoopKind::While | LoopKind::DoWhile => is_constant_true(&shape.header),
        };
        if infinite {
            return (!exits).then(|| {
                let form = match shape.kind {
                    LoopKind::For => "for (;;)".to_string(),
                    LoopKind::While => format!("while ({})", shape.header.trim()),
                    LoopKind::DoWhile => format!("do {{ }} while ({})", shape.header.trim()),
                };
                format!("Infinite loop: {} has no break, return, exit or goto", form)
            });
        }
        if exits {
            return None;
        }

        match shape.kind {
            LoopKind::For => self.bounded_for(ctx, shape),
            LoopKind::While | LoopKind::DoWhile => self.bounded_while(ctx, shape),
        }
    }

    fn bounded_for(&self, ctx: &DetectionContext, shape: &LoopShape) -> Option<String> {
        let parts: Vec<&str> = shape.header.splitn(3, ';').collect();
        let [init, cond, update] = parts.as_slice() else {
            return None;
        };
        let init_cap = FOR_INIT.captures(init)?;
        let var = init_cap.get(2)?.as_str();
        let start = utils::parse_int_literal(init_cap.get(3)?.as_str())?;
        let cond_cap = CONDITION.captures(cond)?;
        if cond_cap.get(1)?.as_str() != var {
            return None;
        }
        let cmp = Cmp::parse(cond_cap.get(2)?.as_str())?;
        let bound = utils::parse_int_literal(cond_cap.get(3)?.as_str())?;
        if writes_variable(&shape.body, var) {
            return None;
        }

        let Some(step) = parse_step(var, update) else {
            if update.trim().is_empty() || !writes_variable(update, var) {
                return cmp.holds(start, bound).then(|| {
                    format!("Dead loop: loop variable '{}' is never updated", var)
                });
            }
            return None;
        };

        let unsigned = init_cap.get(1).is_some_and(|t| t.as_str().contains("unsigned"))
            || ctx
                .symbols
                .variable_at(var, shape.line)
                .is_some_and(|v| v.decl.declared_type.contains("unsigned"));
        if unsigned && cmp == Cmp::Ge && bound <= 0 && matches!(step, Step::Add(k) if k < 0) {
            return Some(format!("Dead loop: unsigned '{}' is always >= {}", var, bound));
        }

        (!terminates(start, cmp, bound, step))
            .then(|| format!("Dead loop: '{}' never reaches the exit condition '{}'", var, cond.trim()))
    }

    fn bounded_while(&self, ctx: &DetectionContext, shape: &LoopShape) -> Option<String> {
        let cap = CONDITION.captures(&shape.header)?;
        let var = cap.get(1)?.as_str();
        let cmp = Cmp::parse(cap.get(2)?.as_str())?;
        let bound = utils::parse_int_literal(cap.get(3)?.as_str())?;
        let start = Self::last_literal_assignment(ctx, var, shape.line);

        let updates: Vec<&str> = shape
            .body
            .split(|c| c == ';' || c == '\n' || c == '{' || c == '}')
            .filter(|stmt| writes_variable(stmt, var))
            .collect();

        if updates.is_empty() {
            // A do-while body runs once even if the condition starts false
            let enters = start.is_none_or(|s| cmp.holds(s, bound));
            return enters.then(|| format!("Dead loop: '{}' is never updated inside the loop", var));
        }
        if let ([update], Some(start)) = (updates.as_slice(), start) {
            let step = parse_step(var, update)?;
            if !terminates(start, cmp, bound, step) {
                return Some(format!(
                    "Dead loop: '{}' never reaches the exit condition '{}'",
                    var,
                    shape.header.trim()
                ));
            }
        }
        None
    }

    /// Literal most recently assigned to `var` above `line` in the same function.
    fn last_literal_assignment(ctx: &DetectionContext, var: &str, line: usize) -> Option<i128> {
        let re = Regex::new(&format!(r"\b{}\s*=\s*([^;,=][^;,]*)[;,]", regex::escape(var))).ok()?;
        let floor = ctx.symbols.frame_at(line).map(|f| f.start_line).unwrap_or(0);
        (floor..line)
            .rev()
            .find_map(|l| re.captures_iter(&ctx.text.masked[l]).last())
            .and_then(|cap| utils::parse_int_literal(cap.get(1)?.as_str()))
    }

    fn tree_loops(&self, ctx: &DetectionContext) -> Vec<LoopShape> {
        let masked = &ctx.text.masked;
        let mut shapes = Vec::new();
        ctx.tree.root().walk(|node| {
            let kind = match node.kind() {
                crate::ast::NodeKind::ForStatement => LoopKind::For,
                crate::ast::NodeKind::WhileStatement => LoopKind::While,
                crate::ast::NodeKind::DoStatement => LoopKind::DoWhile,
                _ => return,
            };
            let span = node.span();
            let text = span_text(masked, span.start, span.end);
            let body = node
                .child_by_field("body")
                .map(|b| span_text(masked, b.span().start, b.span().end))
                .unwrap_or_default();
            let header_from = match kind {
                LoopKind::DoWhile => text.rfind("while").unwrap_or(text.len()),
                _ => 0,
            };
            let header = text[header_from..]
                .find('(')
                .map(|i| header_from + i)
                .and_then(|open| find_matching(&text, open).map(|close| text[open + 1..close].to_string()));
            if let Some(header) = header {
                shapes.push(LoopShape { kind, line: span.start.line, header, body });
            }
        });
        shapes
    }

    fn line_loops(&self, ctx: &DetectionContext) -> Vec<LoopShape> {
        let masked = &ctx.text.masked;
        let mut shapes = Vec::new();
        let mut do_tails: HashSet<usize> = HashSet::new();

        for (i, line) in masked.iter().enumerate() {
            for m in DO_KEYWORD.find_iter(line) {
                if let Some((tail_line, header, body)) = Self::do_loop(masked, i, m.end()) {
                    do_tails.insert(tail_line);
                    shapes.push(LoopShape { kind: LoopKind::DoWhile, line: i, header, body });
                }
            }

            for (regex, kind) in [(&*FOR_KEYWORD, LoopKind::For), (&*WHILE_KEYWORD, LoopKind::While)] {
                for m in regex.find_iter(line) {
                    let open = m.end() - 1;
                    let Some(close) = find_matching(line, open) else {
                        continue;
                    };
                    let after = line[close + 1..].trim_start();
                    if kind == LoopKind::While && do_tails.contains(&i) && after.starts_with(';') {
                        continue;
                    }
                    let header = line[open + 1..close].to_string();
                    let body = Self::loop_body(masked, i, close + 1);
                    shapes.push(LoopShape { kind, line: i, header, body });
                }
            }
        }
        shapes
    }

    /// The `do` loop whose keyword ends at `column` of `line`. Gives the line of
    /// its `while (...)` tail, the condition and the body.
    fn do_loop(masked: &[String], line: usize, column: usize) -> Option<(usize, String, String)> {
        let (first, from) = (line..masked.len().min(line + LOOKAHEAD_LINES)).find_map(|l| {
            let start = if l == line { column } else { 0 };
            let rest = masked[l].get(start..)?;
            let lead = rest.len() - rest.trim_start().len();
            (!rest.trim().is_empty()).then_some((l, start + lead))
        })?;

        let (body, tail_line, tail_column) = if masked[first][from..].starts_with('{') {
            let block = find_block(masked, first, from)?;
            (utils::block_body(masked, &block), block.close_line, block.close_column + 1)
        } else {
            let end = from + masked[first][from..].find(';')?;
            (masked[first][from..=end].to_string(), first, end + 1)
        };

        let (l, header) = (tail_line..masked.len().min(tail_line + 2)).find_map(|l| {
            let from = if l == tail_line { tail_column } else { 0 };
            let rest = masked[l].get(from..)?;
            let w = WHILE_KEYWORD.find(rest)?;
            let open = from + w.end() - 1;
            let close = find_matching(&masked[l], open)?;
            Some((l, masked[l][open + 1..close].to_string()))
        })?;
        Some((l, header, body))
    }

    /// Body after a loop header: a braced block, or the single next statement.
    fn loop_body(masked: &[String], line: usize, column: usize) -> String {
        let after = masked[line].get(column..).unwrap_or("").trim();
        if after.starts_with('{') {
            return find_block(masked, line, column).map(|b| utils::block_body(masked, &b)).unwrap_or_default();
        }
        if !after.is_empty() {
            return after.to_string();
        }
        let Some(next) = (line + 1..masked.len()).find(|&l| !masked[l].trim().is_empty()) else {
            return String::new();
        };
        if masked[next].trim_start().starts_with('{') {
            return find_block(masked, next, 0).map(|b| utils::block_body(masked, &b)).unwrap_or_default();
        }
        masked[next].trim().to_string()
    }
}

impl Detector for DeadLoopDetector {
    fn name(&self) -> &'static str {
        "dead_loop"
    }

    fn description(&self) -> &'static str {
        "Loops that can never terminate"
    }

    fn is_enabled(&self, config: &Config) -> bool {
        config.categories.dead_loops
    }

    fn detect(&self, ctx: &DetectionContext) -> Result<Vec<Issue>> {
        let shapes = if ctx.has_tree() { self.tree_loops(ctx) } else { self.line_loops(ctx) };
        let mut seen = HashSet::new();
        let mut issues = Vec::new();
        for shape in &shapes {
            if let Some(message) = self.analyze(ctx, shape) {
                if seen.insert(shape.line) {
                    issues.push(ctx.issue(shape.line, Category::DeadLoop, message));
                }
            }
        }
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::{lines, Fixture};
    use pretty_assertions::assert_eq;

    fn both(source: &str) -> (Vec<u32>, Vec<u32>) {
        let ast = Fixture::new(source).run(&DeadLoopDetector);
        let heuristic = Fixture::heuristic(source).run(&DeadLoopDetector);
        (lines(&ast), lines(&heuristic))
    }

    #[test]
    fn infinite_forms_without_exit() {
        let src = "int main() {\n    for (;;) {\n    }\n    while (1) {\n        x++;\n    }\n    do {\n        y++;\n    } while (true);\n    return 0;\n}\n";
        assert_eq!(both(src), (vec![2, 4, 7], vec![2, 4, 7]));
    }

    #[test]
    fn exits_make_loops_finite() {
        let src = "int main() {\n    int x = 0;\n    for (;;) {\n        if (x > 0) break;\n    }\n    while (1) {\n        exit(0);\n    }\n    return 0;\n}\n";
        assert_eq!(both(src), (vec![], vec![]));
    }

    #[test]
    fn simulated_bounds() {
        let src = "int main() {\n    int i;\n    for (i = 0; i < 10; i--) { }\n    for (i = 0; i != 10; i += 3) { }\n    for (i = 1; i < 100; i *= 2) { }\n    for (i = 0; i < 100; i *= 2) { }\n    for (i = 0; i < 1000000; i++) { }\n    return 0;\n}\n";
        assert_eq!(both(src), (vec![3, 4, 6], vec![3, 4, 6]));
    }

    #[test]
    fn while_counter_never_updated() {
        let src = "int main() {\n    int n = 0;\n    while (n < 5) {\n        printf(\"%d\", n);\n    }\n    int k = 0;\n    while (k < 5) {\n        k++;\n    }\n    return 0;\n}\n";
        assert_eq!(both(src), (vec![3], vec![3]));
    }

    #[test]
    fn unknown_bounds_are_ignored() {
        let src = "int f(int n) {\n    int i;\n    for (i = 0; i < n; i--) { }\n    while (i < n) { }\n    return 0;\n}\n";
        assert_eq!(both(src), (vec![], vec![]));
    }

    #[test]
    fn single_statement_bodies() {
        let src = "int main() {\n    int x = 0;\n    int i;\n    while (1)\n        x++;\n    for (i = 0; i < 10; )\n        x++;\n    do\n        x--;\n    while (1);\n    return x;\n}\n";
        assert_eq!(both(src), (vec![4, 6, 8], vec![4, 6, 8]));

        let finite = "int main() {\n    int i;\n    for (i = 0; i < 10; i++)\n        printf(\"%d\", i);\n    while (1)\n        break;\n    do\n        i--;\n    while (i > 0);\n    return 0;\n}\n";
        assert_eq!(both(finite), (vec![], vec![]));
    }

    #[test]
    fn termination_rules() {
        assert!(terminates(0, Cmp::Lt, 10, Step::Add(1)));
        assert!(!terminates(0, Cmp::Lt, 10, Step::Add(-1)));
        assert!(terminates(0, Cmp::Ne, 9, Step::Add(3)));
        assert!(!terminates(0, Cmp::Ne, 10, Step::Add(3)));
        assert!(terminates(100, Cmp::Gt, 0, Step::Div(2)));
        assert!(!terminates(1, Cmp::Gt, 0, Step::Mul(2)));
        assert!(terminates(0, Cmp::Eq, 0, Step::Add(1)));
        assert!(terminates(5, Cmp::Eq, 0, Step::Mul(2)));
        assert_eq!(parse_step("i", "i = i - 2"), Some(Step::Add(-2)));
        assert_eq!(parse_step("i", "--i"), Some(Step::Add(-1)));
        assert_eq!(parse_step("i", "j++"), None);
    }
}
