use std::collections::BTreeMap;

use regex::Regex;

use crate::config::Config;
use crate::error::{Result, ScanError};
use crate::scope::Allocation;
use crate::types::{Category, Issue};
use crate::utils;

use super::{DetectionContext, Detector};

/// Heap allocations that are neither freed nor handed off before their
/// function ends.
pub struct MemoryLeakDetector;

/// Patterns that move ownership of `var` out of the current function.
struct Transfer {
    returned: Regex,
    stored: Regex,
    aliased: Regex,
}

impl Transfer {
    fn new(var: &str) -> Result<Self> {
        let v = regex::escape(var);
        let compile = |pattern: String| {
            Regex::new(&pattern).map_err(|e| ScanError::Detector { name: "memory_leak", message: e.to_string() })
        };
        Ok(Transfer {
            returned: compile(format!(r"\breturn\s*(?:\(\s*{v}\s*\)|\s{v})\s*;"))?,
            // *out = p, s->f = p, s.f = p, a[i] = p
            stored: compile(format!(
                r"(?:\*\s*\w+|\w+\s*(?:->|\.)\s*\w+|\w+\s*\[[^\]]*\])\s*=\s*(?:\([^()]*\)\s*)?{v}\b"
            ))?,
            aliased: compile(format!(r"\b(\w+)\s*=\s*(?:\([^()]*\)\s*)?{v}\s*;"))?,
        })
    }

    fn applies(&self, var: &str, body: &str) -> bool {
        self.returned.is_match(body)
            || self.stored.is_match(body)
            || self
                .aliased
                .captures_iter(body)
                .filter_map(|c| c.get(1))
                .any(|m| m.as_str() != var && !body[..m.start()].trim_end().ends_with(['=', '!', '<', '>']))
    }
}

impl MemoryLeakDetector {
    fn function_body(ctx: &DetectionContext, alloc: &Allocation) -> String {
        let masked = &ctx.text.masked;
        let (start, end) = match ctx.symbols.frames.iter().find(|f| f.id == alloc.frame) {
            Some(frame) => (frame.start_line, frame.end_line.unwrap_or(masked.len().saturating_sub(1))),
            None => (alloc.line, masked.len().saturating_sub(1)),
        };
        masked[start.min(masked.len())..=end.min(masked.len().saturating_sub(1))].join("\n")
    }

    fn is_released(var: &str, body: &str) -> bool {
        utils::find_calls(body).iter().any(|call| {
            if call.name == "free" {
                return call
                    .arguments
                    .first()
                    .is_some_and(|arg| utils::strip_casts(arg).trim_matches(|c| c == '(' || c == ')' || c == ' ') == var);
            }
            // Handing the pointer to any other function counts as a transfer
            !utils::is_allocation_function(&call.name)
                && call.arguments.iter().any(|arg| utils::contains_word(arg, var))
        })
    }
}

impl Detector for MemoryLeakDetector {
    fn name(&self) -> &'static str {
        "memory_leak"
    }

    fn description(&self) -> &'static str {
        "Heap allocations never freed or transferred in their function"
    }

    fn is_enabled(&self, config: &Config) -> bool {
        config.categories.memory_leaks
    }

    fn detect(&self, ctx: &DetectionContext) -> Result<Vec<Issue>> {
        // First allocation of each variable per frame
        let mut first: BTreeMap<(usize, usize), &Allocation> = BTreeMap::new();
        for alloc in &ctx.symbols.allocations {
            first.entry((alloc.frame, alloc.var)).or_insert(alloc);
        }

        let mut issues = Vec::new();
        for alloc in first.values() {
            let var = ctx.symbols.variable(alloc.var);
            let name = var.name();
            if var.decl.is_global || var.decl.is_static {
                continue;
            }
            let body = Self::function_body(ctx, alloc);
            if Self::is_released(name, &body) || Transfer::new(name)?.applies(name, &body) {
                continue;
            }
            issues.push(ctx.issue(
                alloc.line,
                Category::MemoryLeak,
                format!(
                    "Memory leak: '{}' is allocated with {}() but never freed in '{}'",
                    name, alloc.allocator, alloc.function
                ),
            ));
        }
        issues.sort_by_key(|i| i.line);
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::{lines, Fixture};
    use pretty_assertions::assert_eq;

    fn leaks(source: &str) -> Vec<u32> {
        lines(&Fixture::new(source).run(&MemoryLeakDetector))
    }

    #[test]
    fn malloc_without_free() {
        let issues = Fixture::new(
            "#include <stdlib.h>\nint main() {\n    int *p = malloc(sizeof(int));\n    *p = 1;\n    return 0;\n}\n",
        )
        .run(&MemoryLeakDetector);
        assert_eq!(lines(&issues), vec![3]);
        assert_eq!(issues[0].category, Category::MemoryLeak);
        assert!(issues[0].message.contains("'p'"));
    }

    #[test]
    fn freed_or_returned_is_clean() {
        assert!(leaks("void f() {\n    char *s = malloc(8);\n    free((void *)s);\n}\n").is_empty());
        assert!(leaks("int *make() {\n    int *p = malloc(4);\n    return p;\n}\n").is_empty());
        assert!(leaks("int *make() {\n    int *p = malloc(4);\n    return (p);\n}\n").is_empty());
    }

    #[test]
    fn ownership_transfers() {
        assert!(leaks("void f(int **out) {\n    int *p = malloc(4);\n    *out = p;\n}\n").is_empty());
        assert!(leaks("void f(struct s *o) {\n    int *p = malloc(4);\n    o->data = p;\n}\n").is_empty());
        assert!(leaks("void f(int **slots) {\n    int *p = malloc(4);\n    slots[2] = p;\n}\n").is_empty());
        assert!(leaks("void f() {\n    int *p = malloc(4);\n    int *q = p;\n    free(q);\n}\n").is_empty());
        assert!(leaks("void f() {\n    int *p = malloc(4);\n    keep(p);\n}\n").is_empty());
    }

    #[test]
    fn one_issue_per_variable_per_function() {
        let source = "void f() {\n    int *p = malloc(4);\n    p = malloc(8);\n}\nvoid g() {\n    char *p = calloc(1, 4);\n    if (p == NULL) {\n        return;\n    }\n}\n";
        assert_eq!(leaks(source), vec![2, 6]);
    }

    #[test]
    fn free_in_another_function_does_not_count() {
        let source = "void f() {\n    int *p = malloc(4);\n}\nvoid g(int *p) {\n    free(p);\n}\n";
        assert_eq!(leaks(source), vec![2]);
    }
}
