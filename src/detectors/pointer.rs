use std::collections::HashSet;

use regex::Regex;

use crate::config::Config;
use crate::error::{Result, ScanError};
use crate::scope::EscapeKind;
use crate::types::{Category, Issue, Position, SymbolicValue, VariableState};

use super::{DetectionContext, Detector};

/// Dereferences of pointers that hold no valid address at that point.
pub struct PointerDetector;

impl PointerDetector {
    /// Whether `name` is tested as a condition anywhere in lines `from..=to`.
    fn tested_between(ctx: &DetectionContext, name: &str, from: usize, to: usize) -> Result<bool> {
        let n = regex::escape(name);
        let test = Regex::new(&format!(
            r"!\s*{n}\b|\b{n}\s*[!=]=|[!=]=\s*{n}\b|\(\s*{n}\s*\)|\b{n}\s*(?:&&|\|\||\?)|(?:&&|\|\|)\s*{n}\b"
        ))
        .map_err(|e| ScanError::Detector { name: "pointer", message: e.to_string() })?;
        Ok(ctx.text.masked[from..=to.min(ctx.text.masked.len().saturating_sub(1))]
            .iter()
            .any(|line| test.is_match(line)))
    }

    fn check_variable(&self, ctx: &DetectionContext, var: &VariableState, issues: &mut Vec<Issue>) -> Result<()> {
        let decl = &var.decl;
        let categories = &ctx.config.categories;
        let mut wild_reported = false;
        let mut reported: HashSet<usize> = HashSet::new();

        for r in ctx.symbols.references_to(var.id).filter(|r| r.access.is_dereference()) {
            let Some((index, change)) = var.value_at(r.pos) else {
                let assignable = !decl.is_global && !decl.is_static && !decl.is_parameter && !decl.is_initialized;
                if categories.wild_pointers && assignable && !wild_reported {
                    wild_reported = true;
                    issues.push(ctx.issue(
                        r.pos.line,
                        Category::WildPointer,
                        format!("Wild pointer dereference: '{}' is never initialized", var.name()),
                    ));
                }
                continue;
            };
            if reported.contains(&index) {
                continue;
            }

            let finding = match &change.value {
                SymbolicValue::NullLike if categories.null_pointers => {
                    if Self::tested_between(ctx, var.name(), change.line, r.pos.line)? {
                        None
                    } else {
                        Some((Category::NullPointer, format!("Null pointer dereference: '{}' is NULL", var.name())))
                    }
                }
                SymbolicValue::Freed if categories.wild_pointers => Some((
                    Category::DanglingPointer,
                    format!("Dangling pointer: '{}' is used after being freed", var.name()),
                )),
                SymbolicValue::AddressOf(target) if categories.wild_pointers => {
                    self.out_of_scope(ctx, var, target, change.line, r.pos)
                }
                SymbolicValue::Dangerous(function) | SymbolicValue::FunctionCallResult(function)
                    if categories.wild_pointers =>
                {
                    ctx.danger(function).map(|danger| {
                        (
                            Category::DanglingPointer,
                            format!(
                                "Dangling pointer: '{}' holds the result of '{}', which {}",
                                var.name(),
                                function,
                                danger.describe()
                            ),
                        )
                    })
                }
                _ => None,
            };

            if let Some((category, message)) = finding {
                reported.insert(index);
                issues.push(ctx.issue(r.pos.line, category, message));
            }
        }
        Ok(())
    }

    /// Stack pointer dereference: the pointee's scope closed before `at`.
    fn out_of_scope(
        &self,
        ctx: &DetectionContext,
        var: &VariableState,
        target: &str,
        assigned_line: usize,
        at: Position,
    ) -> Option<(Category, String)> {
        let pointee = ctx.symbols.variable_at(target, assigned_line)?;
        if pointee.decl.is_global || pointee.decl.is_static {
            return None;
        }
        let end = pointee.scope_end_line?;
        (at.line > end).then(|| {
            (
                Category::DanglingPointer,
                format!(
                    "Stack pointer dereference: '{}' points to '{}' whose scope ended on line {}",
                    var.name(),
                    target,
                    end + 1
                ),
            )
        })
    }
}

impl Detector for PointerDetector {
    fn name(&self) -> &'static str {
        "pointer"
    }

    fn description(&self) -> &'static str {
        "Wild, null and dangling pointer dereferences and returns of invalid addresses"
    }

    fn is_enabled(&self, config: &Config) -> bool {
        config.categories.wild_pointers || config.categories.null_pointers
    }

    fn detect(&self, ctx: &DetectionContext) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();

        for var in ctx.symbols.variables.iter().filter(|v| v.decl.is_pointer && !v.decl.is_array) {
            self.check_variable(ctx, var, &mut issues)?;
        }

        if ctx.config.categories.wild_pointers {
            for escape in &ctx.symbols.escapes {
                let message = match escape.kind {
                    EscapeKind::LocalAddress => format!(
                        "Function '{}' returns the address of local variable '{}'",
                        escape.function, escape.variable
                    ),
                    EscapeKind::Freed => {
                        format!("Function '{}' returns freed pointer '{}'", escape.function, escape.variable)
                    }
                };
                issues.push(ctx.issue(escape.line, Category::DanglingPointer, message));
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

    fn categories(issues: &[Issue]) -> Vec<(u32, Category)> {
        issues.iter().map(|i| (i.line, i.category)).collect()
    }

    #[test]
    fn wild_pointer_once() {
        let fixture = Fixture::new("int main() {\n    int *p;\n    *p = 1;\n    p[2] = 3;\n    return 0;\n}\n");
        assert_eq!(categories(&fixture.run(&PointerDetector)), vec![(3, Category::WildPointer)]);
    }

    #[test]
    fn null_then_malloc_is_clean() {
        let fixture = Fixture::new(
            "int main() {\n    int *p = NULL;\n    p = malloc(sizeof(int));\n    *p = 1;\n    return 0;\n}\n",
        );
        assert!(fixture.run(&PointerDetector).is_empty());
    }

    #[test]
    fn null_dereference_reported() {
        let fixture = Fixture::new("int main() {\n    int *p = NULL;\n    *p = 1;\n    *p = 2;\n    return 0;\n}\n");
        assert_eq!(categories(&fixture.run(&PointerDetector)), vec![(3, Category::NullPointer)]);
    }

    #[test]
    fn null_check_suppresses() {
        let fixture = Fixture::new(
            "int main() {\n    char *s = NULL;\n    if (s != NULL) {\n        s[0] = 'a';\n    }\n    return 0;\n}\n",
        );
        assert!(fixture.run(&PointerDetector).is_empty());
    }

    #[test]
    fn use_after_free() {
        let fixture = Fixture::new(
            "int main() {\n    int *p = malloc(4);\n    free(p);\n    *p = 1;\n    return 0;\n}\n",
        );
        assert_eq!(categories(&fixture.run(&PointerDetector)), vec![(4, Category::DanglingPointer)]);
    }

    #[test]
    fn pointer_to_expired_block_local() {
        let fixture = Fixture::new(
            "int main() {\n    int *p;\n    {\n        int x = 1;\n        p = &x;\n    }\n    *p = 2;\n    return 0;\n}\n",
        );
        let issues = fixture.run(&PointerDetector);
        assert_eq!(categories(&issues), vec![(7, Category::DanglingPointer)]);
        assert!(issues[0].message.starts_with("Stack pointer dereference"));
    }

    #[test]
    fn returned_local_address_and_dangerous_callers() {
        let fixture = Fixture::new(
            "int *make(void) {\n    int v = 3;\n    return &v;\n}\nint main() {\n    int *p = make();\n    return *p;\n}\n",
        );
        let issues = fixture.run(&PointerDetector);
        assert_eq!(lines(&issues), vec![7, 3]);
        assert!(issues.iter().all(|i| i.category == Category::DanglingPointer));
    }

    #[test]
    fn parameters_and_arrays_are_not_wild() {
        let fixture = Fixture::new("void f(int *out) {\n    int *arr[2];\n    *out = 1;\n    arr[0] = out;\n}\n");
        assert!(fixture.run(&PointerDetector).is_empty());
    }
}
