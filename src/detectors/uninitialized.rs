use crate::config::Config;
use crate::error::Result;
use crate::types::{Category, Issue};

use super::{DetectionContext, Detector};

/// First read of a local that never received a value.
pub struct UninitializedDetector;

impl Detector for UninitializedDetector {
    fn name(&self) -> &'static str {
        "uninitialized"
    }

    fn description(&self) -> &'static str {
        "Local variables read before any value is assigned"
    }

    fn is_enabled(&self, config: &Config) -> bool {
        config.categories.uninitialized
    }

    fn detect(&self, ctx: &DetectionContext) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();

        for var in &ctx.symbols.variables {
            let decl = &var.decl;
            if decl.is_global || decl.is_static || decl.is_parameter || decl.is_array || decl.is_struct_value() {
                continue;
            }
            // extern declarations have no history but are defined elsewhere
            if var.value_history.is_empty() && decl.is_initialized {
                continue;
            }

            let Some(first_use) = ctx.symbols.references_to(var.id).find(|r| r.access.is_use()) else {
                continue;
            };
            if var.assigned_before(first_use.pos) {
                continue;
            }
            // *p on a never-assigned pointer is a wild pointer
            if decl.is_pointer && first_use.access.is_dereference() {
                continue;
            }

            issues.push(ctx.issue(
                first_use.pos.line,
                Category::Uninitialized,
                format!("Variable '{}' is used before it is initialized", var.name()),
            ));
        }

        Ok(issues)
    }
}
