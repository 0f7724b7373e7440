//! Bug detectors. Each one reads a shared [`DetectionContext`] and returns
//! its findings; none of them keeps state between files.

mod dead_loop;
mod format_string;
mod header;
mod memory_leak;
mod numeric_range;
mod pointer;
mod uninitialized;

pub use dead_loop::DeadLoopDetector;
pub use format_string::FormatStringDetector;
pub use header::HeaderDetector;
pub use memory_leak::MemoryLeakDetector;
pub use numeric_range::NumericRangeDetector;
pub use pointer::PointerDetector;
pub use uninitialized::UninitializedDetector;

use crate::ast::SyntaxTree;
use crate::config::{Config, Engine};
use crate::error::Result;
use crate::graph_builder::{Danger, GlobalSymbolTable};
use crate::scope::SymbolState;
use crate::types::{Category, Issue};
use crate::utils::SourceText;

pub trait Detector: Send + Sync {
    /// Stable identifier used in logs and `detector_names`.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn is_enabled(&self, config: &Config) -> bool;

    fn detect(&self, ctx: &DetectionContext) -> Result<Vec<Issue>>;
}

/// Everything known about one file, shared read-only by all detectors.
pub struct DetectionContext<'a> {
    pub file_path: &'a str,
    pub text: &'a SourceText,
    pub tree: &'a SyntaxTree,
    pub symbols: &'a SymbolState,
    /// Functions seen in files analyzed earlier in the same run.
    pub shared: Option<&'a GlobalSymbolTable>,
    pub config: &'a Config,
}

impl<'a> DetectionContext<'a> {
    /// Whether tree-based paths should be taken.
    pub fn has_tree(&self) -> bool {
        self.config.engine != Engine::Heuristic && !self.tree.is_empty()
    }

    pub fn issue(&self, line: usize, category: Category, message: String) -> Issue {
        Issue::at(self.file_path, &self.text.raw, line, category, message)
    }

    pub fn danger(&self, function: &str) -> Option<Danger> {
        self.symbols
            .globals
            .danger(function)
            .or_else(|| self.shared.and_then(|table| table.danger(function)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::parser::TreeSitterBackend;
    use crate::parser::ParserBackend;
    use crate::scope;

    /// Owns everything a context borrows.
    pub struct Fixture {
        pub text: SourceText,
        pub tree: SyntaxTree,
        pub symbols: SymbolState,
        pub config: Config,
    }

    impl Fixture {
        pub fn new(source: &str) -> Self {
            let text = SourceText::new(source);
            let symbols = scope::track(&text);
            let tree = TreeSitterBackend.parse(source).unwrap_or_else(|_| SyntaxTree::empty());
            Fixture { text, tree, symbols, config: Config::default() }
        }

        /// Same source without a tree, forcing the line paths.
        pub fn heuristic(source: &str) -> Self {
            let mut fixture = Fixture::new(source);
            fixture.tree = SyntaxTree::empty();
            fixture.config.engine = Engine::Heuristic;
            fixture
        }

        pub fn ctx(&self) -> DetectionContext<'_> {
            DetectionContext {
                file_path: "test.c",
                text: &self.text,
                tree: &self.tree,
                symbols: &self.symbols,
                shared: None,
                config: &self.config,
            }
        }

        pub fn run(&self, detector: &dyn Detector) -> Vec<Issue> {
            detector.detect(&self.ctx()).unwrap()
        }
    }

    pub fn lines(issues: &[Issue]) -> Vec<u32> {
        issues.iter().map(|i| i.line).collect()
    }
}
