//! Static bug detection for C sources.
//!
//! A file is parsed into a [`ast::SyntaxTree`] when a backend is available,
//! tracked line by line into a [`scope::SymbolState`], and then handed to the
//! detector suite. [`analyze`] is the one-shot entry point; [`Analyzer`] keeps
//! the AST cache and the cross-file function table alive between files.

pub mod ast;
pub mod clang_json;
pub mod config;
pub mod detectors;
pub mod error;
pub mod formatters;
pub mod graph_builder;
pub mod orchestrator;
pub mod parser;
pub mod processors;
pub mod scope;
pub mod types;
pub mod utils;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::ast::SyntaxTree;
use crate::detectors::DetectionContext;
use crate::graph_builder::GlobalSymbolTable;
use crate::orchestrator::DetectorManager;
use crate::parser::AstParser;
use crate::utils::SourceText;

pub use crate::config::{CategoryToggles, Config, Engine};
pub use crate::error::{Result, ScanError};
pub use crate::types::{Category, Issue};

/// Analyze one file's text with a fresh [`Analyzer`]. Never fails: backend
/// and detector problems only reduce what is found.
pub fn analyze(source: &str, file_path: &str, config: &Config) -> Vec<Issue> {
    Analyzer::new(config.clone()).analyze(source, file_path)
}

/// Stable report order: file, then line, then category.
pub fn sort_issues(issues: &mut [Issue]) {
    issues.sort_by(|a, b| {
        (&a.file, a.line, a.category, &a.message).cmp(&(&b.file, b.line, b.category, &b.message))
    });
}

/// Analysis session shared by every file of one run.
pub struct Analyzer {
    config: Config,
    parser: AstParser,
    detectors: DetectorManager,
    cache: RwLock<HashMap<blake3::Hash, Arc<SyntaxTree>>>,
    shared: RwLock<GlobalSymbolTable>,
}

impl Analyzer {
    pub fn new(config: Config) -> Self {
        let parser = AstParser::new(&config.clang);
        Self::with_parts(config, parser, DetectorManager::new())
    }

    pub fn with_parts(config: Config, parser: AstParser, detectors: DetectorManager) -> Self {
        Analyzer {
            config,
            parser,
            detectors,
            cache: RwLock::new(HashMap::new()),
            shared: RwLock::new(GlobalSymbolTable::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn detectors(&self) -> &DetectorManager {
        &self.detectors
    }

    /// Snapshot of the functions learned from files analyzed so far.
    pub fn shared_symbols(&self) -> GlobalSymbolTable {
        self.shared.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cached_trees(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn tree_for(&self, source: &str) -> Arc<SyntaxTree> {
        if self.config.engine == Engine::Heuristic {
            return Arc::new(SyntaxTree::empty());
        }
        if !self.config.ast_cache {
            return Arc::new(self.parser.parse(source));
        }

        let key = blake3::hash(source.as_bytes());
        if let Some(tree) = self.cache.read().unwrap_or_else(|e| e.into_inner()).get(&key) {
            debug!("AST cache hit");
            return Arc::clone(tree);
        }
        let tree = Arc::new(self.parser.parse(source));
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::clone(&tree));
        tree
    }

    pub fn analyze(&self, source: &str, file_path: &str) -> Vec<Issue> {
        let text = SourceText::new(source);
        let tree = self.tree_for(source);
        if self.config.engine == Engine::Ast && tree.is_empty() && !source.trim().is_empty() {
            warn!(file = file_path, "no syntax tree available, using line heuristics");
        }
        let symbols = scope::track(&text);

        let mut issues = {
            let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
            let ctx = DetectionContext {
                file_path,
                text: &text,
                tree: &tree,
                symbols: &symbols,
                shared: Some(&*shared),
                config: &self.config,
            };
            self.detectors.detect(&ctx)
        };

        self.shared
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .merge(&symbols.globals);

        sort_issues(&mut issues);
        debug!(file = file_path, backend = tree.backend(), count = issues.len(), "analysis finished");
        issues
    }

    /// Read and analyze a file, refusing files above the configured size.
    pub fn analyze_file(&self, path: &Path) -> Result<Vec<Issue>> {
        let size = fs::metadata(path)?.len();
        let limit = self.config.max_file_size_bytes();
        if size > limit {
            return Err(ScanError::FileTooLarge { path: path.to_path_buf(), size, limit });
        }
        let bytes = fs::read(path)?;
        let source = String::from_utf8_lossy(&bytes);
        Ok(self.analyze(&source, &path.to_string_lossy()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cache_reuses_trees() {
        let analyzer = Analyzer::new(Config::default());
        let source = "int main() {\n    return 0;\n}\n";
        analyzer.analyze(source, "a.c");
        analyzer.analyze(source, "b.c");
        assert_eq!(analyzer.cached_trees(), 1);

        let uncached = Analyzer::new(Config { ast_cache: false, ..Config::default() });
        uncached.analyze(source, "a.c");
        assert_eq!(uncached.cached_trees(), 0);
    }

    #[test]
    fn dangerous_functions_cross_files() {
        let analyzer = Analyzer::new(Config::default());
        let lib = "int *make(void) {\n    int v = 1;\n    return &v;\n}\n";
        let user = "int *make(void);\nint main() {\n    int *p = make();\n    return *p;\n}\n";

        assert!(analyze(user, "user.c", &Config::default()).is_empty());

        analyzer.analyze(lib, "lib.c");
        assert!(analyzer.shared_symbols().is_dangerous("make"));
        let issues = analyzer.analyze(user, "user.c");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].line, 4);
        assert_eq!(issues[0].category, Category::DanglingPointer);
    }

    #[test]
    fn sorting_is_by_file_then_line() {
        let mut issues = vec![
            Issue::at("b.c", &[], 0, Category::Header, "x".into()),
            Issue::at("a.c", &[], 4, Category::Format, "y".into()),
            Issue::at("a.c", &[], 1, Category::Uninitialized, "z".into()),
        ];
        sort_issues(&mut issues);
        let order: Vec<(&str, u32)> = issues.iter().map(|i| (i.file.as_str(), i.line)).collect();
        assert_eq!(order, vec![("a.c", 2), ("a.c", 5), ("b.c", 1)]);
    }
}
