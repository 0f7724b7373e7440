use tracing::{debug, warn};

use crate::ast::{NodeId, NodeKind, Span, SyntaxTree, TreeBuilder};
use crate::clang_json::ClangDumpBackend;
use crate::config::ClangOptions;
use crate::error::{Result, ScanError};
use crate::processors::LibclangBackend;
use crate::types::Position;

/// One way of turning C text into a [`SyntaxTree`].
pub trait ParserBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, source: &str) -> Result<SyntaxTree>;
}

/// Tries each backend in order and never fails: when none of them produces a
/// tree the empty translation unit is returned.
pub struct AstParser {
    backends: Vec<Box<dyn ParserBackend>>,
}

impl AstParser {
    pub fn new(clang: &ClangOptions) -> Self {
        AstParser {
            backends: vec![
                Box::new(TreeSitterBackend),
                Box::new(LibclangBackend),
                Box::new(ClangDumpBackend::new(clang.clone())),
            ],
        }
    }

    pub fn with_backends(backends: Vec<Box<dyn ParserBackend>>) -> Self {
        AstParser { backends }
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn parse(&self, source: &str) -> SyntaxTree {
        for backend in &self.backends {
            match backend.parse(source) {
                Ok(tree) if !tree.is_empty() => {
                    debug!("parsed with {} backend ({} nodes)", backend.name(), tree.len());
                    return tree;
                }
                Ok(_) => debug!("{} backend produced an empty tree", backend.name()),
                Err(e @ ScanError::BackendUnavailable { .. }) => debug!("{}", e),
                Err(e) => warn!("{}", e),
            }
        }
        if !source.trim().is_empty() {
            warn!("no parser backend produced a tree, falling back to line heuristics");
        }
        SyntaxTree::empty()
    }
}

/// The tree-sitter C grammar, linked into the binary.
pub struct TreeSitterBackend;

impl ParserBackend for TreeSitterBackend {
    fn name(&self) -> &'static str {
        "tree-sitter"
    }

    fn parse(&self, source: &str) -> Result<SyntaxTree> {
        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&tree_sitter_c::LANGUAGE.into())
            .map_err(|e| ScanError::BackendUnavailable { backend: "tree-sitter", message: e.to_string() })?;
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| ScanError::Backend { backend: "tree-sitter", message: "parse returned no tree".into() })?;

        Ok(convert_tree(&tree, source))
    }
}

fn point(p: tree_sitter::Point) -> Position {
    Position::new(p.row, p.column)
}

fn convert_tree(tree: &tree_sitter::Tree, source: &str) -> SyntaxTree {
    let mut builder = TreeBuilder::new(source, "tree-sitter");
    let mut cursor = tree.walk();
    let mut parents: Vec<NodeId> = Vec::new();

    loop {
        let node = cursor.node();
        let span = Span { start: point(node.start_position()), end: point(node.end_position()) };
        let text = builder.slice_or(node.byte_range(), "");
        let id = builder.add(
            parents.last().copied(),
            NodeKind::from_tree_sitter(node.kind()),
            text,
            span,
            node.is_named(),
            cursor.field_name(),
        );

        if cursor.goto_first_child() {
            parents.push(id);
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return builder.finish();
            }
            parents.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl ParserBackend for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn parse(&self, _source: &str) -> Result<SyntaxTree> {
            Err(ScanError::Backend { backend: "failing", message: "boom".into() })
        }
    }

    #[test]
    fn tree_sitter_builds_shared_vocabulary() {
        let tree = TreeSitterBackend.parse("#include <stdio.h>\nint main(void) { int *p = 0; printf(\"%d\", *p); return 0; }\n").unwrap();
        assert_eq!(tree.backend(), "tree-sitter");
        assert!(!tree.is_empty());

        let includes = tree.includes();
        assert_eq!(includes.len(), 1);
        assert_eq!(includes[0].header, "stdio.h");
        assert!(includes[0].angle);

        let decls = tree.declarations();
        assert!(decls.iter().any(|d| d.name == "p" && d.is_pointer && d.initializer.is_some()));

        let calls = tree.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "printf");
        assert_eq!(calls[0].arguments.len(), 2);
        assert_eq!(calls[0].position.line, 1);
    }

    #[test]
    fn broken_input_still_yields_a_tree() {
        let tree = TreeSitterBackend.parse("int main( { for (;; }").unwrap();
        assert_eq!(tree.root().kind(), &NodeKind::TranslationUnit);
    }

    #[test]
    fn falls_back_to_sentinel_when_every_backend_fails() {
        let parser = AstParser::with_backends(vec![Box::new(Failing)]);
        let tree = parser.parse("int x;");
        assert!(tree.is_empty());
        assert_eq!(parser.backend_names(), vec!["failing"]);
    }

    #[test]
    fn later_backend_used_when_earlier_fails() {
        let parser = AstParser::with_backends(vec![Box::new(Failing), Box::new(TreeSitterBackend)]);
        assert_eq!(parser.parse("int x;").backend(), "tree-sitter");
    }
}
