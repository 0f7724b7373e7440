use std::ops::Range;
use std::sync::Mutex;

use clang::{Entity, EntityKind, Index, Unsaved};
use once_cell::sync::Lazy;
use tracing::debug;

use crate::ast::{NodeId, NodeKind, NodeText, Span, SyntaxTree, TreeBuilder};
use crate::error::{Result, ScanError};
use crate::parser::ParserBackend;
use crate::types::Position;

// libclang allows a single `Clang` instance per process
static CLANG_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const ASSIGNMENT_OPERATORS: &[&str] = &["=", "+=", "-=", "*=", "/=", "%=", "<<=", ">>=", "&=", "^=", "|="];

/// What a clang front end tells us about one cursor, independent of whether
/// it came from libclang or from the JSON dump.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClangFacts {
    pub kind: String,
    pub name: Option<String>,
    pub type_name: Option<String>,
    pub opcode: Option<String>,
    pub has_init: bool,
    pub has_body: bool,
    pub range: Option<Range<usize>>,
    pub span: Span,
}

/// Where the children of a converted clang node go.
#[derive(Debug, Clone)]
pub(crate) struct Attach {
    pub node: NodeId,
    pub kind: NodeKind,
    pub params: Option<NodeId>,
    pub arguments: Option<NodeId>,
    pub init: Option<NodeId>,
}

fn owned(text: &str) -> NodeText {
    NodeText::Owned(text.to_string())
}

fn type_kind(base: &str) -> NodeKind {
    let words: Vec<&str> = base.split_whitespace().collect();
    if words.iter().any(|w| ["struct", "union", "enum"].contains(w)) {
        NodeKind::StructSpecifier
    } else if words.iter().any(|w| ["unsigned", "signed", "short", "long"].contains(w)) {
        NodeKind::SizedTypeSpecifier
    } else if words.len() == 1 && !["int", "char", "float", "double", "void", "_Bool"].contains(&words[0]) {
        NodeKind::TypeIdentifier
    } else {
        NodeKind::PrimitiveType
    }
}

/// Split a clang type spelling like `const char *[4]` into the base type
/// and pointer/array markers.
fn split_type(spelling: &str) -> (String, bool, bool) {
    let is_array = spelling.contains('[');
    let head = spelling.split('[').next().unwrap_or(spelling);
    let is_pointer = head.contains('*');
    let base = head
        .replace('*', " ")
        .split_whitespace()
        .filter(|w| !["const", "volatile", "restrict"].contains(w))
        .collect::<Vec<_>>()
        .join(" ");
    (base, is_pointer, is_array)
}

fn add_declarator_chain(
    b: &mut TreeBuilder,
    parent: NodeId,
    field: &'static str,
    name: &str,
    is_pointer: bool,
    is_array: bool,
    span: Span,
) -> NodeId {
    let wrapper = if is_pointer {
        Some(NodeKind::PointerDeclarator)
    } else if is_array {
        Some(NodeKind::ArrayDeclarator)
    } else {
        None
    };
    match wrapper {
        Some(kind) => {
            let outer = b.add(Some(parent), kind, owned(name), span, true, Some(field));
            b.add(Some(outer), NodeKind::Identifier, owned(name), span, true, Some("declarator"));
            outer
        }
        None => b.add(Some(parent), NodeKind::Identifier, owned(name), span, true, Some(field)),
    }
}

/// Add one clang cursor, synthesizing the declarator children tree-sitter
/// would have produced so that consumers see one shape.
pub(crate) fn add_clang_node(
    b: &mut TreeBuilder,
    parent: Option<NodeId>,
    field: Option<&'static str>,
    facts: &ClangFacts,
) -> Attach {
    let fallback = facts.name.as_deref().or(facts.opcode.as_deref()).unwrap_or("");
    let text = match &facts.range {
        Some(range) => b.slice_or(range.clone(), fallback),
        None => owned(fallback),
    };
    let mut kind = NodeKind::from_clang(&facts.kind);
    let op = facts.opcode.as_deref().unwrap_or("");

    match kind {
        NodeKind::FunctionDefinition if !facts.has_body => kind = NodeKind::Declaration,
        NodeKind::BinaryExpression if ASSIGNMENT_OPERATORS.contains(&op) => kind = NodeKind::AssignmentExpression,
        NodeKind::UnaryExpression if op == "*" || op == "&" => kind = NodeKind::PointerExpression,
        NodeKind::UnaryExpression if op == "++" || op == "--" => kind = NodeKind::UpdateExpression,
        _ => {}
    }

    let node = b.add(parent, kind.clone(), text, facts.span, true, field);
    let mut attach = Attach {
        node,
        kind: kind.clone(),
        params: None,
        arguments: None,
        init: None,
    };
    let span = facts.span;
    let name = facts.name.as_deref().unwrap_or("");

    match facts.kind.as_str() {
        "VarDecl" | "ParmVarDecl" | "ParmDecl" | "FieldDecl" => {
            let (base, is_pointer, is_array) = split_type(facts.type_name.as_deref().unwrap_or(""));
            b.add(Some(node), type_kind(&base), owned(&base), span, true, Some("type"));
            if name.is_empty() {
                return attach;
            }
            if facts.has_init {
                let init = b.add(Some(node), NodeKind::InitDeclarator, owned(name), span, true, Some("declarator"));
                add_declarator_chain(b, init, "declarator", name, is_pointer, is_array, span);
                attach.init = Some(init);
            } else {
                add_declarator_chain(b, node, "declarator", name, is_pointer, is_array, span);
            }
        }
        "FunctionDecl" => {
            let spelling = facts.type_name.as_deref().unwrap_or("");
            let ret = spelling.split('(').next().unwrap_or("").trim();
            let (base, returns_pointer, _) = split_type(ret);
            b.add(Some(node), type_kind(&base), owned(&base), span, true, Some("type"));
            let holder = if returns_pointer {
                b.add(Some(node), NodeKind::PointerDeclarator, owned(name), span, true, Some("declarator"))
            } else {
                node
            };
            let decl = b.add(Some(holder), NodeKind::FunctionDeclarator, owned(name), span, true, Some("declarator"));
            b.add(Some(decl), NodeKind::Identifier, owned(name), span, true, Some("declarator"));
            attach.params = Some(b.add(Some(decl), NodeKind::ParameterList, owned(""), span, true, Some("parameters")));
        }
        "CallExpr" => {
            attach.arguments = Some(b.add(Some(node), NodeKind::ArgumentList, owned(""), span, true, Some("arguments")));
        }
        "MemberExpr" | "MemberRefExpr" if !name.is_empty() => {
            b.add(Some(node), NodeKind::FieldIdentifier, owned(name), span, true, Some("field"));
        }
        _ => {}
    }
    attach
}

/// Parent and field for the `index`-th of `count` children of `attach`.
pub(crate) fn attach_child(attach: &Attach, child_kind: &str, index: usize, count: usize) -> (NodeId, Option<&'static str>) {
    if matches!(child_kind, "ParmVarDecl" | "ParmDecl") {
        if let Some(params) = attach.params {
            return (params, None);
        }
    }
    if let Some(init) = attach.init {
        return (init, Some("value"));
    }
    if let Some(arguments) = attach.arguments {
        return if index == 0 { (attach.node, Some("function")) } else { (arguments, None) };
    }
    let field = match &attach.kind {
        NodeKind::FunctionDefinition if child_kind == "CompoundStmt" => Some("body"),
        NodeKind::AssignmentExpression | NodeKind::BinaryExpression => {
            if index == 0 { Some("left") } else { Some("right") }
        }
        NodeKind::PointerExpression | NodeKind::UnaryExpression | NodeKind::UpdateExpression => Some("argument"),
        NodeKind::FieldExpression => Some("argument"),
        NodeKind::SubscriptExpression => {
            if index == 0 { Some("argument") } else { Some("index") }
        }
        NodeKind::IfStatement => match index {
            0 => Some("condition"),
            1 => Some("consequence"),
            _ => Some("alternative"),
        },
        NodeKind::WhileStatement => {
            if index == 0 { Some("condition") } else { Some("body") }
        }
        NodeKind::DoStatement => {
            if index == 0 { Some("body") } else { Some("condition") }
        }
        NodeKind::ForStatement if index + 1 == count => Some("body"),
        _ => None,
    };
    (attach.node, field)
}

/// Operator spelled between the children of a binary or unary cursor.
fn operator_text(source: &str, outer: &Range<usize>, children: &[Range<usize>]) -> Option<String> {
    let text = match children {
        [lhs, rhs, ..] => source.get(lhs.end..rhs.start)?,
        [only] if only.start > outer.start => source.get(outer.start..only.start)?,
        [only] => source.get(only.end..outer.end)?,
        [] => return None,
    };
    let op = text.trim().trim_matches(|c: char| c == '(' || c == ')').trim();
    (!op.is_empty()).then(|| op.to_string())
}

pub fn is_system_entity(entity: &Entity) -> bool {
    if let Some(loc) = entity.get_location() {
        if loc.is_in_system_header() {
            return true;
        }
        if !loc.is_in_main_file() {
            return true;
        }
        let path = loc.get_file_location().file.map(|f| f.get_path()).unwrap_or_default();
        let path = path.to_string_lossy();
        path.contains("/usr/include/") || path.contains("/usr/lib/") || path.contains("/usr/local/include/")
    } else {
        false
    }
}

fn entity_range(entity: &Entity) -> Option<Range<usize>> {
    let range = entity.get_range()?;
    let start = range.get_start().get_file_location().offset as usize;
    let end = range.get_end().get_file_location().offset as usize;
    (start <= end).then_some(start..end)
}

fn entity_span(entity: &Entity) -> Span {
    let Some(range) = entity.get_range() else {
        return Span::default();
    };
    let start = range.get_start().get_file_location();
    let end = range.get_end().get_file_location();
    Span {
        start: Position::new(start.line.saturating_sub(1) as usize, start.column.saturating_sub(1) as usize),
        end: Position::new(end.line.saturating_sub(1) as usize, end.column.saturating_sub(1) as usize),
    }
}

fn process_entity(entity: Entity, parent: Option<NodeId>, field: Option<&'static str>, b: &mut TreeBuilder) {
    let raw_kind = format!("{:?}", entity.get_kind());
    let children: Vec<Entity> = entity
        .get_children()
        .into_iter()
        .filter(|c| c.get_kind() != EntityKind::TypeRef && !is_system_entity(c))
        .collect();

    if NodeKind::is_clang_transparent(&raw_kind) {
        for child in children {
            process_entity(child, parent, field, b);
        }
        return;
    }

    let range = entity_range(&entity);
    let opcode = match entity.get_kind() {
        EntityKind::BinaryOperator | EntityKind::UnaryOperator | EntityKind::CompoundAssignOperator => {
            let child_ranges: Vec<Range<usize>> = children.iter().filter_map(entity_range).collect();
            range.as_ref().and_then(|outer| operator_text(b.source(), outer, &child_ranges))
        }
        _ => None,
    };
    let facts = ClangFacts {
        kind: raw_kind,
        name: entity.get_name(),
        type_name: entity.get_type().map(|t| t.get_display_name()),
        opcode,
        has_init: entity.get_kind() == EntityKind::VarDecl && !children.is_empty(),
        has_body: children.iter().any(|c| c.get_kind() == EntityKind::CompoundStmt),
        range,
        span: entity_span(&entity),
    };

    let attach = add_clang_node(b, parent, field, &facts);
    let count = children.len();
    for (index, child) in children.into_iter().enumerate() {
        let child_kind = format!("{:?}", child.get_kind());
        let (child_parent, child_field) = attach_child(&attach, &child_kind, index, count);
        process_entity(child, Some(child_parent), child_field, b);
    }
}

/// In-process libclang, loaded at runtime. Unavailable when no libclang
/// shared library can be found.
pub struct LibclangBackend;

impl ParserBackend for LibclangBackend {
    fn name(&self) -> &'static str {
        "libclang"
    }

    fn parse(&self, source: &str) -> Result<SyntaxTree> {
        let _guard = CLANG_LOCK
            .lock()
            .map_err(|e| ScanError::Backend { backend: "libclang", message: e.to_string() })?;
        let clang = clang::Clang::new()
            .map_err(|message| ScanError::BackendUnavailable { backend: "libclang", message })?;
        let index = Index::new(&clang, false, false);
        let unsaved = [Unsaved::new("input.c", source)];
        let tu = index
            .parser("input.c")
            .arguments(&["-x", "c", "-std=c11"])
            .unsaved(&unsaved)
            .detailed_preprocessing_record(true)
            .parse()
            .map_err(|e| ScanError::Backend { backend: "libclang", message: e.to_string() })?;

        let mut builder = TreeBuilder::new(source, "libclang");
        let root = tu.get_entity();
        let facts = ClangFacts {
            kind: "TranslationUnit".to_string(),
            range: Some(0..source.len()),
            ..ClangFacts::default()
        };
        let attach = add_clang_node(&mut builder, None, None, &facts);
        for child in root.get_children().into_iter().filter(|c| !is_system_entity(c)) {
            process_entity(child, Some(attach.node), None, &mut builder);
        }
        debug!("libclang produced {} nodes", builder.len());
        Ok(builder.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_clang_type_spellings() {
        assert_eq!(split_type("const char *"), ("char".to_string(), true, false));
        assert_eq!(split_type("int [10]"), ("int".to_string(), false, true));
        assert_eq!(split_type("unsigned long"), ("unsigned long".to_string(), false, false));
        assert_eq!(type_kind("unsigned long"), NodeKind::SizedTypeSpecifier);
        assert_eq!(type_kind("struct node"), NodeKind::StructSpecifier);
        assert_eq!(type_kind("size_t"), NodeKind::TypeIdentifier);
    }

    #[test]
    fn recovers_operators_from_source() {
        let src = "x = y + 1";
        assert_eq!(operator_text(src, &(0..9), &[0..1, 4..9]), Some("=".to_string()));
        assert_eq!(operator_text("*p", &(0..2), &[1..2]), Some("*".to_string()));
        assert_eq!(operator_text("i++", &(0..3), &[0..1]), Some("++".to_string()));
    }

    #[test]
    fn synthesizes_tree_sitter_shape_for_var_decl() {
        let src = "int *p = 0;";
        let mut b = TreeBuilder::new(src, "test");
        let root = add_clang_node(&mut b, None, None, &ClangFacts { kind: "TranslationUnitDecl".into(), ..Default::default() });
        let var = add_clang_node(
            &mut b,
            Some(root.node),
            None,
            &ClangFacts {
                kind: "VarDecl".into(),
                name: Some("p".into()),
                type_name: Some("int *".into()),
                has_init: true,
                range: Some(0..10),
                ..Default::default()
            },
        );
        let (parent, field) = attach_child(&var, "IntegerLiteral", 0, 1);
        add_clang_node(&mut b, Some(parent), field, &ClangFacts { kind: "IntegerLiteral".into(), range: Some(9..10), ..Default::default() });
        let tree = b.finish();

        let decls = tree.declarations();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "p");
        assert!(decls[0].is_pointer);
        assert_eq!(decls[0].declared_type, "int");
        assert_eq!(decls[0].initializer.map(|n| n.text()), Some("0"));
    }

    #[test]
    fn libclang_backend_is_optional() {
        // Either libclang is installed and parses, or the backend reports itself unavailable
        match LibclangBackend.parse("int main(void) { return 0; }") {
            Ok(tree) => assert_eq!(tree.root().kind(), &NodeKind::TranslationUnit),
            Err(ScanError::BackendUnavailable { .. }) | Err(ScanError::Backend { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
}
