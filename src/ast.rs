//! Normalized C syntax tree shared by every parsing backend.
//!
//! Nodes live in an arena owned by [`SyntaxTree`] and refer to each other by
//! [`NodeId`]; the parent link is an index and never owns its target.

use std::ops::Range;

use crate::types::Position;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    TranslationUnit,
    FunctionDefinition,
    Declaration,
    InitDeclarator,
    PointerDeclarator,
    ArrayDeclarator,
    FunctionDeclarator,
    ParameterList,
    ParameterDeclaration,
    Identifier,
    FieldIdentifier,
    TypeIdentifier,
    PrimitiveType,
    SizedTypeSpecifier,
    StructSpecifier,
    UnionSpecifier,
    EnumSpecifier,
    Enumerator,
    FieldDeclarationList,
    FieldDeclaration,
    StorageClassSpecifier,
    TypeQualifier,
    TypeDefinition,
    CompoundStatement,
    ExpressionStatement,
    IfStatement,
    ElseClause,
    ForStatement,
    WhileStatement,
    DoStatement,
    SwitchStatement,
    CaseStatement,
    BreakStatement,
    ContinueStatement,
    ReturnStatement,
    GotoStatement,
    LabeledStatement,
    CallExpression,
    ArgumentList,
    AssignmentExpression,
    BinaryExpression,
    UnaryExpression,
    UpdateExpression,
    PointerExpression,
    FieldExpression,
    SubscriptExpression,
    CastExpression,
    SizeofExpression,
    ConditionalExpression,
    ParenthesizedExpression,
    CommaExpression,
    InitializerList,
    NumberLiteral,
    StringLiteral,
    ConcatenatedString,
    CharLiteral,
    True,
    False,
    Null,
    PreprocInclude,
    SystemLibString,
    Comment,
    Error,
    Unknown(String),
}

impl NodeKind {
    /// Map a tree-sitter-c node kind onto the shared vocabulary.
    pub fn from_tree_sitter(kind: &str) -> NodeKind {
        match kind {
            "translation_unit" => NodeKind::TranslationUnit,
            "function_definition" => NodeKind::FunctionDefinition,
            "declaration" => NodeKind::Declaration,
            "init_declarator" => NodeKind::InitDeclarator,
            "pointer_declarator" => NodeKind::PointerDeclarator,
            "array_declarator" => NodeKind::ArrayDeclarator,
            "function_declarator" => NodeKind::FunctionDeclarator,
            "parameter_list" => NodeKind::ParameterList,
            "parameter_declaration" => NodeKind::ParameterDeclaration,
            "identifier" => NodeKind::Identifier,
            "field_identifier" => NodeKind::FieldIdentifier,
            "type_identifier" => NodeKind::TypeIdentifier,
            "primitive_type" => NodeKind::PrimitiveType,
            "sized_type_specifier" => NodeKind::SizedTypeSpecifier,
            "struct_specifier" => NodeKind::StructSpecifier,
            "union_specifier" => NodeKind::UnionSpecifier,
            "enum_specifier" => NodeKind::EnumSpecifier,
            "enumerator" => NodeKind::Enumerator,
            "field_declaration_list" => NodeKind::FieldDeclarationList,
            "field_declaration" => NodeKind::FieldDeclaration,
            "storage_class_specifier" => NodeKind::StorageClassSpecifier,
            "type_qualifier" => NodeKind::TypeQualifier,
            "type_definition" => NodeKind::TypeDefinition,
            "compound_statement" => NodeKind::CompoundStatement,
            "expression_statement" => NodeKind::ExpressionStatement,
            "if_statement" => NodeKind::IfStatement,
            "else_clause" => NodeKind::ElseClause,
            "for_statement" => NodeKind::ForStatement,
            "while_statement" => NodeKind::WhileStatement,
            "do_statement" => NodeKind::DoStatement,
            "switch_statement" => NodeKind::SwitchStatement,
            "case_statement" => NodeKind::CaseStatement,
            "break_statement" => NodeKind::BreakStatement,
            "continue_statement" => NodeKind::ContinueStatement,
            "return_statement" => NodeKind::ReturnStatement,
            "goto_statement" => NodeKind::GotoStatement,
            "labeled_statement" => NodeKind::LabeledStatement,
            "call_expression" => NodeKind::CallExpression,
            "argument_list" => NodeKind::ArgumentList,
            "assignment_expression" => NodeKind::AssignmentExpression,
            "binary_expression" => NodeKind::BinaryExpression,
            "unary_expression" => NodeKind::UnaryExpression,
            "update_expression" => NodeKind::UpdateExpression,
            "pointer_expression" => NodeKind::PointerExpression,
            "field_expression" => NodeKind::FieldExpression,
            "subscript_expression" => NodeKind::SubscriptExpression,
            "cast_expression" => NodeKind::CastExpression,
            "sizeof_expression" => NodeKind::SizeofExpression,
            "conditional_expression" => NodeKind::ConditionalExpression,
            "parenthesized_expression" => NodeKind::ParenthesizedExpression,
            "comma_expression" => NodeKind::CommaExpression,
            "initializer_list" => NodeKind::InitializerList,
            "number_literal" => NodeKind::NumberLiteral,
            "string_literal" => NodeKind::StringLiteral,
            "concatenated_string" => NodeKind::ConcatenatedString,
            "char_literal" => NodeKind::CharLiteral,
            "true" => NodeKind::True,
            "false" => NodeKind::False,
            "null" => NodeKind::Null,
            "preproc_include" => NodeKind::PreprocInclude,
            "system_lib_string" => NodeKind::SystemLibString,
            "comment" => NodeKind::Comment,
            "ERROR" => NodeKind::Error,
            other => NodeKind::Unknown(other.to_string()),
        }
    }

    /// Map a clang cursor or JSON dump kind onto the shared vocabulary.
    /// Both the libclang spellings (`ParmDecl`, `MemberRefExpr`) and the
    /// `-ast-dump=json` spellings (`ParmVarDecl`, `MemberExpr`) are accepted.
    pub fn from_clang(kind: &str) -> NodeKind {
        match kind {
            "TranslationUnitDecl" | "TranslationUnit" => NodeKind::TranslationUnit,
            "FunctionDecl" => NodeKind::FunctionDefinition,
            "VarDecl" => NodeKind::Declaration,
            "ParmVarDecl" | "ParmDecl" => NodeKind::ParameterDeclaration,
            "FieldDecl" => NodeKind::FieldDeclaration,
            "RecordDecl" | "StructDecl" => NodeKind::StructSpecifier,
            "UnionDecl" => NodeKind::UnionSpecifier,
            "EnumDecl" => NodeKind::EnumSpecifier,
            "EnumConstantDecl" => NodeKind::Enumerator,
            "TypedefDecl" => NodeKind::TypeDefinition,
            "TypeRef" => NodeKind::TypeIdentifier,
            "CompoundStmt" => NodeKind::CompoundStatement,
            "NullStmt" => NodeKind::ExpressionStatement,
            "IfStmt" => NodeKind::IfStatement,
            "ForStmt" => NodeKind::ForStatement,
            "WhileStmt" => NodeKind::WhileStatement,
            "DoStmt" => NodeKind::DoStatement,
            "SwitchStmt" => NodeKind::SwitchStatement,
            "CaseStmt" | "DefaultStmt" => NodeKind::CaseStatement,
            "BreakStmt" => NodeKind::BreakStatement,
            "ContinueStmt" => NodeKind::ContinueStatement,
            "ReturnStmt" => NodeKind::ReturnStatement,
            "GotoStmt" | "IndirectGotoStmt" => NodeKind::GotoStatement,
            "LabelStmt" => NodeKind::LabeledStatement,
            "CallExpr" => NodeKind::CallExpression,
            "BinaryOperator" => NodeKind::BinaryExpression,
            "CompoundAssignOperator" => NodeKind::AssignmentExpression,
            "UnaryOperator" => NodeKind::UnaryExpression,
            "ConditionalOperator" | "BinaryConditionalOperator" => NodeKind::ConditionalExpression,
            "ParenExpr" => NodeKind::ParenthesizedExpression,
            "CStyleCastExpr" => NodeKind::CastExpression,
            "UnaryExprOrTypeTraitExpr" => NodeKind::SizeofExpression,
            "MemberExpr" | "MemberRefExpr" => NodeKind::FieldExpression,
            "ArraySubscriptExpr" => NodeKind::SubscriptExpression,
            "DeclRefExpr" => NodeKind::Identifier,
            "IntegerLiteral" | "FloatingLiteral" => NodeKind::NumberLiteral,
            "StringLiteral" => NodeKind::StringLiteral,
            "CharacterLiteral" => NodeKind::CharLiteral,
            "InitListExpr" => NodeKind::InitializerList,
            "InclusionDirective" => NodeKind::PreprocInclude,
            other => NodeKind::Unknown(other.to_string()),
        }
    }

    /// Wrapper kinds the clang front ends insert that have no counterpart in
    /// the shared vocabulary; converters splice their children into the parent.
    pub fn is_clang_transparent(kind: &str) -> bool {
        matches!(
            kind,
            "ImplicitCastExpr"
                | "UnexposedExpr"
                | "ConstantExpr"
                | "ExprWithCleanups"
                | "FullExpr"
                | "DeclStmt"
                | "UnexposedStmt"
                | "ImplicitValueInitExpr"
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::TranslationUnit => "translation_unit",
            NodeKind::FunctionDefinition => "function_definition",
            NodeKind::Declaration => "declaration",
            NodeKind::InitDeclarator => "init_declarator",
            NodeKind::PointerDeclarator => "pointer_declarator",
            NodeKind::ArrayDeclarator => "array_declarator",
            NodeKind::FunctionDeclarator => "function_declarator",
            NodeKind::ParameterList => "parameter_list",
            NodeKind::ParameterDeclaration => "parameter_declaration",
            NodeKind::Identifier => "identifier",
            NodeKind::FieldIdentifier => "field_identifier",
            NodeKind::TypeIdentifier => "type_identifier",
            NodeKind::PrimitiveType => "primitive_type",
            NodeKind::SizedTypeSpecifier => "sized_type_specifier",
            NodeKind::StructSpecifier => "struct_specifier",
            NodeKind::UnionSpecifier => "union_specifier",
            NodeKind::EnumSpecifier => "enum_specifier",
            NodeKind::Enumerator => "enumerator",
            NodeKind::FieldDeclarationList => "field_declaration_list",
            NodeKind::FieldDeclaration => "field_declaration",
            NodeKind::StorageClassSpecifier => "storage_class_specifier",
            NodeKind::TypeQualifier => "type_qualifier",
            NodeKind::TypeDefinition => "type_definition",
            NodeKind::CompoundStatement => "compound_statement",
            NodeKind::ExpressionStatement => "expression_statement",
            NodeKind::IfStatement => "if_statement",
            NodeKind::ElseClause => "else_clause",
            NodeKind::ForStatement => "for_statement",
            NodeKind::WhileStatement => "while_statement",
            NodeKind::DoStatement => "do_statement",
            NodeKind::SwitchStatement => "switch_statement",
            NodeKind::CaseStatement => "case_statement",
            NodeKind::BreakStatement => "break_statement",
            NodeKind::ContinueStatement => "continue_statement",
            NodeKind::ReturnStatement => "return_statement",
            NodeKind::GotoStatement => "goto_statement",
            NodeKind::LabeledStatement => "labeled_statement",
            NodeKind::CallExpression => "call_expression",
            NodeKind::ArgumentList => "argument_list",
            NodeKind::AssignmentExpression => "assignment_expression",
            NodeKind::BinaryExpression => "binary_expression",
            NodeKind::UnaryExpression => "unary_expression",
            NodeKind::UpdateExpression => "update_expression",
            NodeKind::PointerExpression => "pointer_expression",
            NodeKind::FieldExpression => "field_expression",
            NodeKind::SubscriptExpression => "subscript_expression",
            NodeKind::CastExpression => "cast_expression",
            NodeKind::SizeofExpression => "sizeof_expression",
            NodeKind::ConditionalExpression => "conditional_expression",
            NodeKind::ParenthesizedExpression => "parenthesized_expression",
            NodeKind::CommaExpression => "comma_expression",
            NodeKind::InitializerList => "initializer_list",
            NodeKind::NumberLiteral => "number_literal",
            NodeKind::StringLiteral => "string_literal",
            NodeKind::ConcatenatedString => "concatenated_string",
            NodeKind::CharLiteral => "char_literal",
            NodeKind::True => "true",
            NodeKind::False => "false",
            NodeKind::Null => "null",
            NodeKind::PreprocInclude => "preproc_include",
            NodeKind::SystemLibString => "system_lib_string",
            NodeKind::Comment => "comment",
            NodeKind::Error => "ERROR",
            NodeKind::Unknown(raw) => raw,
        }
    }

    pub fn is_type(&self) -> bool {
        matches!(
            self,
            NodeKind::PrimitiveType
                | NodeKind::SizedTypeSpecifier
                | NodeKind::TypeIdentifier
                | NodeKind::StructSpecifier
                | NodeKind::UnionSpecifier
                | NodeKind::EnumSpecifier
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeText {
    Slice(Range<usize>),
    Owned(String),
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    text: NodeText,
    span: Span,
    field: Option<&'static str>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    named_children: Vec<NodeId>,
}

/// Immutable tree for one file. Index 0 is always the translation unit.
#[derive(Debug, Clone)]
pub struct SyntaxTree {
    source: String,
    nodes: Vec<NodeData>,
    backend: &'static str,
}

impl SyntaxTree {
    /// The sentinel returned when no backend could produce a tree.
    pub fn empty() -> Self {
        let mut builder = TreeBuilder::new("", "none");
        builder.add(None, NodeKind::TranslationUnit, NodeText::Owned(String::new()), Span::default(), true, None);
        builder.finish()
    }

    pub fn root(&self) -> Node<'_> {
        Node { tree: self, id: NodeId(0) }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.first().is_none_or(|root| root.children.is_empty())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn node(&self, id: NodeId) -> Node<'_> {
        Node { tree: self, id }
    }

    /// Every node of `kind` in depth-first order.
    pub fn find_all(&self, kind: &NodeKind) -> Vec<Node<'_>> {
        let mut found = Vec::new();
        self.root().walk(|node| {
            if node.kind() == kind {
                found.push(node);
            }
        });
        found
    }

    pub fn declarations(&self) -> Vec<DeclarationInfo<'_>> {
        let mut decls = Vec::new();
        self.root().walk(|node| match node.kind() {
            NodeKind::Declaration | NodeKind::ParameterDeclaration => {
                collect_declarators(node, &mut decls);
            }
            _ => {}
        });
        decls
    }

    pub fn calls(&self) -> Vec<CallInfo<'_>> {
        self.find_all(&NodeKind::CallExpression)
            .into_iter()
            .filter_map(|node| {
                let callee = node
                    .child_by_field("function")
                    .or_else(|| node.named_children().next())?;
                if callee.kind() != &NodeKind::Identifier {
                    return None;
                }
                let arguments = node
                    .child_by_field("arguments")
                    .or_else(|| node.child_by_kind(&NodeKind::ArgumentList))
                    .map(|args| args.named_children().filter(|a| a.kind() != &NodeKind::Comment).collect())
                    .unwrap_or_else(|| node.named_children().skip(1).collect());
                Some(CallInfo { name: callee.text(), position: node.start(), node, arguments })
            })
            .collect()
    }

    pub fn includes(&self) -> Vec<IncludeInfo> {
        self.find_all(&NodeKind::PreprocInclude)
            .into_iter()
            .filter_map(|node| {
                let path = node
                    .child_by_field("path")
                    .map(|p| p.text().trim().to_string())
                    .or_else(|| {
                        let text = node.text();
                        let start = text.find(['<', '"'])?;
                        Some(text[start..].trim().to_string())
                    })?;
                let angle = path.starts_with('<');
                let header = path.trim_matches(|c| c == '<' || c == '>' || c == '"').to_string();
                (!header.is_empty()).then_some(IncludeInfo { header, angle, line: node.start().line })
            })
            .collect()
    }
}

fn collect_declarators<'t>(decl: Node<'t>, out: &mut Vec<DeclarationInfo<'t>>) {
    let type_node = decl
        .child_by_field("type")
        .or_else(|| decl.named_children().find(|c| c.kind().is_type()));
    let declared_type = type_node.map(|t| t.text().trim().to_string()).unwrap_or_default();
    let is_static = decl
        .children()
        .any(|c| c.kind() == &NodeKind::StorageClassSpecifier && c.text() == "static");
    let is_parameter = decl.kind() == &NodeKind::ParameterDeclaration;

    for declarator in decl.children_by_field("declarator") {
        let mut info = DeclarationInfo {
            name: "",
            declared_type: declared_type.clone(),
            is_pointer: false,
            is_array: false,
            is_parameter,
            is_static,
            initializer: None,
            position: declarator.start(),
        };
        let mut current = Some(declarator);
        while let Some(node) = current {
            current = match node.kind() {
                NodeKind::InitDeclarator => {
                    info.initializer = node.child_by_field("value");
                    node.child_by_field("declarator")
                }
                NodeKind::PointerDeclarator => {
                    info.is_pointer = true;
                    node.child_by_field("declarator")
                }
                NodeKind::ArrayDeclarator => {
                    info.is_array = true;
                    node.child_by_field("declarator")
                }
                NodeKind::Identifier => {
                    info.name = node.text();
                    info.position = node.start();
                    None
                }
                // Prototypes and anything unexpected are not variables
                _ => None,
            };
        }
        if !info.name.is_empty() {
            out.push(info);
        }
    }
}

/// A declared variable or parameter found in the tree.
#[derive(Debug, Clone)]
pub struct DeclarationInfo<'t> {
    pub name: &'t str,
    pub declared_type: String,
    pub is_pointer: bool,
    pub is_array: bool,
    pub is_parameter: bool,
    pub is_static: bool,
    pub initializer: Option<Node<'t>>,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct CallInfo<'t> {
    pub name: &'t str,
    pub position: Position,
    pub node: Node<'t>,
    pub arguments: Vec<Node<'t>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeInfo {
    pub header: String,
    pub angle: bool,
    pub line: usize,
}

#[derive(Clone, Copy)]
pub struct Node<'t> {
    tree: &'t SyntaxTree,
    id: NodeId,
}

impl std::fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.kind().as_str(), self.start().line, self.start().column)
    }
}

impl<'t> Node<'t> {
    fn data(&self) -> &'t NodeData {
        &self.tree.nodes[self.id.0]
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &'t NodeKind {
        &self.data().kind
    }

    pub fn text(&self) -> &'t str {
        match &self.data().text {
            NodeText::Slice(range) => self.tree.source.get(range.clone()).unwrap_or(""),
            NodeText::Owned(text) => text,
        }
    }

    pub fn span(&self) -> Span {
        self.data().span
    }

    pub fn start(&self) -> Position {
        self.data().span.start
    }

    pub fn field(&self) -> Option<&'static str> {
        self.data().field
    }

    pub fn parent(&self) -> Option<Node<'t>> {
        self.data().parent.map(|id| self.tree.node(id))
    }

    pub fn children(&self) -> impl Iterator<Item = Node<'t>> + use<'t> {
        let tree = self.tree;
        self.data().children.iter().map(move |&id| tree.node(id))
    }

    pub fn named_children(&self) -> impl Iterator<Item = Node<'t>> + use<'t> {
        let tree = self.tree;
        self.data().named_children.iter().map(move |&id| tree.node(id))
    }

    pub fn child_by_field(&self, field: &str) -> Option<Node<'t>> {
        self.children().find(|c| c.field() == Some(field))
    }

    pub fn children_by_field<'a>(&self, field: &'a str) -> impl Iterator<Item = Node<'t>> + use<'t, 'a> {
        self.children().filter(move |c| c.field() == Some(field))
    }

    pub fn child_by_kind(&self, kind: &NodeKind) -> Option<Node<'t>> {
        self.named_children().find(|c| c.kind() == kind)
    }

    pub fn ancestor(&self, kind: &NodeKind) -> Option<Node<'t>> {
        let mut current = self.parent();
        while let Some(node) = current {
            if node.kind() == kind {
                return Some(node);
            }
            current = node.parent();
        }
        None
    }

    /// Depth-first pre-order walk over named children, falling back to all
    /// children for nodes that have no named ones.
    pub fn walk<F: FnMut(Node<'t>)>(&self, mut visit: F) {
        let mut stack = vec![*self];
        while let Some(node) = stack.pop() {
            visit(node);
            let data = node.data();
            let next = if data.named_children.is_empty() { &data.children } else { &data.named_children };
            stack.extend(next.iter().rev().map(|&id| self.tree.node(id)));
        }
    }

    /// Whether any node below this one satisfies `pred`.
    pub fn any_descendant<F: Fn(Node<'t>) -> bool>(&self, pred: F) -> bool {
        let mut found = false;
        self.walk(|node| {
            if node.id != self.id && pred(node) {
                found = true;
            }
        });
        found
    }
}

/// Incremental arena construction used by the parsing backends.
pub struct TreeBuilder {
    tree: SyntaxTree,
}

impl TreeBuilder {
    pub fn new(source: &str, backend: &'static str) -> Self {
        TreeBuilder { tree: SyntaxTree { source: source.to_string(), nodes: Vec::new(), backend } }
    }

    pub fn source(&self) -> &str {
        &self.tree.source
    }

    /// Text for a byte range, falling back to an owned copy of `fallback`
    /// when the range does not land on the source.
    pub fn slice_or(&self, range: Range<usize>, fallback: &str) -> NodeText {
        if range.start <= range.end && self.tree.source.get(range.clone()).is_some() {
            NodeText::Slice(range)
        } else {
            NodeText::Owned(fallback.to_string())
        }
    }

    pub fn add(
        &mut self,
        parent: Option<NodeId>,
        kind: NodeKind,
        text: NodeText,
        span: Span,
        named: bool,
        field: Option<&'static str>,
    ) -> NodeId {
        let id = NodeId(self.tree.nodes.len());
        self.tree.nodes.push(NodeData {
            kind,
            text,
            span,
            field,
            parent,
            children: Vec::new(),
            named_children: Vec::new(),
        });
        if let Some(parent) = parent {
            let data = &mut self.tree.nodes[parent.0];
            data.children.push(id);
            if named {
                data.named_children.push(id);
            }
        }
        id
    }

    pub fn len(&self) -> usize {
        self.tree.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.nodes.is_empty()
    }

    pub fn finish(self) -> SyntaxTree {
        self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SyntaxTree {
        // int *p = 0; with a nested call
        let src = "int *p = f(1);";
        let mut b = TreeBuilder::new(src, "test");
        let span = Span::default();
        let root = b.add(None, NodeKind::TranslationUnit, b.slice_or(0..src.len(), ""), span, true, None);
        let decl = b.add(Some(root), NodeKind::Declaration, b.slice_or(0..14, ""), span, true, None);
        b.add(Some(decl), NodeKind::PrimitiveType, b.slice_or(0..3, ""), span, true, Some("type"));
        let init = b.add(Some(decl), NodeKind::InitDeclarator, b.slice_or(4..13, ""), span, true, Some("declarator"));
        let ptr = b.add(Some(init), NodeKind::PointerDeclarator, b.slice_or(4..6, ""), span, true, Some("declarator"));
        b.add(Some(ptr), NodeKind::Identifier, b.slice_or(5..6, ""), span, true, Some("declarator"));
        let call = b.add(Some(init), NodeKind::CallExpression, b.slice_or(9..13, ""), span, true, Some("value"));
        b.add(Some(call), NodeKind::Identifier, b.slice_or(9..10, ""), span, true, Some("function"));
        let args = b.add(Some(call), NodeKind::ArgumentList, b.slice_or(10..13, ""), span, true, Some("arguments"));
        b.add(Some(args), NodeKind::NumberLiteral, b.slice_or(11..12, ""), span, true, None);
        b.add(Some(decl), NodeKind::Unknown(";".into()), b.slice_or(13..14, ""), span, false, None);
        b.finish()
    }

    #[test]
    fn sentinel_is_empty_translation_unit() {
        let tree = SyntaxTree::empty();
        assert!(tree.is_empty());
        assert_eq!(tree.root().kind(), &NodeKind::TranslationUnit);
        assert!(tree.declarations().is_empty());
    }

    #[test]
    fn extracts_declarations_and_calls() {
        let tree = sample();
        let decls = tree.declarations();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "p");
        assert_eq!(decls[0].declared_type, "int");
        assert!(decls[0].is_pointer);
        assert_eq!(decls[0].initializer.map(|n| n.text()), Some("f(1)"));

        let calls = tree.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "f");
        assert_eq!(calls[0].arguments.len(), 1);
        assert_eq!(calls[0].arguments[0].text(), "1");
    }

    #[test]
    fn walks_named_children_and_finds_ancestors() {
        let tree = sample();
        let mut kinds = Vec::new();
        tree.root().walk(|n| kinds.push(n.kind().as_str().to_string()));
        assert!(!kinds.contains(&";".to_string()));
        let number = tree.find_all(&NodeKind::NumberLiteral)[0];
        assert_eq!(number.ancestor(&NodeKind::Declaration).map(|d| d.text()), Some("int *p = f(1);"));
        assert!(tree.root().any_descendant(|n| n.kind() == &NodeKind::CallExpression));
    }

    #[test]
    fn maps_backend_kinds_to_one_vocabulary() {
        assert_eq!(NodeKind::from_clang("ParmDecl"), NodeKind::from_clang("ParmVarDecl"));
        assert_eq!(NodeKind::from_clang("CallExpr"), NodeKind::from_tree_sitter("call_expression"));
        assert_eq!(NodeKind::from_clang("GCCAsmStmt"), NodeKind::Unknown("GCCAsmStmt".into()));
        assert_eq!(NodeKind::Unknown("GCCAsmStmt".into()).as_str(), "GCCAsmStmt");
    }
}
