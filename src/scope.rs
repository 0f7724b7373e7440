//! Forward, line-based symbol tracking over masked source.
//!
//! One pass builds every variable with its declaration facts, the history of
//! values assigned to it, each place it is referenced, the function frames and
//! the heap allocations. Detectors read the resulting [`SymbolState`].

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::graph_builder::GlobalSymbolTable;
use crate::types::{
    AssignmentKind, Position, Space, SymbolicValue, ValueChange, VariableDeclaration, VariableState,
};
use crate::utils::{self, SourceText};

static FUNCTION_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*((?:[A-Za-z_]\w*[\s\*]+)+?)\**\s*([A-Za-z_]\w*)\s*\(").unwrap()
});
static LOOP_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:for|while)\s*\(|^do\b").unwrap());
static STATEMENT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:else\b|do\b|default\s*:|case\b[^:]*:)\s*").unwrap());
static LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z_]\w*)\s*:[^:]").unwrap());
static TYPEDEF_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Za-z_]\w*)\s*(?:\[[^\]]*\])?\s*$").unwrap());
static TYPEDEF_FUNCTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(\s*\*\s*([A-Za-z_]\w*)\s*\)").unwrap());
static TYPEDEF_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\}\s*([A-Za-z_]\w*)\s*;").unwrap());
static STRUCT_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:typedef\s+)?(?:struct|union)\s+([A-Za-z_]\w*)\s*\{").unwrap());
static FUNCTION_POINTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\(\s*\*+\s*([A-Za-z_]\w*)\s*\)\s*\(").unwrap());
static SIZEOF_TAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bsizeof\s*\(?\s*$").unwrap());
static MEMBER_WRITE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\.\s*[A-Za-z_]\w*\s*=[^=]").unwrap());
static SIMPLE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_]\w*$").unwrap());
static SLOT_WRITE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z_]\w*)\s*[\[\.]").unwrap());

const QUALIFIERS: &[&str] =
    &["static", "extern", "register", "auto", "const", "volatile", "inline", "restrict", "_Thread_local"];
const INTEGER_WORDS: &[&str] = &["unsigned", "signed", "short", "long", "int", "char"];
const BASE_TYPES: &[&str] = &[
    "int", "char", "float", "double", "void", "_Bool", "bool", "size_t", "ssize_t", "FILE", "wchar_t",
    "ptrdiff_t",
];
const SCANF_FAMILY: &[&str] = &["scanf", "fscanf", "sscanf"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Function,
    Block,
    Loop,
}

#[derive(Debug, Clone)]
struct Scope {
    kind: ScopeKind,
    vars: HashMap<String, usize>,
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Scope { kind, vars: HashMap::new() }
    }
}

/// One activation of a function body, from its header to its closing brace.
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub id: usize,
    pub function_name: String,
    pub start_line: usize,
    pub end_line: Option<usize>,
    pub vars: Vec<usize>,
}

impl StackFrame {
    pub fn contains_line(&self, line: usize) -> bool {
        line >= self.start_line && self.end_line.is_none_or(|end| line <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Declaration,
    Read,
    Write,
    ReadWrite,
    Deref,     // *v
    Arrow,     // v->f
    Index,     // v[i]
    AddressOf, // &v
}

impl Access {
    pub fn is_dereference(&self) -> bool {
        matches!(self, Access::Deref | Access::Arrow | Access::Index)
    }

    /// Accesses that read the variable's own value.
    pub fn is_use(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite | Access::Deref | Access::Arrow | Access::Index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub var: usize,
    pub pos: Position,
    pub access: Access,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub var: usize,
    pub line: usize,
    pub frame: usize,
    pub function: String,
    pub allocator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeKind {
    LocalAddress,
    Freed,
}

/// A `return` handing out memory that is invalid once the function exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnEscape {
    pub line: usize,
    pub function: String,
    pub variable: String,
    pub kind: EscapeKind,
}

/// Everything the forward pass learned about one file.
#[derive(Debug, Clone, Default)]
pub struct SymbolState {
    pub variables: Vec<VariableState>,
    pub references: Vec<Reference>,
    pub frames: Vec<StackFrame>,
    pub allocations: Vec<Allocation>,
    pub escapes: Vec<ReturnEscape>,
    pub globals: GlobalSymbolTable,
}

impl SymbolState {
    pub fn variable(&self, id: usize) -> &VariableState {
        &self.variables[id]
    }

    pub fn references_to(&self, id: usize) -> impl Iterator<Item = &Reference> {
        self.references.iter().filter(move |r| r.var == id)
    }

    /// The variable a name referred to on `line`, as resolved during the pass.
    pub fn variable_at(&self, name: &str, line: usize) -> Option<&VariableState> {
        self.references
            .iter()
            .filter(|r| r.pos.line == line)
            .map(|r| &self.variables[r.var])
            .find(|v| v.name() == name)
    }

    /// Value of variable `id` in effect just before (`line`, `column`).
    pub fn value_at(&self, id: usize, line: usize, column: usize) -> Option<&ValueChange> {
        self.variables.get(id)?.value_at(Position::new(line, column)).map(|(_, change)| change)
    }

    pub fn frame_at(&self, line: usize) -> Option<&StackFrame> {
        self.frames.iter().rev().find(|f| f.contains_line(line))
    }
}

/// Result of evaluating the right-hand side of an assignment.
#[derive(Debug, Clone)]
struct Assigned {
    value: SymbolicValue,
    space: Space,
    target: Option<usize>,
    target_frame: Option<usize>,
    allocator: Option<String>,
    callee: Option<String>,
}

impl Assigned {
    fn unknown() -> Self {
        Assigned {
            value: SymbolicValue::Unknown,
            space: Space::Unknown,
            target: None,
            target_frame: None,
            allocator: None,
            callee: None,
        }
    }

    fn of(value: SymbolicValue, space: Space) -> Self {
        Assigned { value, space, ..Assigned::unknown() }
    }
}

#[derive(Debug)]
struct Declarator {
    name: String,
    column: usize,
    is_pointer: bool,
    is_array: bool,
    is_function: bool,
    init: Option<(usize, String)>,
}

#[derive(Debug)]
struct ParsedDeclaration {
    base_type: String,
    is_static: bool,
    is_extern: bool,
    declarators: Vec<Declarator>,
}

pub struct ScopeTracker<'a> {
    text: &'a SourceText,
    scopes: Vec<Scope>,
    state: SymbolState,
    typedefs: HashSet<String>,
    current_frame: Option<usize>,
    variable_frame: Vec<Option<usize>>,
    pending_function: Option<(String, String, usize)>,
    init_depth: usize,
    typedef_open: bool,
}

/// Run the forward pass over a whole file.
pub fn track(text: &SourceText) -> SymbolState {
    ScopeTracker::new(text).run()
}

impl<'a> ScopeTracker<'a> {
    pub fn new(text: &'a SourceText) -> Self {
        ScopeTracker {
            text,
            scopes: vec![Scope::new(ScopeKind::Global)],
            state: SymbolState::default(),
            typedefs: HashSet::new(),
            current_frame: None,
            variable_frame: Vec::new(),
            pending_function: None,
            init_depth: 0,
            typedef_open: false,
        }
    }

    pub fn run(mut self) -> SymbolState {
        for line in 0..self.text.len() {
            self.process_line(line);
        }
        self.state.globals.propagate_dangerous();
        debug!(
            "tracked {} variables, {} references, {} frames",
            self.state.variables.len(),
            self.state.references.len(),
            self.state.frames.len()
        );
        self.state
    }

    /// Innermost visible variable called `name`.
    pub fn resolve(&self, name: &str) -> Option<&VariableState> {
        self.resolve_id(name).map(|id| &self.state.variables[id])
    }

    fn resolve_id(&self, name: &str) -> Option<usize> {
        self.scopes.iter().rev().find_map(|s| s.vars.get(name).copied())
    }

    fn scope_kind(&self) -> ScopeKind {
        self.scopes.last().map(|s| s.kind).unwrap_or(ScopeKind::Global)
    }

    fn current_function(&self) -> Option<String> {
        self.current_frame.map(|f| self.state.frames[f].function_name.clone())
    }

    fn process_line(&mut self, line: usize) {
        let masked = self.text.masked[line].clone();
        if masked.trim().is_empty() {
            return;
        }
        self.learn_types(&masked);

        // Scope braces become statement separators, initializer braces stay
        let mut bytes = masked.clone().into_bytes();
        let mut events: Vec<(usize, bool)> = Vec::new();
        for col in 0..bytes.len() {
            match bytes[col] {
                b'{' => {
                    if self.init_depth > 0 || self.opens_initializer(&masked, col, line) {
                        self.init_depth += 1;
                    } else {
                        events.push((col, true));
                        bytes[col] = b';';
                    }
                }
                b'}' => {
                    if self.init_depth > 0 {
                        self.init_depth -= 1;
                    } else {
                        events.push((col, false));
                        bytes[col] = b';';
                    }
                }
                _ => {}
            }
        }
        let content = String::from_utf8(bytes).unwrap_or_else(|_| masked.clone());

        let event_cols: HashSet<usize> = events.iter().map(|e| e.0).collect();
        let content_start = masked
            .char_indices()
            .find(|(c, ch)| !ch.is_whitespace() && !event_cols.contains(c))
            .map(|(c, _)| c);
        let first_open = events.iter().find(|e| e.1).map(|e| e.0);
        let boundary = content_start.unwrap_or(usize::MAX).min(first_open.unwrap_or(usize::MAX));

        let mut trailing_closers = 0;
        for &(col, open) in &events {
            if !open {
                if col < boundary {
                    self.pop_scope(line);
                } else {
                    trailing_closers += 1;
                }
            }
        }

        let header = content.trim_start_matches(|c: char| c.is_whitespace() || c == ';');
        let openers = events.iter().filter(|e| e.1).count();
        let mut skip_header = false;
        if openers > 0 {
            if let Some((name, params)) = self.function_header(&masked, header, true) {
                self.pending_function = None;
                self.enter_function(line, &name, &params);
                for _ in 1..openers {
                    self.scopes.push(Scope::new(ScopeKind::Block));
                }
                skip_header = true;
            } else if content_start.is_none() && self.pending_function.is_some() {
                if let Some((name, params, header_line)) = self.pending_function.take() {
                    self.enter_function(header_line, &name, &params);
                    for _ in 1..openers {
                        self.scopes.push(Scope::new(ScopeKind::Block));
                    }
                }
            } else {
                let first = if LOOP_HEADER.is_match(header) { ScopeKind::Loop } else { ScopeKind::Block };
                self.scopes.push(Scope::new(first));
                for _ in 1..openers {
                    self.scopes.push(Scope::new(ScopeKind::Block));
                }
            }
        } else if content_start.is_some() {
            self.pending_function = self
                .function_header(&masked, header, false)
                .map(|(name, params)| (name, params, line));
            if self.pending_function.is_some() {
                skip_header = true;
            }
        }

        if !skip_header && !masked.trim_start().starts_with("typedef") {
            for (offset, stmt) in split_statements(&content) {
                self.statement(line, offset, stmt);
            }
        } else if skip_header {
            // Statements following the opening brace of a one-line function
            if let Some(brace) = first_open.filter(|_| openers > 0) {
                for (offset, stmt) in split_statements(&content[brace + 1..]) {
                    self.statement(line, brace + 1 + offset, stmt);
                }
            }
        }

        for _ in 0..trailing_closers {
            self.pop_scope(line);
        }
    }

    /// Typedef and struct names learned as they appear.
    fn learn_types(&mut self, masked: &str) {
        let trimmed = masked.trim();
        if let Some(cap) = STRUCT_OPEN.captures(masked) {
            self.state.globals.add_struct(&cap[1]);
        }
        if trimmed.starts_with("typedef") {
            if trimmed.contains('{') && !trimmed.contains('}') {
                self.typedef_open = true;
            } else if let Some(body) = trimmed.strip_suffix(';') {
                let name = TYPEDEF_FUNCTION
                    .captures(body)
                    .or_else(|| TYPEDEF_NAME.captures(body))
                    .map(|c| c[1].to_string());
                if let Some(name) = name {
                    self.typedefs.insert(name);
                }
            }
        } else if self.typedef_open {
            if let Some(cap) = TYPEDEF_CLOSE.captures(masked) {
                self.typedefs.insert(cap[1].to_string());
                self.typedef_open = false;
            }
        }
    }

    /// A `{` preceded by `=` (or inside an initializer list) opens an initializer.
    fn opens_initializer(&self, masked: &str, col: usize, line: usize) -> bool {
        let before = masked[..col].trim_end();
        let previous = if before.is_empty() {
            (0..line)
                .rev()
                .map(|l| self.text.masked[l].trim_end())
                .find(|l| !l.trim().is_empty())
                .and_then(|l| l.chars().last())
        } else {
            before.chars().last()
        };
        matches!(previous, Some('='))
            || (previous == Some(')') && before.ends_with(')') && looks_like_compound_literal(before))
    }

    fn function_header(&self, masked: &str, header: &str, with_brace: bool) -> Option<(String, String)> {
        if self.scope_kind() != ScopeKind::Global {
            return None;
        }
        let cap = FUNCTION_HEADER.captures(header)?;
        let type_words = cap.get(1)?.as_str();
        let name = cap.get(2)?.as_str();
        if utils::is_c_keyword(name)
            || type_words
                .split(|c: char| c.is_whitespace() || c == '*')
                .any(|w| ["return", "else", "if", "while", "for", "switch", "do", "case", "goto", "sizeof", "typedef"].contains(&w))
        {
            return None;
        }
        let open = cap.get(0)?.end() - 1;
        let close = utils::find_matching(header, open)?;
        let params = header[open + 1..close].to_string();

        // The original text after the parameter list decides what this is
        let offset = masked.len() - header.len();
        let after = masked.get(offset + close + 1..).unwrap_or("").trim_start();
        let follows_brace = after.starts_with('{');
        let bare = after.is_empty();
        match (with_brace, follows_brace, bare) {
            (true, true, _) => Some((name.to_string(), params)),
            (false, _, true) => Some((name.to_string(), params)),
            _ => None,
        }
    }

    fn enter_function(&mut self, line: usize, name: &str, params: &str) {
        let id = self.state.frames.len();
        self.state.frames.push(StackFrame {
            id,
            function_name: name.to_string(),
            start_line: line,
            end_line: None,
            vars: Vec::new(),
        });
        self.current_frame = Some(id);
        self.scopes.push(Scope::new(ScopeKind::Function));
        self.state.globals.add_function(name, line);

        for param in utils::split_arguments(params) {
            let param = param.trim();
            if param.is_empty() || param == "void" || param == "..." {
                continue;
            }
            let Some(parsed) = self.parse_declaration(param) else {
                continue;
            };
            let Some(d) = parsed.declarators.into_iter().next() else {
                continue;
            };
            let var = self.register(line, d.column, &d, &parsed.base_type, true, parsed.is_static);
            self.push_change(var, line, 0, Assigned::unknown(), AssignmentKind::Parameter, param);
        }
    }

    fn pop_scope(&mut self, line: usize) {
        if self.scopes.len() <= 1 {
            return;
        }
        if let Some(scope) = self.scopes.pop() {
            for &id in scope.vars.values() {
                self.state.variables[id].scope_end_line = Some(line);
            }
            if scope.kind == ScopeKind::Function {
                if let Some(frame) = self.current_frame.take() {
                    self.state.frames[frame].end_line = Some(line);
                }
            }
        }
    }

    fn statement(&mut self, line: usize, offset: usize, stmt: &str) {
        let lead = stmt.len() - stmt.trim_start().len();
        let col = offset + lead;
        let s = stmt.trim();
        if s.is_empty() {
            return;
        }

        if let Some(m) = STATEMENT_PREFIX.find(s) {
            self.statement(line, col + m.end(), &s[m.end()..]);
            return;
        }
        if let Some(cap) = LABEL.captures(s) {
            let word = &cap[1];
            if !utils::is_c_keyword(word) && self.resolve_id(word).is_none() {
                let rest = s.find(':').map(|i| i + 1).unwrap_or(s.len());
                self.statement(line, col + rest, &s[rest..]);
                return;
            }
        }

        let first_word = s.split(|c: char| !(c.is_alphanumeric() || c == '_')).next().unwrap_or("");
        match first_word {
            "if" | "while" | "switch" => {
                if let Some(open) = s.find('(') {
                    if let Some(close) = utils::find_matching(s, open) {
                        self.expression(line, col + open + 1, &s[open + 1..close]);
                        self.statement(line, col + close + 1, &s[close + 1..]);
                        return;
                    }
                }
                self.expression(line, col, s);
            }
            "for" => {
                if let Some(open) = s.find('(') {
                    if let Some(close) = utils::find_matching(s, open) {
                        let inner = &s[open + 1..close];
                        for (part_offset, part) in split_statements(inner) {
                            self.statement(line, col + open + 1 + part_offset, part);
                        }
                        self.statement(line, col + close + 1, &s[close + 1..]);
                    }
                }
            }
            "return" => {
                let expr = &s["return".len()..];
                let expr_col = col + "return".len();
                self.expression(line, expr_col, expr);
                self.returned(line, expr.trim());
            }
            "typedef" | "goto" | "break" | "continue" => {}
            _ => {
                if let Some(parsed) = self.parse_declaration(s) {
                    self.declare(line, col, s.len(), parsed);
                } else {
                    self.expression(line, col, s);
                }
            }
        }
    }

    fn declare(&mut self, line: usize, col: usize, len: usize, parsed: ParsedDeclaration) {
        let end = col + len;
        for d in &parsed.declarators {
            if d.is_function {
                continue;
            }
            let id = self.register(line, col + d.column, d, &parsed.base_type, false, parsed.is_static);
            if parsed.is_extern {
                self.state.variables[id].decl.is_initialized = true;
            }
            if let Some((init_col, init)) = &d.init {
                self.record_references(line, col + init_col, init);
                self.call_effects(line, end, init);
                let assigned = if init.trim_start().starts_with('{') {
                    Assigned::unknown()
                } else {
                    self.evaluate(init)
                };
                let kind = if assigned.value == SymbolicValue::Heap {
                    AssignmentKind::Allocation
                } else {
                    AssignmentKind::Initializer
                };
                self.apply(id, line, end, assigned, kind, init.trim());
            }
        }
    }

    fn register(
        &mut self,
        line: usize,
        column: usize,
        d: &Declarator,
        base_type: &str,
        is_parameter: bool,
        is_static: bool,
    ) -> usize {
        let id = self.state.variables.len();
        let is_global = self.scopes.len() == 1;
        let scope_id = self.current_function().unwrap_or_else(|| "global".to_string());
        self.state.variables.push(VariableState {
            id,
            decl: VariableDeclaration {
                name: d.name.clone(),
                declared_type: base_type.to_string(),
                is_pointer: d.is_pointer,
                is_array: d.is_array,
                is_initialized: d.init.is_some() || is_global || is_static || is_parameter,
                is_parameter,
                is_global,
                is_static,
                declaration_position: Position::new(line, column),
                scope_id,
            },
            current_symbolic_value: None,
            value_history: Vec::new(),
            points_to_space: Space::Unknown,
            target_variable: None,
            owning_stack_frame_id: None,
            scope_end_line: None,
        });
        self.variable_frame.push(self.current_frame);
        if let Some(scope) = self.scopes.last_mut() {
            scope.vars.insert(d.name.clone(), id);
        }
        if let Some(frame) = self.current_frame {
            self.state.frames[frame].vars.push(id);
        }
        if is_global {
            self.state.globals.add_global(&d.name);
        }
        self.state.references.push(Reference { var: id, pos: Position::new(line, column), access: Access::Declaration });
        id
    }

    /// References, calls and assignments of one expression statement.
    fn expression(&mut self, line: usize, col: usize, s: &str) {
        if s.trim().is_empty() {
            return;
        }
        self.record_references(line, col, s);
        let end = col + s.trim_end().len();
        self.call_effects(line, end, s);
        self.assignment(line, end, s);
    }

    fn record_references(&mut self, line: usize, col: usize, s: &str) {
        for (start, word) in utils::identifiers(s) {
            if utils::is_c_keyword(word) {
                continue;
            }
            let Some(var) = self.resolve_id(word) else {
                continue;
            };
            if let Some(access) = classify_access(s, start, word.len()) {
                self.state.references.push(Reference { var, pos: Position::new(line, col + start), access });
            }
        }
    }

    fn call_effects(&mut self, line: usize, end: usize, s: &str) {
        for call in utils::find_calls(s) {
            let name = call.name.as_str();
            if name == "free" {
                if let Some(id) = call.arguments.first().and_then(|a| self.bare_variable(a)) {
                    let freed = Assigned { space: self.state.variables[id].points_to_space, ..Assigned::of(SymbolicValue::Freed, Space::Unknown) };
                    self.apply(id, line, end, freed, AssignmentKind::Free, s.trim());
                }
                continue;
            }

            let scanf = SCANF_FAMILY.contains(&name);
            for arg in &call.arguments {
                let Some(target) = arg.trim().strip_prefix('&') else {
                    continue;
                };
                let target = target.trim_start();
                let Some(id) = leading_name(target).and_then(|n| self.resolve_id(n)) else {
                    continue;
                };
                let whole = SIMPLE_NAME.is_match(target.trim());
                let (value, kind) = if scanf && whole {
                    (SymbolicValue::ScanfInput, AssignmentKind::Input)
                } else if scanf {
                    (SymbolicValue::Unknown, AssignmentKind::Input)
                } else {
                    (SymbolicValue::Unknown, AssignmentKind::AddressTaken)
                };
                let space = self.state.variables[id].points_to_space;
                self.apply(id, line, end, Assigned { space, ..Assigned::of(value, Space::Unknown) }, kind, s.trim());
            }

            if !utils::is_standard_library_function(name) && !utils::is_allocation_function(name) {
                if let Some(caller) = self.current_function() {
                    self.state.globals.add_call(&caller, name, line, None);
                }
            }
        }
    }

    fn assignment(&mut self, line: usize, end: usize, s: &str) {
        let Some((op_start, op_end)) = find_assignment(s) else {
            return;
        };
        let lhs = s[..op_start].trim();
        let rhs = &s[op_end..];
        let compound = op_end - op_start > 1;

        // a = b = 0
        if find_assignment(rhs).is_some() {
            self.assignment(line, end, rhs);
        }
        let value_text = match find_assignment(rhs) {
            Some((_, e)) => &rhs[e..],
            None => rhs,
        };

        let lhs = strip_parens(lhs);
        if SIMPLE_NAME.is_match(lhs) {
            let Some(id) = self.resolve_id(lhs) else {
                return;
            };
            if compound {
                let var = &self.state.variables[id];
                let keep = Assigned {
                    value: var.current_symbolic_value.clone().unwrap_or(SymbolicValue::Unknown),
                    space: var.points_to_space,
                    target: var.target_variable,
                    target_frame: var.owning_stack_frame_id,
                    ..Assigned::unknown()
                };
                self.apply(id, line, end, keep, AssignmentKind::Assignment, s.trim());
                return;
            }
            let assigned = self.evaluate(value_text);
            let kind = if assigned.value == SymbolicValue::Heap {
                AssignmentKind::Allocation
            } else {
                AssignmentKind::Assignment
            };
            self.apply(id, line, end, assigned, kind, s.trim());
        } else if let Some(cap) = SLOT_WRITE.captures(lhs) {
            let Some(id) = self.resolve_id(&cap[1]) else {
                return;
            };
            if !self.state.variables[id].decl.is_pointer || self.state.variables[id].decl.is_array {
                let var = &self.state.variables[id];
                let keep = Assigned {
                    value: var.current_symbolic_value.clone().unwrap_or(SymbolicValue::Unknown),
                    space: var.points_to_space,
                    ..Assigned::unknown()
                };
                self.apply(id, line, end, keep, AssignmentKind::Assignment, s.trim());
            }
        }
    }

    /// Abstract value of an expression on the right of `=`.
    fn evaluate(&self, rhs: &str) -> Assigned {
        let s = strip_parens(utils::strip_casts(rhs.trim()));
        if s.is_empty() {
            return Assigned::unknown();
        }
        if s == "NULL" || s == "0" || s == "nullptr" || s == "'\\0'" {
            return Assigned::of(SymbolicValue::NullLike, Space::Unknown);
        }
        if s.starts_with('"') {
            return Assigned::of(SymbolicValue::Unknown, Space::Global);
        }
        if let Some(target) = s.strip_prefix('&') {
            let target = target.trim_start();
            let Some(id) = leading_name(target).and_then(|n| self.resolve_id(n)) else {
                return Assigned::unknown();
            };
            let var = &self.state.variables[id];
            let space = if var.decl.is_global || var.decl.is_static { Space::Global } else { Space::Stack };
            return Assigned {
                value: SymbolicValue::AddressOf(var.name().to_string()),
                space,
                target: Some(id),
                target_frame: self.variable_frame[id],
                ..Assigned::unknown()
            };
        }
        if let Some(call) = utils::find_calls(s).into_iter().next().filter(|c| c.column == 0) {
            let name = call.name;
            if utils::is_allocation_function(&name) {
                return Assigned { allocator: Some(name), ..Assigned::of(SymbolicValue::Heap, Space::Heap) };
            }
            if utils::is_standard_library_function(&name) {
                return Assigned::unknown();
            }
            let value = if self.state.globals.is_dangerous(&name) {
                SymbolicValue::Dangerous(name.clone())
            } else {
                SymbolicValue::FunctionCallResult(name.clone())
            };
            return Assigned { callee: Some(name), ..Assigned::of(value, Space::Unknown) };
        }
        if SIMPLE_NAME.is_match(s) {
            if let Some(id) = self.resolve_id(s) {
                let var = &self.state.variables[id];
                if var.decl.is_array {
                    let space = if var.decl.is_global || var.decl.is_static { Space::Global } else { Space::Stack };
                    return Assigned {
                        value: SymbolicValue::AddressOf(var.name().to_string()),
                        space,
                        target: Some(id),
                        target_frame: self.variable_frame[id],
                        ..Assigned::unknown()
                    };
                }
                return Assigned {
                    value: var.current_symbolic_value.clone().unwrap_or(SymbolicValue::Unknown),
                    space: var.points_to_space,
                    target: var.target_variable,
                    target_frame: var.owning_stack_frame_id,
                    ..Assigned::unknown()
                };
            }
        }
        Assigned::unknown()
    }

    fn apply(&mut self, id: usize, line: usize, column: usize, assigned: Assigned, kind: AssignmentKind, source: &str) {
        if let (Some(callee), Some(caller)) = (&assigned.callee, self.current_function()) {
            let target = self.state.variables[id].name().to_string();
            self.state.globals.add_call(&caller, callee, line, Some(&target));
        }
        if let (Some(allocator), Some(frame)) = (&assigned.allocator, self.current_frame) {
            self.state.allocations.push(Allocation {
                var: id,
                line,
                frame,
                function: self.state.frames[frame].function_name.clone(),
                allocator: allocator.clone(),
            });
        }
        self.push_change(id, line, column, assigned, kind, source);
    }

    fn push_change(&mut self, id: usize, line: usize, column: usize, assigned: Assigned, kind: AssignmentKind, source: &str) {
        let var = &mut self.state.variables[id];
        var.decl.is_initialized = true;
        var.current_symbolic_value = Some(assigned.value.clone());
        var.points_to_space = assigned.space;
        var.target_variable = assigned.target;
        var.owning_stack_frame_id = assigned.target_frame;
        var.value_history.push(ValueChange {
            line,
            column,
            value: assigned.value,
            kind,
            source_text: source.to_string(),
        });
    }

    fn returned(&mut self, line: usize, expr: &str) {
        let Some(frame) = self.current_frame else {
            return;
        };
        let e = strip_parens(utils::strip_casts(expr));
        let escape = if let Some(target) = e.strip_prefix('&') {
            leading_name(target.trim_start())
                .and_then(|n| self.resolve_id(n))
                .filter(|&id| {
                    let d = &self.state.variables[id].decl;
                    !d.is_global && !d.is_static
                })
                .map(|id| (id, EscapeKind::LocalAddress))
        } else if SIMPLE_NAME.is_match(e) {
            self.resolve_id(e).and_then(|id| {
                let var = &self.state.variables[id];
                let d = &var.decl;
                if d.is_array && !d.is_global && !d.is_static && !d.is_parameter {
                    return Some((id, EscapeKind::LocalAddress));
                }
                match var.current_symbolic_value {
                    Some(SymbolicValue::AddressOf(_))
                        if var.points_to_space == Space::Stack && var.owning_stack_frame_id == Some(frame) =>
                    {
                        Some((id, EscapeKind::LocalAddress))
                    }
                    Some(SymbolicValue::Freed) => Some((id, EscapeKind::Freed)),
                    _ => None,
                }
            })
        } else {
            None
        };

        if let Some((id, kind)) = escape {
            let function = self.state.frames[frame].function_name.clone();
            match kind {
                EscapeKind::LocalAddress => self.state.globals.mark_returns_local_address(&function),
                EscapeKind::Freed => self.state.globals.mark_returns_freed(&function),
            }
            self.state.escapes.push(ReturnEscape {
                line,
                function,
                variable: self.state.variables[id].name().to_string(),
                kind,
            });
        }
    }

    /// Parse `s` as a declaration, `None` when it reads as an expression.
    fn parse_declaration(&self, s: &str) -> Option<ParsedDeclaration> {
        let mut is_static = false;
        let mut is_extern = false;
        let mut type_words: Vec<&str> = Vec::new();
        let mut i = skip_ws(s, 0);

        while let Some((a, b)) = word_at(s, i) {
            let w = &s[a..b];
            if !QUALIFIERS.contains(&w) {
                break;
            }
            is_static |= w == "static";
            is_extern |= w == "extern";
            i = skip_ws(s, b);
        }

        let (a, b) = word_at(s, i)?;
        let w = &s[a..b];
        if ["struct", "union", "enum"].contains(&w) {
            let (na, nb) = word_at(s, skip_ws(s, b))?;
            type_words.push(w);
            type_words.push(&s[na..nb]);
            i = nb;
        } else if INTEGER_WORDS.contains(&w) {
            let mut j = a;
            while let Some((x, y)) = word_at(s, skip_ws(s, j)) {
                let word = &s[x..y];
                if INTEGER_WORDS.contains(&word) || word == "double" {
                    type_words.push(word);
                } else if !QUALIFIERS.contains(&word) {
                    break;
                }
                j = y;
            }
            i = j;
        } else if BASE_TYPES.contains(&w) || self.typedefs.contains(w) || w.ends_with("_t") {
            type_words.push(w);
            i = b;
        } else if !utils::is_c_keyword(w) && self.resolve_id(w).is_none() && looks_like_declarator(&s[b..]) {
            type_words.push(w);
            i = b;
        } else {
            return None;
        }

        // `char const *p`
        while let Some((x, y)) = word_at(s, skip_ws(s, i)) {
            if !QUALIFIERS.contains(&&s[x..y]) {
                break;
            }
            i = y;
        }

        let rest = &s[i..];
        let first = rest.trim_start().chars().next()?;
        if !(first == '*' || first == '(' || first == '_' || first.is_alphabetic()) {
            return None;
        }

        let mut declarators = Vec::new();
        let mut offset = i;
        for part in split_top_level(rest, b',') {
            if let Some(d) = parse_declarator(part, offset) {
                declarators.push(d);
            }
            offset += part.len() + 1;
        }
        if declarators.is_empty() {
            return None;
        }
        Some(ParsedDeclaration { base_type: type_words.join(" "), is_static, is_extern, declarators })
    }

    /// Variable named by an argument such as `p` or `(void *)p`.
    fn bare_variable(&self, arg: &str) -> Option<usize> {
        let a = strip_parens(utils::strip_casts(arg.trim()));
        SIMPLE_NAME.is_match(a).then(|| self.resolve_id(a)).flatten()
    }
}

fn looks_like_compound_literal(before: &str) -> bool {
    let Some(open) = before.rfind('(') else {
        return false;
    };
    let inner = &before[open + 1..before.len() - 1];
    let head = before[..open].trim_end();
    (inner.contains("struct") || inner.contains("union"))
        && (head.ends_with('=') || head.ends_with("return") || head.ends_with(',') || head.ends_with('('))
}

fn looks_like_declarator(after_type: &str) -> bool {
    static NEXT: Lazy<Regex> =
        Lazy::new(|| {
            Regex::new(r"^(?:\s+|\s*\*[\s\*]*)(?:\(\s*\*\s*[A-Za-z_]\w*\s*\)|[A-Za-z_]\w*\s*(?:[=,\[;(]|$))").unwrap()
        });
    NEXT.is_match(after_type)
}

fn parse_declarator(part: &str, offset: usize) -> Option<Declarator> {
    let (decl, init) = match find_assignment(part) {
        Some((start, end)) if end - start == 1 => (&part[..start], Some((offset + end, part[end..].to_string()))),
        _ => (part, None),
    };

    if let Some(cap) = FUNCTION_POINTER.captures(decl) {
        let name = cap.get(1)?;
        return Some(Declarator {
            name: name.as_str().to_string(),
            column: offset + name.start(),
            is_pointer: true,
            is_array: false,
            is_function: false,
            init,
        });
    }

    let is_pointer = decl.contains('*');
    let mut start = None;
    for (pos, word) in utils::identifiers(decl) {
        if QUALIFIERS.contains(&word) {
            continue;
        }
        start = Some((pos, word));
        break;
    }
    let (pos, name) = start?;
    if utils::is_c_keyword(name) {
        return None;
    }
    let after = decl[pos + name.len()..].trim_start();
    Some(Declarator {
        name: name.to_string(),
        column: offset + pos,
        is_pointer,
        is_array: after.starts_with('['),
        is_function: after.starts_with('('),
        init,
    })
}

/// How an identifier occurrence at `start` uses its variable. `None` for
/// member names, callees and `sizeof` operands.
fn classify_access(s: &str, start: usize, len: usize) -> Option<Access> {
    let before = s[..start].trim_end();
    let after = s[start + len..].trim_start();

    if before.ends_with('.') || before.ends_with("->") {
        return None;
    }
    if after.starts_with('(') || SIZEOF_TAIL.is_match(before) {
        return None;
    }
    if after.starts_with("->") {
        return Some(Access::Arrow);
    }
    if let Some(prefix) = before.strip_suffix('&') {
        if !prefix.ends_with('&') && is_unary_position(prefix) {
            return Some(Access::AddressOf);
        }
    }
    if let Some(prefix) = before.strip_suffix('*') {
        if is_unary_position(prefix) {
            return Some(Access::Deref);
        }
    }
    if after.starts_with('[') {
        return Some(Access::Index);
    }
    if after.starts_with("++") || after.starts_with("--") || before.ends_with("++") || before.ends_with("--") {
        return Some(Access::ReadWrite);
    }
    if after.starts_with('.') {
        return Some(if MEMBER_WRITE.is_match(after) { Access::Write } else { Access::Read });
    }
    if after.starts_with('=') && !after.starts_with("==") {
        return Some(Access::Write);
    }
    if ["+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "<<=", ">>="].iter().any(|op| after.starts_with(op)) {
        return Some(Access::ReadWrite);
    }
    Some(Access::Read)
}

/// Whether an operator following `prefix` is unary.
fn is_unary_position(prefix: &str) -> bool {
    let p = prefix.trim_end();
    match p.chars().last() {
        None => true,
        Some(c) if c.is_alphanumeric() || c == '_' => {
            let word = p.rsplit(|c: char| !(c.is_alphanumeric() || c == '_')).next().unwrap_or("");
            ["return", "case", "sizeof"].contains(&word)
        }
        Some(')') | Some(']') => false,
        Some(_) => true,
    }
}

/// Byte range of the top-level assignment operator in `s`, if any.
fn find_assignment(s: &str) -> Option<(usize, usize)> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    for i in 0..bytes.len() {
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b'=' if depth == 0 => {
                let next = bytes.get(i + 1).copied();
                if next == Some(b'=') {
                    return None;
                }
                let prev = if i > 0 { bytes[i - 1] } else { b' ' };
                match prev {
                    b'=' | b'!' => return None,
                    b'<' | b'>' => {
                        let doubled = i >= 2 && bytes[i - 2] == prev;
                        if doubled {
                            return Some((i - 2, i + 1));
                        }
                        return None;
                    }
                    b'+' | b'-' | b'*' | b'/' | b'%' | b'&' | b'|' | b'^' => return Some((i - 1, i + 1)),
                    _ => return Some((i, i + 1)),
                }
            }
            _ => {}
        }
    }
    None
}

/// Pieces of `s` between top-level `;`, with their byte offsets.
fn split_statements(s: &str) -> Vec<(usize, &str)> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            b';' if depth <= 0 => {
                parts.push((start, &s[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() {
        parts.push((start, &s[start..]));
    }
    parts
}

fn split_top_level(s: &str, sep: u8) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            _ if b == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn strip_parens(s: &str) -> &str {
    let mut s = s.trim();
    while s.starts_with('(') && utils::find_matching(s, 0) == Some(s.len() - 1) {
        s = s[1..s.len() - 1].trim();
    }
    s
}

fn leading_name(s: &str) -> Option<&str> {
    let end = s.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(s.len());
    let name = &s[..end];
    (!name.is_empty() && !name.starts_with(|c: char| c.is_ascii_digit())).then_some(name)
}

fn skip_ws(s: &str, from: usize) -> usize {
    s[from..].find(|c: char| !c.is_whitespace()).map(|i| from + i).unwrap_or(s.len())
}

fn word_at(s: &str, at: usize) -> Option<(usize, usize)> {
    let rest = s.get(at..)?;
    if !rest.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        return None;
    }
    let len = rest.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(rest.len());
    Some((at, at + len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state(src: &str) -> SymbolState {
        track(&SourceText::new(src))
    }

    fn var<'s>(state: &'s SymbolState, name: &str) -> &'s VariableState {
        state.variables.iter().find(|v| v.name() == name).unwrap()
    }

    #[test]
    fn declarations_and_types() {
        let s = state(
            "typedef struct Node { int v; } Node;\n\
             int g;\n\
             int main(void) {\n\
             \x20   unsigned long long big = 1, *p, arr[4];\n\
             \x20   const char* name = \"x\";\n\
             \x20   Node *head;\n\
             \x20   static int count;\n\
             \x20   int (*cb)(int);\n\
             \x20   return 0;\n\
             }\n",
        );
        let big = var(&s, "big");
        assert_eq!(big.decl.declared_type, "unsigned long long");
        assert!(big.decl.is_initialized);
        assert!(var(&s, "p").decl.is_pointer);
        assert!(!var(&s, "p").decl.is_initialized);
        assert!(var(&s, "arr").decl.is_array);
        assert!(var(&s, "name").decl.is_pointer);
        assert_eq!(var(&s, "head").decl.declared_type, "Node");
        assert!(var(&s, "count").decl.is_initialized);
        assert!(var(&s, "cb").decl.is_pointer);
        assert!(var(&s, "g").decl.is_global);
        assert_eq!(var(&s, "p").decl.scope_id, "main");
        assert!(s.globals.has_struct("Node"));
    }

    #[test]
    fn resolve_sees_only_visible_names() {
        let text = SourceText::new("int g;\nvoid f() {\n    int local;\n");
        let mut tracker = ScopeTracker::new(&text);
        for line in 0..text.len() {
            tracker.process_line(line);
        }
        assert!(tracker.resolve("local").is_some());
        assert!(tracker.resolve("g").unwrap().decl.is_global);
        assert!(tracker.resolve("missing").is_none());
    }

    #[test]
    fn function_scopes_and_params() {
        let s = state("int add(int a, int *b)\n{\n    return a + *b;\n}\nint main() { int x = add(1, &x); return x; }\n");
        assert_eq!(s.frames.len(), 2);
        assert_eq!(s.frames[0].function_name, "add");
        assert_eq!(s.frames[0].end_line, Some(3));
        assert!(!s.frames[0].contains_line(4));
        let a = var(&s, "a");
        assert!(a.decl.is_parameter);
        assert_eq!(a.value_history[0].kind, AssignmentKind::Parameter);
        assert_eq!(a.scope_end_line, Some(3));
        assert!(s.globals.summary("main").is_some());
        assert_eq!(s.frame_at(4).map(|f| f.function_name.as_str()), Some("main"));
    }

    #[test]
    fn initializer_braces_are_not_scopes() {
        let s = state("int main() {\n    int a[3] = {1, 2,\n        3};\n    int b;\n    return b;\n}\n");
        assert_eq!(var(&s, "b").decl.scope_id, "main");
        assert_eq!(var(&s, "b").scope_end_line, Some(5));
        assert_eq!(s.frames[0].end_line, Some(5));
    }

    #[test]
    fn assignment_values() {
        let s = state(
            "int main() {\n\
             \x20   int x;\n\
             \x20   int *p = NULL;\n\
             \x20   p = malloc(4);\n\
             \x20   free(p);\n\
             \x20   int *q = &x;\n\
             \x20   int *r = q;\n\
             \x20   scanf(\"%d\", &x);\n\
             \x20   return 0;\n\
             }\n",
        );
        let p = var(&s, "p");
        let values: Vec<&SymbolicValue> = p.value_history.iter().map(|c| &c.value).collect();
        assert_eq!(values, vec![&SymbolicValue::NullLike, &SymbolicValue::Heap, &SymbolicValue::Freed]);
        assert_eq!(s.allocations.len(), 1);
        assert_eq!(s.allocations[0].function, "main");

        let r = var(&s, "r");
        assert_eq!(r.current_symbolic_value, Some(SymbolicValue::AddressOf("x".into())));
        assert_eq!(r.points_to_space, Space::Stack);
        assert_eq!(r.owning_stack_frame_id, Some(0));
        assert_eq!(var(&s, "x").value_history[0].value, SymbolicValue::ScanfInput);

        let p_id = p.id;
        assert_eq!(s.value_at(p_id, 4, 0).map(|c| &c.value), Some(&SymbolicValue::Heap));
        assert!(s.value_at(p_id, 2, 0).is_none());
    }

    #[test]
    fn references_carry_access_kinds() {
        let s = state("void f(int *p, int n) {\n    *p = n;\n    p[1] = p->x + n++;\n    g(&n, sizeof(n));\n}\n");
        let p = var(&s, "p").id;
        let n = var(&s, "n").id;
        let accesses = |id: usize, line: usize| -> Vec<Access> {
            s.references_to(id).filter(|r| r.pos.line == line).map(|r| r.access).collect()
        };
        assert_eq!(accesses(p, 1), vec![Access::Deref]);
        assert_eq!(accesses(n, 1), vec![Access::Read]);
        assert_eq!(accesses(p, 2), vec![Access::Index, Access::Arrow]);
        assert_eq!(accesses(n, 2), vec![Access::ReadWrite]);
        assert_eq!(accesses(n, 3), vec![Access::AddressOf]);
        assert_eq!(s.variable_at("n", 3).map(|v| v.id), Some(n));
    }

    #[test]
    fn shadowing_resolves_innermost() {
        let s = state("int x = 1;\nint main() {\n    int x;\n    {\n        int x = 2;\n        x++;\n    }\n    return x;\n}\n");
        let inner = s.variable_at("x", 5).unwrap();
        assert_eq!(inner.decl.declaration_position.line, 4);
        let outer = s.variable_at("x", 7).unwrap();
        assert_eq!(outer.decl.declaration_position.line, 2);
        assert_eq!(inner.scope_end_line, Some(6));
    }

    #[test]
    fn return_escapes_update_summaries() {
        let s = state(
            "int *local(void) {\n    int v = 1;\n    return &v;\n}\n\
             char *freed(void) {\n    char *b = malloc(8);\n    free(b);\n    return b;\n}\n\
             int *arr(void) {\n    int a[4];\n    return a;\n}\n\
             int *wrap(void) {\n    int *p = local();\n    return p;\n}\n",
        );
        let kinds: Vec<(&str, EscapeKind)> = s.escapes.iter().map(|e| (e.function.as_str(), e.kind)).collect();
        assert_eq!(
            kinds,
            vec![("local", EscapeKind::LocalAddress), ("freed", EscapeKind::Freed), ("arr", EscapeKind::LocalAddress)]
        );
        assert!(s.globals.is_dangerous("wrap"));
        assert_eq!(var(&s, "p").current_symbolic_value, Some(SymbolicValue::Dangerous("local".into())));
        assert_eq!(s.globals.cross_function_calls()[0].target.as_deref(), Some("p"));
    }

    #[test]
    fn loops_and_slot_writes() {
        let s = state(
            "int main() {\n    int sum;\n    int a[3];\n    for (int i = 0; i < 3; i++) {\n        a[i] = i;\n    }\n    sum = a[0];\n    return sum;\n}\n",
        );
        let i = var(&s, "i");
        assert_eq!(i.scope_end_line, Some(5));
        assert!(i.decl.is_initialized);
        assert!(var(&s, "a").value_history.iter().any(|c| c.line == 4));
        assert!(var(&s, "sum").assigned_before(Position::new(7, 0)));
    }
}
