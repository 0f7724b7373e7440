use std::fmt;

use serde::{Deserialize, Serialize};

// Issue categories, serialized with the names reporting layers expect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Uninitialized,
    #[serde(rename = "Wild pointer")]
    WildPointer,
    #[serde(rename = "Null pointer")]
    NullPointer,
    #[serde(rename = "Dangling pointer")]
    DanglingPointer,
    #[serde(rename = "Dead loop")]
    DeadLoop,
    #[serde(rename = "Memory leak")]
    MemoryLeak,
    #[serde(rename = "Range overflow")]
    RangeOverflow,
    Format,
    Header,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Uninitialized,
        Category::WildPointer,
        Category::NullPointer,
        Category::DanglingPointer,
        Category::DeadLoop,
        Category::MemoryLeak,
        Category::RangeOverflow,
        Category::Format,
        Category::Header,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Uninitialized => "Uninitialized",
            Category::WildPointer => "Wild pointer",
            Category::NullPointer => "Null pointer",
            Category::DanglingPointer => "Dangling pointer",
            Category::DeadLoop => "Dead loop",
            Category::MemoryLeak => "Memory leak",
            Category::RangeOverflow => "Range overflow",
            Category::Format => "Format",
            Category::Header => "Header",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding. Produced by detectors and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Issue {
    pub file: String,
    pub line: u32,
    pub category: Category,
    pub message: String,
    #[serde(rename = "codeLine")]
    pub code_line: String,
}

impl Issue {
    /// Builds an issue for a 0-based line index, pulling the display line from `lines`.
    pub fn at(file: &str, lines: &[String], index: usize, category: Category, message: String) -> Self {
        Issue {
            file: file.to_string(),
            line: index as u32 + 1,
            category,
            message,
            code_line: lines.get(index).map(|l| l.trim_end().to_string()).unwrap_or_default(),
        }
    }
}

// Position in the source text, 0-based row and column
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Position { line, column }
    }
}

// Abstract value a variable holds at some point of the forward pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolicValue {
    Unknown,                    // Assigned, but nothing useful is known
    NullLike,                   // NULL or literal 0
    AddressOf(String),          // &x
    Heap,                       // malloc/calloc/realloc/strdup result
    ScanfInput,                 // Written through scanf(&v)
    FunctionCallResult(String), // Result of a user function call
    Freed,                      // Passed to free()
    Dangerous(String),          // Result of a function known to return bad memory
}

// Where a pointer's target lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Heap,
    Stack,
    Global,
    Unknown,
}

// How a value reached the variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentKind {
    Initializer,  // Part of the declaration
    Assignment,   // Plain or compound assignment
    Allocation,   // Heap allocation call
    Free,         // free(x)
    AddressTaken, // &x handed to a function that may write it
    Input,        // scanf family
    Parameter,    // Seeded on function entry
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub line: usize,
    /// Column where the assignment takes effect (end of its statement).
    pub column: usize,
    pub value: SymbolicValue,
    pub kind: AssignmentKind,
    pub source_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDeclaration {
    pub name: String,
    pub declared_type: String,
    pub is_pointer: bool,
    pub is_array: bool,
    pub is_initialized: bool,
    pub is_parameter: bool,
    pub is_global: bool,
    pub is_static: bool,
    pub declaration_position: Position,
    pub scope_id: String,
}

impl VariableDeclaration {
    pub fn is_struct_value(&self) -> bool {
        !self.is_pointer
            && (self.declared_type.contains("struct ") || self.declared_type.contains("union "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableState {
    pub id: usize,
    pub decl: VariableDeclaration,
    pub current_symbolic_value: Option<SymbolicValue>,
    pub value_history: Vec<ValueChange>,
    pub points_to_space: Space,
    pub target_variable: Option<usize>,
    pub owning_stack_frame_id: Option<usize>,
    /// Line where the enclosing scope closed, if it did.
    pub scope_end_line: Option<usize>,
}

impl VariableState {
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    /// Value in effect just before `pos`, `None` when nothing was assigned yet.
    pub fn value_at(&self, pos: Position) -> Option<(usize, &ValueChange)> {
        self.value_history
            .iter()
            .enumerate()
            .filter(|(_, change)| Position::new(change.line, change.column) < pos)
            .last()
    }

    pub fn assigned_before(&self, pos: Position) -> bool {
        self.value_at(pos).is_some()
    }
}
