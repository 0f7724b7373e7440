use std::collections::{BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

/// What is known about one defined function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSummary {
    pub name: String,
    pub line: usize,
    pub returns_local_address: bool,
    pub returns_freed: bool,
    pub calls_dangerous: bool,
}

impl FunctionSummary {
    pub fn is_dangerous(&self) -> bool {
        self.returns_local_address || self.returns_freed || self.calls_dangerous
    }
}

// A user function call whose result lands in a variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossFunctionCall {
    pub caller: String,
    pub callee: String,
    pub line: usize,
    pub target: Option<String>,
}

/// Why calling a function may hand back unusable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Danger {
    LocalAddress, // Returns the address of one of its locals
    Freed,        // Returns memory it freed
    Transitive,   // Calls a function that does either
}

impl Danger {
    pub fn describe(&self) -> &'static str {
        match self {
            Danger::LocalAddress => "returns the address of a local variable",
            Danger::Freed => "returns freed memory",
            Danger::Transitive => "calls a function returning invalid memory",
        }
    }
}

/// Functions, globals and struct names of one or more translation units,
/// plus the call graph between defined functions. Only ever grows.
#[derive(Debug, Clone, Default)]
pub struct GlobalSymbolTable {
    graph: DiGraph<String, usize>,
    node_map: HashMap<String, NodeIndex>,
    functions: Vec<FunctionSummary>,
    function_index: HashMap<String, usize>,
    globals: BTreeSet<String>,
    structs: BTreeSet<String>,
    calls: Vec<CrossFunctionCall>,
}

impl GlobalSymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.node_map.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.node_map.insert(name.to_string(), idx);
        idx
    }

    /// Record a function definition, keeping the first one seen.
    pub fn add_function(&mut self, name: &str, line: usize) {
        if self.function_index.contains_key(name) {
            return;
        }
        self.node(name);
        self.function_index.insert(name.to_string(), self.functions.len());
        self.functions.push(FunctionSummary {
            name: name.to_string(),
            line,
            returns_local_address: false,
            returns_freed: false,
            calls_dangerous: false,
        });
    }

    pub fn add_global(&mut self, name: &str) {
        self.globals.insert(name.to_string());
    }

    pub fn add_struct(&mut self, name: &str) {
        self.structs.insert(name.to_string());
    }

    pub fn add_call(&mut self, caller: &str, callee: &str, line: usize, target: Option<&str>) {
        let from = self.node(caller);
        let to = self.node(callee);
        self.graph.update_edge(from, to, line);
        if target.is_some() {
            self.calls.push(CrossFunctionCall {
                caller: caller.to_string(),
                callee: callee.to_string(),
                line,
                target: target.map(str::to_string),
            });
        }
    }

    pub fn mark_returns_local_address(&mut self, function: &str) {
        if let Some(summary) = self.summary_mut(function) {
            summary.returns_local_address = true;
        }
    }

    pub fn mark_returns_freed(&mut self, function: &str) {
        if let Some(summary) = self.summary_mut(function) {
            summary.returns_freed = true;
        }
    }

    pub fn summary(&self, function: &str) -> Option<&FunctionSummary> {
        self.function_index.get(function).map(|&i| &self.functions[i])
    }

    fn summary_mut(&mut self, function: &str) -> Option<&mut FunctionSummary> {
        let i = *self.function_index.get(function)?;
        Some(&mut self.functions[i])
    }

    pub fn functions(&self) -> &[FunctionSummary] {
        &self.functions
    }

    pub fn is_global(&self, name: &str) -> bool {
        self.globals.contains(name)
    }

    pub fn has_struct(&self, name: &str) -> bool {
        self.structs.contains(name)
    }

    pub fn cross_function_calls(&self) -> &[CrossFunctionCall] {
        &self.calls
    }

    /// Functions with a call edge to `callee`.
    pub fn callers_of(&self, callee: &str) -> Vec<&str> {
        let Some(&idx) = self.node_map.get(callee) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|n| self.graph[n].as_str())
            .collect()
    }

    pub fn danger(&self, function: &str) -> Option<Danger> {
        let summary = self.summary(function)?;
        if summary.returns_local_address {
            Some(Danger::LocalAddress)
        } else if summary.returns_freed {
            Some(Danger::Freed)
        } else if summary.calls_dangerous {
            Some(Danger::Transitive)
        } else {
            None
        }
    }

    pub fn is_dangerous(&self, function: &str) -> bool {
        self.danger(function).is_some()
    }

    /// One pass over the functions in definition order: a function calling an
    /// already dangerous callee becomes dangerous itself. Callers defined before
    /// a function that turns dangerous later in the pass are not revisited.
    pub fn propagate_dangerous(&mut self) {
        for i in 0..self.functions.len() {
            if self.functions[i].is_dangerous() {
                continue;
            }
            let Some(&idx) = self.node_map.get(&self.functions[i].name) else {
                continue;
            };
            let tainted = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .any(|callee| self.is_dangerous(&self.graph[callee]));
            if tainted {
                self.functions[i].calls_dangerous = true;
            }
        }
    }

    /// Fold another table into this one. Existing entries are never removed
    /// and flags only go from false to true.
    pub fn merge(&mut self, other: &GlobalSymbolTable) {
        for summary in &other.functions {
            self.add_function(&summary.name, summary.line);
            if let Some(mine) = self.summary_mut(&summary.name) {
                mine.returns_local_address |= summary.returns_local_address;
                mine.returns_freed |= summary.returns_freed;
                mine.calls_dangerous |= summary.calls_dangerous;
            }
        }
        for edge in other.graph.edge_indices() {
            if let Some((from, to)) = other.graph.edge_endpoints(edge) {
                let a = self.node(&other.graph[from]);
                let b = self.node(&other.graph[to]);
                self.graph.update_edge(a, b, other.graph[edge]);
            }
        }
        self.globals.extend(other.globals.iter().cloned());
        self.structs.extend(other.structs.iter().cloned());
        self.calls.extend(other.calls.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn danger_flows_to_callers_defined_later() {
        let mut table = GlobalSymbolTable::new();
        table.add_function("bad", 1);
        table.add_function("wrapper", 5);
        table.add_function("clean", 9);
        table.add_call("wrapper", "bad", 6, Some("p"));
        table.add_call("clean", "printf", 10, None);
        table.mark_returns_local_address("bad");
        table.propagate_dangerous();

        assert_eq!(table.danger("bad"), Some(Danger::LocalAddress));
        assert_eq!(table.danger("wrapper"), Some(Danger::Transitive));
        assert!(!table.is_dangerous("clean"));
        assert!(!table.is_dangerous("printf"));
        assert_eq!(table.callers_of("bad"), vec!["wrapper"]);
        assert_eq!(table.cross_function_calls().len(), 1);
    }

    #[test]
    fn single_pass_does_not_revisit_callers() {
        let mut table = GlobalSymbolTable::new();
        table.add_function("early", 1);
        table.add_function("middle", 3);
        table.add_function("late", 5);
        table.add_call("early", "middle", 2, None);
        table.add_call("middle", "late", 4, None);
        table.mark_returns_freed("late");
        table.propagate_dangerous();

        assert!(table.is_dangerous("late"));
        assert!(table.is_dangerous("middle"));
        assert!(!table.is_dangerous("early"));
    }

    #[test]
    fn merge_is_append_only() {
        let mut first = GlobalSymbolTable::new();
        first.add_function("f", 1);
        first.add_global("counter");

        let mut second = GlobalSymbolTable::new();
        second.add_function("f", 40);
        second.add_function("g", 2);
        second.mark_returns_freed("f");
        second.add_struct("node");

        first.merge(&second);
        assert_eq!(first.summary("f").map(|s| s.line), Some(1));
        assert_eq!(first.danger("f"), Some(Danger::Freed));
        assert!(first.summary("g").is_some());
        assert!(first.is_global("counter"));
        assert!(first.has_struct("node"));
    }
}
