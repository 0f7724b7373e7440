use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::ast::{NodeId, NodeKind, Span, SyntaxTree, TreeBuilder};
use crate::config::ClangOptions;
use crate::error::{Result, ScanError};
use crate::parser::ParserBackend;
use crate::processors::{add_clang_node, attach_child, ClangFacts};
use crate::types::Position;

const BACKEND: &str = "clang-ast-dump";

/// Runs `clang -Xclang -ast-dump=json -fsyntax-only` on a temporary copy of
/// the source and converts whatever JSON it manages to print.
pub struct ClangDumpBackend {
    options: ClangOptions,
}

impl ClangDumpBackend {
    pub fn new(options: ClangOptions) -> Self {
        ClangDumpBackend { options }
    }

    fn command(&self, path: &Path) -> Command {
        let mut command = Command::new(&self.options.executable);
        command.args(["-Xclang", "-ast-dump=json", "-fsyntax-only"]);
        for dir in &self.options.include_dirs {
            command.arg(format!("-I{}", dir));
        }
        command.arg(path);
        command
    }
}

impl ParserBackend for ClangDumpBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn parse(&self, source: &str) -> Result<SyntaxTree> {
        let mut file = tempfile::Builder::new().prefix("cbugscan-").suffix(".c").tempfile()?;
        file.write_all(source.as_bytes())?;
        file.flush()?;

        let timeout = Duration::from_secs(self.options.timeout_s);
        let cap = self.options.max_output_mb.saturating_mul(1024 * 1024);
        let (stdout, status) = run_bounded(self.command(file.path()), timeout, cap)?;
        let text = String::from_utf8_lossy(&stdout);
        if text.trim().is_empty() || !text.contains('{') {
            return Err(ScanError::Backend { backend: BACKEND, message: format!("no AST output (status {:?})", status) });
        }
        if status.is_none_or(|s| !s.success()) {
            debug!("clang exited with {:?}, trying to recover {} bytes of output", status, stdout.len());
        }

        let dump = repair_json(&text).ok_or_else(|| ScanError::UnrecoverableDump(format!("{} bytes", stdout.len())))?;
        Ok(convert_dump(&dump, source, file.path()))
    }
}

/// Run `command`, keeping at most `cap` bytes of stdout and killing the
/// process once `timeout` has elapsed. A `None` status means it was killed.
fn run_bounded(mut command: Command, timeout: Duration, cap: u64) -> Result<(Vec<u8>, Option<ExitStatus>)> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ScanError::BackendUnavailable { backend: BACKEND, message: e.to_string() },
            _ => ScanError::Io(e),
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ScanError::Backend { backend: BACKEND, message: "stdout not captured".into() })?;
    let reader = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = stdout.take(cap).read_to_end(&mut buf) {
            debug!("reading clang output stopped after {} bytes: {}", buf.len(), e);
        }
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None if Instant::now() >= deadline => {
                warn!("clang did not finish within {:?}, killing it", timeout);
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            None => thread::sleep(Duration::from_millis(20)),
        }
    };

    let buf = reader
        .join()
        .map_err(|_| ScanError::Backend { backend: BACKEND, message: "output reader panicked".into() })?;
    Ok((buf, status))
}

/// Walk `text` outside string literals, calling `visit` with each structural
/// byte and its index.
fn scan_structure(text: &str, mut visit: impl FnMut(usize, u8)) {
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        if b == b'"' {
            in_string = true;
        } else {
            visit(i, b);
        }
    }
}

/// Index of the `}` closing the last complete top-level object.
fn last_balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0i64;
    let mut last = None;
    scan_structure(text, |i, b| match b {
        b'{' => depth += 1,
        b'}' => {
            depth -= 1;
            if depth == 0 {
                last = Some(i);
            }
        }
        _ => {}
    });
    last
}

/// Cut `text` after its last complete value and append the closers still
/// owed for every `{` and `[` left open.
fn close_open_delimiters(text: &str) -> Option<String> {
    let mut last_close = None;
    scan_structure(text, |i, b| {
        if b == b'}' || b == b']' {
            last_close = Some(i);
        }
    });
    let prefix = &text[..=last_close?];

    let mut open = Vec::new();
    scan_structure(prefix, |_, b| match b {
        b'{' | b'[' => open.push(b),
        b'}' | b']' => {
            open.pop();
        }
        _ => {}
    });

    let mut repaired = prefix.to_string();
    for b in open.iter().rev() {
        repaired.push(if *b == b'{' { '}' } else { ']' });
    }
    Some(repaired)
}

/// Recover a JSON document from possibly truncated clang output: strict
/// parse, then the last balanced object, then the closers-appended text.
pub fn repair_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return Some(value);
    }
    let text = &text[text.find('{')?..];

    if let Some(end) = last_balanced_end(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&text[..=end]) {
            debug!("recovered clang dump from last balanced object");
            return Some(value);
        }
    }

    let repaired = close_open_delimiters(text)?;
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => {
            debug!("recovered clang dump by closing open delimiters");
            Some(value)
        }
        Err(_) => None,
    }
}

struct DumpConverter<'a> {
    builder: TreeBuilder,
    main_file: &'a str,
    in_main: bool,
    line: usize,
}

impl DumpConverter<'_> {
    // Clang only repeats `file` and `line` in a location when they change
    fn track(&mut self, loc: &Value) -> Option<(usize, usize, usize)> {
        let loc = loc.get("expansionLoc").unwrap_or(loc);
        if let Some(file) = loc.get("file").and_then(Value::as_str) {
            self.in_main = file == self.main_file;
        }
        if loc.get("includedFrom").is_some() {
            self.in_main = false;
        }
        if let Some(line) = loc.get("line").and_then(Value::as_u64) {
            self.line = line as usize;
        }
        let col = loc.get("col").and_then(Value::as_u64)? as usize;
        let offset = loc.get("offset").and_then(Value::as_u64)? as usize;
        Some((self.line, col, offset))
    }

    /// Track a node's own locations in the order clang prints them and
    /// return the begin and end of its range.
    fn track_node(&mut self, node: &Value) -> (Option<(usize, usize, usize)>, Option<(usize, usize, usize)>) {
        if let Some(loc) = node.get("loc") {
            self.track(loc);
        }
        let range = node.get("range");
        let begin = range.and_then(|r| r.get("begin")).and_then(|b| self.track(b));
        let end = range.and_then(|r| r.get("end")).and_then(|e| {
            let tok_len = e.get("expansionLoc").unwrap_or(e).get("tokLen").and_then(Value::as_u64).unwrap_or(0) as usize;
            self.track(e).map(|(line, col, offset)| (line, col, offset + tok_len))
        });
        (begin, end)
    }

    fn facts(&mut self, node: &Value) -> Option<ClangFacts> {
        let kind = node.get("kind")?.as_str()?.to_string();
        let (begin, end) = self.track_node(node);
        if !self.in_main || node.get("isImplicit").and_then(Value::as_bool) == Some(true) {
            return None;
        }

        let inner = node.get("inner").and_then(Value::as_array);
        let name = node
            .get("name")
            .or_else(|| node.get("referencedDecl").and_then(|d| d.get("name")))
            .or_else(|| node.get("value"))
            .and_then(|v| v.as_str().map(str::to_string).or_else(|| Some(v.to_string())));

        let span = match (begin, end) {
            (Some((l1, c1, _)), Some((l2, c2, _))) => Span {
                start: Position::new(l1.saturating_sub(1), c1.saturating_sub(1)),
                end: Position::new(l2.saturating_sub(1), c2.saturating_sub(1)),
            },
            (Some((l1, c1, _)), None) => {
                let start = Position::new(l1.saturating_sub(1), c1.saturating_sub(1));
                Span { start, end: start }
            }
            _ => {
                let start = Position::new(self.line.saturating_sub(1), 0);
                Span { start, end: start }
            }
        };

        Some(ClangFacts {
            name,
            type_name: node.get("type").and_then(|t| t.get("qualType")).and_then(Value::as_str).map(str::to_string),
            opcode: node.get("opcode").and_then(Value::as_str).map(str::to_string),
            has_init: node.get("init").is_some(),
            has_body: inner.is_some_and(|children| {
                children.iter().any(|c| c.get("kind").and_then(Value::as_str) == Some("CompoundStmt"))
            }),
            range: match (begin, end) {
                (Some((_, _, start)), Some((_, _, end))) if start <= end => Some(start..end),
                _ => None,
            },
            span,
            kind,
        })
    }

    fn convert(&mut self, node: &Value, parent: NodeId, field: Option<&'static str>) {
        let kind = node.get("kind").and_then(Value::as_str).unwrap_or("");
        let children: Vec<&Value> = node
            .get("inner")
            .and_then(Value::as_array)
            .map(|inner| inner.iter().filter(|c| c.get("kind").is_some()).collect())
            .unwrap_or_default();

        if NodeKind::is_clang_transparent(kind) {
            self.track_node(node);
            for child in children {
                self.convert(child, parent, field);
            }
            return;
        }

        let Some(facts) = self.facts(node) else {
            // Still walk the children so file/line tracking stays in sync
            for child in children {
                self.skip(child);
            }
            return;
        };

        let attach = add_clang_node(&mut self.builder, Some(parent), field, &facts);
        let count = children.len();
        for (index, child) in children.into_iter().enumerate() {
            let child_kind = child.get("kind").and_then(Value::as_str).unwrap_or("");
            let (child_parent, child_field) = attach_child(&attach, child_kind, index, count);
            self.convert(child, child_parent, child_field);
        }
    }

    fn skip(&mut self, node: &Value) {
        self.track_node(node);
        if let Some(inner) = node.get("inner").and_then(Value::as_array) {
            for child in inner {
                self.skip(child);
            }
        }
    }
}

fn convert_dump(dump: &Value, source: &str, main_file: &Path) -> SyntaxTree {
    let main_file = main_file.to_string_lossy();
    let mut converter = DumpConverter {
        builder: TreeBuilder::new(source, BACKEND),
        main_file: main_file.as_ref(),
        in_main: true,
        line: 1,
    };
    let root_facts = ClangFacts {
        kind: "TranslationUnitDecl".to_string(),
        range: Some(0..source.len()),
        ..ClangFacts::default()
    };
    let root = add_clang_node(&mut converter.builder, None, None, &root_facts);

    if let Some(inner) = dump.get("inner").and_then(Value::as_array) {
        for node in inner {
            converter.convert(node, root.node, None);
        }
    }
    converter.builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    #[cfg(unix)]
    fn slow_commands_are_killed() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let started = Instant::now();
        let (stdout, status) = run_bounded(command, Duration::from_millis(100), 1024).unwrap();
        assert!(status.is_none());
        assert!(stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    #[cfg(unix)]
    fn output_is_capped() {
        let (stdout, _) = run_bounded(Command::new("yes"), Duration::from_secs(5), 4096).unwrap();
        assert_eq!(stdout.len(), 4096);
    }

    #[test]
    fn strict_json_parses_directly() {
        let value = repair_json(r#"{"kind": "TranslationUnitDecl", "inner": []}"#).unwrap();
        assert_eq!(value["kind"], "TranslationUnitDecl");
    }

    #[test]
    fn trailing_garbage_is_cut_at_last_balanced_object() {
        let value = repair_json("{\"kind\": \"A\", \"s\": \"}{\"}\nerror: 1 error generated").unwrap();
        assert_eq!(value["s"], "}{");
    }

    #[test]
    fn truncated_output_gets_its_closers() {
        let text = r#"{"kind": "TranslationUnitDecl", "inner": [{"kind": "VarDecl", "name": "x"}, {"kind": "FunctionDecl", "na"#;
        let value = repair_json(text).unwrap();
        assert_eq!(value["inner"][0]["name"], "x");
        assert_eq!(value["inner"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn hopeless_output_is_rejected() {
        assert!(repair_json("no json here").is_none());
        assert!(repair_json("{\"a\": ").is_none());
    }

    #[test]
    fn converts_dump_to_shared_shape() {
        let source = "int main() {\n  int x = 5;\n  return x;\n}\n";
        let dump: Value = serde_json::from_str(
            r#"{
              "kind": "TranslationUnitDecl",
              "inner": [
                {"kind": "TypedefDecl", "isImplicit": true, "name": "__int128_t"},
                {"kind": "FunctionDecl", "loc": {"offset": 4, "file": "/tmp/t.c", "line": 1, "col": 5},
                 "range": {"begin": {"offset": 0, "col": 1}, "end": {"offset": 38, "line": 4, "col": 1, "tokLen": 1}},
                 "name": "main", "type": {"qualType": "int ()"},
                 "inner": [
                   {"kind": "CompoundStmt",
                    "range": {"begin": {"offset": 11, "line": 1, "col": 12}, "end": {"offset": 38, "line": 4, "col": 1, "tokLen": 1}},
                    "inner": [
                      {"kind": "DeclStmt",
                       "range": {"begin": {"offset": 15, "line": 2, "col": 3}, "end": {"offset": 24, "col": 12, "tokLen": 1}},
                       "inner": [
                         {"kind": "VarDecl", "loc": {"offset": 19, "col": 7},
                          "range": {"begin": {"offset": 15, "col": 3}, "end": {"offset": 23, "col": 11, "tokLen": 1}},
                          "name": "x", "type": {"qualType": "int"}, "init": "c",
                          "inner": [
                            {"kind": "IntegerLiteral",
                             "range": {"begin": {"offset": 23, "col": 11}, "end": {"offset": 23, "col": 11, "tokLen": 1}},
                             "value": "5"}
                          ]}
                       ]},
                      {"kind": "ReturnStmt",
                       "range": {"begin": {"offset": 28, "line": 3, "col": 3}, "end": {"offset": 35, "col": 10, "tokLen": 1}},
                       "inner": [
                         {"kind": "ImplicitCastExpr",
                          "range": {"begin": {"offset": 35, "col": 10}, "end": {"offset": 35, "col": 10, "tokLen": 1}},
                          "inner": [
                            {"kind": "DeclRefExpr",
                             "range": {"begin": {"offset": 35, "col": 10}, "end": {"offset": 35, "col": 10, "tokLen": 1}},
                             "referencedDecl": {"name": "x"}}
                          ]}
                       ]}
                    ]}
                 ]}
              ]
            }"#,
        )
        .unwrap();

        let tree = convert_dump(&dump, source, Path::new("/tmp/t.c"));
        assert_eq!(tree.backend(), BACKEND);
        assert_eq!(tree.find_all(&NodeKind::FunctionDefinition).len(), 1);
        assert!(tree.find_all(&NodeKind::TypeDefinition).is_empty());

        let decls = tree.declarations();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "x");
        assert_eq!(decls[0].initializer.map(|n| n.text()), Some("5"));

        let ret = tree.find_all(&NodeKind::ReturnStatement)[0];
        assert_eq!(ret.start().line, 2);
        assert_eq!(ret.text(), "return x");
        let ident = ret.child_by_kind(&NodeKind::Identifier).unwrap();
        assert_eq!(ident.text(), "x");
    }

    #[test]
    fn missing_executable_is_unavailable() {
        let backend = ClangDumpBackend::new(ClangOptions {
            executable: "definitely-not-a-real-clang-binary".into(),
            ..ClangOptions::default()
        });
        assert!(matches!(backend.parse("int x;"), Err(ScanError::BackendUnavailable { .. })));
    }
}
