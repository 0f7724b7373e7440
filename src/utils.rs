use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z_]\w*").unwrap());

pub const C_KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while", "_Bool", "bool", "NULL", "true", "false",
];

pub fn is_c_keyword(word: &str) -> bool {
    C_KEYWORDS.contains(&word)
}

pub fn is_allocation_function(name: &str) -> bool {
    ["malloc", "calloc", "realloc", "strdup", "strndup", "aligned_alloc"].contains(&name)
}

pub fn is_standard_library_function(name: &str) -> bool {
    let std_functions = [
        "printf", "sprintf", "fprintf", "snprintf", "vprintf", "vsprintf", "vfprintf",
        "vsnprintf", "scanf", "sscanf", "fscanf", "malloc", "calloc", "realloc", "free",
        "strdup", "strndup", "exit", "abort", "atexit", "system", "getenv", "time", "clock",
        "rand", "srand", "atoi", "atol", "atof", "strtol", "strtoul", "strtod", "memcpy",
        "memmove", "memset", "memcmp", "strlen", "strcpy", "strncpy", "strcat", "strncat",
        "strcmp", "strncmp", "strchr", "strrchr", "strstr", "strtok", "fopen", "fclose",
        "fflush", "fread", "fwrite", "fseek", "ftell", "fgets", "fputs", "puts", "putchar",
        "getchar", "gets", "perror", "sqrt", "pow", "fabs", "abs",
    ];

    std_functions.contains(&name)
}

/// Three aligned views of one C file: raw lines, lines with comments
/// blanked, and lines with comments, literal contents and preprocessor
/// directives blanked. Column offsets are identical across views.
#[derive(Debug, Clone, Default)]
pub struct SourceText {
    pub raw: Vec<String>,
    pub code: Vec<String>,
    pub masked: Vec<String>,
}

impl SourceText {
    pub fn new(source: &str) -> Self {
        let raw: Vec<String> = source
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();
        let (code, masked) = strip_comments_and_literals(&raw);
        SourceText { raw, code, masked }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

fn blank(out: &mut String, c: char) {
    for _ in 0..c.len_utf8() {
        out.push(' ');
    }
}

fn strip_comments_and_literals(raw: &[String]) -> (Vec<String>, Vec<String>) {
    let mut code = Vec::with_capacity(raw.len());
    let mut masked = Vec::with_capacity(raw.len());
    let mut in_block_comment = false;
    let mut in_directive = false;

    for line in raw {
        let mut code_line = String::with_capacity(line.len());
        let mut mask_line = String::with_capacity(line.len());
        let directive_line = in_directive || line.trim_start().starts_with('#');
        in_directive = directive_line && line.trim_end().ends_with('\\');

        let chars: Vec<char> = line.chars().collect();
        let mut quote: Option<char> = None;
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            if in_block_comment {
                if c == '*' && next == Some('/') {
                    in_block_comment = false;
                    code_line.push_str("  ");
                    mask_line.push_str("  ");
                    i += 2;
                } else {
                    blank(&mut code_line, c);
                    blank(&mut mask_line, c);
                    i += 1;
                }
                continue;
            }

            if let Some(q) = quote {
                code_line.push(c);
                if c == '\\' {
                    blank(&mut mask_line, c);
                    if let Some(n) = next {
                        code_line.push(n);
                        blank(&mut mask_line, n);
                    }
                    i += 2;
                    continue;
                }
                if c == q {
                    quote = None;
                    mask_line.push(c);
                } else {
                    blank(&mut mask_line, c);
                }
                i += 1;
                continue;
            }

            match (c, next) {
                ('/', Some('/')) => {
                    for rest in &chars[i..] {
                        blank(&mut code_line, *rest);
                        blank(&mut mask_line, *rest);
                    }
                    break;
                }
                ('/', Some('*')) => {
                    in_block_comment = true;
                    code_line.push_str("  ");
                    mask_line.push_str("  ");
                    i += 2;
                }
                ('"', _) | ('\'', _) => {
                    quote = Some(c);
                    code_line.push(c);
                    mask_line.push(c);
                    i += 1;
                }
                _ => {
                    code_line.push(c);
                    mask_line.push(c);
                    i += 1;
                }
            }
        }

        if directive_line {
            mask_line = " ".repeat(mask_line.len());
        }
        code.push(code_line);
        masked.push(mask_line);
    }

    (code, masked)
}

/// Split a call's argument text on top-level commas. Commas inside nested
/// brackets, string literals and character literals do not split.
pub fn split_arguments(args: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in args.chars() {
        if let Some(q) = quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }

    if !current.trim().is_empty() || !parts.is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Index of the delimiter closing the one at `open`, skipping literals.
pub fn find_matching(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let (open_c, close_c) = match bytes.get(open)? {
        b'(' => (b'(', b')'),
        b'[' => (b'[', b']'),
        b'{' => (b'{', b'}'),
        _ => return None,
    };
    let mut depth = 0;
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == q {
                quote = None;
            }
            continue;
        }
        if b == b'"' || b == b'\'' {
            quote = Some(b);
        } else if b == open_c {
            depth += 1;
        } else if b == close_c {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// A call site found in a line of text.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    pub name: String,
    pub column: usize,
    pub arguments: Vec<String>,
}

/// Find every `name(...)` call in `text`. Keywords are skipped and calls
/// whose parentheses do not close on this text are returned with no arguments.
pub fn find_calls(text: &str) -> Vec<CallSite> {
    static CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([A-Za-z_]\w*)\s*\(").unwrap());

    CALL.captures_iter(text)
        .filter_map(|cap| {
            let name = cap.get(1)?;
            if is_c_keyword(name.as_str()) {
                return None;
            }
            // Skip `->f(` and `.f(` member calls
            let before = text[..name.start()].trim_end();
            if before.ends_with("->") || before.ends_with('.') {
                return None;
            }
            let open = cap.get(0)?.end() - 1;
            let arguments = find_matching(text, open)
                .map(|close| split_arguments(&text[open + 1..close]))
                .unwrap_or_default();
            Some(CallSite { name: name.as_str().to_string(), column: name.start(), arguments })
        })
        .collect()
}

/// A `{ ... }` region located by brace-depth scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub open_line: usize,
    pub open_column: usize,
    pub close_line: usize,
    pub close_column: usize,
}

/// Find the block whose opening brace is the first `{` at or after
/// (`line`, `column`) in `masked` and return it with its closing brace.
pub fn find_block(masked: &[String], line: usize, column: usize) -> Option<Block> {
    let mut depth = 0usize;
    let mut open: Option<(usize, usize)> = None;

    for (i, text) in masked.iter().enumerate().skip(line) {
        let start = if i == line { column.min(text.len()) } else { 0 };
        for (j, c) in text[start..].char_indices() {
            let col = start + j;
            match c {
                '{' => {
                    if open.is_none() {
                        open = Some((i, col));
                    }
                    depth += 1;
                }
                '}' if open.is_some() => {
                    depth -= 1;
                    if depth == 0 {
                        let (open_line, open_column) = open?;
                        return Some(Block { open_line, open_column, close_line: i, close_column: col });
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Text strictly inside a block, lines joined with '\n'.
pub fn block_body(lines: &[String], block: &Block) -> String {
    if block.open_line == block.close_line {
        let line = &lines[block.open_line];
        return line.get(block.open_column + 1..block.close_column).unwrap_or("").to_string();
    }
    let mut body = String::new();
    body.push_str(lines[block.open_line].get(block.open_column + 1..).unwrap_or(""));
    for l in &lines[block.open_line + 1..block.close_line] {
        body.push('\n');
        body.push_str(l);
    }
    body.push('\n');
    body.push_str(lines[block.close_line].get(..block.close_column).unwrap_or(""));
    body
}

/// Identifier tokens with their byte columns.
pub fn identifiers(text: &str) -> impl Iterator<Item = (usize, &str)> {
    IDENTIFIER.find_iter(text).filter_map(move |m| {
        // Skip the tails of numeric literals such as 10UL or 0x1F
        let preceded_by_digit = text[..m.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_digit() || c == '.');
        (!preceded_by_digit).then(|| (m.start(), m.as_str()))
    })
}

/// Whether `word` appears in `text` as a whole identifier.
pub fn contains_word(text: &str, word: &str) -> bool {
    identifiers(text).any(|(_, w)| w == word)
}

/// Parse a C integer literal: decimal, `0x` hex, leading-zero octal, integer
/// suffixes, optional sign and surrounding parentheses.
pub fn parse_int_literal(text: &str) -> Option<i128> {
    let (negative, radix, digits) = int_literal_digits(text)?;
    let value = i128::from_str_radix(digits, radix).ok()?;
    Some(if negative { -value } else { value })
}

/// An integer literal whose magnitude does not fit in 128 bits.
pub fn is_oversized_int_literal(text: &str) -> bool {
    int_literal_digits(text).is_some_and(|(_, radix, digits)| i128::from_str_radix(digits, radix).is_err())
}

fn int_literal_digits(text: &str) -> Option<(bool, u32, &str)> {
    let mut s = text.trim();
    while s.starts_with('(') && s.ends_with(')') {
        s = s[1..s.len() - 1].trim();
    }
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, s.strip_prefix('+').unwrap_or(s).trim_start()),
    };
    let digits = body.trim_end_matches(['u', 'U', 'l', 'L']);

    let (radix, digits) = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        (16, hex)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    (!digits.is_empty() && digits.chars().all(|c| c.is_digit(radix))).then_some((negative, radix, digits))
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Remove leading C casts such as `(char *)` or `(struct node*)`.
pub fn strip_casts(expr: &str) -> &str {
    static CAST: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^\(\s*(?:const\s+|unsigned\s+|signed\s+|struct\s+|enum\s+|union\s+)*[A-Za-z_]\w*(?:\s+[A-Za-z_]\w*)*\s*\**\s*\)\s*")
            .unwrap()
    });

    let mut s = expr.trim();
    while let Some(m) = CAST.find(s) {
        // `(x) + 1` is not a cast, only strip when something follows
        if m.end() >= s.len() {
            break;
        }
        s = s[m.end()..].trim_start();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn masks_comments_and_literals_keeping_columns() {
        let src = "int x = 1; // trailing\nchar *s = \"a, b\"; /* block\n still */ int y;\n#include <stdio.h>";
        let text = SourceText::new(src);
        assert_eq!(text.len(), 4);
        assert_eq!(text.code[0].trim_end(), "int x = 1;");
        assert_eq!(text.masked[1].trim_end(), "char *s = \"    \";");
        assert_eq!(text.code[1].trim_end(), "char *s = \"a, b\";");
        assert_eq!(text.masked[2].trim(), "int y;");
        assert_eq!(text.masked[2].len(), text.raw[2].len());
        assert_eq!(text.masked[3].trim(), "");
        assert_eq!(text.code[3], "#include <stdio.h>");
    }

    #[test]
    fn splits_arguments_respecting_nesting() {
        let args = split_arguments(r#""%d, %s\n", f(a, b), arr[1,2], ',', "x\"y,z""#);
        assert_eq!(args, vec![r#""%d, %s\n""#, "f(a, b)", "arr[1,2]", "','", r#""x\"y,z""#]);
        assert!(split_arguments("").is_empty());
        assert_eq!(split_arguments("a"), vec!["a"]);
    }

    #[test]
    fn finds_calls_with_arguments() {
        let calls = find_calls("if (x) printf(\"%d\", max(a, b)); p->run(1);");
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["printf", "max"]);
        assert_eq!(calls[0].arguments, vec!["\"%d\"", "max(a, b)"]);
    }

    #[test]
    fn locates_blocks_across_lines() {
        let text = SourceText::new("while (1) {\n  if (x) { y++; }\n}\nz = 0;");
        let block = find_block(&text.masked, 0, 0).unwrap();
        assert_eq!((block.open_line, block.close_line), (0, 2));
        let body = block_body(&text.masked, &block);
        assert!(body.contains("y++"));
        assert!(find_block(&text.masked, 3, 0).is_none());
    }

    #[test]
    fn parses_integer_literals() {
        assert_eq!(parse_int_literal("200"), Some(200));
        assert_eq!(parse_int_literal("-129"), Some(-129));
        assert_eq!(parse_int_literal("0x1F"), Some(31));
        assert_eq!(parse_int_literal("0400"), Some(256));
        assert_eq!(parse_int_literal("4294967296UL"), Some(4294967296));
        assert_eq!(parse_int_literal("(-5)"), Some(-5));
        assert_eq!(parse_int_literal("0"), Some(0));
        assert_eq!(parse_int_literal("x"), None);
        assert_eq!(parse_int_literal("1.5"), None);
        assert_eq!(parse_int_literal("999999999999999999999999999999999999999999"), None);
        assert!(is_oversized_int_literal("999999999999999999999999999999999999999999"));
        assert!(is_oversized_int_literal("0xFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF"));
        assert!(!is_oversized_int_literal("42"));
        assert!(!is_oversized_int_literal("1.5"));
        assert!(!is_oversized_int_literal("09"));
    }

    #[test]
    fn measures_edit_distance() {
        assert_eq!(edit_distance("stdiox.h", "stdio.h"), 1);
        assert_eq!(edit_distance("stdoi.h", "stdio.h"), 2);
        assert_eq!(edit_distance("", "abc"), 3);
    }

    #[test]
    fn strips_casts_only_when_followed_by_expression() {
        assert_eq!(strip_casts("(int *) malloc(4)"), "malloc(4)");
        assert_eq!(strip_casts("(struct node*)calloc(1, 8)"), "calloc(1, 8)");
        assert_eq!(strip_casts("(x)"), "(x)");
    }

    #[test]
    fn identifiers_skip_literal_suffixes() {
        let words: Vec<&str> = identifiers("x = 10UL + y1;").map(|(_, w)| w).collect();
        assert_eq!(words, vec!["x", "y1"]);
    }
}
