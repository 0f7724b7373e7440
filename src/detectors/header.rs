use std::collections::{BTreeMap, BTreeSet, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::error::Result;
use crate::types::{Category, Issue};
use crate::utils;

use super::{DetectionContext, Detector};

static INCLUDE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^\s*#\s*include\s*([<"])([^>"]+)[>"]"#).unwrap());

const FUNCTION_HEADERS: &[(&str, &str)] = &[
    ("malloc", "stdlib.h"),
    ("free", "stdlib.h"),
    ("calloc", "stdlib.h"),
    ("realloc", "stdlib.h"),
    ("rand", "stdlib.h"),
    ("srand", "stdlib.h"),
    ("exit", "stdlib.h"),
    ("abort", "stdlib.h"),
    ("atoi", "stdlib.h"),
    ("atof", "stdlib.h"),
    ("atol", "stdlib.h"),
    ("strtol", "stdlib.h"),
    ("strtod", "stdlib.h"),
    ("qsort", "stdlib.h"),
    ("printf", "stdio.h"),
    ("scanf", "stdio.h"),
    ("fprintf", "stdio.h"),
    ("sprintf", "stdio.h"),
    ("snprintf", "stdio.h"),
    ("sscanf", "stdio.h"),
    ("fscanf", "stdio.h"),
    ("getchar", "stdio.h"),
    ("putchar", "stdio.h"),
    ("gets", "stdio.h"),
    ("puts", "stdio.h"),
    ("fgets", "stdio.h"),
    ("fputs", "stdio.h"),
    ("fopen", "stdio.h"),
    ("fclose", "stdio.h"),
    ("fread", "stdio.h"),
    ("fwrite", "stdio.h"),
    ("fseek", "stdio.h"),
    ("ftell", "stdio.h"),
    ("rewind", "stdio.h"),
    ("feof", "stdio.h"),
    ("ferror", "stdio.h"),
    ("perror", "stdio.h"),
    ("strlen", "string.h"),
    ("strcpy", "string.h"),
    ("strncpy", "string.h"),
    ("strcmp", "string.h"),
    ("strncmp", "string.h"),
    ("strcat", "string.h"),
    ("strncat", "string.h"),
    ("strchr", "string.h"),
    ("strrchr", "string.h"),
    ("strstr", "string.h"),
    ("strtok", "string.h"),
    ("strdup", "string.h"),
    ("memcpy", "string.h"),
    ("memmove", "string.h"),
    ("memset", "string.h"),
    ("memcmp", "string.h"),
    ("sqrt", "math.h"),
    ("pow", "math.h"),
    ("sin", "math.h"),
    ("cos", "math.h"),
    ("tan", "math.h"),
    ("log", "math.h"),
    ("log10", "math.h"),
    ("exp", "math.h"),
    ("floor", "math.h"),
    ("ceil", "math.h"),
    ("fabs", "math.h"),
    ("isalpha", "ctype.h"),
    ("isdigit", "ctype.h"),
    ("islower", "ctype.h"),
    ("isupper", "ctype.h"),
    ("isalnum", "ctype.h"),
    ("isspace", "ctype.h"),
    ("toupper", "ctype.h"),
    ("tolower", "ctype.h"),
    ("time", "time.h"),
    ("clock", "time.h"),
    ("ctime", "time.h"),
    ("localtime", "time.h"),
    ("gmtime", "time.h"),
];

/// Misspellings seen often enough to correct without a distance check.
const KNOWN_TYPOS: &[(&str, &str)] = &[
    ("stdoi.h", "stdio.h"),
    ("stdllib.h", "stdlib.h"),
    ("stirng.h", "string.h"),
    ("mth.h", "math.h"),
    ("ctyp.h", "ctype.h"),
    ("tim.h", "time.h"),
];

/// C standard and common POSIX headers.
const KNOWN_HEADERS: &[&str] = &[
    "assert.h", "complex.h", "ctype.h", "errno.h", "fenv.h", "float.h", "inttypes.h", "iso646.h",
    "limits.h", "locale.h", "math.h", "setjmp.h", "signal.h", "stdalign.h", "stdarg.h",
    "stdatomic.h", "stdbool.h", "stddef.h", "stdint.h", "stdio.h", "stdlib.h", "stdnoreturn.h",
    "string.h", "tgmath.h", "threads.h", "time.h", "uchar.h", "wchar.h", "wctype.h",
    "unistd.h", "fcntl.h", "pthread.h", "strings.h", "dirent.h", "poll.h", "sched.h",
    "semaphore.h", "termios.h", "dlfcn.h", "syslog.h", "pwd.h", "grp.h", "regex.h", "getopt.h",
    "libgen.h", "glob.h", "fnmatch.h", "netdb.h", "sys/types.h", "sys/stat.h", "sys/wait.h",
    "sys/time.h", "sys/socket.h", "sys/mman.h", "sys/ioctl.h", "sys/select.h", "sys/resource.h",
    "sys/un.h", "netinet/in.h", "arpa/inet.h",
];

/// The standard header `header` most likely meant, if it is a misspelling.
pub fn correct_header(header: &str) -> Option<&'static str> {
    if KNOWN_HEADERS.contains(&header) {
        return None;
    }
    if let Some((_, fixed)) = KNOWN_TYPOS.iter().find(|(typo, _)| *typo == header) {
        return Some(*fixed);
    }
    if let Some(stem) = header.strip_suffix("x.h") {
        let candidate = format!("{}.h", stem);
        if let Some(known) = KNOWN_HEADERS.iter().find(|h| **h == candidate) {
            return Some(*known);
        }
    }
    KNOWN_HEADERS
        .iter()
        .map(|known| (utils::edit_distance(header, known), *known))
        .filter(|(distance, _)| *distance <= 2)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, known)| known)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Include {
    header: String,
    angle: bool,
    line: usize,
}

/// Library calls whose header was never included, plus misspelled
/// standard includes.
pub struct HeaderDetector {
    mapping: BTreeMap<String, String>,
}

impl Default for HeaderDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderDetector {
    pub fn new() -> Self {
        Self::with_mapping(
            FUNCTION_HEADERS
                .iter()
                .map(|(function, header)| (function.to_string(), header.to_string()))
                .collect(),
        )
    }

    /// Replace the whole function to header table.
    pub fn with_mapping(mapping: BTreeMap<String, String>) -> Self {
        HeaderDetector { mapping }
    }

    pub fn add_function_header(&mut self, function: &str, header: &str) {
        self.mapping.insert(function.to_string(), header.to_string());
    }

    pub fn remove_function_header(&mut self, function: &str) {
        self.mapping.remove(function);
    }

    pub fn function_headers(&self) -> &BTreeMap<String, String> {
        &self.mapping
    }

    fn includes(ctx: &DetectionContext) -> Vec<Include> {
        let mut seen = BTreeSet::new();
        let mut includes = Vec::new();
        if ctx.has_tree() {
            for inc in ctx.tree.includes() {
                if seen.insert((inc.line, inc.header.clone())) {
                    includes.push(Include { header: inc.header, angle: inc.angle, line: inc.line });
                }
            }
        }
        // The line scan also catches includes the backend dropped
        for (line, text) in ctx.text.code.iter().enumerate() {
            if let Some(cap) = INCLUDE.captures(text) {
                let header = cap[2].trim().to_string();
                if seen.insert((line, header.clone())) {
                    includes.push(Include { header, angle: &cap[1] == "<", line });
                }
            }
        }
        includes.sort_by_key(|inc| inc.line);
        includes
    }

    /// Called function names with their lines, in source order.
    fn calls(ctx: &DetectionContext) -> Vec<(String, usize)> {
        let mut calls: Vec<(usize, usize, String)> = if ctx.has_tree() {
            ctx.tree
                .calls()
                .into_iter()
                .map(|c| (c.position.line, c.position.column, c.name.to_string()))
                .collect()
        } else {
            ctx.text
                .masked
                .iter()
                .enumerate()
                .flat_map(|(line, text)| {
                    utils::find_calls(text).into_iter().map(move |c| (line, c.column, c.name))
                })
                .collect()
        };
        calls.sort();
        calls.into_iter().map(|(line, _, name)| (name, line)).collect()
    }
}

impl Detector for HeaderDetector {
    fn name(&self) -> &'static str {
        "header"
    }

    fn description(&self) -> &'static str {
        "Library functions used without their header and misspelled includes"
    }

    fn is_enabled(&self, config: &Config) -> bool {
        config.categories.library_headers
    }

    fn detect(&self, ctx: &DetectionContext) -> Result<Vec<Issue>> {
        let includes = Self::includes(ctx);
        let included: HashSet<&str> = includes.iter().map(|inc| inc.header.as_str()).collect();
        let defined: HashSet<&str> = ctx.symbols.frames.iter().map(|f| f.function_name.as_str()).collect();

        let mut issues = Vec::new();
        let mut reported: HashSet<&str> = HashSet::new();

        for (name, line) in Self::calls(ctx) {
            if defined.contains(name.as_str()) {
                continue;
            }
            let Some(header) = self.mapping.get(&name) else {
                continue;
            };
            if included.contains(header.as_str()) || reported.contains(header.as_str()) {
                continue;
            }
            // A misspelled include of this header is reported below instead
            if includes.iter().any(|inc| correct_header(&inc.header) == Some(header.as_str())) {
                continue;
            }
            reported.insert(header.as_str());
            issues.push(ctx.issue(
                line,
                Category::Header,
                format!("Function '{}' is used without including <{}>", name, header),
            ));
        }

        for inc in includes.iter().filter(|inc| inc.angle) {
            if let Some(fixed) = correct_header(&inc.header) {
                issues.push(ctx.issue(
                    inc.line,
                    Category::Header,
                    format!("Unknown header <{}>, did you mean <{}>?", inc.header, fixed),
                ));
            }
        }

        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::{lines, Fixture};
    use pretty_assertions::assert_eq;

    #[test]
    fn repeated_call_reports_header_once() {
        let source = "#include <stdio.h>\nint main() {\n    int *a = malloc(4);\n    int *b = malloc(8);\n    free(a);\n    free(b);\n    return 0;\n}\n";
        for fixture in [Fixture::new(source), Fixture::heuristic(source)] {
            let issues = fixture.run(&HeaderDetector::new());
            assert_eq!(lines(&issues), vec![3]);
            assert!(issues[0].message.contains("stdlib.h"));
        }
    }

    #[test]
    fn misspelled_include_suggests_fix() {
        let source = "#include <stdiox.h>\nint main() {\n    printf(\"hi\\n\");\n    return 0;\n}\n";
        let issues = Fixture::new(source).run(&HeaderDetector::new());
        assert_eq!(lines(&issues), vec![1]);
        assert!(issues[0].message.contains("stdio.h"));
    }

    #[test]
    fn corrections() {
        assert_eq!(correct_header("stdoi.h"), Some("stdio.h"));
        assert_eq!(correct_header("stringx.h"), Some("string.h"));
        assert_eq!(correct_header("stdlb.h"), Some("stdlib.h"));
        assert_eq!(correct_header("strings.h"), None);
        assert_eq!(correct_header("gtk/gtk.h"), None);
    }

    #[test]
    fn user_definitions_and_custom_mapping() {
        let source = "int sqrt(int x) {\n    return x;\n}\nint main() {\n    return sqrt(4) + clamp(3);\n}\n";
        assert!(Fixture::new(source).run(&HeaderDetector::new()).is_empty());

        let mut detector = HeaderDetector::new();
        detector.add_function_header("clamp", "mylib.h");
        let issues = Fixture::new(source).run(&detector);
        assert_eq!(lines(&issues), vec![5]);
        assert!(issues[0].message.contains("mylib.h"));

        detector.remove_function_header("clamp");
        assert!(Fixture::new(source).run(&detector).is_empty());
    }

    #[test]
    fn quoted_includes_count_but_are_not_corrected() {
        let source = "#include \"stdio.h\"\n#include \"mylibx.h\"\nint main() {\n    puts(\"x\");\n    return 0;\n}\n";
        assert!(Fixture::new(source).run(&HeaderDetector::new()).is_empty());
    }
}
