use std::io::Write;

use cbugscan::formatters::format_issues_as_json;
use cbugscan::{analyze, Analyzer, Category, Config, Engine, Issue, ScanError};
use pretty_assertions::assert_eq;

fn engines() -> Vec<Config> {
    vec![
        Config::default(),
        Config { engine: Engine::Heuristic, ..Config::default() },
        Config { parallel: true, ..Config::default() },
    ]
}

fn of(issues: &[Issue], category: Category) -> Vec<&Issue> {
    issues.iter().filter(|i| i.category == category).collect()
}

fn each_engine(source: &str, check: impl Fn(&[Issue])) {
    for config in engines() {
        check(&analyze(source, "sample.c", &config));
    }
}

#[test]
fn analysis_is_idempotent() {
    let source = "#include <stdio.h>\nint main() {\n    int x;\n    int *p;\n    char c = 300;\n    printf(\"%d\\n\", x, c);\n    *p = 2;\n    while (1) { }\n}\n";
    for config in engines() {
        let first = analyze(source, "sample.c", &config);
        let second = analyze(source, "sample.c", &config);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}

#[test]
fn one_uninitialized_issue_at_first_use() {
    let source = "int main() {\n    int x;\n    int y = x;\n    y = x + y;\n    return x;\n}\n";
    each_engine(source, |issues| {
        let found = of(issues, Category::Uninitialized);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 3);
        assert_eq!(found[0].code_line, "    int y = x;");
    });
}

#[test]
fn one_wild_pointer_issue_at_first_dereference() {
    let source = "int main() {\n    int *p;\n    *p = 1;\n    *p = 2;\n    return 0;\n}\n";
    each_engine(source, |issues| {
        let found = of(issues, Category::WildPointer);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 3);
    });
}

#[test]
fn null_pointer_flow() {
    let null = "int main() {\n    int *p = NULL;\n    *p = 1;\n    return 0;\n}\n";
    each_engine(null, |issues| {
        assert_eq!(of(issues, Category::NullPointer).len(), 1);
    });

    let reassigned = "#include <stdlib.h>\nint main() {\n    int *p = NULL;\n    p = malloc(sizeof(int));\n    *p = 1;\n    free(p);\n    return 0;\n}\n";
    each_engine(reassigned, |issues| assert!(issues.is_empty(), "{:?}", issues));
}

#[test]
fn infinite_loops_need_an_exit() {
    let with_exit = "int main() {\n    int x = 0;\n    for (;;) {\n        if (x > 0) break;\n        x++;\n    }\n    return 0;\n}\n";
    each_engine(with_exit, |issues| assert!(of(issues, Category::DeadLoop).is_empty()));

    let without = "int main() {\n    for (;;) { }\n}\n";
    each_engine(without, |issues| {
        let found = of(issues, Category::DeadLoop);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 2);
    });
}

#[test]
fn leaks_unless_freed_or_returned() {
    let leak = "#include <stdlib.h>\nvoid f() {\n    int *p = malloc(4);\n    *p = 1;\n}\n";
    each_engine(leak, |issues| {
        let found = of(issues, Category::MemoryLeak);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 3);
    });

    let returned = "#include <stdlib.h>\nint *f() {\n    int *p = malloc(4);\n    return p;\n}\n";
    each_engine(returned, |issues| assert!(of(issues, Category::MemoryLeak).is_empty()));
}

#[test]
fn char_range() {
    each_engine("int main() {\n    char c = 200;\n    return c;\n}\n", |issues| {
        let found = of(issues, Category::RangeOverflow);
        assert_eq!(found.len(), 1);
        assert!(found[0].message.contains("(-128, 127)"));
    });
    each_engine("int main() {\n    unsigned char c = 200;\n    return c;\n}\n", |issues| {
        assert!(of(issues, Category::RangeOverflow).is_empty());
    });
}

#[test]
fn printf_argument_count() {
    let source = "#include <stdio.h>\nint main() {\n    int a = 1;\n    printf(\"%d %s\", a);\n    return 0;\n}\n";
    each_engine(source, |issues| {
        let found = of(issues, Category::Format);
        assert_eq!(found.len(), 1);
        assert!(found[0].message.contains("requires 2"));
        assert!(found[0].message.contains("but 1 provided"));
    });
}

#[test]
fn missing_header_reported_once() {
    let source = "int main() {\n    int *a = malloc(4);\n    int *b = malloc(4);\n    free(a);\n    free(b);\n    return 0;\n}\n";
    each_engine(source, |issues| {
        let found = of(issues, Category::Header);
        assert_eq!(found.len(), 1);
        assert!(found[0].message.contains("stdlib.h"));
    });
}

#[test]
fn misspelled_header_suggestion() {
    let source = "#include <stdiox.h>\nint main() {\n    printf(\"hello\\n\");\n    return 0;\n}\n";
    each_engine(source, |issues| {
        let found = of(issues, Category::Header);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 1);
        assert!(found[0].message.contains("stdio.h"));
    });
}

#[test]
fn toggles_silence_categories() {
    let source = "int main() {\n    int x;\n    char c = 200;\n    return x + c;\n}\n";
    let mut config = Config::default();
    config.categories.uninitialized = false;
    let issues = analyze(source, "sample.c", &config);
    assert!(of(&issues, Category::Uninitialized).is_empty());
    assert_eq!(of(&issues, Category::RangeOverflow).len(), 1);

    let minimal = analyze(source, "sample.c", &Config::minimal());
    assert!(minimal.iter().all(|i| i.category == Category::Uninitialized));
    assert_eq!(minimal.len(), 1);
}

#[test]
fn broken_sources_do_not_fail() {
    for config in engines() {
        assert!(analyze("", "empty.c", &config).is_empty());
        analyze("int main( {\n    int *p = \n}}}\n", "broken.c", &config);
    }
}

#[test]
fn files_are_read_and_limited() {
    let mut file = tempfile::Builder::new().suffix(".c").tempfile().unwrap();
    write!(file, "int main() {{\n    int x;\n    return x;\n}}\n").unwrap();

    let analyzer = Analyzer::new(Config::default());
    let issues = analyzer.analyze_file(file.path()).unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].file, file.path().to_string_lossy());

    let limited = Analyzer::new(Config { max_file_size_mb: 0, ..Config::default() });
    assert!(matches!(limited.analyze_file(file.path()), Err(ScanError::FileTooLarge { .. })));
}

#[test]
fn json_report_shape() {
    let issues = analyze("int main() {\n    int x;\n    return x;\n}\n", "sample.c", &Config::default());
    let value: serde_json::Value = serde_json::from_str(&format_issues_as_json(&issues).unwrap()).unwrap();
    assert_eq!(value["total"], 1);
    assert_eq!(value["issues"][0]["file"], "sample.c");
    assert_eq!(value["issues"][0]["category"], "Uninitialized");
    assert_eq!(value["issues"][0]["codeLine"], "    return x;");
    assert_eq!(value["summary"]["Uninitialized"], 1);
}
