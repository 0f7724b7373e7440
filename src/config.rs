use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Auto,      // Use the tree when a backend produced one
    Ast,       // Require a tree, warn when none is available
    Heuristic, // Skip parsing, line-based paths only
}

impl std::str::FromStr for Engine {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Engine::Auto),
            "ast" => Ok(Engine::Ast),
            "heuristic" => Ok(Engine::Heuristic),
            other => Err(ScanError::Config(format!("unknown engine '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryToggles {
    pub uninitialized: bool,
    pub wild_pointers: bool,
    pub null_pointers: bool,
    pub dead_loops: bool,
    pub memory_leaks: bool,
    pub numeric_range: bool,
    pub format_strings: bool,
    pub library_headers: bool,
}

impl Default for CategoryToggles {
    fn default() -> Self {
        CategoryToggles {
            uninitialized: true,
            wild_pointers: true,
            null_pointers: true,
            dead_loops: true,
            memory_leaks: true,
            numeric_range: true,
            format_strings: true,
            library_headers: true,
        }
    }
}

/// Settings for the `clang -ast-dump=json` subprocess backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClangOptions {
    pub executable: String,
    pub include_dirs: Vec<String>,
    pub timeout_s: u64,
    pub max_output_mb: u64,
}

impl Default for ClangOptions {
    fn default() -> Self {
        ClangOptions {
            executable: "clang".to_string(),
            include_dirs: vec!["/usr/include".into(), "/usr/local/include".into(), ".".into()],
            timeout_s: 30,
            max_output_mb: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub categories: CategoryToggles,
    pub engine: Engine,
    pub parallel: bool,
    pub ast_cache: bool,
    pub max_file_size_mb: u64,
    pub timeout_s: u64,
    pub clang: ClangOptions,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            categories: CategoryToggles::default(),
            engine: Engine::Auto,
            parallel: false,
            ast_cache: true,
            max_file_size_mb: 50,
            timeout_s: 30,
            clang: ClangOptions::default(),
        }
    }
}

impl Config {
    /// Only the uninitialized and wild pointer checks, no parsing.
    pub fn minimal() -> Self {
        Config {
            categories: CategoryToggles {
                uninitialized: true,
                wild_pointers: true,
                null_pointers: false,
                dead_loops: false,
                memory_leaks: false,
                numeric_range: false,
                format_strings: false,
                library_headers: false,
            },
            engine: Engine::Heuristic,
            ..Config::default()
        }
    }

    pub fn comprehensive() -> Self {
        Config { engine: Engine::Ast, parallel: true, ast_cache: true, ..Config::default() }
    }

    pub fn performance() -> Self {
        Config {
            engine: Engine::Heuristic,
            parallel: true,
            ast_cache: false,
            max_file_size_mb: 10,
            timeout_s: 10,
            ..Config::default()
        }
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "default" => Ok(Config::default()),
            "minimal" => Ok(Config::minimal()),
            "comprehensive" => Ok(Config::comprehensive()),
            "performance" => Ok(Config::performance()),
            other => Err(ScanError::Config(format!("unknown preset '{}'", other))),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Config::from_json_str(&text)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json_str(
            r#"{"engine": "heuristic", "categories": {"memory_leaks": false}, "clang": {"timeout_s": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.engine, Engine::Heuristic);
        assert!(!config.categories.memory_leaks);
        assert!(config.categories.uninitialized);
        assert_eq!(config.clang.timeout_s, 5);
        assert_eq!(config.clang.executable, "clang");
        assert_eq!(config.max_file_size_mb, 50);
    }

    #[test]
    fn rejects_unknown_engine() {
        assert!(Config::from_json_str(r#"{"engine": "fast"}"#).is_err());
        assert!("fast".parse::<Engine>().is_err());
        assert_eq!("AST".parse::<Engine>().unwrap(), Engine::Ast);
    }

    #[test]
    fn presets_differ_where_expected() {
        let minimal = Config::minimal();
        assert!(minimal.categories.wild_pointers);
        assert!(!minimal.categories.library_headers);
        assert_eq!(Config::performance().max_file_size_bytes(), 10 * 1024 * 1024);
        assert!(Config::preset("comprehensive").unwrap().parallel);
        assert!(Config::preset("nope").is_err());
    }
}
