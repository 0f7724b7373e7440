use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rayon::prelude::*;
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use cbugscan::formatters::{self, OutputFormat};
use cbugscan::{sort_issues, Analyzer, Config, Engine, Issue, ScanError};

#[derive(Debug, StructOpt)]
#[structopt(name = "cbugscan", about = "Find common bugs in C source files")]
struct Opt {
    /// C files or directories to scan recursively
    #[structopt(parse(from_os_str))]
    inputs: Vec<PathBuf>,

    /// JSON configuration file
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Named preset: default, minimal, comprehensive or performance
    #[structopt(long, conflicts_with = "config")]
    preset: Option<String>,

    /// auto, ast or heuristic
    #[structopt(long)]
    engine: Option<Engine>,

    /// Run detectors and files in parallel
    #[structopt(long)]
    parallel: bool,

    /// Output format (text or json)
    #[structopt(short, long, default_value = "text")]
    format: OutputFormat,

    /// Output file
    #[structopt(parse(from_os_str), short, long)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[structopt(long)]
    debug: bool,

    /// Print the detectors and whether the configuration enables them
    #[structopt(long)]
    list_detectors: bool,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    init_logging(opt.debug);

    let config = load_config(&opt)?;
    let analyzer = Arc::new(Analyzer::new(config.clone()));

    if opt.list_detectors {
        for info in analyzer.detectors().list_detectors(&config) {
            let state = if info.enabled { "on" } else { "off" };
            println!("{:<14} {:<4} {}", info.name, state, info.description);
        }
        return Ok(());
    }

    if opt.inputs.is_empty() {
        anyhow::bail!("No input files given");
    }
    let files = collect_sources(&opt.inputs)?;
    info!("scanning {} file(s)", files.len());

    let run = |path: &PathBuf| analyze_with_timeout(&analyzer, path, config.timeout_s);
    let mut issues: Vec<Issue> = if config.parallel {
        files.par_iter().flat_map(run).collect()
    } else {
        files.iter().flat_map(run).collect()
    };
    sort_issues(&mut issues);

    let output = formatters::format_issues(&issues, opt.format)?;
    if let Some(output_path) = &opt.output {
        fs::write(output_path, output).with_context(|| format!("Failed to write to file: {:?}", output_path))?;
        println!("Report written to {:?}", output_path);
    } else {
        print!("{}", output);
    }

    Ok(())
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(opt: &Opt) -> Result<Config> {
    let mut config = match (&opt.config, &opt.preset) {
        (Some(path), _) => {
            Config::load(path).with_context(|| format!("Failed to load configuration: {:?}", path))?
        }
        (None, Some(name)) => Config::preset(name)?,
        (None, None) => Config::default(),
    };
    if let Some(engine) = opt.engine {
        config.engine = engine;
    }
    if opt.parallel {
        config.parallel = true;
    }
    Ok(config)
}

/// Expand directories into their `.c` files, keeping explicit file arguments.
fn collect_sources(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for entry in WalkDir::new(input).follow_links(false).sort_by_file_name() {
                let entry = entry.with_context(|| format!("Failed to walk directory: {:?}", input))?;
                if entry.file_type().is_file() && entry.path().extension().is_some_and(|ext| ext == "c") {
                    files.push(entry.into_path());
                }
            }
        } else if input.exists() {
            files.push(input.clone());
        } else {
            anyhow::bail!("No such file or directory: {:?}", input);
        }
    }
    Ok(files)
}

/// Analyze one file on a worker thread; a file that runs past `timeout_s`
/// is abandoned and contributes nothing.
fn analyze_with_timeout(analyzer: &Arc<Analyzer>, path: &Path, timeout_s: u64) -> Vec<Issue> {
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(analyzer);
    let owned = path.to_path_buf();
    thread::spawn(move || {
        let _ = tx.send(worker.analyze_file(&owned));
    });

    match rx.recv_timeout(Duration::from_secs(timeout_s.max(1))) {
        Ok(Ok(issues)) => issues,
        Ok(Err(e @ ScanError::FileTooLarge { .. })) => {
            warn!("skipping {}", e);
            Vec::new()
        }
        Ok(Err(e)) => {
            warn!("failed to analyze {:?}: {}", path, e);
            Vec::new()
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!("{}", ScanError::Timeout { path: path.to_path_buf(), seconds: timeout_s });
            Vec::new()
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            warn!("analysis of {:?} stopped unexpectedly", path);
            Vec::new()
        }
    }
}
