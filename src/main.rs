//! # Block Line-Ending Fixer (blockfix)
//!
//! A CLI tool that repairs bare line feeds injected into CRLF Markdown files
//! inside managed block regions, and normalizes the JSON block registry that
//! mirrors those blocks.
//!
//! ## Overview
//!
//! Managed blocks are delimited by HTML comment markers:
//!
//! ```text
//! <!-- block: Greeting [id:3fa9c1] -->
//! Hello there
//! <!-- /block:3fa9c1 -->
//! ```
//!
//! An earlier editor release wrote block bodies back with bare `\n` line
//! endings even when the surrounding file used `\r\n`. `blockfix` finds those
//! files and rewrites every block body to CRLF, and strips carriage returns
//! and trailing newlines from the registry's `content` fields.
//!
//! ## Run Flow
//!
//! ```text
//! Registry → normalize content → backup + rewrite (if changed)
//!     ↓
//! Roots + registry sourceFiles → walk → sorted, deduplicated .md paths
//!     ↓
//! For each file:
//!   - skip pure-LF files, files without bare LF, files without markers
//!   - pair markers (same id, no nesting)
//!   - rewrite block bodies to CRLF
//!   - write back (unless --dry-run)
//! ```
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success (including dry runs and malformed-marker warnings) |
//! | 1 | General error (I/O error, malformed registry JSON) |
//! | 2 | Invalid command-line arguments |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::ValueEnum;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use regex::Regex;
use rich_rust::terminal;
use rich_rust::{ColorSystem, Console};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

// ─────────────────────────────────────────────────────────────────────────────
// Exit Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic exit codes for scripting and CI integration
mod exit_codes {
    /// Success - completed without errors
    pub const SUCCESS: i32 = 0;
    /// General error (file not found, permission denied, I/O error, bad registry)
    pub const ERROR: i32 = 1;
    /// Invalid command-line arguments
    pub const INVALID_ARGS: i32 = 2;
}

#[derive(Debug)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

#[derive(Debug)]
struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

fn error_chain_has<T: std::error::Error + 'static>(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<T>())
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if error_chain_has::<ArgError>(err) {
        exit_codes::INVALID_ARGS
    } else {
        exit_codes::ERROR
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLI Arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColorMode {
    /// Auto-detect color support
    Auto,
    /// Always emit colors (even when not a TTY)
    Always,
    /// Never emit colors
    Never,
}

/// Block Line-Ending Fixer: repairs bare LF corruption inside managed Markdown blocks
#[derive(Parser, Debug)]
#[command(
    name = "blockfix",
    version,
    about,
    long_about = None,
    after_help = "EXIT CODES:\n  0  Success (dry runs and malformed-marker warnings included)\n  1  General error (I/O error, malformed registry JSON)\n  2  Invalid command-line arguments\n"
)]
struct Args {
    /// Root directories to scan for Markdown files.
    /// Defaults to the config file's `roots`, then ~/Projects (C:\Projects on Windows).
    #[arg(value_name = "ROOT")]
    roots: Vec<PathBuf>,

    /// Preview repairs without modifying any file, the registry, or creating a backup
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Path to the block registry (default: <local data dir>/BlockSmith/BlockSmith/blocks.db.json)
    #[arg(long, value_name = "FILE")]
    registry: Option<PathBuf>,

    /// Leave the block registry untouched
    #[arg(long, conflicts_with = "registry")]
    skip_registry: bool,

    /// Do not add the registry's sourceFile paths to the scan
    #[arg(long = "no-source-files")]
    no_source_files: bool,

    /// Glob pattern to match file names while walking (comma-separated)
    #[arg(long, default_value = "*.md")]
    glob: String,

    /// Respect .gitignore files while walking
    #[arg(long)]
    gitignore: bool,

    /// Maximum directory depth (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_depth: usize,

    /// Path to config file (default: search for .blockfixrc)
    #[arg(long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Ignore config files
    #[arg(long = "no-config")]
    no_config: bool,

    /// Verbose output: per-file skip reasons and a summary
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Color output: auto, always, or never
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorMode,

    /// Emit a JSON report on stdout instead of progress lines
    #[arg(long, conflicts_with = "verbose")]
    json: bool,

    /// Subcommand (config management)
    #[command(subcommand)]
    command: Option<Commands>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config management actions
#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Initialize a new .blockfixrc config file
    Init {
        /// Create in home directory instead of current
        #[arg(long)]
        global: bool,
    },
    /// Show effective configuration (merged file + CLI)
    Show,
    /// Show path to active config file
    Path,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a run may touch the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Write repaired files, the normalized registry and its backup
    Apply,
    /// Detect and report only
    DryRun,
}

impl Mode {
    fn from_dry_run(dry_run: bool) -> Self {
        if dry_run { Self::DryRun } else { Self::Apply }
    }

    fn writes(self) -> bool {
        self == Self::Apply
    }
}

/// Runtime configuration derived from CLI args and the config file
#[derive(Debug)]
struct Config {
    registry: PathBuf,
    skip_registry: bool,
    roots: Vec<PathBuf>,
    source_files: bool,
    glob: String,
    gitignore: bool,
    max_depth: usize,
    color: ColorMode,
    verbose: bool,
    json: bool,
    mode: Mode,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            registry: args
                .registry
                .clone()
                .unwrap_or_else(default_registry_path),
            skip_registry: args.skip_registry,
            roots: args.roots.clone(),
            source_files: !args.no_source_files,
            glob: args.glob.clone(),
            gitignore: args.gitignore,
            max_depth: args.max_depth,
            color: args.color,
            verbose: args.verbose,
            json: args.json,
            mode: Mode::from_dry_run(args.dry_run),
        }
    }
}

/// Registry location used by the editor: `%LOCALAPPDATA%\BlockSmith\BlockSmith`
/// on Windows, the XDG data dir elsewhere.
fn default_registry_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("BlockSmith")
        .join("BlockSmith")
        .join("blocks.db.json")
}

fn default_roots() -> Vec<PathBuf> {
    if cfg!(windows) {
        vec![PathBuf::from(r"C:\Projects")]
    } else {
        dirs::home_dir()
            .map(|home| home.join("Projects"))
            .into_iter()
            .collect()
    }
}

struct VerboseStyle {
    use_color: bool,
}

impl VerboseStyle {
    fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn wrap(&self, tag: &str, text: impl fmt::Display) -> String {
        if self.use_color {
            format!("[{}]{}[/]", tag, text)
        } else {
            text.to_string()
        }
    }

    fn header(&self, text: impl fmt::Display) -> String {
        self.wrap("bold cyan", text)
    }

    fn fixed(&self, text: impl fmt::Display) -> String {
        self.wrap("yellow", text)
    }

    fn success(&self, text: impl fmt::Display) -> String {
        self.wrap("bold green", text)
    }

    fn dim(&self, text: impl fmt::Display) -> String {
        self.wrap("dim", text)
    }

    fn stat_label(&self, text: impl fmt::Display) -> String {
        self.wrap("bold blue", text)
    }

    fn separator(&self) -> String {
        self.wrap("dim", "───")
    }
}

/// Console sink for progress lines. Quiet in JSON mode.
struct Reporter {
    console: Console,
    styles: VerboseStyle,
    quiet: bool,
    verbose: bool,
}

impl Reporter {
    fn new(config: &Config) -> Self {
        let (console, styles) = build_console(config.color);
        Self {
            console,
            styles,
            quiet: config.json,
            verbose: config.verbose,
        }
    }

    fn say(&self, text: &str) {
        if !self.quiet {
            self.console.print(text);
        }
    }

    fn detail(&self, text: impl fmt::Display) {
        if self.verbose && !self.quiet {
            self.console.print(&self.styles.dim(text));
        }
    }

    fn warn(&self, text: impl fmt::Display) {
        if !self.quiet {
            eprintln!("Warning: {}", text);
        }
    }
}

/// Statistics collected during a run
#[derive(Debug, Default, Clone)]
struct Stats {
    /// Number of files examined
    files_scanned: usize,
    /// Number of files that were (or would be) rewritten
    files_fixed: usize,
    /// Number of block regions whose body changed
    blocks_repaired: usize,
    /// Files skipped because they contain no CRLF
    pure_lf: usize,
    /// Files skipped because every LF is part of a CRLF
    no_bare_lf: usize,
    /// Files skipped because they contain no block marker
    no_markers: usize,
    /// Files with markers and mixed newlines whose blocks were already clean
    already_clean: usize,
    /// Files left untouched because of unpaired markers
    malformed: usize,
    /// Registry records whose content was normalized
    registry_fixed: usize,
    /// Processing elapsed time
    elapsed: Duration,
}

impl Stats {
    fn record(&mut self, outcome: &FileOutcome) {
        self.files_scanned += 1;
        match outcome {
            FileOutcome::Repaired { blocks } => {
                self.files_fixed += 1;
                self.blocks_repaired += blocks;
            }
            FileOutcome::Unmodified(SkipReason::PureLf) => self.pure_lf += 1,
            FileOutcome::Unmodified(SkipReason::NoBareLf) => self.no_bare_lf += 1,
            FileOutcome::Unmodified(SkipReason::NoMarkers) => self.no_markers += 1,
            FileOutcome::Unmodified(SkipReason::AlreadyClean) => self.already_clean += 1,
            FileOutcome::Malformed(_) => self.malformed += 1,
        }
    }
}

/// Print a statistics summary
fn print_stats_summary(stats: &Stats, mode: Mode, console: &Console, styles: &VerboseStyle) {
    console.print("");
    console.print(&format!(
        "{} Summary {}",
        styles.separator(),
        styles.separator()
    ));

    console.print(&format!(
        "  {} {} scanned, {} {}, {} malformed",
        styles.stat_label("Files:"),
        stats.files_scanned,
        stats.files_fixed,
        if mode.writes() { "fixed" } else { "would fix" },
        stats.malformed
    ));

    console.print(&format!(
        "  {} {} pure LF, {} without bare LF, {} without markers, {} already clean",
        styles.stat_label("Skipped:"),
        stats.pure_lf,
        stats.no_bare_lf,
        stats.no_markers,
        stats.already_clean
    ));

    console.print(&format!(
        "  {} {} repaired",
        styles.stat_label("Blocks:"),
        stats.blocks_repaired
    ));

    console.print(&format!(
        "  {} {} record(s) normalized",
        styles.stat_label("Registry:"),
        stats.registry_fixed
    ));

    console.print(&format!(
        "  {} {:.2}ms",
        styles.stat_label("Time:"),
        stats.elapsed.as_secs_f64() * 1000.0
    ));

    console.print("");
}

fn build_console(color: ColorMode) -> (Console, VerboseStyle) {
    match color {
        ColorMode::Never => (Console::new(), VerboseStyle::new(false)),
        ColorMode::Always => {
            let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
            let console = Console::builder()
                .force_terminal(true)
                .color_system(system)
                .build();
            (console, VerboseStyle::new(true))
        }
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                return (Console::new(), VerboseStyle::new(false));
            }

            if std::env::var("FORCE_COLOR").is_ok() {
                let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
                let console = Console::builder()
                    .force_terminal(true)
                    .color_system(system)
                    .build();
                return (console, VerboseStyle::new(true));
            }

            let console = Console::new();
            let use_color = console.is_color_enabled();
            (console, VerboseStyle::new(use_color))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config File Support
// ─────────────────────────────────────────────────────────────────────────────

/// Config file names searched in order
const CONFIG_FILENAMES: &[&str] = &[".blockfixrc", ".blockfixrc.toml", "blockfixrc.toml"];

/// Default glob for the file locator
const DEFAULT_GLOB: &str = "*.md";

/// Configuration loaded from a .blockfixrc file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    /// Registry path
    registry: Option<PathBuf>,
    /// Root directories to scan
    roots: Option<Vec<PathBuf>>,
    /// Glob patterns for file names
    glob: Option<String>,
    /// Respect .gitignore
    gitignore: Option<bool>,
    /// Maximum directory depth
    max_depth: Option<usize>,
    /// Include registry sourceFile paths
    source_files: Option<bool>,
    /// Show verbose output
    verbose: Option<bool>,
    /// Color mode: auto, always, never
    color: Option<ColorMode>,
    /// Output as JSON
    json: Option<bool>,
}

/// Search for a config file starting from the given directory
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        for filename in CONFIG_FILENAMES {
            let config_path = current.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(home) = dirs::home_dir() {
        for filename in CONFIG_FILENAMES {
            let config_path = home.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }
    }

    None
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Create Config by merging file config with CLI args (CLI wins)
fn create_config(args: &Args) -> Result<Config> {
    let mut config = Config::from(args);

    let config_path = if args.no_config {
        None
    } else if let Some(ref path) = args.config_file {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        Some(path.clone())
    } else {
        let start_dir = args
            .roots
            .first()
            .filter(|p| p.is_dir())
            .cloned()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

        find_config_file(&start_dir)
    };

    if let Some(path) = config_path {
        let file_config = load_config_file(&path)?;

        if args.registry.is_none() {
            if let Some(registry) = file_config.registry {
                config.registry = registry;
            }
        }

        if args.roots.is_empty() {
            if let Some(roots) = file_config.roots {
                config.roots = roots;
            }
        }

        if args.glob == DEFAULT_GLOB {
            if let Some(glob) = file_config.glob {
                config.glob = glob;
            }
        }

        if !args.gitignore {
            if let Some(gi) = file_config.gitignore {
                config.gitignore = gi;
            }
        }

        if args.max_depth == 0 {
            if let Some(d) = file_config.max_depth {
                config.max_depth = d;
            }
        }

        if !args.no_source_files {
            if let Some(s) = file_config.source_files {
                config.source_files = s;
            }
        }

        if !args.verbose {
            if let Some(v) = file_config.verbose {
                config.verbose = v;
            }
        }

        if args.color == ColorMode::Auto {
            if let Some(c) = file_config.color {
                config.color = c;
            }
        }

        if !args.json {
            if let Some(j) = file_config.json {
                config.json = j;
            }
        }
    }

    if config.roots.is_empty() {
        config.roots = default_roots();
    }

    // --json and --verbose conflict on the CLI; a config file can still combine them
    if config.json {
        config.verbose = false;
    }

    Ok(config)
}

/// Default config file content
const DEFAULT_CONFIG: &str = r#"# .blockfixrc - blockfix configuration file

# Block registry written by the editor
# registry = "/home/me/.local/share/BlockSmith/BlockSmith/blocks.db.json"

# Directories scanned recursively for Markdown files
# roots = ["/home/me/Projects"]

# File name patterns (comma-separated)
# glob = "*.md"

# Walk options
# gitignore = false
# max_depth = 0

# Also scan the sourceFile recorded for each registry block
# source_files = true

# Output options
# verbose = false
# color = "auto"
# json = false
"#;

/// Handle the config subcommand
fn run_config_command(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { global } => {
            let path = if *global {
                dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
                    .join(".blockfixrc")
            } else {
                PathBuf::from(".blockfixrc")
            };

            if path.exists() {
                return Err(anyhow::anyhow!(
                    "Config file already exists: {}",
                    path.display()
                ));
            }

            fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to create config file: {}", path.display()))?;

            eprintln!("Created config file: {}", path.display());
            Ok(())
        }

        ConfigAction::Show => {
            let args = Args::parse_from(["blockfix"]);
            let config = create_config(&args)?;

            eprintln!("Effective configuration:");
            eprintln!("  registry: {}", config.registry.display());
            eprintln!(
                "  roots: {}",
                config
                    .roots
                    .iter()
                    .map(|r| r.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            eprintln!("  glob: {}", config.glob);
            eprintln!("  gitignore: {}", config.gitignore);
            eprintln!("  max_depth: {}", config.max_depth);
            eprintln!("  source_files: {}", config.source_files);
            eprintln!("  verbose: {}", config.verbose);
            eprintln!("  color: {:?}", config.color);
            eprintln!("  json: {}", config.json);

            let start_dir = std::env::current_dir().unwrap_or_default();
            if let Some(path) = find_config_file(&start_dir) {
                eprintln!();
                eprintln!("Config file: {}", path.display());
            }

            Ok(())
        }

        ConfigAction::Path => {
            let start_dir = std::env::current_dir().unwrap_or_default();
            match find_config_file(&start_dir) {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(())
                }
                None => anyhow::bail!("No config file found"),
            }
        }
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if let Some(ref registry) = args.registry {
        if registry.is_dir() {
            return Err(ArgError(format!(
                "--registry must point to a file, not a directory: {}",
                registry.display()
            ))
            .into());
        }
    }

    if args.glob.trim().is_empty() {
        return Err(ArgError("--glob must include at least one pattern".to_string()).into());
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Content Normalization
// ─────────────────────────────────────────────────────────────────────────────

/// Canonical block content: no carriage returns, no trailing line feeds.
fn clean_content(content: &str) -> String {
    content.replace('\r', "").trim_end_matches('\n').to_string()
}

/// Canonical block body as stored inside a CRLF file.
fn crlf_body(body: &str) -> String {
    clean_content(body).replace('\n', "\r\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry Normalizer
// ─────────────────────────────────────────────────────────────────────────────

/// A registry record whose content was rewritten
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct RegistryFix {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl RegistryFix {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("?")
    }
}

#[derive(Debug)]
struct RegistryReport {
    fixed: Vec<RegistryFix>,
    backup: Option<PathBuf>,
    source_files: Vec<PathBuf>,
}

#[derive(Debug)]
enum RegistryOutcome {
    NotFound,
    Loaded(RegistryReport),
}

/// Normalize every block's `content` in place and return the records touched.
///
/// Records without a string `content` and non-object records are left alone.
/// With `preserve_order`, replacing a value keeps the key at its position.
fn normalize_blocks(doc: &mut Value) -> Vec<RegistryFix> {
    let Some(blocks) = doc.get_mut("blocks").and_then(Value::as_object_mut) else {
        return Vec::new();
    };

    let mut fixed = Vec::new();
    for (id, record) in blocks.iter_mut() {
        let Some(record) = record.as_object_mut() else {
            continue;
        };
        let Some(content) = record.get("content").and_then(Value::as_str) else {
            continue;
        };

        let clean = clean_content(content);
        if clean == content {
            continue;
        }

        let name = record
            .get("name")
            .and_then(Value::as_str)
            .map(String::from);
        record.insert("content".to_string(), Value::String(clean));
        fixed.push(RegistryFix {
            id: id.clone(),
            name,
        });
    }

    fixed
}

/// Collect the non-empty `sourceFile` entries of all block records.
fn registry_source_files(doc: &Value) -> Vec<PathBuf> {
    doc.get("blocks")
        .and_then(Value::as_object)
        .map(|blocks| {
            blocks
                .values()
                .filter_map(|record| record.get("sourceFile").and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Serialize the registry with a 4-space indent, LF line endings and one trailing newline.
fn render_registry(doc: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    doc.serialize(&mut serializer)
        .context("Failed to serialize registry")?;
    buf.push(b'\n');
    Ok(buf)
}

fn backup_suffix(at: NaiveDateTime) -> String {
    format!(".backup-{}", at.format("%Y%m%d_%H%M%S"))
}

/// Load the registry, normalize block content, and rewrite it when needed.
fn normalize_registry(path: &Path, mode: Mode) -> Result<RegistryOutcome> {
    if !path.exists() {
        return Ok(RegistryOutcome::NotFound);
    }

    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read registry: {}", path.display()))?;
    let mut doc: Value = serde_json::from_str(&text).map_err(|err| {
        ParseError(format!(
            "Malformed registry JSON in {}: {}",
            path.display(),
            err
        ))
    })?;
    if !doc.is_object() {
        return Err(ParseError(format!(
            "Registry root must be a JSON object: {}",
            path.display()
        ))
        .into());
    }

    let fixed = normalize_blocks(&mut doc);
    let source_files = registry_source_files(&doc);

    let mut backup = None;
    if !fixed.is_empty() && mode.writes() {
        let rendered = render_registry(&doc)?;
        backup = Some(create_backup(
            path,
            &backup_suffix(Local::now().naive_local()),
        )?);
        fs::write(path, rendered)
            .with_context(|| format!("Failed to write registry: {}", path.display()))?;
    }

    Ok(RegistryOutcome::Loaded(RegistryReport {
        fixed,
        backup,
        source_files,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// File Locator
// ─────────────────────────────────────────────────────────────────────────────

fn build_globset(patterns: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut added = 0;

    for raw in patterns.split(',') {
        let pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }

        let glob = Glob::new(pattern)
            .map_err(|err| ArgError(format!("Invalid glob pattern '{}': {}", pattern, err)))?;
        builder.add(glob);
        added += 1;
    }

    if added == 0 {
        return Err(ArgError("--glob must include at least one pattern".to_string()).into());
    }

    builder
        .build()
        .map_err(|err| ArgError(format!("Invalid glob set: {}", err)).into())
}

#[derive(Debug)]
struct Discovery {
    files: Vec<PathBuf>,
    missing_roots: Vec<PathBuf>,
    /// Unreadable entries, skipped
    walk_errors: Vec<String>,
}

fn matches_glob(globs: &GlobSet, path: &Path) -> bool {
    path.file_name().is_some_and(|name| globs.is_match(name))
}

/// Make `path` absolute and collapse `.` and `..` lexically, without touching
/// the filesystem. `..` never climbs above the root.
fn resolve_path(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)
        .with_context(|| format!("Failed to resolve path: {}", path.display()))?;

    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(
                    resolved.components().next_back(),
                    Some(Component::Normal(_))
                ) {
                    resolved.pop();
                }
            }
            other => resolved.push(other),
        }
    }
    Ok(resolved)
}

/// Walk every root and collect matching files, plus any `extra` files that
/// exist and match. Paths are absolute, deduplicated and sorted.
fn discover_markdown_files(
    roots: &[PathBuf],
    extra: &[PathBuf],
    config: &Config,
) -> Result<Discovery> {
    let globs = build_globset(&config.glob)?;
    let mut files = BTreeSet::new();
    let mut missing_roots = Vec::new();
    let mut walk_errors = Vec::new();

    for root in roots {
        if !root.is_dir() {
            missing_roots.push(root.clone());
            continue;
        }

        let root = resolve_path(root)?;

        let mut walker = WalkBuilder::new(&root);
        walker.standard_filters(false);
        walker.hidden(true);
        walker.parents(config.gitignore);
        walker.git_ignore(config.gitignore);
        walker.git_exclude(config.gitignore);
        walker.git_global(config.gitignore);
        walker.ignore(config.gitignore);

        if config.max_depth > 0 {
            walker.max_depth(Some(config.max_depth));
        }

        for entry in walker.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    walk_errors.push(err.to_string());
                    continue;
                }
            };
            let entry_path = entry.path();
            if entry_path.is_file() && matches_glob(&globs, entry_path) {
                files.insert(entry_path.to_path_buf());
            }
        }
    }

    for path in extra {
        if path.is_file() && matches_glob(&globs, path) {
            files.insert(resolve_path(path)?);
        }
    }

    Ok(Discovery {
        files: files.into_iter().collect(),
        missing_roots,
        walk_errors,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Block Markers
// ─────────────────────────────────────────────────────────────────────────────

/// Byte prefix of every opening marker
const OPEN_MARKER_PREFIX: &[u8] = b"<!-- block:";

/// Opening `<!-- block: <name> [id:<hex>] -->` or closing `<!-- /block:<hex> -->`
/// marker. Names never span lines.
static MARKER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"<!-- block:[ \t]*.+?[ \t]*\[id:(?P<open>[a-f0-9]+)\][ \t]*-->|<!-- /block:(?P<close>[a-f0-9]+) -->",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Open,
    Close,
}

#[derive(Debug, Clone)]
struct Marker<'a> {
    kind: MarkerKind,
    id: &'a str,
    span: Range<usize>,
}

/// A matched opening/closing marker pair
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockSpan {
    open: Range<usize>,
    close: Range<usize>,
}

/// Marker sequences that cannot be paired unambiguously
#[derive(Debug, Clone, PartialEq, Eq)]
enum MarkerError {
    /// An opening marker appears before the previous block was closed
    Nested {
        line: usize,
        outer: String,
        inner: String,
    },
    /// A closing marker carries a different id than the open block
    Mismatched {
        line: usize,
        open: String,
        close: String,
    },
    /// An opening marker is never closed
    Unterminated { line: usize, id: String },
    /// A closing marker has no opening marker
    Orphan { line: usize, id: String },
}

impl fmt::Display for MarkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nested { line, outer, inner } => write!(
                f,
                "line {}: block {} opened inside unclosed block {}",
                line, inner, outer
            ),
            Self::Mismatched { line, open, close } => write!(
                f,
                "line {}: closing marker for {} does not match open block {}",
                line, close, open
            ),
            Self::Unterminated { line, id } => {
                write!(f, "line {}: block {} is never closed", line, id)
            }
            Self::Orphan { line, id } => {
                write!(f, "line {}: closing marker for {} has no opening marker", line, id)
            }
        }
    }
}

impl std::error::Error for MarkerError {}

/// 1-based line number of a byte offset
fn line_at(text: &str, offset: usize) -> usize {
    text.as_bytes()[..offset]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
        + 1
}

fn find_markers(text: &str) -> Vec<Marker<'_>> {
    MARKER_PATTERN
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let (kind, id) = match (caps.name("open"), caps.name("close")) {
                (Some(id), _) => (MarkerKind::Open, id.as_str()),
                (None, Some(id)) => (MarkerKind::Close, id.as_str()),
                (None, None) => return None,
            };
            Some(Marker {
                kind,
                id,
                span: whole.range(),
            })
        })
        .collect()
}

/// Pair markers left to right. Every opening marker must be followed directly
/// by the closing marker with the same id.
fn pair_markers(text: &str) -> Result<Vec<BlockSpan>, MarkerError> {
    let mut spans = Vec::new();
    let mut pending: Option<Marker<'_>> = None;

    for marker in find_markers(text) {
        match (pending.take(), marker.kind) {
            (None, MarkerKind::Open) => pending = Some(marker),
            (None, MarkerKind::Close) => {
                return Err(MarkerError::Orphan {
                    line: line_at(text, marker.span.start),
                    id: marker.id.to_string(),
                });
            }
            (Some(open), MarkerKind::Open) => {
                return Err(MarkerError::Nested {
                    line: line_at(text, marker.span.start),
                    outer: open.id.to_string(),
                    inner: marker.id.to_string(),
                });
            }
            (Some(open), MarkerKind::Close) => {
                if open.id != marker.id {
                    return Err(MarkerError::Mismatched {
                        line: line_at(text, marker.span.start),
                        open: open.id.to_string(),
                        close: marker.id.to_string(),
                    });
                }
                spans.push(BlockSpan {
                    open: open.span,
                    close: marker.span,
                });
            }
        }
    }

    if let Some(open) = pending {
        return Err(MarkerError::Unterminated {
            line: line_at(text, open.span.start),
            id: open.id.to_string(),
        });
    }

    Ok(spans)
}

/// Body between two marker lines: the text after the opening marker's line
/// break and before the line break preceding the closing marker. `None` when
/// the markers are not separated by two line breaks.
fn region_body(between: &str) -> Option<&str> {
    let rest = between
        .strip_prefix("\r\n")
        .or_else(|| between.strip_prefix('\n'))?;
    rest.strip_suffix("\r\n")
        .or_else(|| rest.strip_suffix('\n'))
}

// ─────────────────────────────────────────────────────────────────────────────
// Block Repairer
// ─────────────────────────────────────────────────────────────────────────────

/// Why a file was left as is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    /// No CRLF at all
    PureLf,
    /// Every LF already belongs to a CRLF
    NoBareLf,
    /// No opening block marker
    NoMarkers,
    /// Block bodies already canonical
    AlreadyClean,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PureLf => "pure LF file",
            Self::NoBareLf => "no bare LF",
            Self::NoMarkers => "no block markers",
            Self::AlreadyClean => "blocks already clean",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileOutcome {
    Repaired { blocks: usize },
    Unmodified(SkipReason),
    Malformed(MarkerError),
}

/// Result of rewriting the block regions of a text
#[derive(Debug, Clone, PartialEq, Eq)]
struct Repair {
    text: String,
    blocks: usize,
}

/// Byte-level screening before any decoding happens.
fn screen_bytes(raw: &[u8]) -> Option<SkipReason> {
    let crlf = raw.windows(2).filter(|w| *w == b"\r\n").count();
    let lf = raw.iter().filter(|&&b| b == b'\n').count();

    if crlf == 0 {
        return Some(SkipReason::PureLf);
    }
    if lf == crlf {
        return Some(SkipReason::NoBareLf);
    }
    if !raw
        .windows(OPEN_MARKER_PREFIX.len())
        .any(|w| w == OPEN_MARKER_PREFIX)
    {
        return Some(SkipReason::NoMarkers);
    }

    None
}

/// Rewrite every paired block region so its body uses CRLF and is framed by
/// exactly one CRLF on each side.
fn repair_text(text: &str) -> Result<Repair, MarkerError> {
    let spans = pair_markers(text)?;

    let mut out = String::with_capacity(text.len() + text.len() / 16);
    let mut cursor = 0;
    let mut blocks = 0;

    for span in spans {
        let between = &text[span.open.end..span.close.start];
        let Some(body) = region_body(between) else {
            continue;
        };

        let rebuilt = format!("\r\n{}\r\n", crlf_body(body));
        if rebuilt != between {
            blocks += 1;
        }

        out.push_str(&text[cursor..span.open.end]);
        out.push_str(&rebuilt);
        cursor = span.close.start;
    }
    out.push_str(&text[cursor..]);

    Ok(Repair { text: out, blocks })
}

/// Screen, repair and (in apply mode) rewrite one file.
fn repair_file(path: &Path, mode: Mode) -> Result<FileOutcome> {
    let raw =
        fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;

    if let Some(reason) = screen_bytes(&raw) {
        return Ok(FileOutcome::Unmodified(reason));
    }

    let text = String::from_utf8_lossy(&raw);
    let repair = match repair_text(&text) {
        Ok(repair) => repair,
        Err(err) => return Ok(FileOutcome::Malformed(err)),
    };

    if repair.text == text {
        return Ok(FileOutcome::Unmodified(SkipReason::AlreadyClean));
    }

    if mode.writes() {
        fs::write(path, repair.text.as_bytes())
            .with_context(|| format!("Failed to write to file: {}", path.display()))?;
    }

    Ok(FileOutcome::Repaired {
        blocks: repair.blocks,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Backup
// ─────────────────────────────────────────────────────────────────────────────

/// Creates a backup of the file by appending the suffix to the filename.
/// For example: "blocks.db.json" with ".backup-20240101_120000" becomes
/// "blocks.db.json.backup-20240101_120000"
fn create_backup(path: &Path, suffix: &str) -> Result<PathBuf> {
    let mut backup_name = path.as_os_str().to_owned();
    backup_name.push(suffix);
    let backup_path = PathBuf::from(backup_name);

    fs::copy(path, &backup_path)
        .with_context(|| format!("Failed to create backup at {}", backup_path.display()))?;

    // fs::copy carries permissions but not timestamps
    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("Failed to read modification time: {}", path.display()))?;
    fs::File::options()
        .write(true)
        .open(&backup_path)
        .and_then(|file| file.set_modified(modified))
        .with_context(|| {
            format!(
                "Failed to set modification time on backup: {}",
                backup_path.display()
            )
        })?;

    Ok(backup_path)
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Output Structures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonOutput {
    version: &'static str,
    status: &'static str,
    dry_run: bool,
    registry: JsonRegistry,
    files: JsonFiles,
}

#[derive(Serialize)]
struct JsonRegistry {
    path: String,
    status: &'static str,
    fixed_blocks: Vec<RegistryFix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup: Option<String>,
}

#[derive(Serialize)]
struct JsonFiles {
    scanned: usize,
    fixed: Vec<JsonFixedFile>,
    malformed: Vec<JsonMalformedFile>,
    missing_roots: Vec<String>,
    walk_errors: Vec<String>,
}

#[derive(Serialize)]
struct JsonFixedFile {
    path: String,
    blocks: usize,
}

#[derive(Serialize)]
struct JsonMalformedFile {
    path: String,
    error: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a run did, for the summary and the JSON report
#[derive(Debug)]
struct RunReport {
    mode: Mode,
    registry_path: PathBuf,
    /// `None` when the registry was skipped
    registry: Option<RegistryOutcome>,
    fixed: Vec<(PathBuf, usize)>,
    malformed: Vec<(PathBuf, MarkerError)>,
    missing_roots: Vec<PathBuf>,
    walk_errors: Vec<String>,
    stats: Stats,
}

impl RunReport {
    fn to_json(&self) -> JsonOutput {
        let (status, fixed_blocks, backup) = match &self.registry {
            None => ("skipped", Vec::new(), None),
            Some(RegistryOutcome::NotFound) => ("not_found", Vec::new(), None),
            Some(RegistryOutcome::Loaded(report)) => (
                if report.fixed.is_empty() {
                    "clean"
                } else {
                    "fixed"
                },
                report.fixed.clone(),
                report.backup.as_ref().map(|p| p.display().to_string()),
            ),
        };

        JsonOutput {
            version: "1.0",
            status: if self.mode.writes() {
                "success"
            } else {
                "dry_run"
            },
            dry_run: !self.mode.writes(),
            registry: JsonRegistry {
                path: self.registry_path.display().to_string(),
                status,
                fixed_blocks,
                backup,
            },
            files: JsonFiles {
                scanned: self.stats.files_scanned,
                fixed: self
                    .fixed
                    .iter()
                    .map(|(path, blocks)| JsonFixedFile {
                        path: path.display().to_string(),
                        blocks: *blocks,
                    })
                    .collect(),
                malformed: self
                    .malformed
                    .iter()
                    .map(|(path, err)| JsonMalformedFile {
                        path: path.display().to_string(),
                        error: err.to_string(),
                    })
                    .collect(),
                missing_roots: self
                    .missing_roots
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
                walk_errors: self.walk_errors.clone(),
            },
        }
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::SUCCESS,
                _ => exit_codes::INVALID_ARGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Some(Commands::Config { action }) = &args.command {
        let exit_code = match run_config_command(action) {
            Ok(()) => exit_codes::SUCCESS,
            Err(err) => {
                eprintln!("Error: {:#}", err);
                exit_code_for_error(&err)
            }
        };
        std::process::exit(exit_code);
    }

    let exit_code = match run(args) {
        Ok(_) => exit_codes::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code);
}

fn run(args: Args) -> Result<RunReport> {
    validate_args(&args)?;

    let config = create_config(&args)?;
    let reporter = Reporter::new(&config);
    let report = execute(&config, &reporter)?;

    if config.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report.to_json())
                .context("Failed to serialize JSON output")?
        );
    }

    Ok(report)
}

/// Registry stage: normalize and log. Returns `None` when skipped.
fn fix_registry(config: &Config, reporter: &Reporter) -> Result<Option<RegistryOutcome>> {
    if config.skip_registry {
        reporter.detail("Registry skipped (--skip-registry)");
        return Ok(None);
    }

    let styles = &reporter.styles;
    let label = config
        .registry
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| config.registry.display().to_string());
    reporter.say(&styles.header(format!("--- Fixing {} ---", label)));

    let outcome = normalize_registry(&config.registry, config.mode)?;
    match &outcome {
        RegistryOutcome::NotFound => {
            reporter.say(&format!("  DB not found: {}", config.registry.display()));
        }
        RegistryOutcome::Loaded(report) => {
            for fix in &report.fixed {
                reporter.say(&format!("  DB fix: block {} ({})", fix.id, fix.label()));
            }
            if let Some(ref backup) = report.backup {
                reporter.say(&format!("  Backed up DB to: {}", backup.display()));
            }
            let verdict = match (report.fixed.is_empty(), config.mode) {
                (true, _) => styles.success("  Already clean"),
                (false, Mode::Apply) => styles.fixed("  Fixed"),
                (false, Mode::DryRun) => styles.fixed("  Would fix"),
            };
            reporter.say(&verdict);
        }
    }
    reporter.say("");

    Ok(Some(outcome))
}

/// Run all three stages against `config`, logging progress through `reporter`.
fn execute(config: &Config, reporter: &Reporter) -> Result<RunReport> {
    let started = Instant::now();
    let styles = &reporter.styles;
    let mut stats = Stats::default();

    if config.mode == Mode::DryRun {
        reporter.say(&styles.header("=== DRY RUN (no files will be modified) ==="));
        reporter.say("");
    }

    let registry = fix_registry(config, reporter)?;

    let source_files = match &registry {
        Some(RegistryOutcome::Loaded(report)) if config.source_files => {
            report.source_files.clone()
        }
        _ => Vec::new(),
    };
    if let Some(RegistryOutcome::Loaded(report)) = &registry {
        stats.registry_fixed = report.fixed.len();
    }

    reporter.say(&styles.header("--- Scanning .md files ---"));
    let discovery = discover_markdown_files(&config.roots, &source_files, config)?;
    for root in &discovery.missing_roots {
        reporter.warn(format!("root does not exist: {}", root.display()));
    }
    for err in &discovery.walk_errors {
        reporter.warn(err);
    }
    reporter.say(&format!("  Found {} .md files", discovery.files.len()));
    reporter.say("");

    let mut fixed = Vec::new();
    let mut malformed = Vec::new();

    for path in &discovery.files {
        let outcome = repair_file(path, config.mode)?;
        stats.record(&outcome);

        match outcome {
            FileOutcome::Repaired { blocks } => {
                let verb = if config.mode.writes() {
                    "Fixed"
                } else {
                    "Would fix"
                };
                reporter.say(&styles.fixed(format!("  {}: {}", verb, path.display())));
                reporter.detail(format!("    {} block(s) rewritten", blocks));
                fixed.push((path.clone(), blocks));
            }
            FileOutcome::Unmodified(reason) => {
                reporter.detail(format!("  Skipped {}: {}", path.display(), reason));
            }
            FileOutcome::Malformed(err) => {
                reporter.warn(format!("left untouched {}: {}", path.display(), err));
                malformed.push((path.clone(), err));
            }
        }
    }

    stats.elapsed = started.elapsed();

    reporter.say("");
    reporter.say(&styles.success(format!("--- Done: {} file(s) fixed ---", fixed.len())));
    if config.mode == Mode::DryRun {
        reporter.say(&styles.dim("(dry run, no changes written)"));
    }

    if reporter.verbose && !reporter.quiet {
        print_stats_summary(&stats, config.mode, &reporter.console, styles);
    }

    Ok(RunReport {
        mode: config.mode,
        registry_path: config.registry.clone(),
        registry,
        fixed,
        malformed,
        missing_roots: discovery.missing_roots,
        walk_errors: discovery.walk_errors,
        stats,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
