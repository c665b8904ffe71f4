//! git-fastcdc CLI - deduplicating clean/smudge filter for git.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use git_fastcdc::{ChunkStore, FilterConfig, FilterDriver, Git, Result};

const FILTER_PROCESS_KEY: &str = "filter.fastcdc.process";
const FILTER_REQUIRED_KEY: &str = "filter.fastcdc.required";
const PROCESS_COMMAND: &str = "git-fastcdc process";

/// Attribute lines keeping git's own metadata files out of the filter.
const SELF_EXCLUSIONS: [&str; 2] = [
    "/.gitattributes text -binary -filter",
    "/.gitignore text -binary -filter",
];

/// git-fastcdc - store large binary files as deduplicated chunks
#[derive(Parser)]
#[command(name = "git-fastcdc")]
#[command(version)]
#[command(about = "Deduplicating clean/smudge filter backed by content-defined chunking")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the long-running filter protocol (invoked by git, not by hand)
    Process,

    /// Configure the filter in the current repository
    Install,

    /// Drop the filter configuration from the current repository
    Remove,
}

fn main() -> ExitCode {
    // stdout belongs to the filter protocol; diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("git-fastcdc: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Process => process(),
        Commands::Install => install(),
        Commands::Remove => remove(),
    }
}

fn process() -> Result<()> {
    let git = Git::discover()?;
    let config = FilterConfig::load(&git)?;
    let store = ChunkStore::new(git);
    let driver = FilterDriver::new(io::stdin().lock(), io::stdout().lock(), store, config);
    driver.run()
}

fn install() -> Result<()> {
    let git = Git::discover()?;
    git.config_set(FILTER_PROCESS_KEY, PROCESS_COMMAND)?;
    git.config_set(FILTER_REQUIRED_KEY, "true")?;

    let path = git.work_dir().join(".gitattributes");
    let mut lines = read_attribute_lines(&path)?;
    lines.retain(|line| !SELF_EXCLUSIONS.contains(&line.trim()));
    lines.extend(SELF_EXCLUSIONS.iter().map(ToString::to_string));
    write_attribute_lines(&path, &lines)?;

    println!("fastcdc filter installed; track files with: <pattern> filter=fastcdc");
    Ok(())
}

fn remove() -> Result<()> {
    let git = Git::discover()?;
    git.config_unset(FILTER_PROCESS_KEY)?;
    git.config_unset(FILTER_REQUIRED_KEY)?;

    let path = git.work_dir().join(".gitattributes");
    let mut lines = read_attribute_lines(&path)?;
    lines.retain(|line| !SELF_EXCLUSIONS.contains(&line.trim()));
    write_attribute_lines(&path, &lines)?;

    println!("fastcdc filter removed");
    Ok(())
}

fn read_attribute_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_attribute_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(())
}
