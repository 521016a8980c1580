use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::process::{Command, Stdio};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "x")]
#[command(about = "Development automation for cellrx")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format check, clippy with warnings denied, then the full test suite
    Ci,
    /// Run tests, optionally for selected modules only
    Test {
        /// Library module whose unit tests to run (repeatable)
        #[arg(long, value_enum)]
        module: Vec<Module>,
        /// Run ignored tests only
        #[arg(long)]
        ignored: bool,
    },
    /// Run the criterion benchmarks
    Bench,
    /// Run the built-in counter workload through the cellrx binary
    Smoke {
        /// Optional machine configuration (TOML)
        config: Option<String>,
        #[arg(short = 'n', long, default_value = "100000000")]
        cycles: u64,
        /// Contexts per interpreter family
        #[arg(long, default_value = "2")]
        contexts: usize,
        #[arg(long)]
        release: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Module {
    Memory,
    Reservation,
    Timing,
    Context,
    System,
}

impl Module {
    fn path(self) -> &'static str {
        match self {
            Module::Memory => "core::memory",
            Module::Reservation => "core::reservation",
            Module::Timing => "core::timing",
            Module::Context => "core::context",
            Module::System => "core::system",
        }
    }
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Ci => run_ci(),
        Commands::Test { module, ignored } => run_test(&module, ignored),
        Commands::Bench => cargo(&["bench"]),
        Commands::Smoke {
            config,
            cycles,
            contexts,
            release,
        } => run_smoke(config.as_deref(), cycles, contexts, release),
    }
}

fn run_ci() -> Result<()> {
    println!("{}", "=== Running CI Pipeline ===".bold().blue());
    let start = Instant::now();

    let steps: [(&str, &[&str]); 3] = [
        ("Format Check", &["fmt", "--all", "--", "--check"]),
        ("Clippy", &["clippy", "--all-targets", "--", "-D", "warnings"]),
        ("Test", &["test", "--workspace"]),
    ];
    for (name, args) in steps {
        println!("{} {}", "→".blue(), name);
        cargo(args)?;
    }

    println!(
        "\n{} {}",
        "✓ CI passed in".green().bold(),
        format!("{:.2}s", start.elapsed().as_secs_f64()).bold()
    );
    Ok(())
}

fn run_test(modules: &[Module], ignored: bool) -> Result<()> {
    let extra: &[&str] = if ignored { &["--", "--ignored"] } else { &[] };
    if modules.is_empty() {
        return cargo(&[&["test"][..], extra].concat());
    }

    let mut failed = Vec::new();
    for module in modules {
        let path = module.path();
        println!("{} Running {} tests...", "→".blue(), path.bold());
        if cargo(&[&["test", "--lib", path][..], extra].concat()).is_err() {
            println!("{} {} tests failed\n", "✗".red(), path);
            failed.push(path);
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("Tests failed in: {}", failed.join(", "));
    }
    Ok(())
}

fn run_smoke(config: Option<&str>, cycles: u64, contexts: usize, release: bool) -> Result<()> {
    println!("{}", "=== Smoke Run ===".bold().blue());

    let cycles = cycles.to_string();
    let contexts = contexts.to_string();
    let mut args = vec!["run", "--bin", "cellrx"];
    if release {
        args.push("--release");
    }
    args.extend(["--", "--cycles", cycles.as_str(), "--contexts", contexts.as_str()]);
    if let Some(path) = config {
        if !std::path::Path::new(path).exists() {
            anyhow::bail!("Config file not found: {}", path);
        }
        args.extend(["--config", path]);
    }

    let start = Instant::now();
    cargo(&args)?;
    println!(
        "\n{} Smoke run completed in {}",
        "✓".green().bold(),
        format!("{:.2}s", start.elapsed().as_secs_f64()).bold()
    );
    Ok(())
}

fn cargo(args: &[&str]) -> Result<()> {
    let status = Command::new("cargo")
        .args(args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()?;

    if !status.success() {
        anyhow::bail!("cargo {} failed with exit code: {}", args.join(" "), status);
    }
    Ok(())
}
