use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use similar::{ChangeTag, TextDiff};
use std::env;
use std::path::{Path, PathBuf};
use synth_patcher::config::{load_from_path, SynthConfig, DEFAULT_RULES_FILE};
use synth_patcher::{generator, FileChange, FileOutcome, Pipeline, RunOptions, RunReport};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "synth-patcher")]
#[command(about = "Synthesize a client library from generator output", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose logging (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the synthesis pipeline once
    Run {
        /// Destination library root (defaults to $SYNTH_DESTINATION, then the current directory)
        #[arg(short = 'D', long)]
        dest: Option<PathBuf>,

        /// Rule file (defaults to <dest>/synth.toml)
        #[arg(short, long)]
        rules: Option<PathBuf>,

        /// Dry run - stage every rule but write nothing
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Show unified diff of changes
        #[arg(short, long)]
        diff: bool,
    },

    /// Report which rules would change the destination, without writing
    Status {
        /// Destination library root
        #[arg(short = 'D', long)]
        dest: Option<PathBuf>,

        /// Rule file (defaults to <dest>/synth.toml)
        #[arg(short, long)]
        rules: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the expanded rule list in execution order
    List {
        /// Destination library root
        #[arg(short = 'D', long)]
        dest: Option<PathBuf>,

        /// Rule file (defaults to <dest>/synth.toml)
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            dest,
            rules,
            dry_run,
            diff,
        } => cmd_run(dest, rules, dry_run, diff),

        Commands::Status { dest, rules, json } => cmd_status(dest, rules, json),

        Commands::List { dest, rules } => cmd_list(dest, rules),
    }
}

/// Logs go to stderr; `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "synth_patcher=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Resolve destination path
///
/// Priority order:
/// 1. Explicit --dest flag
/// 2. SYNTH_DESTINATION environment variable
/// 3. Current directory
fn resolve_dest(cli_dest: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = cli_dest {
        return path
            .canonicalize()
            .with_context(|| format!("destination {} does not exist", path.display()));
    }

    if let Ok(env_path) = env::var("SYNTH_DESTINATION") {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Ok(path.canonicalize()?);
        }
        eprintln!(
            "{}",
            format!(
                "Warning: SYNTH_DESTINATION is set but path doesn't exist: {}",
                env_path
            )
            .yellow()
        );
    }

    Ok(env::current_dir()?)
}

/// Load the rule file and the pipeline it describes.
fn load_rules(dest: &Path, rules: Option<PathBuf>) -> Result<(PathBuf, SynthConfig, Pipeline)> {
    let path = rules.unwrap_or_else(|| dest.join(DEFAULT_RULES_FILE));
    let config = load_from_path(&path)?;
    let pipeline = Pipeline::from_config(&config)?;
    Ok((path, config, pipeline))
}

/// Directory relative generator paths resolve against.
fn rules_base(rules_path: &Path) -> PathBuf {
    rules_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Helper: Show unified diff between original and synthesized content
fn display_diff(change: &FileChange) {
    let file = change.path.display();
    println!("\n{}", format!("--- {} (original)", file).dimmed());
    println!("{}", format!("+++ {} (synthesized)", file).dimmed());

    let before = change.before.as_deref().unwrap_or("");
    let diff = TextDiff::from_lines(before, &change.after);

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => format!(" {}", change).normal(),
        };
        print!("{}", sign);
    }
}

fn print_outcome(outcome: &FileOutcome, dry_run: bool) {
    let verb = if dry_run { "Would apply: " } else { "" };
    match outcome {
        FileOutcome::Copied { .. } | FileOutcome::Merged { .. } | FileOutcome::Patched { .. } => {
            println!("    {} {}{}", "✓".green(), verb, outcome);
        }
        FileOutcome::Unchanged { .. } => {
            println!("    {} {}", "⊙".yellow(), outcome);
        }
        FileOutcome::NoMatch { .. } => {
            println!("    {} {}", "⊘".cyan(), outcome);
        }
    }
}

fn print_summary(report: &RunReport) {
    let mut changed = 0;
    let mut unchanged = 0;
    let mut no_match = 0;
    for outcome in report.rules.iter().flat_map(|r| &r.outcomes) {
        match outcome {
            FileOutcome::Unchanged { .. } => unchanged += 1,
            FileOutcome::NoMatch { .. } => no_match += 1,
            _ => changed += 1,
        }
    }

    println!("{}", "Summary:".bold());
    println!("  {} rules", report.rules.len());
    println!("  {} changed", format!("{}", changed).green());
    println!("  {} unchanged", format!("{}", unchanged).yellow());
    println!("  {} no match", format!("{}", no_match).cyan());
    println!("  {} files to write", report.changes.len());
}

fn cmd_run(
    dest: Option<PathBuf>,
    rules: Option<PathBuf>,
    dry_run: bool,
    show_diff: bool,
) -> Result<()> {
    let dest = resolve_dest(dest)?;
    let (rules_path, config, pipeline) = load_rules(&dest, rules)?;
    let generator = generator::from_config(&config.generator, &rules_base(&rules_path));

    println!("Destination: {}", dest.display());
    println!("Rules: {}", rules_path.display());
    println!();

    if dry_run {
        println!("{}", "[DRY RUN - nothing will be written]".cyan());
    }

    let report = match pipeline.run(generator.as_ref(), &dest, RunOptions { dry_run }) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            if e.destination_untouched() {
                eprintln!("  {}", "No files were written.".red());
            } else {
                eprintln!(
                    "  {}",
                    "Commit failed partway; some files may already have been written.".red()
                );
            }
            std::process::exit(1);
        }
    };

    for rule in &report.rules {
        println!("  {} [{}]", rule.rule, rule.phase);
        for outcome in &rule.outcomes {
            print_outcome(outcome, dry_run);
        }
    }
    println!();

    if show_diff {
        for change in &report.changes {
            display_diff(change);
        }
        println!();
    }

    print_summary(&report);

    Ok(())
}

fn cmd_status(dest: Option<PathBuf>, rules: Option<PathBuf>, json: bool) -> Result<()> {
    let dest = resolve_dest(dest)?;
    let (rules_path, config, pipeline) = load_rules(&dest, rules)?;
    let generator = generator::from_config(&config.generator, &rules_base(&rules_path));

    let report = pipeline.run(
        generator.as_ref(),
        &dest,
        RunOptions { dry_run: true },
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "Synthesis Status Report".bold());
    println!("Destination: {}", dest.display());
    println!();

    // A copy that a later patch undoes nets to no change, so go by files
    if report.changes.is_empty() {
        println!("{} {}", "✓".green(), "UP TO DATE".green().bold());
        return Ok(());
    }

    println!(
        "{} {} ({} files)",
        "⊙".yellow(),
        "PENDING".yellow().bold(),
        report.changes.len()
    );
    for change in &report.changes {
        let state = if change.before.is_some() { "modified" } else { "new" };
        println!("  - {} ({})", change.path.display(), state);
        for rule in report.changed_rules() {
            if rule
                .outcomes
                .iter()
                .any(|o| o.is_change() && o.file() == change.path)
            {
                println!("      {}", rule.rule.dimmed());
            }
        }
    }

    Ok(())
}

fn cmd_list(dest: Option<PathBuf>, rules: Option<PathBuf>) -> Result<()> {
    let dest = resolve_dest(dest)?;
    let (rules_path, config, pipeline) = load_rules(&dest, rules)?;

    println!("{} ({})", config.meta.name.bold(), rules_path.display());
    if let Some(description) = &config.meta.description {
        println!("{}", description.dimmed());
    }
    println!();

    for plan in pipeline.outputs() {
        println!(
            "{} {} {}",
            "copy".cyan(),
            plan.version.bold(),
            format!("({})", plan.output).dimmed()
        );
        for rule in &plan.copies {
            println!("  - {}", rule.describe());
        }
    }

    println!("{}", "patch".cyan());
    for rule in pipeline.patches() {
        println!("  - {}", rule.describe());
        for file in rule.files() {
            println!("      {}", file.display().to_string().dimmed());
        }
    }

    Ok(())
}
