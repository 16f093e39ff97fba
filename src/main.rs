use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{ArgGroup, Parser};
use punchclock::commit::short;
use punchclock::schedule::parse_date;
use punchclock::{
    CommitRange, Config, DateWindow, Git, IdentityOverride, PlanEntry, Progress, Repository,
    RewriteRequest, ScheduleRequest,
};
use tracing::Level;

#[derive(Parser)]
#[command(name = "punchclock", version)]
#[command(about = "Re-date recent git commits so they land inside working hours")]
#[command(group(ArgGroup::new("range").required(true).args(["commits", "all"])))]
struct Cli {
    /// Git repository path
    #[arg(short, long, default_value = ".")]
    repo: PathBuf,

    /// Number of recent commits to rewrite
    #[arg(short, long, value_parser = parse_count)]
    commits: Option<usize>,

    /// Rewrite every commit reachable from HEAD
    #[arg(long)]
    all: bool,

    /// First day commits may land on (YYYY-MM-DD)
    #[arg(short = 's', long, value_parser = parse_date)]
    start_date: NaiveDate,

    /// Last day commits may land on (YYYY-MM-DD)
    #[arg(short = 'e', long, value_parser = parse_date)]
    end_date: NaiveDate,

    /// Start of the working day, HH:MM (default: 09:00)
    #[arg(long)]
    work_start: Option<String>,

    /// End of the working day, HH:MM (default: 17:00)
    #[arg(long)]
    work_end: Option<String>,

    /// Random variation in minutes (default: 15)
    #[arg(long)]
    jitter: Option<u32>,

    /// New author and committer name
    #[arg(long)]
    author_name: Option<String>,

    /// New author and committer email
    #[arg(long)]
    author_email: Option<String>,

    /// Skip creating a backup branch
    #[arg(long)]
    no_backup: bool,

    /// Settings file (default: .punchclock.toml at the repository root)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Show the date plan without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,

    /// Log more (repeat for more detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Settings given on the command line, to be layered over the file.
    fn overrides(&self) -> Config {
        Config {
            work_start: self.work_start.clone(),
            work_end: self.work_end.clone(),
            jitter: self.jitter,
            skip_weekends: None,
            author_name: self.author_name.clone(),
            author_email: self.author_email.clone(),
            backup: self.no_backup.then_some(false),
        }
    }

    fn range(&self) -> CommitRange {
        match self.commits {
            Some(n) => CommitRange::Tail(n),
            None => CommitRange::All,
        }
    }
}

fn parse_count(input: &str) -> Result<usize, String> {
    match input.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let window = DateWindow::new(cli.start_date, cli.end_date)?;

    let git = Git::discover(&cli.repo)?;
    println!("Working with repository: {}", git.root().display());

    // Settings are validated before any commit is read.
    let settings = Config::discover(cli.config.as_deref(), git.root())?.merged(cli.overrides());
    let hours = settings.work_hours()?;
    let identity = settings.identity();

    let range = cli.range();
    let ids = punchclock::select_commits(&git, range)?;
    println!("Found {} commits to rewrite", ids.len());

    let request = ScheduleRequest {
        count: ids.len(),
        window,
        hours,
        jitter: settings.jitter_minutes(),
        skip_weekends: settings.skips_weekends(),
    };
    let timestamps = punchclock::generate(&request, &mut rand::thread_rng())?;

    let records = ids
        .iter()
        .map(|id| git.read_commit(id))
        .collect::<Result<Vec<_>, _>>()?;
    print_plan(&punchclock::plan(&records, &timestamps), identity.as_ref());

    if cli.dry_run {
        println!("\nDry run: no changes made.");
        return Ok(());
    }

    match range {
        CommitRange::Tail(n) => println!("\nWARNING: This will modify the last {n} commits!"),
        CommitRange::All => println!("\nWARNING: This will modify ALL commits in the repository!"),
    }
    if !cli.yes && !confirm("Continue? (y/n): ")? {
        println!("Cancelled");
        return Ok(());
    }

    let backup = if settings.backs_up() {
        Some(punchclock::backup_name(&git.head_ref()?, Local::now().naive_local()))
    } else {
        None
    };

    let request = RewriteRequest {
        commit_ids: &ids,
        timestamps: &timestamps,
        identity: identity.as_ref(),
        backup: backup.as_deref(),
    };
    println!("Rewriting commits...");
    let done = punchclock::rewrite(&git, &request, print_progress)?;

    if let Some(branch) = &done.backup {
        println!("Backup of the old history: {branch}");
    }
    println!(
        "Successfully rewrote {} commits! HEAD is now {}",
        done.commits.len(),
        short(&done.head)
    );
    println!("Warning: Use 'git push --force-with-lease' if commits were already pushed");

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

fn print_plan(entries: &[PlanEntry], identity: Option<&IdentityOverride>) {
    println!("\nDate assignment plan:");
    for entry in entries {
        println!(
            "  {} | {} -> {} | {}",
            short(&entry.id),
            entry.original.format("%Y-%m-%d %H:%M:%S"),
            entry.new.format("%Y-%m-%d %H:%M:%S"),
            entry.subject
        );
    }
    if let Some(identity) = identity {
        println!(
            "  as {} <{}>",
            identity.name.as_deref().unwrap_or("current name"),
            identity.email.as_deref().unwrap_or("current email")
        );
    }
}

fn print_progress(progress: &Progress<'_>) {
    const WIDTH: usize = 30;
    let done = progress.index + 1;
    let filled = done * WIDTH / progress.total;
    println!(
        "[{}{}] {:>3}% ({done}/{}) {} -> {} at {}",
        "#".repeat(filled),
        "-".repeat(WIDTH - filled),
        done * 100 / progress.total,
        progress.total,
        short(progress.old),
        short(progress.new),
        progress.when.format("%Y-%m-%d %H:%M:%S")
    );
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
