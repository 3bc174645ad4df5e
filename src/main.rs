use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};

use gion::apply::{self, ApplyOptions, Plan};
use gion::config::GionConfig;
use gion::git::exit_code;
use gion::paths::Root;
use gion::shell_exec::configure_max_concurrent_commands;
use gion::store;
use gion::sync::CancelToken;
use gion::workspace::worktree::{self, AddRepo};
use gion::workspace::{self, Metadata, RemoveOptions, state};

#[derive(Parser)]
#[command(name = "gion")]
#[command(about = "Manage git workspaces backed by shared bare stores", long_about = None)]
struct Cli {
    /// Root directory (overrides the config file)
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage repo stores
    Repo {
        #[command(subcommand)]
        action: RepoCommand,
    },
    /// Create an empty workspace
    Create {
        id: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Add a repository to a workspace
    Add {
        id: String,
        location: String,
        #[arg(long)]
        alias: Option<String>,
        /// Branch to check out (defaults to the workspace ID)
        #[arg(long)]
        branch: Option<String>,
        /// Start point for a new branch
        #[arg(long)]
        base: Option<String>,
        /// Fetch before adding
        #[arg(long)]
        fetch: bool,
    },
    /// Show the state of a workspace
    Status { id: String },
    /// Remove a workspace
    Rm {
        id: String,
        /// Remove even with uncommitted changes or unpushed work
        #[arg(long)]
        force: bool,
    },
    /// Apply a JSON plan
    Apply {
        plan: PathBuf,
        /// Remove worktrees with uncommitted changes
        #[arg(long)]
        force: bool,
        /// Remove worktrees whose status cannot be read
        #[arg(long)]
        allow_status_error: bool,
    },
}

#[derive(Subcommand)]
enum RepoCommand {
    /// Clone (or synchronize) the store for a repository
    Get { location: String },
    /// List stores
    Ls,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = GionConfig::load().context("failed to load config")?;
    configure_max_concurrent_commands(config.max_concurrent_commands);
    let root = Root::new(config.resolve_root(cli.root.as_deref())?);
    let cancel = CancelToken::new();

    match cli.command {
        Commands::Repo { action } => match action {
            RepoCommand::Get { location } => {
                let store = store::get(&root, &location, &cancel)?;
                println!("{}\t{}", store.key(), store.store_path.display());
            }
            RepoCommand::Ls => {
                for identity in store::list(&root)? {
                    println!("{identity}");
                }
            }
        },
        Commands::Create { id, description } => {
            let ws_dir = workspace::create(&root, &id, &Metadata::with_description(description), &cancel)?;
            println!("{}", ws_dir.display());
        }
        Commands::Add {
            id,
            location,
            alias,
            branch,
            base,
            fetch,
        } => {
            let added = worktree::add(
                &root,
                &id,
                &AddRepo {
                    location,
                    alias,
                    branch,
                    base_ref: base,
                    fetch,
                },
                &cancel,
            )?;
            if let Some(base) = &added.base_ref {
                workspace::record_base_branch_if_missing(&root, &id, base)?;
            }
            println!(
                "{}\t{}\t{}",
                added.entry.alias,
                added.entry.branch,
                added.entry.worktree_path.display()
            );
        }
        Commands::Status { id } => print_state(&root, &id, &cancel)?,
        Commands::Rm { id, force } => {
            if !force {
                let current = state::state(&root, &id, &cancel)?;
                if state::requires_confirmation(current.kind) {
                    anyhow::bail!("workspace {id} is {}; use --force to remove it", current.kind);
                }
            }
            workspace::remove(
                &root,
                &id,
                RemoveOptions {
                    allow_dirty: force,
                    allow_status_error: false,
                },
                &cancel,
            )?;
        }
        Commands::Apply {
            plan,
            force,
            allow_status_error,
        } => {
            let plan = read_plan(&plan)?;
            let print_step = |step: &str| println!("{step}");
            apply::apply(
                &root,
                &plan,
                &ApplyOptions {
                    allow_dirty: force,
                    allow_status_error,
                    prefetch_timeout: config.prefetch_timeout(),
                    step: Some(&print_step),
                },
                &cancel,
            )?;
        }
    }

    Ok(())
}

fn read_plan(path: &Path) -> anyhow::Result<Plan> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Plan::from_json(&json)
}

fn print_state(root: &Root, id: &str, cancel: &CancelToken) -> anyhow::Result<()> {
    let current = state::state(root, id, cancel)?;
    println!("{id}: {}", current.kind);
    for repo in &current.repos {
        let s = &repo.status.summary;
        match &repo.status.error {
            Some(error) => println!("  {}: {} ({error})", repo.status.alias, repo.kind),
            None => println!(
                "  {}: {} [{}] +{} -{} staged {} unstaged {} untracked {}",
                repo.status.alias,
                repo.kind,
                s.branch,
                s.ahead,
                s.behind,
                s.staged,
                s.unstaged,
                s.untracked
            ),
        }
    }
    for warning in &current.warnings {
        log::warn!("{warning}");
    }
    Ok(())
}
