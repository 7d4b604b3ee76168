use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use unbrew::engine::{Installer, resolve_and_plan};
use unbrew::manager::Manager;
use unbrew::reporter::uninstall_summary_lines;

#[derive(Parser)]
#[command(name = "ub")]
#[command(version, about = "A native Homebrew-compatible package manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install formulae and/or casks
    #[command(alias = "i")]
    Install {
        /// Formula or cask names
        #[arg(required = true)]
        names: Vec<String>,

        /// Maximum parallel jobs
        #[arg(long)]
        jobs: Option<usize>,
    },

    /// Uninstall formulae and/or casks, then autoremove unneeded deps
    #[command(alias = "remove", alias = "rm")]
    Uninstall {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// List installed formulae
    #[command(alias = "ls")]
    List,

    /// Show formula metadata
    Info {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Search formulae by name or description
    Search {
        query: Vec<String>,
    },

    /// Refresh the formula metadata cache
    Update,

    /// Print the prefix, or a formula's latest installed directory
    Prefix {
        name: Option<String>,
    },

    /// Print the resolved environment configuration
    Config,

    /// Uninstall everything and clear the cache
    Reset,

    /// Plan a local tap install without running it
    MvpPlan {
        #[arg(required = true)]
        names: Vec<String>,

        /// Formula tap directory
        #[arg(long, default_value = "./taps/core")]
        tap: PathBuf,
    },

    /// Install from a local tap through the prototype engine
    MvpInstall {
        #[arg(required = true)]
        names: Vec<String>,

        /// Formula tap directory
        #[arg(long, default_value = "./taps/core")]
        tap: PathBuf,

        /// Installation root
        #[arg(long, default_value = "./cellar")]
        root: PathBuf,

        /// Download cache directory
        #[arg(long, default_value = "./cache")]
        cache: PathBuf,

        /// Maximum parallel jobs
        #[arg(long)]
        jobs: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    if let Err(err) = run(&cancel).await {
        eprintln!("{} {err}", "error:".red().bold());
        std::process::exit(1);
    }
}

fn init_tracing() {
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "warn");
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cancel: &CancellationToken) -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut manager = Manager::new(0);
    manager.ensure_layout()?;

    match cli.command {
        Commands::Install { names, jobs } => {
            if let Some(jobs) = jobs {
                manager.workers = jobs.max(1);
            }
            manager.install(cancel, &names).await?;
        }
        Commands::Uninstall { names } => {
            let summary = manager.uninstall_with_autoremove(cancel, &names).await?;
            for line in uninstall_summary_lines(&summary) {
                println!("{line}");
            }
        }
        Commands::List => {
            for name in manager.list_installed()? {
                println!("{name}");
            }
        }
        Commands::Info { names } => {
            for name in names {
                let formula = manager.info(cancel, &name).await?;
                println!("{} ({})", formula.name, formula.versions.stable);
                println!("{}", formula.desc);
                if !formula.homepage.is_empty() {
                    println!("Homepage: {}", formula.homepage);
                }
                if !formula.dependencies.is_empty() {
                    println!("Dependencies: {}", formula.dependencies.join(", "));
                }
            }
        }
        Commands::Search { query } => {
            let results = manager.search(cancel, &query.join(" ")).await?;
            for result in results {
                println!("{}\t{}", result.name, result.desc);
            }
        }
        Commands::Update => {
            manager.update(cancel).await?;
            println!("Updated Homebrew formula metadata cache");
        }
        Commands::Prefix { name } => match name {
            None => println!("{}", manager.paths.prefix.display()),
            Some(name) => println!("{}", manager.installed_prefix(&name)?.display()),
        },
        Commands::Config => {
            println!("UB_BASE_DIR: {}", manager.paths.base_dir.display());
            println!("UB_PREFIX: {}", manager.paths.prefix.display());
            println!("UB_REPOSITORY: {}", manager.paths.repo.display());
            println!("UB_CELLAR: {}", manager.paths.cellar.display());
            println!("UB_CACHE: {}", manager.paths.cache.display());
        }
        Commands::Reset => {
            manager.reset(cancel).await?;
            println!("Reset complete");
        }
        Commands::MvpPlan { names, tap } => {
            let (formulas, plan) = resolve_and_plan(&tap, &names)?;
            println!("Plan");
            println!("- roots: {}", names.join(", "));
            println!("- total formulas: {}", formulas.len());
            println!("- layers:");
            for (idx, layer) in plan.layers.iter().enumerate() {
                println!("  {idx}: {}", layer.join(", "));
            }
        }
        Commands::MvpInstall {
            names,
            tap,
            root,
            cache,
            jobs,
        } => {
            let (formulas, plan) = resolve_and_plan(&tap, &names)?;
            std::fs::create_dir_all(&root)?;

            let installer = Installer {
                tap_dir: must_abs(&tap),
                root_dir: must_abs(&root),
                cache_dir: must_abs(&cache),
                jobs: jobs.unwrap_or(manager.workers),
            };

            println!(
                "Installing {} formula(s) with {} job(s)",
                formulas.len(),
                installer.jobs
            );
            println!("Execution layers: {}", plan.layers.len());

            let installed: Vec<String> = formulas.keys().cloned().collect();
            installer.install(cancel, formulas.into_values()).await?;
            println!("Installed: {}", installed.join(", "));
        }
    }

    Ok(())
}

fn must_abs(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
