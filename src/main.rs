// src/main.rs

//! grove - CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use grove::commands::{self, CommonOptions};
use grove::exit;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser)]
#[command(name = "grove")]
#[command(version)]
#[command(about = "Multi-repository setup for content-addressed builds", long_about = None)]
struct Cli {
    /// Path to the repository configuration file
    #[arg(short = 'C', long, global = true)]
    config: Option<PathBuf>,

    /// Path to the run-control file
    #[arg(long, global = true)]
    rc: Option<PathBuf>,

    /// Do not read any run-control file
    #[arg(long, global = true)]
    norc: bool,

    /// Root directory for the Git store, CAS and temporary directories
    #[arg(long, global = true)]
    local_build_root: Option<PathBuf>,

    /// Main repository to set up (default: the configuration's main, or
    /// the lexicographically smallest name)
    #[arg(long, global = true)]
    main: Option<String>,

    /// Consider the full repository closure, not only what is reachable
    /// from main
    #[arg(long, global = true)]
    all: bool,

    /// Number of worker threads (default: hardware threads)
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Git binary used for object transfers
    #[arg(long, global = true)]
    git: Option<String>,

    /// Launcher prefix for external commands, as a JSON list
    #[arg(long, global = true)]
    launcher: Option<String>,

    /// Additional directory with candidate distfiles (repeatable)
    #[arg(long = "distdir", global = true)]
    distdirs: Vec<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize all reachable roots and emit the pinned configuration
    Setup {
        /// Main repository, overriding --main
        #[arg(value_name = "MAIN")]
        sub_main: Option<String>,
    },

    /// Fetch and store distribution files
    Fetch {
        /// Main repository, overriding --main
        #[arg(value_name = "MAIN")]
        sub_main: Option<String>,

        /// Directory to stage distfiles into (default: first dist-dir)
        #[arg(long)]
        fetch_dir: Option<PathBuf>,
    },

    /// Advance pinned Git commit ids and print the updated configuration
    Update {
        /// Repositories to update (default: all git-type repositories)
        repos: Vec<String>,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },

    #[command(external_subcommand)]
    External(Vec<String>),
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("GROVE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32, grove::Error> {
    let opts = CommonOptions {
        config_file: cli.config.clone(),
        rc_file: cli.rc.clone(),
        norc: cli.norc,
        local_build_root: cli.local_build_root.clone(),
        main: cli.main.clone(),
        all: cli.all,
        jobs: cli.jobs,
        git_bin: cli.git.clone(),
        launcher: cli.launcher.clone(),
        distdirs: cli.distdirs.clone(),
    };

    match cli.command {
        Commands::Setup { sub_main } => {
            let (ctx, config_file) = commands::build_context(&opts)?;
            let main = sub_main.or(opts.main);
            let (config, main) =
                commands::load_config_with_main(&config_file, main.as_deref())?;
            let path = commands::cmd_setup(&ctx, &config, &main, opts.all)?;
            println!("{}", path.display());
            Ok(exit::SUCCESS)
        }
        Commands::Fetch { sub_main, fetch_dir } => {
            let (ctx, config_file) = commands::build_context(&opts)?;
            let main = sub_main.or(opts.main);
            let (config, main) =
                commands::load_config_with_main(&config_file, main.as_deref())?;
            commands::cmd_fetch(&ctx, &config, &main, opts.all, fetch_dir)?;
            Ok(exit::SUCCESS)
        }
        Commands::Update { repos } => {
            let (ctx, config_file) = commands::build_context(&opts)?;
            let (config, _main) = commands::load_config_with_main(&config_file, None)?;
            let updated = commands::cmd_update(&ctx, &config, &repos)?;
            println!("{}", serde_json::to_string_pretty(&updated).unwrap_or_default());
            Ok(exit::SUCCESS)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(exit::SUCCESS)
        }
        Commands::External(args) => {
            error!(
                "unknown subcommand provided: {}",
                args.first().map(String::as_str).unwrap_or("")
            );
            Ok(exit::UNKNOWN_COMMAND)
        }
    }
}

fn main() -> ExitCode {
    // Argument errors exit with clap's native code (2).
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
