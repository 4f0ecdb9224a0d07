// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use lobe::{
    app::{self, InstallOptions},
    config, generate,
    lobe::Lobe,
    probe::find_parent_lobe,
};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::{env::current_dir, path::PathBuf, process::exit};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  lobe [options] <lobe-command>\n  lobe [options] setup <setup-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Init(opts) => run_init(opts),
            Command::Drop(opts) => run_drop(opts),
            Command::GetApp(opts) => run_get_app(opts),
            Command::RemoveApp(opts) => run_remove_app(opts),
            Command::ExcludeApp(opts) => run_exclude_app(opts),
            Command::IncludeApp(opts) => run_include_app(opts),
            Command::Setup(opts) => run_setup(opts),
            Command::Restart(opts) => run_restart(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Initialize new instance directory.
    #[command(override_usage = "lobe init [options] <path>")]
    Init(InitOptions),

    /// Delete an instance that serves no sites.
    #[command(override_usage = "lobe drop <path>")]
    Drop(DropOptions),

    /// Fetch and install an application.
    #[command(override_usage = "lobe get-app [options] <source>")]
    GetApp(GetAppOptions),

    /// Uninstall and delete an application.
    #[command(override_usage = "lobe remove-app [options] <app>")]
    RemoveApp(RemoveAppOptions),

    /// Exclude an application from updates.
    #[command(override_usage = "lobe exclude-app <app>")]
    ExcludeApp(AppNameOptions),

    /// Re-include a previously excluded application.
    #[command(override_usage = "lobe include-app <app>")]
    IncludeApp(AppNameOptions),

    /// Generate instance configuration and supervision files.
    Setup(SetupOptions),

    /// Restart instance processes.
    #[command(override_usage = "lobe restart [options]")]
    Restart(RestartOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    #[arg(value_name = "path")]
    pub path: PathBuf,

    /// Source to fetch the framework from instead of the default remote.
    #[arg(long, value_name = "source")]
    pub framework_source: Option<String>,

    /// Branch of the framework to check out.
    #[arg(short, long, value_name = "branch")]
    pub branch: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DropOptions {
    #[arg(value_name = "path")]
    pub path: PathBuf,

    /// Delete without asking for confirmation.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct GetAppOptions {
    /// Application source: name, org/repo, URL, SSH shorthand, or local path.
    #[arg(value_name = "source")]
    pub source: String,

    /// Branch to check out instead of the source default.
    #[arg(short, long, value_name = "branch")]
    pub branch: Option<String>,

    /// Skip building web assets after the install.
    #[arg(long)]
    pub skip_assets: bool,

    /// Install even when declared required applications are missing.
    #[arg(long)]
    pub ignore_resolution: bool,

    /// Restart instance processes once the install lands.
    #[arg(long)]
    pub restart: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RemoveAppOptions {
    #[arg(value_name = "app")]
    pub app: String,

    /// Delete the application folder without archiving it first.
    #[arg(long)]
    pub no_backup: bool,

    /// Skip the registry and site-usage checks.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct AppNameOptions {
    #[arg(value_name = "app")]
    pub app: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SetupOptions {
    #[command(subcommand)]
    pub target: SetupTarget,
}

#[derive(Debug, Clone, Subcommand)]
enum SetupTarget {
    /// Write the default instance configuration with allocated ports.
    Config,

    /// Create the virtual environment under env/.
    Env,

    /// Generate a Procfile for process-manager driven development.
    Procfile {
        /// Overwrite an existing Procfile without asking.
        #[arg(short, long)]
        yes: bool,

        /// Leave redis processes out.
        #[arg(long)]
        skip_redis: bool,
    },

    /// Generate config/supervisor.conf.
    Supervisor {
        /// User the supervised processes run as.
        #[arg(short, long, value_name = "user")]
        user: Option<String>,

        /// Overwrite an existing supervisor.conf without asking.
        #[arg(short, long)]
        yes: bool,

        /// Leave redis programs out.
        #[arg(long)]
        skip_redis: bool,
    },

    /// Generate systemd units under config/systemd/.
    Systemd {
        /// User the units run as.
        #[arg(short, long, value_name = "user")]
        user: Option<String>,

        /// Overwrite existing units without asking.
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RestartOptions {
    /// Restart only the web process group.
    #[arg(long)]
    pub web: bool,

    /// Restart through supervisor even if not configured to.
    #[arg(long)]
    pub supervisor: bool,

    /// Restart through systemd even if not configured to.
    #[arg(long)]
    pub systemd: bool,
}

fn main() {
    let layer = fmt::layer().compact();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry().with(layer).with(filter).init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

/// Instance the current working directory sits inside.
fn current_lobe() -> Result<Lobe> {
    let cwd = current_dir()?;
    let path = find_parent_lobe(&cwd)
        .ok_or_else(|| anyhow!("{:?} is not inside an instance", cwd.display()))?;
    Ok(Lobe::new(path))
}

fn run_init(opts: InitOptions) -> Result<()> {
    let lobe = Lobe::new(opts.path);
    lobe.init(opts.framework_source.as_deref(), opts.branch)?;
    generate::procfile::setup(&lobe, true, false)?;
    Ok(())
}

fn run_drop(opts: DropOptions) -> Result<()> {
    let lobe = Lobe::new(opts.path);

    if !opts.yes {
        let proceed = inquire::Confirm::new(&format!(
            "Delete the whole instance at {:?}?",
            lobe.path().display()
        ))
        .with_default(false)
        .prompt()?;
        if !proceed {
            return Ok(());
        }
    }

    lobe.teardown()?;
    Ok(())
}

fn run_get_app(opts: GetAppOptions) -> Result<()> {
    let lobe = current_lobe()?;
    lobe.install(
        &opts.source,
        opts.branch,
        &InstallOptions {
            skip_assets: opts.skip_assets,
            restart_lobe: opts.restart,
            ignore_resolution: opts.ignore_resolution,
            ..InstallOptions::default()
        },
    )?;
    Ok(())
}

fn run_remove_app(opts: RemoveAppOptions) -> Result<()> {
    let lobe = current_lobe()?;
    lobe.uninstall(&opts.app, opts.no_backup, opts.force, &lobe)?;
    Ok(())
}

fn run_exclude_app(opts: AppNameOptions) -> Result<()> {
    let lobe = current_lobe()?;
    app::exclude_app(&opts.app, lobe.path())?;
    Ok(())
}

fn run_include_app(opts: AppNameOptions) -> Result<()> {
    let lobe = current_lobe()?;
    app::include_app(&opts.app, lobe.path())?;
    Ok(())
}

fn run_setup(opts: SetupOptions) -> Result<()> {
    let lobe = current_lobe()?;
    match opts.target {
        SetupTarget::Config => config::setup_config(lobe.path())?,
        SetupTarget::Env => lobe.setup_env()?,
        SetupTarget::Procfile { yes, skip_redis } => {
            generate::procfile::setup(&lobe, yes, skip_redis)?
        }
        SetupTarget::Supervisor {
            user,
            yes,
            skip_redis,
        } => generate::supervisor::setup(&lobe, user, yes, skip_redis)?,
        SetupTarget::Systemd { user, yes } => generate::systemd::setup(&lobe, user, yes)?,
    }
    Ok(())
}

fn run_restart(opts: RestartOptions) -> Result<()> {
    let lobe = current_lobe()?;
    lobe.reload(opts.web, opts.supervisor, opts.systemd)?;
    Ok(())
}
