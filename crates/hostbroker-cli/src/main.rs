//! hostbroker CLI
//!
//! Check out, inspect and release hosts across provisioning backends

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use hostbroker_core::{
    BrokerCore, BrokerError, CheckoutRequest, ProcessPool, Settings, WorkerPool, serve_worker,
};
use hostbroker_providers::default_registry;

mod args;
mod commands;
mod logging;
mod output;

use commands::{InventoryView, Selection};
use logging::LogFormat;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "hostbroker")]
#[command(about = "Check out and manage hosts from provisioning backends", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (default: $HOSTBROKER_SETTINGS, then the broker directory)
    #[arg(long, global = true, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Log level or filter directive, overriding RUST_LOG and settings
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check out one or more hosts
    Checkout {
        /// Named argument preset from settings
        #[arg(short, long)]
        nick: Option<String>,
        /// Number of hosts
        #[arg(short, long, default_value_t = 1)]
        count: usize,
        /// Open a session to each host after checkout
        #[arg(long)]
        connect: bool,
        /// JSON or YAML file of arguments
        #[arg(long, value_name = "FILE")]
        args_file: Option<PathBuf>,
        /// Provider arguments as --key value pairs
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
        extra: Vec<String>,
    },

    /// Release hosts and remove them from inventory
    Checkin {
        /// Hostnames, names or inventory indexes
        vms: Vec<String>,
        /// Every host in inventory
        #[arg(long)]
        all: bool,
        /// Check in one host at a time
        #[arg(long)]
        sequential: bool,
        /// Inventory filter, e.g. '@inv._broker_provider == "Container"'
        #[arg(long)]
        filter: Option<String>,
    },

    /// Show the local inventory
    Inventory {
        /// Print every field of each host
        #[arg(long, conflicts_with = "list")]
        details: bool,
        /// Print one line per host using inventory_list_vars
        #[arg(long)]
        list: bool,
        /// Reconcile with a provider first: PROVIDER[:ARG][::INSTANCE]
        #[arg(long, value_name = "PROVIDER")]
        sync: Option<String>,
        /// Inventory filter
        #[arg(long)]
        filter: Option<String>,
    },

    /// Extend host leases
    Extend {
        /// Inventory filter
        #[arg(long)]
        filter: Option<String>,
        /// Every host in inventory
        #[arg(long)]
        all: bool,
        /// Extend one host at a time
        #[arg(long)]
        sequential: bool,
        /// Hostnames, names or inventory indexes, then --key value pairs
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
        rest: Vec<String>,
    },

    /// Check out copies of existing hosts
    Duplicate {
        /// Hostnames, names or inventory indexes
        vms: Vec<String>,
        /// Copies per host
        #[arg(short, long, default_value_t = 1)]
        count: usize,
        /// Every host in inventory
        #[arg(long)]
        all: bool,
        /// Inventory filter
        #[arg(long)]
        filter: Option<String>,
    },

    /// Run an action that returns a result instead of a host
    Execute {
        /// Named argument preset from settings
        #[arg(short, long)]
        nick: Option<String>,
        /// Result format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Raw)]
        output_format: OutputFormat,
        /// JSON or YAML file of arguments
        #[arg(long, value_name = "FILE")]
        args_file: Option<PathBuf>,
        /// Provider arguments as --key value pairs
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
        extra: Vec<String>,
    },

    /// List providers, or ask one for help
    Providers {
        /// Provider to query
        name: Option<String>,
        /// Help options as --key value pairs, e.g. --workflows
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
        extra: Vec<String>,
    },

    /// Inspect settings
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Serve one checkout task on stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print settings, or one dotted key
    View {
        /// e.g. ssh.host_username
        key: Option<String>,
    },
    /// Print the settings file location
    Path,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("{e}");
    }
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            let code = report
                .downcast_ref::<BrokerError>()
                .map_or(1, BrokerError::exit_code);
            eprintln!("Error: {report:?}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Worker = cli.command {
        logging::init(cli.log_level.as_deref(), "info", cli.log_format)?;
        serve_worker(default_registry()?, tokio::io::stdin(), tokio::io::stdout()).await?;
        return Ok(());
    }

    let settings = Settings::discover(cli.settings.as_deref())?;
    logging::init(
        cli.log_level.as_deref(),
        &settings.logging.console_level,
        cli.log_format,
    )?;

    if let Commands::Config { command } = &cli.command {
        match command {
            ConfigCommand::View { key } => {
                print!("{}", commands::config_view(&settings, key.as_deref())?);
            }
            ConfigCommand::Path => println!("{}", commands::config_path(&settings)),
        }
        return Ok(());
    }

    let pool = worker_pool(&settings)?;
    let core = Arc::new(BrokerCore::new(settings, default_registry()?));

    match cli.command {
        Commands::Checkout {
            nick,
            count,
            connect,
            args_file,
            extra,
        } => {
            let request = request(nick, args_file, &extra)?
                .with_count(count)
                .with_connect(connect);
            commands::checkout(core, pool, request).await
        }
        Commands::Checkin {
            vms,
            all,
            sequential,
            filter,
        } => {
            commands::checkin(
                core,
                Selection {
                    selectors: vms,
                    all,
                    filter,
                },
                sequential,
            )
            .await
        }
        Commands::Inventory {
            details,
            list,
            sync,
            filter,
        } => {
            let view = if details {
                InventoryView::Details
            } else if list {
                InventoryView::List
            } else {
                InventoryView::Table
            };
            commands::inventory(core, sync, filter, view).await
        }
        Commands::Extend {
            filter,
            all,
            sequential,
            rest,
        } => {
            let (selectors, extra) = args::split_selectors(rest);
            let extend_args = args::parse_extra_args(&extra)?;
            commands::extend(
                core,
                Selection {
                    selectors,
                    all,
                    filter,
                },
                extend_args,
                sequential,
            )
            .await
        }
        Commands::Duplicate {
            vms,
            count,
            all,
            filter,
        } => {
            commands::duplicate(
                core,
                pool,
                Selection {
                    selectors: vms,
                    all,
                    filter,
                },
                count,
            )
            .await
        }
        Commands::Execute {
            nick,
            output_format,
            args_file,
            extra,
        } => {
            let request = request(nick, args_file, &extra)?;
            commands::execute(core, request, output_format).await
        }
        Commands::Providers { name, extra } => {
            commands::providers(core, name, args::parse_extra_args(&extra)?).await
        }
        Commands::Config { .. } | Commands::Worker => Ok(()),
    }
}

fn request(
    nick: Option<String>,
    args_file: Option<PathBuf>,
    extra: &[String],
) -> Result<CheckoutRequest> {
    let args = args::collect_args(args_file.as_deref(), extra)?;
    let mut request = CheckoutRequest::new().with_args(args);
    if let Some(nick) = nick {
        request = request.with_nick(nick);
    }
    Ok(request)
}

/// Multi-host checkouts run in worker processes of this binary
fn worker_pool(settings: &Settings) -> Result<Arc<dyn WorkerPool>> {
    let mut pool = ProcessPool::current_exe()?;
    if let Some(limit) = settings.thread_limit {
        pool = pool.with_limit(limit);
    }
    Ok(Arc::new(pool))
}
