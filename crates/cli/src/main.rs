mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use commands::migrate::{self, RunArgs, SupplierArgs};
use logging::LogFormat;
use strata_migrate::config::parse_list;
use strata_migrate::{ConfigError, MigrateConfig};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Idempotent schema migrations for PostgreSQL")]
#[command(version)]
struct Cli {
    /// Database URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Directory holding migration files (overrides STRATA_MIGRATIONS_DIR)
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Ledger table name (overrides STRATA_LEDGER_TABLE)
    #[arg(long, global = true)]
    ledger_table: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database migration management
    Migrate {
        #[command(subcommand)]
        migrate_command: MigrateCommands,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Apply pending migrations in version order
    Run {
        /// Hold an advisory lock for the whole run
        #[arg(long)]
        lock: bool,

        /// Apply at most this many migrations
        #[arg(long)]
        max_units: Option<usize>,

        /// Start no new migration after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        #[command(flatten)]
        supplier: SupplierFlags,
    },

    /// Show applied, pending and orphaned migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        supplier: SupplierFlags,
    },

    /// List the migrations a run would apply
    Plan {
        #[command(flatten)]
        supplier: SupplierFlags,
    },

    /// Create a new migration file
    New {
        /// Migration name
        name: String,
    },
}

#[derive(clap::Args)]
struct SupplierFlags {
    /// Include the built-in suppliers migration
    #[arg(long)]
    with_supplier_unit: bool,

    /// Version assigned to the built-in suppliers migration
    #[arg(long, default_value = "0000")]
    supplier_version: String,

    /// Tables that get a supplier_id column (overrides STRATA_SUPPLIER_TABLES)
    #[arg(long)]
    supplier_tables: Option<String>,
}

impl SupplierFlags {
    fn resolve(self, config: &MigrateConfig) -> Option<SupplierArgs> {
        self.with_supplier_unit.then(|| SupplierArgs {
            version: self.supplier_version,
            tables: self
                .supplier_tables
                .as_deref()
                .map(parse_list)
                .unwrap_or_else(|| config.supplier_tables.clone()),
        })
    }
}

fn load_config(cli: &Cli) -> Result<MigrateConfig, ConfigError> {
    let mut config = MigrateConfig::from_env()?;

    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(dir) = &cli.migrations_dir {
        config.migrations_dir = dir.clone();
    }
    if let Some(table) = &cli.ledger_table {
        config.ledger_table = table.clone();
    }
    if let Commands::Migrate {
        migrate_command: MigrateCommands::Run { lock: true, .. },
    } = &cli.command
    {
        config.lock = true;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(&config.log_level, cli.log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Migrate { migrate_command } => match migrate_command {
            MigrateCommands::Run {
                lock: _,
                max_units,
                timeout_secs,
                supplier,
            } => {
                let args = RunArgs {
                    max_units,
                    timeout: timeout_secs.map(Duration::from_secs),
                    supplier: supplier.resolve(&config),
                };
                migrate::run(&config, args).await
            }
            MigrateCommands::Status { json, supplier } => {
                migrate::status(&config, supplier.resolve(&config), json).await
            }
            MigrateCommands::Plan { supplier } => {
                migrate::plan(&config, supplier.resolve(&config)).await
            }
            MigrateCommands::New { name } => migrate::create(&config, &name),
        },
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
