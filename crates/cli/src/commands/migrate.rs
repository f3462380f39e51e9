use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use strata_migrate::catalog::supplier_unit;
use strata_migrate::{
    DirectorySource, GuardPolicy, MigrateConfig, MigrationRunner, MigrationSource,
    MigrationStatus, MigrationStore, PostgresStore, RunError, RunReport, StaticSource, Version,
};
use tracing::warn;

/// Built-in suppliers migration requested on the command line
pub struct SupplierArgs {
    pub version: String,
    pub tables: Vec<String>,
}

pub struct RunArgs {
    pub max_units: Option<usize>,
    pub timeout: Option<Duration>,
    pub supplier: Option<SupplierArgs>,
}

async fn connect(config: &MigrateConfig) -> anyhow::Result<Arc<PostgresStore>> {
    let url = config.require_database_url()?;
    let store = PostgresStore::connect(url)
        .await
        .context("failed to connect to the database")?;
    Ok(Arc::new(store))
}

async fn load_source(
    config: &MigrateConfig,
    supplier: Option<SupplierArgs>,
) -> anyhow::Result<Box<dyn MigrationSource>> {
    let directory = DirectorySource::new(&config.migrations_dir);
    let Some(supplier) = supplier else {
        return Ok(Box::new(directory));
    };

    let mut source = StaticSource::new(directory.list_units().await?)?;
    let version = Version::parse(&supplier.version).context("invalid --supplier-version")?;
    source.extend(vec![supplier_unit(version, &supplier.tables)])?;
    Ok(Box::new(source))
}

async fn runner(
    config: &MigrateConfig,
    store: Arc<PostgresStore>,
    supplier: Option<SupplierArgs>,
) -> anyhow::Result<MigrationRunner> {
    let source = load_source(config, supplier).await?;
    Ok(MigrationRunner::new(source, store)
        .with_ledger_table(&config.ledger_table)
        .with_guard_policy(GuardPolicy::new(config.constraint_check)))
}

async fn close(store: &PostgresStore) {
    if let Err(e) = store.close().await {
        warn!(error = %e, "Failed to close database connection");
    }
}

pub async fn run(config: &MigrateConfig, args: RunArgs) -> anyhow::Result<ExitCode> {
    let store = connect(config).await?;

    let mut options = config.run_options();
    options.max_units = args.max_units;
    options.deadline = args.timeout;

    let runner = runner(config, store.clone(), args.supplier)
        .await?
        .with_options(options);
    let result = runner.run().await;
    close(&store).await;

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            print_failure(&err);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_report(report: &RunReport) {
    if report.applied_count == 0 && report.remaining_count == 0 {
        println!("Nothing to migrate ({} already applied)", report.skipped_count);
        return;
    }

    for unit in &report.reports {
        println!(
            "Applied {} - {} ({} statements, {} already in place, {} ms)",
            unit.version,
            unit.name,
            unit.execution.statements.len(),
            unit.execution.already_existed_count(),
            unit.execution_time_ms
        );
    }
    println!(
        "Applied {} migration(s) in {} ms, {} already applied",
        report.applied_count, report.execution_time_ms, report.skipped_count
    );
    if report.remaining_count > 0 {
        println!(
            "Stopped early: {} migration(s) still pending",
            report.remaining_count
        );
    }
}

fn print_failure(err: &RunError) {
    eprintln!("Migration failed");
    if let Some(version) = &err.failed_version {
        match &err.failed_name {
            Some(name) => eprintln!("  version:   {} ({})", version, name),
            None => eprintln!("  version:   {}", version),
        }
    }
    if let Some(index) = err.statement_index() {
        eprintln!("  statement: {}", index);
    }
    eprintln!("  cause:     {}", err.cause);
    if err.failed_version.is_some() {
        eprintln!("The failing migration was rolled back; later migrations were not attempted.");
    }
}

pub async fn status(
    config: &MigrateConfig,
    supplier: Option<SupplierArgs>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let store = connect(config).await?;
    let runner = runner(config, store.clone(), supplier).await?;
    let lines = runner.status().await;
    close(&store).await;
    let lines = lines?;

    if json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
        return Ok(ExitCode::SUCCESS);
    }

    if lines.is_empty() {
        println!("No migrations found");
        return Ok(ExitCode::SUCCESS);
    }

    println!("Migration Status:");
    for line in &lines {
        let state = match &line.status {
            MigrationStatus::Applied { applied_at } => {
                format!("applied {}", applied_at.format("%Y-%m-%d %H:%M:%S UTC"))
            }
            MigrationStatus::Pending => "pending".to_string(),
            MigrationStatus::Orphaned { applied_at } => format!(
                "applied {}, missing from source",
                applied_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        };
        println!("  {:<20} {:<32} {}", line.version, line.name, state);
    }

    let pending = lines
        .iter()
        .filter(|l| l.status == MigrationStatus::Pending)
        .count();
    println!("{} migration(s), {} pending", lines.len(), pending);
    Ok(ExitCode::SUCCESS)
}

pub async fn plan(config: &MigrateConfig, supplier: Option<SupplierArgs>) -> anyhow::Result<ExitCode> {
    let store = connect(config).await?;
    let runner = runner(config, store.clone(), supplier).await?;
    let pending = runner.plan().await;
    close(&store).await;
    let pending = pending?;

    if pending.is_empty() {
        println!("Nothing to migrate");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{} migration(s) would be applied:", pending.len());
    for unit in &pending {
        println!("  {} - {}", unit.version(), unit.name());
        for (index, statement) in unit.statements().iter().enumerate() {
            println!("      {:>3}  {}", index, statement.kind());
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn create(config: &MigrateConfig, name: &str) -> anyhow::Result<ExitCode> {
    let path = DirectorySource::new(&config.migrations_dir)
        .create_migration(name)
        .with_context(|| format!("failed to create migration '{}'", name))?;
    println!("Created migration: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_writes_into_configured_dir() {
        let dir = TempDir::new().unwrap();
        let config = MigrateConfig {
            migrations_dir: dir.path().join("migrations"),
            ..MigrateConfig::default()
        };

        create(&config, "add suppliers").unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("migrations"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("_add_suppliers.sql"));
    }

    #[tokio::test]
    async fn test_supplier_unit_joins_directory_units() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("0001_notes.sql"), "CREATE TABLE notes (id INT);").unwrap();
        let config = MigrateConfig {
            migrations_dir: dir.path().to_path_buf(),
            ..MigrateConfig::default()
        };

        let source = load_source(
            &config,
            Some(SupplierArgs {
                version: "0000".to_string(),
                tables: vec!["products".to_string()],
            }),
        )
        .await
        .unwrap();
        let units = source.list_units().await.unwrap();
        let versions: Vec<_> = units.iter().map(|u| u.version().as_str().to_string()).collect();
        assert_eq!(versions, vec!["0000", "0001"]);
    }

    #[tokio::test]
    async fn test_supplier_version_collision_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("0001_notes.sql"), "CREATE TABLE notes (id INT);").unwrap();
        let config = MigrateConfig {
            migrations_dir: dir.path().to_path_buf(),
            ..MigrateConfig::default()
        };

        let result = load_source(
            &config,
            Some(SupplierArgs {
                version: "0001".to_string(),
                tables: Vec::new(),
            }),
        )
        .await;
        assert!(result.is_err());
    }
}
