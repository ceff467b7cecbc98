use anyhow::Result;
use steward_migrate::{
    MigrationConfig, MigrationResult, MigrationStatus, Migrator, PostgresBackend, RollbackCount,
    ScriptRepository,
};

/// Apply every pending migration
pub async fn run(config: &MigrationConfig) -> Result<()> {
    let mut migrator = Migrator::connect(config).await?;
    let result = migrator.apply().await;
    let report = finish(migrator, result).await?;

    if report.applied.is_empty() {
        println!("Nothing to migrate ({} already applied)", report.skipped);
    } else {
        for name in &report.applied {
            println!("  applied  {}", name);
        }
        println!(
            "Applied {} migration(s) in {}ms",
            report.applied_count(),
            report.execution_time_ms
        );
    }
    Ok(())
}

/// Revert the most recent migrations; `count` is taken permissively
pub async fn rollback(config: &MigrationConfig, count: Option<&str>) -> Result<()> {
    let count = RollbackCount::from_arg(count);

    let mut migrator = Migrator::connect(config).await?;
    let result = migrator.revert(count).await;
    let report = finish(migrator, result).await?;

    if report.reverted.is_empty() {
        println!("Nothing to roll back");
        return Ok(());
    }

    for name in &report.reverted {
        let note = if report.missing_files.contains(name) {
            " (file missing, record removed)"
        } else if report.forward_only.contains(name) {
            " (no down script, record removed)"
        } else {
            ""
        };
        println!("  reverted {}{}", name, note);
    }
    println!(
        "Reverted {} migration(s) in {}ms",
        report.reverted_count(),
        report.execution_time_ms
    );
    Ok(())
}

/// Show applied and pending migrations
pub async fn status(config: &MigrationConfig, json: bool) -> Result<()> {
    let mut migrator = Migrator::connect(config).await?;
    let result = migrator.status().await;
    let statuses = finish(migrator, result).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    println!("Migration Status:");
    println!("================");
    if statuses.is_empty() {
        println!("No migrations found");
        return Ok(());
    }
    for status in &statuses {
        println!("  {}", format_status(status));
    }

    let pending = statuses.iter().filter(|s| s.is_pending()).count();
    println!("\n{} applied, {} pending", statuses.len() - pending, pending);
    Ok(())
}

/// Create a new migration file
pub fn make(config: &MigrationConfig, name: &str) -> Result<()> {
    let path = ScriptRepository::new(config.migrations_dir.clone()).create(name)?;
    println!("Created migration: {}", path.display());
    Ok(())
}

/// Close the session on every exit path; the run's own error wins
async fn finish<T>(
    migrator: Migrator<PostgresBackend>,
    result: MigrationResult<T>,
) -> MigrationResult<T> {
    if let Err(err) = migrator.close().await {
        tracing::warn!(error = %err, "failed to close database connection");
    }
    result
}

fn format_status(status: &MigrationStatus) -> String {
    let mut line = match &status.applied {
        Some(record) => format!(
            "[applied {}] {}",
            record.executed_at.format("%Y-%m-%d %H:%M:%S"),
            status.name
        ),
        None => format!("[pending]                     {}", status.name),
    };
    if !status.file_present {
        line.push_str("  (file missing)");
    } else if status.forward_only {
        line.push_str("  (forward-only)");
    }
    line
}
