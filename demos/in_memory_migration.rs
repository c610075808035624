//! In-Memory Migration Example
//!
//! Exports a small project to a staging directory, imports it into an
//! in-memory destination, then crashes and resumes a live migration.
//!
//! Run with: cargo run --example in_memory_migration

use serde_json::json;
use trueno_migrate::backend::{DestinationClient, MemoryDestination, MemorySource, SourceRun};
use trueno_migrate::convert::HistoryRow;
use trueno_migrate::{logging, MigrationConfig, Migrator};

fn row(step: i64, loss: f64) -> HistoryRow {
    let value = json!({"_step": step, "_timestamp": 1_700_000_000 + step, "loss": loss});
    value.as_object().cloned().unwrap_or_default()
}

fn main() -> trueno_migrate::Result<()> {
    logging::init(false, None)?;
    println!("=== Trueno-Migrate In-Memory Migration ===\n");

    let source = MemorySource::new();
    for (run_id, name) in [("r1", "baseline"), ("r2", "wide-lr")] {
        let mut run = SourceRun::new(run_id, name);
        run.config = json!({"lr": 0.01, "optimizer": {"name": "adam"}})
            .as_object()
            .cloned()
            .unwrap_or_default();
        let history = (0..5).map(|s| row(s, 1.0 / (s as f64 + 1.0))).collect();
        source.add_run("demo", run, history, vec![]);
    }

    // -------------------------------------------------------------------------
    // 1. Dry-run export to a staging directory
    // -------------------------------------------------------------------------
    let staging = std::env::temp_dir().join("trueno-migrate-demo");
    std::fs::create_dir_all(&staging)?;
    let export = MigrationConfig {
        dry_run: true,
        dry_run_save_dir: staging.clone(),
        ..MigrationConfig::for_project("demo")
    };
    println!("1. {}", Migrator::new(export, &source)?.run()?);

    // -------------------------------------------------------------------------
    // 2. Import the staged project
    // -------------------------------------------------------------------------
    let imported = MemoryDestination::new();
    let import = MigrationConfig {
        resume_from_dry_run: true,
        skip_existing_runs: true,
        dry_run_save_dir: staging.clone(),
        ..MigrationConfig::for_project("demo")
    };
    let summary = Migrator::new(import, &source)?
        .with_destination(&imported)
        .run()?;
    println!("2. {summary}");

    // -------------------------------------------------------------------------
    // 3. Live migration that crashes halfway, then resumes
    // -------------------------------------------------------------------------
    let live = MemoryDestination::new();
    live.fail_metrics_for("wide-lr");
    let summary = Migrator::new(MigrationConfig::for_project("demo"), &source)?
        .with_destination(&live)
        .run()?;
    println!("3. {summary}");

    live.heal("wide-lr");
    let resume = MigrationConfig {
        resume_from_crash: true,
        ..MigrationConfig::for_project("demo")
    };
    let summary = Migrator::new(resume, &source)?.with_destination(&live).run()?;
    println!("4. {summary}");

    if let Some(experiment) = live.get_experiment_by_name("demo")? {
        for stored in live.runs_in(experiment.experiment_id()) {
            println!(
                "   {} complete={} params={} points={}",
                stored.run.name,
                stored.run.complete,
                stored.params.len(),
                stored.metric_point_count()
            );
        }
    }

    std::fs::remove_dir_all(&staging)?;
    Ok(())
}
