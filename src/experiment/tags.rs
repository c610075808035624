//! Bookkeeping tag names written by the migration engine.

/// Source run id on a destination run; the reconciliation key.
pub const SOURCE_RUN_ID_TAG: &str = "source_run_id";
/// Source display name on a destination run.
pub const SOURCE_RUN_NAME_TAG: &str = "source_run_name";
/// Source run status (`running`, `finished`, `crashed`, `killed`).
pub const SOURCE_STATUS_TAG: &str = "source_run_status";
/// Source grouping key when groups are not represented as nested runs.
pub const RUN_GROUP_TAG: &str = "run_group";
/// Marks a run that is also written to the destination by another process.
pub const DUAL_WRITING_TAG: &str = "dual_writing";
/// Marks a parent run standing in for a source group.
pub const GROUP_PARENT_TAG: &str = "run_group_parent";
/// Written last into a staged run's `tags.csv`.
pub const MIGRATION_COMPLETE_TAG: &str = "migration_complete";

/// Experiment created or adopted by a migration.
pub const MIGRATED_FROM_PROJECT_TAG: &str = "migrate_from_project";
/// Source project an experiment was migrated from.
pub const SOURCE_PROJECT_NAME_TAG: &str = "source_project_name";
/// Experiment shared with a dual-writing process.
pub const DUAL_WRITE_EXPERIMENT_TAG: &str = "dual_write";

/// Tags the engine owns on a staged run; stripped back out on read.
pub const RUN_BOOKKEEPING_TAGS: [&str; 6] = [
    SOURCE_RUN_ID_TAG,
    SOURCE_RUN_NAME_TAG,
    SOURCE_STATUS_TAG,
    RUN_GROUP_TAG,
    DUAL_WRITING_TAG,
    MIGRATION_COMPLETE_TAG,
];

/// Canonical spelling of a true tag value.
pub const TRUE_VALUE: &str = "True";
