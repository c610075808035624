//! Staging store tests: directory layout, completeness and read-back.

use std::collections::BTreeMap;
use std::fs;

use trueno_migrate::experiment::{MetricFilter, MetricPoint, RunDescriptor, RunStatus};
use trueno_migrate::staging::{
    check_run_dir, StagingStore, METRICS_DIR, PARAMS_FILE, SYSTEM_METRICS_DIR, TAGS_FILE,
};
use trueno_migrate::{Error, Result};

fn descriptor(run_id: &str) -> RunDescriptor {
    RunDescriptor::builder()
        .run_id(run_id)
        .name(format!("{run_id}, \"quoted\""))
        .group(Some("sweep".to_string()))
        .param("lr", 0.001)
        .param("layers", 4_i64)
        .param("note", "multi\nline")
        .metric(
            "train/loss",
            [MetricPoint::new(0, 2.5, 1_000), MetricPoint::new(10, 1.25, 2_000)],
        )
        .metric("acc", [MetricPoint::new(0, 1.0 / 3.0, 1_000)])
        .system_metrics([(
            "system/cpu_utilization_percentage".to_string(),
            vec![MetricPoint::new(0, 40.0, 0), MetricPoint::new(1, 42.0, 1)],
        )])
        .tag("owner", "ml,team")
        .status(RunStatus::Finished)
        .build(&MetricFilter::none())
        .unwrap()
}

fn read_all(store: &StagingStore, project: &str) -> Vec<RunDescriptor> {
    store
        .read(project, &MetricFilter::none())
        .unwrap()
        .collect::<Result<_>>()
        .unwrap()
}

// =============================================================================
// Layout
// =============================================================================

#[test]
fn test_store_requires_existing_root() {
    let tmp = tempfile::tempdir().unwrap();
    assert!(matches!(
        StagingStore::open(tmp.path().join("missing")),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_run_directory_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StagingStore::open(tmp.path()).unwrap();
    let dir = store.write("demo", &descriptor("r1")).unwrap();

    assert_eq!(dir, tmp.path().join("demo").join("r1"));
    assert!(dir.join(PARAMS_FILE).is_file());
    assert!(dir.join(TAGS_FILE).is_file());
    assert!(dir.join(METRICS_DIR).join("train").join("loss").is_file());
    assert!(dir.join(METRICS_DIR).join("acc").is_file());
    assert!(dir
        .join(SYSTEM_METRICS_DIR)
        .join("system")
        .join("cpu_utilization_percentage")
        .is_file());

    let loss = fs::read_to_string(dir.join(METRICS_DIR).join("train").join("loss")).unwrap();
    assert_eq!(loss, "0,2.5,1000\n10,1.25,2000\n");

    let params: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.join(PARAMS_FILE)).unwrap()).unwrap();
    assert_eq!(params["layers"], 4);
    assert_eq!(params["note"], "multi\nline");
}

#[test]
fn test_project_tags() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StagingStore::open(tmp.path()).unwrap();
    assert!(store.project_tags("demo").unwrap().is_empty());

    let tags = BTreeMap::from([("source_project_name".to_string(), "demo".to_string())]);
    store.init_project("demo", &tags).unwrap();
    assert!(store.has_project("demo"));
    assert_eq!(store.project_tags("demo").unwrap(), tags);
}

#[test]
fn test_unusable_names_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StagingStore::open(tmp.path()).unwrap();

    let traversal = RunDescriptor::builder()
        .run_id("../escape")
        .name("bad")
        .build(&MetricFilter::none())
        .unwrap();
    assert!(matches!(
        store.write("demo", &traversal),
        Err(Error::MalformedRun(_))
    ));

    let colliding = RunDescriptor::builder()
        .run_id("r1")
        .name("bad")
        .metric("a", [MetricPoint::new(0, 1.0, 0)])
        .metric("a/b", [MetricPoint::new(0, 1.0, 0)])
        .build(&MetricFilter::none())
        .unwrap();
    assert!(matches!(
        store.write("demo", &colliding),
        Err(Error::MalformedRun(_))
    ));
    assert!(!store.project_dir("demo").join("r1").exists());
}

// =============================================================================
// Completeness
// =============================================================================

#[test]
fn test_missing_entry_marks_run_incomplete() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StagingStore::open(tmp.path()).unwrap();

    for entry in [PARAMS_FILE, TAGS_FILE, METRICS_DIR, SYSTEM_METRICS_DIR] {
        let dir = store.write("demo", &descriptor("r1")).unwrap();
        assert!(check_run_dir(&dir).is_ok());

        let path = dir.join(entry);
        if path.is_dir() {
            fs::remove_dir_all(&path).unwrap();
        } else {
            fs::remove_file(&path).unwrap();
        }
        let err = check_run_dir(&dir).unwrap_err();
        assert!(err.to_string().contains(entry), "{err}");
        assert!(store.exported_run_ids("demo").unwrap().is_empty());
        assert_eq!(store.incomplete_run_ids("demo").unwrap(), vec!["r1"]);
    }
}

#[test]
fn test_prune_incomplete() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StagingStore::open(tmp.path()).unwrap();
    store.write("demo", &descriptor("r1")).unwrap();
    fs::create_dir_all(store.project_dir("demo").join("r2").join(METRICS_DIR)).unwrap();

    assert_eq!(store.prune_incomplete("demo").unwrap(), 1);
    assert_eq!(store.exported_run_ids("demo").unwrap(), vec!["r1"]);
    assert!(store.incomplete_run_ids("demo").unwrap().is_empty());
}

#[test]
fn test_rewrite_replaces_previous_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StagingStore::open(tmp.path()).unwrap();
    let dir = store.write("demo", &descriptor("r1")).unwrap();
    fs::write(dir.join(METRICS_DIR).join("stale"), "0,1,0\n").unwrap();

    store.write("demo", &descriptor("r1")).unwrap();
    assert!(!dir.join(METRICS_DIR).join("stale").exists());
}

// =============================================================================
// Read-back
// =============================================================================

#[test]
fn test_staged_runs_read_back_equal() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StagingStore::open(tmp.path()).unwrap();
    let runs = vec![descriptor("r1"), descriptor("r2")];
    for run in &runs {
        store.write("demo", run).unwrap();
    }
    assert_eq!(read_all(&store, "demo"), runs);
}

#[test]
fn test_staged_runs_are_lazy() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StagingStore::open(tmp.path()).unwrap();
    for run_id in ["r1", "r2", "r3"] {
        store.write("demo", &descriptor(run_id)).unwrap();
    }

    let filter = MetricFilter::none();
    let mut staged = store.read("demo", &filter).unwrap();
    assert_eq!(staged.remaining(), 3);
    assert_eq!(staged.next().unwrap().unwrap().run_id(), "r1");

    // A directory removed after listing is skipped, not an error.
    store.remove("demo", "r2").unwrap();
    assert_eq!(staged.next().unwrap().unwrap().run_id(), "r3");
    assert!(staged.next().is_none());
}

#[test]
fn test_corrupt_params_is_run_level() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StagingStore::open(tmp.path()).unwrap();
    let dir = store.write("demo", &descriptor("r1")).unwrap();
    store.write("demo", &descriptor("r2")).unwrap();
    fs::write(dir.join(PARAMS_FILE), "{not json").unwrap();

    let items: Vec<_> = store.read("demo", &MetricFilter::none()).unwrap().collect();
    assert_eq!(items.len(), 2);
    let err = items[0].as_ref().unwrap_err();
    assert!(matches!(err, Error::StagingCorruption { .. }));
    assert!(err.is_run_level());
    assert_eq!(items[1].as_ref().unwrap().run_id(), "r2");
}

#[test]
fn test_unfinished_tags_file_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StagingStore::open(tmp.path()).unwrap();
    let dir = store.write("demo", &descriptor("r1")).unwrap();
    fs::write(dir.join(TAGS_FILE), "source_run_name,r1\n").unwrap();

    let result = store.read_run("demo", "r1", &MetricFilter::none(), None);
    assert!(matches!(result, Err(Error::StagingCorruption { .. })));
}
