use gliderqc_core::{Dataset, DatasetId, DatasetStatus, RawProfile};
use gliderqc_state::fs::sidecar_path;
use gliderqc_state::{
    ArchivalError, Archiver, DataLevel, DataMode, DatasetState, DatasetStore, DeploymentLayout,
    FsArchiver, FsDatasetStore,
};

struct Fixture {
    _root: tempfile::TempDir,
    layout: DeploymentLayout,
    queue: FsDatasetStore,
    archive: FsDatasetStore,
    archiver: FsArchiver,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let layout =
        DeploymentLayout::new(root.path(), "ru30-20210503T1929", DataMode::Rt, DataLevel::Sci)
            .unwrap();
    let queue = FsDatasetStore::new(layout.queue_dir()).unwrap();
    let archive = FsDatasetStore::new(layout.data_dir()).unwrap();
    let archiver = FsArchiver::new(layout.queue_dir(), layout.data_dir());
    Fixture {
        _root: root,
        layout,
        queue,
        archive,
        archiver,
    }
}

fn dataset() -> Dataset {
    Dataset::new("ru30-20210503T1929", vec![RawProfile::new("p1", vec![])])
}

fn completed(store: &FsDatasetStore, name: &str) -> DatasetId {
    let id = DatasetId::new(name);
    store.save(&id, &dataset()).unwrap();
    let mut state = DatasetState::incoming();
    state.begin_attempt("cfg").unwrap();
    state.complete("summary".to_string()).unwrap();
    store.save_state(&id, &state).unwrap();
    id
}

#[tokio::test]
async fn relocate_moves_dataset_and_sidecar() {
    let f = fixture();
    let id = completed(&f.queue, "ru30_0001");

    f.archiver.relocate(&id).await.unwrap();

    assert!(f.queue.list().unwrap().is_empty());
    assert!(!sidecar_path(&f.layout.queue_dir(), &id).exists());
    assert_eq!(f.archive.list().unwrap(), vec![id.clone()]);
    assert_eq!(f.archive.load(&id).unwrap(), dataset());

    let state = f.archive.state(&id).unwrap();
    assert_eq!(state.status, DatasetStatus::QcComplete);
    assert!(state.is_archived());
}

#[tokio::test]
async fn relocate_leaves_only_dataset_and_sidecar_behind() {
    let f = fixture();
    let id = completed(&f.queue, "ru30_0001");

    f.archiver.relocate(&id).await.unwrap();

    let mut names: Vec<String> = std::fs::read_dir(f.layout.data_dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["queue", "ru30_0001.json", "ru30_0001.qcstate.json"]);
    assert!(std::fs::read_dir(f.layout.queue_dir()).unwrap().next().is_none());
}

#[tokio::test]
async fn relocate_twice_succeeds() {
    let f = fixture();
    let id = completed(&f.queue, "ru30_0001");

    f.archiver.relocate(&id).await.unwrap();
    f.archiver.relocate(&id).await.unwrap();
    assert_eq!(f.archive.list().unwrap(), vec![id]);
}

#[tokio::test]
async fn relocate_leaves_failed_dataset_in_queue() {
    let f = fixture();
    let id = DatasetId::new("ru30_0002");
    f.queue.save(&id, &dataset()).unwrap();
    let mut state = DatasetState::incoming();
    state.begin_attempt("cfg").unwrap();
    state.fail("bad profile").unwrap();
    f.queue.save_state(&id, &state).unwrap();

    let err = f.archiver.relocate(&id).await.unwrap_err();
    assert!(matches!(
        err,
        ArchivalError::NotComplete {
            status: DatasetStatus::QcFailed,
            ..
        }
    ));
    assert_eq!(f.queue.list().unwrap(), vec![id]);
}

#[tokio::test]
async fn relocate_unknown_dataset_fails() {
    let f = fixture();
    let err = f.archiver.relocate(&DatasetId::new("ghost")).await.unwrap_err();
    assert!(matches!(err, ArchivalError::NotFound(_)));
}
