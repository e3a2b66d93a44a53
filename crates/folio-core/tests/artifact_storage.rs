use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use folio_core::artifacts::{ArtifactStorage, CleanupStats};
use folio_core::models::{ArtifactRole, CoreErrorKind, SessionId, TaskId};

fn test_root(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("folio-{test_name}-{nanos}"))
}

fn storage(test_name: &str) -> ArtifactStorage {
    let storage = ArtifactStorage::new(test_root(test_name));
    storage.ensure_layout().expect("layout");
    storage
}

#[test]
fn stored_files_are_keyed_by_session_and_task() {
    let storage = storage("artifacts-layout");
    let session = SessionId::generate();
    let task = TaskId::generate();

    let stored = storage
        .store(&session, &task, ArtifactRole::Input, "../scan 1.pdf", b"%PDF")
        .expect("store upload");

    assert_eq!(stored.reference.filename, "scan_1.pdf");
    assert_eq!(stored.reference.size_bytes, 4);
    assert_eq!(
        stored.path,
        storage
            .root()
            .join("uploads")
            .join(session.as_str())
            .join(format!("{task}_scan_1.pdf"))
    );
    assert_eq!(
        storage
            .read(&session, &task, ArtifactRole::Input, "scan_1.pdf")
            .expect("read back"),
        b"%PDF"
    );

    let _ = std::fs::remove_dir_all(storage.root());
}

#[test]
fn other_sessions_cannot_reach_an_artifact() {
    let storage = storage("artifacts-access");
    let owner = SessionId::generate();
    let task = TaskId::generate();
    storage
        .store(&owner, &task, ArtifactRole::Output, "result.txt", b"done")
        .expect("store output");

    assert!(storage.verify_access(&owner, &task, ArtifactRole::Output, "result.txt"));
    assert!(!storage.verify_access(
        &SessionId::generate(),
        &task,
        ArtifactRole::Output,
        "result.txt"
    ));
    assert!(!storage.verify_access(
        &owner,
        &TaskId::generate(),
        ArtifactRole::Output,
        "result.txt"
    ));

    let error = storage
        .read(&SessionId::generate(), &task, ArtifactRole::Output, "result.txt")
        .expect_err("foreign read");
    assert_eq!(error.kind, CoreErrorKind::NotFound);

    let _ = std::fs::remove_dir_all(storage.root());
}

#[test]
fn temp_files_are_never_servable() {
    let storage = storage("artifacts-temp");
    let session = SessionId::generate();
    let task = TaskId::generate();
    storage
        .store(&session, &task, ArtifactRole::Temp, "page-1.png", b"png")
        .expect("store temp");

    assert!(
        storage
            .resolve(&session, &task, ArtifactRole::Temp, "page-1.png")
            .is_some()
    );
    assert!(!storage.verify_access(&session, &task, ArtifactRole::Temp, "page-1.png"));

    let _ = std::fs::remove_dir_all(storage.root());
}

#[test]
fn task_cleanup_removes_only_that_task_and_is_repeatable() {
    let storage = storage("artifacts-task-cleanup");
    let session = SessionId::generate();
    let doomed = TaskId::generate();
    let kept = TaskId::generate();

    storage
        .store(&session, &doomed, ArtifactRole::Input, "in.pdf", b"12345")
        .expect("store input");
    storage
        .store(&session, &doomed, ArtifactRole::Output, "out.txt", b"123")
        .expect("store output");
    storage.work_dir(&doomed).expect("work dir");
    storage
        .store(&session, &kept, ArtifactRole::Input, "in.pdf", b"keep")
        .expect("store other input");

    let first = storage.cleanup_task(&session, &doomed);
    assert_eq!(first.files_removed, 2);
    assert_eq!(first.bytes_removed, 8);
    assert_eq!(first.errors, 0);

    let second = storage.cleanup_task(&session, &doomed);
    assert_eq!(second.files_removed, 0);
    assert_eq!(second.errors, 0);

    assert!(storage.verify_access(&session, &kept, ArtifactRole::Input, "in.pdf"));
    assert!(!storage.verify_access(&session, &doomed, ArtifactRole::Input, "in.pdf"));

    let _ = std::fs::remove_dir_all(storage.root());
}

#[test]
fn age_cleanup_respects_the_threshold() {
    let storage = storage("artifacts-age");
    let session = SessionId::generate();
    let task = TaskId::generate();
    storage
        .store(&session, &task, ArtifactRole::Input, "in.pdf", b"input")
        .expect("store input");
    storage
        .store(&session, &task, ArtifactRole::Output, "out.txt", b"output")
        .expect("store output");

    let untouched = storage.cleanup_older_than(Duration::from_secs(3600));
    assert_eq!(untouched.total().files_removed, 0);

    let swept = storage.cleanup_older_than(Duration::ZERO);
    assert_eq!(swept.total().files_removed, 2);
    assert_eq!(swept.total().errors, 0);
    assert!(!storage.root().join("uploads").join(session.as_str()).exists());
    assert!(storage.root().join("uploads").is_dir());

    let repeated = storage.cleanup_older_than(Duration::ZERO);
    assert_eq!(repeated.total(), CleanupStats::default());

    let usage = storage.usage();
    assert!(usage.iter().all(|role| role.files == 0 && role.bytes == 0));

    let _ = std::fs::remove_dir_all(storage.root());
}

#[test]
fn usage_counts_files_per_role() {
    let storage = storage("artifacts-usage");
    let session = SessionId::generate();
    let task = TaskId::generate();
    storage
        .store(&session, &task, ArtifactRole::Input, "a.pdf", b"aaaa")
        .expect("store a");
    storage
        .store(&session, &task, ArtifactRole::Input, "b.pdf", b"bb")
        .expect("store b");

    let uploads = storage
        .usage()
        .into_iter()
        .find(|usage| usage.role == ArtifactRole::Input)
        .expect("input usage");
    assert_eq!(uploads.files, 2);
    assert_eq!(uploads.bytes, 6);

    let _ = std::fs::remove_dir_all(storage.root());
}

#[test]
fn age_cleanup_keeps_fresh_empty_directories() {
    let storage = storage("artifacts-fresh-dirs");
    let session = SessionId::generate();
    let task = TaskId::generate();
    let work_dir = storage.work_dir(&task).expect("work dir");
    let upload_dir = storage.root().join("uploads").join(session.as_str());
    std::fs::create_dir_all(&upload_dir).expect("session upload dir");

    let report = storage.cleanup_older_than(Duration::from_secs(24 * 3600));
    assert_eq!(report.total().directories_removed, 0);
    assert!(work_dir.is_dir());
    assert!(upload_dir.is_dir());

    std::fs::write(work_dir.join("scratch.bin"), b"page").expect("scratch write");
    storage
        .store(&session, &task, ArtifactRole::Input, "late.pdf", b"%PDF")
        .expect("store into surviving dir");

    let _ = std::fs::remove_dir_all(storage.root());
}
