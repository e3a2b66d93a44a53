use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use folio_core::models::{CoreErrorKind, SessionId, TaskId};
use folio_core::orchestration::{JobBroker, JobEnvelope};
use folio_core::sqlite::{SqliteJobBroker, SqliteStore};

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("folio-{test_name}-{nanos}.sqlite3"))
}

fn migrated_broker(test_name: &str) -> SqliteJobBroker {
    let store = SqliteStore::new(test_db_path(test_name));
    store.migrate_to_latest().expect("migrations should apply");
    SqliteJobBroker::from_store(store)
}

fn process_job() -> JobEnvelope {
    JobEnvelope::Process {
        task_id: TaskId::generate(),
        session_id: SessionId::generate(),
    }
}

#[test]
fn jobs_are_delivered_in_publish_order() {
    let broker = migrated_broker("broker-order");
    let first = process_job();
    let second = process_job();
    broker.publish(&first).expect("publish first");
    thread::sleep(Duration::from_millis(2));
    broker.publish(&second).expect("publish second");

    let claimed = broker
        .claim("w1", Duration::from_secs(30))
        .expect("claim")
        .expect("job");
    assert_eq!(claimed.envelope, first);
    assert_eq!(claimed.attempts, 1);

    assert!(broker.ack(&claimed).expect("ack"));
    assert_eq!(broker.pending_jobs().expect("pending"), 1);
}

#[test]
fn leased_jobs_are_invisible_until_the_lease_expires() {
    let broker = migrated_broker("broker-lease");
    broker.publish(&process_job()).expect("publish");

    let claimed = broker
        .claim("w1", Duration::from_millis(100))
        .expect("claim")
        .expect("job");
    assert!(broker.claim("w2", Duration::from_secs(30)).expect("claim").is_none());

    thread::sleep(Duration::from_millis(200));
    let reclaimed = broker
        .claim("w2", Duration::from_secs(30))
        .expect("claim")
        .expect("expired lease");
    assert_eq!(reclaimed.handle, claimed.handle);
    assert_eq!(reclaimed.attempts, 2);
}

#[test]
fn an_expired_lease_holder_cannot_settle_the_job() {
    let broker = migrated_broker("broker-stale-settle");
    broker.publish(&process_job()).expect("publish");
    let stale = broker
        .claim("w1", Duration::from_millis(100))
        .expect("claim")
        .expect("job");
    thread::sleep(Duration::from_millis(200));
    let current = broker
        .claim("w2", Duration::from_secs(30))
        .expect("claim")
        .expect("expired lease");

    assert!(!broker.ack(&stale).expect("stale ack"));
    assert!(!broker.release(&stale, Duration::ZERO).expect("stale release"));
    assert_eq!(broker.pending_jobs().expect("pending"), 1);
    assert!(broker.claim("w3", Duration::from_secs(30)).expect("claim").is_none());

    assert!(broker.ack(&current).expect("current ack"));
    assert_eq!(broker.pending_jobs().expect("pending"), 0);
}

#[test]
fn a_worker_reclaiming_its_own_job_settles_only_the_latest_delivery() {
    let broker = migrated_broker("broker-same-worker");
    broker.publish(&process_job()).expect("publish");
    let first = broker
        .claim("w1", Duration::from_millis(100))
        .expect("claim")
        .expect("job");
    thread::sleep(Duration::from_millis(200));
    let second = broker
        .claim("w1", Duration::from_secs(30))
        .expect("claim")
        .expect("expired lease");

    assert!(!broker.ack(&first).expect("first delivery ack"));
    assert!(broker.ack(&second).expect("second delivery ack"));
}

#[test]
fn a_second_broker_on_the_same_file_sees_the_queue() {
    let path = test_db_path("broker-shared");
    let store = SqliteStore::new(&path);
    store.migrate_to_latest().expect("migrations should apply");
    let producer = SqliteJobBroker::from_store(store);
    let consumer = SqliteJobBroker::new(&path);

    let envelope = process_job();
    producer.publish(&envelope).expect("publish");
    let claimed = consumer
        .claim("remote", Duration::from_secs(30))
        .expect("claim")
        .expect("job");
    assert_eq!(claimed.envelope, envelope);
}

#[test]
fn released_jobs_wait_out_their_delay() {
    let broker = migrated_broker("broker-release");
    broker.publish(&process_job()).expect("publish");
    let claimed = broker
        .claim("w1", Duration::from_secs(30))
        .expect("claim")
        .expect("job");

    assert!(
        broker
            .release(&claimed, Duration::from_millis(150))
            .expect("release")
    );
    assert!(broker.claim("w1", Duration::from_secs(30)).expect("claim").is_none());

    thread::sleep(Duration::from_millis(250));
    let again = broker
        .claim("w1", Duration::from_secs(30))
        .expect("claim")
        .expect("job after delay");
    assert_eq!(again.attempts, 2);
}

#[test]
fn revoke_only_removes_unclaimed_jobs() {
    let broker = migrated_broker("broker-revoke");
    let pending = broker.publish(&process_job()).expect("publish pending");
    assert!(broker.revoke(&pending).expect("revoke pending"));
    assert!(!broker.revoke(&pending).expect("revoke twice"));

    broker.publish(&process_job()).expect("publish claimed");
    let claimed = broker
        .claim("w1", Duration::from_secs(30))
        .expect("claim")
        .expect("job");
    assert!(!broker.revoke(&claimed.handle).expect("revoke claimed"));
    assert_eq!(broker.pending_jobs().expect("pending"), 1);
}

#[test]
fn pings_are_answered_once() {
    let broker = migrated_broker("broker-ping");
    assert!(!broker.consume_ping("nonce-1").expect("unanswered"));
    broker.record_ping("nonce-1").expect("record");
    assert!(broker.consume_ping("nonce-1").expect("answered"));
    assert!(!broker.consume_ping("nonce-1").expect("consumed"));
}

#[test]
fn unmigrated_database_reports_the_broker_unavailable() {
    let broker = SqliteJobBroker::new(test_db_path("broker-unmigrated"));
    let error = broker
        .publish(&process_job())
        .expect_err("schema missing");
    assert_eq!(error.kind, CoreErrorKind::BrokerUnavailable);
}
