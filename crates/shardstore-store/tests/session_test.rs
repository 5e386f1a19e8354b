mod common;

use std::sync::Arc;
use std::time::Duration;

use shardstore_core::{CommitsLoad, DbError, Persistence, PersistenceSession, StoreError};
use shardstore_store::SimCluster;

use common::{commit, sharded, single, DB1, DB2, SINGLE_HOST};

#[tokio::test]
async fn saved_commits_load_in_version_order() {
    let cluster = SimCluster::new();
    let session = single(&cluster).session(false);

    for v in [2, 1, 3] {
        assert!(session.save(&commit("order-1", v)).await.unwrap());
    }
    let layout = commit("order-1", 4).with_payload_layout(b"layout".to_vec());
    assert!(session.save(&layout).await.unwrap());

    let load = session.load_commits("order-1").await.unwrap();
    assert_eq!(load.last_version, 4);
    assert_eq!(
        load.commits.iter().map(|c| c.version).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(load.commits[3], layout);
    assert!(load.commits[0].payload_layout.is_none());
}

#[tokio::test]
async fn unknown_stream_loads_empty() {
    let cluster = SimCluster::new();
    let session = sharded(&cluster).session(false);
    assert_eq!(session.load_commits("never-written").await.unwrap(), CommitsLoad::EMPTY);
}

#[tokio::test]
async fn duplicate_version_is_a_version_conflict() {
    let cluster = SimCluster::new();
    let persistence = sharded(&cluster);
    let first = persistence.session(false);
    first.save(&commit("order-1", 1)).await.unwrap();

    let second = persistence.session(false);
    second.load_commits("order-1").await.unwrap();
    assert_eq!(second.connection_count(), 1);

    let err = second.save(&commit("order-1", 1)).await.unwrap_err();
    assert_eq!(
        err,
        StoreError::VersionConflict {
            stream_id: Some("order-1".into()),
            version: 1,
            detail: Some("commits_1".into()),
        }
    );
    assert!(err.is_retryable());
    // the conflict closed the whole connection cache
    assert_eq!(second.connection_count(), 0);

    assert!(second.save(&commit("order-1", 2)).await.unwrap());
}

#[tokio::test]
async fn concurrent_saves_of_one_version_conflict_once() {
    let cluster = SimCluster::new();
    let persistence = sharded(&cluster);
    let a = persistence.session(false);
    let b = persistence.session(false);

    let first = commit("stream/42", 1);
    let second = commit("stream/42", 1);
    let (ra, rb) = tokio::join!(a.save(&first), b.save(&second));
    let results = [ra, rb];
    assert_eq!(results.iter().filter(|r| matches!(r, Ok(true))).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::VersionConflict { version: 1, .. })))
            .count(),
        1
    );
    assert_eq!(cluster.rows(DB1, "es", 2).len(), 1);
}

#[tokio::test]
async fn delete_reports_exactly_one_row() {
    let cluster = SimCluster::new();
    let session = single(&cluster).session(false);

    session.save(&commit("single", 1)).await.unwrap();
    assert!(session.delete("single").await.unwrap());

    for v in 1..=3 {
        session.save(&commit("multi", v)).await.unwrap();
    }
    // every row is removed, but more than one row reports false
    assert!(!session.delete("multi").await.unwrap());
    assert_eq!(session.load_commits("multi").await.unwrap(), CommitsLoad::EMPTY);

    assert!(!session.delete("missing").await.unwrap());
}

#[tokio::test]
async fn streams_are_routed_to_their_partition_hosts() {
    let cluster = SimCluster::new();
    let session = sharded(&cluster).session(false);

    session.save(&commit("order-1", 1)).await.unwrap();
    session.save(&commit("stream/42", 1)).await.unwrap();
    session.save(&commit("customer.7f3a", 1)).await.unwrap();

    // one cached connection per host, not per partition
    assert_eq!(session.connection_count(), 2);
    assert_eq!(cluster.rows(DB1, "es", 1)[0].stream_id, "order-1");
    assert_eq!(cluster.rows(DB1, "es", 2)[0].stream_id, "stream/42");
    assert_eq!(cluster.rows(DB2, "es", 3)[0].stream_id, "customer.7f3a");
    assert!(!cluster.has_table(DB2, "es", 1));
}

#[tokio::test]
async fn unreachable_host_closes_every_cached_connection() {
    let cluster = SimCluster::new();
    let session = sharded(&cluster).session(false);
    session.save(&commit("order-1", 1)).await.unwrap();
    assert_eq!(session.connection_count(), 1);

    cluster.set_unreachable(DB2);
    let err = session.save(&commit("customer.7f3a", 1)).await.unwrap_err();
    assert!(matches!(err, StoreError::Backend(DbError::Connection(_))));
    assert_eq!(session.connection_count(), 0);
    assert_eq!(cluster.open_connections(), 0);

    cluster.set_reachable(DB2);
    session.save(&commit("customer.7f3a", 1)).await.unwrap();
    assert_eq!(session.load_commits("order-1").await.unwrap().last_version, 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_operation_poisons_the_session() {
    let cluster = SimCluster::new();
    let session = single(&cluster).session(false);
    session.save(&commit("order-1", 1)).await.unwrap();
    let closed_before = cluster.closed();

    cluster.set_latency(Some(Duration::from_millis(50)));
    let cancelled =
        tokio::time::timeout(Duration::from_millis(5), session.save(&commit("order-1", 2))).await;
    assert!(cancelled.is_err());
    cluster.set_latency(None);

    // the next operation discards the connection the cancelled save was using
    let load = session.load_commits("order-1").await.unwrap();
    assert_eq!(load.last_version, 1);
    assert_eq!(cluster.closed(), closed_before + 1);
    assert_eq!(session.connection_count(), 1);
}

#[tokio::test]
async fn unit_of_work_commits_and_rolls_back() {
    let cluster = SimCluster::new();
    let session = single(&cluster).session(false);

    session.begin().await.unwrap();
    session.save(&commit("order-1", 1)).await.unwrap();
    session.rollback().await.unwrap();
    assert!(cluster.rows(SINGLE_HOST, "es", 0).is_empty());

    session.begin().await.unwrap();
    session.save(&commit("order-1", 1)).await.unwrap();
    session.save(&commit("order-1", 2)).await.unwrap();
    session.commit().await.unwrap();
    assert_eq!(cluster.rows(SINGLE_HOST, "es", 0).len(), 2);

    let begins = cluster.commands().iter().filter(|c| c.command == "begin").count();
    assert_eq!(begins, 2);
}

#[tokio::test]
async fn suppressed_session_never_enlists() {
    let cluster = SimCluster::new();
    let session = single(&cluster).session(true);
    assert!(session.suppresses_ambient_transaction());

    session.begin().await.unwrap();
    session.save(&commit("audit-1", 1)).await.unwrap();
    session.rollback().await.unwrap();

    assert_eq!(cluster.rows(SINGLE_HOST, "es", 0).len(), 1);
    assert!(cluster.commands().iter().all(|c| c.command != "begin"));
}

#[tokio::test]
async fn closed_session_rejects_operations() {
    let cluster = SimCluster::new();
    let persistence: Arc<dyn Persistence> = Arc::new(single(&cluster));
    let session = persistence.open_session(false);
    session.save(&commit("order-1", 1)).await.unwrap();

    session.close().await;
    session.close().await;
    assert!(session.is_closed());
    assert_eq!(cluster.open_connections(), 0);

    assert_eq!(session.load_commits("order-1").await, Err(StoreError::SessionClosed));
    assert_eq!(session.save(&commit("order-1", 2)).await, Err(StoreError::SessionClosed));
    assert_eq!(session.delete("order-1").await, Err(StoreError::SessionClosed));
}
