use std::time::Duration;

use anyhow::Result;
use little_raft_core::storage::RaftStorage;
use little_raft_core::State;

mod fixtures;

/// Single-voter bootstrap.
///
/// What does this test do?
///
/// - brings up a single node and bootstraps it as the sole voting member.
/// - asserts it becomes leader within one election timeout.
/// - asserts the first log entry is the CHANGE entry carrying that initial
///   configuration, at term 1, index 1.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_voter_self_election() -> Result<()> {
    let router = fixtures::new_cluster(1).await;
    let ids = fixtures::ids(1..=1);

    router.wait_for_state(&ids, State::Unavailable, Duration::from_millis(500), "pristine").await?;

    router.initialize_from_single_node(1).await?;

    let metrics = router
        .wait(1, Duration::from_secs(2))
        .await
        .state(State::Leader, "single voter becomes leader")
        .await?;

    assert_eq!(metrics.current_term, 1);
    assert_eq!(metrics.last_log_id.index, 1);
    assert_eq!(metrics.membership.voter_ids(), vec![1]);

    let storage = router.storage(1).await;
    let entries = storage.get_log_entries(1..=1).await?;
    assert_eq!(entries.len(), 1);
    match &entries[0].payload {
        little_raft_core::raft::EntryPayload::Change(conf) => {
            assert_eq!(conf.voter_ids(), vec![1]);
        }
        other => panic!("expected a Change entry, got {:?}", other),
    }

    Ok(())
}
