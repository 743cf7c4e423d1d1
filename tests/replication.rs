use std::time::Duration;

use anyhow::Result;
use little_raft_core::State;

mod fixtures;

/// Three-voter client write replication.
///
/// What does this test do?
///
/// - brings up a three-node cluster, all voting, and lets node 1 win the
///   initial election.
/// - issues a single client write on the leader.
/// - asserts every node's log and state machine converge on that entry, and
///   that the leader's client call resolves with the state machine's result.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_voter_replication() -> Result<()> {
    let router = fixtures::new_cluster(3).await;
    let ids = fixtures::ids(1..=3);

    router.initialize_from_single_node(1).await?;
    router.add_member(1, 2, "node-2".into()).await?;
    router.add_member(1, 3, "node-3".into()).await?;
    router.promote_member(1, 2).await?;
    router.promote_member(1, 3).await?;

    router
        .wait_for_log(&ids, 5, Duration::from_secs(2), "all nodes see add+promote entries")
        .await?;
    router
        .wait(1, Duration::from_secs(2))
        .await
        .state(State::Leader, "node 1 remains leader")
        .await?;

    let result = router.client_write(1, "x".to_string()).await?;
    assert_eq!(result, 1);

    router
        .wait_for_log(&ids, 6, Duration::from_secs(2), "all nodes replicate the write")
        .await?;

    for id in 1..=3u64 {
        let storage = router.storage(id).await;
        let applied = storage.applied_commands().await;
        assert_eq!(applied, vec!["x".to_string()], "node {} applied the write", id);
    }

    let metrics = router.wait(1, Duration::from_secs(2)).await.log(6, "leader committed").await?;
    assert_eq!(metrics.commit_index, 6);

    Ok(())
}
