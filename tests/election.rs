use std::time::Duration;

use anyhow::Result;
use little_raft_core::raft::VoteRequest;
use little_raft_core::LogId;
use little_raft_core::State;

mod fixtures;

/// Leader step-down on a higher term.
///
/// What does this test do?
///
/// - elects node 1 leader of a single-voter cluster.
/// - delivers a RequestVote from a higher term directly to it.
/// - asserts it grants the vote, adopts the new term, and steps down to
///   follower.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leader_steps_down_on_higher_term() -> Result<()> {
    let router = fixtures::new_cluster(1).await;
    router.initialize_from_single_node(1).await?;
    router.wait(1, Duration::from_secs(2)).await.state(State::Leader, "node 1 becomes leader").await?;

    let raft = router.raft(1).await;
    let response = raft
        .vote(VoteRequest::new(5, 2, LogId::new(1, 1)))
        .await?;
    assert!(response.vote_granted);
    assert_eq!(response.term, 5);

    let metrics = router.wait(1, Duration::from_secs(2)).await.state(State::Follower, "steps down").await?;
    assert_eq!(metrics.current_term, 5);

    Ok(())
}

/// Prev-log rejection and back-off.
///
/// What does this test do?
///
/// - isolates a follower after it has replicated the initial entries.
/// - appends more entries on the leader while the follower is cut off, so
///   their logs diverge.
/// - restores the follower and asserts it converges on the leader's log via
///   the prev-log-mismatch back-off path rather than getting stuck.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn prev_log_rejection_converges() -> Result<()> {
    let router = fixtures::new_cluster(3).await;
    let ids = fixtures::ids(1..=3);

    router.initialize_from_single_node(1).await?;
    router.add_member(1, 2, "node-2".into()).await?;
    router.add_member(1, 3, "node-3".into()).await?;
    router.promote_member(1, 2).await?;
    router.promote_member(1, 3).await?;
    router.wait_for_log(&ids, 5, Duration::from_secs(2), "membership entries replicated").await?;

    router.isolate_node(3).await;

    for i in 0..3 {
        router.client_write(1, format!("cmd-{}", i)).await?;
    }
    router
        .wait_for_log(&fixtures::ids(1..=2), 8, Duration::from_secs(2), "leader and node 2 advance while 3 is cut off")
        .await?;

    router.restore_node(3).await;

    router
        .wait_for_log(&ids, 8, Duration::from_secs(3), "node 3 catches back up after restore")
        .await?;

    let storage = router.storage(3).await;
    let applied = storage.applied_commands().await;
    assert_eq!(applied, vec!["cmd-0", "cmd-1", "cmd-2"]);

    Ok(())
}
