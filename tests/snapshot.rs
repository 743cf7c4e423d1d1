use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use little_raft_core::storage::RaftStorage;
use little_raft_core::Config;

mod fixtures;

/// Snapshot fallback for a lagging peer.
///
/// What does this test do?
///
/// - builds a three-node cluster with a low snapshot threshold and no
///   trailing entries, so compaction discards the whole committed prefix.
/// - isolates a follower, then drives enough client writes past the leader
///   to force a self-initiated snapshot that prunes the follower's last
///   known entries out of the log.
/// - restores the follower and asserts it converges by receiving an
///   InstallSnapshot transfer rather than getting stuck waiting for entries
///   the leader no longer has.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_falls_back_to_snapshot() -> Result<()> {
    let config = Arc::new(
        Config::build()
            .heartbeat_interval(20)
            .snapshot_policy_threshold(3)
            .snapshot_trailing_entries(0)
            .validate()
            .expect("config is valid"),
    );
    let router = fixtures::new_cluster_with_config(3, config).await;
    let ids = fixtures::ids(1..=3);

    router.initialize_from_single_node(1).await?;
    router.add_member(1, 2, "node-2".into()).await?;
    router.add_member(1, 3, "node-3".into()).await?;
    router.promote_member(1, 2).await?;
    router.promote_member(1, 3).await?;
    router.wait_for_log(&ids, 5, Duration::from_secs(2), "membership entries replicated").await?;

    router.isolate_node(3).await;

    for i in 0..10 {
        router.client_write(1, format!("cmd-{}", i)).await?;
    }
    router
        .wait_for_log(&fixtures::ids(1..=2), 15, Duration::from_secs(2), "leader and node 2 advance without node 3")
        .await?;

    // Give the leader's background compaction time to run and prune the log
    // prefix node 3 would otherwise need replayed to it.
    let leader_storage = router.storage(1).await;
    for _ in 0..50 {
        if leader_storage.get_current_snapshot().await?.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(leader_storage.get_current_snapshot().await?.is_some(), "leader should have compacted its log");

    router.restore_node(3).await;

    router
        .wait_for_log(&ids, 15, Duration::from_secs(3), "node 3 catches up via a snapshot transfer")
        .await?;

    let storage = router.storage(3).await;
    assert!(storage.get_current_snapshot().await?.is_some(), "node 3 received the installed snapshot");

    Ok(())
}
