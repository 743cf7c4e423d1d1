use std::time::Duration;

use anyhow::Result;
use little_raft_core::State;

mod fixtures;

/// Add-then-promote catch-up.
///
/// What does this test do?
///
/// - elects a single-voter leader.
/// - adds a new, non-voting member and asserts the CHANGE entry commits
///   with `voting=false`.
/// - promotes it and asserts a second CHANGE entry commits once it has
///   caught up, with `voting=true`.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn add_then_promote_catch_up() -> Result<()> {
    let router = fixtures::new_cluster(2).await;
    router.initialize_from_single_node(1).await?;
    router.wait(1, Duration::from_secs(2)).await.state(State::Leader, "node 1 becomes leader").await?;

    router.add_member(1, 2, "node-2".into()).await?;

    let metrics = router
        .wait(1, Duration::from_secs(2))
        .await
        .log(2, "add entry committed")
        .await?;
    let server = metrics.membership.get(2).expect("node 2 present in configuration");
    assert!(!server.voting, "newly added member starts non-voting");

    router.promote_member(1, 2).await?;

    let metrics = router
        .wait(1, Duration::from_secs(2))
        .await
        .log(3, "promote entry committed")
        .await?;
    let server = metrics.membership.get(2).expect("node 2 still present");
    assert!(server.voting, "promoted member becomes voting");
    assert_eq!(metrics.membership.voter_ids(), vec![1, 2]);

    Ok(())
}

/// Remove drops a member's replication stream once the removal entry is
/// applied, and the majority needed for commit shrinks accordingly.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn remove_member_shrinks_quorum() -> Result<()> {
    let router = fixtures::new_cluster(2).await;
    router.initialize_from_single_node(1).await?;
    router.add_member(1, 2, "node-2".into()).await?;
    router.promote_member(1, 2).await?;
    router
        .wait_for_log(&fixtures::ids(1..=2), 3, Duration::from_secs(2), "node 2 promoted")
        .await?;

    router.remove_member(1, 2).await?;
    let metrics = router.wait(1, Duration::from_secs(2)).await.log(4, "remove entry committed").await?;
    assert!(metrics.membership.get(2).is_none());
    assert_eq!(metrics.membership.voter_ids(), vec![1]);

    // With node 2 gone, the leader alone forms a quorum again.
    let result = router.client_write(1, "after-remove".to_string()).await?;
    assert_eq!(result, 1);

    Ok(())
}
