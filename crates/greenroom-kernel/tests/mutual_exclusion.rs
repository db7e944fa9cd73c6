//! Mutual exclusion: at most one live ticket over any participant or
//! conversation key, under arbitrary submission interleaving.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{bare_config, settle, stage_with_act, CountingAct};
use greenroom_core::{DecisionOutcome, Intent, ParticipantId, RejectReason};

#[tokio::test(start_paused = true)]
async fn overlapping_participant_sets_conflict() {
    let act = CountingAct::new("banter", 5_000);
    let (stage, _clock, _history) = stage_with_act(bare_config(), act.clone());

    let first = stage
        .submit(Intent::manual("banter", vec!["alice".into(), "bram".into()]))
        .await;
    assert!(first.is_approved());

    // Shares "bram" with the running episode.
    let overlapping = stage
        .submit(Intent::manual("banter", vec!["bram".into(), "celia".into()]))
        .await;
    assert_eq!(
        overlapping.outcome,
        DecisionOutcome::Rejected(RejectReason::ConflictOrBusy)
    );

    // Same conversation key entirely.
    let same_key = stage
        .submit(Intent::manual("banter", vec!["bram".into(), "alice".into()]))
        .await;
    assert_eq!(
        same_key.outcome,
        DecisionOutcome::Rejected(RejectReason::ConflictOrBusy)
    );

    // Disjoint participants run concurrently.
    let disjoint = stage
        .submit(Intent::manual("banter", vec!["celia".into(), "doran".into()]))
        .await;
    assert!(disjoint.is_approved());

    // Once the first episode finishes and releases, the overlap is admitted.
    tokio::time::sleep(Duration::from_millis(6_000)).await;
    settle().await;
    let retry = stage
        .submit(Intent::manual("banter", vec!["bram".into(), "celia".into()]))
        .await;
    assert!(retry.is_approved());
}

#[tokio::test(start_paused = true)]
async fn concurrent_burst_sharing_a_participant_admits_exactly_one() {
    let act = CountingAct::new("banter", 5_000);
    let (stage, _clock, _history) = stage_with_act(bare_config(), act.clone());
    let stage = Arc::new(stage);

    let mut handles = Vec::new();
    for i in 0..12 {
        let stage = Arc::clone(&stage);
        handles.push(tokio::spawn(async move {
            let other = format!("npc-{i}");
            let participants: Vec<ParticipantId> =
                vec!["pivot".into(), other.as_str().into()];
            stage.submit(Intent::manual("banter", participants)).await
        }));
    }

    let mut approved = 0;
    for handle in handles {
        if handle.await.unwrap().is_approved() {
            approved += 1;
        }
    }
    assert_eq!(approved, 1, "pivot may be held by exactly one episode");

    settle().await;
    assert_eq!(stage.query_running().len(), 1);
    assert_eq!(act.executions(), 1);
}

#[tokio::test(start_paused = true)]
async fn release_frees_participants_for_the_next_episode() {
    let act = CountingAct::new("banter", 1_000);
    let (stage, _clock, _history) = stage_with_act(bare_config(), act.clone());

    for round in 0..3 {
        let decision = stage
            .submit(Intent::manual("banter", vec!["alice".into(), "bram".into()]))
            .await;
        assert!(decision.is_approved(), "round {round} should admit");
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        settle().await;
        assert!(stage.query_running().is_empty(), "round {round} released");
    }
    assert_eq!(act.executions(), 3);
}
