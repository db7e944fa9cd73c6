//! Episode lifecycle: hard deadline, heartbeat renewal, result recording,
//! and the diagnostics surface, exercised through the full stage.

mod common;

use std::time::Duration;

use common::{bare_config, settle, stage_with_act, CountingAct, StuckAct};
use greenroom_core::{EpisodeReason, Intent, ParticipantId};

fn pair() -> Vec<ParticipantId> {
    vec!["alice".into(), "bram".into()]
}

#[tokio::test(start_paused = true)]
async fn stuck_act_times_out_at_the_deadline() {
    let config = bare_config()
        .with_episode_deadline_ms(8_000)
        .with_reservation_ttl_ms(15_000)
        .with_heartbeat_interval_ms(5_000);
    let (stage, _clock, history) = stage_with_act(config, StuckAct::new("banter"));

    let decision = stage.submit(Intent::manual("banter", pair())).await;
    assert!(decision.is_approved());

    // Just before the deadline the episode is still running.
    tokio::time::sleep(Duration::from_millis(7_900)).await;
    assert_eq!(stage.query_running().len(), 1);

    // Just after it, the ticket is gone and a timeout result is recorded.
    tokio::time::sleep(Duration::from_millis(200)).await;
    settle().await;
    assert!(stage.query_running().is_empty());
    assert_eq!(stage.kernel_stats().active_tickets, 0);

    let recent = history.recent(1);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].result.reason, EpisodeReason::Timeout);
    assert!(!recent[0].result.completed);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_a_slow_episode_leased() {
    let mut config = bare_config()
        .with_episode_deadline_ms(60_000)
        .with_reservation_ttl_ms(15_000)
        .with_heartbeat_interval_ms(5_000);
    config.sweep_every_steps = 1;
    let act = CountingAct::new("banter", 18_000);
    let (stage, clock, history) = stage_with_act(config, act.clone());

    let decision = stage.submit(Intent::manual("banter", pair())).await;
    assert!(decision.is_approved());
    settle().await;
    assert_eq!(stage.query_running().len(), 1);

    // Advance the world clock ahead of each heartbeat tick. Without
    // renewals the lease would lapse at 15s on this clock.
    for round in 1..=3u64 {
        clock.set(round * 5_000 + 1_000);
        tokio::time::sleep(Duration::from_millis(5_050)).await;
    }

    // Run the scheduled lease sweep at world time 16s: the renewed lease
    // must survive it.
    stage.process_frame(1);
    stage.process_frame(2);
    assert_eq!(stage.query_running().len(), 1, "renewed lease survives sweep");

    let running = &stage.query_running()[0];
    assert!(
        running.lease_expires_at_ms > 15_000,
        "lease extended past its original expiry"
    );

    // Let the act finish; everything is released.
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    settle().await;
    assert!(stage.query_running().is_empty());
    assert_eq!(history.recent(1)[0].result.reason, EpisodeReason::Completed);
}

#[tokio::test(start_paused = true)]
async fn unknown_episode_records_act_not_found() {
    let (stage, _clock, history) = stage_with_act(bare_config(), CountingAct::new("banter", 0));

    // Admission does not resolve the act; the background path does.
    let decision = stage.submit(Intent::manual("duel", pair())).await;
    assert!(decision.is_approved());

    settle().await;
    assert!(stage.query_running().is_empty());
    let recent = history.recent(1);
    assert_eq!(recent[0].result.reason, EpisodeReason::ActNotFound);
    assert_eq!(recent[0].episode, "duel");
}

#[tokio::test(start_paused = true)]
async fn cooldown_arms_after_failure_too() {
    let config = bare_config()
        .with_cooldown_ms(30_000)
        .with_episode_deadline_ms(1_000)
        .with_reservation_ttl_ms(15_000)
        .with_heartbeat_interval_ms(5_000);
    let (stage, _clock, _history) = stage_with_act(config, StuckAct::new("banter"));

    assert!(stage.submit(Intent::manual("banter", pair())).await.is_approved());
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    settle().await;

    // The timeout still armed the cooldown for automatic traffic.
    let auto = stage.submit(Intent::automatic("banter", pair())).await;
    assert_eq!(
        auto.outcome,
        greenroom_core::DecisionOutcome::Rejected(greenroom_core::RejectReason::Cooling)
    );
}

#[tokio::test(start_paused = true)]
async fn diagnostics_report_and_force_release() {
    let act = CountingAct::new("banter", 60_000);
    let config = bare_config()
        .with_episode_deadline_ms(120_000)
        .with_reservation_ttl_ms(15_000)
        .with_heartbeat_interval_ms(5_000);
    let (stage, _clock, _history) = stage_with_act(config, act.clone());

    assert_eq!(stage.list_acts(), vec!["banter"]);
    assert!(stage.list_triggers().is_empty());

    let decision = stage.submit(Intent::manual("banter", pair())).await;
    let ticket_id = decision.ticket.expect("live ticket");
    settle().await;

    let running = stage.query_running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].ticket_id, ticket_id);
    assert_eq!(running[0].episode, "banter");
    assert_eq!(running[0].participants, greenroom_core::ParticipantId::normalize(&pair()));

    assert!(stage.force_release(ticket_id));
    assert!(stage.query_running().is_empty());
    assert_eq!(stage.kernel_stats().active_tickets, 0);

    // A second force-release is a no-op.
    assert!(!stage.force_release(ticket_id));

    // The freed participants are immediately admissible again.
    let next = stage.submit(Intent::manual("banter", pair())).await;
    assert!(next.is_approved());
}

#[tokio::test(start_paused = true)]
async fn results_flow_to_the_history_sink() {
    let act = CountingAct::new("banter", 500);
    let (stage, _clock, history) = stage_with_act(bare_config(), act.clone());

    assert!(stage.submit(Intent::manual("banter", pair())).await.is_approved());
    tokio::time::sleep(Duration::from_millis(600)).await;
    settle().await;

    let recent = history.recent(1);
    assert_eq!(recent.len(), 1);
    assert!(recent[0].result.completed);
    assert!(recent[0].result.text.starts_with("spoke:"));
    assert_eq!(recent[0].conv_key.as_str(), "alice|bram");
}
