use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use billsync::{
    BillStatus, EngineConfig, Frequency, GatewayCall, GatewayError, GatewayOp, InMemoryGateway,
    PatternDraft, PatternEngine, PatternId, RawPattern, SyncError,
};

const RENT: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";
const GYM: &str = "bbbbbbbbbbbbbbbbbbbbbbbb";

fn record(id: &str, vendor: &str, frequency: Frequency) -> RawPattern {
    RawPattern::from_draft(
        id,
        PatternDraft::new(
            vendor,
            25.0,
            frequency,
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        ),
    )
}

async fn loaded_engine() -> (Arc<InMemoryGateway>, Arc<PatternEngine>) {
    let gateway = Arc::new(InMemoryGateway::with_records(vec![
        record(RENT, "Rent", Frequency::Monthly),
        record(GYM, "Gym", Frequency::Weekly),
        record("legacy-7", "Water", Frequency::Quarterly),
    ]));
    gateway.set_status(RENT, BillStatus::Paid);
    let engine = Arc::new(PatternEngine::new(gateway.clone()));
    engine.refresh().await.unwrap();
    (gateway, engine)
}

#[tokio::test]
async fn unchanged_set_is_looked_up_once() {
    let (gateway, engine) = loaded_engine().await;
    let patterns = engine.get_all().unwrap();

    let first = engine.get_status(&patterns).await.unwrap();
    let mut reordered = patterns.clone();
    reordered.reverse();
    let second = engine.get_status(&reordered).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(gateway.call_count(GatewayOp::BatchStatus), 1);
    assert_eq!(first[&PatternId::parse(RENT)], BillStatus::Paid);
    assert_eq!(first[&PatternId::parse(GYM)], BillStatus::Unpaid);
    assert_eq!(first[&PatternId::parse("legacy-7")], BillStatus::Unknown);
}

#[tokio::test]
async fn only_confirmed_ids_are_sent() {
    let (gateway, engine) = loaded_engine().await;
    engine.get_status(&engine.get_all().unwrap()).await.unwrap();
    let sent: Vec<_> = gateway
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            GatewayCall::BatchStatus { ids } => Some(ids),
            _ => None,
        })
        .collect();
    assert_eq!(sent, vec![vec![RENT.to_string(), GYM.to_string()]]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_views_share_one_lookup() {
    let (gateway, engine) = loaded_engine().await;
    gateway.set_delay(GatewayOp::BatchStatus, Duration::from_millis(100));
    let patterns = engine.get_all().unwrap();

    let (a, b, c) = tokio::join!(
        engine.get_status(&patterns),
        engine.get_status(&patterns),
        engine.get_status(&patterns),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert!(c.is_ok());
    assert_eq!(gateway.call_count(GatewayOp::BatchStatus), 1);
}

#[tokio::test]
async fn appearance_change_refetches() {
    let (gateway, engine) = loaded_engine().await;
    engine.get_status(&engine.get_all().unwrap()).await.unwrap();

    engine
        .update(
            &PatternId::parse(GYM),
            billsync::PatternPatch::default().appearance(billsync::Appearance::brand("dumbbell")),
        )
        .await
        .unwrap();
    engine.get_status(&engine.get_all().unwrap()).await.unwrap();
    assert_eq!(gateway.call_count(GatewayOp::BatchStatus), 2);
}

#[tokio::test]
async fn failed_lookup_keeps_previous_entry() {
    let (gateway, engine) = loaded_engine().await;
    let patterns = engine.get_all().unwrap();
    engine.get_status(&patterns).await.unwrap();
    let cached = engine.status_cache().entry().unwrap().unwrap();

    gateway.fail_next(GatewayOp::BatchStatus, GatewayError::transport("offline"));
    let err = engine.get_status(&patterns[..1]).await.unwrap_err();
    assert!(matches!(err, SyncError::StatusFailed { .. }));
    assert_eq!(engine.status_cache().entry().unwrap().unwrap(), cached);
}

#[tokio::test]
async fn paid_patterns_display_next_period() {
    let (_gateway, engine) = loaded_engine().await;
    let due = engine.get_due_dates(&engine.get_all().unwrap()).await.unwrap();
    // January 31st plus one month clamps to the end of February.
    assert_eq!(due[&PatternId::parse(RENT)], NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
    assert_eq!(due[&PatternId::parse(GYM)], NaiveDate::from_ymd_opt(2025, 1, 31).unwrap());
}

#[tokio::test]
async fn excluded_status_is_configurable() {
    let gateway = Arc::new(InMemoryGateway::with_records(vec![record(
        "manual_3",
        "Water",
        Frequency::Monthly,
    )]));
    let config = EngineConfig::from_json(r#"{"status": {"excluded_status": "unpaid"}}"#).unwrap();
    let engine = PatternEngine::with_config(gateway.clone(), config);
    engine.refresh().await.unwrap();

    let statuses = engine.get_status(&engine.get_all().unwrap()).await.unwrap();
    assert_eq!(statuses[&PatternId::parse("manual_3")], BillStatus::Unpaid);
    assert_eq!(gateway.call_count(GatewayOp::BatchStatus), 0);
}
