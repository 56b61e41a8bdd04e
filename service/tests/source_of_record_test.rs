//! HTTP source of record against a local stub server.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use inventory_sync_core::position::PositionKey;
use inventory_sync_core::reconciliation::{SourceOfRecord, SourceOfRecordError};
use inventory_sync_runtime::{
    Collaborators, CycleReport, InMemoryDeadLetterStore, SafetyStockTable, SyncConfig, SyncEngine,
};
use inventory_sync_service::HttpSourceOfRecord;
use inventory_sync_testing::{RecordingAuditSink, StaticReceiptSchedule, builders, test_clock};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type Stock = Arc<HashMap<(String, String), u64>>;

async fn on_hand(State(stock): State<Stock>, Path((location, item)): Path<(String, String)>) -> Response {
    match location.as_str() {
        "slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({ "onHandQty": 1 })).into_response()
        },
        "broken" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        "garbled" => "not json".into_response(),
        _ => match stock.get(&(location, item)) {
            Some(qty) => Json(json!({ "onHandQty": qty })).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
    }
}

/// Serve the stub on an ephemeral port and return its base URL.
async fn stub(stock: &[(&str, &str, u64)]) -> String {
    let stock: Stock = Arc::new(
        stock
            .iter()
            .map(|(l, i, q)| (((*l).to_string(), (*i).to_string()), *q))
            .collect(),
    );
    let app = Router::new()
        .route("/positions/:location/:item", get(on_hand))
        .with_state(stock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base: &str, timeout: Duration) -> HttpSourceOfRecord {
    HttpSourceOfRecord::new(base, timeout).unwrap()
}

#[tokio::test]
async fn untracked_keys_are_omitted() {
    let base = stub(&[("store-1", "sku-1", 45), ("store-1", "sku-2", 0)]).await;
    let source = client(&base, Duration::from_secs(2));
    let keys = vec![
        PositionKey::new("store-1", "sku-1"),
        PositionKey::new("store-1", "sku-2"),
        PositionKey::new("store-9", "sku-9"),
    ];

    let found = source.on_hand(&keys).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[&keys[0]], 45);
    assert_eq!(found[&keys[1]], 0);
}

#[tokio::test]
async fn slow_answers_time_out() {
    let base = stub(&[]).await;
    let source = client(&base, Duration::from_millis(100));

    let err = source
        .on_hand(&[PositionKey::new("slow", "sku-1")])
        .await
        .unwrap_err();
    assert_eq!(err, SourceOfRecordError::Timeout(Duration::from_millis(100)));
}

#[tokio::test]
async fn server_errors_fail_the_whole_query() {
    let base = stub(&[("store-1", "sku-1", 45)]).await;
    let source = client(&base, Duration::from_secs(2));

    let err = source
        .on_hand(&[
            PositionKey::new("store-1", "sku-1"),
            PositionKey::new("broken", "sku-1"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, SourceOfRecordError::Unreachable(_)));
}

#[tokio::test]
async fn unparsable_bodies_are_invalid_responses() {
    let base = stub(&[]).await;
    let source = client(&base, Duration::from_secs(2));

    let err = source
        .on_hand(&[PositionKey::new("garbled", "sku-1")])
        .await
        .unwrap_err();
    assert!(matches!(err, SourceOfRecordError::InvalidResponse(_)));
}

#[tokio::test]
async fn refused_connections_are_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let source = client(&format!("http://{addr}"), Duration::from_secs(2));

    let err = source
        .on_hand(&[PositionKey::new("store-1", "sku-1")])
        .await
        .unwrap_err();
    assert!(matches!(err, SourceOfRecordError::Unreachable(_)));
}

#[tokio::test]
async fn reconciliation_cycle_over_http() {
    let base = stub(&[("store-1", "sku-1", 45), ("store-1", "sku-2", 30)]).await;
    let audit = RecordingAuditSink::new();
    let engine = SyncEngine::new(
        SyncConfig::default(),
        Collaborators {
            clock: Arc::new(test_clock()),
            audit: Arc::new(audit.clone()),
            dead_letter_store: Arc::new(InMemoryDeadLetterStore::new()),
            receipts: Arc::new(StaticReceiptSchedule::new()),
            source_of_record: Arc::new(client(&base, Duration::from_secs(2))),
            safety_stock: Arc::new(SafetyStockTable::new(0)),
        },
    );

    let small = PositionKey::new("store-1", "sku-1");
    let large = PositionKey::new("store-1", "sku-2");
    let untracked = PositionKey::new("store-1", "sku-3");
    for (id, key, qty) in [("R1", &small, 50), ("R2", &large, 10), ("R3", &untracked, 7)] {
        engine
            .store()
            .apply(&builders::receipt(id, key, qty))
            .await
            .unwrap();
    }

    let report = engine.reconciler().run_cycle().await;
    assert_eq!(
        report,
        CycleReport::Completed {
            compared: 2,
            discrepancies: 2,
            corrected: 1,
            escalated: 1,
            settling: 0,
        }
    );
    assert_eq!(engine.store().get(&small).await.on_hand_qty, 45);
    assert_eq!(engine.store().get(&large).await.on_hand_qty, 10);
    assert_eq!(engine.store().get(&untracked).await.on_hand_qty, 7);
    assert_eq!(audit.discrepancies().len(), 2);
    assert_eq!(audit.alerts().len(), 1);
}
