//! Reconciliation against paper broker state.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use bracket_engine::Engine;
use bracket_engine::config::Config;
use bracket_engine::domain::{
    Action, BrokerPosition, Contract, OrderAck, OrderId, OrderRecord, OrderRequest, OrderRole,
    OrderSide, PermId, PositionRecord, Symbol, TradeIntent,
};
use bracket_engine::execution::IntentOutcome;
use bracket_engine::paper::PaperGateway;
use bracket_engine::persistence::{DurableStore, InMemoryStore};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn config(periodic: bool) -> Config {
    let mut config = Config::default();
    config.broker.connect_attempts = 1;
    config.broker.settle_delay_ms = 0;
    config.reconciliation.enabled = periodic;
    config.reconciliation.interval_secs = 1;
    config
}

fn stale_position(symbol: &str, quantity: Decimal) -> PositionRecord {
    PositionRecord::from_broker(
        &BrokerPosition {
            account: "DU0000001".to_string(),
            symbol: Symbol::new(symbol),
            quantity,
            avg_cost: dec!(50),
        },
        Utc::now(),
    )
}

fn unknown_order(id: i64, symbol: &str) -> OrderRecord {
    let request = OrderRequest::limit(
        Contract::stock(symbol).qualified(11),
        OrderSide::Buy,
        dec!(5),
        dec!(90),
    );
    OrderRecord::placed(
        &request,
        OrderAck {
            order_id: OrderId(id),
            perm_id: PermId(id),
        },
        OrderRole::Parent,
    )
}

#[tokio::test]
async fn local_state_converges_on_broker_truth() {
    let paper = Arc::new(PaperGateway::new());
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::new(config(false), paper.clone(), store.clone());
    engine.start().await.unwrap();
    let mut outcomes = engine.outcomes();

    for symbol in ["AAPL", "MSFT"] {
        let mut intent = TradeIntent::new(symbol, Action::Buy);
        intent.entry_price = Some(dec!(100));
        intent.stop_loss = Some(dec!(98));
        intent.account_balance = dec!(10000);
        engine.submit(intent).await;
    }
    let mut parents = Vec::new();
    while parents.len() < 2 {
        let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        if let IntentOutcome::ParentSubmitted { order_id, .. } = outcome {
            parents.push(order_id);
        }
    }

    // A record the broker never acknowledged, and positions that drifted.
    store.insert_order(&unknown_order(500, "AMD")).await.unwrap();
    paper.set_position("NVDA", dec!(12), dec!(400));
    store
        .upsert_position(&stale_position("TSLA", dec!(3)))
        .await
        .unwrap();
    store
        .upsert_position(&stale_position("NVDA", dec!(1)))
        .await
        .unwrap();

    let report = engine.reconcile().await.unwrap();
    assert!(report.passed());
    assert_eq!(report.orders_checked, 3);
    assert_eq!(report.stale_orders_removed, vec![OrderId(500)]);
    assert_eq!(report.positions_deleted, vec![Symbol::new("TSLA")]);

    let mut open: Vec<_> = store
        .list_open_orders()
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.order_id)
        .collect();
    open.sort();
    parents.sort();
    assert_eq!(open, parents);

    let positions = store.list_positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].symbol, Symbol::new("NVDA"));
    assert_eq!(positions[0].quantity, dec!(12));

    // History of the dropped order is kept.
    assert_eq!(
        store
            .get_order_history(&Symbol::new("AMD"))
            .await
            .unwrap()
            .len(),
        1
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn second_pass_is_a_no_op() {
    let paper = Arc::new(PaperGateway::new());
    paper.set_position("SPY", dec!(-7), dec!(500));
    let store = Arc::new(InMemoryStore::new());
    store.insert_order(&unknown_order(42, "SPY")).await.unwrap();
    let engine = Engine::new(config(false), paper, store.clone());
    engine.start().await.unwrap();

    let first = engine.reconcile().await.unwrap();
    assert_eq!(first.stale_orders_removed.len(), 1);
    assert_eq!(first.positions_upserted, 1);

    let second = engine.reconcile().await.unwrap();
    assert!(second.stale_orders_removed.is_empty());
    assert!(second.positions_deleted.is_empty());
    assert_eq!(second.orders_checked, 0);
    assert_eq!(store.list_positions().await.unwrap()[0].quantity, dec!(-7));
    engine.shutdown().await;
}

#[tokio::test]
async fn periodic_loop_runs_at_startup() {
    let paper = Arc::new(PaperGateway::new());
    let store = Arc::new(InMemoryStore::new());
    store
        .upsert_position(&stale_position("QQQ", dec!(2)))
        .await
        .unwrap();
    let engine = Engine::new(config(true), paper, store.clone());
    engine.start().await.unwrap();

    for _ in 0..100 {
        if engine.reconciler().last_report().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let report = engine.reconciler().last_report().unwrap();
    assert_eq!(report.positions_deleted, vec![Symbol::new("QQQ")]);
    assert_eq!(store.position_count(), 0);
    engine.shutdown().await;
}
