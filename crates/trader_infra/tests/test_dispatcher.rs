//! StreamDispatcher: effect execution, liveness and reconnects against
//! in-memory fakes.

mod common;

use std::time::Duration;

use common::{
    Step, at, buy_confirm_frame, flush, harness, holding, key_rotation_frame, seed, trade_frame,
};
use trader_core::dispatch::{ControlOutcome, DropReason, RouteOutcome};
use trader_core::error::DecodeError;
use trader_core::instrument::{LifecycleState, OrderPrice, Side, TriggerReason};
use trader_infra::dispatcher::{CycleOutcome, DispatchError, LiquidationReport};
use trader_infra::gateway::GatewayError;
use trader_infra::stream::ConnectionError;

// ─── Frame cycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rotation_trade_and_fill_reach_to_sell() {
    let mut h = harness(
        &[seed("A", 1000, 100_000, 1100)],
        vec![vec![
            Step::Frame(key_rotation_frame()),
            Step::Frame(trade_frame("A", 950)),
            Step::Frame(buy_confirm_frame("A", 105)),
        ]],
    );
    h.gateway.set_holdings(vec![holding("A", 105, 105)]);
    h.dispatcher.connect().await.unwrap();

    let rotated = h.dispatcher.poll_once().await.unwrap();
    assert!(matches!(
        rotated,
        CycleOutcome::Routed(RouteOutcome::Control(ControlOutcome::KeyRotated { generation: 1, .. }))
    ));

    h.dispatcher.poll_once().await.unwrap();
    let intents = h.gateway.intents();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].side, Side::Buy);
    assert_eq!(intents[0].quantity, 105);
    let machine = h.dispatcher.router().machine("A").unwrap();
    assert_eq!(machine.lifecycle(), LifecycleState::BuySubmitted);

    h.dispatcher.poll_once().await.unwrap();
    let state = h.dispatcher.router().machine("A").unwrap().state().clone();
    assert_eq!(state.lifecycle, LifecycleState::ToSell);
    assert_eq!(state.held_quantity, 105);
    // refreshed from the broker balance after the buy completed
    assert_eq!(state.average_purchase_price, Some(950.0));
    assert!(state.acquired_today);
    assert_eq!(h.store.get("A").unwrap(), state);

    flush().await;
    assert!(h.notifier.contains("[BUY]"));
    assert!(h.notifier.contains("[BOUGHT]"));
}

#[tokio::test]
async fn test_undecryptable_fill_is_dropped_without_error() {
    let mut h = harness(
        &[seed("A", 1000, 100_000, 1100)],
        vec![vec![Step::Frame(buy_confirm_frame("A", 105))]],
    );
    h.dispatcher.connect().await.unwrap();
    let writes = h.store.write_count();

    let outcome = h.dispatcher.poll_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Routed(RouteOutcome::Dropped(DropReason::Decode(DecodeError::NoSessionKey)))
    );
    let machine = h.dispatcher.router().machine("A").unwrap();
    assert_eq!(machine.lifecycle(), LifecycleState::ToBuy);
    assert_eq!(machine.state().held_quantity, 0);
    assert_eq!(h.store.write_count(), writes);
}

#[tokio::test]
async fn test_keep_alive_is_reported() {
    let mut h = harness(&[seed("A", 1000, 100_000, 1100)], vec![vec![Step::KeepAlive]]);
    h.dispatcher.connect().await.unwrap();
    assert_eq!(h.dispatcher.poll_once().await.unwrap(), CycleOutcome::KeepAlive);
}

#[tokio::test]
async fn test_poll_without_connection_fails() {
    let mut h = harness(&[seed("A", 1000, 100_000, 1100)], vec![]);
    let err = h.dispatcher.poll_once().await.unwrap_err();
    assert!(matches!(err, DispatchError::Connection(ConnectionError::NotConnected)));
}

// ─── Liveness and reconnect ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_silence_past_heartbeat_is_a_connection_error() {
    let mut h = harness(&[seed("A", 1000, 100_000, 1100)], vec![vec![]]);
    h.dispatcher.connect().await.unwrap();

    let mut idles = 0;
    let err = loop {
        match h.dispatcher.poll_once().await {
            Ok(CycleOutcome::Idle) => idles += 1,
            Ok(other) => panic!("unexpected {other:?}"),
            Err(err) => break err,
        }
        assert!(idles <= 10, "heartbeat never expired");
    };
    assert!(idles >= 4, "polled in slices, got {idles} idles");
    assert!(matches!(
        err,
        DispatchError::Connection(ConnectionError::HeartbeatTimeout(t)) if t == Duration::from_secs(5)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_extends_liveness() {
    let mut h = harness(&[seed("A", 1000, 100_000, 1100)], vec![vec![Step::KeepAlive]]);
    h.dispatcher.connect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.dispatcher.poll_once().await.unwrap(), CycleOutcome::KeepAlive);
    tokio::time::sleep(Duration::from_secs(3)).await;
    // 8s after connect on return, 4s after the keep-alive
    assert_eq!(h.dispatcher.poll_once().await.unwrap(), CycleOutcome::Idle);
}

#[tokio::test]
async fn test_transport_failure_drops_connection() {
    let mut h = harness(
        &[seed("A", 1000, 100_000, 1100)],
        vec![vec![Step::Fail(ConnectionError::Closed)]],
    );
    h.dispatcher.connect().await.unwrap();
    let err = h.dispatcher.poll_once().await.unwrap_err();
    assert!(matches!(err, DispatchError::Connection(ConnectionError::Closed)));
    assert!(!h.dispatcher.is_connected());
}

#[tokio::test]
async fn test_reconnect_clears_session_key_and_resubscribes() {
    let mut h = harness(
        &[seed("A", 1000, 100_000, 1100), seed("B", 1000, 100_000, 1100)],
        vec![vec![Step::Frame(key_rotation_frame())], vec![]],
    );
    h.dispatcher.connect().await.unwrap();
    h.dispatcher.poll_once().await.unwrap();
    assert!(h.dispatcher.router().cipher().is_ready());

    h.dispatcher.connect().await.unwrap();
    assert!(!h.dispatcher.router().cipher().is_ready());
    assert_eq!(h.dispatcher.connects(), 2);
    assert_eq!(h.connector.connects(), 2);

    let subscribed = h.connector.subscribed();
    assert_eq!(subscribed[0], subscribed[1]);
    assert_eq!(subscribed[1].len(), 7);
    assert_eq!(subscribed[1][0].tr_id, "H0STCNI0");
    assert_eq!(subscribed[1][0].tr_key, "HTSID");
}

// ─── Gateway failures ────────────────────────────────────────────────────

#[tokio::test]
async fn test_gateway_error_reverts_buy_and_notifies() {
    let mut h = harness(
        &[seed("A", 1000, 100_000, 1100)],
        vec![vec![Step::Frame(trade_frame("A", 950))]],
    );
    h.gateway.queue(Err(GatewayError::Transport("connection reset".into())));
    h.dispatcher.connect().await.unwrap();

    h.dispatcher.poll_once().await.unwrap();
    let machine = h.dispatcher.router().machine("A").unwrap();
    assert_eq!(machine.lifecycle(), LifecycleState::ToBuy);
    assert!(machine.state().pending_order.is_none());
    assert_eq!(h.dispatcher.router().metrics().rejections(), 1);

    flush().await;
    assert!(h.notifier.contains("[REJECTED]"));
    assert!(h.notifier.contains("connection reset"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_gateway_times_out_as_rejection() {
    let mut h = harness(
        &[seed("A", 1000, 100_000, 1100)],
        vec![vec![Step::Frame(trade_frame("A", 950))]],
    );
    h.gateway.set_delay(Duration::from_secs(30));
    h.dispatcher.connect().await.unwrap();

    h.dispatcher.poll_once().await.unwrap();
    assert_eq!(h.gateway.intents().len(), 1);
    let machine = h.dispatcher.router().machine("A").unwrap();
    assert_eq!(machine.lifecycle(), LifecycleState::ToBuy);

    flush().await;
    assert!(h.notifier.contains("[REJECTED]"));
}

#[tokio::test]
async fn test_persistence_failure_surfaces() {
    let mut h = harness(
        &[seed("A", 1000, 100_000, 1100)],
        vec![vec![Step::Frame(trade_frame("A", 950))]],
    );
    h.dispatcher.connect().await.unwrap();
    h.store.set_fail_writes(true);

    let err = h.dispatcher.poll_once().await.unwrap_err();
    assert!(matches!(err, DispatchError::Persistence(_)));
    assert!(h.gateway.intents().is_empty());
}

// ─── Account-level operations ────────────────────────────────────────────

#[tokio::test]
async fn test_liquidation_sells_old_positions_only() {
    let mut h = harness(
        &[seed("A", 1000, 100_000, 1100), seed("B", 1000, 100_000, 1100)],
        vec![],
    );
    let broker = vec![
        holding("A", 10, 0),
        holding("B", 5, 5),
        holding("Z", 7, 0),
        holding("Y", 3, 3),
    ];
    h.dispatcher.reconcile(&broker).await.unwrap();
    h.gateway.set_holdings(broker);
    h.clock.set(at("15:21:10"));

    let report = h.dispatcher.liquidate_positions().await.unwrap();
    assert_eq!(
        report,
        LiquidationReport {
            tracked: 1,
            untracked: 1,
            skipped: 2,
        }
    );

    let intents = h.gateway.intents();
    assert_eq!(intents.len(), 2);
    assert_eq!(intents[0].symbol, "A");
    assert_eq!(intents[0].quantity, 10);
    assert_eq!(intents[0].price, OrderPrice::Market);
    assert_eq!(intents[0].reason, TriggerReason::Liquidation);
    assert_eq!(intents[1].symbol, "Z");
    assert_eq!(intents[1].side, Side::Sell);
    assert_eq!(intents[1].quantity, 7);

    let router = h.dispatcher.router();
    assert_eq!(router.machine("A").unwrap().lifecycle(), LifecycleState::SellSubmitted);
    assert_eq!(router.machine("B").unwrap().lifecycle(), LifecycleState::ToSell);

    flush().await;
    assert!(h.notifier.contains("[LIQUIDATE] name-Z(Z)"));
}

#[tokio::test]
async fn test_liquidation_without_holdings_is_a_no_op() {
    let mut h = harness(&[seed("A", 1000, 100_000, 1100)], vec![]);
    h.gateway.set_fail_holdings(true);
    let report = h.dispatcher.liquidate_positions().await.unwrap();
    assert_eq!(report, LiquidationReport::default());
    assert!(h.gateway.intents().is_empty());
}

#[tokio::test]
async fn test_balance_report_is_notified() {
    let mut h = harness(&[seed("A", 1000, 100_000, 1100)], vec![]);
    h.gateway.set_holdings(vec![holding("A", 10, 0)]);
    h.dispatcher.report_balance().await;
    flush().await;
    assert!(h.notifier.contains("[BALANCE]"));
    assert!(h.notifier.contains("+ name-A(A): 10 shares"));
}
