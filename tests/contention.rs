//! Nonce and gas price contention, failure surfacing, and cancellation.

use futures_util::future::join_all;
use std::collections::HashSet;
use std::time::Duration;

use tan_shell::protocol::{LedgerError, ProtocolError, SubmitError};

mod common;
use common::{Harness, CONTROLLER};

#[tokio::test]
async fn test_concurrent_writes_serialize_nonces() {
    let h = Harness::new();
    let server_id = h.register_server();
    let mut listener = h.listener(16).await;
    let dispatcher = h.dispatcher(4).await;
    h.ledger.set_latency(Duration::from_millis(2));

    let commands: Vec<String> = (0..8).map(|i| format!("echo command-{i}")).collect();
    let outputs = join_all(commands.iter().map(|c| dispatcher.write(server_id, c.clone()))).await;
    assert!(outputs.iter().all(|o| o.is_ok()));

    assert_eq!(h.ledger.max_in_flight(CONTROLLER), 1);
    let nonces: Vec<u64> = h
        .ledger
        .accepted(CONTROLLER)
        .iter()
        .map(|tx| tx.params.nonce)
        .collect();
    assert_eq!(nonces, (0..nonces.len() as u64).collect::<Vec<_>>());

    let mut received = HashSet::new();
    for _ in 0..commands.len() {
        let command = listener.next_command().await.unwrap().unwrap();
        received.insert(String::from_utf8(command.input.to_vec()).unwrap());
    }
    assert_eq!(received, commands.into_iter().collect());
}

#[tokio::test]
async fn test_stale_nonce_resynchronized() {
    let h = Harness::new();
    let server_id = h.register_server();
    let dispatcher = h.dispatcher(64).await;

    // Another process sends two transactions with the same key.
    h.ledger.advance_nonce(CONTROLLER);
    h.ledger.advance_nonce(CONTROLLER);

    dispatcher.write(server_id, "ls").await.unwrap();
    let nonces: Vec<u64> = h
        .ledger
        .accepted(CONTROLLER)
        .iter()
        .map(|tx| tx.params.nonce)
        .collect();
    assert_eq!(nonces, vec![2, 3]);
}

#[tokio::test]
async fn test_underpriced_bumps_gas_for_that_submission() {
    let h = Harness::new();
    let server_id = h.register_server();
    let dispatcher = h.dispatcher(64).await;

    h.ledger.inject_failure(CONTROLLER, SubmitError::Underpriced);
    h.ledger.inject_failure(CONTROLLER, SubmitError::Underpriced);

    dispatcher.write(server_id, "ls").await.unwrap();
    let prices: Vec<u128> = h
        .ledger
        .accepted(CONTROLLER)
        .iter()
        .map(|tx| tx.params.gas_price)
        .collect();
    assert_eq!(prices, vec![1_000_000_002, 1_000_000_000]);
}

#[tokio::test]
async fn test_rejection_surfaces_without_subscriptions() {
    let h = Harness::new();
    let server_id = h.register_server();
    let dispatcher = h.dispatcher(64).await;

    h.ledger
        .inject_failure(CONTROLLER, SubmitError::Rejected("execution reverted".into()));
    let err = dispatcher.write(server_id, "ls").await.unwrap_err();

    assert_eq!(
        err,
        ProtocolError::Submit(SubmitError::Rejected("execution reverted".into()))
    );
    assert_eq!(h.ledger.active_subscriptions(), 0);

    // The nonce was not consumed, so the next command goes through.
    dispatcher.write(server_id, "ls").await.unwrap();
    assert_eq!(h.ledger.accepted(CONTROLLER)[0].params.nonce, 0);
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_write() {
    let h = Harness::new();
    let server_id = h.register_server();
    let dispatcher = h.dispatcher(64).await;
    h.ledger.set_latency(Duration::from_secs(30));

    let shutdown = h.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
    });

    let err = tokio::time::timeout(Duration::from_secs(5), dispatcher.write(server_id, "ls"))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err, ProtocolError::Cancelled);
    assert_eq!(h.ledger.account_nonce(CONTROLLER), 0);
}

#[tokio::test]
async fn test_shutdown_ends_pending_output_streams() {
    let h = Harness::new();
    let server_id = h.register_server();
    let dispatcher = h.dispatcher(64).await;

    let output = dispatcher.write(server_id, "sleep 100").await.unwrap();
    h.shutdown.trigger();

    let err = tokio::time::timeout(Duration::from_secs(5), output.stdout.read_to_end())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err, ProtocolError::Cancelled);
}

#[tokio::test]
async fn test_broken_subscription_fails_streams() {
    let h = Harness::new();
    let server_id = h.register_server();
    let dispatcher = h.dispatcher(64).await;

    let output = dispatcher.write(server_id, "ls").await.unwrap();
    h.ledger
        .break_subscriptions(LedgerError::Rpc("connection reset".into()));

    let err = output.stderr.read_to_end().await.unwrap_err();
    assert_eq!(err, ProtocolError::Ledger(LedgerError::Rpc("connection reset".into())));
}
