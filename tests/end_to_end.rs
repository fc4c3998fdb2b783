//! Controller to server round trips over the in-memory ledger.

use bytes::Bytes;
use std::collections::HashMap;

use tan_shell::exec::{Shell, ShellExecutor};
use tan_shell::protocol::{ClientId, MessageId, StreamKind};

mod common;
use common::Harness;

#[tokio::test]
async fn test_echo_hi_round_trip() {
    let h = Harness::new();
    let server_id = h.register_server();
    assert_eq!(server_id, ClientId(3));
    let mut listener = h.listener(4).await;
    let dispatcher = h.dispatcher(4).await;

    let output = dispatcher.write(ClientId(3), "echo hi").await.unwrap();
    assert_eq!(output.message_id, MessageId(1));

    let command = listener.next_command().await.unwrap().unwrap();
    assert_eq!(command.id, MessageId(1));
    assert_eq!(command.input, Bytes::from_static(b"echo hi"));
    command.stdout.write("hi\n").await.unwrap();
    command.stdout.close().await.unwrap();
    command.stderr.close().await.unwrap();

    assert_eq!(output.stdout.read_to_end().await.unwrap(), b"hi\n");
    assert!(output.stderr.read_to_end().await.unwrap().is_empty());

    let stdin_chunks = h
        .ledger
        .history()
        .into_iter()
        .filter(|e| e.chunk.key.kind == StreamKind::Stdin)
        .count();
    assert_eq!(stdin_chunks, 3);
}

#[tokio::test]
async fn test_large_payload_echoed_back() {
    let h = Harness::new();
    let server_id = h.register_server();
    let mut listener = h.listener(100).await;
    let dispatcher = h.dispatcher(256).await;

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let output = dispatcher.write(server_id, payload.clone()).await.unwrap();

    let command = listener.next_command().await.unwrap().unwrap();
    assert_eq!(command.input.len(), payload.len());
    command.stdout.write(command.input.clone()).await.unwrap();
    drop(command);

    assert_eq!(output.stdout.read_to_end().await.unwrap(), payload);
    assert!(output.stderr.read_to_end().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_command_delivered() {
    let h = Harness::new();
    let server_id = h.register_server();
    let mut listener = h.listener(16).await;
    let dispatcher = h.dispatcher(16).await;

    let output = dispatcher.write(server_id, Bytes::new()).await.unwrap();
    let command = listener.next_command().await.unwrap().unwrap();
    assert!(command.input.is_empty());
    command.stderr.close_with_error("nothing to run").await.unwrap();
    command.stdout.close().await.unwrap();

    assert!(output.stdout.read_to_end().await.unwrap().is_empty());
    assert!(output.stderr.read_to_end().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_commands_keep_separate_streams() {
    let h = Harness::new();
    let server_id = h.register_server();
    let mut listener = h.listener(3).await;
    let dispatcher = h.dispatcher(3).await;

    let (first, second) = tokio::join!(
        dispatcher.write(server_id, "uname -a"),
        dispatcher.write(server_id, "ls -la /tmp"),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let mut inputs = HashMap::new();
    for _ in 0..2 {
        let command = listener.next_command().await.unwrap().unwrap();
        inputs.insert(command.id, command.input.clone());
        let reply = [b"ran: ".as_slice(), &command.input].concat();
        command.stdout.write(reply).await.unwrap();
        command.stdout.close().await.unwrap();
        command.stderr.close().await.unwrap();
    }

    assert_eq!(inputs[&first.message_id], Bytes::from_static(b"uname -a"));
    assert_eq!(inputs[&second.message_id], Bytes::from_static(b"ls -la /tmp"));
    assert_eq!(first.stdout.read_to_end().await.unwrap(), b"ran: uname -a");
    assert_eq!(second.stdout.read_to_end().await.unwrap(), b"ran: ls -la /tmp");
}

#[tokio::test]
async fn test_real_shell_round_trip() {
    let h = Harness::new();
    let server_id = h.register_server();
    let listener = h.listener(8).await;
    let dispatcher = h.dispatcher(8).await;

    let shutdown = h.shutdown.clone();
    let server = tokio::spawn(async move {
        ShellExecutor::new(Shell::Sh, 20 * 1024)
            .serve(listener, &shutdown)
            .await
    });

    let output = dispatcher
        .write(server_id, "echo hi; echo warn >&2")
        .await
        .unwrap();
    let (stdout, stderr) = tokio::join!(output.stdout.read_to_end(), output.stderr.read_to_end());
    assert_eq!(stdout.unwrap(), b"hi\n");
    assert_eq!(stderr.unwrap(), b"warn\n");

    let output = dispatcher.write(server_id, "exit 2").await.unwrap();
    let stderr = output.stderr.read_to_end().await.unwrap();
    assert!(String::from_utf8_lossy(&stderr).contains('2'));

    h.shutdown.trigger();
    assert!(server.await.unwrap().is_ok());
}
