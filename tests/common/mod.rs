//! Shared harness for integration tests: one in-memory ledger, a controller
//! identity and a registered server identity.

use std::sync::Arc;

use tan_shell::lifecycle::Shutdown;
use tan_shell::protocol::{
    ClientId, CommandDispatcher, CommandListener, DispatcherOptions, ListenerOptions,
    MemoryLedger, SubmitPolicy, TransactionSubmitter,
};
use tan_shell::resilience::Backoff;

pub const CONTROLLER: &str = "controller";
pub const SERVER: &str = "server";

pub struct Harness {
    pub ledger: MemoryLedger,
    pub shutdown: Shutdown,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self {
            ledger: MemoryLedger::new(),
            shutdown: Shutdown::new(),
        }
    }

    /// Register the server behind two other clients so it holds client id 3.
    pub fn register_server(&self) -> ClientId {
        self.ledger.register("server-a");
        self.ledger.register("server-b");
        self.ledger.register(SERVER)
    }

    pub async fn submitter(&self, identity: &str) -> Arc<TransactionSubmitter> {
        let submitter = TransactionSubmitter::new(
            Arc::new(self.ledger.transport(identity)),
            policy(),
            self.shutdown.child_token(),
        )
        .await
        .unwrap();
        Arc::new(submitter)
    }

    pub async fn dispatcher(&self, max_chunk_size: usize) -> CommandDispatcher {
        let options = DispatcherOptions {
            max_chunk_size,
            stream_buffer: 16,
            stream_timeout: None,
            message_id_seed: 0,
        };
        CommandDispatcher::new(self.submitter(CONTROLLER).await, options, &self.shutdown)
    }

    pub async fn listener(&self, max_chunk_size: usize) -> CommandListener {
        let options = ListenerOptions {
            max_chunk_size,
            command_buffer: 16,
            sink_buffer: 16,
            stream_timeout: None,
        };
        CommandListener::start(self.submitter(SERVER).await, options, &self.shutdown)
            .await
            .unwrap()
    }
}

/// Submission policy without backoff delays.
pub fn policy() -> SubmitPolicy {
    SubmitPolicy {
        backoff: Backoff::immediate(),
        ..SubmitPolicy::default()
    }
}
