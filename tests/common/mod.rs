//! Shared helpers for the end-to-end tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use dnd::error::Result;
use dnd::protocol::{GuestMessage, HostMessage, MessageKind};
use dnd::transport::HostCall;
use dnd::{Config, DndManager};

/// Guest reaction to a host message, run synchronously inside `host_call`
pub type Script = Box<dyn Fn(&DndManager, &HostMessage) + Send + Sync>;

/// Transport that records every host message and optionally answers it
pub struct RecordingTransport {
    sent: Mutex<Vec<HostMessage>>,
    manager: OnceLock<Weak<DndManager>>,
    script: Option<Script>,
}

impl RecordingTransport {
    /// Record only; the guest never answers
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            manager: OnceLock::new(),
            script: None,
        })
    }

    /// Record and answer with `script`
    pub fn scripted(
        script: impl Fn(&DndManager, &HostMessage) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            manager: OnceLock::new(),
            script: Some(Box::new(script)),
        })
    }

    /// Messages sent so far
    pub fn sent(&self) -> Vec<HostMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Messages of `kind` sent so far
    pub fn count(&self, kind: MessageKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind() == kind)
            .count()
    }
}

impl HostCall for RecordingTransport {
    fn host_call(&self, msg: HostMessage) -> Result<()> {
        self.sent.lock().unwrap().push(msg.clone());
        if let Some(script) = &self.script {
            if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
                script(&manager, &msg);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Config with short waits and a private staging directory
pub fn test_config(staging: &Path) -> Config {
    Config::default()
        .with_staging_dir(staging)
        .with_poll_slice(Duration::from_millis(50))
        .with_transfer_timeout(Duration::from_secs(5))
}

/// Create a manager on `transport` and connect a guest speaking `version`
pub fn connect(
    transport: &Arc<RecordingTransport>,
    config: Config,
    version: u32,
) -> Arc<DndManager> {
    let manager = DndManager::new(config, transport.clone());
    transport
        .manager
        .set(Arc::downgrade(&manager))
        .unwrap_or_else(|_| panic!("transport already bound"));
    manager
        .notify_dispatcher(&GuestMessage::Connect {
            protocol_version: version,
            flags: 0,
        })
        .unwrap();
    manager
}

/// Number of entries directly below `dir`
pub fn entry_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
