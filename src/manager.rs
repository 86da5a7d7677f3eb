//! Session owner and dispatch entry point.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::error::Result;
use crate::protocol::{GuestMessage, HostMessage};
use crate::session::{lock, DndState};
use crate::transport::HostCall;

#[derive(Debug, Default)]
struct Registry {
    sources: Vec<u64>,
    targets: Vec<u64>,
    next_id: u64,
}

/// Owns the session state and the outbound transport.
///
/// One manager exists per host/guest connection. Sources and targets hold
/// an `Arc` to it and register themselves for their lifetime.
pub struct DndManager {
    state: Arc<DndState>,
    transport: Arc<dyn HostCall>,
    config: Config,
    registry: Mutex<Registry>,
    pending: AtomicUsize,
}

impl std::fmt::Debug for DndManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DndManager")
            .field("transport", &self.transport.name())
            .field("registry", &*lock(&self.registry))
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DndManager {
    /// Create a manager sending through `transport`
    pub fn new(config: Config, transport: Arc<dyn HostCall>) -> Arc<Self> {
        tracing::debug!(transport = transport.name(), "creating DnD manager");
        Arc::new(Self {
            state: Arc::new(DndState::new(config.timeouts.clone())),
            transport,
            config,
            registry: Mutex::new(Registry::default()),
            pending: AtomicUsize::new(0),
        })
    }

    /// Inbound entry point for the transport.
    ///
    /// The returned error is the status reported back to the guest.
    pub fn notify_dispatcher(&self, msg: &GuestMessage) -> Result<()> {
        let result = self.state.on_dispatch(msg);
        if let Err(e) = &result {
            tracing::trace!(kind = ?msg.kind(), error = %e, "dispatch returned error");
        }
        result
    }

    /// Push `msg` toward the guest without waiting for an answer
    pub fn host_call(&self, msg: HostMessage) -> Result<()> {
        tracing::trace!(kind = ?msg.kind(), "host call");
        self.transport.host_call(msg)
    }

    /// Session state
    pub fn state(&self) -> &Arc<DndState> {
        &self.state
    }

    /// Outbound transport
    pub fn transport(&self) -> &Arc<dyn HostCall> {
        &self.transport
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a source; returns its registration ID.
    ///
    /// Any number may be registered, but drops only start while exactly one
    /// is; otherwise they fail with `AlreadyInProgress`.
    pub fn register_source(&self) -> u64 {
        let mut reg = lock(&self.registry);
        reg.next_id += 1;
        let id = reg.next_id;
        reg.sources.push(id);
        id
    }

    /// Remove a source registration
    pub fn unregister_source(&self, id: u64) {
        lock(&self.registry).sources.retain(|s| *s != id);
    }

    /// Register a target; returns its registration ID.
    ///
    /// Sends only start while exactly one target is registered.
    pub fn register_target(&self) -> u64 {
        let mut reg = lock(&self.registry);
        reg.next_id += 1;
        let id = reg.next_id;
        reg.targets.push(id);
        id
    }

    /// Remove a target registration
    pub fn unregister_target(&self, id: u64) {
        lock(&self.registry).targets.retain(|t| *t != id);
    }

    /// Registered sources
    pub fn source_count(&self) -> usize {
        lock(&self.registry).sources.len()
    }

    /// Registered targets
    pub fn target_count(&self) -> usize {
        lock(&self.registry).targets.len()
    }

    /// Count a transfer as running until the returned guard is dropped
    pub(crate) fn begin_transfer(self: &Arc<Self>) -> PendingTransfer {
        self.pending.fetch_add(1, Ordering::SeqCst);
        PendingTransfer {
            manager: self.clone(),
        }
    }

    /// Transfers currently running
    pub fn pending_transfers(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Keeps a transfer counted on its manager
#[derive(Debug)]
pub(crate) struct PendingTransfer {
    manager: Arc<DndManager>,
}

impl Drop for PendingTransfer {
    fn drop(&mut self) {
        self.manager.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for DndManager {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.pending.load(Ordering::SeqCst),
            0,
            "DnD manager dropped with transfers pending"
        );
        tracing::debug!("DnD manager destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DndError;

    struct NullTransport;

    impl HostCall for NullTransport {
        fn host_call(&self, _msg: HostMessage) -> Result<()> {
            Ok(())
        }
    }

    fn manager() -> Arc<DndManager> {
        DndManager::new(Config::default(), Arc::new(NullTransport))
    }

    #[test]
    fn test_registration_counts() {
        let mgr = manager();
        let s = mgr.register_source();
        let t = mgr.register_target();
        assert_eq!((mgr.source_count(), mgr.target_count()), (1, 1));
        mgr.unregister_source(s);
        mgr.unregister_target(t);
        assert_eq!((mgr.source_count(), mgr.target_count()), (0, 0));
    }

    #[test]
    fn test_dispatch_reaches_state() {
        let mgr = manager();
        mgr.notify_dispatcher(&GuestMessage::ReportFeatures { features: 0x3 })
            .unwrap();
        assert_eq!(mgr.state().guest_features(), 0x3);

        let poll = GuestMessage::GetNextHostMessage {
            expected: None,
            param_count: None,
        };
        assert!(matches!(
            mgr.notify_dispatcher(&poll),
            Err(DndError::NotAvailable)
        ));
    }

    #[test]
    fn test_pending_transfer_counter() {
        let mgr = manager();
        let first = mgr.begin_transfer();
        let second = mgr.begin_transfer();
        assert_eq!(mgr.pending_transfers(), 2);
        drop(first);
        drop(second);
        assert_eq!(mgr.pending_transfers(), 0);
    }
}
