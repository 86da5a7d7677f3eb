//! Shared drag-and-drop session state and inbound dispatch.
//!
//! One [`DndState`] exists per host/guest connection. It holds the negotiated
//! protocol parameters, the single in-flight progress object, the callback
//! registry keyed by message kind, and the guest-response wait primitive.
//!
//! A progress started with [`DndState::start_operation`] belongs to its
//! worker: guest errors, guest cancellation and disconnects only wake the
//! worker's [`CallbackEvent`], and the worker completes the progress once its
//! local state is rolled back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Semaphore;

use super::event::CallbackEvent;
use super::lock;
use super::progress::{Progress, ProgressOutcome};
use crate::config::TimeoutConfig;
use crate::error::{DndError, GuestRc, Result};
use crate::protocol::{
    ActionSet, DndAction, FormatList, GuestMessage, MessageKind, ProgressState, PROTOCOL_VERSION,
};

/// Callback invoked for a registered inbound message kind
pub type DispatchCallback = Arc<dyn Fn(&GuestMessage) -> Result<()> + Send + Sync>;

/// UI-facing negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing going on
    #[default]
    Unknown,
    /// Formats are being queried
    QueryFormats,
    /// Cursor entered
    Entered,
    /// Drag in progress
    Dragging,
    /// Cursor left after dragging
    LeftAfterDrag,
    /// Drop started
    DropStarted,
    /// Drop finished
    DropEnded,
    /// Operation cancelled
    Cancelled,
    /// Operation failed
    Error,
}

#[derive(Debug)]
struct StateInner {
    protocol_version: u32,
    guest_features: u64,
    state: SessionState,
    default_action: DndAction,
    allowed_actions: ActionSet,
    formats: FormatList,
    requested_formats: FormatList,
    progress: Option<Arc<Progress>>,
    operation: Option<Arc<CallbackEvent>>,
    last_guest_rc: GuestRc,
}

impl Default for StateInner {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            guest_features: 0,
            state: SessionState::Unknown,
            default_action: DndAction::Ignore,
            allowed_actions: ActionSet::NONE,
            formats: FormatList::new(),
            requested_formats: FormatList::new(),
            progress: None,
            operation: None,
            last_guest_rc: GuestRc::SUCCESS,
        }
    }
}

/// Session state machine
pub struct DndState {
    inner: Mutex<StateInner>,
    callbacks: Mutex<HashMap<MessageKind, DispatchCallback>>,
    response: Semaphore,
    timeouts: TimeoutConfig,
}

impl std::fmt::Debug for DndState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DndState")
            .field("inner", &*lock(&self.inner))
            .field("callbacks", &lock(&self.callbacks).keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DndState {
    /// Create a fresh session state
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            inner: Mutex::new(StateInner::default()),
            callbacks: Mutex::new(HashMap::new()),
            response: Semaphore::new(0),
            timeouts,
        }
    }

    /// Handle an inbound guest message.
    ///
    /// Core messages update the state and release one waiter blocked in
    /// [`wait_for_guest_response`](Self::wait_for_guest_response). Everything
    /// else goes to the registered callback for its kind, or to the default
    /// handler.
    pub fn on_dispatch(&self, msg: &GuestMessage) -> Result<()> {
        let kind = msg.kind();
        tracing::trace!(?kind, "dispatch");

        match msg {
            GuestMessage::Connect {
                protocol_version,
                flags,
            } => {
                let version = (*protocol_version).clamp(1, PROTOCOL_VERSION);
                lock(&self.inner).protocol_version = version;
                tracing::info!(
                    guest_version = protocol_version,
                    negotiated = version,
                    flags,
                    "guest connected"
                );
                self.notify_about_guest_response(GuestRc::SUCCESS);
                Ok(())
            },
            GuestMessage::ReportFeatures { features } => {
                lock(&self.inner).guest_features = *features;
                tracing::debug!(features = format_args!("{features:#x}"), "guest features");
                self.notify_about_guest_response(GuestRc::SUCCESS);
                Ok(())
            },
            GuestMessage::Disconnect => {
                tracing::info!("guest disconnected");
                let (progress, operation) = {
                    let mut inner = lock(&self.inner);
                    let progress = inner.progress.clone();
                    let operation = inner.operation.clone();
                    let version = inner.protocol_version;
                    *inner = StateInner {
                        protocol_version: version,
                        progress: progress.clone(),
                        operation: operation.clone(),
                        ..StateInner::default()
                    };
                    (progress, operation)
                };
                match (operation, progress) {
                    (Some(event), _) => event.notify(Err(DndError::Cancelled)),
                    (None, Some(progress)) => {
                        progress.complete(ProgressOutcome::Cancelled);
                    },
                    (None, None) => {},
                }
                self.notify_about_guest_response(GuestRc::CANCELLED);
                Ok(())
            },
            GuestMessage::HgAckAction { action } => {
                {
                    let mut inner = lock(&self.inner);
                    inner.default_action = *action;
                    if *action != DndAction::Ignore {
                        inner.state = SessionState::Dragging;
                    }
                }
                self.notify_about_guest_response(GuestRc::SUCCESS);
                Ok(())
            },
            GuestMessage::HgRequestData { formats } => {
                lock(&self.inner).requested_formats = FormatList::from_wire(formats);
                self.notify_about_guest_response(GuestRc::SUCCESS);
                Ok(())
            },
            GuestMessage::HgProgress {
                status,
                percent,
                rc,
            } => {
                self.set_progress(*percent, *status, *rc, None);
                let rc = if *status == ProgressState::Error && rc.is_success() {
                    GuestRc::GENERAL_FAILURE
                } else {
                    *rc
                };
                self.notify_about_guest_response(rc);
                Ok(())
            },
            GuestMessage::GhAckPending {
                default_action,
                allowed,
                formats,
            } => {
                {
                    let mut inner = lock(&self.inner);
                    inner.default_action = *default_action;
                    inner.allowed_actions = *allowed;
                    inner.formats = formats.clone();
                    inner.state = SessionState::QueryFormats;
                }
                self.notify_about_guest_response(GuestRc::SUCCESS);
                Ok(())
            },
            _ => {
                let callback = lock(&self.callbacks).get(&kind).cloned();
                match callback {
                    Some(callback) => callback(msg),
                    None => self.default_dispatch(msg),
                }
            },
        }
    }

    fn default_dispatch(&self, msg: &GuestMessage) -> Result<()> {
        match msg {
            GuestMessage::GetNextHostMessage { .. } => Err(DndError::NotAvailable),
            GuestMessage::GhError { rc } if self.is_progress_running() => {
                tracing::warn!(%rc, "guest reported error");
                self.set_progress(100, ProgressState::Error, *rc, None);
                self.notify_about_guest_response(*rc);
                Ok(())
            },
            _ if !self.is_progress_running() => {
                tracing::debug!(kind = ?msg.kind(), "no operation running, asking guest to stop");
                Err(DndError::Cancelled)
            },
            _ => Err(DndError::NotSupported(format!(
                "no handler for {:?}",
                msg.kind()
            ))),
        }
    }

    /// Map a status onto the current progress object.
    ///
    /// Error and Cancelled end the operation; Running/Complete raise the
    /// percentage and end it at 100. When a worker owns the progress the end
    /// is handed to it instead of completing the progress here.
    pub fn set_progress(
        &self,
        percent: u8,
        status: ProgressState,
        rc: GuestRc,
        message: Option<String>,
    ) {
        let Some(progress) = self.progress() else {
            return;
        };

        let result = match status {
            ProgressState::Error => {
                let rc = if rc.is_success() {
                    GuestRc::GENERAL_FAILURE
                } else {
                    rc
                };
                match message {
                    Some(message) if rc != GuestRc::CANCELLED => {
                        Err(DndError::Guest { rc, message })
                    },
                    _ => Err(DndError::guest(rc)),
                }
            },
            ProgressState::Cancelled => Err(DndError::Cancelled),
            ProgressState::Running | ProgressState::Complete => {
                progress.set_percent(percent.min(99));
                if percent < 100 && status == ProgressState::Running {
                    return;
                }
                Ok(())
            },
        };
        self.end_progress(&progress, result);
    }

    fn end_progress(&self, progress: &Progress, result: Result<()>) {
        if let Some(event) = lock(&self.inner).operation.clone() {
            tracing::debug!(?result, "handing operation end to its worker");
            event.notify(result);
            return;
        }

        let (outcome, state) = match result {
            Ok(()) => (ProgressOutcome::Success, SessionState::DropEnded),
            Err(DndError::Cancelled) => (ProgressOutcome::Cancelled, SessionState::Cancelled),
            Err(e) => (
                ProgressOutcome::Failed {
                    rc: e.rc(),
                    message: e.to_string(),
                },
                SessionState::Error,
            ),
        };
        progress.complete(outcome);
        lock(&self.inner).state = state;
    }

    /// Replace the progress object with a fresh one nobody else completes
    pub fn reset_progress(&self, description: impl Into<String>) -> Arc<Progress> {
        let progress = Progress::new(description);
        let mut inner = lock(&self.inner);
        inner.progress = Some(progress.clone());
        inner.operation = None;
        progress
    }

    /// Start an operation owned by a worker.
    ///
    /// Returns the new progress object and the event through which the
    /// session reports how the guest ended the operation. The worker must
    /// call [`finish_operation`](Self::finish_operation) before completing
    /// the progress.
    pub fn start_operation(
        &self,
        description: impl Into<String>,
    ) -> (Arc<Progress>, Arc<CallbackEvent>) {
        let progress = Progress::new(description);
        let event = Arc::new(CallbackEvent::new());
        let mut inner = lock(&self.inner);
        inner.progress = Some(progress.clone());
        inner.operation = Some(event.clone());
        (progress, event)
    }

    /// Detach `event` if it still belongs to the current operation
    pub fn finish_operation(&self, event: &Arc<CallbackEvent>) {
        let mut inner = lock(&self.inner);
        if inner
            .operation
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, event))
        {
            inner.operation = None;
        }
    }

    /// Current progress object
    pub fn progress(&self) -> Option<Arc<Progress>> {
        lock(&self.inner).progress.clone()
    }

    /// Check whether an operation is running
    pub fn is_progress_running(&self) -> bool {
        self.progress().is_some_and(|p| !p.is_completed())
    }

    /// Drop any pending guest response before issuing a new request
    pub fn reset_guest_response(&self) {
        while let Ok(permit) = self.response.try_acquire() {
            permit.forget();
        }
        lock(&self.inner).last_guest_rc = GuestRc::SUCCESS;
    }

    /// Record the guest status and release one waiter
    pub fn notify_about_guest_response(&self, rc: GuestRc) {
        lock(&self.inner).last_guest_rc = rc;
        self.response.add_permits(1);
    }

    /// Wait for exactly one guest acknowledgement.
    ///
    /// Uses the configured acknowledgement timeout when `timeout` is `None`.
    /// A failure status from the guest becomes [`DndError::Guest`].
    pub async fn wait_for_guest_response(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.timeouts.ack_timeout());

        match tokio::time::timeout(timeout, self.response.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                let rc = lock(&self.inner).last_guest_rc;
                if rc.is_failure() {
                    Err(DndError::guest(rc))
                } else {
                    Ok(())
                }
            },
            Ok(Err(_)) => Err(DndError::InvalidState("response semaphore closed".to_string())),
            Err(_) => Err(DndError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Register `callback` for each of `kinds`.
    ///
    /// Fails if a kind is core or already has a handler; nothing is
    /// registered in that case. Handlers stay registered until the returned
    /// guard is dropped.
    pub fn register_callbacks(
        self: &Arc<Self>,
        kinds: &[MessageKind],
        callback: DispatchCallback,
    ) -> Result<CallbackRegistration> {
        let mut callbacks = lock(&self.callbacks);

        for kind in kinds {
            if kind.is_core() {
                return Err(DndError::InvalidParameter(format!(
                    "{kind:?} is handled by the session itself"
                )));
            }
            if callbacks.contains_key(kind) {
                return Err(DndError::InvalidState(format!(
                    "handler for {kind:?} already registered"
                )));
            }
        }
        for kind in kinds {
            callbacks.insert(*kind, callback.clone());
        }

        Ok(CallbackRegistration {
            state: Arc::downgrade(self),
            kinds: kinds.to_vec(),
        })
    }

    /// Check whether a handler is registered for `kind`
    pub fn has_callback(&self, kind: MessageKind) -> bool {
        lock(&self.callbacks).contains_key(&kind)
    }

    fn unregister(&self, kinds: &[MessageKind]) {
        let mut callbacks = lock(&self.callbacks);
        for kind in kinds {
            callbacks.remove(kind);
        }
    }

    /// Reset negotiation fields, keeping the protocol version and progress
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.state = SessionState::Unknown;
        inner.default_action = DndAction::Ignore;
        inner.allowed_actions = ActionSet::NONE;
        inner.formats = FormatList::new();
        inner.requested_formats = FormatList::new();
    }

    /// Negotiated protocol version
    pub fn protocol_version(&self) -> u32 {
        lock(&self.inner).protocol_version
    }

    /// Guest feature flags
    pub fn guest_features(&self) -> u64 {
        lock(&self.inner).guest_features
    }

    /// Current negotiation state
    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    /// Set the negotiation state
    pub fn set_state(&self, state: SessionState) {
        lock(&self.inner).state = state;
    }

    /// Default action (last acknowledged by the guest or set by the host)
    pub fn default_action(&self) -> DndAction {
        lock(&self.inner).default_action
    }

    /// Allowed actions
    pub fn allowed_actions(&self) -> ActionSet {
        lock(&self.inner).allowed_actions
    }

    /// Set default and allowed actions
    pub fn set_actions(&self, default_action: DndAction, allowed: ActionSet) {
        let mut inner = lock(&self.inner);
        inner.default_action = default_action;
        inner.allowed_actions = allowed;
    }

    /// Offered formats for the current operation
    pub fn formats(&self) -> FormatList {
        lock(&self.inner).formats.clone()
    }

    /// Set offered formats
    pub fn set_formats(&self, formats: FormatList) {
        lock(&self.inner).formats = formats;
    }

    /// Formats the guest asked for after a drop
    pub fn requested_formats(&self) -> FormatList {
        lock(&self.inner).requested_formats.clone()
    }

    /// Replace the requested formats
    pub fn set_requested_formats(&self, formats: FormatList) {
        lock(&self.inner).requested_formats = formats;
    }

    /// Timeouts in effect
    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }
}

/// Keeps dispatch callbacks registered until dropped
#[derive(Debug)]
pub struct CallbackRegistration {
    state: Weak<DndState>,
    kinds: Vec<MessageKind>,
}

impl Drop for CallbackRegistration {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.unregister(&self.kinds);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn state() -> Arc<DndState> {
        Arc::new(DndState::new(TimeoutConfig::default()))
    }

    #[test]
    fn test_connect_negotiates_version() {
        let state = state();
        state
            .on_dispatch(&GuestMessage::Connect {
                protocol_version: 2,
                flags: 0,
            })
            .unwrap();
        assert_eq!(state.protocol_version(), 2);

        state
            .on_dispatch(&GuestMessage::Connect {
                protocol_version: 9,
                flags: 0,
            })
            .unwrap();
        assert_eq!(state.protocol_version(), PROTOCOL_VERSION);
    }

    #[test]
    fn test_default_handler_without_progress() {
        let state = state();
        let poll = GuestMessage::GetNextHostMessage {
            expected: None,
            param_count: None,
        };
        assert!(matches!(state.on_dispatch(&poll), Err(DndError::NotAvailable)));

        let stray = GuestMessage::GhError {
            rc: GuestRc::ACCESS_DENIED,
        };
        assert!(matches!(state.on_dispatch(&stray), Err(DndError::Cancelled)));
    }

    #[test]
    fn test_guest_error_fails_running_progress() {
        let state = state();
        let progress = state.reset_progress("test");
        state
            .on_dispatch(&GuestMessage::GhError {
                rc: GuestRc::ACCESS_DENIED,
            })
            .unwrap();
        match progress.outcome() {
            Some(ProgressOutcome::Failed { rc, .. }) => assert_eq!(rc, GuestRc::ACCESS_DENIED),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_guest_error_wakes_worker() {
        let state = state();
        let (progress, event) = state.start_operation("test");
        state
            .on_dispatch(&GuestMessage::GhError {
                rc: GuestRc::ACCESS_DENIED,
            })
            .unwrap();

        // The worker owns completion; the session only signals it.
        assert!(!progress.is_completed());
        assert!(state.is_progress_running());
        match event.wait(Duration::from_millis(10)).await {
            Some(Err(DndError::Guest { rc, .. })) => assert_eq!(rc, GuestRc::ACCESS_DENIED),
            other => panic!("unexpected {other:?}"),
        }

        state.finish_operation(&event);
        state.set_progress(0, ProgressState::Cancelled, GuestRc::SUCCESS, None);
        assert_eq!(progress.outcome(), Some(ProgressOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_disconnect_wakes_worker() {
        let state = state();
        let (progress, event) = state.start_operation("test");
        state.on_dispatch(&GuestMessage::Disconnect).unwrap();

        assert!(!progress.is_completed());
        assert!(matches!(
            event.wait(Duration::from_millis(10)).await,
            Some(Err(DndError::Cancelled))
        ));
    }

    #[test]
    fn test_stale_operation_not_detached() {
        let state = state();
        let (_, old) = state.start_operation("old");
        let (progress, current) = state.start_operation("new");
        state.finish_operation(&old);

        state.set_progress(100, ProgressState::Complete, GuestRc::SUCCESS, None);
        assert!(current.is_signalled());
        assert!(!progress.is_completed());
    }

    #[test]
    fn test_registered_callback_receives_message() {
        let state = state();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let guard = state
            .register_callbacks(
                &[MessageKind::GhSendData],
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        let msg = GuestMessage::Transfer(crate::protocol::TransferMessage::Data {
            context_id: 0,
            data: vec![1],
            total_bytes: None,
        });
        state.on_dispatch(&msg).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(guard);
        assert!(!state.has_callback(MessageKind::GhSendData));
        assert!(matches!(state.on_dispatch(&msg), Err(DndError::Cancelled)));
    }

    #[test]
    fn test_duplicate_and_core_registration_rejected() {
        let state = state();
        let cb: DispatchCallback = Arc::new(|_| Ok(()));
        let _guard = state
            .register_callbacks(&[MessageKind::GhSendDirectory], cb.clone())
            .unwrap();
        assert!(state
            .register_callbacks(&[MessageKind::GhSendDirectory], cb.clone())
            .is_err());
        assert!(state
            .register_callbacks(&[MessageKind::Connect], cb)
            .is_err());
    }

    #[test]
    fn test_progress_status_mapping() {
        let state = state();
        let progress = state.reset_progress("test");
        state.set_progress(50, ProgressState::Running, GuestRc::SUCCESS, None);
        assert_eq!(progress.percent(), 50);
        state.set_progress(0, ProgressState::Cancelled, GuestRc::SUCCESS, None);
        assert_eq!(progress.outcome(), Some(ProgressOutcome::Cancelled));
        assert_eq!(progress.percent(), 100);
        assert_eq!(state.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_for_guest_response() {
        let state = state();
        state.reset_guest_response();
        state
            .on_dispatch(&GuestMessage::HgAckAction {
                action: DndAction::Move,
            })
            .unwrap();
        state.wait_for_guest_response(None).await.unwrap();
        assert_eq!(state.default_action(), DndAction::Move);

        let result = state
            .wait_for_guest_response(Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(result, Err(DndError::Timeout(10))));
    }

    #[tokio::test]
    async fn test_guest_failure_status_surfaces() {
        let state = state();
        state.reset_progress("test");
        state.reset_guest_response();
        state
            .on_dispatch(&GuestMessage::HgProgress {
                status: ProgressState::Error,
                percent: 0,
                rc: GuestRc::SHARING_VIOLATION,
            })
            .unwrap();
        match state.wait_for_guest_response(None).await {
            Err(DndError::Guest { rc, .. }) => assert_eq!(rc, GuestRc::SHARING_VIOLATION),
            other => panic!("unexpected {other:?}"),
        }
    }
}
