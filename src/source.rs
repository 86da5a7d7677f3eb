//! Guest → host drag source.
//!
//! ```text
//! Idle ──drag_is_pending──> QueryPending ──drop──> Receiving{Raw | TransferList}
//!                                                        │
//!                                   Complete | Cancelled | Error
//! ```
//!
//! A drop spawns one worker task that registers receive callbacks, asks the
//! guest to send via `GhDropped`, and waits for the transfer to finish. File
//! transfers land in a fresh staging directory which is rolled back on any
//! failure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{DndError, Result};
use crate::manager::{DndManager, PendingTransfer};
use crate::protocol::{
    is_text_format, is_uri_list_format, ActionSet, DndAction, FormatList, GuestMessage,
    HostMessage, MessageKind, FORMATS_SEPARATOR, MIME_URI_LIST,
};
use crate::session::{
    lock, wait_for_event, CallbackEvent, DispatchCallback, Progress, ProgressOutcome,
    SessionState,
};
use crate::transfer::{encode_uri_list, DroppedFiles, ReceiveContext};

const RECEIVE_KINDS: [MessageKind; 5] = [
    MessageKind::GhSendDataHeader,
    MessageKind::GhSendData,
    MessageKind::GhSendDirectory,
    MessageKind::GhSendFileHeader,
    MessageKind::GhSendFileData,
];

/// Result of a "drag pending?" query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingDrag {
    /// Action the guest proposes; `Ignore` when nothing is pending
    pub default_action: DndAction,
    /// Actions the guest allows
    pub allowed: ActionSet,
    /// Guest formats the host can take
    pub formats: FormatList,
}

impl PendingDrag {
    /// Nothing to drop
    pub fn ignore() -> Self {
        Self::default()
    }

    /// Check whether a drag is pending
    pub fn is_pending(&self) -> bool {
        self.default_action != DndAction::Ignore && !self.formats.is_empty()
    }
}

#[derive(Debug)]
enum Received {
    Raw(Vec<u8>),
    Files { roots: Vec<PathBuf>, as_text: bool },
}

#[derive(Debug)]
struct DropPlan {
    format: String,
    action: DndAction,
    as_text: bool,
}

struct SourceShared {
    manager: Arc<DndManager>,
    host_formats: FormatList,
    in_flight: AtomicBool,
    pending: Mutex<PendingDrag>,
    progress: Mutex<Option<Arc<Progress>>>,
    event: Mutex<Option<Arc<CallbackEvent>>>,
    received: Mutex<Option<Received>>,
}

/// Receives data dragged from the guest onto the host
pub struct Source {
    shared: Arc<SourceShared>,
    id: u64,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("in_flight", &self.shared.in_flight.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Source {
    /// Create a source using the host's default format set
    pub fn new(manager: &Arc<DndManager>) -> Self {
        Self::with_host_formats(manager, FormatList::host_supported())
    }

    /// Create a source accepting only `host_formats`
    pub fn with_host_formats(manager: &Arc<DndManager>, host_formats: FormatList) -> Self {
        let id = manager.register_source();
        Self {
            shared: Arc::new(SourceShared {
                manager: manager.clone(),
                host_formats,
                in_flight: AtomicBool::new(false),
                pending: Mutex::new(PendingDrag::ignore()),
                progress: Mutex::new(None),
                event: Mutex::new(None),
                received: Mutex::new(None),
            }),
            id,
        }
    }

    /// Ask the guest whether a drag is pending on `screen_id`.
    ///
    /// A missing reply, an ignored action, or no common format all yield
    /// [`PendingDrag::ignore`]; none of them is an error.
    pub async fn drag_is_pending(&self, screen_id: u32) -> Result<PendingDrag> {
        if self.shared.in_flight.load(Ordering::SeqCst) {
            tracing::debug!("transfer active, not querying guest");
            return Ok(PendingDrag::ignore());
        }

        let manager = &self.shared.manager;
        let state = manager.state();
        state.reset_guest_response();
        manager.host_call(HostMessage::GhRequestPending { screen_id })?;

        match state
            .wait_for_guest_response(Some(state.timeouts().pending_check()))
            .await
        {
            Ok(()) => {},
            Err(DndError::Timeout(_)) => {
                tracing::trace!(screen_id, "no pending drag reported");
                return Ok(self.store_pending(PendingDrag::ignore()));
            },
            Err(e) => return Err(e),
        }

        let offered = state.formats();
        let formats = offered.intersect(&self.shared.host_formats);
        if formats.is_empty() {
            if offered.is_x11_housekeeping_only() {
                tracing::debug!(%offered, "guest only offered X11 housekeeping targets");
            } else if !offered.is_empty() {
                tracing::warn!(%offered, "guest offers no format the host supports");
            }
            state.reset();
            return Ok(self.store_pending(PendingDrag::ignore()));
        }

        let allowed = state.allowed_actions();
        let default_action = allowed.resolve(state.default_action());
        tracing::debug!(%formats, %default_action, "guest drag pending");

        Ok(self.store_pending(PendingDrag {
            default_action,
            allowed,
            formats,
        }))
    }

    fn store_pending(&self, pending: PendingDrag) -> PendingDrag {
        *lock(&self.shared.pending) = pending.clone();
        pending
    }

    /// Start receiving `format` from the guest.
    ///
    /// Returns immediately with the operation's progress object. A text
    /// request against a guest that only offers files is received as a
    /// transfer list; [`receive_data`](Self::receive_data) then yields the
    /// local paths.
    pub fn drop(&self, format: &str, action: DndAction) -> Result<Arc<Progress>> {
        let manager = &self.shared.manager;
        if manager.source_count() > 1 {
            return Err(DndError::AlreadyInProgress);
        }
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DndError::AlreadyInProgress);
        }

        let started = self.resolve(format, action).and_then(|plan| {
            let handle = tokio::runtime::Handle::try_current()
                .map_err(|e| DndError::InvalidState(format!("no async runtime: {e}")))?;
            Ok((plan, handle))
        });
        let (plan, handle) = match started {
            Ok(started) => started,
            Err(e) => {
                self.shared.in_flight.store(false, Ordering::SeqCst);
                return Err(e);
            },
        };

        let state = manager.state();
        let (progress, event) =
            state.start_operation(format!("Dropping {} to host", plan.format));
        state.set_state(SessionState::DropStarted);
        *lock(&self.shared.progress) = Some(progress.clone());
        *lock(&self.shared.event) = Some(event.clone());
        *lock(&self.shared.received) = None;

        tracing::info!(
            format = %plan.format,
            action = %plan.action,
            as_text = plan.as_text,
            "guest drop started"
        );
        let pending = manager.begin_transfer();
        let shared = self.shared.clone();
        let worker_progress = progress.clone();
        handle.spawn(async move { shared.run(plan, worker_progress, event, pending).await });

        Ok(progress)
    }

    fn resolve(&self, format: &str, action: DndAction) -> Result<DropPlan> {
        let pending = lock(&self.shared.pending).clone();

        let (format, as_text) = if pending.formats.contains(format) {
            (format.to_string(), false)
        } else if is_text_format(format) && pending.formats.contains_uri_list() {
            tracing::debug!(requested = format, "guest only offers files, receiving as URI list");
            (MIME_URI_LIST.to_string(), true)
        } else {
            return Err(DndError::NotSupported(format!(
                "guest does not offer {format} (offered: {})",
                pending.formats
            )));
        };

        let action = pending.allowed.resolve(action);
        if action == DndAction::Ignore {
            return Err(DndError::InvalidParameter(
                "no drop action allowed by the guest".to_string(),
            ));
        }

        Ok(DropPlan {
            format,
            action,
            as_text,
        })
    }

    /// Data received by the last completed drop.
    ///
    /// Raw formats return the bytes. File transfers return a `text/uri-list`
    /// of the local root paths, or the plain paths when text was requested.
    pub fn receive_data(&self) -> Vec<u8> {
        match &*lock(&self.shared.received) {
            None => Vec::new(),
            Some(Received::Raw(data)) => data.clone(),
            Some(Received::Files { roots, as_text }) => {
                let paths: Vec<String> = roots
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect();
                if *as_text {
                    paths.join(FORMATS_SEPARATOR).into_bytes()
                } else {
                    encode_uri_list(paths.iter().map(String::as_str)).into_bytes()
                }
            },
        }
    }

    /// Local root paths of the last completed file transfer
    pub fn received_files(&self) -> Vec<PathBuf> {
        match &*lock(&self.shared.received) {
            Some(Received::Files { roots, .. }) => roots.clone(),
            _ => Vec::new(),
        }
    }

    /// Check whether the last drop completed successfully
    pub fn is_complete(&self) -> bool {
        lock(&self.shared.progress)
            .as_ref()
            .is_some_and(|p| p.outcome() == Some(ProgressOutcome::Success))
    }

    /// Check whether a drop is running
    pub fn is_pending(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Ask the guest to abort the running drop.
    ///
    /// Sends `Cancel` at most once per operation and wakes the worker, which
    /// rolls back and finishes the progress as cancelled.
    pub fn cancel(&self) -> Result<()> {
        let Some(progress) = lock(&self.shared.progress).clone() else {
            return Ok(());
        };
        if progress.is_completed() || !progress.cancel() {
            return Ok(());
        }

        tracing::info!("cancelling guest drop");
        let sent = self.shared.manager.host_call(HostMessage::Cancel);
        if let Some(event) = lock(&self.shared.event).clone() {
            event.notify(Err(DndError::Cancelled));
        }
        sent
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.shared.manager.unregister_source(self.id);
    }
}

impl SourceShared {
    async fn run(
        self: Arc<Self>,
        plan: DropPlan,
        progress: Arc<Progress>,
        event: Arc<CallbackEvent>,
        pending: PendingTransfer,
    ) {
        let state = self.manager.state().clone();

        let outcome = match self.receive(&plan, &progress, &event).await {
            Ok(received) => {
                tracing::info!(format = %plan.format, "guest drop complete");
                *lock(&self.received) = Some(received);
                state.set_state(SessionState::DropEnded);
                ProgressOutcome::Success
            },
            Err(DndError::Cancelled) => {
                tracing::info!("guest drop cancelled");
                state.set_state(SessionState::Cancelled);
                ProgressOutcome::Cancelled
            },
            Err(e) => {
                tracing::error!(error = %e, "guest drop failed");
                if !e.is_guest_error() && progress.cancel() {
                    if let Err(send_err) = self.manager.host_call(HostMessage::Cancel) {
                        tracing::warn!(error = %send_err, "could not tell guest to cancel");
                    }
                }
                state.set_state(SessionState::Error);
                ProgressOutcome::Failed {
                    rc: e.rc(),
                    message: e.to_string(),
                }
            },
        };

        *lock(&self.event) = None;
        state.finish_operation(&event);
        self.in_flight.store(false, Ordering::SeqCst);
        drop(pending);
        progress.complete(outcome);
    }

    async fn receive(
        &self,
        plan: &DropPlan,
        progress: &Arc<Progress>,
        event: &Arc<CallbackEvent>,
    ) -> Result<Received> {
        let config = self.manager.config();
        let state = self.manager.state();

        let staging = if is_uri_list_format(&plan.format) {
            Some(DroppedFiles::open(&config.transfer.staging_dir)?)
        } else {
            None
        };
        let ctx = Arc::new(Mutex::new(ReceiveContext::new(
            state.protocol_version(),
            config.transfer.block_size,
            config.transfer.max_meta_size,
            plan.format.clone(),
            staging,
        )?));

        if progress.is_cancel_requested() {
            return Err(DndError::Cancelled);
        }

        let registration = state.register_callbacks(
            &RECEIVE_KINDS,
            receive_callback(ctx.clone(), event.clone(), progress.clone()),
        )?;

        let result = match self.manager.host_call(HostMessage::GhDropped {
            format: plan.format.clone(),
            action: plan.action,
        }) {
            Ok(()) => {
                wait_for_event(
                    event,
                    progress,
                    state.timeouts().poll_slice(),
                    state.timeouts().transfer_timeout(),
                )
                .await
            },
            Err(e) => Err(e),
        };
        drop(registration);

        let mut ctx = lock(&ctx);
        let finished = result.and_then(|()| ctx.commit());
        if let Err(e) = finished {
            if let Err(rollback_err) = ctx.rollback() {
                tracing::warn!(error = %rollback_err, "rollback incomplete");
            }
            return Err(e);
        }

        Ok(if ctx.is_file_transfer() {
            Received::Files {
                roots: ctx.root_paths(),
                as_text: plan.as_text,
            }
        } else {
            Received::Raw(ctx.take_data())
        })
    }
}

fn receive_callback(
    ctx: Arc<Mutex<ReceiveContext>>,
    event: Arc<CallbackEvent>,
    progress: Arc<Progress>,
) -> DispatchCallback {
    Arc::new(move |msg: &GuestMessage| {
        let GuestMessage::Transfer(transfer) = msg else {
            return Err(DndError::Protocol(format!(
                "unexpected {:?} during receive",
                msg.kind()
            )));
        };

        let applied = {
            let mut ctx = lock(&ctx);
            match ctx.apply(transfer) {
                Ok(done) => Ok((done, ctx.percent_complete())),
                Err(e) => Err(e),
            }
        };

        match applied {
            Ok((done, percent)) => {
                progress.set_percent(percent.min(99));
                if done {
                    event.notify(Ok(()));
                }
                Ok(())
            },
            Err(e) => {
                tracing::warn!(kind = ?msg.kind(), error = %e, "rejected guest data");
                let reply = e.duplicate();
                event.notify(Err(e));
                Err(reply)
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::HostCall;

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
    fn test_ignore_is_not_pending() {
        let pending = PendingDrag::ignore();
        assert!(!pending.is_pending());
        assert_eq!(pending.default_action, DndAction::Ignore);
    }

    #[test]
    fn test_drop_needs_offered_format() {
        let mgr = manager();
        let source = Source::new(&mgr);
        assert!(matches!(
            source.drop(MIME_URI_LIST, DndAction::Copy),
            Err(DndError::NotSupported(_))
        ));
        assert!(!source.is_pending());
        assert!(source.receive_data().is_empty());
    }

    #[test]
    fn test_drop_needs_runtime() {
        let mgr = manager();
        let source = Source::new(&mgr);
        *lock(&source.shared.pending) = PendingDrag {
            default_action: DndAction::Copy,
            allowed: [DndAction::Copy].into_iter().collect(),
            formats: [MIME_URI_LIST].into_iter().collect(),
        };

        assert!(matches!(
            source.drop(MIME_URI_LIST, DndAction::Copy),
            Err(DndError::InvalidState(_))
        ));
        assert!(!source.is_pending());
        assert_eq!(mgr.pending_transfers(), 0);
    }

    #[test]
    fn test_resolve_text_from_files() {
        let mgr = manager();
        let source = Source::new(&mgr);
        *lock(&source.shared.pending) = PendingDrag {
            default_action: DndAction::Move,
            allowed: [DndAction::Move].into_iter().collect(),
            formats: [MIME_URI_LIST].into_iter().collect(),
        };

        let plan = source.resolve("text/plain", DndAction::Copy).unwrap();
        assert_eq!(plan.format, MIME_URI_LIST);
        assert!(plan.as_text);
        assert_eq!(plan.action, DndAction::Move);
    }

    #[test]
    fn test_unregisters_on_drop() {
        let mgr = manager();
        let source = Source::new(&mgr);
        assert_eq!(mgr.source_count(), 1);
        drop(source);
        assert_eq!(mgr.source_count(), 0);
    }
}
