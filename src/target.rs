//! Host → guest drop target.
//!
//! `enter`/`move_to`/`leave`/`drop` mirror the host UI events and each wait
//! for one guest acknowledgement. `send_data` spawns a worker that pushes the
//! first transfer message; the guest pulls the rest with
//! `GetNextHostMessage`, so messages are handed out strictly in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{DndError, Result};
use crate::manager::{DndManager, PendingTransfer};
use crate::protocol::{
    is_uri_list_format, ActionSet, DndAction, DragEvent, FormatList, GuestMessage, HostMessage,
    MessageKind, MIME_URI_LIST,
};
use crate::session::{
    lock, wait_for_event, CallbackEvent, DispatchCallback, Progress, ProgressOutcome,
    SessionState,
};
use crate::transfer::{SendContext, TransferList};
use crate::transport::HostCall;

/// Result of a drop on the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropResult {
    /// Format the guest asked for
    pub format: String,
    /// Action in effect
    pub action: DndAction,
}

struct TargetShared {
    manager: Arc<DndManager>,
    in_flight: AtomicBool,
    offsets: Mutex<HashMap<u32, (i32, i32)>>,
    progress: Mutex<Option<Arc<Progress>>>,
    event: Mutex<Option<Arc<CallbackEvent>>>,
}

/// Sends host data to the guest
pub struct Target {
    shared: Arc<TargetShared>,
    id: u64,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("in_flight", &self.shared.in_flight.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Target {
    /// Create a target and register it with `manager`
    pub fn new(manager: &Arc<DndManager>) -> Self {
        let id = manager.register_target();
        Self {
            shared: Arc::new(TargetShared {
                manager: manager.clone(),
                in_flight: AtomicBool::new(false),
                offsets: Mutex::new(HashMap::new()),
                progress: Mutex::new(None),
                event: Mutex::new(None),
            }),
            id,
        }
    }

    /// Set the origin of `screen_id` in the host's virtual desktop
    pub fn set_screen_offset(&self, screen_id: u32, x: i32, y: i32) {
        lock(&self.shared.offsets).insert(screen_id, (x, y));
    }

    fn event(
        &self,
        screen_id: u32,
        x: i32,
        y: i32,
        action: DndAction,
        allowed: ActionSet,
        formats: &FormatList,
    ) -> DragEvent {
        let (dx, dy) = lock(&self.shared.offsets)
            .get(&screen_id)
            .copied()
            .unwrap_or((0, 0));
        DragEvent {
            screen_id,
            x: x.saturating_add(dx),
            y: y.saturating_add(dy),
            default_action: action,
            allowed,
            formats: formats.clone(),
        }
    }

    async fn send_and_ack(&self, msg: HostMessage) -> Result<DndAction> {
        let manager = &self.shared.manager;
        let state = manager.state();
        state.reset_guest_response();
        manager.host_call(msg)?;
        state.wait_for_guest_response(None).await?;
        Ok(state.default_action())
    }

    /// Cursor entered a guest screen; returns the action the guest picked.
    ///
    /// When no allowed action remains this is a no-op returning `Ignore`.
    pub async fn enter(
        &self,
        screen_id: u32,
        x: i32,
        y: i32,
        default_action: DndAction,
        allowed: ActionSet,
        formats: &FormatList,
    ) -> Result<DndAction> {
        let action = allowed.resolve(default_action);
        if action == DndAction::Ignore {
            return Ok(DndAction::Ignore);
        }

        let state = self.shared.manager.state();
        state.set_actions(action, allowed);
        state.set_formats(formats.clone());
        state.set_state(SessionState::Entered);

        let ev = self.event(screen_id, x, y, action, allowed, formats);
        let picked = self.send_and_ack(HostMessage::Enter(ev)).await?;
        tracing::debug!(screen_id, %picked, "guest acknowledged enter");
        Ok(picked)
    }

    /// Cursor moved over a guest screen; returns the action the guest picked
    pub async fn move_to(
        &self,
        screen_id: u32,
        x: i32,
        y: i32,
        default_action: DndAction,
        allowed: ActionSet,
        formats: &FormatList,
    ) -> Result<DndAction> {
        let action = allowed.resolve(default_action);
        if action == DndAction::Ignore {
            return Ok(DndAction::Ignore);
        }

        let ev = self.event(screen_id, x, y, action, allowed, formats);
        self.send_and_ack(HostMessage::Move(ev)).await
    }

    /// Cursor left the guest
    pub fn leave(&self) -> Result<()> {
        let state = self.shared.manager.state();
        let next = match state.state() {
            SessionState::Dragging | SessionState::Entered => SessionState::LeftAfterDrag,
            _ => SessionState::Unknown,
        };
        state.set_state(next);
        self.shared.manager.host_call(HostMessage::Leave)
    }

    /// Data dropped on a guest screen.
    ///
    /// The guest must answer with exactly one format to request.
    pub async fn drop(
        &self,
        screen_id: u32,
        x: i32,
        y: i32,
        default_action: DndAction,
        allowed: ActionSet,
        formats: &FormatList,
    ) -> Result<DropResult> {
        let action = allowed.resolve(default_action);
        if action == DndAction::Ignore {
            return Err(DndError::InvalidParameter("no drop action allowed".to_string()));
        }

        let state = self.shared.manager.state();
        state.set_formats(formats.clone());
        state.set_requested_formats(FormatList::new());
        state.set_state(SessionState::DropStarted);

        let ev = self.event(screen_id, x, y, action, allowed, formats);
        let picked = self.send_and_ack(HostMessage::Drop(ev)).await?;

        let requested = state.requested_formats();
        if requested.len() != 1 {
            tracing::warn!(formats = %requested, "guest requested wrong number of formats");
            return Err(DndError::InvalidGuestFormats(requested.len()));
        }
        let format = requested.first().unwrap_or_default().to_string();
        let action = if picked == DndAction::Ignore {
            action
        } else {
            picked
        };

        tracing::debug!(%format, %action, "guest requested data");
        Ok(DropResult { format, action })
    }

    /// Send `data` in `format` to the guest.
    ///
    /// The wire strategy follows the formats offered on enter/drop: when they
    /// include `text/uri-list`, `data` is a URI list of local paths sent as a
    /// transfer list; otherwise `data` is sent raw.
    pub fn send_data(&self, screen_id: u32, format: &str, data: Vec<u8>) -> Result<Arc<Progress>> {
        let manager = &self.shared.manager;
        if manager.target_count() > 1 {
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

        let prepared = self.prepare(screen_id, format, data).and_then(|ctx| {
            let handle = tokio::runtime::Handle::try_current()
                .map_err(|e| DndError::InvalidState(format!("no async runtime: {e}")))?;
            Ok((ctx, handle))
        });
        let (ctx, handle) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.shared.in_flight.store(false, Ordering::SeqCst);
                return Err(e);
            },
        };

        let state = manager.state();
        let (progress, event) =
            state.start_operation(format!("Dropping {} to guest", ctx.format()));
        *lock(&self.shared.progress) = Some(progress.clone());
        *lock(&self.shared.event) = Some(event.clone());

        tracing::info!(
            format = %ctx.format(),
            bytes = ctx.total_bytes(),
            objects = ctx.objects(),
            "host drop started"
        );
        let pending = manager.begin_transfer();
        let shared = self.shared.clone();
        let worker_progress = progress.clone();
        handle.spawn(async move { shared.run(ctx, worker_progress, event, pending).await });

        Ok(progress)
    }

    fn prepare(&self, screen_id: u32, format: &str, data: Vec<u8>) -> Result<SendContext> {
        let manager = &self.shared.manager;
        let state = manager.state();
        let config = &manager.config().transfer;
        let version = state.protocol_version();

        let ctx = if state.formats().contains_uri_list() || is_uri_list_format(format) {
            let list = TransferList::from_uri_list(&String::from_utf8_lossy(&data))?;
            SendContext::transfer_list(version, config.block_size, MIME_URI_LIST, list)?
        } else {
            if data.len() > config.max_meta_size {
                return Err(DndError::BufferOverflow {
                    requested: data.len(),
                    limit: config.max_meta_size,
                });
            }
            SendContext::raw(version, config.block_size, format, data)?
        };
        Ok(ctx.with_screen(screen_id))
    }

    /// Check whether the last send completed successfully
    pub fn is_complete(&self) -> bool {
        lock(&self.shared.progress)
            .as_ref()
            .is_some_and(|p| p.outcome() == Some(ProgressOutcome::Success))
    }

    /// Check whether a send is running
    pub fn is_pending(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Ask the guest to abort the running send.
    ///
    /// `Cancel` goes out exactly once; nothing waits for the guest to
    /// acknowledge it.
    pub fn cancel(&self) -> Result<()> {
        let Some(progress) = lock(&self.shared.progress).clone() else {
            return Ok(());
        };
        if progress.is_completed() || !progress.cancel() {
            return Ok(());
        }

        tracing::info!("cancelling host drop");
        let sent = self.shared.manager.host_call(HostMessage::Cancel);
        if let Some(event) = lock(&self.shared.event).clone() {
            event.notify(Err(DndError::Cancelled));
        }
        sent
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        self.shared.manager.unregister_target(self.id);
    }
}

impl TargetShared {
    async fn run(
        self: Arc<Self>,
        ctx: SendContext,
        progress: Arc<Progress>,
        event: Arc<CallbackEvent>,
        pending: PendingTransfer,
    ) {
        let state = self.manager.state().clone();

        let outcome = match self.send(ctx, &progress, &event).await {
            Ok(()) => {
                tracing::info!("host drop complete");
                state.set_state(SessionState::DropEnded);
                ProgressOutcome::Success
            },
            Err(DndError::Cancelled) => {
                tracing::info!("host drop cancelled");
                state.set_state(SessionState::Cancelled);
                ProgressOutcome::Cancelled
            },
            Err(e) => {
                tracing::error!(error = %e, "host drop failed");
                if progress.cancel() {
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

    async fn send(
        &self,
        ctx: SendContext,
        progress: &Arc<Progress>,
        event: &Arc<CallbackEvent>,
    ) -> Result<()> {
        let state = self.manager.state();
        let ctx = Arc::new(Mutex::new(ctx));
        if progress.is_cancel_requested() {
            return Err(DndError::Cancelled);
        }

        let transport = self.manager.transport().clone();
        let registration = state.register_callbacks(
            &[MessageKind::GetNextHostMessage],
            next_message_callback(ctx.clone(), event.clone(), progress.clone(), transport),
        )?;

        let first = lock(&ctx).next_message();
        let result = match first {
            Ok(Some(msg)) => match self.manager.host_call(HostMessage::Transfer(msg)) {
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
            },
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        drop(registration);
        result
    }
}

fn next_message_callback(
    ctx: Arc<Mutex<SendContext>>,
    event: Arc<CallbackEvent>,
    progress: Arc<Progress>,
    transport: Arc<dyn HostCall>,
) -> DispatchCallback {
    Arc::new(move |msg: &GuestMessage| {
        let GuestMessage::GetNextHostMessage {
            expected,
            param_count,
        } = msg
        else {
            return Err(DndError::Protocol(format!(
                "unexpected {:?} during send",
                msg.kind()
            )));
        };

        let next = {
            let mut ctx = lock(&ctx);
            match ctx.next_for(*expected, *param_count) {
                Ok(next) => Ok((next, ctx.percent_complete())),
                Err(e) => Err(e),
            }
        };

        match next {
            Ok((Some(transfer), percent)) => {
                progress.set_percent(percent.min(99));
                transport.host_call(HostMessage::Transfer(transfer)).map_err(|e| {
                    event.notify(Err(e.duplicate()));
                    e
                })
            },
            Ok((None, _)) => {
                event.notify(Ok(()));
                Err(DndError::NotAvailable)
            },
            Err(e) => {
                tracing::warn!(error = %e, "guest polled out of order");
                event.notify(Err(e.duplicate()));
                Err(e)
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::MIME_TEXT_PLAIN;

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
    fn test_send_needs_runtime() {
        let mgr = manager();
        let target = Target::new(&mgr);
        assert!(matches!(
            target.send_data(0, MIME_TEXT_PLAIN, b"hi".to_vec()),
            Err(DndError::InvalidState(_))
        ));
        assert!(!target.is_pending());
        assert_eq!(mgr.pending_transfers(), 0);
    }

    #[test]
    fn test_uri_list_must_parse() {
        let mgr = manager();
        let target = Target::new(&mgr);
        let err = target
            .prepare(0, MIME_URI_LIST, b"http://example.com/x\r\n".to_vec())
            .unwrap_err();
        assert!(matches!(err, DndError::InvalidParameter(_)));
    }

    #[test]
    fn test_leave_after_drag() {
        let mgr = manager();
        let target = Target::new(&mgr);
        mgr.state().set_state(SessionState::Dragging);
        target.leave().unwrap();
        assert_eq!(mgr.state().state(), SessionState::LeftAfterDrag);
        target.leave().unwrap();
        assert_eq!(mgr.state().state(), SessionState::Unknown);
    }

    #[test]
    fn test_cancel_without_operation() {
        let mgr = manager();
        let target = Target::new(&mgr);
        assert!(target.cancel().is_ok());
        assert!(!target.is_complete());
    }
}
