//! In-process guest for the CLI and tests.
//!
//! The guest runs on its own thread and reacts to host messages the way a
//! guest-side DnD service would: it acknowledges enter/move/drop, answers
//! "drag pending?" queries from its [`GuestOffer`], receives host transfers
//! into a staging directory (polling `GetNextHostMessage` after each
//! message), and pushes its offer to the host on `GhDropped`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::HostCall;
use crate::config::{DEFAULT_BLOCK_SIZE, MAX_META_SIZE};
use crate::error::{DndError, GuestRc, Result};
use crate::manager::DndManager;
use crate::protocol::{
    is_uri_list_format, ActionSet, DndAction, DragEvent, FormatList, GuestMessage, HostMessage,
    ProgressState, MIME_TEXT_PLAIN, MIME_URI_LIST, PROTOCOL_VERSION,
};
use crate::session::lock;
use crate::transfer::{DroppedFiles, ReceiveContext, SendContext, TransferList};

/// Data the guest has ready to drag onto the host
#[derive(Debug, Clone, Default)]
pub struct GuestOffer {
    /// Proposed action
    pub default_action: DndAction,
    /// Allowed actions
    pub allowed: ActionSet,
    /// Offered formats
    pub formats: FormatList,
    /// Raw payload for non-file formats
    pub data: Vec<u8>,
    /// Local paths for `text/uri-list`
    pub paths: Vec<PathBuf>,
}

impl GuestOffer {
    /// Offer `data` in a single raw `format`
    pub fn raw(format: &str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            default_action: DndAction::Copy,
            allowed: [DndAction::Copy, DndAction::Move].into_iter().collect(),
            formats: [format].into_iter().collect(),
            data: data.into(),
            paths: Vec::new(),
        }
    }

    /// Offer plain text
    pub fn text(text: &str) -> Self {
        Self::raw(MIME_TEXT_PLAIN, text.as_bytes())
    }

    /// Offer files and directories as `text/uri-list`
    pub fn files(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            default_action: DndAction::Copy,
            allowed: [DndAction::Copy, DndAction::Move].into_iter().collect(),
            formats: [MIME_URI_LIST].into_iter().collect(),
            data: Vec::new(),
            paths: paths.into_iter().collect(),
        }
    }
}

/// Guest behaviour knobs
#[derive(Debug, Clone)]
pub struct GuestOptions {
    /// Protocol version reported on connect
    pub protocol_version: u32,
    /// Chunk size for guest → host sends
    pub block_size: usize,
    /// Formats the guest accepts from the host, in preference order
    pub accept_formats: FormatList,
    /// Where host → guest file transfers land
    pub drop_dir: PathBuf,
    /// Feature flags reported on connect
    pub features: u64,
}

impl Default for GuestOptions {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            block_size: DEFAULT_BLOCK_SIZE,
            accept_formats: [MIME_URI_LIST, MIME_TEXT_PLAIN].into_iter().collect(),
            drop_dir: std::env::temp_dir().join("dnd-loopback-guest"),
            features: 0,
        }
    }
}

impl GuestOptions {
    /// Set the protocol version
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Set the send chunk size
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set accepted formats
    pub fn with_accept_formats(mut self, formats: FormatList) -> Self {
        self.accept_formats = formats;
        self
    }

    /// Set the drop directory
    pub fn with_drop_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.drop_dir = dir.into();
        self
    }
}

/// Counters observed by the guest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestStats {
    /// Host messages handled
    pub messages: u64,
    /// Action acknowledgements sent
    pub acks: u64,
    /// Cancel messages received
    pub cancels: u64,
    /// Host → guest transfers completed
    pub transfers_received: u64,
    /// Guest → host transfers completed
    pub transfers_sent: u64,
    /// Last status the host answered a guest message with, if it failed
    pub last_host_error: Option<GuestRc>,
}

#[derive(Debug, Default)]
struct Received {
    data: Vec<u8>,
    root: Option<PathBuf>,
    paths: Vec<PathBuf>,
    objects: (u64, u64),
}

struct GuestShared {
    options: GuestOptions,
    manager: Mutex<Weak<DndManager>>,
    offer: Mutex<Option<GuestOffer>>,
    stats: Mutex<GuestStats>,
    receive: Mutex<Option<ReceiveContext>>,
    received: Mutex<Received>,
}

/// In-process guest end of the host-call channel
pub struct LoopbackGuest {
    tx: UnboundedSender<HostMessage>,
    shared: Arc<GuestShared>,
}

impl std::fmt::Debug for LoopbackGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackGuest")
            .field("options", &self.shared.options)
            .field("stats", &*lock(&self.shared.stats))
            .finish_non_exhaustive()
    }
}

impl LoopbackGuest {
    /// Start the guest thread
    pub fn new(options: GuestOptions) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(GuestShared {
            options,
            manager: Mutex::new(Weak::new()),
            offer: Mutex::new(None),
            stats: Mutex::new(GuestStats::default()),
            receive: Mutex::new(None),
            received: Mutex::new(Received::default()),
        });

        let worker = shared.clone();
        thread::Builder::new()
            .name("dnd-loopback-guest".to_string())
            .spawn(move || worker.run(rx))?;

        Ok(Arc::new(Self { tx, shared }))
    }

    /// Connect to `manager`: reports protocol version and features
    pub fn attach(&self, manager: &Arc<DndManager>) -> Result<()> {
        *lock(&self.shared.manager) = Arc::downgrade(manager);
        manager.notify_dispatcher(&GuestMessage::Connect {
            protocol_version: self.shared.options.protocol_version,
            flags: 0,
        })?;
        manager.notify_dispatcher(&GuestMessage::ReportFeatures {
            features: self.shared.options.features,
        })
    }

    /// Tell the host the guest went away
    pub fn disconnect(&self) -> Result<()> {
        let manager = lock(&self.shared.manager).upgrade();
        match manager {
            Some(manager) => manager.notify_dispatcher(&GuestMessage::Disconnect),
            None => Ok(()),
        }
    }

    /// Replace what the guest offers for guest → host drags
    pub fn set_offer(&self, offer: Option<GuestOffer>) {
        *lock(&self.shared.offer) = offer;
    }

    /// Counters so far
    pub fn stats(&self) -> GuestStats {
        lock(&self.shared.stats).clone()
    }

    /// Raw bytes of the last host → guest transfer
    pub fn received_data(&self) -> Vec<u8> {
        lock(&self.shared.received).data.clone()
    }

    /// Staging root of the last host → guest file transfer
    pub fn received_root(&self) -> Option<PathBuf> {
        lock(&self.shared.received).root.clone()
    }

    /// Root paths of the last host → guest file transfer
    pub fn received_paths(&self) -> Vec<PathBuf> {
        lock(&self.shared.received).paths.clone()
    }

    /// Announced and processed object counts of the last file transfer
    pub fn received_objects(&self) -> (u64, u64) {
        lock(&self.shared.received).objects
    }
}

impl HostCall for LoopbackGuest {
    fn host_call(&self, msg: HostMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| DndError::host("loopback guest has stopped"))
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

impl GuestShared {
    fn run(&self, mut rx: UnboundedReceiver<HostMessage>) {
        let mut backlog = VecDeque::new();
        loop {
            let msg = match backlog.pop_front() {
                Some(msg) => msg,
                None => match rx.blocking_recv() {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.handle(msg, &mut rx, &mut backlog);
        }
        tracing::debug!("loopback guest stopped");
    }

    fn dispatch(&self, manager: &DndManager, msg: &GuestMessage) -> Result<()> {
        let result = manager.notify_dispatcher(msg);
        if let Err(e) = &result {
            if !matches!(e, DndError::NotAvailable) {
                lock(&self.stats).last_host_error = Some(e.rc());
            }
            tracing::debug!(kind = ?msg.kind(), error = %e, "host answered with error");
        }
        result
    }

    fn handle(
        &self,
        msg: HostMessage,
        rx: &mut UnboundedReceiver<HostMessage>,
        backlog: &mut VecDeque<HostMessage>,
    ) {
        lock(&self.stats).messages += 1;
        let Some(manager) = lock(&self.manager).upgrade() else {
            tracing::warn!(kind = ?msg.kind(), "guest not attached, dropping message");
            return;
        };
        tracing::trace!(kind = ?msg.kind(), "guest received");

        match msg {
            HostMessage::SetMode { mode } => tracing::debug!(mode, "guest mode set"),
            HostMessage::Enter(ev) | HostMessage::Move(ev) => {
                let action = self.pick_action(&ev);
                lock(&self.stats).acks += 1;
                let _ = self.dispatch(&manager, &GuestMessage::HgAckAction { action });
            },
            HostMessage::Leave => tracing::debug!("host cursor left guest"),
            HostMessage::Drop(ev) => self.on_drop(&manager, &ev),
            HostMessage::Cancel => {
                lock(&self.stats).cancels += 1;
                if let Some(mut ctx) = lock(&self.receive).take() {
                    if let Err(e) = ctx.rollback() {
                        tracing::warn!(error = %e, "guest rollback failed");
                    }
                }
            },
            HostMessage::Transfer(transfer) => self.on_transfer(&manager, &transfer),
            HostMessage::GhRequestPending { screen_id } => {
                let offer = lock(&self.offer).clone().unwrap_or_default();
                tracing::debug!(screen_id, formats = %offer.formats, "answering pending query");
                let _ = self.dispatch(
                    &manager,
                    &GuestMessage::GhAckPending {
                        default_action: offer.default_action,
                        allowed: offer.allowed,
                        formats: offer.formats,
                    },
                );
            },
            HostMessage::GhDropped { format, action } => {
                tracing::debug!(%format, %action, "host accepted guest drop");
                self.send_offer(&manager, &format, rx, backlog);
            },
        }
    }

    fn pick_action(&self, ev: &DragEvent) -> DndAction {
        let usable = ev
            .formats
            .iter()
            .any(|f| self.options.accept_formats.contains(f));
        if usable {
            ev.allowed.resolve(ev.default_action)
        } else {
            DndAction::Ignore
        }
    }

    fn on_drop(&self, manager: &DndManager, ev: &DragEvent) {
        let chosen = self
            .options
            .accept_formats
            .intersect(&ev.formats)
            .first()
            .map(str::to_string);

        if let Some(format) = &chosen {
            match self.open_receive(format) {
                Ok(ctx) => *lock(&self.receive) = Some(ctx),
                Err(e) => {
                    tracing::warn!(error = %e, "guest cannot receive");
                    let _ = self.dispatch(
                        manager,
                        &GuestMessage::HgProgress {
                            status: ProgressState::Error,
                            percent: 0,
                            rc: e.rc(),
                        },
                    );
                    return;
                },
            }
        }

        let requested: FormatList = chosen.into_iter().collect();
        let _ = self.dispatch(
            manager,
            &GuestMessage::HgRequestData {
                formats: requested.to_wire(),
            },
        );
    }

    fn open_receive(&self, format: &str) -> Result<ReceiveContext> {
        let staging = if is_uri_list_format(format) {
            Some(DroppedFiles::open(&self.options.drop_dir)?)
        } else {
            None
        };
        ReceiveContext::new(
            self.options.protocol_version,
            self.options.block_size,
            MAX_META_SIZE,
            format,
            staging,
        )
    }

    fn on_transfer(&self, manager: &DndManager, transfer: &crate::protocol::TransferMessage) {
        let applied = {
            let mut receive = lock(&self.receive);
            match receive.as_mut() {
                Some(ctx) => ctx.apply(transfer).and_then(|done| {
                    if done {
                        ctx.commit()?;
                        let mut received = lock(&self.received);
                        *received = Received {
                            data: ctx.take_data(),
                            root: ctx.staging_root(),
                            paths: ctx.root_paths(),
                            objects: ctx.objects(),
                        };
                    }
                    Ok(done)
                }),
                None => Err(DndError::Protocol("no host drop in progress".to_string())),
            }
        };

        match applied {
            Ok(done) => {
                if done {
                    lock(&self.receive).take();
                    lock(&self.stats).transfers_received += 1;
                    tracing::debug!("guest received host data");
                }
                // The host answers NotAvailable once everything was handed out.
                let _ = self.dispatch(
                    manager,
                    &GuestMessage::GetNextHostMessage {
                        expected: None,
                        param_count: None,
                    },
                );
            },
            Err(e) => {
                tracing::warn!(error = %e, "guest rejected host data");
                if let Some(mut ctx) = lock(&self.receive).take() {
                    if let Err(rb) = ctx.rollback() {
                        tracing::warn!(error = %rb, "guest rollback failed");
                    }
                }
                let _ = self.dispatch(
                    manager,
                    &GuestMessage::HgProgress {
                        status: ProgressState::Error,
                        percent: 0,
                        rc: e.rc(),
                    },
                );
            },
        }
    }

    fn build_send(&self, format: &str) -> Result<SendContext> {
        let offer = lock(&self.offer)
            .clone()
            .ok_or_else(|| DndError::InvalidState("guest has nothing to offer".to_string()))?;
        let version = self.options.protocol_version;
        let block_size = self.options.block_size;

        if is_uri_list_format(format) {
            let list = TransferList::from_paths(&offer.paths)?;
            SendContext::transfer_list(version, block_size, MIME_URI_LIST, list)
        } else if offer.formats.contains(format) {
            SendContext::raw(version, block_size, format, offer.data)
        } else {
            Err(DndError::NotSupported(format!("guest does not offer {format}")))
        }
    }

    fn send_offer(
        &self,
        manager: &DndManager,
        format: &str,
        rx: &mut UnboundedReceiver<HostMessage>,
        backlog: &mut VecDeque<HostMessage>,
    ) {
        let mut ctx = match self.build_send(format) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, "guest cannot send");
                let _ = self.dispatch(manager, &GuestMessage::GhError { rc: e.rc() });
                return;
            },
        };

        loop {
            while let Ok(pending) = rx.try_recv() {
                if matches!(pending, HostMessage::Cancel) {
                    lock(&self.stats).cancels += 1;
                    tracing::debug!("host cancelled guest drop");
                    return;
                }
                backlog.push_back(pending);
            }

            match ctx.next_message() {
                Ok(Some(msg)) => {
                    if self.dispatch(manager, &GuestMessage::Transfer(msg)).is_err() {
                        return;
                    }
                },
                Ok(None) => {
                    lock(&self.stats).transfers_sent += 1;
                    tracing::debug!(format, "guest sent drop data");
                    return;
                },
                Err(e) => {
                    tracing::warn!(error = %e, "guest failed reading drop data");
                    let _ = self.dispatch(manager, &GuestMessage::GhError { rc: e.rc() });
                    return;
                },
            }
        }
    }
}
