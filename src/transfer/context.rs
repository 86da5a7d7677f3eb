//! Per-direction transfer contexts.
//!
//! [`ReceiveContext`] applies incoming transfer messages to a meta buffer
//! and, for `text/uri-list` transfers, to a [`DroppedFiles`] staging area.
//! [`SendContext`] produces the outgoing message sequence lazily, one message
//! per request, in strict protocol order:
//!
//! ```text
//! DataHeader (v3+) -> Data* -> { Directory | FileHeader (v2+) FileData* }*
//! ```

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use super::accounting::TransferAccounting;
use super::list::{parse_root_list, ObjectKind, TransferList, TransferObject};
use super::staging::DroppedFiles;
use crate::error::{DndError, Result};
use crate::protocol::{
    is_uri_list_format, DataHeader, FileHeader, LegacyFileInfo, MessageKind, TransferMessage,
    PROTOCOL_VERSION_DATA_HEADER, PROTOCOL_VERSION_FILE_HEADER,
};

#[derive(Debug)]
struct OpenFile {
    rel: String,
    path: PathBuf,
    file: File,
    size: Option<u64>,
    written: u64,
}

/// Receiving side of a transfer
#[derive(Debug)]
pub struct ReceiveContext {
    protocol_version: u32,
    block_size: usize,
    format: String,
    accounting: TransferAccounting,
    list: TransferList,
    staging: Option<DroppedFiles>,
    current: Option<OpenFile>,
    announced: bool,
    roots: Vec<String>,
}

impl ReceiveContext {
    /// Create a context for `format`.
    ///
    /// `staging` is required for `text/uri-list` transfers and ignored
    /// otherwise.
    pub fn new(
        protocol_version: u32,
        block_size: usize,
        max_meta_size: usize,
        format: impl Into<String>,
        staging: Option<DroppedFiles>,
    ) -> Result<Self> {
        let format = format.into();
        let staging = if is_uri_list_format(&format) {
            Some(staging.ok_or_else(|| {
                DndError::InvalidState("file transfer needs a staging directory".to_string())
            })?)
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            block_size,
            format,
            accounting: TransferAccounting::new(max_meta_size),
            list: TransferList::for_receive_unbounded(),
            staging,
            current: None,
            announced: false,
            roots: Vec::new(),
        })
    }

    /// Format being received
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Whether this is a file transfer
    pub fn is_file_transfer(&self) -> bool {
        self.staging.is_some()
    }

    /// Apply one message. Returns `true` once the transfer is complete.
    pub fn apply(&mut self, msg: &TransferMessage) -> Result<bool> {
        match msg {
            TransferMessage::DataHeader(header) => self.on_data_header(header)?,
            TransferMessage::Data {
                data, total_bytes, ..
            } => self.on_data(data, *total_bytes)?,
            TransferMessage::Directory { path, mode, .. } => self.on_directory(path, *mode)?,
            TransferMessage::FileHeader(header) => self.on_file_header(header)?,
            TransferMessage::FileData { data, legacy, .. } => {
                self.on_file_data(data, legacy.as_ref())?;
            },
        }
        Ok(self.is_complete())
    }

    fn on_data_header(&mut self, header: &DataHeader) -> Result<()> {
        if self.announced {
            return Err(DndError::Protocol("duplicate data header".to_string()));
        }
        if header.total_bytes < header.meta_bytes {
            return Err(DndError::InvalidParameter(format!(
                "total size {} smaller than meta size {}",
                header.total_bytes, header.meta_bytes
            )));
        }
        if !self.is_file_transfer() && header.objects != 0 {
            return Err(DndError::InvalidParameter(format!(
                "{} objects announced for raw format {}",
                header.objects, self.format
            )));
        }

        self.accounting
            .announce(header.meta_bytes, header.total_bytes - header.meta_bytes)?;
        if self.is_file_transfer() {
            self.list = TransferList::for_receive(header.objects);
        }
        self.announced = true;
        tracing::debug!(
            total = header.total_bytes,
            meta = header.meta_bytes,
            objects = header.objects,
            format = %header.meta_format,
            "data header received"
        );
        Ok(())
    }

    fn on_data(&mut self, data: &[u8], total_bytes: Option<u64>) -> Result<()> {
        if data.len() > self.block_size {
            return Err(DndError::InvalidParameter(format!(
                "chunk of {} bytes exceeds block size {}",
                data.len(),
                self.block_size
            )));
        }

        if !self.announced {
            // Peers below v3 send no header: the first body chunk announces sizes.
            let len = data.len() as u64;
            let total = total_bytes.unwrap_or(len);
            if total < len {
                return Err(DndError::InvalidParameter(format!(
                    "total size {total} smaller than chunk of {len} bytes"
                )));
            }
            if self.is_file_transfer() {
                self.accounting.announce(len, total - len)?;
            } else {
                self.accounting.announce(total, 0)?;
            }
            self.announced = true;
        }

        self.accounting.append_meta(data)?;
        if self.accounting.is_meta_complete() && self.is_file_transfer() {
            self.roots = parse_root_list(self.accounting.meta().as_bytes());
            tracing::debug!(roots = self.roots.len(), "root list received");
        }
        Ok(())
    }

    fn staging(&mut self) -> Result<&mut DroppedFiles> {
        let format = &self.format;
        self.staging.as_mut().ok_or_else(|| {
            DndError::Protocol(format!("file entry received for raw format {format}"))
        })
    }

    fn require_meta(&self) -> Result<()> {
        if !self.announced || !self.accounting.is_meta_complete() {
            return Err(DndError::Protocol(
                "object received before the root list".to_string(),
            ));
        }
        Ok(())
    }

    fn on_directory(&mut self, path: &str, mode: u32) -> Result<()> {
        self.require_meta()?;
        self.finish_legacy_file()?;
        if self.current.is_some() {
            return Err(DndError::Protocol(format!(
                "directory {path} received while a file is open"
            )));
        }
        self.list.ensure_capacity()?;
        self.staging()?.add_directory(path, mode)?;
        self.list.mark_processed()
    }

    fn on_file_header(&mut self, header: &FileHeader) -> Result<()> {
        if self.protocol_version < PROTOCOL_VERSION_FILE_HEADER {
            return Err(DndError::Protocol(format!(
                "file header not valid at protocol v{}",
                self.protocol_version
            )));
        }
        self.require_meta()?;
        if self.current.is_some() {
            return Err(DndError::Protocol(format!(
                "file header for {} while another file is open",
                header.path
            )));
        }
        self.list.ensure_capacity()?;

        let (path, file) = self.staging()?.create_file(&header.path, header.mode)?;
        tracing::trace!(path = %header.path, size = header.size, "receiving file");
        if header.size == 0 {
            return self.list.mark_processed();
        }
        self.current = Some(OpenFile {
            rel: header.path.clone(),
            path,
            file,
            size: Some(header.size),
            written: 0,
        });
        Ok(())
    }

    fn on_file_data(&mut self, data: &[u8], legacy: Option<&LegacyFileInfo>) -> Result<()> {
        if data.len() > self.block_size {
            return Err(DndError::InvalidParameter(format!(
                "chunk of {} bytes exceeds block size {}",
                data.len(),
                self.block_size
            )));
        }
        self.require_meta()?;

        if let Some(info) = legacy {
            let same_file = self.current.as_ref().is_some_and(|f| f.rel == info.path);
            if !same_file {
                self.finish_legacy_file()?;
                self.list.ensure_capacity()?;
                let (path, file) = self.staging()?.create_file(&info.path, info.mode)?;
                self.list.mark_processed()?;
                self.current = Some(OpenFile {
                    rel: info.path.clone(),
                    path,
                    file,
                    size: None,
                    written: 0,
                });
            }
        }

        let Some(current) = self.current.as_mut() else {
            return Err(DndError::Protocol("file data without a file header".to_string()));
        };
        let len = data.len() as u64;
        if let Some(size) = current.size {
            if current.written + len > size {
                return Err(DndError::TooMuchData(format!(
                    "{} exceeds its announced size of {size} bytes",
                    current.rel
                )));
            }
        }

        self.accounting.add_processed(len)?;
        current
            .file
            .write_all(data)
            .map_err(|e| DndError::host_io(&e, &current.path))?;
        current.written += len;

        if current.size == Some(current.written) {
            self.close_current()?;
            self.list.mark_processed()?;
        }
        Ok(())
    }

    fn finish_legacy_file(&mut self) -> Result<()> {
        if self.current.as_ref().is_some_and(|f| f.size.is_none()) {
            self.close_current()?;
        }
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(open) = self.current.take() {
            open.file
                .sync_all()
                .map_err(|e| DndError::host_io(&e, &open.path))?;
        }
        Ok(())
    }

    /// Everything announced has arrived
    pub fn is_complete(&self) -> bool {
        self.announced
            && self.accounting.is_complete()
            && self.current.as_ref().map_or(true, |f| f.size.is_none())
            && self.list.is_complete()
    }

    /// Percentage received
    pub fn percent_complete(&self) -> u8 {
        self.accounting.percent_complete()
    }

    /// Objects announced and processed
    pub fn objects(&self) -> (u64, u64) {
        (self.list.objects_to_process(), self.list.objects_processed())
    }

    /// Byte accounting
    pub fn accounting(&self) -> &TransferAccounting {
        &self.accounting
    }

    /// Raw bytes received so far
    pub fn data(&self) -> &[u8] {
        self.accounting.meta().as_bytes()
    }

    /// Take the raw bytes
    pub fn take_data(&mut self) -> Vec<u8> {
        self.accounting.take_meta()
    }

    /// Staging root, for file transfers
    pub fn staging_root(&self) -> Option<PathBuf> {
        self.staging.as_ref().map(|s| s.root().to_path_buf())
    }

    /// Local paths of the received root entries
    pub fn root_paths(&self) -> Vec<PathBuf> {
        match &self.staging {
            Some(staging) => self
                .roots
                .iter()
                .filter_map(|r| staging.resolve(r).ok())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Close open files and keep everything received
    pub fn commit(&mut self) -> Result<()> {
        self.close_current()?;
        if let Some(staging) = self.staging.as_mut() {
            staging.commit();
        }
        Ok(())
    }

    /// Discard everything received
    pub fn rollback(&mut self) -> Result<()> {
        self.current = None;
        self.accounting.reset();
        self.list.reset();
        self.roots.clear();
        match self.staging.as_mut() {
            Some(staging) => staging.rollback(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendStage {
    Header,
    Meta,
    Objects,
    Done,
}

#[derive(Debug)]
struct SendingFile {
    file: File,
    object: TransferObject,
    sent: u64,
}

/// Sending side of a transfer
#[derive(Debug)]
pub struct SendContext {
    protocol_version: u32,
    block_size: usize,
    context_id: u32,
    screen_id: u32,
    format: String,
    meta: Vec<u8>,
    meta_offset: usize,
    list: TransferList,
    accounting: TransferAccounting,
    queue: VecDeque<TransferMessage>,
    stage: SendStage,
    object_index: usize,
    sending: Option<SendingFile>,
}

impl SendContext {
    /// Send `data` as a raw payload in `format`
    pub fn raw(
        protocol_version: u32,
        block_size: usize,
        format: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<Self> {
        Self::build(protocol_version, block_size, format.into(), data, TransferList::default())
    }

    /// Send the objects of `list` as `text/uri-list`
    pub fn transfer_list(
        protocol_version: u32,
        block_size: usize,
        format: impl Into<String>,
        list: TransferList,
    ) -> Result<Self> {
        let meta = list.root_uri_list().into_bytes();
        Self::build(protocol_version, block_size, format.into(), meta, list)
    }

    fn build(
        protocol_version: u32,
        block_size: usize,
        format: String,
        meta: Vec<u8>,
        list: TransferList,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(DndError::InvalidParameter("block size is 0".to_string()));
        }
        let mut accounting = TransferAccounting::new(meta.len().max(1));
        accounting.announce(meta.len() as u64, list.total_bytes())?;

        Ok(Self {
            protocol_version,
            block_size,
            context_id: 0,
            screen_id: 0,
            format,
            meta,
            meta_offset: 0,
            list,
            accounting,
            queue: VecDeque::new(),
            stage: SendStage::Header,
            object_index: 0,
            sending: None,
        })
    }

    /// Set the screen reported in the data header
    pub fn with_screen(mut self, screen_id: u32) -> Self {
        self.screen_id = screen_id;
        self
    }

    /// Format being sent
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Objects in the transfer list
    pub fn objects(&self) -> u64 {
        self.list.objects_to_process()
    }

    /// Meta plus file bytes
    pub fn total_bytes(&self) -> u64 {
        self.accounting.total_announced()
    }

    /// Percentage handed out so far
    pub fn percent_complete(&self) -> u8 {
        self.accounting.percent_complete()
    }

    /// Every message has been handed out
    pub fn is_done(&self) -> bool {
        self.stage == SendStage::Done && self.queue.is_empty()
    }

    /// Next message, or `None` when the transfer is complete
    pub fn next_message(&mut self) -> Result<Option<TransferMessage>> {
        self.next_for(None, None)
    }

    /// Next message, checked against what the peer expects.
    ///
    /// On a kind or parameter-count mismatch the queue is cleared, the
    /// transfer is aborted and [`DndError::InvalidParameter`] is returned.
    pub fn next_for(
        &mut self,
        expected: Option<MessageKind>,
        param_count: Option<u32>,
    ) -> Result<Option<TransferMessage>> {
        if self.queue.is_empty() {
            if let Err(e) = self.fill() {
                self.abort();
                return Err(e);
            }
        }

        let Some(next) = self.queue.front() else {
            return Ok(None);
        };

        let kind = next.host_kind();
        let params = next.param_count(self.protocol_version);
        let kind_ok = expected.map_or(true, |e| e == kind);
        let params_ok = param_count.map_or(true, |p| p == params);
        if !kind_ok || !params_ok {
            tracing::warn!(
                ?kind,
                ?expected,
                params,
                ?param_count,
                "peer expects a different message, clearing queue"
            );
            self.abort();
            return Err(DndError::InvalidParameter(format!(
                "next message is {kind:?} ({params} params), peer expects {expected:?} ({param_count:?} params)"
            )));
        }

        let msg = self.queue.pop_front();
        if let Some(msg) = &msg {
            self.accounting.add_processed(msg.payload_len() as u64)?;
        }
        Ok(msg)
    }

    fn abort(&mut self) {
        self.queue.clear();
        self.sending = None;
        self.stage = SendStage::Done;
    }

    fn fill(&mut self) -> Result<()> {
        while self.queue.is_empty() && self.stage != SendStage::Done {
            match self.stage {
                SendStage::Header => {
                    if self.protocol_version >= PROTOCOL_VERSION_DATA_HEADER {
                        self.queue.push_back(TransferMessage::DataHeader(DataHeader {
                            context_id: self.context_id,
                            screen_id: self.screen_id,
                            total_bytes: self.accounting.total_announced(),
                            meta_bytes: self.meta.len() as u64,
                            meta_format: self.format.clone(),
                            objects: self.list.objects_to_process(),
                            ..DataHeader::default()
                        }));
                    }
                    self.stage = SendStage::Meta;
                },
                SendStage::Meta => {
                    let end = (self.meta_offset + self.block_size).min(self.meta.len());
                    let legacy_total = (self.protocol_version < PROTOCOL_VERSION_DATA_HEADER)
                        .then(|| self.accounting.total_announced());
                    if self.meta_offset < end || self.meta.is_empty() {
                        self.queue.push_back(TransferMessage::Data {
                            context_id: self.context_id,
                            data: self.meta[self.meta_offset..end].to_vec(),
                            total_bytes: legacy_total,
                        });
                    }
                    self.meta_offset = end;
                    // Legacy peers take the first chunk as the whole root list.
                    let legacy_list = legacy_total.is_some() && !self.list.objects().is_empty();
                    if self.meta_offset >= self.meta.len() || legacy_list {
                        if legacy_list && self.meta_offset < self.meta.len() {
                            return Err(DndError::NotSupported(format!(
                                "root list of {} bytes exceeds one block at protocol v{}",
                                self.meta.len(),
                                self.protocol_version
                            )));
                        }
                        self.stage = SendStage::Objects;
                    }
                },
                SendStage::Objects => self.fill_object()?,
                SendStage::Done => {},
            }
        }
        Ok(())
    }

    fn fill_object(&mut self) -> Result<()> {
        if let Some(sending) = self.sending.as_mut() {
            let remaining = sending.object.size - sending.sent;
            let len = remaining.min(self.block_size as u64) as usize;
            let mut buf = vec![0u8; len];
            sending
                .file
                .read_exact(&mut buf)
                .map_err(|e| DndError::host_io(&e, &sending.object.source))?;
            sending.sent += len as u64;

            let legacy = (self.protocol_version < PROTOCOL_VERSION_FILE_HEADER).then(|| {
                LegacyFileInfo {
                    path: sending.object.dest.clone(),
                    mode: sending.object.mode,
                }
            });
            self.queue.push_back(TransferMessage::FileData {
                context_id: self.context_id,
                data: buf,
                legacy,
            });
            if sending.sent >= sending.object.size {
                self.sending = None;
                self.object_index += 1;
            }
            return Ok(());
        }

        let Some(object) = self.list.objects().get(self.object_index).cloned() else {
            self.stage = SendStage::Done;
            return Ok(());
        };

        match object.kind {
            ObjectKind::Directory => {
                self.queue.push_back(TransferMessage::Directory {
                    context_id: self.context_id,
                    path: object.dest.clone(),
                    mode: object.mode,
                });
                self.object_index += 1;
            },
            ObjectKind::File => {
                let legacy = self.protocol_version < PROTOCOL_VERSION_FILE_HEADER;
                if !legacy {
                    self.queue.push_back(TransferMessage::FileHeader(FileHeader {
                        context_id: self.context_id,
                        path: object.dest.clone(),
                        flags: 0,
                        mode: object.mode,
                        size: object.size,
                    }));
                }

                if object.size == 0 {
                    if legacy {
                        self.queue.push_back(TransferMessage::FileData {
                            context_id: self.context_id,
                            data: Vec::new(),
                            legacy: Some(LegacyFileInfo {
                                path: object.dest.clone(),
                                mode: object.mode,
                            }),
                        });
                    }
                    self.object_index += 1;
                } else {
                    let file = File::open(&object.source)
                        .map_err(|e| DndError::host_io(&e, &object.source))?;
                    self.sending = Some(SendingFile {
                        file,
                        object,
                        sent: 0,
                    });
                }
            },
        }
        Ok(())
    }
}
