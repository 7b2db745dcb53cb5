//! Per-context command logs.
//!
//! Each context, immediate or deferred, has a `ContextLog`. While the log
//! is open, every call made on the context is appended to it as a chunk, in
//! the order the calls were made. The immediate context's log is open only
//! while a frame is being captured. A deferred context's log is open during
//! captures too, and all the time if the device is recording every command
//! list; its chunks move into a command list when the list is finished.
//!
//! The log also tracks things that must be known whether or not it is open:
//! the context's pipeline bindings, which become the begin-frame state of
//! the next capture, and the subresources it has mapped.

use crate::call::{Call, PipelineState};
use crate::chunk::{Chunk, ChunkType};
use crate::driver::MapType;
use crate::frame::CaptureFailReason;
use crate::id::ResourceId;
use crate::registry::FrameRefType;
use crate::resource::ContextKind;
use crate::serialize::ChunkBuilder;

use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogState {
    Closed,
    Open,
}

/// A subresource mapped on this context and not yet unmapped.
#[derive(Clone, Debug)]
pub struct OpenMap {
    pub map_type: MapType,
    /// Its contents when it was mapped.
    pub snapshot: Vec<u8>,
    /// True if the `Map` was recorded by the current capture.
    pub captured: bool,
}

#[derive(Debug)]
pub struct ContextLog {
    id: ResourceId,
    kind: ContextKind,
    state: LogState,
    event_id: u32,
    chunks: Vec<Chunk>,
    failure: Option<CaptureFailReason>,
    /// True if nothing has been recorded on this deferred context since its
    /// last command list was finished.
    empty_command_list: bool,
    pipeline: PipelineState,
    open_maps: HashMap<(ResourceId, u32), OpenMap>,
    /// Deferred contexts: how the commands since the last finish use each
    /// resource. These go to the command list.
    frame_refs: BTreeMap<ResourceId, FrameRefType>,
    dirty: BTreeSet<ResourceId>,
}

impl ContextLog {
    pub fn new(id: ResourceId, kind: ContextKind) -> ContextLog {
        ContextLog {
            id,
            kind,
            state: LogState::Closed,
            event_id: 0,
            chunks: Vec::new(),
            failure: None,
            empty_command_list: true,
            pipeline: PipelineState::default(),
            open_maps: HashMap::new(),
            frame_refs: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn is_deferred(&self) -> bool {
        self.kind == ContextKind::Deferred
    }

    pub fn state(&self) -> LogState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LogState::Open
    }

    /// Open the log for appending.
    ///
    /// A deferred context that has already recorded commands for its next
    /// command list can't capture that list: the commands recorded before
    /// the log opened are gone.
    pub fn attempt_capture(&mut self) {
        let was_open = self.is_open();
        self.state = LogState::Open;
        self.failure = None;
        if self.is_deferred() && !was_open && !self.empty_command_list {
            tracing::debug!(context = %self.id, "deferred context has unrecorded commands");
            self.failure = Some(CaptureFailReason::UncappedCommandList);
        }
    }

    /// Start the frame: reset the event counter and, on the immediate
    /// context, log the header chunk describing the state the frame starts
    /// from.
    pub fn begin_capture_frame(&mut self, stream_out_counters: &[(ResourceId, u64)]) {
        self.event_id = 0;
        if self.is_deferred() {
            return;
        }
        self.chunks.clear();
        let header = ChunkBuilder::new(ChunkType::BeginCaptureFrame)
            .field("context", &self.id)
            .field("pipeline", &self.pipeline)
            .field("stream_out_counters", stream_out_counters)
            .finish();
        self.chunks.push(header);
    }

    /// Log the footer chunk closing the frame. `backbuffer` is the back
    /// buffer presented at the end of it.
    pub fn end_capture_frame(&mut self, backbuffer: Option<ResourceId>) {
        let footer = ChunkBuilder::new(ChunkType::EndCaptureFrame)
            .field("context", &self.id)
            .field("backbuffer", &backbuffer)
            .finish();
        self.add_chunk(footer);
    }

    /// Close the log. Deferred contexts recording every command list stay
    /// open.
    pub fn finish_capture(&mut self, keep_deferred_open: bool) {
        if self.is_deferred() && keep_deferred_open {
            return;
        }
        self.state = LogState::Closed;
    }

    /// Discard everything recorded for the frame.
    pub fn cleanup_capture(&mut self) {
        if !self.is_deferred() {
            self.chunks.clear();
        }
        self.failure = None;
        self.event_id = 0;
        for map in self.open_maps.values_mut() {
            map.captured = false;
        }
    }

    pub fn get_event_id(&self) -> u32 {
        self.event_id
    }

    /// Append a chunk, if the log is open.
    pub fn add_chunk(&mut self, chunk: Chunk) {
        if !self.is_open() {
            return;
        }
        self.chunks.push(chunk);
        self.event_id += 1;
    }

    /// Record `call`. Return true if it was logged.
    pub fn record(&mut self, call: &Call) -> bool {
        self.empty_command_list = false;
        if !self.is_open() {
            return false;
        }
        self.add_chunk(call.to_chunk(self.id));
        true
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn take_chunks(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.chunks)
    }

    /// Note that something uncapturable happened. Only the first reason is
    /// kept.
    pub fn fail(&mut self, reason: CaptureFailReason) {
        if self.failure.is_none() {
            tracing::warn!(context = %self.id, "capture failed: {}", reason);
            self.failure = Some(reason);
        }
    }

    pub fn failure(&self) -> Option<CaptureFailReason> {
        self.failure
    }

    pub fn is_successful(&self) -> bool {
        self.failure.is_none()
    }

    pub fn pipeline(&self) -> &PipelineState {
        &self.pipeline
    }

    pub fn update_pipeline(&mut self, call: &Call) {
        self.pipeline.apply(call);
    }

    pub fn clear_pipeline(&mut self) {
        self.pipeline = PipelineState::default();
    }

    pub fn open_map(&mut self, resource: ResourceId, subresource: u32, map: OpenMap) {
        self.open_maps.insert((resource, subresource), map);
    }

    pub fn close_map(&mut self, resource: ResourceId, subresource: u32) -> Option<OpenMap> {
        self.open_maps.remove(&(resource, subresource))
    }

    /// Deferred contexts: note a use of `id` by the command list being
    /// recorded.
    pub fn reference(&mut self, id: ResourceId, ty: FrameRefType) {
        let existing = self.frame_refs.get(&id).copied();
        self.frame_refs.insert(id, FrameRefType::merge(existing, ty));
    }

    pub fn mark_dirty(&mut self, id: ResourceId) {
        self.dirty.insert(id);
    }

    /// Finish a command list: hand over its chunks, references and dirty
    /// set, and reset for the next one.
    pub fn take_command_list(&mut self) -> (Vec<Chunk>, BTreeMap<ResourceId, FrameRefType>, BTreeSet<ResourceId>) {
        self.empty_command_list = true;
        self.failure = None;
        self.event_id = 0;
        (
            std::mem::take(&mut self.chunks),
            std::mem::take(&mut self.frame_refs),
            std::mem::take(&mut self.dirty),
        )
    }

    pub fn is_empty_command_list(&self) -> bool {
        self.empty_command_list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::Payload;

    fn immediate() -> ContextLog {
        ContextLog::new(ResourceId::from_raw(1), ContextKind::Immediate)
    }

    #[test]
    fn closed_log_passes_calls_through() {
        let mut log = immediate();
        assert!(!log.record(&Call::Draw { vertex_count: 3, start_vertex: 0 }));
        assert!(log.chunks().is_empty());
        assert_eq!(log.get_event_id(), 0);
    }

    #[test]
    fn events_count_chunks_after_header() {
        let mut log = immediate();
        log.update_pipeline(&Call::SetRenderTargets { targets: vec![ResourceId::from_raw(9)] });
        log.attempt_capture();
        log.begin_capture_frame(&[]);
        assert_eq!(log.get_event_id(), 0);

        log.record(&Call::Draw { vertex_count: 3, start_vertex: 0 });
        log.record(&Call::Draw { vertex_count: 6, start_vertex: 3 });
        log.end_capture_frame(None);
        assert_eq!(log.get_event_id(), 3);

        let types: Vec<_> = log.chunks().iter().map(Chunk::ty).collect();
        assert_eq!(
            types,
            [ChunkType::BeginCaptureFrame, ChunkType::Draw, ChunkType::Draw, ChunkType::EndCaptureFrame]
        );

        let mut header = Payload::new(log.chunks()[0].payload());
        assert_eq!(header.field::<ResourceId>("context").unwrap(), ResourceId::from_raw(1));
        let pipeline: PipelineState = header.field("pipeline").unwrap();
        assert_eq!(pipeline.render_targets, [ResourceId::from_raw(9)]);

        log.finish_capture(false);
        assert!(!log.is_open());
        log.cleanup_capture();
        assert!(log.chunks().is_empty());
    }

    #[test]
    fn deferred_context_mid_list_fails() {
        let mut log = ContextLog::new(ResourceId::from_raw(2), ContextKind::Deferred);
        log.record(&Call::Draw { vertex_count: 3, start_vertex: 0 });
        log.attempt_capture();
        assert_eq!(log.failure(), Some(CaptureFailReason::UncappedCommandList));

        log.take_command_list();
        log.attempt_capture();
        assert!(log.is_successful());
    }

    #[test]
    fn first_failure_sticks() {
        let mut log = immediate();
        log.attempt_capture();
        log.fail(CaptureFailReason::UncappedUnmap);
        log.fail(CaptureFailReason::UncappedCommandList);
        assert_eq!(log.failure(), Some(CaptureFailReason::UncappedUnmap));
    }
}
