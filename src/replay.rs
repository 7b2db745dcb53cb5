//! Loading a capture and replaying its frame.
//!
//! Loading walks the file once. Everything before the capture-scope chunk
//! describes the world the frame starts in: the objects it uses, created
//! here on the replay driver, and their initial contents. Everything after
//! it is the frame itself, one event per chunk, which we only index; the
//! events are decoded again each time `replay_log` runs them.
//!
//! All events run on the replay driver's immediate context. Command lists
//! were inlined after their execute chunk when the frame was captured, so
//! there is nothing to stitch together here beyond saving and restoring the
//! pipeline around them.

use crate::call::{Call, PipelineState};
use crate::chunk::ChunkType;
use crate::driver::{Driver, DriverError, MapType, SubresourceData};
use crate::error::ReplayError;
use crate::file_stream::CaptureFile;
use crate::id::ResourceId;
use crate::initial::{self, InitialContents, Layout};
use crate::pixels::{self, Thumbnail};
use crate::registry::ResourceManager;
use crate::resource::{BufferDesc, ContextKind, ResourceKind, SwapChainDesc, TextureDesc, Usage};
use crate::serialize::{ChunkReader, DeserializeError, Payload};
use crate::version::{check_version, has_stream_out_counters, has_unmap_ranges};

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// The capture-scope chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameInfo {
    pub frame_number: u32,
    pub capture_time: String,
    pub resource_chunks: u32,
    pub initial_contents: u32,
    pub frame_chunks: u32,
}

/// Where one event of the frame lives in the file.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EventInfo {
    pub id: u32,
    pub offset: usize,
    pub tag: u32,
}

impl EventInfo {
    pub fn chunk_type(&self) -> Option<ChunkType> {
        ChunkType::from_u32(self.tag)
    }
}

/// The state the frame starts in, from its begin-frame chunk.
#[derive(Clone, Debug, Default)]
struct FrameStart {
    pipeline: PipelineState,
    stream_out_counters: Vec<(ResourceId, u64)>,
}

type Handler<D> = fn(&mut ReplayState<D>, ChunkType, &mut Payload<'_>) -> Result<(), ReplayError>;

/// Build the chunk handler table for captures of format `version`.
fn handlers<D: Driver>(version: u32) -> HashMap<ChunkType, Handler<D>> {
    let mut table: HashMap<ChunkType, Handler<D>> = HashMap::new();
    table.insert(ChunkType::DeviceInit, ReplayState::device_init);
    table.insert(ChunkType::InitialContents, ReplayState::initial_contents);
    table.insert(ChunkType::CreateSwapChain, ReplayState::create_swap_chain);
    table.insert(ChunkType::CreateBuffer, ReplayState::create_buffer);
    table.insert(ChunkType::CreateTexture, ReplayState::create_texture);
    table.insert(ChunkType::CreateCounterView, ReplayState::create_counter_view);
    table.insert(ChunkType::SetResourceName, ReplayState::set_resource_name);
    table.insert(ChunkType::BeginCaptureFrame, ReplayState::begin_frame);
    table.insert(ChunkType::EndCaptureFrame, ReplayState::end_frame);
    for &ty in ChunkType::ALL {
        if ty.is_context() && !table.contains_key(&ty) {
            table.insert(ty, ReplayState::call);
        }
    }

    if !has_stream_out_counters(version) {
        table.insert(ChunkType::BeginCaptureFrame, ReplayState::begin_frame_without_counters);
    }
    if !has_unmap_ranges(version) {
        table.insert(ChunkType::Unmap, ReplayState::whole_unmap);
    }
    table
}

/// Everything the handlers touch.
struct ReplayState<D: Driver> {
    driver: D,
    resources: ResourceManager<D::Handle>,
    kinds: BTreeMap<ResourceId, ResourceKind>,
    names: HashMap<ResourceId, String>,
    initial: BTreeMap<ResourceId, InitialContents<D::Handle>>,
    immediate: Option<ResourceId>,
    start: FrameStart,
    backbuffer: Option<ResourceId>,

    pipeline: PipelineState,
    /// Pipelines saved by execute chunks, with their restore flags.
    saved: Vec<(PipelineState, bool)>,
    /// Contents of subresources mapped by the events run so far.
    mapped: HashMap<(ResourceId, u32), Vec<u8>>,
}

impl<D: Driver> ReplayState<D> {
    fn live(&self, id: ResourceId) -> Result<D::Handle, ReplayError> {
        self.resources
            .get_live_resource(id)
            .ok_or(ReplayError::UnknownResource(id))
    }

    fn optional_live(&self, id: Option<ResourceId>) -> Result<Option<D::Handle>, ReplayError> {
        id.map(|id| self.live(id)).transpose()
    }

    fn add_live(&mut self, id: ResourceId, kind: ResourceKind, handle: D::Handle) -> Result<(), ReplayError> {
        if self.resources.has_live_resource(id) {
            self.driver.destroy(handle);
            return Err(ReplayError::DuplicateResource(id));
        }
        let live_id = self.resources.add_live_resource(id, handle);
        tracing::trace!(%id, %live_id, kind = kind.name(), "created live object");
        self.kinds.insert(id, kind);
        Ok(())
    }

    fn device_init(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let _device: ResourceId = payload.field("device")?;
        let immediate: ResourceId = payload.field("immediate")?;
        let handle = self.driver.immediate_context();
        self.add_live(immediate, ResourceKind::Context(ContextKind::Immediate), handle)?;
        self.immediate = Some(immediate);
        Ok(())
    }

    fn initial_contents(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let (id, contents) = initial::create(&mut self.driver, payload)?;
        if let Some(stale) = self.initial.insert(id, contents) {
            tracing::warn!(%id, "resource has two sets of initial contents");
            if let Some(handle) = stale.handle() {
                self.driver.destroy(handle);
            }
        }
        Ok(())
    }

    fn create_swap_chain(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let id: ResourceId = payload.field("id")?;
        let backbuffer: ResourceId = payload.field("backbuffer")?;
        let desc: SwapChainDesc = payload.field("desc")?;
        let (handle, backbuffer_handle) = self.driver.create_swap_chain(&desc)?;
        self.add_live(id, ResourceKind::SwapChain(desc), handle)?;
        self.add_live(backbuffer, ResourceKind::Texture(desc.backbuffer_desc()), backbuffer_handle)?;
        Ok(())
    }

    fn create_buffer(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let id: ResourceId = payload.field("id")?;
        let desc: BufferDesc = payload.field("desc")?;
        let data: Option<Vec<u8>> = payload.field("initial")?;
        let handle = self.driver.create_buffer(&desc, data.as_deref())?;
        self.add_live(id, ResourceKind::Buffer(desc), handle)?;
        Ok(())
    }

    fn create_texture(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let id: ResourceId = payload.field("id")?;
        let desc: TextureDesc = payload.field("desc")?;
        let data: Option<Vec<SubresourceData>> = payload.field("initial")?;
        let handle = self.driver.create_texture(&desc, data.as_deref())?;
        self.add_live(id, ResourceKind::Texture(desc), handle)?;
        Ok(())
    }

    fn create_counter_view(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let id: ResourceId = payload.field("id")?;
        let buffer: ResourceId = payload.field("buffer")?;
        let handle = self.driver.create_counter_view(self.live(buffer)?)?;
        self.add_live(id, ResourceKind::CounterView { buffer }, handle)?;
        Ok(())
    }

    fn set_resource_name(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let id: ResourceId = payload.field("id")?;
        let name: String = payload.field("name")?;
        self.names.insert(id, name);
        Ok(())
    }

    fn begin_frame(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let _context: ResourceId = payload.field("context")?;
        self.start = FrameStart {
            pipeline: payload.field("pipeline")?,
            stream_out_counters: payload.field("stream_out_counters")?,
        };
        Ok(())
    }

    fn begin_frame_without_counters(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let _context: ResourceId = payload.field("context")?;
        self.start = FrameStart {
            pipeline: payload.field("pipeline")?,
            stream_out_counters: vec![],
        };
        Ok(())
    }

    fn end_frame(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let _context: ResourceId = payload.field("context")?;
        self.backbuffer = payload.field("backbuffer")?;
        Ok(())
    }

    fn call(&mut self, ty: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let (_context, call) = Call::from_payload(ty, payload)?;
        self.execute(call)
    }

    fn whole_unmap(&mut self, _: ChunkType, payload: &mut Payload<'_>) -> Result<(), ReplayError> {
        let (_context, call) = Call::unmap_from_whole_payload(payload)?;
        self.execute(call)
    }

    /// Give every buffer, texture and counter view that the capture didn't
    /// save initial contents for a copy of its state as created, so that
    /// replaying the frame a second time starts from the same place.
    fn save_creation_state(&mut self) -> Result<(), DriverError> {
        let ctx = self.driver.immediate_context();
        let ids: Vec<ResourceId> = self.kinds.keys().copied().collect();
        for id in ids {
            if self.initial.contains_key(&id) {
                continue;
            }
            let live = match self.resources.get_live_resource(id) {
                Some(live) => live,
                None => continue,
            };
            let contents = match &self.kinds[&id] {
                ResourceKind::Buffer(desc) => {
                    let copy_desc = BufferDesc {
                        usage: Usage::Default,
                        ..desc.staging()
                    };
                    let copy = self.driver.create_buffer(&copy_desc, None)?;
                    self.driver.copy_resource(ctx, copy, live);
                    InitialContents::Copy {
                        copy,
                        layout: Layout::Buffer { length: desc.byte_width },
                    }
                }
                ResourceKind::Texture(desc) => {
                    let mut copy_desc = desc.staging();
                    copy_desc.usage = Usage::Default;
                    let copy = self.driver.create_texture(&copy_desc, None)?;
                    if desc.is_multisampled() {
                        self.driver.copy_ms_to_array(copy, live)?;
                    } else {
                        self.driver.copy_resource(ctx, copy, live);
                    }
                    InitialContents::Copy {
                        copy,
                        layout: Layout::Texture(*desc),
                    }
                }
                ResourceKind::CounterView { .. } => InitialContents::Counter(0),
                _ => continue,
            };
            self.initial.insert(id, contents);
        }
        Ok(())
    }

    /// Put the device back the way it was when the frame began.
    fn reset(&mut self) -> Result<(), ReplayError> {
        let ctx = self.driver.immediate_context();
        self.driver.clear_state(ctx);
        self.saved.clear();
        self.mapped.clear();

        for (&id, contents) in &self.initial {
            let (kind, live) = match (self.kinds.get(&id), self.resources.get_live_resource(id)) {
                (Some(kind), Some(live)) => (kind, live),
                _ => {
                    tracing::debug!(%id, "initial contents for a resource the frame doesn't create");
                    continue;
                }
            };
            initial::apply(&mut self.driver, kind, live, contents)?;
        }

        for &(id, count) in &self.start.stream_out_counters {
            let live = self.live(id)?;
            self.driver.set_stream_out_count(live, count);
        }

        self.pipeline = self.start.pipeline.clone();
        self.bind_pipeline()
    }

    fn bind_pipeline(&mut self) -> Result<(), ReplayError> {
        let ctx = self.driver.immediate_context();
        let targets = self
            .pipeline
            .render_targets
            .iter()
            .map(|&id| self.live(id))
            .collect::<Result<Vec<_>, _>>()?;
        let constant_buffer = self.optional_live(self.pipeline.constant_buffer)?;
        let counter_view = self.optional_live(self.pipeline.counter_view)?;
        let stream_out = self.optional_live(self.pipeline.stream_out)?;

        self.driver.clear_state(ctx);
        self.driver.set_render_targets(ctx, &targets);
        self.driver.set_constant_buffer(ctx, constant_buffer);
        self.driver.set_counter_view(ctx, counter_view, None);
        self.driver.set_stream_out_target(ctx, stream_out);
        Ok(())
    }

    fn execute(&mut self, call: Call) -> Result<(), ReplayError> {
        let ctx = self.driver.immediate_context();
        match &call {
            Call::SetRenderTargets { targets } => {
                let targets = targets.iter().map(|&id| self.live(id)).collect::<Result<Vec<_>, _>>()?;
                self.driver.set_render_targets(ctx, &targets);
            }
            Call::SetConstantBuffer { buffer } => {
                let buffer = self.optional_live(*buffer)?;
                self.driver.set_constant_buffer(ctx, buffer);
            }
            Call::SetCounterView { view, initial_count } => {
                let view = self.optional_live(*view)?;
                self.driver.set_counter_view(ctx, view, *initial_count);
            }
            Call::SetStreamOutTarget { buffer } => {
                let buffer = self.optional_live(*buffer)?;
                self.driver.set_stream_out_target(ctx, buffer);
            }
            Call::ClearRenderTarget { target, color } => {
                let target = self.live(*target)?;
                self.driver.clear_render_target(ctx, target, *color);
            }
            Call::Draw { vertex_count, start_vertex } => self.driver.draw(ctx, *vertex_count, *start_vertex),
            Call::DrawAuto => self.driver.draw_auto(ctx),
            Call::Dispatch { x, y, z } => self.driver.dispatch(ctx, *x, *y, *z),
            Call::UpdateSubresource { resource, subresource, data } => {
                let resource = self.live(*resource)?;
                self.driver.update_subresource(ctx, resource, *subresource, data);
            }
            Call::CopyResource { dst, src } => {
                let (dst, src) = (self.live(*dst)?, self.live(*src)?);
                self.driver.copy_resource(ctx, dst, src);
            }
            Call::Map { resource, subresource, map_type } => {
                let live = self.live(*resource)?;
                let data = self.driver.map(ctx, live, *subresource, *map_type)?;
                self.mapped.insert((*resource, *subresource), data.data);
            }
            Call::Unmap { resource, subresource, written } => {
                let live = self.live(*resource)?;
                let mapped = self.mapped.remove(&(*resource, *subresource));
                match (mapped, written) {
                    (Some(mut bytes), Some(written)) => {
                        written.apply_to(&mut bytes)?;
                        self.driver.unmap(ctx, live, *subresource, Some(&bytes));
                    }
                    (Some(_), None) => self.driver.unmap(ctx, live, *subresource, None),
                    // The map happened before the first event replayed.
                    (None, Some(written)) => {
                        let mut bytes = self.driver.map(ctx, live, *subresource, MapType::Write)?.data;
                        written.apply_to(&mut bytes)?;
                        self.driver.unmap(ctx, live, *subresource, Some(&bytes));
                    }
                    (None, None) => {}
                }
            }
            Call::ExecuteCommandList { restore, .. } => {
                self.saved.push((std::mem::take(&mut self.pipeline), *restore));
                self.driver.clear_state(ctx);
            }
            Call::FinishCommandList { .. } => match self.saved.pop() {
                Some((pipeline, true)) => {
                    self.pipeline = pipeline;
                    self.bind_pipeline()?;
                }
                _ => {
                    self.pipeline = PipelineState::default();
                    self.driver.clear_state(ctx);
                }
            },
            Call::SetMarker { name } | Call::PushMarker { name } => tracing::trace!(marker = %name),
            Call::PopMarker => {}
        }
        self.pipeline.apply(&call);
        Ok(())
    }
}

/// A loaded capture, ready to replay.
pub struct Replayer<D: Driver> {
    reader: ChunkReader,
    handlers: HashMap<ChunkType, Handler<D>>,
    state: ReplayState<D>,
    version: u32,
    debug: bool,
    thumbnail: Option<Thumbnail>,
    frame: FrameInfo,
    events: Vec<EventInfo>,
    current_event: u32,
}

impl<D: Driver> Replayer<D> {
    pub fn open<P: AsRef<Path>>(driver: D, path: P) -> Result<Replayer<D>, ReplayError> {
        Replayer::load(driver, CaptureFile::open(path)?)
    }

    pub fn from_bytes(driver: D, bytes: Vec<u8>) -> Result<Replayer<D>, ReplayError> {
        Replayer::load(driver, CaptureFile::from_bytes(bytes)?)
    }

    /// Create the frame's objects and initial contents on `driver`, and
    /// index its events.
    pub fn load(driver: D, file: CaptureFile) -> Result<Replayer<D>, ReplayError> {
        let mut reader = file.chunks;

        let header = reader.push_context()?;
        if header.chunk_type() != Some(ChunkType::InitParams) {
            return Err(ReplayError::UnexpectedChunk {
                expected: ChunkType::InitParams,
                found: header.tag,
            });
        }
        let mut payload = reader.payload();
        let version: u32 = payload.field("version")?;
        check_version(version)?;
        let debug: bool = payload.field("debug")?;
        reader.pop_context(ChunkType::InitParams);

        let resources = ResourceManager::new();
        resources.set_replay_mode();
        let mut state = ReplayState {
            driver,
            resources,
            kinds: BTreeMap::new(),
            names: HashMap::new(),
            initial: BTreeMap::new(),
            immediate: None,
            start: FrameStart::default(),
            backbuffer: None,
            pipeline: PipelineState::default(),
            saved: vec![],
            mapped: HashMap::new(),
        };
        let handlers = handlers::<D>(version);

        let frame = loop {
            if reader.at_end() {
                return Err(DeserializeError::UnexpectedEof.into());
            }
            let header = reader.push_context()?;
            let ty = match header.chunk_type() {
                Some(ChunkType::CaptureScope) => {
                    let mut payload = reader.payload();
                    let frame = FrameInfo {
                        frame_number: payload.field("frame_number")?,
                        capture_time: payload.field("capture_time")?,
                        resource_chunks: payload.field("resource_chunks")?,
                        initial_contents: payload.field("initial_contents")?,
                        frame_chunks: payload.field("frame_chunks")?,
                    };
                    reader.pop_context(ChunkType::CaptureScope);
                    break frame;
                }
                Some(ty) if !ty.is_context() => ty,
                _ => {
                    if !ChunkType::is_system_tag(header.tag) {
                        tracing::warn!(tag = header.tag, offset = header.offset, "skipping unexpected chunk");
                    }
                    reader.skip_current_chunk();
                    continue;
                }
            };
            match handlers.get(&ty) {
                Some(handler) => {
                    handler(&mut state, ty, &mut reader.payload())?;
                    reader.pop_context(ty);
                }
                None => reader.skip_current_chunk(),
            }
        };
        state.save_creation_state()?;

        // From here on the file is the frame.
        reader.mark_persistent();
        let mut events = vec![];
        while !reader.at_end() {
            let offset = reader.offset();
            let header = reader.push_context()?;
            let id = events.len() as u32;
            let ty = header.chunk_type();
            if id == 0 && ty != Some(ChunkType::BeginCaptureFrame) {
                return Err(ReplayError::UnexpectedChunk {
                    expected: ChunkType::BeginCaptureFrame,
                    found: header.tag,
                });
            }
            if let Some(ty @ (ChunkType::BeginCaptureFrame | ChunkType::EndCaptureFrame)) = ty {
                if let Some(handler) = handlers.get(&ty) {
                    handler(&mut state, ty, &mut reader.payload())?;
                }
            }
            reader.skip_current_chunk();
            events.push(EventInfo {
                id,
                offset,
                tag: header.tag,
            });
        }
        if events.is_empty() {
            return Err(DeserializeError::UnexpectedEof.into());
        }

        tracing::info!(
            frame = frame.frame_number,
            version,
            objects = state.kinds.len(),
            events = events.len(),
            "loaded capture"
        );
        Ok(Replayer {
            reader,
            handlers,
            state,
            version,
            debug,
            thumbnail: file.thumbnail,
            frame,
            events,
            current_event: 0,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// True if the capture was made on a device with validation enabled.
    pub fn debug_device(&self) -> bool {
        self.debug
    }

    pub fn thumbnail(&self) -> Option<&Thumbnail> {
        self.thumbnail.as_ref()
    }

    pub fn frame_info(&self) -> &FrameInfo {
        &self.frame
    }

    /// The frame's events. Event 0 is the begin-frame chunk.
    pub fn events(&self) -> &[EventInfo] {
        &self.events
    }

    pub fn event_count(&self) -> u32 {
        self.events.len() as u32
    }

    /// The last event replayed.
    pub fn get_event_id(&self) -> u32 {
        self.current_event
    }

    /// Replay events `start` through `end`. Unless `partial` is set, first
    /// put the device back in the state the frame began in.
    pub fn replay_log(&mut self, start: u32, end: u32, partial: bool) -> Result<(), ReplayError> {
        let count = self.event_count();
        if end >= count {
            return Err(ReplayError::EventOutOfRange { event: end, count });
        }
        if start > end {
            return Err(ReplayError::EventOutOfRange { event: start, count });
        }

        if !partial {
            tracing::debug!("resetting to start of frame");
            self.state.reset()?;
        }

        for index in start..=end {
            let event = self.events[index as usize];
            self.current_event = event.id;
            if event.id == 0 {
                continue;
            }
            let ty = match event.chunk_type() {
                Some(ty) => ty,
                None => {
                    tracing::warn!(event = event.id, tag = event.tag, "skipping unknown chunk");
                    continue;
                }
            };
            let handler = match self.handlers.get(&ty) {
                Some(&handler) if ty.is_context() => handler,
                _ => {
                    tracing::warn!(event = event.id, chunk = ty.name(), "skipping chunk out of place in frame");
                    continue;
                }
            };

            self.reader.set_offset(event.offset);
            self.reader.push_context()?;
            tracing::trace!(event = event.id, chunk = ty.name(), "replaying");
            handler(&mut self.state, ty, &mut self.reader.payload())?;
            self.reader.pop_context(ty);
        }
        Ok(())
    }

    /// Replay the whole frame from the start.
    pub fn replay_frame(&mut self) -> Result<(), ReplayError> {
        self.replay_log(0, self.event_count() - 1, false)
    }

    pub fn resource_name(&self, id: ResourceId) -> Option<&str> {
        self.state.names.get(&id).map(String::as_str)
    }

    pub fn resource_kind(&self, id: ResourceId) -> Option<&ResourceKind> {
        self.state.kinds.get(&id)
    }

    /// The IDs, as captured, of every object the frame created.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.state.kinds.keys().copied().collect()
    }

    pub fn live_resource(&self, id: ResourceId) -> Option<D::Handle> {
        self.state.resources.get_live_resource(id)
    }

    /// The replay-mode ID given to the live copy of captured object `id`.
    pub fn live_id(&self, id: ResourceId) -> Option<ResourceId> {
        self.state.resources.get_live_id(id)
    }

    pub fn original_id(&self, live_id: ResourceId) -> ResourceId {
        self.state.resources.get_original_id(live_id)
    }

    /// The captured ID of the context the frame ran on.
    pub fn immediate_context(&self) -> Option<ResourceId> {
        self.state.immediate
    }

    /// The back buffer presented at the end of the frame.
    pub fn backbuffer(&self) -> Option<ResourceId> {
        self.state.backbuffer
    }

    pub fn has_initial_contents(&self, id: ResourceId) -> bool {
        self.state.initial.contains_key(&id)
    }

    /// Read back subresource `subresource` of texture `id`, tightly packed.
    pub fn read_texture(&mut self, id: ResourceId, subresource: u32) -> Result<(TextureDesc, Vec<u8>), ReplayError> {
        let desc = match self.state.kinds.get(&id) {
            Some(ResourceKind::Texture(desc)) => *desc,
            _ => return Err(ReplayError::UnknownResource(id)),
        };
        let live = self.state.live(id)?;
        let texels = pixels::read_texture(&mut self.state.driver, live, &desc, subresource)?;
        Ok((desc, texels))
    }

    pub fn driver(&self) -> &D {
        &self.state.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.state.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::file_stream::{CONTAINER_VERSION, MAGIC};
    use crate::format::Format;
    use crate::resource::BindFlags;
    use crate::serialize::{write_framed, ChunkBuilder};
    use crate::soft::SoftDriver;
    use crate::version::CURRENT_VERSION;

    fn capture(chunks: &[Chunk]) -> Vec<u8> {
        let mut bytes = MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
        bytes.extend_from_slice(&[0; 12]);
        for chunk in chunks {
            write_framed(&mut bytes, chunk);
        }
        bytes
    }

    fn init_params(version: u32) -> Chunk {
        ChunkBuilder::new(ChunkType::InitParams)
            .field("version", &version)
            .field("debug", &false)
            .finish()
    }

    fn scope() -> Chunk {
        ChunkBuilder::new(ChunkType::CaptureScope)
            .field("frame_number", &1_u32)
            .field("capture_time", "")
            .field("resource_chunks", &0_u32)
            .field("initial_contents", &0_u32)
            .field("frame_chunks", &0_u32)
            .finish()
    }

    fn id(raw: u64) -> ResourceId {
        ResourceId::from_raw(raw)
    }

    fn device_init() -> Chunk {
        ChunkBuilder::new(ChunkType::DeviceInit)
            .field("device", &id(1))
            .field("immediate", &id(2))
            .finish()
    }

    fn target(raw: u64) -> Chunk {
        let desc = TextureDesc::new_2d(4, 1, Format::Rgba8Unorm, BindFlags::RENDER_TARGET);
        ChunkBuilder::new(ChunkType::CreateTexture)
            .field("id", &id(raw))
            .field("desc", &desc)
            .field("initial", &None::<Vec<SubresourceData>>)
            .finish()
    }

    fn begin(pipeline: &PipelineState, with_counters: bool) -> Chunk {
        let mut chunk = ChunkBuilder::new(ChunkType::BeginCaptureFrame);
        chunk.field("context", &id(2)).field("pipeline", pipeline);
        if with_counters {
            chunk.field("stream_out_counters", &Vec::<(ResourceId, u64)>::new());
        }
        chunk.finish()
    }

    #[test]
    fn incompatible_version_is_refused() {
        let bytes = capture(&[init_params(0x07), scope()]);
        assert!(matches!(
            Replayer::from_bytes(SoftDriver::new(), bytes),
            Err(ReplayError::IncompatibleVersion { found: 0x07, .. })
        ));
    }

    #[test]
    fn first_chunk_must_be_init_params() {
        let bytes = capture(&[scope()]);
        assert!(matches!(
            Replayer::from_bytes(SoftDriver::new(), bytes),
            Err(ReplayError::UnexpectedChunk {
                expected: ChunkType::InitParams,
                ..
            })
        ));
    }

    #[test]
    fn partial_replay_and_event_ranges() {
        let pipeline = PipelineState {
            render_targets: vec![id(3)],
            ..PipelineState::default()
        };
        let mut bytes = capture(&[
            init_params(CURRENT_VERSION),
            device_init(),
            target(3),
            scope(),
            begin(&pipeline, true),
            Call::ClearRenderTarget { target: id(3), color: [1.0, 0.0, 0.0, 1.0] }.to_chunk(id(2)),
        ]);
        // An empty chunk with a reserved system tag, which is skipped.
        bytes.extend_from_slice(&[9, 0]);
        write_framed(&mut bytes, &Call::Draw { vertex_count: 2, start_vertex: 1 }.to_chunk(id(2)));
        let mut replayer = Replayer::from_bytes(SoftDriver::new(), bytes).unwrap();
        assert_eq!(replayer.event_count(), 4);
        assert!(replayer.live_id(id(3)).unwrap().is_replay());

        replayer.replay_log(0, 1, false).unwrap();
        let (_, texels) = replayer.read_texture(id(3), 0).unwrap();
        assert_eq!(texels, [255, 0, 0, 255].repeat(4));
        assert_eq!(replayer.get_event_id(), 1);

        // With no constant buffer bound, draws write 0xff.
        replayer.replay_log(2, 3, true).unwrap();
        let (_, texels) = replayer.read_texture(id(3), 0).unwrap();
        assert_eq!(&texels[4..12], &[0xff; 8]);

        // A full replay starts over from creation state.
        replayer.replay_log(0, 0, false).unwrap();
        let (_, texels) = replayer.read_texture(id(3), 0).unwrap();
        assert_eq!(texels, [0; 16]);

        assert!(matches!(
            replayer.replay_log(0, 4, false),
            Err(ReplayError::EventOutOfRange { event: 4, count: 4 })
        ));
    }

    #[test]
    fn old_versions_use_old_handlers() {
        let buffer_desc = BufferDesc {
            byte_width: 4,
            bind: BindFlags::CONSTANT_BUFFER,
            usage: Usage::Dynamic,
        };
        let create = ChunkBuilder::new(ChunkType::CreateBuffer)
            .field("id", &id(3))
            .field("desc", &buffer_desc)
            .field("initial", &Some(vec![0_u8; 4]))
            .finish();
        let map = Call::Map {
            resource: id(3),
            subresource: 0,
            map_type: MapType::WriteDiscard,
        }
        .to_chunk(id(2));
        let whole_unmap = ChunkBuilder::new(ChunkType::Unmap)
            .field("context", &id(2))
            .field("resource", &id(3))
            .field("subresource", &0_u32)
            .field("data", &Some(vec![9_u8, 8, 7, 6]))
            .finish();

        let bytes = capture(&[
            init_params(0x09),
            device_init(),
            create,
            scope(),
            begin(&PipelineState::default(), false),
            map,
            whole_unmap,
        ]);
        let mut replayer = Replayer::from_bytes(SoftDriver::new(), bytes).unwrap();
        assert_eq!(replayer.version(), 0x09);
        replayer.replay_frame().unwrap();
        let live = replayer.live_resource(id(3)).unwrap();
        assert_eq!(replayer.driver().buffer_bytes(live), [9, 8, 7, 6]);
    }
}
