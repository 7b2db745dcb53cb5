//! The capturing device.
//!
//! `Device` sits between the application and a `Driver`. Every object the
//! application creates through it gets a `ResourceId`, a record of the chunks
//! that describe it, and an entry in the registry; every call made on one of
//! its contexts goes through a `ContextLog` on its way to the driver.
//!
//! Presents drive the frame state machine in `frame`. When a capture starts,
//! every context's log opens and the immediate context logs the pipeline
//! state the frame starts from. As the frame runs, the resources it touches
//! are marked referenced, and the first real use of a resource that has been
//! written since its creation takes a snapshot of its contents. At the next
//! present the frame is either written out, or thrown away and retried.
//!
//! ## Locking
//!
//! Locks are always taken in this order:
//!
//! - the frame state machine, `frame`;
//! - the context table, `contexts`, and then individual context logs. State
//!   transitions lock every log at once, in ID order;
//! - the resource registry, which locks internally;
//! - the driver.
//!
//! Calls on contexts never take the frame lock. They learn whether a frame
//! is being captured from `capturing`, which only changes while every
//! context log is locked.

use crate::call::{Call, WrittenRange};
use crate::chunk::{Chunk, ChunkType};
use crate::context::{ContextLog, OpenMap};
use crate::driver::{Driver, MapType, SubresourceData};
use crate::error::CaptureError;
use crate::file_stream::CaptureWriter;
use crate::frame::{CaptureFailReason, CapturedFrame, FrameCapturer, FrameEnd};
use crate::id::ResourceId;
use crate::initial::{self, InitialContents};
use crate::options::CaptureOptions;
use crate::pixels::{self, Thumbnail};
use crate::record::ResourceRecord;
use crate::registry::{FrameRefType, ResourceManager, TrackedResource};
use crate::resource::{BindFlags, BufferDesc, ContextKind, ResourceKind, SwapChainDesc, TextureDesc};
use crate::serialize::ChunkBuilder;
use crate::version::CURRENT_VERSION;

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A finished command list.
#[derive(Debug)]
struct CommandList {
    /// False if the list's commands weren't all recorded, so executing it
    /// can't be captured.
    captured: bool,
    record: Arc<ResourceRecord>,
    frame_refs: BTreeMap<ResourceId, FrameRefType>,
    dirty: BTreeSet<ResourceId>,
}

#[derive(Copy, Clone, Debug)]
struct SwapChain {
    id: ResourceId,
    backbuffer: ResourceId,
}

pub struct Device<D: Driver> {
    options: CaptureOptions,
    driver: Mutex<D>,
    resources: ResourceManager<D::Handle>,
    frame: Mutex<FrameCapturer>,
    capturing: AtomicBool,
    contexts: RwLock<BTreeMap<ResourceId, Arc<Mutex<ContextLog>>>>,
    command_lists: Mutex<HashMap<ResourceId, CommandList>>,
    swap_chains: Mutex<Vec<SwapChain>>,
    active_swap_chain: Mutex<Option<ResourceId>>,
    device_id: ResourceId,
    device_record: Arc<ResourceRecord>,
    immediate_id: ResourceId,
}

impl<D: Driver> Device<D> {
    pub fn new(driver: D, options: CaptureOptions) -> Device<D> {
        let resources = ResourceManager::new();

        let device_id = resources.new_unique_id();
        let device_record = resources.add_resource_record(device_id, true, 0, 0);

        let immediate_id = resources.new_unique_id();
        resources.add_current_resource(
            immediate_id,
            TrackedResource {
                kind: ResourceKind::Context(ContextKind::Immediate),
                handle: driver.immediate_context(),
                external_refs: 1,
                record: None,
            },
        );
        let mut contexts = BTreeMap::new();
        contexts.insert(
            immediate_id,
            Arc::new(Mutex::new(ContextLog::new(immediate_id, ContextKind::Immediate))),
        );

        tracing::info!(device = %device_id, immediate = %immediate_id, "created capturing device");
        Device {
            frame: Mutex::new(FrameCapturer::new(&options)),
            options,
            driver: Mutex::new(driver),
            resources,
            capturing: AtomicBool::new(false),
            contexts: RwLock::new(contexts),
            command_lists: Mutex::new(HashMap::new()),
            swap_chains: Mutex::new(Vec::new()),
            active_swap_chain: Mutex::new(None),
            device_id,
            device_record,
            immediate_id,
        }
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    pub fn device_id(&self) -> ResourceId {
        self.device_id
    }

    pub fn resources(&self) -> &ResourceManager<D::Handle> {
        &self.resources
    }

    /// Run `f` on the driver.
    pub fn with_driver<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.driver.lock())
    }

    /// The native handle of a tracked object.
    pub fn handle(&self, id: ResourceId) -> Result<D::Handle, CaptureError> {
        self.resources
            .current_handle(id)
            .ok_or(CaptureError::UnknownResource(id))
    }

    fn handles(&self, ids: &[ResourceId]) -> Result<Vec<D::Handle>, CaptureError> {
        ids.iter().map(|&id| self.handle(id)).collect()
    }

    fn optional_handle(&self, id: Option<ResourceId>) -> Result<Option<D::Handle>, CaptureError> {
        id.map(|id| self.handle(id)).transpose()
    }

    fn tracked(&self, id: ResourceId, expected: &'static str) -> Result<TrackedResource<D::Handle>, CaptureError> {
        let tracked = self
            .resources
            .get_current_resource(id)
            .ok_or(CaptureError::UnknownResource(id))?;
        if tracked.kind.name() != expected {
            return Err(CaptureError::WrongKind {
                id,
                expected,
                found: tracked.kind.name(),
            });
        }
        Ok(tracked)
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    // Creating and destroying objects.

    fn track(&self, id: ResourceId, kind: ResourceKind, handle: D::Handle, record: Option<Arc<ResourceRecord>>) {
        tracing::debug!(%id, kind = kind.name(), "tracking new object");
        self.resources.add_current_resource(
            id,
            TrackedResource {
                kind,
                handle,
                external_refs: 1,
                record,
            },
        );
        if self.is_capturing() {
            self.resources.mark_resource_frame_referenced(id, FrameRefType::Unknown);
        }
    }

    pub fn create_buffer(&self, desc: &BufferDesc, initial: Option<&[u8]>) -> Result<ResourceId, CaptureError> {
        let handle = self.driver.lock().create_buffer(desc, initial)?;
        let id = self.resources.new_unique_id();
        let record = self.resources.add_resource_record(id, false, desc.byte_width as u64, 1);
        record.set_data_in_serialiser(initial.is_some());
        record.add_chunk(
            ChunkBuilder::new(ChunkType::CreateBuffer)
                .field("id", &id)
                .field("desc", desc)
                .field("initial", &initial)
                .finish(),
        );
        self.track(id, ResourceKind::Buffer(*desc), handle, Some(record));
        Ok(id)
    }

    pub fn create_texture(
        &self,
        desc: &TextureDesc,
        initial: Option<&[SubresourceData]>,
    ) -> Result<ResourceId, CaptureError> {
        let handle = self.driver.lock().create_texture(desc, initial)?;
        let id = self.resources.new_unique_id();
        let kind = ResourceKind::Texture(*desc);
        let record = self
            .resources
            .add_resource_record(id, false, kind.byte_length(), kind.subresource_count());
        record.set_data_in_serialiser(initial.is_some());
        record.add_chunk(
            ChunkBuilder::new(ChunkType::CreateTexture)
                .field("id", &id)
                .field("desc", desc)
                .field("initial", &initial)
                .finish(),
        );
        self.track(id, kind, handle, Some(record));
        Ok(id)
    }

    /// Create a counter view of `buffer`.
    pub fn create_counter_view(&self, buffer: ResourceId) -> Result<ResourceId, CaptureError> {
        let tracked = self.tracked(buffer, "buffer")?;
        let handle = self.driver.lock().create_counter_view(tracked.handle)?;
        let id = self.resources.new_unique_id();
        let record = self.resources.add_resource_record(id, false, 0, 0);
        if let Some(parent) = tracked.record {
            record.add_parent(parent);
        }
        record.add_chunk(
            ChunkBuilder::new(ChunkType::CreateCounterView)
                .field("id", &id)
                .field("buffer", &buffer)
                .finish(),
        );
        self.track(id, ResourceKind::CounterView { buffer }, handle, Some(record));
        Ok(id)
    }

    pub fn create_deferred_context(&self) -> Result<ResourceId, CaptureError> {
        let handle = self
            .driver
            .lock()
            .create_deferred_context(self.options.debug_device_mode)?;
        let id = self.resources.new_unique_id();
        self.track(id, ResourceKind::Context(ContextKind::Deferred), handle, None);

        let mut log = ContextLog::new(id, ContextKind::Deferred);
        let mut contexts = self.contexts.write();
        if self.options.capture_all_cmd_lists || self.is_capturing() {
            log.attempt_capture();
            log.begin_capture_frame(&[]);
        }
        contexts.insert(id, Arc::new(Mutex::new(log)));
        Ok(id)
    }

    /// Create a swap chain, returning its ID and its back buffer's.
    pub fn create_swap_chain(&self, desc: &SwapChainDesc) -> Result<(ResourceId, ResourceId), CaptureError> {
        let mut desc = *desc;
        if desc.fullscreen && !self.options.allow_fullscreen {
            tracing::info!("forcing swap chain windowed");
            desc.fullscreen = false;
        }

        let (handle, backbuffer_handle) = self.driver.lock().create_swap_chain(&desc)?;
        let id = self.resources.new_unique_id();
        let backbuffer = self.resources.new_unique_id();
        let backbuffer_kind = ResourceKind::Texture(desc.backbuffer_desc());

        let record = self.resources.add_resource_record(id, true, 0, 0);
        let backbuffer_record = self.resources.add_resource_record(
            backbuffer,
            true,
            backbuffer_kind.byte_length(),
            backbuffer_kind.subresource_count(),
        );
        self.device_record.add_chunk(
            ChunkBuilder::new(ChunkType::CreateSwapChain)
                .field("id", &id)
                .field("backbuffer", &backbuffer)
                .field("desc", &desc)
                .finish(),
        );
        self.track(id, ResourceKind::SwapChain(desc), handle, Some(record));
        self.track(backbuffer, backbuffer_kind, backbuffer_handle, Some(backbuffer_record));

        self.swap_chains.lock().push(SwapChain { id, backbuffer });
        self.active_swap_chain.lock().get_or_insert(id);

        // A first-frame capture starts as soon as there's something to
        // present.
        let mut frame = self.frame.lock();
        if !frame.is_capturing() && frame.frame_counter() == 0 && frame.take_trigger() {
            self.start_capture(&mut frame, false)?;
        }
        Ok((id, backbuffer))
    }

    /// Attach a debug name to a resource.
    pub fn set_resource_name(&self, id: ResourceId, name: &str) -> Result<(), CaptureError> {
        let record = self
            .resources
            .get_resource_record(id)
            .ok_or(CaptureError::UnknownResource(id))?;
        let chunk = ChunkBuilder::new(ChunkType::SetResourceName)
            .field("id", &id)
            .field("name", name)
            .finish();

        // The name lives only in the record. A frame that renames a resource
        // references it, so the record reaches the capture.
        let _frame = self.frame.lock();
        record.lock_chunks().coalesce(ChunkType::SetResourceName, chunk);
        if self.is_capturing() {
            self.resources.mark_resource_frame_referenced(id, FrameRefType::Read);
        }
        Ok(())
    }

    pub fn add_ref(&self, id: ResourceId) -> Result<u32, CaptureError> {
        self.resources
            .adjust_external_refs(id, 1)
            .ok_or(CaptureError::UnknownResource(id))
    }

    /// Drop one of the application's references to `id`. When the last one
    /// goes, the native object is destroyed. Its record lives on as long as
    /// anything else holds it.
    pub fn release(&self, id: ResourceId) -> Result<u32, CaptureError> {
        if id == self.immediate_id {
            fatal!("the immediate context can't be released");
            return Ok(1);
        }
        let count = self
            .resources
            .adjust_external_refs(id, -1)
            .ok_or(CaptureError::UnknownResource(id))?;
        if count > 0 {
            return Ok(count);
        }

        let tracked = match self.resources.release_current_resource(id) {
            Some(tracked) => tracked,
            None => return Ok(0),
        };
        tracing::debug!(%id, kind = tracked.kind.name(), "destroying object");

        let mut released = vec![tracked];
        match released[0].kind {
            ResourceKind::Context(_) => {
                self.contexts.write().remove(&id);
            }
            ResourceKind::CommandList => {
                self.command_lists.lock().remove(&id);
            }
            ResourceKind::SwapChain(_) => {
                let mut swap_chains = self.swap_chains.lock();
                if let Some(pos) = swap_chains.iter().position(|s| s.id == id) {
                    let swap_chain = swap_chains.remove(pos);
                    released.extend(self.resources.release_current_resource(swap_chain.backbuffer));
                }
                let mut active = self.active_swap_chain.lock();
                if *active == Some(id) {
                    *active = swap_chains.first().map(|s| s.id);
                }
            }
            _ => {}
        }

        // The swap chain owns its back buffer's native object.
        self.driver.lock().destroy(released[0].handle);
        for tracked in released {
            if let Some(record) = tracked.record {
                record.delete(&self.resources);
            }
        }
        Ok(0)
    }

    // Contexts.

    pub fn immediate_context(&self) -> Context<'_, D> {
        Context {
            device: self,
            id: self.immediate_id,
        }
    }

    pub fn context(&self, id: ResourceId) -> Result<Context<'_, D>, CaptureError> {
        if !self.contexts.read().contains_key(&id) {
            return Err(CaptureError::UnknownResource(id));
        }
        Ok(Context { device: self, id })
    }

    fn context_log(&self, id: ResourceId) -> Result<Arc<Mutex<ContextLog>>, CaptureError> {
        self.contexts
            .read()
            .get(&id)
            .cloned()
            .ok_or(CaptureError::UnknownResource(id))
    }

    /// Note that the frame being captured used `id` as `ty`. The first real
    /// use of a resource takes a snapshot of it, if it needs one.
    fn frame_reference(&self, id: ResourceId, ty: FrameRefType) {
        self.resources.mark_resource_frame_referenced(id, ty);
        if ty != FrameRefType::Unknown {
            self.prepare_initial_contents(id);
        }
    }

    /// Save the pre-frame contents of `id`, if it has been written since
    /// creation and hasn't been saved already this frame.
    ///
    /// Failures are logged, and leave the resource without initial contents.
    pub fn prepare_initial_contents(&self, id: ResourceId) {
        if !self.resources.is_dirty(id) || self.resources.has_initial_contents(id) {
            return;
        }
        let tracked = match self.resources.get_current_resource(id) {
            Some(tracked) => tracked,
            None => return,
        };
        if tracked.record.as_ref().map_or(true, |record| record.is_special()) {
            return;
        }

        let contents = match &tracked.kind {
            ResourceKind::Texture(desc)
                if initial::should_omit(
                    desc,
                    &self.options.big_target,
                    self.resources.read_before_write(id),
                    self.options.save_all_initials,
                ) =>
            {
                tracing::debug!(%id, "omitting initial contents of large render target");
                Ok(InitialContents::Clear)
            }
            kind => initial::prepare(&mut *self.driver.lock(), kind, tracked.handle),
        };

        match contents {
            Ok(contents) => {
                tracing::trace!(%id, "prepared initial contents");
                if let Err(duplicate) = self.resources.set_initial_contents(id, contents) {
                    if let Some(handle) = duplicate.handle() {
                        self.driver.lock().destroy(handle);
                    }
                }
            }
            Err(err) => tracing::error!(%id, "couldn't save initial contents: {}", err),
        }
    }

    /// Account for the resources `refs` names. On the immediate context they
    /// go to the frame, on a deferred one to the command list being built.
    fn note_references(&self, log: &mut ContextLog, refs: &[(ResourceId, FrameRefType)]) {
        for &(id, ty) in refs {
            if log.is_deferred() {
                log.reference(id, ty);
                if ty.is_write() {
                    log.mark_dirty(id);
                }
                continue;
            }
            if log.is_open() {
                self.frame_reference(id, ty);
            }
            if ty.is_write() {
                self.mark_written(id);
            }
        }
    }

    fn mark_written(&self, id: ResourceId) {
        if self.is_capturing() {
            self.resources.mark_pending_dirty(id);
        } else {
            self.resources.mark_dirty(id);
        }
    }

    /// Log and issue a call that has no special handling.
    fn submit(&self, ctx: ResourceId, call: Call) -> Result<(), CaptureError> {
        let ctx_handle = self.handle(ctx)?;
        let log = self.context_log(ctx)?;
        let mut log = log.lock();

        let refs = call.references(log.pipeline());
        self.note_references(&mut log, &refs);
        log.record(&call);
        log.update_pipeline(&call);

        match &call {
            Call::SetRenderTargets { targets } => {
                let targets = self.handles(targets)?;
                self.driver.lock().set_render_targets(ctx_handle, &targets);
            }
            Call::SetConstantBuffer { buffer } => {
                let buffer = self.optional_handle(*buffer)?;
                self.driver.lock().set_constant_buffer(ctx_handle, buffer);
            }
            Call::SetCounterView { view, initial_count } => {
                let view = self.optional_handle(*view)?;
                self.driver.lock().set_counter_view(ctx_handle, view, *initial_count);
            }
            Call::SetStreamOutTarget { buffer } => {
                let buffer = self.optional_handle(*buffer)?;
                self.driver.lock().set_stream_out_target(ctx_handle, buffer);
            }
            Call::ClearRenderTarget { target, color } => {
                let target = self.handle(*target)?;
                self.driver.lock().clear_render_target(ctx_handle, target, *color);
            }
            Call::Draw { vertex_count, start_vertex } => {
                self.driver.lock().draw(ctx_handle, *vertex_count, *start_vertex);
            }
            Call::DrawAuto => self.driver.lock().draw_auto(ctx_handle),
            Call::Dispatch { x, y, z } => self.driver.lock().dispatch(ctx_handle, *x, *y, *z),
            Call::UpdateSubresource { resource, subresource, data } => {
                let resource = self.handle(*resource)?;
                self.driver
                    .lock()
                    .update_subresource(ctx_handle, resource, *subresource, data);
            }
            Call::CopyResource { dst, src } => {
                let (dst, src) = (self.handle(*dst)?, self.handle(*src)?);
                self.driver.lock().copy_resource(ctx_handle, dst, src);
            }
            Call::SetMarker { .. } | Call::PushMarker { .. } | Call::PopMarker => {}
            Call::Map { .. }
            | Call::Unmap { .. }
            | Call::FinishCommandList { .. }
            | Call::ExecuteCommandList { .. } => {
                fatal!("{:?} submitted without its special handling", call.chunk_type());
            }
        }
        Ok(())
    }

    fn map(
        &self,
        ctx: ResourceId,
        resource: ResourceId,
        subresource: u32,
        map_type: MapType,
    ) -> Result<SubresourceData, CaptureError> {
        let ctx_handle = self.handle(ctx)?;
        let resource_handle = self.handle(resource)?;
        let log = self.context_log(ctx)?;
        let mut log = log.lock();

        let call = Call::Map {
            resource,
            subresource,
            map_type,
        };
        let refs = call.references(log.pipeline());
        self.note_references(&mut log, &refs);

        let data = self
            .driver
            .lock()
            .map(ctx_handle, resource_handle, subresource, map_type)?;
        let captured = log.record(&call);
        log.open_map(
            resource,
            subresource,
            OpenMap {
                map_type,
                snapshot: data.data.clone(),
                captured,
            },
        );
        Ok(data)
    }

    fn unmap(
        &self,
        ctx: ResourceId,
        resource: ResourceId,
        subresource: u32,
        data: Option<&[u8]>,
    ) -> Result<(), CaptureError> {
        let ctx_handle = self.handle(ctx)?;
        let resource_handle = self.handle(resource)?;
        let log = self.context_log(ctx)?;
        let mut log = log.lock();

        let open = log.close_map(resource, subresource);
        let written = match (&open, data) {
            (Some(open), Some(data)) => WrittenRange::diff(&open.snapshot, data),
            (None, Some(data)) => Some(WrittenRange {
                offset: 0,
                bytes: data.to_vec(),
            }),
            (_, None) => None,
        };
        if log.is_open() && !open.as_ref().map_or(false, |open| open.captured) {
            log.fail(CaptureFailReason::UncappedUnmap);
        }

        let call = Call::Unmap {
            resource,
            subresource,
            written,
        };
        let refs = call.references(log.pipeline());
        self.note_references(&mut log, &refs);
        log.record(&call);

        self.driver
            .lock()
            .unmap(ctx_handle, resource_handle, subresource, data);
        Ok(())
    }

    fn finish_command_list(&self, ctx: ResourceId, restore: bool) -> Result<ResourceId, CaptureError> {
        let ctx_handle = self.handle(ctx)?;
        let log = self.context_log(ctx)?;
        let mut log = log.lock();
        if !log.is_deferred() {
            return Err(CaptureError::WrongKind {
                id: ctx,
                expected: "deferred context",
                found: "immediate context",
            });
        }

        let list_handle = self.driver.lock().finish_command_list(ctx_handle, restore)?;
        let list = self.resources.new_unique_id();
        let call = Call::FinishCommandList { list, restore };

        let was_open = log.is_open();
        let successful = log.is_successful();
        let empty = log.is_empty_command_list();
        log.record(&call);
        if !restore {
            log.clear_pipeline();
        }
        let (mut chunks, frame_refs, dirty) = log.take_command_list();

        let captured = if was_open {
            if !successful {
                tracing::debug!(context = %ctx, %list, "dropping partially recorded command list");
                chunks.clear();
            }
            successful
        } else if empty {
            chunks = vec![call.to_chunk(ctx)];
            true
        } else {
            self.options.capture_all_cmd_lists
        };

        let record = self.resources.add_resource_record(list, false, 0, 0);
        for chunk in chunks {
            record.add_chunk(chunk);
        }
        for &id in frame_refs.keys() {
            if let Some(parent) = self.resources.get_resource_record(id) {
                record.add_parent(parent);
            }
        }

        tracing::debug!(context = %ctx, %list, captured, "finished command list");
        self.resources.add_current_resource(
            list,
            TrackedResource {
                kind: ResourceKind::CommandList,
                handle: list_handle,
                external_refs: 1,
                record: Some(record.clone()),
            },
        );
        self.command_lists.lock().insert(
            list,
            CommandList {
                captured,
                record,
                frame_refs,
                dirty,
            },
        );
        Ok(list)
    }

    fn execute_command_list(&self, ctx: ResourceId, list: ResourceId, restore: bool) -> Result<(), CaptureError> {
        let ctx_handle = self.handle(ctx)?;
        let list_handle = self.tracked(list, "command list")?.handle;
        let log = self.context_log(ctx)?;
        let mut log = log.lock();
        if log.is_deferred() {
            return Err(CaptureError::WrongKind {
                id: ctx,
                expected: "immediate context",
                found: "deferred context",
            });
        }

        let (captured, chunks, frame_refs, dirty) = match self.command_lists.lock().get(&list) {
            Some(cl) => (cl.captured, cl.record.chunks(), cl.frame_refs.clone(), cl.dirty.clone()),
            None => return Err(CaptureError::UnknownResource(list)),
        };

        log.record(&Call::ExecuteCommandList { list, restore });
        if log.is_open() {
            if captured {
                for chunk in chunks.iter() {
                    log.add_chunk(chunk.duplicate());
                }
            } else {
                log.fail(CaptureFailReason::UncappedCommandList);
            }
            for (&id, &ty) in &frame_refs {
                self.frame_reference(id, ty);
            }
        }
        for id in dirty {
            self.mark_written(id);
        }
        if !restore {
            log.clear_pipeline();
        }

        self.driver.lock().execute_command_list(ctx_handle, list_handle, restore);
        Ok(())
    }

    // Frames.

    /// Present `swap_chain`. This is the frame boundary: it ends the frame
    /// being captured, and starts any capture queued for the next one.
    pub fn present(&self, swap_chain: ResourceId, sync_interval: u32) -> Result<(), CaptureError> {
        let handle = self.tracked(swap_chain, "swap chain")?.handle;
        let sync_interval = if self.options.allow_vsync { sync_interval } else { 0 };

        let mut frame = self.frame.lock();
        *self.active_swap_chain.lock() = Some(swap_chain);
        self.drain_debug_messages();

        frame.advance_frame();
        if frame.is_capturing() && !frame.is_app_controlled() {
            self.end_capture(&mut frame, Some(swap_chain))?;
        }

        self.driver.lock().present(handle, sync_interval)?;

        if !frame.is_capturing() && frame.take_trigger() {
            self.start_capture(&mut frame, false)?;
        }
        Ok(())
    }

    /// Capture after the present that brings the frame counter to `frame`.
    pub fn queue_capture(&self, frame: u32) {
        self.frame.lock().queue_capture(frame);
    }

    /// Capture the next frame.
    pub fn trigger_capture(&self) {
        self.frame.lock().trigger_capture();
    }

    /// Start capturing now, at the application's request. The capture runs
    /// until `end_frame_capture`, and isn't retried if it fails.
    pub fn start_frame_capture(&self) -> Result<u32, CaptureError> {
        let mut frame = self.frame.lock();
        self.start_capture(&mut frame, true)
    }

    pub fn end_frame_capture(&self) -> Result<CapturedFrame, CaptureError> {
        let mut frame = self.frame.lock();
        if !frame.is_capturing() {
            return Err(CaptureError::NotCapturing);
        }
        let swap_chain = *self.active_swap_chain.lock();
        self.end_capture(&mut frame, swap_chain)?;
        frame.captures().last().cloned().ok_or(CaptureError::NotCapturing)
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame.lock().frame_counter()
    }

    /// Every finished capture attempt, oldest first.
    pub fn captures(&self) -> Vec<CapturedFrame> {
        self.frame.lock().captures().to_vec()
    }

    pub fn last_failure(&self) -> Option<(u32, CaptureFailReason)> {
        self.frame.lock().last_failure()
    }

    pub fn overlay_text(&self) -> Option<String> {
        self.frame.lock().overlay_text()
    }

    fn drain_debug_messages(&self) {
        let messages = self.driver.lock().take_debug_messages();
        if self.options.debug_output_mute {
            return;
        }
        for message in messages {
            tracing::warn!(target: "gpu_capture::driver", "{}", message);
        }
    }

    fn lock_logs<'a>(
        contexts: &'a BTreeMap<ResourceId, Arc<Mutex<ContextLog>>>,
    ) -> Vec<MutexGuard<'a, ContextLog>> {
        contexts.values().map(|log| log.lock()).collect()
    }

    fn start_capture(&self, frame: &mut FrameCapturer, app_controlled: bool) -> Result<u32, CaptureError> {
        let frame_number = frame.begin(app_controlled)?;
        let contexts = self.contexts.read();
        let mut logs = Self::lock_logs(&contexts);
        self.begin_frame(&mut logs);
        Ok(frame_number)
    }

    /// Open every log and set up the frame's references. The caller holds
    /// every context log.
    fn begin_frame(&self, logs: &mut [MutexGuard<'_, ContextLog>]) {
        self.discard_frame_state();
        self.resources
            .mark_resource_frame_referenced(self.device_id, FrameRefType::Write);
        self.capturing.store(true, Ordering::Release);

        // Stream-out buffers carry a hidden vertex count the frame may draw
        // from, so it goes in the begin-frame chunk.
        let mut counters = vec![];
        let mut driver = self.driver.lock();
        for id in self.resources.current_ids() {
            if let Some(tracked) = self.resources.get_current_resource(id) {
                let stream_out = matches!(&tracked.kind,
                    ResourceKind::Buffer(desc) if desc.bind.contains(BindFlags::STREAM_OUTPUT));
                if stream_out {
                    counters.push((id, driver.stream_out_count(tracked.handle)));
                }
                if self.options.ref_all_resources
                    && matches!(
                        tracked.kind,
                        ResourceKind::Buffer(_) | ResourceKind::Texture(_) | ResourceKind::CounterView { .. }
                    )
                {
                    self.resources.mark_resource_frame_referenced(id, FrameRefType::Read);
                }
            }
        }
        drop(driver);
        for &(id, _) in &counters {
            self.resources.mark_resource_frame_referenced(id, FrameRefType::Unknown);
        }

        for log in logs.iter_mut() {
            log.attempt_capture();
            if log.is_deferred() {
                log.begin_capture_frame(&[]);
                continue;
            }
            log.begin_capture_frame(&counters);
            for id in log.pipeline().bound() {
                self.resources.mark_resource_frame_referenced(id, FrameRefType::Unknown);
            }
        }

        for id in self.resources.referenced_ids() {
            if self.resources.frame_ref(id) != Some(FrameRefType::Unknown) {
                self.prepare_initial_contents(id);
            }
        }
    }

    /// Drop everything the last capture attempt accumulated.
    fn discard_frame_state(&self) {
        let stale = self.resources.free_initial_contents();
        if !stale.is_empty() {
            let mut driver = self.driver.lock();
            for handle in stale.iter().filter_map(InitialContents::handle) {
                driver.destroy(handle);
            }
        }
        self.resources.clear_referenced_resources();
        self.resources.flush_pending_dirty();
    }

    fn end_capture(&self, frame: &mut FrameCapturer, swap_chain: Option<ResourceId>) -> Result<(), CaptureError> {
        let contexts = self.contexts.read();
        let mut logs = Self::lock_logs(&contexts);
        let failure = logs
            .iter()
            .find(|log| !log.is_deferred())
            .and_then(|log| log.failure());
        let capture_time = frame.current().map(|f| f.capture_time);
        let keep_deferred_open = self.options.capture_all_cmd_lists;

        match frame.end(failure)? {
            FrameEnd::Flush { frame_number } => {
                let backbuffer = swap_chain.and_then(|id| {
                    self.swap_chains
                        .lock()
                        .iter()
                        .find(|s| s.id == id)
                        .map(|s| s.backbuffer)
                });
                for log in logs.iter_mut() {
                    if !log.is_deferred() {
                        log.end_capture_frame(backbuffer);
                    }
                    log.finish_capture(keep_deferred_open);
                }
                self.capturing.store(false, Ordering::Release);

                let thumbnail = backbuffer.and_then(|id| self.thumbnail(id));
                let immediate = logs.iter().find(|log| !log.is_deferred()).map(|log| log.chunks());
                let written = self.write_capture(
                    frame_number,
                    capture_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    immediate.unwrap_or(&[]),
                    thumbnail.as_ref(),
                );
                match written {
                    Ok(path) => {
                        tracing::info!(frame = frame_number, path = %path.display(), "wrote capture");
                        frame.flushed(path, self.resources.referenced_ids());
                    }
                    Err(err) => {
                        tracing::error!(frame = frame_number, "couldn't write capture: {}", err);
                        frame.flush_failed(frame_number);
                    }
                }
                for log in logs.iter_mut() {
                    log.cleanup_capture();
                }
                self.discard_frame_state();
            }
            FrameEnd::Retry { next_frame, .. } => {
                tracing::debug!(frame = next_frame, "restarting capture");
                for log in logs.iter_mut() {
                    log.finish_capture(keep_deferred_open);
                    log.cleanup_capture();
                }
                self.begin_frame(&mut logs);
            }
            FrameEnd::Abort { .. } => {
                for log in logs.iter_mut() {
                    log.finish_capture(keep_deferred_open);
                    log.cleanup_capture();
                }
                self.capturing.store(false, Ordering::Release);
                self.discard_frame_state();
            }
        }
        Ok(())
    }

    fn thumbnail(&self, backbuffer: ResourceId) -> Option<Thumbnail> {
        let tracked = self.resources.get_current_resource(backbuffer)?;
        let desc = match tracked.kind {
            ResourceKind::Texture(desc) => desc,
            _ => return None,
        };
        let texels = match pixels::read_texture(&mut *self.driver.lock(), tracked.handle, &desc, 0) {
            Ok(texels) => texels,
            Err(err) => {
                tracing::warn!("couldn't read back buffer for thumbnail: {}", err);
                return None;
            }
        };
        pixels::make_thumbnail(desc.format, desc.width, desc.height, &texels)
    }

    fn write_capture(
        &self,
        frame_number: u32,
        capture_time: String,
        frame_chunks: &[Chunk],
        thumbnail: Option<&Thumbnail>,
    ) -> Result<PathBuf, CaptureError> {
        let path = self.options.capture_path(frame_number);
        let mut writer = CaptureWriter::create(&path, thumbnail)?;

        writer.write_chunk(
            &ChunkBuilder::new(ChunkType::InitParams)
                .field("version", &CURRENT_VERSION)
                .field("debug", &self.options.debug_device_mode)
                .finish(),
        )?;
        writer.write_chunk(
            &ChunkBuilder::new(ChunkType::DeviceInit)
                .field("device", &self.device_id)
                .field("immediate", &self.immediate_id)
                .finish(),
        )?;

        let mut records = BTreeMap::new();
        self.resources.mark_unwritten_resources();
        self.resources.insert_referenced_chunks(&mut records);
        for chunk in records.values() {
            writer.write_chunk(chunk)?;
        }

        let mut initial_count = 0_u32;
        for id in self.resources.initial_contents_ids() {
            let contents = match self.resources.get_initial_contents(id) {
                Some(contents) => contents,
                None => continue,
            };
            match initial::serialize(&mut *self.driver.lock(), id, &contents) {
                Ok(chunk) => {
                    writer.write_chunk(&chunk)?;
                    initial_count += 1;
                }
                Err(err) => tracing::error!(%id, "couldn't read back initial contents: {}", err),
            }
        }

        writer.write_chunk(
            &ChunkBuilder::new(ChunkType::CaptureScope)
                .field("frame_number", &frame_number)
                .field("capture_time", &capture_time)
                .field("resource_chunks", &(records.len() as u32))
                .field("initial_contents", &initial_count)
                .field("frame_chunks", &(frame_chunks.len() as u32))
                .finish(),
        )?;
        for chunk in frame_chunks {
            writer.write_chunk(chunk)?;
        }

        let bytes = writer.finish()?;
        tracing::debug!(frame = frame_number, bytes, resources = records.len(), "capture written");
        Ok(path)
    }
}

/// A context of a `Device`: the immediate context, or a deferred one.
///
/// Every method logs the call, if the context's log is open, and issues it
/// to the driver.
pub struct Context<'d, D: Driver> {
    device: &'d Device<D>,
    id: ResourceId,
}

impl<D: Driver> Context<'_, D> {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// The number of events logged so far in the frame being captured.
    pub fn event_id(&self) -> Result<u32, CaptureError> {
        Ok(self.device.context_log(self.id)?.lock().get_event_id())
    }

    pub fn set_render_targets(&self, targets: &[ResourceId]) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::SetRenderTargets { targets: targets.to_vec() })
    }

    pub fn set_constant_buffer(&self, buffer: Option<ResourceId>) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::SetConstantBuffer { buffer })
    }

    pub fn set_counter_view(&self, view: Option<ResourceId>, initial_count: Option<u32>) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::SetCounterView { view, initial_count })
    }

    pub fn set_stream_out_target(&self, buffer: Option<ResourceId>) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::SetStreamOutTarget { buffer })
    }

    pub fn clear_render_target(&self, target: ResourceId, color: [f32; 4]) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::ClearRenderTarget { target, color })
    }

    pub fn draw(&self, vertex_count: u32, start_vertex: u32) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::Draw { vertex_count, start_vertex })
    }

    pub fn draw_auto(&self) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::DrawAuto)
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::Dispatch { x, y, z })
    }

    pub fn update_subresource(
        &self,
        resource: ResourceId,
        subresource: u32,
        data: SubresourceData,
    ) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::UpdateSubresource { resource, subresource, data })
    }

    pub fn copy_resource(&self, dst: ResourceId, src: ResourceId) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::CopyResource { dst, src })
    }

    /// Map a subresource, returning its current contents.
    pub fn map(&self, resource: ResourceId, subresource: u32, map_type: MapType) -> Result<SubresourceData, CaptureError> {
        self.device.map(self.id, resource, subresource, map_type)
    }

    /// Unmap a subresource. `data`, if given, is its new contents, laid out
    /// as `map` returned them.
    pub fn unmap(&self, resource: ResourceId, subresource: u32, data: Option<&[u8]>) -> Result<(), CaptureError> {
        self.device.unmap(self.id, resource, subresource, data)
    }

    /// Deferred contexts: turn the commands recorded since the last finish
    /// into a command list.
    pub fn finish_command_list(&self, restore_state: bool) -> Result<ResourceId, CaptureError> {
        self.device.finish_command_list(self.id, restore_state)
    }

    pub fn execute_command_list(&self, list: ResourceId, restore_state: bool) -> Result<(), CaptureError> {
        self.device.execute_command_list(self.id, list, restore_state)
    }

    pub fn set_marker(&self, name: &str) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::SetMarker { name: name.to_string() })
    }

    pub fn push_marker(&self, name: &str) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::PushMarker { name: name.to_string() })
    }

    pub fn pop_marker(&self) -> Result<(), CaptureError> {
        self.device.submit(self.id, Call::PopMarker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::resource::Usage;
    use crate::soft::SoftDriver;

    fn device(dir: &tempfile::TempDir) -> Device<SoftDriver> {
        let options = CaptureOptions {
            capture_dir: dir.path().to_path_buf(),
            ..CaptureOptions::default()
        };
        Device::new(SoftDriver::new(), options)
    }

    fn swap_chain(device: &Device<SoftDriver>) -> (ResourceId, ResourceId) {
        device
            .create_swap_chain(&SwapChainDesc {
                width: 16,
                height: 16,
                format: Format::Rgba8Unorm,
                fullscreen: false,
            })
            .unwrap()
    }

    fn buffer_desc(bytes: u32) -> BufferDesc {
        BufferDesc {
            byte_width: bytes,
            bind: BindFlags::CONSTANT_BUFFER,
            usage: Usage::Default,
        }
    }

    #[test]
    fn ids_are_unique_and_records_die_with_resources() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(&dir);
        let a = device.create_buffer(&buffer_desc(4), None).unwrap();
        let b = device.create_buffer(&buffer_desc(4), None).unwrap();
        assert_ne!(a, b);
        assert!(device.resources().has_resource_record(a));

        assert_eq!(device.add_ref(a).unwrap(), 2);
        assert_eq!(device.release(a).unwrap(), 1);
        assert!(device.resources().has_resource_record(a));
        assert_eq!(device.release(a).unwrap(), 0);
        assert!(!device.resources().has_resource_record(a));
        assert!(!device.resources().has_current_resource(a));
        assert!(matches!(device.release(a), Err(CaptureError::UnknownResource(_))));
    }

    #[test]
    fn counter_view_keeps_buffer_record() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(&dir);
        let buffer = device.create_buffer(&buffer_desc(16), None).unwrap();
        let view = device.create_counter_view(buffer).unwrap();

        device.release(buffer).unwrap();
        assert!(device.resources().has_resource_record(buffer));
        device.release(view).unwrap();
        assert!(!device.resources().has_resource_record(buffer));

        assert!(matches!(
            device.create_counter_view(view),
            Err(CaptureError::UnknownResource(_))
        ));
    }

    #[test]
    fn renames_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(&dir);
        let buffer = device.create_buffer(&buffer_desc(4), None).unwrap();
        for name in &["first", "second", "third"] {
            device.set_resource_name(buffer, name).unwrap();
        }
        let record = device.resources().get_resource_record(buffer).unwrap();
        let types: Vec<_> = record.chunks().iter().map(|c| c.ty()).collect();
        assert_eq!(types, [ChunkType::CreateBuffer, ChunkType::SetResourceName]);
    }

    #[test]
    fn rename_in_frame_references_resource() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(&dir);
        let (swap, _) = swap_chain(&device);
        let buffer = device.create_buffer(&buffer_desc(4), None).unwrap();

        device.trigger_capture();
        device.present(swap, 0).unwrap();
        assert_eq!(device.resources().frame_ref(buffer), None);
        device.set_resource_name(buffer, "in frame").unwrap();
        assert_eq!(device.resources().frame_ref(buffer), Some(FrameRefType::ReadOnly));
        assert_eq!(device.immediate_context().event_id().unwrap(), 0);

        let record = device.resources().get_resource_record(buffer).unwrap();
        let types: Vec<_> = record.chunks().iter().map(|c| c.ty()).collect();
        assert_eq!(types, [ChunkType::CreateBuffer, ChunkType::SetResourceName]);
    }

    #[test]
    fn writes_outside_capture_mark_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(&dir);
        let ctx = device.immediate_context();
        let buffer = device.create_buffer(&buffer_desc(4), Some(&[1, 2, 3, 4])).unwrap();
        assert!(!device.resources().is_dirty(buffer));

        ctx.update_subresource(buffer, 0, SubresourceData::packed(vec![5; 4], 4, 4))
            .unwrap();
        assert!(device.resources().is_dirty(buffer));
        assert_eq!(device.with_driver(|d| d.buffer_bytes(device.handle(buffer).unwrap())), [5; 4]);
    }

    #[test]
    fn initial_contents_prepared_once() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(&dir);
        let (swap, _) = swap_chain(&device);
        let ctx = device.immediate_context();
        let buffer = device.create_buffer(&buffer_desc(4), None).unwrap();
        ctx.update_subresource(buffer, 0, SubresourceData::packed(vec![7; 4], 4, 4))
            .unwrap();

        device.trigger_capture();
        device.present(swap, 0).unwrap();
        assert!(device.is_capturing());

        device.prepare_initial_contents(buffer);
        device.prepare_initial_contents(buffer);
        assert_eq!(device.resources().initial_contents_count(), 1);
        let live_objects = device.with_driver(|d| d.object_count());
        device.prepare_initial_contents(buffer);
        assert_eq!(device.with_driver(|d| d.object_count()), live_objects);
    }

    #[test]
    fn staging_failure_skips_resource() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(&dir);
        let (swap, _) = swap_chain(&device);
        let ctx = device.immediate_context();
        let buffer = device.create_buffer(&buffer_desc(4), None).unwrap();
        ctx.update_subresource(buffer, 0, SubresourceData::packed(vec![7; 4], 4, 4))
            .unwrap();

        device.trigger_capture();
        device.present(swap, 0).unwrap();
        device.with_driver(|d| d.fail_staging(true));
        ctx.set_constant_buffer(Some(buffer)).unwrap();
        ctx.draw(1, 0).unwrap();
        assert!(!device.resources().has_initial_contents(buffer));
        device.with_driver(|d| d.fail_staging(false));

        device.present(swap, 0).unwrap();
        let captures = device.captures();
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].outcome, crate::frame::FrameOutcome::Succeeded);
    }

    #[test]
    fn uncapped_unmap_retries() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(&dir);
        let (swap, _) = swap_chain(&device);
        let ctx = device.immediate_context();
        let buffer = device.create_buffer(&buffer_desc(4), None).unwrap();

        device.trigger_capture();
        let mapped = ctx.map(buffer, 0, MapType::Write).unwrap();
        device.present(swap, 0).unwrap();
        assert!(device.is_capturing());
        ctx.unmap(buffer, 0, Some(&mapped.data)).unwrap();

        // The frame fails and the next one is tried instead.
        device.present(swap, 0).unwrap();
        assert!(device.is_capturing());
        assert!(device.captures().is_empty());

        device.present(swap, 0).unwrap();
        let captures = device.captures();
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].frame_number, 3);
        assert!(captures[0].path.as_ref().unwrap().exists());
    }

    #[test]
    fn app_controlled_failure_reports_reason() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(&dir);
        let ctx = device.immediate_context();
        let deferred = device.create_deferred_context().unwrap();
        let deferred = device.context(deferred).unwrap();
        deferred.draw(3, 0).unwrap();
        let list = deferred.finish_command_list(false).unwrap();

        device.start_frame_capture().unwrap();
        ctx.execute_command_list(list, false).unwrap();
        let frame = device.end_frame_capture().unwrap();
        assert_eq!(
            frame.outcome,
            crate::frame::FrameOutcome::Failed(CaptureFailReason::UncappedCommandList)
        );
        assert!(!device.is_capturing());
        assert_eq!(
            device.overlay_text().unwrap(),
            "Failed capture at frame 1:\n    Uncapped command list"
        );
    }

    #[test]
    fn empty_command_list_recorded_outside_capture_is_usable() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(&dir);
        let ctx = device.immediate_context();
        let deferred = device.create_deferred_context().unwrap();
        let list = device.context(deferred).unwrap().finish_command_list(true).unwrap();

        device.start_frame_capture().unwrap();
        ctx.execute_command_list(list, true).unwrap();
        assert_eq!(ctx.event_id().unwrap(), 2);
        let frame = device.end_frame_capture().unwrap();
        assert_eq!(frame.outcome, crate::frame::FrameOutcome::Succeeded);
    }

    #[test]
    fn vsync_and_fullscreen_options() {
        let dir = tempfile::tempdir().unwrap();
        let options = CaptureOptions {
            capture_dir: dir.path().to_path_buf(),
            allow_fullscreen: false,
            ..CaptureOptions::default()
        };
        let device = Device::new(SoftDriver::new(), options);
        let (swap, _) = device
            .create_swap_chain(&SwapChainDesc {
                width: 8,
                height: 8,
                format: Format::Rgba8Unorm,
                fullscreen: true,
            })
            .unwrap();
        let tracked = device.resources().get_current_resource(swap).unwrap();
        assert!(matches!(tracked.kind, ResourceKind::SwapChain(desc) if !desc.fullscreen));

        device.present(swap, 1).unwrap();
        assert_eq!(device.with_driver(|d| d.present_count(tracked.handle)), 1);
        assert_eq!(device.frame_counter(), 1);
    }
}
