//! A software implementation of `Driver`.
//!
//! `SoftDriver` keeps every resource in CPU memory and does just enough
//! "rendering" to make captures and replays checkable:
//!
//! - A draw writes one texel per vertex, starting at texel `start_vertex`,
//!   into subresource 0 of each bound render target. The texel value is the
//!   start of the bound constant buffer, or all ones if none is bound. Draws
//!   also advance the bound counter view's counter and the bound stream-out
//!   target's vertex count.
//!
//! - Deferred contexts record operations, and executing a command list runs
//!   them on the immediate context.
//!
//! - Mapped textures have rows padded to a multiple of 64 bytes, so code
//!   that assumes tight packing gets caught.
//!
//! Creating staging resources and mapping can be made to fail, to exercise
//! the capture layer's recovery paths.

use crate::driver::{Driver, DriverError, MapType, SubresourceData};
use crate::resource::{BufferDesc, SwapChainDesc, TextureDesc, Usage};

use std::collections::HashMap;

pub type SoftHandle = u32;

const IMMEDIATE: SoftHandle = 1;
const ROW_ALIGNMENT: u32 = 64;

#[derive(Clone, Debug)]
enum Op {
    SetRenderTargets(Vec<SoftHandle>),
    SetConstantBuffer(Option<SoftHandle>),
    SetCounterView(Option<SoftHandle>, Option<u32>),
    SetStreamOutTarget(Option<SoftHandle>),
    ClearState,
    ClearRenderTarget(SoftHandle, [f32; 4]),
    Draw(u32, u32),
    DrawAuto,
    Dispatch(u32, u32, u32),
    UpdateSubresource(SoftHandle, u32, SubresourceData),
    CopyResource(SoftHandle, SoftHandle),
    CopyStructureCount(SoftHandle, SoftHandle),
}

#[derive(Clone, Debug, Default)]
struct Bindings {
    render_targets: Vec<SoftHandle>,
    constant_buffer: Option<SoftHandle>,
    counter_view: Option<SoftHandle>,
    stream_out: Option<SoftHandle>,
}

#[derive(Debug)]
struct Buffer {
    desc: BufferDesc,
    data: Vec<u8>,
    stream_out_count: u64,
}

#[derive(Debug)]
struct Texture {
    desc: TextureDesc,
    /// Tightly packed subresources. A multisampled subresource holds each
    /// sample's image in turn.
    subresources: Vec<Vec<u8>>,
}

#[derive(Debug)]
enum Object {
    Context { deferred: bool, validation: bool, ops: Vec<Op> },
    CommandList(Vec<Op>),
    Buffer(Buffer),
    Texture(Texture),
    CounterView { buffer: SoftHandle, counter: u32 },
    SwapChain { backbuffer: SoftHandle, presents: u32 },
}

#[derive(Debug)]
pub struct SoftDriver {
    objects: HashMap<SoftHandle, Object>,
    bindings: HashMap<SoftHandle, Bindings>,
    next_handle: SoftHandle,
    fail_staging: bool,
    fail_map: bool,
    messages: Vec<String>,
}

impl SoftDriver {
    pub fn new() -> SoftDriver {
        let mut objects = HashMap::new();
        objects.insert(
            IMMEDIATE,
            Object::Context {
                deferred: false,
                validation: false,
                ops: vec![],
            },
        );
        SoftDriver {
            objects,
            bindings: HashMap::new(),
            next_handle: IMMEDIATE + 1,
            fail_staging: false,
            fail_map: false,
            messages: vec![],
        }
    }

    /// Make creating staging resources fail.
    pub fn fail_staging(&mut self, fail: bool) {
        self.fail_staging = fail;
    }

    /// Make every `map` fail.
    pub fn fail_map(&mut self, fail: bool) {
        self.fail_map = fail;
    }

    /// The packed contents of one subresource of a texture.
    pub fn texel_bytes(&self, texture: SoftHandle, subresource: u32) -> Vec<u8> {
        match self.objects.get(&texture) {
            Some(Object::Texture(t)) => t.subresources.get(subresource as usize).cloned().unwrap_or_default(),
            _ => vec![],
        }
    }

    pub fn buffer_bytes(&self, buffer: SoftHandle) -> Vec<u8> {
        match self.objects.get(&buffer) {
            Some(Object::Buffer(b)) => b.data.clone(),
            _ => vec![],
        }
    }

    pub fn counter_value(&self, view: SoftHandle) -> u32 {
        match self.objects.get(&view) {
            Some(Object::CounterView { counter, .. }) => *counter,
            _ => 0,
        }
    }

    pub fn present_count(&self, swap_chain: SoftHandle) -> u32 {
        match self.objects.get(&swap_chain) {
            Some(Object::SwapChain { presents, .. }) => *presents,
            _ => 0,
        }
    }

    pub fn texture_desc(&self, texture: SoftHandle) -> Option<TextureDesc> {
        match self.objects.get(&texture) {
            Some(Object::Texture(t)) => Some(t.desc),
            _ => None,
        }
    }

    /// Number of objects alive, including the immediate context.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn alloc(&mut self, object: Object) -> SoftHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.objects.insert(handle, object);
        handle
    }

    fn complain(&mut self, ctx: SoftHandle, message: String) {
        let validation = match self.objects.get(&ctx) {
            Some(Object::Context { validation, .. }) => *validation,
            _ => true,
        };
        if validation || ctx == IMMEDIATE {
            self.messages.push(message);
        }
    }

    /// Run `op` on `ctx`, or record it if `ctx` is deferred.
    fn submit(&mut self, ctx: SoftHandle, op: Op) {
        if let Some(Object::Context { deferred: true, ops, .. }) = self.objects.get_mut(&ctx) {
            ops.push(op);
            return;
        }
        self.run(ctx, op);
    }

    fn run(&mut self, ctx: SoftHandle, op: Op) {
        match op {
            Op::SetRenderTargets(targets) => self.bindings.entry(ctx).or_default().render_targets = targets,
            Op::SetConstantBuffer(buffer) => self.bindings.entry(ctx).or_default().constant_buffer = buffer,
            Op::SetCounterView(view, initial_count) => {
                self.bindings.entry(ctx).or_default().counter_view = view;
                if let (Some(view), Some(count)) = (view, initial_count) {
                    if let Some(Object::CounterView { counter, .. }) = self.objects.get_mut(&view) {
                        *counter = count;
                    }
                }
            }
            Op::SetStreamOutTarget(buffer) => self.bindings.entry(ctx).or_default().stream_out = buffer,
            Op::ClearState => {
                self.bindings.remove(&ctx);
            }
            Op::ClearRenderTarget(target, color) => self.clear(ctx, target, color),
            Op::Draw(count, start) => self.draw(ctx, count, start, true),
            Op::DrawAuto => {
                let bindings = self.bindings.get(&ctx).cloned().unwrap_or_default();
                let count = match bindings.stream_out.and_then(|b| self.objects.get(&b)) {
                    Some(Object::Buffer(b)) => b.stream_out_count as u32,
                    _ => 0,
                };
                self.draw(ctx, count, 0, false);
            }
            Op::Dispatch(x, y, z) => {
                let view = self.bindings.get(&ctx).and_then(|b| b.counter_view);
                if let Some(Object::CounterView { counter, .. }) = view.and_then(|v| self.objects.get_mut(&v)) {
                    *counter = counter.wrapping_add(x * y * z);
                }
            }
            Op::UpdateSubresource(resource, subresource, data) => self.update(ctx, resource, subresource, &data),
            Op::CopyResource(dst, src) => self.copy(ctx, dst, src),
            Op::CopyStructureCount(dst, view) => {
                let count = self.counter_value(view);
                match self.objects.get_mut(&dst) {
                    Some(Object::Buffer(b)) if b.data.len() >= 4 => b.data[..4].copy_from_slice(&count.to_le_bytes()),
                    _ => self.complain(ctx, format!("copy_structure_count: bad destination {}", dst)),
                }
            }
        }
    }

    fn draw(&mut self, ctx: SoftHandle, count: u32, start: u32, stream_out: bool) {
        let bindings = self.bindings.get(&ctx).cloned().unwrap_or_default();
        let value = match bindings.constant_buffer.and_then(|b| self.objects.get(&b)) {
            Some(Object::Buffer(b)) => b.data.clone(),
            _ => vec![0xff; 16],
        };

        for target in &bindings.render_targets {
            if let Some(Object::Texture(t)) = self.objects.get_mut(target) {
                let texel_size = t.desc.format.block_bytes() as usize;
                let mut texel: Vec<u8> = value.iter().copied().take(texel_size).collect();
                texel.resize(texel_size, 0);

                let samples = t.desc.sample_count.max(1) as usize;
                if let Some(image) = t.subresources.get_mut(0) {
                    let sample_bytes = image.len() / samples;
                    for sample in 0..samples {
                        for i in start as usize..(start + count) as usize {
                            let offset = sample * sample_bytes + i * texel_size;
                            if offset + texel_size > (sample + 1) * sample_bytes {
                                break;
                            }
                            image[offset..offset + texel_size].copy_from_slice(&texel);
                        }
                    }
                }
            }
        }

        if let Some(Object::CounterView { counter, .. }) = bindings.counter_view.and_then(|v| self.objects.get_mut(&v)) {
            *counter = counter.wrapping_add(count);
        }
        if stream_out {
            if let Some(Object::Buffer(b)) = bindings.stream_out.and_then(|b| self.objects.get_mut(&b)) {
                b.stream_out_count += count as u64;
            }
        }
    }

    fn clear(&mut self, ctx: SoftHandle, target: SoftHandle, color: [f32; 4]) {
        let texel = match self.objects.get(&target) {
            Some(Object::Texture(t)) => t.desc.format.encode_color(color),
            _ => None,
        };
        match (texel, self.objects.get_mut(&target)) {
            (Some(texel), Some(Object::Texture(t))) => {
                for image in &mut t.subresources {
                    for chunk in image.chunks_exact_mut(texel.len()) {
                        chunk.copy_from_slice(&texel);
                    }
                }
            }
            _ => self.complain(ctx, format!("clear_render_target: can't clear {}", target)),
        }
    }

    fn update(&mut self, ctx: SoftHandle, resource: SoftHandle, subresource: u32, data: &SubresourceData) {
        match self.objects.get_mut(&resource) {
            Some(Object::Buffer(b)) => {
                let len = b.data.len().min(data.data.len());
                b.data[..len].copy_from_slice(&data.data[..len]);
            }
            Some(Object::Texture(t)) if !t.desc.is_multisampled() => {
                let packed = unpack(&t.desc, subresource, data);
                if let Some(image) = t.subresources.get_mut(subresource as usize) {
                    let len = image.len().min(packed.len());
                    image[..len].copy_from_slice(&packed[..len]);
                }
            }
            _ => self.complain(ctx, format!("update_subresource: bad resource {}", resource)),
        }
    }

    fn copy(&mut self, ctx: SoftHandle, dst: SoftHandle, src: SoftHandle) {
        let source = match self.objects.get(&src) {
            Some(Object::Buffer(b)) => vec![b.data.clone()],
            Some(Object::Texture(t)) => t.subresources.clone(),
            _ => {
                self.complain(ctx, format!("copy_resource: bad source {}", src));
                return;
            }
        };
        match self.objects.get_mut(&dst) {
            Some(Object::Buffer(b)) => {
                let len = b.data.len().min(source[0].len());
                b.data[..len].copy_from_slice(&source[0][..len]);
            }
            Some(Object::Texture(t)) if t.subresources.len() == source.len() => {
                for (image, data) in t.subresources.iter_mut().zip(source) {
                    if image.len() == data.len() {
                        *image = data;
                    }
                }
            }
            _ => self.complain(ctx, format!("copy_resource: {} and {} don't match", dst, src)),
        }
    }

    fn texture(&self, handle: SoftHandle) -> Result<&Texture, DriverError> {
        match self.objects.get(&handle) {
            Some(Object::Texture(t)) => Ok(t),
            _ => Err(DriverError::InvalidHandle(format!("{} is not a texture", handle))),
        }
    }

    fn texture_mut(&mut self, handle: SoftHandle) -> Result<&mut Texture, DriverError> {
        match self.objects.get_mut(&handle) {
            Some(Object::Texture(t)) => Ok(t),
            _ => Err(DriverError::InvalidHandle(format!("{} is not a texture", handle))),
        }
    }
}

impl Default for SoftDriver {
    fn default() -> SoftDriver {
        SoftDriver::new()
    }
}

/// Pitch of a mapped texture row.
fn mapped_row_pitch(desc: &TextureDesc, width: u32) -> u32 {
    let row = desc.format.row_bytes(width);
    (row + ROW_ALIGNMENT - 1) / ROW_ALIGNMENT * ROW_ALIGNMENT
}

/// Strip the row and depth padding from `data`.
fn unpack(desc: &TextureDesc, subresource: u32, data: &SubresourceData) -> Vec<u8> {
    let (mip, _) = desc.subresource_mip_slice(subresource);
    let (width, height, depth) = desc.mip_extent(mip);
    let row_bytes = desc.format.row_bytes(width) as usize;
    let rows = desc.format.row_count(height) as usize;
    let mut packed = Vec::with_capacity(row_bytes * rows * depth as usize);
    for z in 0..depth as usize {
        for y in 0..rows {
            let start = z * data.depth_pitch as usize + y * data.row_pitch as usize;
            match data.data.get(start..start + row_bytes) {
                Some(row) => packed.extend_from_slice(row),
                None => packed.resize(packed.len() + row_bytes, 0),
            }
        }
    }
    packed
}

impl Driver for SoftDriver {
    type Handle = SoftHandle;

    fn immediate_context(&self) -> SoftHandle {
        IMMEDIATE
    }

    fn create_deferred_context(&mut self, debug: bool) -> Result<SoftHandle, DriverError> {
        Ok(self.alloc(Object::Context {
            deferred: true,
            validation: debug,
            ops: vec![],
        }))
    }

    fn create_buffer(&mut self, desc: &BufferDesc, initial: Option<&[u8]>) -> Result<SoftHandle, DriverError> {
        if desc.usage == Usage::Staging && self.fail_staging {
            return Err(DriverError::OutOfMemory("staging resource"));
        }
        let mut data = vec![0; desc.byte_width as usize];
        if let Some(initial) = initial {
            let len = data.len().min(initial.len());
            data[..len].copy_from_slice(&initial[..len]);
        }
        Ok(self.alloc(Object::Buffer(Buffer {
            desc: *desc,
            data,
            stream_out_count: 0,
        })))
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        initial: Option<&[SubresourceData]>,
    ) -> Result<SoftHandle, DriverError> {
        if desc.usage == Usage::Staging && self.fail_staging {
            return Err(DriverError::OutOfMemory("staging resource"));
        }
        let samples = desc.sample_count.max(1) as usize;
        let mut subresources: Vec<Vec<u8>> = (0..desc.subresource_count())
            .map(|s| vec![0; desc.subresource_bytes(s) * samples])
            .collect();
        if let Some(initial) = initial {
            if desc.is_multisampled() {
                return Err(DriverError::Unsupported("multisampled textures can't have initial data"));
            }
            for (s, data) in initial.iter().enumerate().take(subresources.len()) {
                subresources[s] = unpack(desc, s as u32, data);
            }
        }
        Ok(self.alloc(Object::Texture(Texture { desc: *desc, subresources })))
    }

    fn create_counter_view(&mut self, buffer: SoftHandle) -> Result<SoftHandle, DriverError> {
        match self.objects.get(&buffer) {
            Some(Object::Buffer(_)) => Ok(self.alloc(Object::CounterView { buffer, counter: 0 })),
            _ => Err(DriverError::InvalidHandle(format!("{} is not a buffer", buffer))),
        }
    }

    fn create_swap_chain(&mut self, desc: &SwapChainDesc) -> Result<(SoftHandle, SoftHandle), DriverError> {
        let backbuffer = self.create_texture(&desc.backbuffer_desc(), None)?;
        let swap_chain = self.alloc(Object::SwapChain { backbuffer, presents: 0 });
        Ok((swap_chain, backbuffer))
    }

    fn destroy(&mut self, handle: SoftHandle) {
        if handle == IMMEDIATE {
            return;
        }
        if let Some(Object::SwapChain { backbuffer, .. }) = self.objects.remove(&handle) {
            self.objects.remove(&backbuffer);
        }
        self.bindings.remove(&handle);
    }

    fn set_render_targets(&mut self, ctx: SoftHandle, targets: &[SoftHandle]) {
        self.submit(ctx, Op::SetRenderTargets(targets.to_vec()));
    }

    fn set_constant_buffer(&mut self, ctx: SoftHandle, buffer: Option<SoftHandle>) {
        self.submit(ctx, Op::SetConstantBuffer(buffer));
    }

    fn set_counter_view(&mut self, ctx: SoftHandle, view: Option<SoftHandle>, initial_count: Option<u32>) {
        self.submit(ctx, Op::SetCounterView(view, initial_count));
    }

    fn set_stream_out_target(&mut self, ctx: SoftHandle, buffer: Option<SoftHandle>) {
        self.submit(ctx, Op::SetStreamOutTarget(buffer));
    }

    fn clear_state(&mut self, ctx: SoftHandle) {
        self.submit(ctx, Op::ClearState);
    }

    fn clear_render_target(&mut self, ctx: SoftHandle, target: SoftHandle, color: [f32; 4]) {
        self.submit(ctx, Op::ClearRenderTarget(target, color));
    }

    fn draw(&mut self, ctx: SoftHandle, vertex_count: u32, start_vertex: u32) {
        self.submit(ctx, Op::Draw(vertex_count, start_vertex));
    }

    fn draw_auto(&mut self, ctx: SoftHandle) {
        self.submit(ctx, Op::DrawAuto);
    }

    fn dispatch(&mut self, ctx: SoftHandle, x: u32, y: u32, z: u32) {
        self.submit(ctx, Op::Dispatch(x, y, z));
    }

    fn update_subresource(&mut self, ctx: SoftHandle, resource: SoftHandle, subresource: u32, data: &SubresourceData) {
        self.submit(ctx, Op::UpdateSubresource(resource, subresource, data.clone()));
    }

    fn copy_resource(&mut self, ctx: SoftHandle, dst: SoftHandle, src: SoftHandle) {
        self.submit(ctx, Op::CopyResource(dst, src));
    }

    fn copy_ms_to_array(&mut self, dst: SoftHandle, src: SoftHandle) -> Result<(), DriverError> {
        let source = self.texture(src)?;
        let samples = source.desc.sample_count.max(1) as usize;
        let slices: Vec<Vec<u8>> = source
            .subresources
            .iter()
            .flat_map(|image| {
                let sample_bytes = image.len() / samples;
                image.chunks(sample_bytes.max(1)).map(<[u8]>::to_vec).collect::<Vec<_>>()
            })
            .collect();

        let target = self.texture_mut(dst)?;
        if target.subresources.len() != slices.len() {
            return Err(DriverError::Unsupported("array size doesn't match sample count"));
        }
        target.subresources = slices;
        Ok(())
    }

    fn copy_array_to_ms(&mut self, dst: SoftHandle, src: SoftHandle) -> Result<(), DriverError> {
        let slices = self.texture(src)?.subresources.clone();
        let target = self.texture_mut(dst)?;
        let samples = target.desc.sample_count.max(1) as usize;
        if slices.len() != target.subresources.len() * samples {
            return Err(DriverError::Unsupported("array size doesn't match sample count"));
        }
        for (image, group) in target.subresources.iter_mut().zip(slices.chunks(samples)) {
            *image = group.concat();
        }
        Ok(())
    }

    fn copy_structure_count(&mut self, ctx: SoftHandle, dst: SoftHandle, view: SoftHandle) {
        self.submit(ctx, Op::CopyStructureCount(dst, view));
    }

    fn stream_out_count(&mut self, buffer: SoftHandle) -> u64 {
        match self.objects.get(&buffer) {
            Some(Object::Buffer(b)) => b.stream_out_count,
            _ => 0,
        }
    }

    fn set_stream_out_count(&mut self, buffer: SoftHandle, count: u64) {
        if let Some(Object::Buffer(b)) = self.objects.get_mut(&buffer) {
            b.stream_out_count = count;
        }
    }

    fn map(
        &mut self,
        _ctx: SoftHandle,
        resource: SoftHandle,
        subresource: u32,
        _map_type: MapType,
    ) -> Result<SubresourceData, DriverError> {
        if self.fail_map {
            return Err(DriverError::MapFailed { subresource });
        }
        match self.objects.get(&resource) {
            Some(Object::Buffer(b)) => {
                let len = b.data.len() as u32;
                Ok(SubresourceData::packed(b.data.clone(), len, len))
            }
            Some(Object::Texture(t)) if !t.desc.is_multisampled() => {
                let image = t
                    .subresources
                    .get(subresource as usize)
                    .ok_or(DriverError::MapFailed { subresource })?;
                let (mip, _) = t.desc.subresource_mip_slice(subresource);
                let (width, height, depth) = t.desc.mip_extent(mip);
                let row_bytes = t.desc.format.row_bytes(width) as usize;
                let rows = t.desc.format.row_count(height) as usize;
                let row_pitch = mapped_row_pitch(&t.desc, width) as usize;
                let depth_pitch = row_pitch * rows;

                let mut data = vec![0; depth_pitch * depth as usize];
                for (i, row) in image.chunks(row_bytes).enumerate() {
                    let start = (i / rows) * depth_pitch + (i % rows) * row_pitch;
                    data[start..start + row.len()].copy_from_slice(row);
                }
                Ok(SubresourceData::packed(data, row_pitch as u32, depth_pitch as u32))
            }
            _ => Err(DriverError::MapFailed { subresource }),
        }
    }

    fn unmap(&mut self, _ctx: SoftHandle, resource: SoftHandle, subresource: u32, written: Option<&[u8]>) {
        let written = match written {
            Some(written) => written,
            None => return,
        };
        match self.objects.get_mut(&resource) {
            Some(Object::Buffer(b)) => {
                let len = b.data.len().min(written.len());
                b.data[..len].copy_from_slice(&written[..len]);
            }
            Some(Object::Texture(t)) => {
                let (mip, _) = t.desc.subresource_mip_slice(subresource);
                let (width, height, _) = t.desc.mip_extent(mip);
                let row_pitch = mapped_row_pitch(&t.desc, width);
                let depth_pitch = row_pitch * t.desc.format.row_count(height);
                let data = SubresourceData::packed(written.to_vec(), row_pitch, depth_pitch);
                let packed = unpack(&t.desc, subresource, &data);
                if let Some(image) = t.subresources.get_mut(subresource as usize) {
                    *image = packed;
                }
            }
            _ => {}
        }
    }

    fn finish_command_list(&mut self, ctx: SoftHandle, restore_state: bool) -> Result<SoftHandle, DriverError> {
        let ops = match self.objects.get_mut(&ctx) {
            Some(Object::Context { deferred: true, ops, .. }) => std::mem::take(ops),
            _ => return Err(DriverError::InvalidHandle(format!("{} is not a deferred context", ctx))),
        };
        if !restore_state {
            self.bindings.remove(&ctx);
        }
        Ok(self.alloc(Object::CommandList(ops)))
    }

    fn execute_command_list(&mut self, ctx: SoftHandle, list: SoftHandle, restore_state: bool) {
        let ops = match self.objects.get(&list) {
            Some(Object::CommandList(ops)) => ops.clone(),
            _ => {
                self.complain(ctx, format!("execute_command_list: {} is not a command list", list));
                return;
            }
        };
        let saved = self.bindings.remove(&ctx);
        for op in ops {
            self.run(ctx, op);
        }
        self.bindings.remove(&ctx);
        if let (true, Some(saved)) = (restore_state, saved) {
            self.bindings.insert(ctx, saved);
        }
    }

    fn present(&mut self, swap_chain: SoftHandle, _sync_interval: u32) -> Result<(), DriverError> {
        match self.objects.get_mut(&swap_chain) {
            Some(Object::SwapChain { presents, .. }) => {
                *presents += 1;
                Ok(())
            }
            _ => Err(DriverError::InvalidHandle(format!("{} is not a swap chain", swap_chain))),
        }
    }

    fn take_debug_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::resource::BindFlags;

    #[test]
    fn draw_writes_constant_buffer_texels() {
        let mut driver = SoftDriver::new();
        let ctx = driver.immediate_context();
        let desc = TextureDesc::new_2d(4, 1, Format::Rgba8Unorm, BindFlags::RENDER_TARGET);
        let target = driver.create_texture(&desc, None).unwrap();
        let cb_desc = BufferDesc {
            byte_width: 4,
            bind: BindFlags::CONSTANT_BUFFER,
            usage: Usage::Default,
        };
        let cb = driver.create_buffer(&cb_desc, Some(&[1, 2, 3, 4])).unwrap();

        driver.set_render_targets(ctx, &[target]);
        driver.set_constant_buffer(ctx, Some(cb));
        Driver::draw(&mut driver, ctx, 2, 1);
        assert_eq!(
            driver.texel_bytes(target, 0),
            [0, 0, 0, 0, 1, 2, 3, 4, 1, 2, 3, 4, 0, 0, 0, 0]
        );
    }

    #[test]
    fn mapped_rows_are_padded() {
        let mut driver = SoftDriver::new();
        let ctx = driver.immediate_context();
        let desc = TextureDesc::new_2d(3, 2, Format::Rgba8Unorm, BindFlags::SHADER_RESOURCE);
        let texels: Vec<u8> = (0..24).collect();
        let texture = driver
            .create_texture(&desc, Some(&[SubresourceData::packed(texels.clone(), 12, 24)]))
            .unwrap();

        let mapped = driver.map(ctx, texture, 0, MapType::Read).unwrap();
        assert_eq!(mapped.row_pitch, 64);
        assert_eq!(&mapped.data[..12], &texels[..12]);
        assert_eq!(&mapped.data[64..76], &texels[12..]);

        let mut data = mapped.data;
        data[64] = 99;
        driver.unmap(ctx, texture, 0, Some(&data));
        assert_eq!(driver.texel_bytes(texture, 0)[12], 99);
    }

    #[test]
    fn deferred_ops_run_on_execute() {
        let mut driver = SoftDriver::new();
        let ctx = driver.immediate_context();
        let deferred = driver.create_deferred_context(false).unwrap();
        let desc = TextureDesc::new_2d(2, 1, Format::R32Uint, BindFlags::RENDER_TARGET);
        let target = driver.create_texture(&desc, None).unwrap();

        driver.set_render_targets(deferred, &[target]);
        Driver::draw(&mut driver, deferred, 1, 0);
        assert_eq!(driver.texel_bytes(target, 0), [0; 8]);

        let list = driver.finish_command_list(deferred, false).unwrap();
        driver.execute_command_list(ctx, list, false);
        assert_eq!(driver.texel_bytes(target, 0), [0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]);
    }

    #[test]
    fn failure_injection() {
        let mut driver = SoftDriver::new();
        let ctx = driver.immediate_context();
        let desc = BufferDesc {
            byte_width: 4,
            bind: BindFlags::empty(),
            usage: Usage::Default,
        };
        let buffer = driver.create_buffer(&desc, None).unwrap();

        driver.fail_staging(true);
        assert!(driver.create_buffer(&desc.staging(), None).is_err());
        assert!(driver.create_buffer(&desc, None).is_ok());

        driver.fail_map(true);
        assert_eq!(
            driver.map(ctx, buffer, 0, MapType::Read),
            Err(DriverError::MapFailed { subresource: 0 })
        );
    }
}
