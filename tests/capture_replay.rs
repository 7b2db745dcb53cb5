use gpu_capture::chunk::Chunk;
use gpu_capture::file_stream::{CONTAINER_VERSION, MAGIC};
use gpu_capture::serialize::{write_framed, ChunkBuilder};
use gpu_capture::{
    BindFlags, BufferDesc, CaptureFailReason, CaptureFile, CaptureOptions, ChunkType, Device, Format, FrameOutcome, MapType,
    ReplayError, Replayer, ResourceId, SoftDriver, SubresourceData, SwapChainDesc, TextureDesc, Usage,
};

use std::path::Path;

fn device(dir: &Path, options: CaptureOptions) -> Device<SoftDriver> {
    let options = CaptureOptions {
        capture_dir: dir.to_path_buf(),
        ..options
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

fn constant_buffer(device: &Device<SoftDriver>, usage: Usage, contents: [u8; 4]) -> ResourceId {
    let desc = BufferDesc {
        byte_width: 4,
        bind: BindFlags::CONSTANT_BUFFER,
        usage,
    };
    device.create_buffer(&desc, Some(&contents)).unwrap()
}

fn backbuffer_texels(device: &Device<SoftDriver>, backbuffer: ResourceId) -> Vec<u8> {
    let handle = device.handle(backbuffer).unwrap();
    device.with_driver(|d| d.texel_bytes(handle, 0))
}

/// The frame's chunks: type, and for context chunks the context each was
/// recorded on.
fn frame_chunks(path: &Path) -> Vec<(ChunkType, Option<ResourceId>)> {
    let mut file = CaptureFile::open(path).unwrap();
    let mut in_frame = false;
    let mut chunks = vec![];
    while !file.chunks.at_end() {
        let header = file.chunks.push_context().unwrap();
        let ty = header.chunk_type().unwrap();
        if in_frame {
            let context = if ty.is_context() {
                Some(file.chunks.payload().field::<ResourceId>("context").unwrap())
            } else {
                None
            };
            chunks.push((ty, context));
        }
        in_frame |= ty == ChunkType::CaptureScope;
        file.chunks.skip_current_chunk();
    }
    chunks
}

#[test]
fn deferred_commands_are_inlined_at_execute() {
    let dir = tempfile::tempdir().unwrap();
    let device = device(dir.path(), CaptureOptions::default());
    let (swap, backbuffer) = swap_chain(&device);
    let ctx = device.immediate_context();
    let cb = constant_buffer(&device, Usage::Default, [10, 20, 30, 40]);
    ctx.set_render_targets(&[backbuffer]).unwrap();
    ctx.set_constant_buffer(Some(cb)).unwrap();

    device.queue_capture(5);
    for _ in 0..5 {
        assert!(!device.is_capturing());
        device.present(swap, 0).unwrap();
    }
    assert!(device.is_capturing());

    ctx.draw(4, 0).unwrap();
    ctx.draw(4, 4).unwrap();
    ctx.draw(4, 8).unwrap();

    let deferred_id = device.create_deferred_context().unwrap();
    let deferred = device.context(deferred_id).unwrap();
    deferred.set_render_targets(&[backbuffer]).unwrap();
    deferred.set_constant_buffer(Some(cb)).unwrap();
    deferred.draw(4, 12).unwrap();
    let list = deferred.finish_command_list(false).unwrap();
    ctx.execute_command_list(list, true).unwrap();
    device.present(swap, 0).unwrap();

    let captures = device.captures();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].frame_number, 6);
    assert_eq!(captures[0].outcome, FrameOutcome::Succeeded);
    let path = captures[0].path.clone().unwrap();
    assert_eq!(path, dir.path().join("capture_frame6.cap"));

    let chunks = frame_chunks(&path);
    let types: Vec<ChunkType> = chunks.iter().map(|&(ty, _)| ty).collect();
    assert_eq!(types.iter().filter(|ty| ty.is_draw()).count(), 4);
    assert_eq!(types.iter().filter(|&&ty| ty == ChunkType::ExecuteCommandList).count(), 1);
    assert_eq!(types.first(), Some(&ChunkType::BeginCaptureFrame));
    assert_eq!(types.last(), Some(&ChunkType::EndCaptureFrame));

    // The deferred context's chunks follow the execute, in order.
    let execute = types.iter().position(|&ty| ty == ChunkType::ExecuteCommandList).unwrap();
    assert_eq!(
        &chunks[execute + 1..chunks.len() - 1],
        &[
            (ChunkType::SetRenderTargets, Some(deferred_id)),
            (ChunkType::SetConstantBuffer, Some(deferred_id)),
            (ChunkType::Draw, Some(deferred_id)),
            (ChunkType::FinishCommandList, Some(deferred_id)),
        ]
    );
    assert!(chunks[..execute]
        .iter()
        .all(|&(_, context)| context != Some(deferred_id)));
}

#[test]
fn replay_reproduces_captured_pixels() {
    let dir = tempfile::tempdir().unwrap();
    let device = device(dir.path(), CaptureOptions::default());
    let (swap, backbuffer) = swap_chain(&device);
    let ctx = device.immediate_context();
    device.set_resource_name(backbuffer, "back buffer").unwrap();

    // Changed before the frame, so its initial contents must be saved.
    let cb = constant_buffer(&device, Usage::Default, [10, 20, 30, 40]);
    ctx.update_subresource(cb, 0, SubresourceData::packed(vec![1, 2, 3, 4], 4, 4))
        .unwrap();
    ctx.set_render_targets(&[backbuffer]).unwrap();

    device.trigger_capture();
    device.present(swap, 0).unwrap();
    ctx.set_constant_buffer(Some(cb)).unwrap();
    ctx.draw(4, 0).unwrap();
    ctx.update_subresource(cb, 0, SubresourceData::packed(vec![5, 6, 7, 8], 4, 4))
        .unwrap();
    ctx.draw(4, 4).unwrap();
    let captured = backbuffer_texels(&device, backbuffer);
    device.present(swap, 0).unwrap();

    let path = device.captures()[0].path.clone().unwrap();
    let mut replayer = Replayer::open(SoftDriver::new(), &path).unwrap();
    assert_eq!(replayer.backbuffer(), Some(backbuffer));
    assert_eq!(replayer.resource_name(backbuffer), Some("back buffer"));
    assert!(replayer.has_initial_contents(cb));
    assert!(replayer.thumbnail().is_some());

    replayer.replay_frame().unwrap();
    let (desc, replayed) = replayer.read_texture(backbuffer, 0).unwrap();
    assert_eq!((desc.width, desc.height), (16, 16));
    assert_eq!(replayed, captured);
    assert_eq!(&replayed[..4], &[1, 2, 3, 4]);
    assert_eq!(&replayed[16..20], &[5, 6, 7, 8]);

    // Replaying again from the start gives the same result.
    replayer.replay_frame().unwrap();
    assert_eq!(replayer.read_texture(backbuffer, 0).unwrap().1, captured);
}

#[test]
fn mapped_writes_replay() {
    let dir = tempfile::tempdir().unwrap();
    let device = device(dir.path(), CaptureOptions::default());
    let (_, backbuffer) = swap_chain(&device);
    let ctx = device.immediate_context();
    let cb = constant_buffer(&device, Usage::Dynamic, [0; 4]);
    ctx.set_render_targets(&[backbuffer]).unwrap();
    ctx.set_constant_buffer(Some(cb)).unwrap();

    device.start_frame_capture().unwrap();
    let mut mapped = ctx.map(cb, 0, MapType::WriteDiscard).unwrap();
    mapped.data[..4].copy_from_slice(&[9, 8, 7, 6]);
    ctx.unmap(cb, 0, Some(&mapped.data)).unwrap();
    ctx.draw(2, 0).unwrap();
    let captured = backbuffer_texels(&device, backbuffer);
    let frame = device.end_frame_capture().unwrap();
    assert_eq!(frame.outcome, FrameOutcome::Succeeded);

    let mut replayer = Replayer::open(SoftDriver::new(), frame.path.unwrap()).unwrap();
    replayer.replay_frame().unwrap();
    let (_, replayed) = replayer.read_texture(backbuffer, 0).unwrap();
    assert_eq!(replayed, captured);
    assert_eq!(&replayed[..8], &[9, 8, 7, 6, 9, 8, 7, 6]);
}

#[test]
fn renames_during_capture_reach_replay() {
    let dir = tempfile::tempdir().unwrap();
    let device = device(dir.path(), CaptureOptions::default());
    let (swap, backbuffer) = swap_chain(&device);
    let ctx = device.immediate_context();
    let idle = constant_buffer(&device, Usage::Default, [1, 2, 3, 4]);
    device.set_resource_name(idle, "before the frame").unwrap();
    ctx.set_render_targets(&[backbuffer]).unwrap();

    device.trigger_capture();
    device.present(swap, 0).unwrap();
    ctx.draw(1, 0).unwrap();
    device.set_resource_name(idle, "renamed in frame").unwrap();
    ctx.draw(1, 1).unwrap();
    device.present(swap, 0).unwrap();

    let path = device.captures()[0].path.clone().unwrap();
    let types: Vec<ChunkType> = frame_chunks(&path).into_iter().map(|(ty, _)| ty).collect();
    assert_eq!(
        types,
        [
            ChunkType::BeginCaptureFrame,
            ChunkType::Draw,
            ChunkType::Draw,
            ChunkType::EndCaptureFrame,
        ]
    );

    let replayer = Replayer::open(SoftDriver::new(), &path).unwrap();
    assert_eq!(replayer.resource_name(idle), Some("renamed in frame"));
    assert!(replayer.resource_kind(idle).is_some());
    let events: Vec<_> = replayer.events().iter().map(|e| e.chunk_type()).collect();
    assert_eq!(
        events,
        [
            Some(ChunkType::BeginCaptureFrame),
            Some(ChunkType::Draw),
            Some(ChunkType::Draw),
            Some(ChunkType::EndCaptureFrame),
        ]
    );
}

/// A deferred context maps a buffer before the frame starts and unmaps it
/// during the frame, then the list is executed in the frame.
fn deferred_map_across_frame_start(capture_all_cmd_lists: bool) {
    let dir = tempfile::tempdir().unwrap();
    let options = CaptureOptions {
        capture_all_cmd_lists,
        ..CaptureOptions::default()
    };
    let device = device(dir.path(), options);
    let (_, backbuffer) = swap_chain(&device);
    let ctx = device.immediate_context();
    let cb = constant_buffer(&device, Usage::Dynamic, [0; 4]);

    let deferred = device.create_deferred_context().unwrap();
    let deferred = device.context(deferred).unwrap();
    deferred.set_render_targets(&[backbuffer]).unwrap();
    deferred.set_constant_buffer(Some(cb)).unwrap();
    let mut mapped = deferred.map(cb, 0, MapType::WriteDiscard).unwrap();

    device.start_frame_capture().unwrap();
    mapped.data[..4].copy_from_slice(&[3, 1, 4, 1]);
    deferred.unmap(cb, 0, Some(&mapped.data)).unwrap();
    deferred.draw(1, 0).unwrap();
    let list = deferred.finish_command_list(false).unwrap();
    ctx.execute_command_list(list, false).unwrap();
    let captured = backbuffer_texels(&device, backbuffer);
    assert_eq!(&captured[..4], &[3, 1, 4, 1]);
    let frame = device.end_frame_capture().unwrap();

    if !capture_all_cmd_lists {
        // The map wasn't recorded, so neither was the list.
        assert_eq!(frame.outcome, FrameOutcome::Failed(CaptureFailReason::UncappedCommandList));
        assert_eq!(device.last_failure(), Some((frame.frame_number, CaptureFailReason::UncappedCommandList)));
        assert!(frame.path.is_none());
        return;
    }

    assert_eq!(frame.outcome, FrameOutcome::Succeeded);
    let path = frame.path.unwrap();
    let types: Vec<ChunkType> = frame_chunks(&path).into_iter().map(|(ty, _)| ty).collect();
    let execute = types.iter().position(|&ty| ty == ChunkType::ExecuteCommandList).unwrap();
    assert_eq!(
        &types[execute + 1..],
        &[
            ChunkType::SetRenderTargets,
            ChunkType::SetConstantBuffer,
            ChunkType::Map,
            ChunkType::Unmap,
            ChunkType::Draw,
            ChunkType::FinishCommandList,
            ChunkType::EndCaptureFrame,
        ]
    );

    let mut replayer = Replayer::open(SoftDriver::new(), path).unwrap();
    replayer.replay_frame().unwrap();
    assert_eq!(replayer.read_texture(backbuffer, 0).unwrap().1, captured);
}

#[test]
fn deferred_maps_spanning_frame_start() {
    deferred_map_across_frame_start(false);
    deferred_map_across_frame_start(true);
}

#[test]
fn compressed_and_depth_contents_replay() {
    let descs = [
        TextureDesc::new_2d(8, 8, Format::Bc1Unorm, BindFlags::SHADER_RESOURCE),
        TextureDesc::new_2d(8, 8, Format::D32Float, BindFlags::DEPTH_STENCIL),
    ];
    for desc in descs {
        let dir = tempfile::tempdir().unwrap();
        let device = device(dir.path(), CaptureOptions::default());
        let ctx = device.immediate_context();
        let source = device.create_texture(&desc, None).unwrap();
        let copy = device.create_texture(&desc, None).unwrap();

        let row_pitch = desc.format.row_bytes(desc.width);
        let depth_pitch = row_pitch * desc.format.row_count(desc.height);
        let contents: Vec<u8> = (0..depth_pitch).map(|i| (i * 7) as u8).collect();
        ctx.update_subresource(source, 0, SubresourceData::packed(contents.clone(), row_pitch, depth_pitch))
            .unwrap();

        device.start_frame_capture().unwrap();
        ctx.copy_resource(copy, source).unwrap();
        let frame = device.end_frame_capture().unwrap();
        assert_eq!(frame.outcome, FrameOutcome::Succeeded);

        let mut replayer = Replayer::open(SoftDriver::new(), frame.path.unwrap()).unwrap();
        assert!(replayer.has_initial_contents(source));
        assert_eq!(replayer.frame_info().initial_contents, 1);
        replayer.replay_frame().unwrap();
        assert_eq!(replayer.read_texture(source, 0).unwrap().1, contents, "{:?}", desc.format);
        assert_eq!(replayer.read_texture(copy, 0).unwrap().1, contents, "{:?}", desc.format);
    }
}

fn big_target_contents_are_cleared(save_all_initials: bool) -> bool {
    let dir = tempfile::tempdir().unwrap();
    let options = CaptureOptions {
        save_all_initials,
        ..CaptureOptions::default()
    };
    let device = device(dir.path(), options);
    let (swap, _) = swap_chain(&device);
    let ctx = device.immediate_context();
    let target = device
        .create_texture(
            &TextureDesc::new_2d(256, 128, Format::Rgba8Unorm, BindFlags::RENDER_TARGET),
            None,
        )
        .unwrap();
    ctx.clear_render_target(target, [0.5; 4]).unwrap();
    ctx.set_render_targets(&[target]).unwrap();

    device.trigger_capture();
    device.present(swap, 0).unwrap();
    ctx.draw(3, 0).unwrap();
    let contents = device.resources().get_initial_contents(target).unwrap();
    device.present(swap, 0).unwrap();
    assert_eq!(device.captures()[0].outcome, FrameOutcome::Succeeded);
    contents.is_clear()
}

#[test]
fn big_render_targets_get_clear_markers() {
    assert!(big_target_contents_are_cleared(false));
    assert!(!big_target_contents_are_cleared(true));
}

#[test]
fn command_lists_recorded_before_capture() {
    for capture_all_cmd_lists in [false, true] {
        let dir = tempfile::tempdir().unwrap();
        let options = CaptureOptions {
            capture_all_cmd_lists,
            ..CaptureOptions::default()
        };
        let device = device(dir.path(), options);
        let (swap, backbuffer) = swap_chain(&device);
        let ctx = device.immediate_context();

        let deferred = device.create_deferred_context().unwrap();
        let deferred = device.context(deferred).unwrap();
        deferred.set_render_targets(&[backbuffer]).unwrap();
        deferred.draw(1, 0).unwrap();
        let list = deferred.finish_command_list(false).unwrap();

        device.trigger_capture();
        device.present(swap, 0).unwrap();
        ctx.execute_command_list(list, false).unwrap();
        device.present(swap, 0).unwrap();

        if capture_all_cmd_lists {
            assert_eq!(device.captures()[0].outcome, FrameOutcome::Succeeded);
        } else {
            // Retried on the next frame, which doesn't execute the list.
            assert!(device.captures().is_empty());
            assert!(device.is_capturing());
            device.present(swap, 0).unwrap();
            assert_eq!(device.captures()[0].outcome, FrameOutcome::Succeeded);
            assert_eq!(device.captures()[0].frame_number, 3);
        }
    }
}

#[test]
fn retries_give_up() {
    let dir = tempfile::tempdir().unwrap();
    let device = device(dir.path(), CaptureOptions::default());
    let (swap, backbuffer) = swap_chain(&device);
    let ctx = device.immediate_context();
    let deferred = device.create_deferred_context().unwrap();
    let deferred = device.context(deferred).unwrap();
    deferred.set_render_targets(&[backbuffer]).unwrap();
    deferred.draw(1, 0).unwrap();
    let stale = deferred.finish_command_list(true).unwrap();

    device.trigger_capture();
    device.present(swap, 0).unwrap();
    let mut presents = 0;
    while device.is_capturing() {
        ctx.execute_command_list(stale, true).unwrap();
        device.present(swap, 0).unwrap();
        presents += 1;
        assert!(presents <= 6);
    }
    assert_eq!(presents, 6);
    let captures = device.captures();
    assert_eq!(captures.len(), 1);
    assert!(matches!(captures[0].outcome, FrameOutcome::Failed(_)));
    assert_eq!(
        device.overlay_text().unwrap(),
        format!("Failed capture at frame {}:\n    Uncapped command list", captures[0].frame_number)
    );
}

#[test]
fn newer_formats_are_refused() {
    let mut bytes = MAGIC.to_le_bytes().to_vec();
    bytes.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
    bytes.extend_from_slice(&[0; 12]);
    let init: Chunk = ChunkBuilder::new(ChunkType::InitParams)
        .field("version", &0x0C_u32)
        .field("debug", &false)
        .finish();
    write_framed(&mut bytes, &init);

    match Replayer::from_bytes(SoftDriver::new(), bytes) {
        Err(ReplayError::IncompatibleVersion { found, current }) => {
            assert_eq!(found, 0x0C);
            assert_eq!(current, gpu_capture::version::CURRENT_VERSION);
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("newer capture format accepted"),
    }
}
