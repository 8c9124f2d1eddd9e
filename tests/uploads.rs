mod common;

use kiln::renderer::contexts::resource_ctx::buffer::{Buffer, BufferDesc, BufferType, BufferUsage};
use kiln::renderer::contexts::memory_ctx::allocator::MemoryPlacement;
use kiln::renderer::contexts::resource_ctx::image::ImageFormat;

fn read_back(buffer: &Buffer, len: usize) -> Vec<u32> {
    let mapped = buffer.allocation().mapped.expect("read-back buffer is mapped");
    unsafe { std::slice::from_raw_parts(mapped.as_ptr() as *const u32, len).to_vec() }
}

fn readback_buffer(size: u64) -> BufferDesc {
    BufferDesc::new(size, BufferUsage::Storage, BufferType::ConstantlyMapped)
        .placement(MemoryPlacement::Host)
        .transfer_write(true)
}

#[test]
fn mapped_buffers_are_written_in_place() {
    let Some(renderer) = common::headless_renderer(2) else {
        return;
    };
    let buffers = &renderer.resources().buffers;

    let buffer = buffers
        .make_buffer(BufferDesc::new(64, BufferUsage::Uniform, BufferType::ConstantlyMapped))
        .unwrap();
    assert!(buffer.is_mapped());

    let data = [1u32, 2, 3, 4];
    renderer.transfer().copy_slice_to_buffer(&buffer, &data, 16).unwrap();

    assert_eq!(&read_back(&buffer, 8)[4..], &data);
    assert!(!renderer.frame_ctx().scheduler.transfer.has_pending_transfer());
    assert_eq!(renderer.transfer().staging_buffers(), 0);

    buffers.destroy_buffer(buffer).unwrap();
    assert_eq!(buffers.live_buffers(), 0);
}

#[test]
fn device_local_upload_round_trips_through_staging() {
    let Some(mut renderer) = common::headless_renderer(2) else {
        return;
    };
    let data: Vec<u32> = (0..256).collect();
    let size = (data.len() * 4) as u64;

    let device_local = renderer
        .resources()
        .buffers
        .make_buffer(
            BufferDesc::new(size, BufferUsage::Storage, BufferType::Immutable).transfer_read(true),
        )
        .unwrap();
    let readback = renderer.resources().buffers.make_buffer(readback_buffer(size)).unwrap();

    let frame = renderer.begin_frame().unwrap();
    renderer.transfer().copy_slice_to_buffer(&device_local, &data, 0).unwrap();
    renderer.record(&frame, |_, _| Ok(())).unwrap();
    renderer.end_frame(frame).unwrap();
    renderer.wait_idle().unwrap();

    let frame = renderer.begin_frame().unwrap();
    renderer
        .transfer()
        .copy_buffer_to_buffer(&readback, &device_local, size, 0, 0)
        .unwrap();
    renderer.record(&frame, |_, _| Ok(())).unwrap();
    renderer.end_frame(frame).unwrap();
    renderer.wait_idle().unwrap();

    assert_eq!(read_back(&readback, data.len()), data);

    renderer.resources().buffers.destroy_buffer(device_local).unwrap();
    renderer.resources().buffers.destroy_buffer(readback).unwrap();
}

#[test]
fn staging_buffers_are_reused_across_frames() {
    let Some(mut renderer) = common::headless_renderer(1) else {
        return;
    };
    let target = renderer
        .resources()
        .buffers
        .make_buffer(BufferDesc::new(8192, BufferUsage::Vertex, BufferType::Immutable))
        .unwrap();
    let payload = vec![7u8; 4096];

    let frame = renderer.begin_frame().unwrap();
    renderer.transfer().copy_to_buffer(&target, &payload, 0).unwrap();
    renderer.transfer().copy_to_buffer(&target, &payload, 4096).unwrap();
    // Both copies are in flight together, so they cannot share a staging buffer
    assert_eq!(renderer.transfer().staging_buffers(), 2);
    renderer.record(&frame, |_, _| Ok(())).unwrap();
    renderer.end_frame(frame).unwrap();

    let frame = renderer.begin_frame().unwrap();
    renderer.transfer().copy_to_buffer(&target, &payload[..1024], 0).unwrap();
    assert_eq!(renderer.transfer().staging_buffers(), 2);
    renderer.record(&frame, |_, _| Ok(())).unwrap();
    renderer.end_frame(frame).unwrap();

    // Releases the last frame's reservation before trimming
    renderer.begin_frame().unwrap();
    assert_eq!(renderer.transfer().cleanup_staging(0).unwrap(), 2);
    assert_eq!(renderer.transfer().staging_buffers(), 0);

    renderer.resources().buffers.destroy_buffer(target).unwrap();
}

#[test]
fn upload_recorded_before_begin_frame_keeps_its_staging() {
    let Some(mut renderer) = common::headless_renderer(1) else {
        return;
    };
    let first: Vec<u32> = (0..1024).collect();
    let second: Vec<u32> = (0..1024).map(|i| 0xdead_0000 | i).collect();
    let size = (first.len() * 4) as u64;

    let buffers = &renderer.resources().buffers;
    let immutable =
        BufferDesc::new(size, BufferUsage::Storage, BufferType::Immutable).transfer_read(true);
    let dst_first = buffers.make_buffer(immutable).unwrap();
    let dst_second = buffers.make_buffer(immutable).unwrap();
    let readback = buffers.make_buffer(readback_buffer(size)).unwrap();

    // Recorded outside any frame, flushed with the next one
    renderer.transfer().copy_slice_to_buffer(&dst_first, &first, 0).unwrap();

    let frame = renderer.begin_frame().unwrap();
    renderer.transfer().copy_slice_to_buffer(&dst_second, &second, 0).unwrap();
    assert_eq!(renderer.transfer().staging_buffers(), 2);
    renderer.record(&frame, |_, _| Ok(())).unwrap();
    renderer.end_frame(frame).unwrap();
    renderer.wait_idle().unwrap();

    let frame = renderer.begin_frame().unwrap();
    renderer
        .transfer()
        .copy_buffer_to_buffer(&readback, &dst_first, size, 0, 0)
        .unwrap();
    renderer.record(&frame, |_, _| Ok(())).unwrap();
    renderer.end_frame(frame).unwrap();
    renderer.wait_idle().unwrap();

    assert_eq!(read_back(&readback, first.len()), first);
    assert_eq!(renderer.transfer().staging_buffers(), 2);

    let buffers = &renderer.resources().buffers;
    buffers.destroy_buffer(dst_first).unwrap();
    buffers.destroy_buffer(dst_second).unwrap();
    buffers.destroy_buffer(readback).unwrap();
}

#[test]
fn graphics_waits_for_transfer_on_request() {
    let Some(mut renderer) = common::headless_renderer(2) else {
        return;
    };
    let target = renderer
        .resources()
        .buffers
        .make_buffer(BufferDesc::new(4096, BufferUsage::Vertex, BufferType::Immutable))
        .unwrap();

    let frame = renderer.begin_frame().unwrap();
    renderer.transfer().copy_to_buffer(&target, &[3u8; 4096], 0).unwrap();
    assert!(renderer.transfer().flush(frame.index).unwrap());

    renderer.transfer().request_graphics_wait();
    let scheduler = &renderer.frame_ctx().scheduler;
    scheduler.graphics.record_graphics(frame.index, |_, _| Ok(())).unwrap();
    scheduler.graphics.submit_graphics_commands(frame.index).unwrap();

    // The graphics submission consumed the request after the transfer fence signaled
    let sync = scheduler.sync();
    assert!(!sync.take_transfer_pause_flag());
    let status = unsafe {
        renderer
            .device_ctx()
            .device()
            .get_fence_status(sync.transfer_fence(frame.index))
    };
    assert_eq!(status, Ok(true));

    renderer.wait_idle().unwrap();
    renderer.resources().buffers.destroy_buffer(target).unwrap();
}

#[test]
fn second_flush_before_graphics_is_refused() {
    let Some(mut renderer) = common::headless_renderer(2) else {
        return;
    };
    let target = renderer
        .resources()
        .buffers
        .make_buffer(BufferDesc::new(8192, BufferUsage::Vertex, BufferType::Immutable))
        .unwrap();

    let frame = renderer.begin_frame().unwrap();
    renderer.transfer().copy_to_buffer(&target, &[1u8; 4096], 0).unwrap();
    assert!(renderer.transfer().flush(frame.index).unwrap());

    // The slot's transfer semaphore is still unwaited
    renderer.transfer().copy_to_buffer(&target, &[2u8; 4096], 4096).unwrap();
    assert!(renderer.transfer().flush(frame.index).is_err());
    assert!(renderer.frame_ctx().scheduler.transfer.has_pending_transfer());

    let graphics = &renderer.frame_ctx().scheduler.graphics;
    graphics.record_graphics(frame.index, |_, _| Ok(())).unwrap();
    graphics.submit_graphics_commands(frame.index).unwrap();

    // Once graphics consumed the first transfer the held-back copy can go out
    assert!(renderer.transfer().flush(frame.index).unwrap());
    graphics.record_graphics(frame.index, |_, _| Ok(())).unwrap();
    graphics.submit_graphics_commands(frame.index).unwrap();

    renderer.wait_idle().unwrap();
    renderer.resources().buffers.destroy_buffer(target).unwrap();
}

#[test]
fn images_upload_through_staging() {
    let Some(mut renderer) = common::headless_renderer(2) else {
        return;
    };
    let image = match renderer.resources().images.make_image(ImageFormat::R8G8B8A8Unorm, 16, 16) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("skipping: RGBA8 images unsupported ({err})");
            return;
        }
    };
    assert!(image.is_valid());
    assert_eq!(image.byte_size(), 16 * 16 * 4);

    let pixels = vec![0x80u8; image.byte_size() as usize];
    let frame = renderer.begin_frame().unwrap();
    renderer.transfer().copy_to_image(&image, &pixels).unwrap();
    renderer.record(&frame, |_, _| Ok(())).unwrap();
    renderer.end_frame(frame).unwrap();
    renderer.wait_idle().unwrap();

    renderer.resources().images.destroy_image(image).unwrap();
    assert!(!renderer.resources().images.is_live(&image));
}
