//! Drive frames through the full acquire, record, submit, present cycle
//! without a GPU.
//!
//! Run with `cargo run --example headless [config.yaml]`. Set RUST_LOG=debug
//! to see allocations, pool growth, and swapchain rebuilds.

use {
    anyhow::{Context, Result},
    ash::vk,
    ash_frames::{
        device::HeadlessDevice,
        frame::FrameOutcome,
        logging,
        resources::ResourceDescriptor,
        EngineConfig, GpuContext,
    },
    std::sync::Arc,
};

const FRAME_COUNT: u64 = 120;

fn main() -> Result<()> {
    let _logger = logging::setup()?;

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let device = Arc::new(HeadlessDevice::builder().auto_complete(true).build());
    let mut gpu = GpuContext::new(
        device.clone(),
        &config,
        vk::Extent2D {
            width: 1280,
            height: 720,
        },
    )?;

    let vertices: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    let vertex_buffer = gpu
        .acquire_resource(ResourceDescriptor::vertex_buffer(
            vertices.len() as vk::DeviceSize,
        ))
        .context("Unable to create the vertex buffer")?;
    gpu.upload(vertex_buffer, &vertices)
        .context("Unable to upload vertices")?;
    let uniforms = gpu
        .resources_mut()
        .acquire_shared(ResourceDescriptor::uniform_buffer(256))?;

    let mut presented = 0;
    let mut skipped = 0;
    for frame_number in 0..FRAME_COUNT {
        match frame_number {
            40 => resize(&mut gpu, &device, 1920, 1080),
            60 => resize(&mut gpu, &device, 0, 0),
            70 => resize(&mut gpu, &device, 800, 600),
            _ => {}
        }

        let outcome = gpu.render_frame(|_device, frame, resources| {
            let time = frame.frame_index() as f32 / 60.0;
            resources.write(uniforms, 0, &time.to_le_bytes())?;
            frame.track_resource(uniforms);
            frame.track_resource(vertex_buffer);
            Ok(())
        });
        match outcome {
            Ok(FrameOutcome::Presented { .. }) => presented += 1,
            Ok(FrameOutcome::Skipped) => skipped += 1,
            Err(err) if err.is_fatal() => {
                log::error!("Rendering stopped: {:#}", anyhow::Error::from(err));
                break;
            }
            Err(err) => log::warn!("Frame failed: {}", err),
        }
    }

    log::info!(
        "Presented {} frames, skipped {}\n{:#?}",
        presented,
        skipped,
        gpu.resources().stats()
    );

    gpu.release_resource(vertex_buffer)?;
    gpu.release_resource(uniforms)?;
    gpu.shutdown()?;
    Ok(())
}

fn resize(
    gpu: &mut GpuContext,
    device: &HeadlessDevice,
    width: u32,
    height: u32,
) {
    log::info!("Resizing the surface to {}x{}", width, height);
    device.set_surface_extent(width, height);
    gpu.notify_resized(vk::Extent2D { width, height });
}
