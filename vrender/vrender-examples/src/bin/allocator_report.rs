//! Headless: drives the device memory allocator through buffers, a texture and a mesh,
//! then prints how each memory type's chain grew.
//! Run: RUST_LOG=debug cargo run --bin allocator_report

use vrender_rhi::vulkan::{vk, Buffer, BufferInfo, Texture, Vertex, VertexBuffer, VulkanDevice};
use vrender_rhi::{
    DeviceMemoryAllocator, MemoryPropertyFlags, RendererConfig, RhiError, SharedAllocator,
};

fn report(allocator: &SharedAllocator, stage: &str) {
    let allocator = allocator.lock();
    log::info!("== {} ==", stage);
    for (type_index, memory_type) in allocator.properties().memory_types.iter().enumerate() {
        let chain = allocator.chain(type_index as u32);
        if chain.is_empty() {
            continue;
        }
        for link in chain {
            log::info!(
                "type {:>2} {:?} link {}: {} / {} bytes used, {} blocks",
                type_index,
                memory_type.property_flags,
                link.link(),
                link.allocated_size(),
                link.size(),
                link.blocks().len()
            );
        }
    }
    for heap in 0..allocator.properties().memory_heaps.len() {
        log::info!(
            "heap {}: {} of {} budget bytes",
            heap,
            allocator.heap_usage(heap),
            allocator.heap_budget(heap)
        );
    }
}

fn run() -> Result<(), RhiError> {
    let config = RendererConfig::from_env();
    let device = VulkanDevice::new(&config)?;
    let allocator = DeviceMemoryAllocator::shared(device.clone(), &config.allocator);
    {
        let allocator = allocator.lock();
        log::info!(
            "page size {} bytes, minimum allocation {} bytes",
            allocator.page_size(),
            allocator.min_allocation_size()
        );
    }

    let staging_info = BufferInfo {
        size: 64 * 1024,
        usage: vk::BufferUsageFlags::TRANSFER_SRC,
        memory_properties: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
    };
    let mut buffers = Vec::new();
    for i in 0..8u64 {
        let info = BufferInfo {
            size: staging_info.size * (i + 1),
            ..staging_info
        };
        let buffer = Buffer::new(&device, &allocator, info)?;
        let words = vec![i as u32; (info.size / 4) as usize];
        buffer.copy_data(bytemuck::cast_slice(&words), 0)?;
        buffers.push(buffer);
    }
    report(&allocator, "8 host-visible buffers");

    // Free every other buffer so later requests land in the gaps.
    let mut index = 0;
    buffers.retain(|_| {
        index += 1;
        index % 2 == 0
    });
    report(&allocator, "after freeing half");

    let quad = [
        Vertex {
            position: [-1.0, -1.0, 0.0],
            color: [1.0, 1.0, 1.0],
            tex_coord: [0.0, 0.0],
        },
        Vertex {
            position: [1.0, -1.0, 0.0],
            color: [1.0, 1.0, 1.0],
            tex_coord: [1.0, 0.0],
        },
        Vertex {
            position: [1.0, 1.0, 0.0],
            color: [1.0, 1.0, 1.0],
            tex_coord: [1.0, 1.0],
        },
        Vertex {
            position: [-1.0, 1.0, 0.0],
            color: [1.0, 1.0, 1.0],
            tex_coord: [0.0, 1.0],
        },
    ];
    let mesh = VertexBuffer::new(&device, &allocator, &quad, &[0, 1, 2, 2, 3, 0])?;
    let (width, height) = (256u32, 256u32);
    let pixels: Vec<u8> = (0..width * height)
        .flat_map(|i| {
            let checker = if ((i % width) / 32 + (i / width) / 32) % 2 == 0 { 255 } else { 40 };
            [checker, checker, checker, 255]
        })
        .collect();
    let texture = Texture::from_rgba8(&device, &allocator, width, height, &pixels)?;
    log::info!(
        "mesh: {} vertices, {} indices; texture {}x{}",
        mesh.vertex_count(),
        mesh.index_count(),
        width,
        height
    );
    report(&allocator, "mesh and texture resident");

    drop(texture);
    drop(mesh);
    drop(buffers);
    report(&allocator, "everything freed");
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        log::error!("allocator_report: {}", e);
        std::process::exit(1);
    }
}
