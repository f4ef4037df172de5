//! Opens a window and clears it every frame through the swap chain and renderer.
//! Run: cargo run --bin clear_window --features window

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vrender_rhi::vulkan::{UniformBuffer, Vertex, VertexBuffer, VulkanDevice};
use vrender_rhi::{
    ClearColor, DeviceMemoryAllocator, Renderer, RendererConfig, RhiError, SharedAllocator,
    SwapChain, Window,
};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::window::WindowId;

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5, 0.0],
        color: [1.0, 0.0, 0.0],
        tex_coord: [0.5, 0.0],
    },
    Vertex {
        position: [0.5, 0.5, 0.0],
        color: [0.0, 1.0, 0.0],
        tex_coord: [1.0, 1.0],
    },
    Vertex {
        position: [-0.5, 0.5, 0.0],
        color: [0.0, 0.0, 1.0],
        tex_coord: [0.0, 1.0],
    },
];

/// winit window seen through the renderer's [`Window`] trait.
#[derive(Debug)]
struct WinitWindow {
    inner: Arc<winit::window::Window>,
    resized: AtomicBool,
}

impl Window for WinitWindow {
    fn extent(&self) -> (u32, u32) {
        let size = self.inner.inner_size();
        (size.width, size.height)
    }

    fn framebuffer_resized(&self) -> bool {
        self.resized.load(Ordering::Acquire)
    }

    fn set_framebuffer_resized(&self, resized: bool) {
        self.resized.store(resized, Ordering::Release);
    }

    // Events can't be pumped from inside a handler; poll the size instead.
    fn wait_events(&self) {
        std::thread::sleep(Duration::from_millis(16));
    }
}

/// Everything that exists once the window has a device. Field order is drop order.
struct Gpu {
    renderer: Renderer,
    swap_chain: SwapChain,
    triangle: VertexBuffer,
    uniforms: UniformBuffer,
    allocator: SharedAllocator,
    _device: Arc<VulkanDevice>,
}

impl Gpu {
    fn new(window: Arc<WinitWindow>) -> Result<Self, RhiError> {
        let config = RendererConfig::from_env();
        let device = VulkanDevice::new_with_surface(window.inner.as_ref(), &config)?;
        let allocator = DeviceMemoryAllocator::shared(device.clone(), &config.allocator);
        let swap_chain = SwapChain::new(
            device.clone(),
            allocator.clone(),
            window,
            config.swapchain.clone(),
        )?;
        let renderer = Renderer::new(device.clone(), &swap_chain, &config)?;
        let triangle = VertexBuffer::new(&device, &allocator, &TRIANGLE, &[0, 1, 2])?;
        let uniforms =
            UniformBuffer::new(&device, &allocator, std::mem::size_of::<[f32; 4]>() as u64)?;
        log::info!(
            "clear_window: {}x{} swap chain, {} images, {:?}",
            swap_chain.extent().0,
            swap_chain.extent().1,
            swap_chain.image_count(),
            swap_chain.present_mode()
        );
        Ok(Self {
            renderer,
            swap_chain,
            triangle,
            uniforms,
            allocator,
            _device: device,
        })
    }

    fn draw(&mut self, elapsed: f32) -> Result<(), RhiError> {
        let pulse = 0.5 + 0.5 * elapsed.sin();
        let color = ClearColor {
            r: 0.05,
            g: 0.1 + 0.3 * pulse,
            b: 0.2 + 0.4 * (1.0 - pulse),
            a: 1.0,
        };
        self.uniforms.write(&[color.r, color.g, color.b, color.a])?;
        self.renderer.set_clear_color(color);

        if self.renderer.begin_frame(&mut self.swap_chain)?.is_none() {
            // Swap chain was out of date and has been rebuilt; try again next redraw.
            return Ok(());
        }
        self.renderer.begin_render_pass(&self.swap_chain)?;
        if let Some(command_buffer) = self.renderer.command_buffer() {
            self.triangle.bind(command_buffer);
        }
        self.renderer.end_render_pass()?;
        self.renderer.end_frame(&mut self.swap_chain)?;
        Ok(())
    }
}

#[derive(Default)]
struct App {
    window: Option<Arc<WinitWindow>>,
    gpu: Option<Gpu>,
    started: Option<Instant>,
    frames: u64,
    failed: bool,
}

impl App {
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: RhiError) {
        log::error!("clear_window: {}", error);
        self.failed = true;
        self.gpu = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = winit::window::WindowAttributes::default()
            .with_title("vrender clear")
            .with_inner_size(winit::dpi::LogicalSize::new(800, 600));
        let inner = match event_loop.create_window(attrs) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.fail(event_loop, RhiError::Window(e.to_string()));
                return;
            }
        };
        let window = Arc::new(WinitWindow {
            inner,
            resized: AtomicBool::new(false),
        });
        match Gpu::new(window.clone()) {
            Ok(gpu) => self.gpu = Some(gpu),
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        }
        self.started = Some(Instant::now());
        window.inner.request_redraw();
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("clear_window: closing after {} frames", self.frames);
                if let Some(gpu) = &self.gpu {
                    let allocator = gpu.allocator.lock();
                    log::info!(
                        "clear_window: {} bytes of device memory in use",
                        allocator.heap_usage(0)
                    );
                }
                self.gpu = None;
                event_loop.exit();
            }
            WindowEvent::Resized(_) => {
                if let Some(window) = &self.window {
                    window.set_framebuffer_resized(true);
                }
            }
            WindowEvent::RedrawRequested => {
                let elapsed = self
                    .started
                    .map(|t| t.elapsed().as_secs_f32())
                    .unwrap_or_default();
                if let Some(gpu) = self.gpu.as_mut() {
                    match gpu.draw(elapsed) {
                        Ok(()) => self.frames += 1,
                        Err(e) => {
                            self.fail(event_loop, e);
                            return;
                        }
                    }
                }
                if let Some(window) = &self.window {
                    window.inner.request_redraw();
                }
            }
            _ => {}
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!("clear_window: event loop: {}", e);
            std::process::exit(1);
        }
    };
    let mut app = App::default();
    if let Err(e) = event_loop.run_app(&mut app) {
        log::error!("clear_window: {}", e);
        std::process::exit(1);
    }
    if app.failed {
        std::process::exit(1);
    }
}
