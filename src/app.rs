use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes, WindowId},
};

use crate::config::EngineConfig;
use crate::engine::ComputeEngine;
use crate::gpu::Gpu;
use crate::hot::ShaderHotReload;
use crate::keyinputs::KeyInputHandler;
use crate::mouse::MouseTracker;

/// Surface formats the blitter can target, best first.
const PREFERRED_FORMATS: [wgpu::TextureFormat; 4] = [
    wgpu::TextureFormat::Bgra8UnormSrgb,
    wgpu::TextureFormat::Rgba8UnormSrgb,
    wgpu::TextureFormat::Bgra8Unorm,
    wgpu::TextureFormat::Rgba8Unorm,
];

/// Windowed host: one engine, one watched shader file, up to two channel images.
pub struct PlaygroundApp {
    title: String,
    config: EngineConfig,
    shader: ShaderHotReload,
    channels: Vec<(usize, PathBuf)>,
    mouse: MouseTracker,
    keys: KeyInputHandler,
    running: Option<Running>,
}

struct Running {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
    engine: ComputeEngine,
}

impl PlaygroundApp {
    pub fn new(title: &str, config: EngineConfig, shader_path: PathBuf) -> anyhow::Result<Self> {
        Ok(Self {
            title: title.to_string(),
            config,
            shader: ShaderHotReload::new(shader_path)?,
            channels: Vec::new(),
            mouse: MouseTracker::new(),
            keys: KeyInputHandler::new(),
            running: None,
        })
    }

    pub fn with_channel(mut self, index: usize, path: PathBuf) -> Self {
        self.channels.push((index, path));
        self
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        let event_loop = EventLoop::builder().build()?;
        event_loop.run_app(&mut self)?;
        Ok(())
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<Running> {
        let window_attributes = WindowAttributes::default()
            .with_inner_size(LogicalSize::new(self.config.width, self.config.height))
            .with_title(&self.title)
            .with_resizable(true);
        let window = Arc::new(event_loop.create_window(window_attributes)?);
        let size = window.inner_size();

        let instance = Gpu::instance();
        let surface = instance.create_surface(window.clone())?;
        let gpu = pollster::block_on(Gpu::new(instance, Some(&surface)))?;

        let caps = surface.get_capabilities(&gpu.adapter);
        let format = PREFERRED_FORMATS
            .into_iter()
            .find(|f| caps.formats.contains(f))
            .ok_or_else(|| anyhow::anyhow!("no supported surface format in {:?}", caps.formats))?;
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&gpu.device, &surface_config);

        let mut config = self.config.clone();
        config.width = surface_config.width;
        config.height = surface_config.height;
        config.surface_format = format;
        let mut engine = ComputeEngine::new(gpu, config)?;

        let shader_name = self.shader.path().display().to_string();
        engine.on_error(move |diagnostic| error!("{}:{}", shader_name, diagnostic));
        engine.on_success(|entry_points| info!("running {:?}", entry_points));
        engine.on_update(|report| {
            for (entry, time) in &report.timings {
                info!("{}: {}", entry, time);
            }
            for failure in &report.assertions {
                warn!("{}", failure);
            }
        });
        engine.on_channel(|index, width, height| info!("channel{} is {}x{}", index, width, height));

        for (index, path) in &self.channels {
            match std::fs::read(path) {
                Ok(bytes) => engine.load_channel(*index, bytes)?,
                Err(e) => warn!("could not read {}: {}", path.display(), e),
            }
        }

        let mut running = Running {
            window,
            surface,
            surface_config,
            engine,
        };
        running.rebuild(self.shader.content());
        Ok(running)
    }
}

impl Running {
    /// Preprocesses and compiles `source`; failures are logged and the old program keeps running.
    fn rebuild(&mut self, source: &str) {
        let source_map = match self.engine.preprocess(source) {
            Ok(source_map) => source_map,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };
        if let Err(e) = pollster::block_on(self.engine.compile(&source_map)) {
            error!("{}", e);
        }
    }

    fn resize(&mut self, width: u32, height: u32, source: &str) {
        if width == 0 || height == 0 {
            return;
        }
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface
            .configure(&self.engine.gpu().device, &self.surface_config);
        if let Err(e) = self.engine.resize(width, height) {
            error!("resize failed: {}", e);
            return;
        }
        // SCREEN_WIDTH/SCREEN_HEIGHT are baked in at preprocess time.
        self.rebuild(source);
    }
}

impl ApplicationHandler for PlaygroundApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.running.is_some() {
            return;
        }
        match self.start(event_loop) {
            Ok(running) => self.running = Some(running),
            Err(e) => {
                error!("failed to start: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if window_id != running.window.id() {
            return;
        }
        if self
            .mouse
            .handle_mouse_input(running.engine.mouse_mut(), &event)
        {
            return;
        }
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                running.resize(size.width, size.height, self.shader.content());
            }
            WindowEvent::KeyboardInput { event, .. } => {
                let reset = event.state == ElementState::Pressed
                    && !event.repeat
                    && event.physical_key == PhysicalKey::Code(KeyCode::F5);
                if reset {
                    if let Err(e) = running.engine.reset() {
                        error!("reset failed: {}", e);
                    }
                    return;
                }
                self.keys
                    .handle_keyboard_input(&running.window, running.engine.keyboard_mut(), &event);
            }
            WindowEvent::RedrawRequested => {
                if self.shader.check_and_reload().is_some() {
                    info!("{} changed, recompiling", self.shader.path().display());
                    running.rebuild(self.shader.content());
                } else if running.engine.needs_recompile() {
                    running.rebuild(self.shader.content());
                }
                match running.engine.render(&running.surface) {
                    Ok(()) => {}
                    Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                        running
                            .surface
                            .configure(&running.engine.gpu().device, &running.surface_config);
                    }
                    Err(wgpu::SurfaceError::OutOfMemory) => {
                        error!("out of memory");
                        event_loop.exit();
                    }
                    Err(e) => warn!("dropping frame: {}", e),
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(running) = &self.running {
            running.window.request_redraw();
        }
    }
}
