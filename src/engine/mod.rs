//! The compute engine: compiles preprocessed programs and runs their entry
//! points once per frame against the shared binding set.

mod asserts;
pub mod prelude;
pub mod scan;
pub mod slots;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use tracing::{info_span, Instrument};

use crate::bindings::{BindingManager, Carryover, CHANNEL_COUNT, DISPATCH_STRIDE};
use crate::blit::{Blitter, ColorSpace};
use crate::channel::ChannelLoader;
use crate::config::EngineConfig;
use crate::error::{
    CompileDiagnostic, EngineError, PreprocessorError, ResourceError, Severity,
};
use crate::gpu::Gpu;
use crate::preprocess::{is_identifier, screen_overrides, IncludeResolver, Preprocessor, SourceMap};
use crate::profiler::{format_timings, PassDescriptor, Profiler};
use crate::uniforms::{KeyboardUniform, MouseUniform};
use asserts::AssertReadback;
pub use scan::EntryPoint;
pub use slots::{CompileGuard, CompileLock, PipelineSlots};

/// One compiled `@compute` entry point.
#[derive(Debug)]
pub struct ComputePipeline {
    pub name: String,
    pub workgroup_size: [u32; 3],
    /// From `#workgroup_count`; otherwise derived from the screen size.
    pub workgroup_count: Option<[u32; 3]>,
    /// `0` means "only on frame 0".
    pub dispatch_count: u32,
    pub passes: Vec<PassDescriptor>,
    pipeline: wgpu::ComputePipeline,
}

impl ComputePipeline {
    pub fn iterations(&self, frame: u32) -> u32 {
        match self.dispatch_count {
            0 if frame == 0 => 1,
            0 => 0,
            n => n,
        }
    }

    pub fn workgroups(&self, width: u32, height: u32) -> [u32; 3] {
        self.workgroup_count.unwrap_or([
            width.div_ceil(self.workgroup_size[0]),
            height.div_ceil(self.workgroup_size[1]),
            1,
        ])
    }
}

/// New per-frame data for the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub frame: u32,
    /// `(entry point, "0.123ms")`
    pub timings: Vec<(String, String)>,
    pub assertions: Vec<String>,
}

pub type SuccessCallback = Box<dyn FnMut(&[String])>;
pub type UpdateCallback = Box<dyn FnMut(&FrameReport)>;
pub type ErrorCallback = Box<dyn FnMut(&CompileDiagnostic)>;
pub type ChannelCallback = Box<dyn FnMut(usize, u32, u32)>;

pub struct ComputeEngine {
    gpu: Gpu,
    config: EngineConfig,
    includes: IncludeResolver,
    bindings: BindingManager,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    bind_group: wgpu::BindGroup,
    blitter: Blitter,
    programs: PipelineSlots<Vec<ComputePipeline>>,
    profiler: Option<Profiler>,
    asserts: Option<AssertReadback>,
    lock: CompileLock,
    shader_error: Arc<AtomicBool>,
    loader: ChannelLoader,
    needs_recompile: bool,
    frame: u32,
    started: Instant,
    last_frame: Instant,
    on_success: Option<SuccessCallback>,
    on_update: Option<UpdateCallback>,
    on_error: Option<ErrorCallback>,
    on_channel: Option<ChannelCallback>,
}

fn install_error_handler(device: &wgpu::Device, flag: Arc<AtomicBool>) {
    device.on_uncaptured_error(Arc::new(move |e: wgpu::Error| {
        error!("device error: {}", e);
        flag.store(true, Ordering::Release);
    }));
}

fn create_pipeline_layout(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
) -> wgpu::PipelineLayout {
    device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Program Pipeline Layout"),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    })
}

impl ComputeEngine {
    pub fn new(gpu: Gpu, config: EngineConfig) -> Result<Self, EngineError> {
        let shader_error = Arc::new(AtomicBool::new(false));
        install_error_handler(&gpu.device, shader_error.clone());

        let bindings = BindingManager::new(
            &gpu.device,
            &gpu.queue,
            config.width,
            config.height,
            config.binding_options(),
            Carryover::default(),
        );
        let layout = bindings.create_bind_group_layout();
        let pipeline_layout = create_pipeline_layout(&gpu.device, &layout);
        let bind_group = bindings.create_bind_group(&layout);
        let blitter = Blitter::new(
            &gpu.device,
            &bindings.screen.view,
            ColorSpace::Linear,
            config.surface_format,
        )?;
        let asserts = bindings
            .asserts
            .as_ref()
            .map(|_| AssertReadback::new(&gpu.device));
        if config.profiling && !gpu.supports_timestamps() {
            warn!("profiling requested but the device has no timestamp queries");
        }
        info!(
            "{} engine ready at {}x{}",
            config.label, config.width, config.height
        );

        let now = Instant::now();
        Ok(Self {
            includes: config.include_resolver(),
            gpu,
            config,
            bindings,
            layout,
            pipeline_layout,
            bind_group,
            blitter,
            programs: PipelineSlots::default(),
            profiler: None,
            asserts,
            lock: CompileLock::default(),
            shader_error,
            loader: ChannelLoader::default(),
            needs_recompile: false,
            frame: 0,
            started: now,
            last_frame: now,
            on_success: None,
            on_update: None,
            on_error: None,
            on_channel: None,
        })
    }

    pub fn on_success(&mut self, callback: impl FnMut(&[String]) + 'static) {
        self.on_success = Some(Box::new(callback));
    }

    pub fn on_update(&mut self, callback: impl FnMut(&FrameReport) + 'static) {
        self.on_update = Some(Box::new(callback));
    }

    pub fn on_error(&mut self, callback: impl FnMut(&CompileDiagnostic) + 'static) {
        self.on_error = Some(Box::new(callback));
    }

    pub fn on_channel(&mut self, callback: impl FnMut(usize, u32, u32) + 'static) {
        self.on_channel = Some(Box::new(callback));
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bindings(&self) -> &BindingManager {
        &self.bindings
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn size(&self) -> (u32, u32) {
        self.bindings.size()
    }

    /// A handle to the lock `compile` takes; holding it makes `render` skip.
    pub fn compile_lock(&self) -> CompileLock {
        self.lock.clone()
    }

    pub fn pipelines(&self) -> &[ComputePipeline] {
        self.programs.current().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn entry_points(&self) -> Vec<String> {
        self.pipelines().iter().map(|p| p.name.clone()).collect()
    }

    /// True when custom uniforms or pass precision changed since the last compile.
    pub fn needs_recompile(&self) -> bool {
        self.needs_recompile
    }

    pub fn mouse_mut(&mut self) -> &mut MouseUniform {
        &mut self.bindings.mouse.host
    }

    pub fn keyboard_mut(&mut self) -> &mut KeyboardUniform {
        &mut self.bindings.keyboard.host
    }

    pub fn preprocess(&mut self, source: &str) -> Result<SourceMap, PreprocessorError> {
        let _span = info_span!("preprocess").entered();
        let (width, height) = self.bindings.size();
        let overrides = screen_overrides(width, height, self.config.string_max_len);
        Preprocessor::new(&mut self.includes, overrides).run(source)
    }

    /// Forgets cached include text, failures included.
    pub fn clear_include_cache(&mut self) {
        self.includes.clear_cache();
    }

    /// Compiles `source_map` and installs one pipeline per entry point.
    ///
    /// Diagnostics go to the error callback and are returned; they never make
    /// this fail. A program that turns out invalid is rolled back on the next
    /// frame.
    pub async fn compile(
        &mut self,
        source_map: &SourceMap,
    ) -> Result<Vec<CompileDiagnostic>, EngineError> {
        let guard = self
            .lock
            .try_acquire()
            .ok_or(EngineError::CompileInProgress)?;
        let span = info_span!("compile", label = %self.config.label);
        let diagnostics = self.compile_locked(source_map).instrument(span).await;
        drop(guard);
        Ok(diagnostics)
    }

    async fn compile_locked(&mut self, source_map: &SourceMap) -> Vec<CompileDiagnostic> {
        // A device error still pending belongs to the program being replaced.
        if self.shader_error.swap(false, Ordering::AcqRel) {
            self.programs.invalidate();
        }
        let header = format!(
            "{}{}",
            source_map.extensions,
            prelude::generate(&self.bindings)
        );
        let prelude_lines = header.lines().count();
        let code = format!("{}{}", header, source_map.source);

        let (entries, problems) = scan::scan_entry_points(&scan::strip_comments(&code));
        let mut diagnostics: Vec<CompileDiagnostic> = problems
            .iter()
            .map(|(line, message)| {
                scan::remap(Severity::Error, message, *line, 1, prelude_lines, source_map)
            })
            .collect();

        let device = self.gpu.device.clone();
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(self.config.label.as_str()),
            source: wgpu::ShaderSource::Wgsl(code.into()),
        });
        let info = module.get_compilation_info().await;
        for message in &info.messages {
            let severity = match message.message_type {
                wgpu::CompilationMessageType::Error => Severity::Error,
                wgpu::CompilationMessageType::Warning => Severity::Warning,
                wgpu::CompilationMessageType::Info => Severity::Info,
            };
            diagnostics.push(match &message.location {
                Some(location) => scan::remap(
                    severity,
                    &message.message,
                    location.line_number as usize,
                    location.line_position as usize,
                    prelude_lines,
                    source_map,
                ),
                None => CompileDiagnostic {
                    severity,
                    message: message.message.clone(),
                    line: 1,
                    column: 1,
                },
            });
        }

        let pipelines: Vec<ComputePipeline> = entries
            .iter()
            .map(|entry| {
                let dispatch_count = source_map.dispatch_count_for(&entry.name);
                let passes = (0..dispatch_count.max(1))
                    .map(|index| PassDescriptor {
                        label: format!("{} #{}", entry.name, index),
                        timestamps: None,
                    })
                    .collect();
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(entry.name.as_str()),
                    layout: Some(&self.pipeline_layout),
                    module: &module,
                    entry_point: Some(entry.name.as_str()),
                    compilation_options: Default::default(),
                    cache: None,
                });
                ComputePipeline {
                    name: entry.name.clone(),
                    workgroup_size: entry.workgroup_size,
                    workgroup_count: source_map.workgroup_count.get(&entry.name).copied(),
                    dispatch_count,
                    passes,
                    pipeline,
                }
            })
            .collect();
        let valid = match device.pop_error_scope().await {
            Some(e) => {
                warn!("program failed validation, keeping the previous one: {}", e);
                false
            }
            None => true,
        };

        for diagnostic in &diagnostics {
            match diagnostic.severity {
                Severity::Error => debug!("{}", diagnostic),
                _ => info!("{}", diagnostic),
            }
            if let Some(callback) = self.on_error.as_mut() {
                callback(diagnostic);
            }
        }

        let names: Vec<String> = pipelines.iter().map(|p| p.name.clone()).collect();
        info!("compiled entry points {:?}", names);
        self.programs.install(pipelines, valid);
        if !valid {
            // The next frame swaps the last working program back in.
            self.shader_error.store(true, Ordering::Release);
        }
        self.rebuild_profiler();
        self.ensure_dispatch_capacity();
        self.needs_recompile = false;

        let failed = diagnostics.iter().any(|d| d.severity == Severity::Error);
        if !failed {
            if let Some(callback) = self.on_success.as_mut() {
                callback(&names);
            }
        }
        diagnostics
    }

    fn rebuild_profiler(&mut self) {
        if let Some(profiler) = self.profiler.take() {
            profiler.dispose();
        }
        if !self.config.profiling || !self.gpu.supports_timestamps() {
            return;
        }
        let Some(program) = self.programs.current_mut() else {
            return;
        };
        let entries: Vec<(String, u32)> = program
            .iter()
            .map(|p| (p.name.clone(), p.dispatch_count))
            .collect();
        match Profiler::new(&self.gpu.device, &self.gpu.queue, &entries) {
            Ok(profiler) => {
                profiler.fill_pass_descriptors(program.iter_mut().flat_map(|p| p.passes.iter_mut()));
                self.profiler = Some(profiler);
            }
            Err(e) => warn!("profiling disabled: {}", e),
        }
    }

    fn ensure_dispatch_capacity(&mut self) {
        let passes: usize = self.pipelines().iter().map(|p| p.passes.len()).sum();
        if self.bindings.ensure_dispatch_capacity(passes as u32) {
            self.bind_group = self.bindings.create_bind_group(&self.layout);
        }
    }

    /// Presents into the surface's current texture.
    pub fn render(&mut self, surface: &wgpu::Surface<'_>) -> Result<(), wgpu::SurfaceError> {
        let frame = surface.get_current_texture()?;
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.render_to_view(&view);
        frame.present();
        Ok(())
    }

    /// Runs one frame and blits the screen texture into `view`.
    ///
    /// Does nothing while a compile holds the lock.
    pub fn render_to_view(&mut self, view: &wgpu::TextureView) {
        if self.lock.is_held() {
            return;
        }
        let _span = info_span!("render", frame = self.frame).entered();
        self.poll_channels();
        let _ = self.gpu.device.poll(wgpu::PollType::Poll);

        let (width, height) = self.bindings.size();
        let mut report = FrameReport {
            frame: self.frame,
            ..Default::default()
        };
        let mut fresh = false;
        if let Some(timings) = self.profiler.as_ref().and_then(Profiler::collect) {
            report.timings = format_timings(&timings);
            fresh = true;
        }
        if let Some(failures) = self
            .asserts
            .as_ref()
            .and_then(|a| a.collect(width as u64 * height as u64))
        {
            report.assertions = failures;
            fresh = true;
        }

        if self.shader_error.swap(false, Ordering::AcqRel) {
            if self.programs.rollback() {
                warn!("rolled back to the last working program");
            } else {
                warn!("no working program to fall back to");
            }
            self.rebuild_profiler();
            self.ensure_dispatch_capacity();
        }

        let now = Instant::now();
        let time = &mut self.bindings.time.host;
        time.frame = self.frame;
        time.elapsed = now.duration_since(self.started).as_secs_f32();
        time.delta = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.bindings.stage(&self.gpu.queue);

        let pipelines = self.programs.current().map(Vec::as_slice).unwrap_or_default();
        let ids: Vec<u32> = pipelines
            .iter()
            .flat_map(|p| 0..p.iterations(self.frame))
            .collect();
        self.bindings.stage_dispatches(&self.gpu.queue, &ids);

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            });
        let mut slot = 0u32;
        for pipeline in pipelines {
            let workgroups = pipeline.workgroups(width, height);
            for index in 0..pipeline.iterations(self.frame) {
                let descriptor = pipeline.passes.get(index as usize);
                let timestamp_writes = match (&self.profiler, descriptor.and_then(|d| d.timestamps)) {
                    (Some(profiler), Some([begin, end])) => Some(wgpu::ComputePassTimestampWrites {
                        query_set: profiler.query_set(),
                        beginning_of_pass_write_index: Some(begin),
                        end_of_pass_write_index: Some(end),
                    }),
                    _ => None,
                };
                {
                    let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: descriptor.map(|d| d.label.as_str()),
                        timestamp_writes,
                    });
                    compute_pass.set_pipeline(&pipeline.pipeline);
                    compute_pass.set_bind_group(
                        0,
                        &self.bind_group,
                        &[(slot as u64 * DISPATCH_STRIDE) as u32],
                    );
                    compute_pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
                }
                // Later entry points read this one's output.
                self.bindings.copy_pass_out_to_in(&mut encoder);
                slot += 1;
            }
        }

        let assert_copied = match (&self.asserts, &self.bindings.asserts) {
            (Some(readback), Some(counts)) => readback.record(&mut encoder, &counts.buffer),
            _ => false,
        };
        let profiled = self
            .profiler
            .as_ref()
            .is_some_and(|p| p.before_finish(&mut encoder));
        self.blitter.blit(&mut encoder, view);
        self.gpu.queue.submit(Some(encoder.finish()));

        if profiled {
            if let Some(Err(e)) = self.profiler.as_ref().map(Profiler::after_finish) {
                warn!("{}", e);
            }
        }
        if assert_copied {
            if let Some(readback) = &self.asserts {
                readback.map();
            }
        }
        self.frame += 1;

        if fresh {
            if let Some(callback) = self.on_update.as_mut() {
                callback(&report);
            }
        }
    }

    fn rebuild_bindings(&mut self, carryover: Carryover, relayout: bool) -> Result<(), ResourceError> {
        let device = &self.gpu.device;
        self.bindings = BindingManager::new(
            device,
            &self.gpu.queue,
            self.config.width,
            self.config.height,
            self.config.binding_options(),
            carryover,
        );
        if relayout {
            self.layout = self.bindings.create_bind_group_layout();
            self.pipeline_layout = create_pipeline_layout(device, &self.layout);
            self.programs.clear();
            if let Some(profiler) = self.profiler.take() {
                profiler.dispose();
            }
            self.needs_recompile = true;
        }
        self.bind_group = self.bindings.create_bind_group(&self.layout);
        self.blitter = Blitter::new(
            device,
            &self.bindings.screen.view,
            ColorSpace::Linear,
            self.config.surface_format,
        )?;
        self.asserts = self
            .bindings
            .asserts
            .as_ref()
            .map(|_| AssertReadback::new(device));
        self.ensure_dispatch_capacity();
        Ok(())
    }

    /// Reallocates screen and pass textures; channels and custom values carry over.
    ///
    /// `SCREEN_WIDTH`/`SCREEN_HEIGHT` in the current program keep their old
    /// values until the host preprocesses and compiles again.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), EngineError> {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == self.bindings.size() {
            return Ok(());
        }
        info!("resizing to {}x{}", width, height);
        let carryover = self.bindings.dispose(true, true);
        self.config.width = width;
        self.config.height = height;
        self.rebuild_bindings(carryover, false)?;
        Ok(())
    }

    /// Clears every buffer and pass texture and restarts from frame 0.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        let carryover = self.bindings.dispose(true, true);
        self.rebuild_bindings(carryover, false)?;
        self.frame = 0;
        self.started = Instant::now();
        self.last_frame = self.started;
        Ok(())
    }

    /// Switches pass textures between `rgba32float` and `rgba16float`.
    ///
    /// The current program is dropped; compile again to run.
    pub fn set_pass_f32(&mut self, enabled: bool) -> Result<(), EngineError> {
        if self.config.pass_f32 == enabled {
            return Ok(());
        }
        self.config.pass_f32 = enabled;
        let carryover = self.bindings.dispose(true, true);
        self.rebuild_bindings(carryover, true)?;
        Ok(())
    }

    /// Declares the custom float uniforms. Takes effect on the next compile.
    pub fn set_custom_floats(&mut self, names: &[String], values: &[f32]) {
        let valid: Vec<String> = names
            .iter()
            .filter(|name| {
                let ok = is_identifier(name);
                if !ok {
                    warn!("ignoring custom uniform {:?}", name);
                }
                ok
            })
            .cloned()
            .collect();
        let values: Vec<f32> = names
            .iter()
            .zip(values)
            .filter(|(name, _)| is_identifier(name))
            .map(|(_, value)| *value)
            .collect();
        let custom = &mut self.bindings.custom.host;
        if custom.names() != valid.as_slice() {
            self.needs_recompile = true;
        }
        custom.define(&valid, &values);
    }

    /// Updates one declared custom value in place.
    pub fn set_custom_value(&mut self, name: &str, value: f32) -> bool {
        self.bindings.custom.host.set(name, value)
    }

    /// Decodes `bytes` off-thread; the texture is installed by a later frame.
    pub fn load_channel(&mut self, index: usize, bytes: Vec<u8>) -> Result<(), EngineError> {
        if index >= CHANNEL_COUNT {
            return Err(EngineError::ChannelIndex(index));
        }
        self.loader.spawn(index, bytes);
        Ok(())
    }

    /// Installs any channel images decoded since the last call.
    ///
    /// Returns how many decode results were handled, failures included. A
    /// failed image leaves the channel and the running program untouched.
    pub fn poll_channels(&mut self) -> usize {
        let results = self.loader.drain();
        let handled = results.len();
        for (index, decoded) in results {
            let image = match decoded {
                Ok(image) => image,
                Err(e) => {
                    warn!("channel{} failed to load: {:#}", index, e);
                    continue;
                }
            };
            let label = format!("channel{}", index);
            let texture = match image.upload(&self.gpu.device, &self.gpu.queue, &label) {
                Ok(texture) => texture,
                Err(e) => {
                    warn!("channel{} upload failed: {:#}", index, e);
                    continue;
                }
            };
            if let Some(old) = self.bindings.replace_channel(index, texture) {
                self.bind_group = self.bindings.create_bind_group(&self.layout);
                // Frames already submitted may still sample the old texture.
                self.gpu
                    .queue
                    .on_submitted_work_done(move || old.texture.destroy());
            }
            if let Some(callback) = self.on_channel.as_mut() {
                callback(index, image.width, image.height);
            }
        }
        handled
    }

    /// Moves the engine onto another device, releasing the current one first.
    ///
    /// Channels fall back to placeholders; custom values survive. Compile
    /// again afterwards.
    pub fn replace_device(&mut self, gpu: Gpu) -> Result<(), EngineError> {
        info!("replacing device");
        self.programs.clear();
        if let Some(profiler) = self.profiler.take() {
            profiler.dispose();
        }
        let carryover = self.bindings.dispose(false, true);
        self.gpu.device.destroy();

        install_error_handler(&gpu.device, self.shader_error.clone());
        self.shader_error.store(false, Ordering::Release);
        self.gpu = gpu;
        self.rebuild_bindings(carryover, true)?;
        self.frame = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniforms::UniformProvider;
    use std::cell::RefCell;
    use std::rc::Rc;

    const PROGRAM: &str = "\
#storage counter atomic<u32>
#dispatch_count update 3
#dispatch_once init
#workgroup_count init 1 1 1

@compute @workgroup_size(1)
fn init() {
    atomicStore(&counter, 0u);
}

@compute @workgroup_size(8, 8)
fn update(@builtin(global_invocation_id) id: vec3u) {
    if (id.x == 0u && id.y == 0u) {
        atomicAdd(&counter, dispatch.id + 1u);
    }
    passStore(0, int2(id.xy), float4(1.0));
}
";

    fn engine() -> Option<ComputeEngine> {
        let gpu = crate::gpu::test_gpu()?;
        let config = EngineConfig::builder()
            .with_size(64, 32)
            .with_surface_format(wgpu::TextureFormat::Rgba8UnormSrgb)
            .with_storage_limit(1 << 16)
            .with_std_include_root(None)
            .build();
        Some(ComputeEngine::new(gpu, config).unwrap())
    }

    fn target(engine: &ComputeEngine) -> wgpu::TextureView {
        let (width, height) = engine.size();
        engine
            .gpu()
            .device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("test target"),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8UnormSrgb,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                view_formats: &[],
            })
            .create_view(&Default::default())
    }

    #[test]
    fn iterations_follow_dispatch_count() {
        let Some(mut engine) = engine() else {
            return;
        };
        let map = engine.preprocess(PROGRAM).unwrap();
        let diagnostics = pollster::block_on(engine.compile(&map)).unwrap();
        assert!(
            diagnostics.iter().all(|d| d.severity != Severity::Error),
            "{diagnostics:?}"
        );

        let pipelines = engine.pipelines();
        assert_eq!(engine.entry_points(), vec!["init", "update"]);
        assert_eq!(pipelines[0].dispatch_count, 0);
        assert_eq!(pipelines[0].passes.len(), 1);
        assert_eq!(pipelines[0].workgroups(64, 32), [1, 1, 1]);
        assert_eq!((pipelines[0].iterations(0), pipelines[0].iterations(1)), (1, 0));
        assert_eq!(pipelines[1].dispatch_count, 3);
        assert_eq!(pipelines[1].passes.len(), 3);
        assert_eq!(pipelines[1].workgroup_size, [8, 8, 1]);
        assert_eq!(pipelines[1].workgroups(64, 32), [8, 4, 1]);
        assert_eq!(pipelines[1].iterations(5), 3);
    }

    #[test]
    fn render_advances_frames_unless_compiling() {
        let Some(mut engine) = engine() else {
            return;
        };
        let view = target(&engine);
        let map = engine.preprocess(PROGRAM).unwrap();
        pollster::block_on(engine.compile(&map)).unwrap();

        engine.render_to_view(&view);
        engine.render_to_view(&view);
        assert_eq!(engine.frame(), 2);

        let lock = engine.compile_lock();
        let guard = lock.try_acquire().unwrap();
        engine.render_to_view(&view);
        assert_eq!(engine.frame(), 2);
        assert!(matches!(
            pollster::block_on(engine.compile(&map)),
            Err(EngineError::CompileInProgress)
        ));
        drop(guard);

        engine.reset().unwrap();
        assert_eq!(engine.frame(), 0);
        engine.render_to_view(&view);
        assert_eq!(engine.frame(), 1);
    }

    #[test]
    fn broken_program_reports_and_rolls_back() {
        let Some(mut engine) = engine() else {
            return;
        };
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        engine.on_error(move |d| sink.borrow_mut().push(d.clone()));
        let successes = Rc::new(RefCell::new(0));
        let counter = successes.clone();
        engine.on_success(move |_| *counter.borrow_mut() += 1);

        let good = engine
            .preprocess("@compute @workgroup_size(8, 8)\nfn good() {}\n")
            .unwrap();
        pollster::block_on(engine.compile(&good)).unwrap();
        assert_eq!(*successes.borrow(), 1);

        let bad = engine
            .preprocess("#define X 1\n@compute @workgroup_size(8, 8)\nfn bad() {\n    let y: f32 = missing_name;\n}\n")
            .unwrap();
        pollster::block_on(engine.compile(&bad)).unwrap();
        assert_eq!(*successes.borrow(), 1);
        let errors = errors.borrow();
        let first = errors
            .iter()
            .find(|d| d.severity == Severity::Error)
            .unwrap();
        assert_eq!(first.line, 4);

        let view = target(&engine);
        engine.render_to_view(&view);
        assert_eq!(engine.entry_points(), vec!["good"]);
    }

    #[test]
    fn back_to_back_compiles_keep_only_the_last_program() {
        let Some(mut engine) = engine() else {
            return;
        };
        let view = target(&engine);
        let compile = |engine: &mut ComputeEngine, source: &str| {
            let map = engine.preprocess(source).unwrap();
            pollster::block_on(engine.compile(&map)).unwrap()
        };
        compile(&mut engine, "@compute @workgroup_size(8, 8)\nfn first() {}\n");
        compile(&mut engine, "@compute @workgroup_size(8, 8)\nfn broken() { let a: f32 = nope; }\n");
        compile(&mut engine, "@compute @workgroup_size(8, 8)\nfn second() {}\n");
        assert_eq!(engine.entry_points(), vec!["second"]);

        engine.render_to_view(&view);
        engine.render_to_view(&view);
        assert_eq!(engine.entry_points(), vec!["second"]);

        // A failure after that falls back to `second`, never to `broken`.
        compile(&mut engine, "@compute @workgroup_size(8, 8)\nfn broken() { let a: f32 = nope; }\n");
        engine.render_to_view(&view);
        assert_eq!(engine.entry_points(), vec!["second"]);
        engine.render_to_view(&view);
        assert_eq!(engine.entry_points(), vec!["second"]);
    }

    #[test]
    fn resize_keeps_channels_and_custom_values() {
        let Some(mut engine) = engine() else {
            return;
        };
        engine.set_custom_floats(&["speed".into(), "bad name".into()], &[2.5, 1.0]);
        assert!(engine.needs_recompile());
        assert!(engine.set_custom_value("speed", 4.0));
        assert_eq!(engine.bindings().custom.host.names(), ["speed"]);

        let loaded = Rc::new(RefCell::new(None));
        let sink = loaded.clone();
        engine.on_channel(move |index, w, h| *sink.borrow_mut() = Some((index, w, h)));
        let mut png = Vec::new();
        image::RgbaImage::from_pixel(3, 2, image::Rgba([1, 2, 3, 255]))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        engine.load_channel(0, png).unwrap();
        assert!(matches!(
            engine.load_channel(2, Vec::new()),
            Err(EngineError::ChannelIndex(2))
        ));
        for _ in 0..200 {
            engine.poll_channels();
            if loaded.borrow().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(*loaded.borrow(), Some((0, 3, 2)));

        let channel = engine.bindings().channels[0].texture.clone();
        let custom = engine.bindings().custom.host.as_bytes().to_vec();

        engine.resize(128, 64).unwrap();
        let bindings = engine.bindings();
        assert_eq!(bindings.size(), (128, 64));
        assert_eq!(bindings.screen.texture.size(), wgpu::Extent3d {
            width: 128,
            height: 64,
            depth_or_array_layers: 1,
        });
        for pass in [&bindings.pass_in.texture, &bindings.pass_out.texture] {
            assert_eq!((pass.width(), pass.height()), (128, 64));
            assert_eq!(pass.depth_or_array_layers(), 4);
        }
        assert!(bindings.channels[0].texture == channel, "channel0 was recreated");
        assert_eq!(bindings.channels[0].size(), (3, 2));
        assert_eq!(bindings.channels[1].size(), (1, 1));
        assert_eq!(bindings.custom.host.as_bytes(), custom.as_slice());
        assert_eq!(bindings.custom.host.get("speed"), Some(4.0));
    }

    #[test]
    fn oversized_channel_is_dropped_without_touching_the_program() {
        let Some(mut engine) = engine() else {
            return;
        };
        let view = target(&engine);
        let map = engine
            .preprocess("@compute @workgroup_size(8, 8)\nfn good() {}\n")
            .unwrap();
        pollster::block_on(engine.compile(&map)).unwrap();
        let loaded = Rc::new(RefCell::new(0));
        let sink = loaded.clone();
        engine.on_channel(move |_, _, _| *sink.borrow_mut() += 1);

        let width = engine.gpu().device.limits().max_texture_dimension_2d + 1;
        let mut png = Vec::new();
        image::RgbaImage::from_pixel(width, 1, image::Rgba([9, 9, 9, 255]))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        engine.load_channel(1, png).unwrap();
        let mut handled = 0;
        for _ in 0..500 {
            handled += engine.poll_channels();
            if handled > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(handled, 1);
        assert_eq!(*loaded.borrow(), 0);
        assert_eq!(engine.bindings().channels[1].size(), (1, 1));
        assert!(!engine.shader_error.load(Ordering::Acquire));

        engine.render_to_view(&view);
        engine.render_to_view(&view);
        assert_eq!(engine.entry_points(), vec!["good"]);
        assert_eq!(engine.frame(), 2);
    }

    #[test]
    fn dispatch_buffer_grows_with_the_program() {
        let Some(mut engine) = engine() else {
            return;
        };
        let before = engine.bindings().dispatch_capacity();
        let map = engine
            .preprocess("#dispatch_count update 100\n@compute @workgroup_size(8, 8)\nfn update() {}\n")
            .unwrap();
        pollster::block_on(engine.compile(&map)).unwrap();
        assert_eq!(engine.pipelines()[0].passes.len(), 100);
        let after = engine.bindings().dispatch_capacity();
        assert!(after >= 100 && after > before, "{before} -> {after}");
        assert!(after.is_power_of_two());

        let view = target(&engine);
        engine.render_to_view(&view);
        assert_eq!(engine.frame(), 1);
    }

    #[test]
    fn precision_switch_requires_recompile() {
        let Some(mut engine) = engine() else {
            return;
        };
        let map = engine.preprocess(PROGRAM).unwrap();
        pollster::block_on(engine.compile(&map)).unwrap();
        assert!(!engine.needs_recompile());
        engine.set_pass_f32(true).unwrap();
        assert!(engine.needs_recompile());
        assert!(engine.pipelines().is_empty());
        assert_eq!(
            engine.bindings().pass_out.texture.format(),
            wgpu::TextureFormat::Rgba32Float
        );
        let map = engine.preprocess(PROGRAM).unwrap();
        pollster::block_on(engine.compile(&map)).unwrap();
        assert_eq!(engine.pipelines().len(), 2);
    }
}
