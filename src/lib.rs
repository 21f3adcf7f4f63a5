//! kernelpad: a live WGSL compute-shader engine.
//!
//! Source goes through [`Preprocessor`](preprocess::Preprocessor), then
//! [`ComputeEngine::compile`] builds one pipeline per `@compute` entry point
//! and [`ComputeEngine::render`] runs them every frame against a fixed set of
//! bindings before blitting the `screen` texture to the surface.

pub mod app;
pub mod bindings;
pub mod blit;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod file_log;
pub mod gpu;
pub mod hot;
pub mod keyinputs;
pub mod mouse;
pub mod preprocess;
pub mod profiler;
pub mod uniforms;

pub use app::PlaygroundApp;
pub use bindings::{BindingManager, BindingOptions};
pub use blit::{Blitter, ColorSpace};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::{ComputeEngine, ComputePipeline, FrameReport};
pub use error::{
    CompileDiagnostic, EngineError, PreprocessorError, PreprocessorErrorKind, ProfilerError,
    ResourceError, Severity,
};
pub use gpu::Gpu;
pub use hot::ShaderHotReload;
pub use keyinputs::KeyInputHandler;
pub use mouse::MouseTracker;
pub use preprocess::{Preprocessor, SourceMap};
pub use profiler::Profiler;
pub use uniforms::*;
