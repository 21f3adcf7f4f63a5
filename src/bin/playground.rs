use std::path::PathBuf;

use anyhow::Context;
use kernelpad::{EngineConfig, PlaygroundApp};

fn main() -> anyhow::Result<()> {
    match std::env::var_os("KERNELPAD_LOG_DIR") {
        Some(dir) => kernelpad::file_log::init_tracing(dir),
        None => env_logger::init(),
    }

    let mut args = std::env::args_os().skip(1);
    let shader = args
        .next()
        .map(PathBuf::from)
        .context("usage: playground <shader.wgsl> [channel0] [channel1]")?;

    let mut builder = EngineConfig::builder()
        .with_size(1280, 720)
        .with_profiling()
        .with_debug_asserts()
        .with_label("playground");
    if let Ok(root) = std::env::var("KERNELPAD_INCLUDE_ROOT") {
        builder = builder.with_std_include_root(Some(&root).filter(|r| !r.is_empty()).map(String::as_str));
    }
    if let Some(dir) = std::env::var_os("KERNELPAD_USER_INCLUDES") {
        builder = builder.with_user_include_root(dir);
    } else if let Some(dir) = shader.parent() {
        builder = builder.with_user_include_root(dir);
    }

    let mut app = PlaygroundApp::new("kernelpad", builder.build(), shader)?;
    for (index, path) in args.take(2).enumerate() {
        app = app.with_channel(index, PathBuf::from(path));
    }
    app.run()
}
