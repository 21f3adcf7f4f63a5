use std::path::Path;

use tracing::{level_filters::LevelFilter, Level};
use tracing_subscriber::{fmt::writer::MakeWriterExt, EnvFilter};

const LOUD_CRATES: [&str; 3] = ["naga", "wgpu_core", "wgpu_hal"];

/// `RUST_LOG` with the wgpu internals held at `warn` unless named explicitly.
pub fn quiet_filter(rust_log: Option<&str>) -> String {
    let mut filter = rust_log.unwrap_or("warn").to_owned();
    // Silence wgpu log spam (https://github.com/gfx-rs/wgpu/issues/3206)
    for loud_crate in LOUD_CRATES {
        if !filter.contains(&format!("{loud_crate}=")) {
            filter += &format!(",{loud_crate}=warn");
        }
    }
    filter
}

/// Sends `log` and `tracing` output to `<dir>/kernelpad.log`.
pub fn init_tracing(dir: impl AsRef<Path>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = quiet_filter(rust_log.as_deref());

    let log_file =
        tracing_appender::rolling::never(dir.as_ref(), "kernelpad.log").with_max_level(Level::DEBUG);
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_max_level(LevelFilter::DEBUG)
        .with_file(true)
        .with_line_number(true)
        .without_time()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    tracing::debug!("logging to {}", dir.as_ref().display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loud_crates_default_to_warn() {
        assert_eq!(
            quiet_filter(None),
            "warn,naga=warn,wgpu_core=warn,wgpu_hal=warn"
        );
        let filter = quiet_filter(Some("kernelpad=debug,naga=info"));
        assert!(filter.starts_with("kernelpad=debug,naga=info"));
        assert!(!filter.contains("naga=warn"));
        assert!(filter.contains("wgpu_hal=warn"));
    }
}
