use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

use log::{info, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

/// Watches one shader file and hands back its text when it changes.
pub struct ShaderHotReload {
    path: PathBuf,
    last_content: String,
    events: Receiver<notify::Event>,
    _watcher: RecommendedWatcher,
}

impl ShaderHotReload {
    pub fn new(path: impl Into<PathBuf>) -> notify::Result<Self> {
        let path = path.into();
        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                tx.send(event).unwrap_or_default();
            }
        })?;
        // Editors often replace the file instead of writing it, so watch the directory.
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;
        info!("watching {}", path.display());

        let last_content = fs::read_to_string(&path).unwrap_or_default();
        Ok(Self {
            path,
            last_content,
            events,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content(&self) -> &str {
        &self.last_content
    }

    /// New file text if the file changed since the last call.
    pub fn check_and_reload(&mut self) -> Option<&str> {
        let name = self.path.file_name();
        let touched = self
            .events
            .try_iter()
            .filter(|event| event.paths.iter().any(|p| p.file_name() == name))
            .count()
            > 0;
        if !touched {
            return None;
        }
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!("could not read {}: {}", self.path.display(), e);
                return None;
            }
        };
        if content == self.last_content {
            return None;
        }
        self.last_content = content;
        Some(&self.last_content)
    }
}
