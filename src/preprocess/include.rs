use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};

/// Remote root that `#include <name>` resolves against.
pub const DEFAULT_STD_ROOT: &str = "https://raw.githubusercontent.com/compute-toys/include/main";

/// Logical include path as written in an `#include` directive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IncludePath {
    /// `#include <name>`: the fixed standard library.
    Std(String),
    /// `#include "path"`: relative to the user's include root.
    User(String),
}

impl IncludePath {
    /// Parses the directive argument, quotes or angle brackets included.
    pub fn parse(arg: &str) -> Option<Self> {
        let arg = arg.trim();
        let std = match (arg.chars().next(), arg.chars().last()) {
            (Some('<'), Some('>')) => true,
            (Some('"'), Some('"')) => false,
            _ => return None,
        };
        if arg.len() < 2 {
            return None;
        }
        let inner = arg[1..arg.len() - 1].trim();
        if inner.is_empty() {
            return None;
        }
        Some(if std {
            Self::Std(inner.to_string())
        } else {
            Self::User(inner.to_string())
        })
    }

    /// Cache key; std and user namespaces never collide.
    pub fn logical_name(&self) -> String {
        match self {
            Self::Std(name) => format!("std/{}", name),
            Self::User(path) => format!("user/{}", path),
        }
    }
}

/// Something that can produce the text of an include.
pub trait IncludeSource: Send {
    fn fetch(&self, path: &IncludePath) -> Result<String>;
}

/// Fetches `<name>` includes over HTTP from `{root}/std/{name}.wgsl`.
pub struct HttpIncludeSource {
    client: reqwest::blocking::Client,
    root: String,
}

impl HttpIncludeSource {
    pub fn new(root: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder().build()?;
        Ok(Self {
            client,
            root: root.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, path: &IncludePath) -> String {
        match path {
            IncludePath::Std(name) => format!("{}/std/{}.wgsl", self.root, name),
            IncludePath::User(path) => format!("{}/{}", self.root, path),
        }
    }
}

impl IncludeSource for HttpIncludeSource {
    fn fetch(&self, path: &IncludePath) -> Result<String> {
        let url = self.url_for(path);
        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()
            .with_context(|| format!("include server rejected {url}"))?;
        Ok(response.text()?)
    }
}

/// Resolves `"path"` includes inside a local directory.
pub struct DirIncludeSource {
    root: PathBuf,
}

impl DirIncludeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl IncludeSource for DirIncludeSource {
    fn fetch(&self, path: &IncludePath) -> Result<String> {
        let relative = match path {
            IncludePath::User(p) => Path::new(p),
            IncludePath::Std(name) => bail!("<{name}> is not a user include"),
        };
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("include path {} escapes the include root", relative.display());
        }
        let full = self.root.join(relative);
        std::fs::read_to_string(&full).with_context(|| format!("reading {}", full.display()))
    }
}

/// In-memory includes, handy for embedding a fixed library.
#[derive(Default)]
pub struct StaticIncludeSource {
    files: HashMap<IncludePath, String>,
}

impl StaticIncludeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: IncludePath, text: &str) -> Self {
        self.files.insert(path, text.to_string());
        self
    }
}

impl IncludeSource for StaticIncludeSource {
    fn fetch(&self, path: &IncludePath) -> Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("{} not found", path.logical_name()))
    }
}

/// Include lookup with a per-logical-name cache.
///
/// Failures are cached too: a name that could not be fetched once is never
/// requested again for the lifetime of the resolver.
#[derive(Default)]
pub struct IncludeResolver {
    std_source: Option<Box<dyn IncludeSource>>,
    user_source: Option<Box<dyn IncludeSource>>,
    cache: HashMap<String, Option<Arc<str>>>,
}

impl IncludeResolver {
    pub fn new(
        std_source: Option<Box<dyn IncludeSource>>,
        user_source: Option<Box<dyn IncludeSource>>,
    ) -> Self {
        Self {
            std_source,
            user_source,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, path: &IncludePath) -> Option<Arc<str>> {
        let key = path.logical_name();
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        let source = match path {
            IncludePath::Std(_) => self.std_source.as_deref(),
            IncludePath::User(_) => self.user_source.as_deref(),
        };
        let fetched = match source {
            Some(source) => match source.fetch(path) {
                Ok(text) => {
                    info!("fetched include {}", key);
                    Some(Arc::<str>::from(text))
                }
                Err(e) => {
                    warn!("include {} unavailable: {:#}", key, e);
                    None
                }
            },
            None => {
                warn!("no include source configured for {}", key);
                None
            }
        };
        self.cache.insert(key, fetched.clone());
        fetched
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        result: Option<String>,
    }

    impl IncludeSource for CountingSource {
        fn fetch(&self, _path: &IncludePath) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().ok_or_else(|| anyhow!("offline"))
        }
    }

    #[test]
    fn parses_both_include_forms() {
        assert_eq!(
            IncludePath::parse("<string>"),
            Some(IncludePath::Std("string".into()))
        );
        assert_eq!(
            IncludePath::parse("\"lib/noise.wgsl\""),
            Some(IncludePath::User("lib/noise.wgsl".into()))
        );
        assert_eq!(IncludePath::parse("<string\""), None);
        assert_eq!(IncludePath::parse("<>"), None);
        assert_eq!(IncludePath::parse("string"), None);
    }

    #[test]
    fn failures_are_cached_and_never_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut resolver = IncludeResolver::new(
            Some(Box::new(CountingSource {
                calls: calls.clone(),
                result: None,
            })),
            None,
        );
        let path = IncludePath::Std("missing".into());
        assert!(resolver.resolve(&path).is_none());
        assert!(resolver.resolve(&path).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        resolver.clear_cache();
        assert!(resolver.resolve(&path).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn successes_are_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut resolver = IncludeResolver::new(
            Some(Box::new(CountingSource {
                calls: calls.clone(),
                result: Some("fn f() {}".into()),
            })),
            None,
        );
        let path = IncludePath::Std("f".into());
        assert_eq!(resolver.resolve(&path).as_deref(), Some("fn f() {}"));
        assert_eq!(resolver.resolve(&path).as_deref(), Some("fn f() {}"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dir_source_reads_relative_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/noise.wgsl"), "fn noise() {}").unwrap();
        let source = DirIncludeSource::new(dir.path());

        let text = source
            .fetch(&IncludePath::User("lib/noise.wgsl".into()))
            .unwrap();
        assert_eq!(text, "fn noise() {}");
        assert!(source
            .fetch(&IncludePath::User("../secret.wgsl".into()))
            .is_err());
        assert!(source.fetch(&IncludePath::Std("noise".into())).is_err());
    }

    #[test]
    fn http_source_builds_std_urls() {
        let source = HttpIncludeSource::new("https://example.com/include/").unwrap();
        assert_eq!(
            source.url_for(&IncludePath::Std("string".into())),
            "https://example.com/include/std/string.wgsl"
        );
    }
}
