use std::fmt;

/// What went wrong while preprocessing a shader.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PreprocessorErrorKind {
    #[error("{0}")]
    Directive(String),
    #[error("unsafe symbols in expression: {0}")]
    UnsafeSymbols(String),
    #[error("invalid expression: {0}")]
    Expression(String),
    #[error("string literal of {len} characters exceeds the limit of {max}")]
    StringTooLong { len: usize, max: usize },
    #[error("only two storage buffers are available")]
    StorageExhausted,
    #[error("missing include: {0}")]
    MissingInclude(String),
    #[error("define of {0} refers to itself")]
    SelfReferentialDefine(String),
    #[error("include depth exceeded")]
    IncludeDepth,
}

/// Preprocessing failure tagged with the 1-based source line (and column when known).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("line {line}{}: {kind}", column_suffix(.column))]
pub struct PreprocessorError {
    pub line: usize,
    pub column: Option<usize>,
    pub kind: PreprocessorErrorKind,
}

impl PreprocessorError {
    pub fn new(line: usize, kind: PreprocessorErrorKind) -> Self {
        Self {
            line,
            column: None,
            kind,
        }
    }

    pub fn with_column(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }
}

fn column_suffix(column: &Option<usize>) -> String {
    column.map(|c| format!(":{}", c)).unwrap_or_default()
}

/// Fatal device-level failures, surfaced synchronously to the host.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("no suitable graphics adapter: {0}")]
    NoAdapter(String),
    #[error("failed to acquire device: {0}")]
    RequestDevice(String),
    #[error("no blit conversion from {space:?} into {target:?}")]
    UnsupportedBlit {
        space: crate::ColorSpace,
        target: wgpu::TextureFormat,
    },
    #[error("device does not support timestamp queries")]
    TimestampsUnsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProfilerError {
    #[error("profiler result buffer is already being mapped")]
    MapInFlight,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessorError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Profiler(#[from] ProfilerError),
    #[error("a compile is already in progress")]
    CompileInProgress,
    #[error("channel index {0} out of range")]
    ChannelIndex(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A compiler message in the coordinates of the text the user typed.
///
/// Reported through the engine's error callback, never returned as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileDiagnostic {
    pub severity: Severity,
    pub message: String,
    /// 1-based line in the original source.
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        write!(f, "{}:{}: {}: {}", self.line, self.column, severity, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn preprocessor_errors_name_their_location() {
        let err = PreprocessorError::new(3, PreprocessorErrorKind::IncludeDepth);
        assert_eq!(err.to_string(), "line 3: include depth exceeded");
        let err = err.with_column(7);
        assert_eq!(err.to_string(), "line 3:7: include depth exceeded");
        assert!(err.source().is_none());

        let wrapped = EngineError::from(PreprocessorError::new(
            1,
            PreprocessorErrorKind::MissingInclude("<noise>".into()),
        ));
        assert_eq!(wrapped.to_string(), "line 1: missing include: <noise>");
    }
}
