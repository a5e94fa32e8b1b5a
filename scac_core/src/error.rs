use thiserror::Error;

/// Errors surfaced by every stage of a search.
///
/// None of these are retried. A search that hits any of them aborts, since a
/// missing measurement must never be mistaken for a zero signal.
#[derive(Error, Debug)]
pub enum ScacError {
    /// Caller-supplied batch, alphabet or length inconsistency.
    /// Always detected before any process is spawned.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An instrumented run did not produce a parseable instruction count.
    /// `raw_output` holds whatever the instrumentation emitted, for debugging.
    #[error("Oracle error: {message}\n--- captured output ---\n{raw_output}")]
    Oracle { message: String, raw_output: String },

    /// A prerequisite executable, plugin or target path is missing.
    #[error("Missing resource: {0}")]
    Resource(String),

    /// The run was stopped because a sibling candidate in the same batch failed.
    #[error("Invocation cancelled after a sibling failure")]
    Cancelled,

    /// Spawning or talking to a child process failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be read or parsed.
    #[error("Config file error: {0}")]
    ConfigFile(String),
}

impl ScacError {
    pub fn config(msg: impl Into<String>) -> Self {
        ScacError::Config(msg.into())
    }

    pub fn oracle(msg: impl Into<String>, raw_output: impl Into<String>) -> Self {
        ScacError::Oracle {
            message: msg.into(),
            raw_output: raw_output.into(),
        }
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        ScacError::Resource(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScacError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ScacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_error_display_includes_raw_output() {
        let err = ScacError::oracle("no instruction count found", "perf: command not found");
        let rendered = err.to_string();
        assert!(rendered.contains("no instruction count found"));
        assert!(rendered.contains("perf: command not found"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ScacError = io.into();
        assert!(matches!(err, ScacError::Io(_)));
        assert!(!err.is_cancelled());
        assert!(ScacError::Cancelled.is_cancelled());
    }
}
