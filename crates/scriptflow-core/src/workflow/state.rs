//! Per-run mutable state shared by the engine and step executors.

/// Log lines and security warnings accumulated over one run.
///
/// Lines here are the caller-facing trace returned in `RunResult`; they are
/// mirrored to `tracing` at debug level.
#[derive(Debug, Default, Clone)]
pub struct RunState {
    logs: Vec<String>,
    warnings: Vec<String>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!(line = line.as_str(), "run log");
        self.logs.push(line);
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(warning = warning.as_str(), "run warning");
        self.warnings.push(warning);
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Consume the state, returning `(logs, warnings)`.
    pub fn into_parts(self) -> (Vec<String>, Vec<String>) {
        (self.logs, self.warnings)
    }
}
