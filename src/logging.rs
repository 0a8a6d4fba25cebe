//! Logging port and subscriber setup.
//!
//! Library components never reach for a process-wide logger object. Each one
//! receives a [`Logger`] in its constructor; the logger wraps a `tracing`
//! span so every event it records carries the component (and, where known,
//! the story) it came from. The binary installs the subscriber once via
//! [`init_tracing`].

use std::fmt::Display;
use std::path::Path;
use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Injectable logging handle.
#[derive(Debug, Clone)]
pub struct Logger {
    span: Span,
}

impl Logger {
    /// Create a logger scoped to a named component.
    pub fn component(name: &'static str) -> Self {
        Self {
            span: tracing::info_span!("cadence", component = name),
        }
    }

    /// A logger that records nothing. Useful in tests.
    pub fn disabled() -> Self {
        Self { span: Span::none() }
    }

    /// Derive a child logger that also tags events with a story id.
    pub fn for_story(&self, story_id: &str) -> Self {
        if self.span.is_none() {
            return Self::disabled();
        }
        Self {
            span: tracing::info_span!(parent: &self.span, "story", story_id = %story_id),
        }
    }

    /// Derive a logger for a sub-component. A disabled logger stays disabled.
    pub fn child(&self, name: &'static str) -> Self {
        if self.span.is_none() {
            return Self::disabled();
        }
        Self {
            span: tracing::info_span!(parent: &self.span, "cadence", component = name),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn debug(&self, msg: impl Display) {
        let _entered = self.span.enter();
        tracing::debug!("{}", msg);
    }

    pub fn info(&self, msg: impl Display) {
        let _entered = self.span.enter();
        tracing::info!("{}", msg);
    }

    pub fn warn(&self, msg: impl Display) {
        let _entered = self.span.enter();
        tracing::warn!("{}", msg);
    }

    pub fn error(&self, msg: impl Display) {
        let _entered = self.span.enter();
        tracing::error!("{}", msg);
    }
}

/// Output format for the console layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install the global subscriber.
///
/// Console output goes to stderr filtered by `RUST_LOG` (or `debug` when
/// `verbose`); when `log_dir` is given a daily-rolling file layer is added.
/// The returned guard must be held until exit so buffered lines are flushed.
pub fn init_tracing(
    verbose: bool,
    format: LogFormat,
    log_dir: Option<&Path>,
) -> Option<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cadence={}", default_level)));

    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, "cadence.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let result = match format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("Warning: tracing already initialised: {}", e);
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_logger_accepts_events() {
        let logger = Logger::disabled();
        logger.info("nothing to see");
        logger.for_story("S-1").warn("still nothing");
        assert!(logger.span().is_none());
    }

    #[test]
    fn children_of_disabled_logger_are_disabled() {
        let logger = Logger::disabled();
        assert!(logger.child("checkpoint").span().is_none());
        assert!(logger.child("assessor").for_story("S-1").span().is_none());
    }

    #[test]
    fn component_logger_is_cloneable() {
        let logger = Logger::component("assessor");
        let clone = logger.clone();
        clone.debug("cloned");
    }
}
