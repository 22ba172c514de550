//! Per-instance logging.
//!
//! Each provider instance owns its own `tracing` dispatcher instead of
//! installing a global subscriber, so several instances (and the tests) can
//! coexist in one process. The dispatcher is quiet unless `debug = true`, in
//! which case DEBUG-level lines are appended to a log file in the working
//! directory.
//!
//! Work done for one engine call runs inside a `principal` span carrying the
//! `resource` and `func` fields, so every line it produces can be correlated.

use crate::constants::LOG_FILE_NAME;
use crate::principal::{Operation, PrincipalKind};
use std::fs::OpenOptions;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing::instrument::{Instrument, Instrumented, WithDispatch, WithSubscriber};
use tracing::{Dispatch, Level, Span};
use tracing_subscriber::fmt::MakeWriter;

/// The base logger of a provider instance.
#[derive(Clone)]
pub struct ProviderLogging {
    dispatch: Dispatch,
    enabled: bool,
}

impl ProviderLogging {
    /// A logger that drops everything.
    pub fn quiet() -> Self {
        Self {
            dispatch: Dispatch::none(),
            enabled: false,
        }
    }

    /// Append DEBUG-level lines to `path`, creating it if needed.
    pub fn to_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::with_writer(Mutex::new(file)))
    }

    /// Append to the default log file in the working directory.
    pub fn debug_file() -> io::Result<Self> {
        Self::to_file(LOG_FILE_NAME)
    }

    /// Log DEBUG-level lines to an arbitrary writer.
    pub fn with_writer<W>(make_writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_writer(make_writer)
            .with_ansi(false)
            .finish();

        Self {
            dispatch: Dispatch::new(subscriber),
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Derive the logger for one operation on one principal kind.
    pub fn with_context(&self, kind: PrincipalKind, operation: Operation) -> OperationLogger {
        let span = tracing::dispatcher::with_default(&self.dispatch, || {
            tracing::info_span!(
                "principal",
                resource = kind.resource_name(),
                func = operation.as_str()
            )
        });
        OperationLogger {
            dispatch: self.dispatch.clone(),
            span,
        }
    }

    /// Run `f` with this logger as the current dispatcher.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl Default for ProviderLogging {
    fn default() -> Self {
        Self::quiet()
    }
}

impl std::fmt::Debug for ProviderLogging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderLogging")
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Logger bound to one operation.
pub struct OperationLogger {
    dispatch: Dispatch,
    span: Span,
}

impl OperationLogger {
    /// Run `future` inside the operation span, on this instance's dispatcher.
    pub fn run<F: Future>(&self, future: F) -> WithDispatch<Instrumented<F>> {
        future
            .instrument(self.span.clone())
            .with_subscriber(self.dispatch.clone())
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
