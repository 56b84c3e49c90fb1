use tracing::*;

// Single-writer sink for per-app status rows.  The reconciler owns the
// reporter and is the only component that touches it; workers hand their
// progress lines to the reconciler over the result channel instead.
pub trait Reporter: Send {
    fn set_status(&mut self, app: &str, status: &str);
    fn log_line(&mut self, app: &str, line: &str);
    fn refresh(&mut self);
}

/// Reports app progress through the tracing subscriber, one line per update.
/// Stands in for the TTY renderer when stdout is not a terminal.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn set_status(&mut self, app: &str, status: &str) {
        info!("{app}: {status}");
    }

    fn log_line(&mut self, app: &str, line: &str) {
        info!("{app} | {line}");
    }

    fn refresh(&mut self) {}
}
