use tracing_subscriber::fmt::format::FmtSpan;

use crate::errors::*;

pub const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
pub const DEFAULT_LOG_LEVEL: &str = "warn";

// The up reconciler logs through the progress reporter on a TTY, so the
// subscriber stays compact; file/line info is only useful at debug and up.
pub fn setup(level: &str) -> EmptyResult {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW)
        .with_target(false)
        .with_env_filter(validated(level)?)
        .compact()
        .init();
    Ok(())
}

pub fn setup_for_cli(level: &str) -> EmptyResult {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(validated(level)?)
        .without_time()
        .compact()
        .init();
    Ok(())
}

fn validated(level: &str) -> anyhow::Result<String> {
    if !LOG_LEVELS.contains(&level) {
        bail!("log level can only be set to one of {}", LOG_LEVELS.join(", "));
    }
    Ok(format!("{level},tower=warn,hyper=warn"))
}
