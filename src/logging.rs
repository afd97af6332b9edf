use std::env;

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, TernError};

/// Initializes the process-wide subscriber for the binaries.
///
/// `RUST_LOG` wins outright when set, so an operator can widen one
/// target (say, just the loader counters or the rpc layer) without
/// touching the command line. Otherwise the `--log-level` flag is
/// scoped to this crate and its binaries with a warn floor for
/// dependencies: a plain `debug` should not drown the output in
/// third-party spans.
pub fn init_logging(flag_level: &str) -> Result<()> {
    let directives = match env::var("RUST_LOG") {
        Ok(spec) if !spec.is_empty() => spec,
        _ => {
            if flag_level.contains(['=', ',']) {
                // The flag already spells out full directives.
                flag_level.to_string()
            } else {
                format!("warn,tern={flag_level},ternd={flag_level},tern_bulk={flag_level}")
            }
        }
    };
    let filter = EnvFilter::try_new(&directives).map_err(|e| {
        TernError::InvalidOp(format!("bad log filter {directives:?}: {e}"))
    })?;
    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|_| TernError::InvalidOp("logging already initialized".into()))
}
