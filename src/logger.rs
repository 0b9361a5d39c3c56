//! Logging initialisation via tracing-subscriber.
//!
//! `RUST_LOG` wins over `app.log_level` when it parses. The HTTP and storage
//! stacks under the agent are held at `warn` unless the filter names them.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

use crate::error::AppError;

/// Dependencies that log every connection or statement at `debug`.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "h2", "reqwest", "rustls", "rusqlite"];

/// Install the global subscriber, writing to stderr.
pub fn init(level: &str) -> Result<(), AppError> {
    let env = std::env::var("RUST_LOG").ok();
    let filter = build_filter(env.as_deref(), level)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))
}

/// Filter from `env` (falling back to `level` when unset or invalid) plus a
/// `warn` ceiling for every quiet target the chosen directives leave out.
pub fn build_filter(env: Option<&str>, level: &str) -> Result<EnvFilter, AppError> {
    let (spec, mut filter) = match env.map(|e| (e, EnvFilter::try_new(e))) {
        Some((e, Ok(filter))) if !e.trim().is_empty() => (e, filter),
        _ => {
            let filter = EnvFilter::try_new(level.to_ascii_lowercase())
                .map_err(|e| AppError::Logger(format!("invalid log level '{level}': {e}")))?;
            (level, filter)
        }
    };
    if spec.trim().is_empty() {
        return Err(AppError::Logger("log level must not be empty".into()));
    }

    for target in QUIET_TARGETS.iter().filter(|t| !names_target(spec, t)) {
        let directive: Directive = format!("{target}=warn")
            .parse()
            .map_err(|e| AppError::Logger(format!("bad directive for {target}: {e}")))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

fn names_target(spec: &str, target: &str) -> bool {
    spec.split(',').map(str::trim).any(|directive| {
        let name = directive.split(['=', '[']).next().unwrap_or_default();
        name == target || name.starts_with(&format!("{target}::"))
    })
}
