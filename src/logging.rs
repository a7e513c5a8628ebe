use anyhow::anyhow;
use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt::MakeWriter};

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";
const CRATE_TARGET: &str = "wiretap";
/// Modules that emit one event per captured message.
const CAPTURE_TARGETS: [&str; 2] = ["wiretap::capture", "wiretap::recorder"];

/// Installs the process-wide subscriber writing to stderr.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let filter = resolve_filter(config, cli_level_override)?;
    tracing::subscriber::set_global_default(subscriber(
        resolve_log_format(config),
        filter,
        std::io::stderr,
    ))
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

fn subscriber<W>(
    format: LogFormat,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(writer);
    match format {
        LogFormat::Json => Box::new(builder.json().finish()),
        LogFormat::Pretty => Box::new(builder.pretty().finish()),
    }
}

/// `wiretap` logs at the resolved level. Dependencies (hyper, rustls) never log more
/// verbosely than `warn`, and `capture_level` overrides the per-message capture events.
fn resolve_filter(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<EnvFilter> {
    let level = resolve_log_level(config, cli_level_override)?;
    let mut directives = vec![
        level_name(level.min(LevelFilter::WARN)),
        format!("{CRATE_TARGET}={}", level_name(level)),
    ];
    let capture_level = config
        .logging
        .as_ref()
        .and_then(|logging| logging.capture_level.as_deref());
    if let Some(raw_level) = capture_level {
        let capture_level = level_name(parse_level(raw_level)?);
        directives.extend(
            CAPTURE_TARGETS
                .iter()
                .map(|target| format!("{target}={capture_level}")),
        );
    }

    let directives = directives.join(",");
    EnvFilter::try_new(&directives).map_err(|err| anyhow!("build log filter `{directives}`: {err}"))
}

fn level_name(level: LevelFilter) -> String {
    level.to_string().to_ascii_lowercase()
}

fn resolve_log_level(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = cli_level_override
        .or_else(|| {
            config
                .logging
                .as_ref()
                .and_then(|logging| logging.level.as_deref())
        })
        .unwrap_or(DEFAULT_LOG_LEVEL);
    parse_level(raw_level)
}

fn parse_level(raw_level: &str) -> anyhow::Result<LevelFilter> {
    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}
