use color_eyre::eyre::Result;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Installs the global subscriber. Defaults to `INFO`, `RUST_LOG` overrides.
///
/// With `quiet_stdout` the log goes to stderr, so that stdout only carries
/// machine-readable output.
pub fn init(quiet_stdout: bool) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let log = tracing_subscriber::fmt::layer().compact();
    let log = if quiet_stdout {
        log.with_writer(std::io::stderr).with_filter(filter).boxed()
    } else {
        log.with_writer(std::io::stdout).with_filter(filter).boxed()
    };
    tracing_subscriber::registry().with(log).try_init()?;

    Ok(())
}
