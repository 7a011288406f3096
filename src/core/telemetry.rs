use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::Settings;

fn default_directives(level: &str) -> String {
    format!("{level},sqlx=warn,tower_http=info,hyper=warn")
}

pub(crate) fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let telemetry = settings.telemetry();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&telemetry.log_level)));

    let builder = fmt().with_env_filter(filter).with_target(false);
    let installed = if telemetry.json {
        builder.json().with_current_span(true).flatten_event(true).try_init()
    } else {
        builder.compact().try_init()
    };
    installed.map_err(|err| anyhow::anyhow!(err.to_string()))?;

    tracing::debug!(
        environment = settings.runtime().environment.as_str(),
        json = telemetry.json,
        "Tracing initialized"
    );
    Ok(())
}
