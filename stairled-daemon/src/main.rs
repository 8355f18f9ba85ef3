use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stairled_daemon::run;
use stairled_daemon::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Arc::new(Settings::new()?);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = settings.logger.level.as_str();

            format!("stairled={level},stairled_daemon={level},stairled_engine={level},stairled_driver={level}").into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    run(&settings).await
}
