use anyhow::Result;

use sblite_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;
    sblite_daemon::server::run().await
}
