use anyhow::Result;

use shelf_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("shelf-daemon")?;
    shelf_daemon::server::run().await
}
