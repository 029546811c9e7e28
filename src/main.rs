use telemetry_channel::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::main().await
}
