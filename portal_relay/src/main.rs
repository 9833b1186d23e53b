use portal_relay::Relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:3000".to_string());
    let relay = Relay::bind(&addr).await?;
    tracing::info!(addr = %relay.local_addr()?, "relay listening");
    relay.run().await
}
