#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine; the CLI reads VAULTKEEPER_ADDR and VAULTKEEPER_TOKEN from it when present
    let _ = dotenvy::dotenv();
    vaultkeeper::cli::run_cli().await
}
