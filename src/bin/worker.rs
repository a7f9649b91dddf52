#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = scanbridge::run_worker().await {
        eprintln!("scanbridge-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
