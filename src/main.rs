#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = scanbridge::run().await {
        eprintln!("scanbridge fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
