#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = grading_dispatch::run_drain().await {
        eprintln!("grading-drain fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
