#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = grading_dispatch::run().await {
        eprintln!("grading-dispatch fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
