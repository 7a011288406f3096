#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = exam_orchestrator::run().await {
        eprintln!("exam-orchestrator fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
