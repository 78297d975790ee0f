#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dosewatch_lib::run().await
}
