#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gaitlink::run().await
}
