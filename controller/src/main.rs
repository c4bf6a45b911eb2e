mod api;
mod cloud;
mod host;
mod reconciler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
