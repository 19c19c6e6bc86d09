use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    backline_engine::run_http_server(None, None).await
}
