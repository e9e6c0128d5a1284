use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    brapi_mcp::main_entry().await
}
