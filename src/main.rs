#[tokio::main]
async fn main() {
    if let Err(err) = ems_gateway::mcp::server::run_stdio().await {
        eprintln!("fatal: {}", err.message);
        std::process::exit(1);
    }
}
