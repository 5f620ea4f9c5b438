use anyhow::Result;
use clap::Parser;
use stylesearch::service::backend::{router, BackendState, DOWNSTREAM_TIMEOUT};
use stylesearch::service::{bind_addr, serve};

#[derive(Parser, Debug)]
#[command(
    name = "stylesearch-backend",
    about = "Public search API chaining the vector and search services"
)]
struct BackendCli {
    /// Interface to bind
    #[arg(long, env = "APP_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, env = "APP_PORT_BACKEND", default_value_t = 8000)]
    port: u16,

    /// Vector service host
    #[arg(long, env = "VECTOR_SERVICE_HOST", default_value = "localhost")]
    vector_host: String,

    /// Vector service port
    #[arg(long, env = "VECTOR_SERVICE_PORT", default_value_t = 8001)]
    vector_port: u16,

    /// Search service host
    #[arg(long, env = "PINECONE_SERVICE_HOST", default_value = "localhost")]
    search_host: String,

    /// Search service port
    #[arg(long, env = "PINECONE_SERVICE_PORT", default_value_t = 8002)]
    search_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    stylesearch::logging::init();
    let cli = BackendCli::parse();
    let addr = bind_addr(&cli.host, cli.port)?;
    let state = BackendState::new(
        &format!("http://{}:{}", cli.vector_host, cli.vector_port),
        &format!("http://{}:{}", cli.search_host, cli.search_port),
        DOWNSTREAM_TIMEOUT,
    )?;
    serve(router(state), addr, "backend").await
}
