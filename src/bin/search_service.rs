use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use stylesearch::service::search::{router, LazyPinecone};
use stylesearch::service::{bind_addr, serve};
use stylesearch::vector_store::DEFAULT_CONTROL_BASE;
use stylesearch::SecretSource;

#[derive(Parser, Debug)]
#[command(
    name = "stylesearch-search",
    about = "HTTP service answering nearest-neighbour queries from Pinecone"
)]
struct SearchCli {
    /// Interface to bind
    #[arg(long, env = "APP_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, env = "APP_PORT_PINECONE", default_value_t = 8002)]
    port: u16,

    /// Secret reference for the Pinecone API key, read on the first request
    #[arg(long, env = "PINECONE_SECRET_NAME")]
    pinecone_secret: SecretSource,

    /// Index to query
    #[arg(long, env = "PINECONE_INDEX_NAME", default_value = "stylesearch")]
    index_name: String,

    /// Data-plane host; looked up by index name when absent
    #[arg(long, env = "PINECONE_INDEX_HOST")]
    index_host: Option<String>,

    /// Pinecone control-plane base URL
    #[arg(long, env = "PINECONE_CONTROL_BASE", default_value = DEFAULT_CONTROL_BASE)]
    control_base: String,

    /// Max seconds to wait for each Pinecone call
    #[arg(long, env = "PINECONE_TIMEOUT_SECS", default_value_t = 10)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    stylesearch::logging::init();
    let cli = SearchCli::parse();
    let addr = bind_addr(&cli.host, cli.port)?;
    let index = LazyPinecone::new(
        cli.pinecone_secret,
        cli.index_name,
        cli.index_host,
        cli.control_base,
        Duration::from_secs(cli.timeout_secs.max(1)),
    );
    serve(router(Arc::new(index)), addr, "search").await
}
