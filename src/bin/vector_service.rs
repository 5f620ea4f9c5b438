use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use stylesearch::embedder::clip::ClipEndpoint;
use stylesearch::service::vector::{router, VectorState};
use stylesearch::service::{bind_addr, serve};
use tokio::runtime::Builder;

#[derive(Parser, Debug)]
#[command(
    name = "stylesearch-vector",
    about = "HTTP service turning query text into CLIP embeddings"
)]
struct VectorCli {
    /// Interface to bind
    #[arg(long, env = "APP_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, env = "APP_PORT_VECTOR", default_value_t = 8001)]
    port: u16,

    /// CLIP inference endpoint
    #[arg(long, env = "CLIP_ENDPOINT")]
    clip_endpoint: String,

    /// Bearer token for the CLIP endpoint
    #[arg(long, env = "HF_TOKEN")]
    hf_token: Option<String>,

    /// Model name forwarded to the CLIP endpoint
    #[arg(long, env = "MODEL_NAME")]
    model_name: Option<String>,

    /// Expected embedding width; responses of another width are rejected
    #[arg(long, env = "VECTOR_DIM_MODEL")]
    dimension: Option<usize>,

    /// Max seconds to wait for each embedding request
    #[arg(long, env = "CLIP_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    stylesearch::logging::init();
    let cli = VectorCli::parse();
    let addr = bind_addr(&cli.host, cli.port)?;

    // The blocking HTTP client must be built outside the async runtime.
    let encoder = ClipEndpoint::new(
        &cli.clip_endpoint,
        cli.hf_token.as_deref(),
        cli.model_name,
        cli.dimension,
        Duration::from_secs(cli.timeout_secs.max(1)),
    )?;
    let app = router(VectorState::new(Arc::new(encoder)));

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(serve(app, addr, "vector"))
}
