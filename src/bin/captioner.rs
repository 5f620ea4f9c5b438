use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use stylesearch::captioner::{
    caption_images, collect_images, write_outputs, Checkpoints, GeminiCaptioner,
    CAPTION_PROMPT, DEFAULT_GEMINI_BASE, DEFAULT_GEMINI_MODEL,
};
use stylesearch::SecretSource;
use tokio::runtime::Builder;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "stylesearch-captioner",
    about = "Caption product images with Gemini and write caption tables"
)]
struct CaptionCli {
    /// Directory searched recursively for .jpg/.jpeg/.png files
    #[arg(long, env = "SCRAPED_RAW_IMAGES", default_value = "data/images")]
    images_dir: PathBuf,

    /// Directory receiving final_output.{csv,json} and failed_images.csv
    #[arg(long, env = "CAPTION_OUTPUT_DIR", default_value = "data/captioned_data")]
    output_dir: PathBuf,

    /// Secret reference for the Gemini API key
    #[arg(long, env = "GEMINI_GCP_SECRET_ACCESS")]
    gemini_key: SecretSource,

    /// Gemini model name
    #[arg(long, env = "GEMINI_MODEL", default_value = DEFAULT_GEMINI_MODEL)]
    model: String,

    /// Gemini API base URL
    #[arg(long, env = "GEMINI_API_BASE", default_value = DEFAULT_GEMINI_BASE)]
    base_url: String,

    /// Instruction sent with every image
    #[arg(long, env = "CAPTION_PROMPT", default_value = CAPTION_PROMPT)]
    prompt: String,

    /// Max seconds to wait for one caption
    #[arg(long, env = "GEMINI_TIMEOUT_SECS", default_value_t = 60)]
    timeout_secs: u64,

    /// Write a checkpoint every N images (0 disables checkpoints)
    #[arg(long, env = "CAPTION_CHECKPOINT_EVERY", default_value_t = 0)]
    checkpoint_every: usize,

    /// Directory for checkpoints; defaults to <output-dir>/checkpoints
    #[arg(long, env = "CAPTION_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    stylesearch::logging::init();
    let cli = CaptionCli::parse();

    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let api_key = runtime
        .block_on(cli.gemini_key.resolve())
        .context("failed to read Gemini API key")?;
    drop(runtime);

    let model = GeminiCaptioner::new(
        api_key,
        &cli.base_url,
        &cli.model,
        Duration::from_secs(cli.timeout_secs.max(1)),
    )?
    .with_prompt(cli.prompt.clone());
    let images = collect_images(&cli.images_dir)?;
    info!(images = images.len(), dir = %cli.images_dir.display(), "captioning");

    let checkpoints = (cli.checkpoint_every > 0).then(|| Checkpoints {
        dir: cli
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| cli.output_dir.join("checkpoints")),
        every: cli.checkpoint_every,
    });
    let run = caption_images(&model, &images, checkpoints.as_ref())?;
    let paths = write_outputs(&run, &cli.output_dir)?;
    info!(
        total = run.total,
        succeeded = run.records.len(),
        failed = run.failures.len(),
        csv = %paths.csv.display(),
        json = %paths.json.display(),
        "caption files written"
    );
    Ok(())
}
