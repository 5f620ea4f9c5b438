//! Image captioning with a hosted vision-language model.
//!
//! [`caption_images`] walks a list of image files, asks a [`CaptionModel`] for
//! a four-part product caption per image and collects successes and failures
//! separately; one bad image never stops the run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use caption_text::clean_caption;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::records::{
    CaptionEntry, CaptionRecord, FailedCaption, CAPTION_TOKEN_HEADERS, FAILED_CAPTION_HEADERS,
};
use crate::table::write_csv;

/// Default Gemini API base.
pub const DEFAULT_GEMINI_BASE: &str = "https://generativelanguage.googleapis.com";
/// Default Gemini model.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
/// Instruction sent with every image.
pub const CAPTION_PROMPT: &str = "For this image, come up with a caption that has 4 parts, and uses short phrases to answer each of the four categories below: - the style - the occasions that it’s worn in - material used - texture and patterns. You don't need to list the four categories.";

/// Accepted image extensions, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Stem of the token-count CSV and the caption JSON.
pub const OUTPUT_STEM: &str = "final_output";
/// Failure list stem.
pub const FAILED_OUTPUT: &str = "failed_images";

/// Raw model answer for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionOutput {
    /// Caption text as returned by the model.
    pub text: String,
    /// Prompt tokens billed.
    pub prompt_tokens: u32,
    /// Generated tokens billed.
    pub candidate_tokens: u32,
    /// Total tokens billed.
    pub total_tokens: u32,
}

/// Vision-language model that captions one image.
pub trait CaptionModel: Send + Sync {
    /// Captions `image` of the given MIME type.
    fn caption(&self, image: &[u8], mime_type: &str) -> Result<CaptionOutput>;
}

/// MIME type for a supported image file.
pub fn mime_type_for(path: &Path) -> Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => Ok("image/jpeg"),
        Some("png") => Ok("image/png"),
        _ => anyhow::bail!("Unsupported image format."),
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
}

/// Recursively lists supported images under `root`, sorted by path.
pub fn collect_images(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries =
            std::fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?;
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to list {}", dir.display()))?
                .path();
            if path.is_dir() {
                stack.push(path);
            } else if is_image(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Periodic snapshots written while a long run progresses.
#[derive(Debug, Clone)]
pub struct Checkpoints {
    /// Directory receiving `*_batch_<n>` files.
    pub dir: PathBuf,
    /// Images between snapshots.
    pub every: usize,
}

/// Result of a captioning run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptionRun {
    /// Images attempted.
    pub total: usize,
    /// Captioned images in processing order.
    pub records: Vec<CaptionRecord>,
    /// Images that failed.
    pub failures: Vec<FailedCaption>,
}

impl CaptionRun {
    fn entries(&self) -> Vec<CaptionEntry> {
        self.records.iter().map(CaptionRecord::entry).collect()
    }

    /// Writes `<stem>.csv`, `<stem>.json` and, when anything failed,
    /// `failed_images<suffix>.csv` into `dir`.
    fn write(&self, dir: &Path, suffix: &str) -> Result<OutputPaths> {
        let csv = dir.join(format!("{OUTPUT_STEM}{suffix}.csv"));
        let rows: Vec<_> = self.records.iter().map(CaptionRecord::token_row).collect();
        write_csv(&csv, CAPTION_TOKEN_HEADERS, &rows)?;

        let json = dir.join(format!("{OUTPUT_STEM}{suffix}.json"));
        let body = serde_json::to_string_pretty(&self.entries())?;
        std::fs::write(&json, body).with_context(|| format!("failed to write {}", json.display()))?;

        let failed = if self.failures.is_empty() {
            None
        } else {
            let path = dir.join(format!("{FAILED_OUTPUT}{suffix}.csv"));
            write_csv(&path, FAILED_CAPTION_HEADERS, &self.failures)?;
            Some(path)
        };
        Ok(OutputPaths { csv, json, failed })
    }
}

/// Files written by [`write_outputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    /// Token-count CSV.
    pub csv: PathBuf,
    /// Caption JSON.
    pub json: PathBuf,
    /// Failure CSV, present only when some image failed.
    pub failed: Option<PathBuf>,
}

/// Captions every image in `images`, isolating per-image failures.
pub fn caption_images<M: CaptionModel + ?Sized>(
    model: &M,
    images: &[PathBuf],
    checkpoints: Option<&Checkpoints>,
) -> Result<CaptionRun> {
    let mut run = CaptionRun::default();
    let mut batch = 0usize;
    for path in images {
        run.total += 1;
        let image_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        info!(n = run.total, image = %image_name, "captioning image");
        match caption_one(model, path) {
            Ok(output) => run.records.push(CaptionRecord {
                image_name,
                caption: clean_caption(&output.text),
                prompt_tokens: output.prompt_tokens,
                candidate_tokens: output.candidate_tokens,
                total_tokens: output.total_tokens,
            }),
            Err(err) => {
                warn!(image = %image_name, error = %format!("{err:#}"), "caption failed");
                run.failures.push(FailedCaption {
                    image_name,
                    error: format!("{err:#}"),
                });
            }
        }
        if let Some(cp) = checkpoints.filter(|cp| cp.every > 0) {
            if run.total % cp.every == 0 {
                batch += 1;
                std::fs::create_dir_all(&cp.dir)
                    .with_context(|| format!("failed to create {}", cp.dir.display()))?;
                run.write(&cp.dir, &format!("_batch_{batch}"))?;
                info!(batch, processed = run.total, "checkpoint written");
            }
        }
    }
    info!(
        total = run.total,
        succeeded = run.records.len(),
        failed = run.failures.len(),
        "captioning finished"
    );
    Ok(run)
}

fn caption_one<M: CaptionModel + ?Sized>(model: &M, path: &Path) -> Result<CaptionOutput> {
    let mime_type = mime_type_for(path)?;
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    model.caption(&bytes, mime_type)
}

/// Writes the final caption files into `output_dir`.
pub fn write_outputs(run: &CaptionRun, output_dir: &Path) -> Result<OutputPaths> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    run.write(output_dir, "")
}

/// Blocking Gemini `generateContent` client.
#[derive(Clone)]
pub struct GeminiCaptioner {
    client: Client,
    endpoint: String,
    api_key: String,
    prompt: String,
}

impl GeminiCaptioner {
    /// Builds a client for `model` at `base_url`.
    pub fn new(api_key: String, base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Gemini API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing Gemini model name");
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Gemini HTTP client")?;
        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            base_url.trim_end_matches('/'),
            model.trim()
        );
        Ok(Self {
            client,
            endpoint,
            api_key: api_key.trim().to_string(),
            prompt: CAPTION_PROMPT.to_string(),
        })
    }

    /// Replaces the caption instruction.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    fn request<'a>(&'a self, mime_type: &'a str, data: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::InlineData {
                        inline_data: InlineData { mime_type, data },
                    },
                    Part::Text { text: &self.prompt },
                ],
            }],
        }
    }
}

impl CaptionModel for GeminiCaptioner {
    fn caption(&self, image: &[u8], mime_type: &str) -> Result<CaptionOutput> {
        let encoded = BASE64.encode(image);
        let request = self.request(mime_type, &encoded);
        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .context("Gemini request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            anyhow::bail!("Gemini request failed ({}): {}", status, body);
        }
        let parsed: GenerateResponse = resp.json().context("failed to parse Gemini response")?;
        parsed.into_output()
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    InlineData { inline_data: InlineData<'a> },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: UsageMetadata,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<TextPart>,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl GenerateResponse {
    fn into_output(self) -> Result<CaptionOutput> {
        let text: String = self
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        anyhow::ensure!(!text.trim().is_empty(), "Gemini returned no caption text");
        Ok(CaptionOutput {
            text,
            prompt_tokens: self.usage_metadata.prompt_token_count,
            candidate_tokens: self.usage_metadata.candidates_token_count,
            total_tokens: self.usage_metadata.total_token_count,
        })
    }
}
