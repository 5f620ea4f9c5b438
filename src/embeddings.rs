//! Shared embedding interfaces used by the indexer, the matcher and the
//! vector service.

use std::path::Path;

use anyhow::Result;

/// Encodes free text into the shared image/text embedding space.
pub trait TextEncoder: Send + Sync {
    /// Embeds one string.
    fn encode_text(&self, text: &str) -> Result<Vec<f32>>;
}

/// Encodes images into the shared image/text embedding space.
pub trait ImageEncoder: Send + Sync {
    /// Embeds raw image bytes.
    fn encode_image(&self, bytes: &[u8]) -> Result<Vec<f32>>;

    /// Reads and embeds an image file.
    fn encode_image_file(&self, path: &Path) -> Result<Vec<f32>> {
        use anyhow::Context;
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        self.encode_image(&bytes)
    }
}

/// Cosine similarity over the common prefix of `a` and `b`; zero when either
/// vector has zero norm. Callers check that the dimensions match.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..len {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Scales `vector` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
