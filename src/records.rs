//! Records exchanged between pipeline stages and persisted to disk.

use serde::{Deserialize, Serialize};

/// Header written for bad-URL files, even when no failures occurred.
pub const BAD_URL_HEADERS: &[&str] = &["url", "id", "error"];
/// Header written for caption token-count files.
pub const CAPTION_TOKEN_HEADERS: &[&str] = &[
    "image_name",
    "prompt_token_count",
    "candidates_token_count",
    "total_token_count",
];
/// Header written for caption failure files.
pub const FAILED_CAPTION_HEADERS: &[&str] = &["image_name", "error"];

/// One image that could not be downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadUrlRecord {
    /// Source URL, or `Missing` when the row had none.
    pub url: String,
    /// Row identifier from the metadata table.
    pub id: String,
    /// Human-readable failure reason.
    pub error: String,
}

/// Caption plus token accounting for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionRecord {
    /// Image file name (no directory).
    pub image_name: String,
    /// Cleaned caption text.
    pub caption: String,
    /// Tokens billed for the prompt.
    pub prompt_tokens: u32,
    /// Tokens billed for the generated caption.
    pub candidate_tokens: u32,
    /// Total tokens billed.
    pub total_tokens: u32,
}

impl CaptionRecord {
    /// Row written to the token-count CSV.
    pub fn token_row(&self) -> CaptionTokenRow {
        CaptionTokenRow {
            image_name: self.image_name.clone(),
            prompt_token_count: self.prompt_tokens,
            candidates_token_count: self.candidate_tokens,
            total_token_count: self.total_tokens,
        }
    }

    /// Entry written to the caption JSON.
    pub fn entry(&self) -> CaptionEntry {
        CaptionEntry {
            image: self.image_name.clone(),
            caption: self.caption.clone(),
        }
    }
}

/// Token-count CSV row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionTokenRow {
    /// Image file name.
    pub image_name: String,
    /// Prompt tokens.
    pub prompt_token_count: u32,
    /// Generated tokens.
    pub candidates_token_count: u32,
    /// Total tokens.
    pub total_token_count: u32,
}

/// `{image, caption}` pair; the unit of the caption JSON consumed by the indexer
/// and the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionEntry {
    /// Image file name.
    pub image: String,
    /// Caption text.
    pub caption: String,
}

/// Image that failed to caption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCaption {
    /// Image file name.
    pub image_name: String,
    /// Failure reason.
    pub error: String,
}

/// Product metadata stored next to each vector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Product display name (image alt text on the source site).
    pub image_name: String,
    /// Brand.
    pub brand: String,
    /// Gender category.
    pub gender: String,
    /// Top-level product type.
    pub item_type: String,
    /// Product sub type.
    pub item_sub_type: String,
    /// Product image URL.
    pub image_url: String,
    /// Generated caption.
    pub caption: String,
    /// Product page URL.
    pub item_url: String,
}

/// Vector plus metadata upserted into the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// `"{topic} {image file name}"`.
    pub id: String,
    /// Image embedding.
    pub values: Vec<f32>,
    /// Product metadata.
    pub metadata: ItemMetadata,
}

impl VectorRecord {
    /// Builds the index id for an image within a topic.
    pub fn index_id(topic: &str, image_name: &str) -> String {
        format!("{topic} {image_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_record_splits_into_outputs() {
        let record = CaptionRecord {
            image_name: "image_7.jpg".into(),
            caption: "Linen shirt".into(),
            prompt_tokens: 270,
            candidate_tokens: 30,
            total_tokens: 300,
        };
        assert_eq!(record.token_row().total_token_count, 300);
        assert_eq!(
            serde_json::to_value(record.entry()).unwrap(),
            serde_json::json!({"image": "image_7.jpg", "caption": "Linen shirt"})
        );
    }

    #[test]
    fn index_id_joins_topic_and_name() {
        assert_eq!(
            VectorRecord::index_id("men_shoes", "image_12.jpg"),
            "men_shoes image_12.jpg"
        );
    }
}
