//! Joins captions with scraped metadata, embeds the images and hands vector
//! records to an upsert sink in batches.
//!
//! Data root layout, per `(topic, data name)` job:
//!
//! ```text
//! <root>/captioned_data/<topic>/<data name>*.json   caption entries
//! <root>/metadata/<topic>/<data name>*.csv          actor metadata
//! <root>/scrapped_data/<topic>/<data name><image>   image files
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::bounded;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::embeddings::ImageEncoder;
use crate::records::{CaptionEntry, ItemMetadata, VectorRecord};
use crate::table::MetadataTable;

/// Worker threads embedding images.
pub const DEFAULT_WORKERS: usize = 10;

const CAPTIONS_DIR: &str = "captioned_data";
const METADATA_DIR: &str = "metadata";
const IMAGES_DIR: &str = "scrapped_data";
const ID_COLUMN: &str = "source/id";

static FIRST_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

/// One `(topic, data name)` row of the buckets file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexJob {
    /// Topic, used as the vector id prefix.
    pub topic: String,
    /// File-name prefix shared by the topic's captions, metadata and images.
    pub data_name: String,
}

/// Reads the `bucket,name` CSV listing index jobs.
pub fn read_jobs(path: &Path) -> Result<Vec<IndexJob>> {
    let table = MetadataTable::from_path(path)?;
    anyhow::ensure!(
        table.column("bucket").is_some() && table.column("name").is_some(),
        "{} must have 'bucket' and 'name' columns",
        path.display()
    );
    Ok((0..table.len())
        .filter_map(|row| {
            Some(IndexJob {
                topic: table.get(row, "bucket")?.to_string(),
                data_name: table.get_or_empty(row, "name"),
            })
        })
        .collect())
}

/// Numeric product id embedded in an image name: its first digit run.
pub fn image_id(image_name: &str) -> Option<u64> {
    FIRST_DIGITS.find(image_name)?.as_str().parse().ok()
}

/// First file under `dir` (recursively, sorted) whose path starts with
/// `prefix` and has extension `ext`.
pub fn find_prefixed(dir: &Path, prefix: &Path, ext: &str) -> Result<PathBuf> {
    let prefix = prefix.to_string_lossy().into_owned();
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if current == dir => {
                return Err(err).with_context(|| format!("failed to list {}", dir.display()))
            }
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
        .into_iter()
        .find(|path| {
            path.to_string_lossy().starts_with(&prefix)
                && path
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case(ext))
        })
        .ok_or_else(|| anyhow!("No {ext} file found under prefix: {prefix}"))
}

/// Captions, metadata and image location for one job.
#[derive(Debug, Clone)]
pub struct TopicData {
    /// Caption entries.
    pub captions: Vec<CaptionEntry>,
    /// Actor metadata.
    pub metadata: MetadataTable,
    image_prefix: String,
}

impl TopicData {
    /// Loads a job's files from `root`.
    pub fn load(root: &Path, job: &IndexJob) -> Result<Self> {
        let captions_dir = root.join(CAPTIONS_DIR).join(&job.topic);
        let caption_path =
            find_prefixed(&captions_dir, &captions_dir.join(&job.data_name), "json")?;
        info!(path = %caption_path.display(), "reading captions");
        let text = std::fs::read_to_string(&caption_path)
            .with_context(|| format!("failed to read {}", caption_path.display()))?;
        let captions: Vec<CaptionEntry> = serde_json::from_str(&text)
            .with_context(|| format!("invalid caption JSON in {}", caption_path.display()))?;

        let metadata_dir = root.join(METADATA_DIR).join(&job.topic);
        let metadata_path =
            find_prefixed(&metadata_dir, &metadata_dir.join(&job.data_name), "csv")?;
        info!(path = %metadata_path.display(), "reading metadata");
        let metadata = MetadataTable::from_path(&metadata_path)?;

        let image_prefix = root
            .join(IMAGES_DIR)
            .join(&job.topic)
            .join(&job.data_name)
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            captions,
            metadata,
            image_prefix,
        })
    }

    /// Image file for a caption entry.
    pub fn image_path(&self, image_name: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.image_prefix, image_name))
    }

    /// Metadata row for a caption entry, joined on [`image_id`].
    pub fn item_metadata(&self, entry: &CaptionEntry) -> Option<ItemMetadata> {
        let id = image_id(&entry.image)?;
        let row = self.metadata.find_by_id(ID_COLUMN, id)?;
        let cell = |column: &str| self.metadata.get_or_empty(row, column);
        Some(ItemMetadata {
            image_name: cell("medias/0/alt"),
            brand: cell("brand"),
            gender: cell("categories/0"),
            item_type: cell("categories/1"),
            item_sub_type: cell("categories/2"),
            image_url: cell("medias/0/url"),
            caption: entry.caption.clone(),
            item_url: cell("source/crawlUrl"),
        })
    }
}

/// Counts for one indexed job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    /// Records acknowledged by the sink.
    pub upserted: usize,
    /// Entries without a metadata row.
    pub missing_metadata: usize,
    /// Entries whose image could not be read or embedded.
    pub failed_images: usize,
}

struct EmbedTask {
    id: String,
    path: PathBuf,
    metadata: ItemMetadata,
}

/// Embeds every caption entry of `data` on `workers` threads and passes
/// records to `sink` in batches of `batch_size`.
///
/// Entries without metadata or with unreadable images are skipped and
/// counted; a sink error aborts the job.
pub fn index_topic<E, F>(
    encoder: &E,
    job: &IndexJob,
    data: &TopicData,
    workers: usize,
    batch_size: usize,
    mut sink: F,
) -> Result<IndexSummary>
where
    E: ImageEncoder + ?Sized,
    F: FnMut(&[VectorRecord]) -> Result<usize>,
{
    let workers = workers.max(1);
    let batch_size = batch_size.max(1);
    let mut summary = IndexSummary::default();

    let mut tasks = Vec::with_capacity(data.captions.len());
    for entry in &data.captions {
        match data.item_metadata(entry) {
            Some(metadata) => tasks.push(EmbedTask {
                id: VectorRecord::index_id(&job.topic, &entry.image),
                path: data.image_path(&entry.image),
                metadata,
            }),
            None => {
                warn!(image = %entry.image, "No metadata found for image");
                summary.missing_metadata += 1;
            }
        }
    }

    let (task_tx, task_rx) = bounded::<EmbedTask>(workers * 2);
    let (result_tx, result_rx) = bounded::<Result<VectorRecord, (String, String)>>(workers * 2);

    thread::scope(|scope| -> Result<()> {
        scope.spawn(move || {
            for task in tasks {
                if task_tx.send(task).is_err() {
                    break;
                }
            }
        });
        for worker_id in 0..workers {
            let rx = task_rx.clone();
            let tx = result_tx.clone();
            scope.spawn(move || {
                for task in rx.iter() {
                    let result = encoder
                        .encode_image_file(&task.path)
                        .map(|values| VectorRecord {
                            id: task.id.clone(),
                            values,
                            metadata: task.metadata,
                        })
                        .map_err(|err| (task.id, format!("{err:#}")));
                    if tx.send(result).is_err() {
                        break;
                    }
                }
                debug!(worker_id, "embedding worker finished");
            });
        }
        drop(task_rx);
        drop(result_tx);
        // Dropped on early return so blocked workers can exit before the join.
        let result_rx = result_rx;

        let mut pending = Vec::with_capacity(batch_size);
        for result in result_rx.iter() {
            match result {
                Ok(record) => {
                    pending.push(record);
                    if pending.len() >= batch_size {
                        summary.upserted += sink(&pending)?;
                        pending.clear();
                    }
                }
                Err((id, reason)) => {
                    warn!(%id, %reason, "image skipped");
                    summary.failed_images += 1;
                }
            }
        }
        if !pending.is_empty() {
            summary.upserted += sink(&pending)?;
        }
        Ok(())
    })?;

    info!(
        topic = %job.topic,
        upserted = summary.upserted,
        missing_metadata = summary.missing_metadata,
        failed_images = summary.failed_images,
        "topic indexed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct ByteEncoder;

    impl ImageEncoder for ByteEncoder {
        fn encode_image(&self, bytes: &[u8]) -> Result<Vec<f32>> {
            anyhow::ensure!(bytes != b"corrupt", "cannot decode image");
            Ok(vec![bytes.len() as f32])
        }
    }

    fn write(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn fixture(root: &Path) -> IndexJob {
        let job = IndexJob {
            topic: "men_shirts".into(),
            data_name: "batch_a/".into(),
        };
        write(
            &root.join("captioned_data/men_shirts/batch_a/final_output.json"),
            br#"[{"image": "image_101.jpg", "caption": "Linen. Summer."},
                 {"image": "image_102.jpg", "caption": "Wool. Winter."},
                 {"image": "image_103.jpg", "caption": "Silk. Evening."},
                 {"image": "image_999.jpg", "caption": "Unknown."}]"#,
        );
        write(
            &root.join("metadata/men_shirts/batch_a/men.csv"),
            b"source/id,brand,medias/0/url,medias/0/alt,categories/0,categories/1,categories/2,source/crawlUrl\n\
              101,Acme,https://cdn.test/101.jpg,Linen shirt,Men,Shirts,Casual,https://shop.test/101\n\
              102,Acme,https://cdn.test/102.jpg,Wool shirt,Men,Shirts,Formal,https://shop.test/102\n\
              103,Acme,https://cdn.test/103.jpg,Silk shirt,Men,Shirts,Evening,https://shop.test/103\n",
        );
        write(&root.join("scrapped_data/men_shirts/batch_a/image_101.jpg"), b"jpeg");
        write(&root.join("scrapped_data/men_shirts/batch_a/image_102.jpg"), b"corrupt");
        job
    }

    #[test]
    fn image_id_is_first_digit_run() {
        assert_eq!(image_id("image_1042.jpg"), Some(1042));
        assert_eq!(image_id("v2_image_7.jpg"), Some(2));
        assert_eq!(image_id("image.jpg"), None);
    }

    #[test]
    fn metadata_is_joined_on_source_id() {
        let dir = tempfile::tempdir().unwrap();
        let job = fixture(dir.path());
        let data = TopicData::load(dir.path(), &job).unwrap();
        let entry = &data.captions[0];
        let metadata = data.item_metadata(entry).unwrap();
        assert_eq!(
            metadata,
            ItemMetadata {
                image_name: "Linen shirt".into(),
                brand: "Acme".into(),
                gender: "Men".into(),
                item_type: "Shirts".into(),
                item_sub_type: "Casual".into(),
                image_url: "https://cdn.test/101.jpg".into(),
                caption: "Linen. Summer.".into(),
                item_url: "https://shop.test/101".into(),
            }
        );
        assert!(data.item_metadata(&data.captions[3]).is_none());
    }

    #[test]
    fn index_topic_skips_and_batches() {
        let dir = tempfile::tempdir().unwrap();
        let job = fixture(dir.path());
        let data = TopicData::load(dir.path(), &job).unwrap();
        let mut batches: Vec<Vec<String>> = Vec::new();
        let summary = index_topic(&ByteEncoder, &job, &data, 3, 1, |records| {
            batches.push(records.iter().map(|r| r.id.clone()).collect());
            Ok(records.len())
        })
        .unwrap();
        assert_eq!(
            summary,
            IndexSummary {
                upserted: 1,
                missing_metadata: 1,
                failed_images: 2,
            }
        );
        assert_eq!(batches, vec![vec!["men_shirts image_101.jpg".to_string()]]);
    }

    #[test]
    fn sink_errors_abort_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let job = fixture(dir.path());
        let data = TopicData::load(dir.path(), &job).unwrap();
        let result = index_topic(&ByteEncoder, &job, &data, 2, 10, |_| {
            Err(anyhow!("index unavailable"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn missing_caption_file_names_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("captioned_data/women")).unwrap();
        let job = IndexJob {
            topic: "women".into(),
            data_name: "dresses".into(),
        };
        let err = TopicData::load(dir.path(), &job).unwrap_err();
        assert!(err.to_string().starts_with("No json file found under prefix"));
    }

    #[test]
    fn jobs_come_from_bucket_and_name_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_buckets.csv");
        write(&path, b"bucket,name\nmen_shirts,batch_a/\nwomen_dresses,\n");
        assert_eq!(
            read_jobs(&path).unwrap(),
            vec![
                IndexJob {
                    topic: "men_shirts".into(),
                    data_name: "batch_a/".into()
                },
                IndexJob {
                    topic: "women_dresses".into(),
                    data_name: String::new()
                },
            ]
        );
    }
}
