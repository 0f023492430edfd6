//! Built-in operations: `ocr`, `segment`, `extract_articles`
//!
//! Each operation reads its input path from the task params and delegates the
//! real work to a collaborator trait. The collaborators are the seam to the
//! image-processing code, which lives outside this crate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use eyre::eyre;
use queuestore::Task;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::handler::OperationHandler;

/// Text recognition on a scanned image
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, subject_id: &str, image_path: &Path, language: Option<&str>) -> eyre::Result<String>;
}

/// Splits a page image into layout regions
#[async_trait]
pub trait PageSegmenter: Send + Sync {
    async fn segment(&self, subject_id: &str, page_path: &Path) -> eyre::Result<Vec<Segment>>;
}

/// Pulls individual articles out of a segmented page
#[async_trait]
pub trait ArticleExtractor: Send + Sync {
    async fn extract(&self, subject_id: &str, page_path: &Path) -> eyre::Result<Vec<Article>>;
}

/// One layout region of a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Region kind (headline, column, image, advert...)
    pub kind: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One extracted article
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
}

/// Resolve a required path parameter, trying each key in order
fn path_param(task: &Task, keys: &[&str]) -> eyre::Result<PathBuf> {
    keys.iter()
        .find_map(|key| task.param_str(key))
        .map(PathBuf::from)
        .ok_or_else(|| {
            eyre!(
                "Task {} ({}) is missing required parameter '{}'",
                task.id,
                task.operation,
                keys.first().copied().unwrap_or_default()
            )
        })
}

/// `ocr`: params `image_path` (required), `language` (optional)
pub struct OcrOperation {
    engine: Arc<dyn OcrEngine>,
}

impl OcrOperation {
    pub const NAME: &'static str = "ocr";

    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl OperationHandler for OcrOperation {
    async fn execute(&self, task: &Task) -> eyre::Result<Value> {
        let image_path = path_param(task, &["image_path"])?;
        debug!(task_id = %task.id, ?image_path, "OcrOperation::execute: called");
        let text = self
            .engine
            .recognize(&task.subject_id, &image_path, task.param_str("language"))
            .await?;
        Ok(json!({
            "subject_id": task.subject_id,
            "image_path": image_path,
            "chars": text.chars().count(),
            "text": text,
        }))
    }
}

/// `segment`: params `page_path` (or `image_path`)
pub struct SegmentOperation {
    segmenter: Arc<dyn PageSegmenter>,
}

impl SegmentOperation {
    pub const NAME: &'static str = "segment";

    pub fn new(segmenter: Arc<dyn PageSegmenter>) -> Self {
        Self { segmenter }
    }
}

#[async_trait]
impl OperationHandler for SegmentOperation {
    async fn execute(&self, task: &Task) -> eyre::Result<Value> {
        let page_path = path_param(task, &["page_path", "image_path"])?;
        debug!(task_id = %task.id, ?page_path, "SegmentOperation::execute: called");
        let segments = self.segmenter.segment(&task.subject_id, &page_path).await?;
        Ok(json!({
            "subject_id": task.subject_id,
            "count": segments.len(),
            "segments": segments,
        }))
    }
}

/// `extract_articles`: params `page_path` (or `image_path`)
pub struct ExtractArticlesOperation {
    extractor: Arc<dyn ArticleExtractor>,
}

impl ExtractArticlesOperation {
    pub const NAME: &'static str = "extract_articles";

    pub fn new(extractor: Arc<dyn ArticleExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl OperationHandler for ExtractArticlesOperation {
    async fn execute(&self, task: &Task) -> eyre::Result<Value> {
        let page_path = path_param(task, &["page_path", "image_path"])?;
        debug!(task_id = %task.id, ?page_path, "ExtractArticlesOperation::execute: called");
        let articles = self.extractor.extract(&task.subject_id, &page_path).await?;
        Ok(json!({
            "subject_id": task.subject_id,
            "count": articles.len(),
            "articles": articles,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::OperationDispatcher;
    use queuestore::Params;

    struct FakeOcr;

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn recognize(&self, subject_id: &str, _image: &Path, language: Option<&str>) -> eyre::Result<String> {
            Ok(format!("{} [{}]", subject_id, language.unwrap_or("eng")))
        }
    }

    struct FakeSegmenter;

    #[async_trait]
    impl PageSegmenter for FakeSegmenter {
        async fn segment(&self, _subject_id: &str, _page: &Path) -> eyre::Result<Vec<Segment>> {
            Ok(vec![Segment {
                kind: "column".to_string(),
                x: 0,
                y: 0,
                width: 100,
                height: 800,
            }])
        }
    }

    struct BrokenExtractor;

    #[async_trait]
    impl ArticleExtractor for BrokenExtractor {
        async fn extract(&self, _subject_id: &str, _page: &Path) -> eyre::Result<Vec<Article>> {
            Err(eyre!("layout model not loaded"))
        }
    }

    fn dispatcher() -> OperationDispatcher {
        OperationDispatcher::with_builtins(Arc::new(FakeOcr), Arc::new(FakeSegmenter), Arc::new(BrokenExtractor))
    }

    fn task_with(operation: &str, key: &str, value: &str) -> Task {
        let mut params = Params::new();
        params.insert(key.to_string(), Value::from(value));
        Task::new("page-7", operation).with_params(params)
    }

    #[test]
    fn test_builtins_registered() {
        assert_eq!(dispatcher().operations(), vec!["extract_articles", "ocr", "segment"]);
    }

    #[tokio::test]
    async fn test_ocr_reads_image_path() {
        let result = dispatcher()
            .execute(&task_with("ocr", "image_path", "/scans/7.png"))
            .await
            .unwrap();
        assert_eq!(result["text"], "page-7 [eng]");
        assert_eq!(result["chars"], 12);
    }

    #[tokio::test]
    async fn test_ocr_missing_param_is_error() {
        let err = dispatcher().execute(&Task::new("page-7", "ocr")).await.unwrap_err();
        assert!(err.to_string().contains("image_path"));
    }

    #[tokio::test]
    async fn test_segment_accepts_image_path_fallback() {
        let result = dispatcher()
            .execute(&task_with("segment", "image_path", "/scans/7.png"))
            .await
            .unwrap();
        assert_eq!(result["count"], 1);
        assert_eq!(result["segments"][0]["kind"], "column");
    }

    #[tokio::test]
    async fn test_extractor_error_propagates() {
        let err = dispatcher()
            .execute(&task_with("extract_articles", "page_path", "/scans/7.png"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "layout model not loaded");
    }
}
