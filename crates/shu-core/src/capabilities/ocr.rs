// Text extraction from bytes, mode-selected via host context

use std::sync::Arc;

use crate::error::Result;
use crate::traits::TextExtractor;

pub struct OcrCapability {
    extractor: Arc<dyn TextExtractor>,
    mode: Option<String>,
}

impl OcrCapability {
    pub fn new(extractor: Arc<dyn TextExtractor>, mode: Option<String>) -> Self {
        Self { extractor, mode }
    }

    pub async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<String> {
        self.extractor
            .extract_text(bytes, mime_type, self.mode.as_deref())
            .await
    }

    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }
}
