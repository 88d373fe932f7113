use std::path::Path;

use super::{base_metadata, ParsedDocument, Parser};
use crate::error::ParseError;
use crate::Result;

/// PDF text via `pdf-extract`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfParser;

impl Parser for PdfParser {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["pdf"]
    }

    fn supported_mimetypes(&self) -> &[&'static str] {
        &["application/pdf"]
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument> {
        // pdf-extract panics on some malformed files.
        let content = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
            .map_err(|_| ParseError::failed(path, "PDF extractor panicked"))?
            .map_err(|e| ParseError::failed(path, e.to_string()))?;

        let meta = base_metadata(path, bytes, &content);

        Ok(ParsedDocument {
            path: path.to_path_buf(),
            content,
            file_type: "pdf".to_string(),
            metadata: meta.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_parse_error() {
        let err = PdfParser
            .parse(Path::new("/d/broken.pdf"), b"definitely not a pdf")
            .unwrap_err();
        assert!(err.to_string().contains("broken.pdf"));
    }
}
