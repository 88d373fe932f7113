//! Content extraction.
//!
//! A [`Parser`] turns the raw bytes of one file type into text plus metadata.
//! The [`ParserRegistry`] dispatches by file extension, then by guessed MIME
//! type, then by asking each parser's [`Parser::can_parse`]. Supporting a new
//! format means registering another parser.

mod docx;
mod pdf;
mod text;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use docx::DocxParser;
pub use pdf::PdfParser;
pub use text::TextParser;

use crate::error::ParseError;
use crate::Result;

/// Text extracted from one file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    /// Source path.
    pub path: PathBuf,

    /// Extracted text.
    pub content: String,

    /// Lowercase extension without the dot.
    pub file_type: String,

    /// Parser-specific metadata (`file_name`, `title`, ...).
    pub metadata: serde_json::Value,
}

/// Lowercase extension of `path` without the dot.
#[must_use]
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

pub(crate) fn base_metadata(path: &Path, bytes: &[u8], content: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut meta = serde_json::Map::new();
    if let Some(name) = path.file_name() {
        meta.insert("file_name".into(), name.to_string_lossy().into_owned().into());
    }
    meta.insert("file_size".into(), bytes.len().into());
    meta.insert("char_count".into(), content.chars().count().into());
    meta
}

/// A format-specific text extractor.
pub trait Parser: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Lowercase extensions without the dot.
    fn supported_extensions(&self) -> &[&'static str];

    /// MIME types this parser understands.
    fn supported_mimetypes(&self) -> &[&'static str];

    /// Whether this parser handles `path`. Defaults to an extension match.
    fn can_parse(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.supported_extensions().contains(&ext.as_str()))
    }

    /// Extract text from the file's bytes.
    ///
    /// # Errors
    ///
    /// Returns `ParseError::Failed` carrying the path and cause.
    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument>;
}

/// Dispatches files to the registered parsers.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn Parser>>,
    by_extension: HashMap<String, usize>,
    by_mimetype: HashMap<String, usize>,
}

impl ParserRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the text, PDF and DOCX parsers.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TextParser));
        registry.register(Arc::new(PdfParser));
        registry.register(Arc::new(DocxParser));
        registry
    }

    /// Add a parser. Later registrations win for shared extensions.
    pub fn register(&mut self, parser: Arc<dyn Parser>) {
        let index = self.parsers.len();
        for ext in parser.supported_extensions() {
            self.by_extension.insert(ext.to_ascii_lowercase(), index);
        }
        for mime in parser.supported_mimetypes() {
            self.by_mimetype.insert((*mime).to_string(), index);
        }
        self.parsers.push(parser);
    }

    /// Parser for `path`, if any.
    #[must_use]
    pub fn get_parser(&self, path: &Path) -> Option<&Arc<dyn Parser>> {
        if let Some(&i) = extension_of(path).and_then(|ext| self.by_extension.get(&ext)) {
            return self.parsers.get(i);
        }
        let by_mime = mime_guess::from_path(path)
            .iter_raw()
            .find_map(|mime| self.by_mimetype.get(mime));
        if let Some(&i) = by_mime {
            return self.parsers.get(i);
        }
        self.parsers.iter().find(|p| p.can_parse(path))
    }

    /// Whether some parser handles `path`.
    #[must_use]
    pub fn can_parse(&self, path: &Path) -> bool {
        self.get_parser(path).is_some()
    }

    /// Parse already-read bytes.
    ///
    /// # Errors
    ///
    /// `ParseError::Unsupported` if no parser matches, otherwise the parser's error.
    pub fn parse_bytes(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument> {
        let parser = self.get_parser(path).ok_or_else(|| ParseError::Unsupported {
            path: path.display().to_string(),
        })?;
        tracing::debug!(path = %path.display(), parser = parser.name(), "Parsing");
        parser.parse(path, bytes)
    }

    /// Read and parse a file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or a parse error.
    pub fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let bytes = std::fs::read(path)?;
        self.parse_bytes(path, &bytes)
    }

    /// Every registered extension, sorted.
    #[must_use]
    pub fn supported_extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.by_extension.keys().cloned().collect();
        exts.sort();
        exts
    }

    /// Number of registered parsers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    /// Whether no parser is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserRegistry")
            .field("parsers", &self.parsers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CsvParser;

    impl Parser for CsvParser {
        fn name(&self) -> &'static str {
            "csv"
        }

        fn supported_extensions(&self) -> &[&'static str] {
            &["csv"]
        }

        fn supported_mimetypes(&self) -> &[&'static str] {
            &["text/csv"]
        }

        fn parse(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument> {
            Ok(ParsedDocument {
                path: path.to_path_buf(),
                content: String::from_utf8_lossy(bytes).replace(',', " "),
                file_type: "csv".to_string(),
                metadata: serde_json::json!({}),
            })
        }
    }

    #[test]
    fn test_dispatch_by_extension() {
        let registry = ParserRegistry::with_defaults();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get_parser(Path::new("/d/a.MD")).unwrap().name(), "text");
        assert_eq!(registry.get_parser(Path::new("/d/a.pdf")).unwrap().name(), "pdf");
        assert_eq!(registry.get_parser(Path::new("/d/a.docx")).unwrap().name(), "docx");
        assert!(!registry.can_parse(Path::new("/d/photo.jpg")));
        assert!(!registry.can_parse(Path::new("/d/noext")));
    }

    #[test]
    fn test_registering_new_format() {
        let mut registry = ParserRegistry::with_defaults();
        assert!(!registry.can_parse(Path::new("/d/table.csv")));
        registry.register(Arc::new(CsvParser));

        let doc = registry.parse_bytes(Path::new("/d/table.csv"), b"a,b").unwrap();
        assert_eq!(doc.content, "a b");
        assert!(registry.supported_extensions().contains(&"csv".to_string()));
    }

    struct MimeOnly;

    impl Parser for MimeOnly {
        fn name(&self) -> &'static str {
            "mime-only"
        }

        fn supported_extensions(&self) -> &[&'static str] {
            &[]
        }

        fn supported_mimetypes(&self) -> &[&'static str] {
            &["text/csv"]
        }

        fn parse(&self, _path: &Path, _bytes: &[u8]) -> Result<ParsedDocument> {
            unreachable!()
        }
    }

    #[test]
    fn test_mime_fallback() {
        let mut registry = ParserRegistry::new();
        registry.register(Arc::new(MimeOnly));
        assert_eq!(registry.get_parser(Path::new("/d/a.csv")).unwrap().name(), "mime-only");
        assert!(!registry.can_parse(Path::new("/d/a.txt")));
    }

    #[test]
    fn test_unsupported_error() {
        let registry = ParserRegistry::with_defaults();
        let err = registry.parse_bytes(Path::new("/d/a.bin"), b"\0").unwrap_err();
        assert!(matches!(err, crate::Error::Parse(ParseError::Unsupported { .. })));
    }
}
