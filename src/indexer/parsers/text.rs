use std::path::Path;

use super::{base_metadata, extension_of, ParsedDocument, Parser};
use crate::error::ParseError;
use crate::Result;

const EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "py", "js", "ts", "jsx", "tsx", "java", "c", "cpp", "h",
    "hpp", "go", "rs", "rb", "php", "swift", "kt", "scala", "sh", "bash", "zsh", "yaml", "yml",
    "json", "toml", "xml", "html", "css", "sql",
];

const MIMETYPES: &[&str] = &[
    "text/plain",
    "text/markdown",
    "text/x-rst",
    "text/x-python",
    "text/javascript",
    "application/javascript",
    "text/x-rust",
    "text/x-go",
    "text/yaml",
    "application/json",
    "application/toml",
    "text/xml",
    "text/html",
    "text/css",
    "application/sql",
];

/// Plain text, markdown, source code and config files.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextParser;

/// Decode bytes as UTF-8, UTF-16 (with BOM), or Latin-1 as a last resort.
pub(crate) fn decode_text(bytes: &[u8]) -> std::result::Result<String, String> {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8(rest.to_vec()).map_err(|e| e.to_string());
    }
    let utf16 = |rest: &[u8], from: fn([u8; 2]) -> u16| {
        let units: Vec<u16> = rest.chunks_exact(2).map(|c| from([c[0], c[1]])).collect();
        String::from_utf16(&units).map_err(|e| e.to_string())
    };
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return utf16(rest, u16::from_be_bytes);
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

fn markdown_title(content: &str) -> Option<&str> {
    content
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl Parser for TextParser {
    fn name(&self) -> &'static str {
        "text"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        EXTENSIONS
    }

    fn supported_mimetypes(&self) -> &[&'static str] {
        MIMETYPES
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument> {
        let content = decode_text(bytes).map_err(|reason| ParseError::failed(path, reason))?;
        let file_type = extension_of(path).unwrap_or_else(|| "txt".to_string());

        let mut meta = base_metadata(path, bytes, &content);
        let line_count = if content.is_empty() { 0 } else { content.lines().count() };
        meta.insert("line_count".into(), line_count.into());
        if matches!(file_type.as_str(), "md" | "markdown") {
            if let Some(title) = markdown_title(&content) {
                meta.insert("title".into(), title.into());
            }
        }

        Ok(ParsedDocument {
            path: path.to_path_buf(),
            content,
            file_type,
            metadata: meta.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_title_and_counts() {
        let doc = TextParser
            .parse(Path::new("/d/notes.md"), b"intro\n# Quarterly Plan \nbody\n")
            .unwrap();
        assert_eq!(doc.file_type, "md");
        assert_eq!(doc.metadata["title"], "Quarterly Plan");
        assert_eq!(doc.metadata["line_count"], 3);
        assert_eq!(doc.metadata["file_name"], "notes.md");
    }

    #[test]
    fn test_decodings() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFhi").unwrap(), "hi");
        assert_eq!(decode_text(&[0xFF, 0xFE, b'h', 0, b'i', 0]).unwrap(), "hi");
        assert_eq!(decode_text(&[0xFE, 0xFF, 0, b'h', 0, b'i']).unwrap(), "hi");
        assert_eq!(decode_text(b"caf\xE9").unwrap(), "café");
    }

    #[test]
    fn test_plain_text_has_no_title() {
        let doc = TextParser.parse(Path::new("/d/a.txt"), b"# not markdown").unwrap();
        assert!(doc.metadata.get("title").is_none());
    }
}
