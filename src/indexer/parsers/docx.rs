use std::io::{Cursor, Read};
use std::path::Path;

use super::{base_metadata, ParsedDocument, Parser};
use crate::error::ParseError;
use crate::Result;

/// Word documents: text runs from `word/document.xml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocxParser;

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .map(|hex| u32::from_str_radix(hex, 16))
                .or_else(|| entity.strip_prefix('#').map(str::parse::<u32>))
                .and_then(std::result::Result::ok)
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..=semi]),
        }
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    out
}

/// Concatenate `<w:t>` runs; paragraphs end with a blank line.
fn document_text(xml: &str) -> String {
    let mut out = String::new();
    let mut rest = xml;
    let mut in_text = false;
    while let Some(lt) = rest.find('<') {
        if in_text {
            out.push_str(&unescape(&rest[..lt]));
        }
        let Some(gt) = rest[lt..].find('>') else {
            break;
        };
        let tag = &rest[lt + 1..lt + gt];
        rest = &rest[lt + gt + 1..];

        let closing = tag.starts_with('/');
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default();
        match (closing, name) {
            (false, "w:t") => in_text = !tag.ends_with('/'),
            (true, "w:t") => in_text = false,
            (false, "w:tab") => out.push('\t'),
            (false, "w:br" | "w:cr") => out.push('\n'),
            (true, "w:p") => out.push_str("\n\n"),
            _ => {}
        }
    }
    out.trim().to_string()
}

fn element_text<'a>(xml: &'a str, element: &str) -> Option<&'a str> {
    let open = format!("<{element}");
    let start = xml.find(&open)?;
    let body_start = start + xml[start..].find('>')? + 1;
    let end = body_start + xml[body_start..].find(&format!("</{element}>"))?;
    Some(xml[body_start..end].trim()).filter(|s| !s.is_empty())
}

fn read_entry(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Option<String> {
    let mut entry = archive.by_name(name).ok()?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml).ok()?;
    Some(xml)
}

impl Parser for DocxParser {
    fn name(&self) -> &'static str {
        "docx"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["docx"]
    }

    fn supported_mimetypes(&self) -> &[&'static str] {
        &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"]
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ParseError::failed(path, format!("not a zip archive: {e}")))?;
        let xml = read_entry(&mut archive, "word/document.xml")
            .ok_or_else(|| ParseError::failed(path, "missing word/document.xml"))?;
        let content = document_text(&xml);

        let mut meta = base_metadata(path, bytes, &content);
        meta.insert(
            "paragraph_count".into(),
            content.split("\n\n").filter(|p| !p.trim().is_empty()).count().into(),
        );
        if let Some(core) = read_entry(&mut archive, "docProps/core.xml") {
            for (element, key) in [("dc:title", "title"), ("dc:creator", "author"), ("dc:subject", "subject")] {
                if let Some(value) = element_text(&core, element) {
                    meta.insert(key.into(), unescape(value).into());
                }
            }
        }

        Ok(ParsedDocument {
            path: path.to_path_buf(),
            content,
            file_type: "docx".to_string(),
            metadata: meta.into(),
        })
    }
}
