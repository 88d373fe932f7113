//! Boundary-aware text chunking.
//!
//! Text is split by headings into sections, sections into paragraphs, and
//! paragraphs longer than `max_chunk_size` into sentences (or fixed windows
//! when a single sentence is still too long). Units are packed greedily up to
//! `chunk_size` within a section, pieces below `min_chunk_size` are merged into
//! a neighbour, and each chunk after the first is extended backwards by up to
//! `chunk_overlap` characters, snapped to a word start.
//!
//! Every chunk is a slice of the original text, so `start_offset..end_offset`
//! (in characters) always reproduces `content`. The output depends only on
//! the text and the configuration.

use crate::config::ChunkingConfig;
use crate::indexer::parsers::ParsedDocument;
use crate::storage::ChunkRecord;

/// A chunk before it is given an id and owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Chunk text.
    pub content: String,
    /// First character offset.
    pub start_offset: usize,
    /// One past the last character offset.
    pub end_offset: usize,
    /// Position in the document.
    pub chunk_index: usize,
    /// Heading of the section the chunk starts in.
    pub section: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
}

#[derive(Debug, Clone)]
struct Piece {
    span: Span,
    section: usize,
}

/// Splits documents into overlapping chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

fn chars(text: &str, span: Span) -> usize {
    text[span.start..span.end].chars().count()
}

fn trim(text: &str, span: Span) -> Option<Span> {
    let slice = &text[span.start..span.end];
    let left = slice.len() - slice.trim_start().len();
    let right = slice.trim_end().len();
    (left < right).then_some(Span {
        start: span.start + left,
        end: span.start + right,
    })
}

/// Lines of `span` as `(start, end)` byte ranges, newline included.
fn lines(text: &str, span: Span) -> Vec<Span> {
    let mut out = Vec::new();
    let mut at = span.start;
    for line in text[span.start..span.end].split_inclusive('\n') {
        out.push(Span {
            start: at,
            end: at + line.len(),
        });
        at += line.len();
    }
    out
}

fn heading(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    let rest = &trimmed[hashes..];
    rest.starts_with(' ').then(|| rest.trim())
}

fn sentences(text: &str, span: Span) -> Vec<Span> {
    let slice = &text[span.start..span.end];
    let mut out = Vec::new();
    let mut begin = 0;
    let mut iter = slice.char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        if matches!(c, '.' | '!' | '?') && iter.peek().is_some_and(|(_, n)| n.is_whitespace()) {
            let end = i + c.len_utf8();
            if let Some(s) = trim(text, Span { start: span.start + begin, end: span.start + end }) {
                out.push(s);
            }
            begin = end;
        }
    }
    if let Some(s) = trim(text, Span { start: span.start + begin, end: span.end }) {
        out.push(s);
    }
    out
}

/// Fixed windows of `size` characters, broken at whitespace when possible.
fn windows(text: &str, span: Span, size: usize) -> Vec<Span> {
    let mut out = Vec::new();
    let mut start = span.start;
    while start < span.end {
        let slice = &text[start..span.end];
        let Some((cut, _)) = slice.char_indices().nth(size) else {
            out.extend(trim(text, Span { start, end: span.end }));
            break;
        };
        let soft = slice[..cut]
            .rfind(char::is_whitespace)
            .filter(|&ws| ws > cut / 2)
            .unwrap_or(cut);
        out.extend(trim(text, Span { start, end: start + soft }));
        start += soft;
    }
    out
}

impl Chunker {
    /// Chunker with the given sizes.
    #[must_use]
    pub const fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk a parsed document into storable records with fresh ids.
    #[must_use]
    pub fn chunk(&self, document: &ParsedDocument) -> Vec<ChunkRecord> {
        let path = document.path.display().to_string();
        self.split(&document.content)
            .into_iter()
            .map(|c| ChunkRecord {
                chunk_id: uuid::Uuid::new_v4().to_string(),
                document_path: path.clone(),
                content: c.content,
                start_offset: c.start_offset,
                end_offset: c.end_offset,
                chunk_index: c.chunk_index,
                metadata: c
                    .section
                    .map_or_else(|| serde_json::json!({}), |s| serde_json::json!({ "section": s })),
            })
            .collect()
    }

    /// Split text into chunks.
    #[must_use]
    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        let whole = Span { start: 0, end: text.len() };
        if trim(text, whole).is_none() {
            return Vec::new();
        }

        let (sections, headings) = Self::sections(text);
        let mut pieces = Vec::new();
        for (index, section) in sections.iter().enumerate() {
            let units = self.units(text, *section);
            for span in self.pack(text, &units) {
                pieces.push(Piece {
                    span,
                    section: index,
                });
            }
        }
        let pieces = self.merge_small(text, pieces);

        let mut out = Vec::with_capacity(pieces.len());
        let mut previous: Option<Span> = None;
        for (chunk_index, piece) in pieces.iter().enumerate() {
            let start = previous.map_or(piece.span.start, |prev| {
                self.overlap_start(text, prev.start, piece.span.start)
            });
            let span = Span {
                start,
                end: piece.span.end,
            };
            let start_offset = text[..span.start].chars().count();
            let content = text[span.start..span.end].to_string();
            out.push(TextChunk {
                start_offset,
                end_offset: start_offset + content.chars().count(),
                content,
                chunk_index,
                section: headings.get(piece.section).cloned().flatten(),
            });
            previous = Some(piece.span);
        }
        out
    }

    fn sections(text: &str) -> (Vec<Span>, Vec<Option<String>>) {
        let mut spans = Vec::new();
        let mut headings = Vec::new();
        let mut current = Span { start: 0, end: 0 };
        let mut title = None;
        for line in lines(text, Span { start: 0, end: text.len() }) {
            if let Some(h) = heading(&text[line.start..line.end]) {
                if line.start > current.start {
                    current.end = line.start;
                    spans.push(current);
                    headings.push(title.take());
                }
                current = Span { start: line.start, end: line.start };
                title = Some(h.to_string());
            }
        }
        current.end = text.len();
        spans.push(current);
        headings.push(title);
        (spans, headings)
    }

    fn units(&self, text: &str, section: Span) -> Vec<Span> {
        let mut paragraphs = Vec::new();
        let mut open: Option<Span> = None;
        for line in lines(text, section) {
            if text[line.start..line.end].trim().is_empty() {
                paragraphs.extend(open.take().and_then(|p| trim(text, p)));
            } else {
                let p = open.get_or_insert(line);
                p.end = line.end;
            }
        }
        paragraphs.extend(open.and_then(|p| trim(text, p)));

        let mut units = Vec::new();
        for paragraph in paragraphs {
            if chars(text, paragraph) <= self.config.max_chunk_size {
                units.push(paragraph);
                continue;
            }
            for sentence in sentences(text, paragraph) {
                if chars(text, sentence) <= self.config.max_chunk_size {
                    units.push(sentence);
                } else {
                    units.extend(windows(text, sentence, self.config.chunk_size.max(1)));
                }
            }
        }
        units
    }

    fn pack(&self, text: &str, units: &[Span]) -> Vec<Span> {
        let mut out = Vec::new();
        let mut current: Option<Span> = None;
        for unit in units {
            current = match current {
                None => Some(*unit),
                Some(cur) => {
                    let joined = Span { start: cur.start, end: unit.end };
                    if chars(text, joined) <= self.config.chunk_size {
                        Some(joined)
                    } else {
                        out.push(cur);
                        Some(*unit)
                    }
                }
            };
        }
        out.extend(current);
        out
    }

    fn merge_small(&self, text: &str, mut pieces: Vec<Piece>) -> Vec<Piece> {
        let min = self.config.min_chunk_size;
        let max = self.config.max_chunk_size;
        let mut merged: Vec<Piece> = Vec::with_capacity(pieces.len());
        for i in 0..pieces.len() {
            let piece = pieces[i].clone();
            if chars(text, piece.span) < min {
                if let Some(last) = merged.last_mut() {
                    if chars(text, Span { start: last.span.start, end: piece.span.end }) <= max {
                        last.span.end = piece.span.end;
                        continue;
                    }
                }
                if let Some(next) = pieces.get_mut(i + 1) {
                    if chars(text, Span { start: piece.span.start, end: next.span.end }) <= max {
                        next.span.start = piece.span.start;
                        next.section = piece.section;
                        continue;
                    }
                }
            }
            merged.push(piece);
        }
        merged
    }

    /// Start of a chunk beginning at `start` once overlap is applied.
    ///
    /// Never reaches back to `floor` (the previous chunk's start) and never
    /// starts mid-word.
    fn overlap_start(&self, text: &str, floor: usize, start: usize) -> usize {
        let overlap = self.config.chunk_overlap;
        if overlap == 0 || floor >= start {
            return start;
        }
        let head = &text[floor..start];
        let skip = head.chars().count().saturating_sub(overlap).max(1);
        let Some((mut at, _)) = head.char_indices().nth(skip) else {
            return start;
        };
        if !head[..at].ends_with(char::is_whitespace) {
            match head[at..].find(char::is_whitespace) {
                Some(ws) => at += ws,
                None => return start,
            }
        }
        let rest = head[at..].trim_start();
        if rest.is_empty() {
            start
        } else {
            start - rest.len()
        }
    }
}
