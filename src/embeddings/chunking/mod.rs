
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::EngineError;

/// One contiguous span of a file's text, in split order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// The content text
    pub content: String,
    /// Heading path of the section this chunk came from, empty for unstructured text
    pub heading_path: String,
    /// Estimated token count
    pub token_count: usize,
    /// Whether this chunk contains code blocks
    pub has_code_blocks: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SplitError {
    #[error("file has no text content")]
    Empty,
    #[error("file is not valid UTF-8 text: {0}")]
    Encoding(String),
    #[error("file looks binary (NUL byte at offset {0})")]
    Binary(usize),
}

impl From<SplitError> for EngineError {
    #[inline]
    fn from(err: SplitError) -> Self {
        Self::Split(err.to_string())
    }
}

/// Turns a file's text into ordered chunks.
///
/// Implementations only decide chunk boundaries. Positions and identifiers are
/// assigned afterwards by [`crate::identity`].
pub trait Splitter: Send + Sync {
    fn split(&self, text: &str) -> Result<Vec<TextChunk>, SplitError>;
}

/// Configuration for content chunking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size in tokens
    pub target_chunk_size: usize,
    /// Maximum chunk size in tokens before forced splitting
    pub max_chunk_size: usize,
    /// Minimum chunk size in tokens (smaller chunks will be merged)
    pub min_chunk_size: usize,
    /// Overlap size in tokens between adjacent chunks
    pub overlap_size: usize,
    /// Whether to preserve code blocks as single units
    pub preserve_code_blocks: bool,
    /// Whether to break at sentence boundaries when possible
    pub sentence_boundary_splitting: bool,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            target_chunk_size: 650,
            max_chunk_size: 1000,
            min_chunk_size: 100,
            overlap_size: 50,
            preserve_code_blocks: true,
            sentence_boundary_splitting: true,
        }
    }
}

/// Decode raw upload bytes into text, rejecting binary and non-UTF-8 content
#[inline]
pub fn decode_text(bytes: &[u8]) -> Result<&str, SplitError> {
    if let Some(offset) = bytes.iter().position(|b| *b == 0) {
        return Err(SplitError::Binary(offset));
    }

    let text = std::str::from_utf8(bytes).map_err(|e| SplitError::Encoding(e.to_string()))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    if text.trim().is_empty() {
        return Err(SplitError::Empty);
    }

    Ok(text)
}

/// Default splitter: markdown-aware sections, then paragraphs, sentences and words
#[derive(Debug, Clone, Default)]
pub struct ParagraphSplitter {
    config: ChunkingConfig,
}

impl ParagraphSplitter {
    #[inline]
    pub const fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub const fn config(&self) -> &ChunkingConfig {
        &self.config
    }
}

impl Splitter for ParagraphSplitter {
    #[inline]
    fn split(&self, text: &str) -> Result<Vec<TextChunk>, SplitError> {
        if text.trim().is_empty() {
            return Err(SplitError::Empty);
        }

        let mut chunks = Vec::new();
        for section in split_sections(text) {
            chunks.extend(chunk_section(&section, &self.config));
        }

        let processed = post_process_chunks(chunks, &self.config);
        if processed.is_empty() {
            return Err(SplitError::Empty);
        }

        debug!(
            "Split text into {} chunks (avg {} tokens)",
            processed.len(),
            processed.iter().map(|c| c.token_count).sum::<usize>() / processed.len()
        );

        Ok(processed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    heading_path: String,
    content: String,
    has_code_blocks: bool,
}

/// Break text at markdown headings outside of fenced code
fn split_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut headings: Vec<(usize, String)> = Vec::new();
    let mut current = String::new();
    let mut in_code_block = false;

    let flush = |headings: &[(usize, String)], current: &mut String, out: &mut Vec<Section>| {
        if !current.trim().is_empty() {
            out.push(Section {
                heading_path: headings
                    .iter()
                    .map(|(_, h)| h.as_str())
                    .collect::<Vec<_>>()
                    .join(" > "),
                has_code_blocks: contains_code_block(current),
                content: current.trim().to_string(),
            });
        }
        current.clear();
    };

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_code_block = !in_code_block;
        }

        let heading = if in_code_block {
            None
        } else {
            parse_heading(line)
        };
        if let Some((level, title)) = heading {
            flush(&headings, &mut current, &mut sections);
            headings.retain(|(l, _)| *l < level);
            headings.push((level, title.to_string()));
            continue;
        }

        current.push_str(line);
        current.push('\n');
    }
    flush(&headings, &mut current, &mut sections);

    sections
}

fn parse_heading(line: &str) -> Option<(usize, &str)> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if !(1..=6).contains(&level) {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim();
    (!title.is_empty()).then_some((level, title))
}

/// Chunk a single content section
fn chunk_section(section: &Section, config: &ChunkingConfig) -> Vec<TextChunk> {
    let content = &section.content;
    let token_count = estimate_token_count(content);

    if token_count <= config.target_chunk_size {
        return vec![TextChunk {
            content: content.clone(),
            heading_path: section.heading_path.clone(),
            token_count,
            has_code_blocks: section.has_code_blocks,
        }];
    }

    let splits = if section.has_code_blocks && config.preserve_code_blocks {
        split_with_code_preservation(content, config)
    } else {
        split_by_semantics(content, config)
    };

    splits
        .into_iter()
        .filter(|split| !split.trim().is_empty())
        .map(|split| TextChunk {
            token_count: estimate_token_count(&split),
            has_code_blocks: section.has_code_blocks && contains_code_block(&split),
            heading_path: section.heading_path.clone(),
            content: split,
        })
        .collect()
}

/// Split content while keeping fenced code blocks whole
fn split_with_code_preservation(content: &str, config: &ChunkingConfig) -> Vec<String> {
    let mut splits = Vec::new();
    let mut current_split = String::new();
    let mut in_code_block = false;
    let mut current_token_count = 0;

    for line in content.lines() {
        let line_with_newline = format!("{}\n", line);
        let line_tokens = estimate_token_count(&line_with_newline);

        if line.trim().starts_with("```") {
            in_code_block = !in_code_block;
        }

        if !in_code_block
            && current_token_count + line_tokens > config.max_chunk_size
            && !current_split.trim().is_empty()
        {
            splits.push(current_split.trim().to_string());
            current_split.clear();
            current_token_count = 0;
        }

        current_split.push_str(&line_with_newline);
        current_token_count += line_tokens;
    }

    if !current_split.trim().is_empty() {
        splits.push(current_split.trim().to_string());
    }

    splits
}

/// Accumulates pieces into splits no larger than the target size
struct SplitAccumulator<'a> {
    config: &'a ChunkingConfig,
    splits: Vec<String>,
    current: String,
    current_tokens: usize,
    separator: &'static str,
}

impl<'a> SplitAccumulator<'a> {
    const fn new(config: &'a ChunkingConfig, separator: &'static str) -> Self {
        Self {
            config,
            splits: Vec::new(),
            current: String::new(),
            current_tokens: 0,
            separator,
        }
    }

    fn push(&mut self, piece: &str) {
        let tokens = estimate_token_count(piece);
        if self.current_tokens + tokens > self.config.target_chunk_size
            && !self.current.trim().is_empty()
        {
            self.flush();
        }
        self.current.push_str(piece);
        self.current.push_str(self.separator);
        self.current_tokens += tokens;
    }

    fn flush(&mut self) {
        if !self.current.trim().is_empty() {
            self.splits.push(self.current.trim().to_string());
        }
        self.current.clear();
        self.current_tokens = 0;
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.splits
    }
}

/// Split content at paragraph boundaries, falling back to sentences or words
fn split_by_semantics(content: &str, config: &ChunkingConfig) -> Vec<String> {
    let mut acc = SplitAccumulator::new(config, "\n\n");

    for paragraph in content.split("\n\n") {
        if paragraph.trim().is_empty() {
            continue;
        }

        if estimate_token_count(paragraph) > config.max_chunk_size {
            let pieces = if config.sentence_boundary_splitting {
                split_by_sentences(paragraph, config)
            } else {
                split_by_words(paragraph, config)
            };
            for piece in pieces {
                acc.push(&piece);
            }
        } else {
            acc.push(paragraph);
        }
    }

    acc.finish()
}

/// Split text by sentences
fn split_by_sentences(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let sentences = text
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    let mut acc = SplitAccumulator::new(config, " ");
    for sentence in sentences {
        if estimate_token_count(sentence) > config.max_chunk_size {
            for piece in split_by_words(sentence, config) {
                acc.push(&piece);
            }
        } else {
            acc.push(sentence);
        }
    }
    acc.finish()
}

/// Split text by words as a last resort
fn split_by_words(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let mut acc = SplitAccumulator::new(config, " ");
    for word in text.split_whitespace() {
        acc.push(word);
    }
    acc.finish()
}

/// Merge undersized neighbours from the same section, then add overlap
fn post_process_chunks(chunks: Vec<TextChunk>, config: &ChunkingConfig) -> Vec<TextChunk> {
    let mut processed = Vec::with_capacity(chunks.len());
    let mut pending_merge: Option<TextChunk> = None;

    for chunk in chunks {
        if let Some(mut pending) = pending_merge.take() {
            if chunk.token_count < config.min_chunk_size
                && pending.token_count + chunk.token_count <= config.max_chunk_size
                && pending.heading_path == chunk.heading_path
            {
                pending.content.push_str("\n\n");
                pending.content.push_str(&chunk.content);
                pending.token_count += chunk.token_count;
                pending.has_code_blocks = pending.has_code_blocks || chunk.has_code_blocks;
                pending_merge = Some(pending);
                continue;
            }
            processed.push(pending);
        }

        if chunk.token_count < config.min_chunk_size {
            pending_merge = Some(chunk);
        } else {
            processed.push(chunk);
        }
    }

    if let Some(pending) = pending_merge {
        processed.push(pending);
    }

    if config.overlap_size > 0 {
        add_overlap(&mut processed, config.overlap_size);
    }

    processed
}

/// Prefix each chunk with the tail of its predecessor from the same section
fn add_overlap(chunks: &mut [TextChunk], overlap_size: usize) {
    for i in (1..chunks.len()).rev() {
        let (left, right) = chunks.split_at_mut(i);
        let prev_chunk = &left[i - 1];
        let curr_chunk = &mut right[0];

        if prev_chunk.heading_path != curr_chunk.heading_path {
            continue;
        }

        let overlap_text = extract_overlap_text(&prev_chunk.content, overlap_size);
        if !overlap_text.is_empty() {
            curr_chunk.content = format!("{}\n\n{}", overlap_text, curr_chunk.content);
            curr_chunk.token_count += estimate_token_count(&overlap_text);
        }
    }
}

/// Extract overlap text from the end of a chunk
fn extract_overlap_text(content: &str, overlap_tokens: usize) -> String {
    let words: Vec<&str> = content.split_whitespace().collect();
    let word_count = overlap_tokens * 3 / 4;

    if word_count == 0 || words.len() <= word_count {
        return String::new();
    }

    words[words.len() - word_count..].join(" ")
}

/// Estimate token count using a simple heuristic
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    // roughly 0.75 words per token, punctuation adds a little
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();

    (punct_count as f64).mul_add(0.1, word_count as f64 / 0.75) as usize
}

/// Check if text contains code blocks
fn contains_code_block(text: &str) -> bool {
    text.contains("```") || text.lines().any(|line| line.starts_with("    "))
}
