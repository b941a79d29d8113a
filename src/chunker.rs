//! Splits a source file into semantically coherent, size-bounded, deduplicated
//! text fragments with a context prefix derived from the filename and the
//! file's first top-level heading.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

static EXCESS_NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static HEADER_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,3}[ \t]").unwrap());
static TOP_LEVEL_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^# (.+)$").unwrap());

/// One emitted fragment, already carrying its context prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub content: String,
    pub chunk_index: usize,
}

/// Reads `path` and returns its ordered chunks, or an empty vec if the file
/// is unreadable (logged, not a hard failure) or empty.
pub fn chunk_file(path: &Path, chunk_size: usize, overlap: usize) -> Vec<RawChunk> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read file for chunking");
            return Vec::new();
        }
    };
    chunk_text(&text, path, chunk_size, overlap)
}

pub fn chunk_text(text: &str, path: &Path, chunk_size: usize, overlap: usize) -> Vec<RawChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let normalized = EXCESS_NEWLINES.replace_all(text, "\n\n").to_string();
    let sections = header_split(&normalized);
    let prefix = context_prefix(path, &normalized);

    let mut bodies = Vec::new();
    for section in sections {
        let trimmed = section.trim();
        if trimmed.is_empty() {
            continue;
        }
        if char_len(trimmed) <= chunk_size {
            bodies.push(trimmed.to_string());
        } else {
            bodies.extend(paragraph_pack(trimmed, chunk_size, overlap));
        }
    }

    bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| RawChunk {
            content: format!("{prefix}{body}"),
            chunk_index: i,
        })
        .collect()
}

/// Splits immediately before any line matching `^#{1,3}\s`, keeping the
/// header attached to the content that follows it. The region before the
/// first such header (if any) is its own section.
fn header_split(text: &str) -> Vec<String> {
    let starts: Vec<usize> = HEADER_LINE.find_iter(text).map(|m| m.start()).collect();
    if starts.is_empty() {
        return vec![text.to_string()];
    }

    let mut sections = Vec::new();
    if starts[0] > 0 {
        sections.push(text[..starts[0]].to_string());
    }
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text.len());
        sections.push(text[start..end].to_string());
    }
    sections
}

fn paragraph_pack(section: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let paragraphs: Vec<&str> = section.split("\n\n").filter(|p| !p.trim().is_empty()).collect();
    if paragraphs.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for para in paragraphs {
        let candidate_len = if current.is_empty() {
            char_len(para)
        } else {
            char_len(&current) + 2 + char_len(para)
        };

        if !current.is_empty() && candidate_len > chunk_size {
            chunks.push(std::mem::take(&mut current));
            let carry = last_tokens(chunks.last().unwrap(), overlap);
            if !carry.is_empty() {
                current = format!("{carry}\n\n");
            }
        }

        if !current.is_empty() && !current.ends_with("\n\n") {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks.into_iter().map(|c| c.trim().to_string()).filter(|c| !c.is_empty()).collect()
}

fn last_tokens(text: &str, n: usize) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() <= n {
        tokens.join(" ")
    } else {
        tokens[tokens.len() - n..].join(" ")
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn context_prefix(path: &Path, text: &str) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
        .replace(['-', '_'], " ");

    match TOP_LEVEL_HEADING.captures(text) {
        Some(caps) => format!("[{stem}] {}: ", caps[1].trim()),
        None => format!("[{stem}]: "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p(name: &str) -> PathBuf {
        PathBuf::from(name)
    }

    #[test]
    fn empty_file_yields_no_chunks() {
        let chunks = chunk_text("", &p("notes/a.md"), 500, 50);
        assert!(chunks.is_empty());
    }

    #[test]
    fn whitespace_only_yields_no_chunks() {
        let chunks = chunk_text("   \n\n  ", &p("a.md"), 500, 50);
        assert!(chunks.is_empty());
    }

    #[test]
    fn small_file_single_chunk_with_prefix() {
        let chunks = chunk_text("# Alpha\n\nbeta", &p("notes/a.md"), 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert!(chunks[0].content.starts_with("[a] Alpha: "));
        assert!(chunks[0].content.contains("beta"));
    }

    #[test]
    fn stem_dashes_and_underscores_become_spaces() {
        let chunks = chunk_text("no heading here", &p("my-notes_file.md"), 500, 50);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.starts_with("[my notes file]: "));
    }

    #[test]
    fn header_split_creates_one_section_per_heading() {
        let text = "intro text\n\n# First\n\nbody one\n\n## Second\n\nbody two";
        let chunks = chunk_text(text, &p("doc.md"), 500, 50);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].content.contains("intro text"));
        assert!(chunks[1].content.contains("# First"));
        assert!(chunks[2].content.contains("## Second"));
    }

    #[test]
    fn excess_newlines_are_normalised() {
        let text = "para one\n\n\n\n\npara two";
        let chunks = chunk_text(text, &p("doc.md"), 500, 50);
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].content.contains("\n\n\n"));
    }

    #[test]
    fn paragraph_pack_splits_oversized_section_with_overlap() {
        let para = |n: usize| format!("paragraph number {n} has some words in it to pad length");
        let body = (0..30).map(para).collect::<Vec<_>>().join("\n\n");
        let chunks = chunk_text(&body, &p("long.md"), 120, 5);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
        }
    }

    #[test]
    fn unreadable_file_yields_empty_not_panic() {
        let chunks = chunk_file(&p("/nonexistent/path/does-not-exist.md"), 500, 50);
        assert!(chunks.is_empty());
    }
}
