//! Document importers: split source material into embedding-sized chunks
//! and upsert them into a docstore. Markdown splits on headings first and
//! falls back to paragraph packing; plain files go straight to the packer.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use parley_core::types::now_unix;
use parley_docstore::{DocStore, Docstore, Document};
use parley_expert::Embedder;

/// Upper bound on one chunk. Chosen so a handful of chunks fit a prompt
/// context comfortably.
pub const MAX_CHUNK_CHARS: usize = 2000;

/// Split markdown into chunks: top-level and second-level headings start a
/// new chunk; oversized sections fall back to paragraph packing.
pub fn split_markdown(text: &str, max_chars: usize) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let is_heading = line.starts_with("# ") || line.starts_with("## ");
        if is_heading && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }

    sections
        .iter()
        .flat_map(|section| pack_paragraphs(section, max_chars))
        .collect()
}

/// Greedily pack paragraphs up to `max_chars`; a single oversized paragraph
/// is split hard at the boundary.
pub fn pack_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + paragraph.len() + 2 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if paragraph.len() > max_chars {
            for piece in hard_split(paragraph, max_chars) {
                chunks.push(piece);
            }
            continue;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let cut = rest
            .char_indices()
            .take_while(|(i, _)| *i < max_chars)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(rest.len());
        pieces.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    pieces
}

/// Embed and upsert chunks as documents `"<stem>-<i>"`.
pub async fn import_chunks(
    store: &DocStore,
    docstore: &Docstore,
    embedder: &dyn Embedder,
    stem: &str,
    doc_type: &str,
    chunks: Vec<String>,
) -> anyhow::Result<usize> {
    let count = chunks.len();
    let embeddings = embedder.embed(&chunks).await?;
    let now = now_unix();

    for (i, (data, vector)) in chunks.into_iter().zip(embeddings).enumerate() {
        store.upsert(&Document {
            id: format!("{stem}-{i}"),
            docstore_id: docstore.id.clone(),
            timestamp: now,
            created_at: now,
            doc_type: doc_type.to_string(),
            data,
            embeddings: vec![vector],
            include: None,
        })?;
    }
    Ok(count)
}

/// Import one markdown file.
pub async fn import_markdown(
    store: &DocStore,
    docstore: &Docstore,
    embedder: &dyn Embedder,
    path: &Path,
) -> anyhow::Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "import".into());
    let chunks = split_markdown(&text, MAX_CHUNK_CHARS);
    let count = import_chunks(store, docstore, embedder, &stem, "markdown", chunks).await?;
    info!(path = %path.display(), chunks = count, "markdown imported");
    Ok(count)
}

/// Import every readable text file directly under `dir`.
pub async fn import_dir(
    store: &DocStore,
    docstore: &Docstore,
    embedder: &dyn Embedder,
    dir: &Path,
) -> anyhow::Result<usize> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue; // binary or unreadable; skip
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "import".into());
        let chunks = if path.extension().is_some_and(|e| e == "md") {
            split_markdown(&text, MAX_CHUNK_CHARS)
        } else {
            pack_paragraphs(&text, MAX_CHUNK_CHARS)
        };
        total += import_chunks(store, docstore, embedder, &stem, "file", chunks).await?;
    }
    info!(dir = %dir.display(), chunks = total, "directory imported");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_expert::testing::HashEmbedder;

    #[test]
    fn headings_start_new_chunks() {
        let md = "# One\nalpha\n\n# Two\nbeta\n\n## Two point one\ngamma\n";
        let chunks = split_markdown(md, 1000);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].contains("alpha"));
        assert!(chunks[1].contains("beta"));
        assert!(chunks[2].contains("gamma"));
    }

    #[test]
    fn paragraphs_pack_up_to_the_limit() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        let chunks = pack_paragraphs(text, 11);
        // "aaaa\n\nbbbb" fits (10 chars); "cccc" overflows into the next.
        assert_eq!(chunks, vec!["aaaa\n\nbbbb".to_string(), "cccc".to_string()]);
    }

    #[test]
    fn oversized_paragraph_is_hard_split() {
        let text = "x".repeat(25);
        let chunks = pack_paragraphs(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[tokio::test]
    async fn import_round_trips_through_the_docstore() {
        let store = parley_docstore::DocStore::open_in_memory().unwrap();
        let id = store.create_docstore("kb", "hash", 8, "").unwrap();
        let docstore = store.get_docstore(&id).unwrap().unwrap();
        let embedder = HashEmbedder::new(8);

        let chunks = split_markdown("# Title\nsome text\n\n# Next\nmore text\n", 1000);
        let count = import_chunks(&store, &docstore, &embedder, "guide", "markdown", chunks)
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.count(&id).unwrap(), 2);

        let doc = store.get(&id, "guide-0").unwrap().unwrap();
        assert!(doc.data.contains("some text"));
        assert_eq!(doc.embeddings[0].len(), 8);
    }
}
