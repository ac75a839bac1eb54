//! Nearest-neighbor lookup over the text-chunk and image-vector stores.
//!
//! The query text is embedded with the configured text embedder and ranked
//! by cosine similarity. Image search relies on the text model sharing an
//! embedding space with the image model (the default CLIP pair does).

use anyhow::{bail, Result};

use crate::context::IngestContext;
use crate::embedding::embed_query;
use crate::models::{ImageVectorRecord, TextChunkRecord};
use crate::store::{SearchFilter, SearchHit};

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub images: bool,
    pub limit: usize,
    pub filter: SearchFilter,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            images: false,
            limit: 10,
            filter: SearchFilter::default(),
        }
    }
}

pub async fn search_text(
    ctx: &IngestContext,
    query: &str,
    filter: &SearchFilter,
    limit: usize,
) -> Result<Vec<SearchHit<TextChunkRecord>>> {
    let vector = embed_query(ctx.text_embedder.as_ref(), query).await?;
    ctx.text_chunks.search(&vector, filter, limit).await
}

pub async fn search_images(
    ctx: &IngestContext,
    query: &str,
    filter: &SearchFilter,
    limit: usize,
) -> Result<Vec<SearchHit<ImageVectorRecord>>> {
    let vector = embed_query(ctx.text_embedder.as_ref(), query).await?;
    ctx.image_vectors.search(&vector, filter, limit).await
}

/// Run a query and print the hits to stdout.
pub async fn run_search(ctx: &IngestContext, query: &str, options: &SearchOptions) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if options.limit == 0 {
        bail!("--limit must be at least 1");
    }

    if options.images {
        let hits = search_images(ctx, query, &options.filter, options.limit).await?;
        if hits.is_empty() {
            println!("No results.");
            return Ok(());
        }
        for (i, hit) in hits.iter().enumerate() {
            let r = &hit.record;
            println!("{}. [{:.2}] {} ({})", i + 1, hit.score, r.name, r.meta_info);
            println!("    uri: {}", r.source_uri);
            println!("    hash: {}", r.hash);
            println!();
        }
    } else {
        let hits = search_text(ctx, query, &options.filter, options.limit).await?;
        if hits.is_empty() {
            println!("No results.");
            return Ok(());
        }
        for (i, hit) in hits.iter().enumerate() {
            let r = &hit.record;
            println!("{}. [{:.2}] {}", i + 1, hit.score, r.name);
            println!("    uri: {}", r.source_uri);
            println!("    excerpt: \"{}\"", excerpt(&r.text, 200));
            println!("    hash: {}", r.hash);
            println!();
        }
    }
    Ok(())
}

/// First `max_chars` characters on one line.
fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let trimmed = flat.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push('…');
    out
}
