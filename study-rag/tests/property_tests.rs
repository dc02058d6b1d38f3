//! Property tests for the numeric leaves, chunking, merging and citation
//! numbering.

use std::collections::HashMap;

use proptest::prelude::*;
use study_rag::codec::{decode_embedding, encode_embedding};
use study_rag::document::{SearchResult, StoredChunk};
use study_rag::search::rank_candidates;
use study_rag::{
    Chunker, ChunkingOptions, CitationRegistry, DocumentInfo, TextChunker, balance_by_document,
    cosine_similarity, deduplicate,
};

fn arb_nonzero_vector(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    proptest::collection::vec(-100.0f32..100.0f32, dim).prop_filter("non-zero vector", |v| {
        v.iter().map(|x| x * x).sum::<f32>().sqrt() > 1e-3
    })
}

fn arb_result() -> impl Strategy<Value = SearchResult> {
    ("[a-e]", "[a-z ]{0,12}", -1.0f32..1.0f32, 0usize..50).prop_map(
        |(doc, content, similarity, chunk_index)| SearchResult {
            chunk_id: format!("{doc}_{chunk_index}"),
            document_id: doc.clone(),
            document_name: format!("{doc}.pdf"),
            content,
            similarity,
            chunk_index,
        },
    )
}

mod prop_similarity {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn self_similarity_is_one(v in (1usize..64).prop_flat_map(arb_nonzero_vector)) {
            let s = cosine_similarity(&v, &v);
            prop_assert!((s - 1.0).abs() < 1e-4, "self similarity was {s}");
        }

        #[test]
        fn zero_vector_scores_zero(v in proptest::collection::vec(-10.0f32..10.0f32, 1..64)) {
            let zero = vec![0.0; v.len()];
            let s = cosine_similarity(&v, &zero);
            prop_assert_eq!(s, 0.0);
        }

        #[test]
        fn similarity_stays_in_range(
            (a, b) in (1usize..32).prop_flat_map(|d| (arb_nonzero_vector(d), arb_nonzero_vector(d)))
        ) {
            let s = cosine_similarity(&a, &b);
            prop_assert!((-1.0..=1.0).contains(&s));
        }
    }
}

mod prop_codec {
    use super::*;

    proptest! {
        #[test]
        fn encode_then_decode_is_lossless(v in proptest::collection::vec(-1e6f32..1e6f32, 0..128)) {
            let blob = encode_embedding(&v);
            prop_assert_eq!(blob.len(), v.len() * 4);
            prop_assert_eq!(decode_embedding(&blob).unwrap(), v);
        }
    }
}

mod prop_chunking {
    use super::*;

    fn arb_text() -> impl Strategy<Value = String> {
        proptest::collection::vec(
            prop_oneof![
                4 => "[a-zA-Z]{1,12}",
                1 => Just("\n\n".to_string()),
                1 => Just("\r\n".to_string()),
                1 => Just("é".to_string()),
            ],
            0..300,
        )
        .prop_map(|parts| parts.join(" "))
    }

    fn arb_options() -> impl Strategy<Value = ChunkingOptions> {
        (20usize..300, any::<bool>())
            .prop_flat_map(|(size, paragraphs)| (Just(size), 0..size, 0..=size, Just(paragraphs)))
            .prop_map(|(chunk_size, overlap_size, min_chunk_size, preserve_paragraphs)| {
                ChunkingOptions { chunk_size, overlap_size, min_chunk_size, preserve_paragraphs }
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn chunks_are_contiguous_bounded_and_cover_the_text(
            text in arb_text(),
            options in arb_options(),
        ) {
            let chunker = TextChunker::new(options.clone()).unwrap();
            let chunks = chunker.chunk_text(&text);
            let normalized = study_rag::normalize_line_endings(&text);
            let chars: Vec<char> = normalized.chars().collect();

            if normalized.trim().is_empty() {
                prop_assert!(chunks.is_empty());
                return Ok(());
            }
            prop_assert!(!chunks.is_empty());

            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.chunk_index, i);
                prop_assert!(chunk.start_position < chunk.end_position);
                prop_assert!(chunk.end_position - chunk.start_position <= options.chunk_size);
                let span: String = chars[chunk.start_position..chunk.end_position].iter().collect();
                prop_assert_eq!(&chunk.content, &span);
                if i + 1 < chunks.len() {
                    prop_assert!(chunk.content.chars().count() >= options.min_chunk_size);
                    prop_assert!(chunks[i + 1].start_position > chunk.start_position);
                    let next_start = chunks[i + 1].start_position;
                    prop_assert!(next_start <= chunk.end_position
                        || chars[chunk.end_position..next_start].iter().all(|c| c.is_whitespace()));
                }
            }
            prop_assert_eq!(chunks[0].start_position, 0);
            let last = chunks.last().unwrap();
            prop_assert!(chars[last.end_position..].iter().all(|c| c.is_whitespace()));
        }
    }
}

mod prop_merging {
    use super::*;

    proptest! {
        #[test]
        fn deduplication_is_idempotent(
            results in proptest::collection::vec(arb_result(), 0..40),
            prefix in 1usize..20,
        ) {
            let once = deduplicate(results, prefix);
            let twice = deduplicate(once.clone(), prefix);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn balancing_never_exceeds_the_cap(
            results in proptest::collection::vec(arb_result(), 0..60),
            cap in 1usize..6,
        ) {
            let balanced = balance_by_document(results.clone(), cap);
            let mut per_doc: HashMap<&str, usize> = HashMap::new();
            for r in &balanced {
                *per_doc.entry(r.document_id.as_str()).or_default() += 1;
            }
            prop_assert!(per_doc.values().all(|&n| n <= cap));

            let mut input_docs: HashMap<&str, usize> = HashMap::new();
            for r in &results {
                *input_docs.entry(r.document_id.as_str()).or_default() += 1;
            }
            for (doc, n) in input_docs {
                prop_assert_eq!(per_doc.get(doc).copied().unwrap_or(0), n.min(cap));
            }
        }

        #[test]
        fn ranking_is_sorted_bounded_and_thresholded(
            vectors in proptest::collection::vec(arb_nonzero_vector(8), 0..30),
            query in arb_nonzero_vector(8),
            limit in 1usize..20,
            min_similarity in -1.0f32..1.0f32,
        ) {
            let candidates: Vec<StoredChunk> = vectors
                .iter()
                .enumerate()
                .map(|(i, v)| StoredChunk {
                    id: format!("c{i}"),
                    document_id: "d".into(),
                    document_name: "D.pdf".into(),
                    content: format!("content {i}"),
                    chunk_index: i,
                    embedding: Some(encode_embedding(v)),
                })
                .collect();
            let results = rank_candidates(candidates, &query, limit, min_similarity);
            prop_assert!(results.len() <= limit);
            prop_assert!(results.iter().all(|r| r.similarity >= min_similarity));
            prop_assert!(results.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        }
    }
}

mod prop_citations {
    use super::*;

    proptest! {
        #[test]
        fn same_document_same_number_distinct_documents_distinct_numbers(
            picks in proptest::collection::vec(0usize..6, 1..40),
        ) {
            let docs: Vec<DocumentInfo> = (0..6)
                .map(|i| DocumentInfo {
                    id: format!("d{i}"),
                    study_id: "s".into(),
                    name: format!("File {i}.pdf"),
                })
                .collect();
            let mut registry = CitationRegistry::new(docs.clone());

            let mut seen: HashMap<usize, u32> = HashMap::new();
            let mut next = 1;
            for pick in picks {
                let (citation, is_new) = registry.resolve(&docs[pick].name).unwrap();
                match seen.get(&pick) {
                    Some(&number) => {
                        prop_assert!(!is_new);
                        prop_assert_eq!(citation.citation_number, number);
                    }
                    None => {
                        prop_assert!(is_new);
                        prop_assert_eq!(citation.citation_number, next);
                        seen.insert(pick, next);
                        next += 1;
                    }
                }
            }
        }
    }
}
