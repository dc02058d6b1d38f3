//! End-to-end retrieval scenarios over the in-memory chunk store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use study_rag::testing::{MockEmbeddingProvider, vector_at_similarity};
use study_rag::*;
use tracing::Level;

fn chunk(doc: &DocumentInfo, index: usize, content: &str, embedding: Vec<f32>) -> Chunk {
    Chunk {
        id: format!("{}_{index}", doc.id),
        document_id: doc.id.clone(),
        document_name: doc.name.clone(),
        content: content.to_string(),
        chunk_index: index,
        embedding: Some(embedding),
    }
}

fn doc(id: &str, study: &str, name: &str) -> DocumentInfo {
    DocumentInfo { id: id.into(), study_id: study.into(), name: name.into() }
}

fn fast_config() -> RagConfig {
    RagConfig::builder().retry_delay_ms(1).min_similarity(0.5).build().unwrap()
}

/// Empty store in which `u1` owns study `s1`.
async fn owned_store() -> Arc<InMemoryChunkStore> {
    let store = Arc::new(InMemoryChunkStore::new());
    store.register_study("s1", "u1").await.unwrap();
    store
}

/// Study `s1` holds A.pdf (0.9, 0.6, 0.2) and B.pdf (0.8, 0.3); study `s2`,
/// owned by `u2`, holds a perfect match that must never leak into `s1`
/// results.
async fn seeded_store() -> Arc<InMemoryChunkStore> {
    let store = owned_store().await;
    store.register_study("s2", "u2").await.unwrap();
    let a = doc("a", "s1", "A.pdf");
    let b = doc("b", "s1", "B.pdf");
    let x = doc("x", "s2", "Other.pdf");
    store
        .insert_document(
            a.clone(),
            vec![
                chunk(&a, 0, "Participants loved the dashboard.", vector_at_similarity(0.9)),
                chunk(&a, 1, "Setup took most of an afternoon.", vector_at_similarity(0.6)),
                chunk(&a, 2, "Pricing was rarely mentioned.", vector_at_similarity(0.2)),
            ],
        )
        .await
        .unwrap();
    store
        .insert_document(
            b.clone(),
            vec![
                chunk(&b, 0, "The export button was hard to find.", vector_at_similarity(0.8)),
                chunk(&b, 1, "Support answered quickly.", vector_at_similarity(0.3)),
            ],
        )
        .await
        .unwrap();
    store
        .insert_document(x.clone(), vec![chunk(&x, 0, "Foreign study content.", vec![1.0, 0.0])])
        .await
        .unwrap();
    store
}

fn service(
    store: Arc<InMemoryChunkStore>,
    embedder: Arc<MockEmbeddingProvider>,
    config: RagConfig,
) -> Arc<RetrievalService> {
    Arc::new(
        RetrievalService::builder()
            .config(config)
            .embedding_provider(embedder)
            .chunk_store(store)
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn ranks_filters_and_truncates_within_scope() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2));
    let service = service(seeded_store().await, embedder, fast_config());

    let results = service
        .search(&Scope::study("u1", "s1"), &SearchRequest::new("usability", 3, 0.5))
        .await
        .unwrap();

    let got: Vec<(&str, String)> = results
        .iter()
        .map(|r| (r.document_name.as_str(), format!("{:.1}", r.similarity)))
        .collect();
    assert_eq!(
        got,
        vec![("A.pdf", "0.9".into()), ("B.pdf", "0.8".into()), ("A.pdf", "0.6".into())]
    );
    assert!(results.iter().all(|r| r.document_id != "x"));
}

#[tokio::test]
async fn document_allowlist_restricts_candidates() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2));
    let service = service(seeded_store().await, embedder, fast_config());

    let results = service
        .search(&Scope::study("u1", "s1").with_documents(["b"]), &SearchRequest::new("q", 10, 0.0))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.document_id == "b"));
}

#[tokio::test]
async fn access_denied_short_circuits_before_embedding() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2));
    let service = service(seeded_store().await, embedder.clone(), fast_config());

    let scope = Scope::study("u1", "s1").with_documents(["a", "x"]);
    let err = service.search(&scope, &SearchRequest::new("q", 5, 0.0)).await.unwrap_err();
    assert!(matches!(
        err,
        RagError::AccessDenied { ref document_ids, .. } if document_ids == &["x"]
    ));
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test]
async fn studies_owned_by_someone_else_are_never_searched() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2));
    let service = service(seeded_store().await, embedder.clone(), fast_config());

    let err = service
        .search(&Scope::study("u2", "s1"), &SearchRequest::new("q", 5, -1.0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RagError::StudyAccessDenied { ref user_id, .. } if user_id == "u2"
    ));

    let queries = vec!["theme".to_string()];
    let err = service.retrieve(&Scope::study("u1", "s2"), &queries, None, None).await;
    assert!(matches!(err, Err(RagError::StudyAccessDenied { .. })));
    let err = service.study_documents(&Scope::study("u1", "unknown-study")).await;
    assert!(matches!(err, Err(RagError::StudyAccessDenied { .. })));
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test]
async fn deterministic_errors_are_not_retried() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2));
    let service = service(seeded_store().await, embedder.clone(), fast_config());

    let err = service.search(&Scope::study("u1", "s1"), &SearchRequest::new("   ", 5, 0.5)).await;
    assert!(matches!(err, Err(RagError::InvalidQuery(_))));
    let err = service.search(&Scope::study("u1", ""), &SearchRequest::new("q", 5, 0.5)).await;
    assert!(matches!(err, Err(RagError::MissingScope(_))));
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_embedding_failures_are_retried() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2).failing_times("flaky", 2));
    let config = RagConfig::builder().retry_attempts(3).retry_delay_ms(500).build().unwrap();
    let service = service(seeded_store().await, embedder.clone(), config);

    let start = tokio::time::Instant::now();
    let results = service
        .search(&Scope::study("u1", "s1"), &SearchRequest::new("flaky query", 2, 0.5))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(embedder.calls(), 3);
    assert!(start.elapsed() >= Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_a_typed_error() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2).failing_on("down"));
    let config = RagConfig::builder().retry_attempts(3).retry_delay_ms(10).build().unwrap();
    let service = service(seeded_store().await, embedder.clone(), config);

    let err = service
        .search(&Scope::study("u1", "s1"), &SearchRequest::new("service down", 2, 0.5))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::EmbeddingError { .. }));
    assert_eq!(embedder.calls(), 3);
}

#[tokio::test]
async fn corrupt_embeddings_are_skipped() {
    let store = seeded_store().await;
    let c = doc("c", "s1", "C.pdf");
    store
        .insert_document(
            c.clone(),
            vec![Chunk { embedding: None, ..chunk(&c, 0, "Corrupt chunk.", vec![]) }],
        )
        .await
        .unwrap();
    store.attach_raw_embedding("c", "c_0", vec![0xff; 7]).await.unwrap();

    let service = service(store, Arc::new(MockEmbeddingProvider::new(2)), fast_config());
    let results = service
        .search(&Scope::study("u1", "s1"), &SearchRequest::new("q", 10, -1.0))
        .await
        .unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.document_id != "c"));
}

#[tokio::test]
async fn partial_batch_failure_returns_surviving_results() {
    let storage = study_telemetry::CapturedEvents::new();
    let _guard =
        tracing::subscriber::set_default(study_telemetry::capture_subscriber(storage.clone()));

    let store = owned_store().await;
    let d = doc("d", "s1", "Interview.pdf");
    store
        .insert_document(
            d.clone(),
            vec![
                chunk(&d, 0, "Invoices arrive too late.", vector_at_similarity(0.9)),
                chunk(&d, 1, "Approvals need three clicks.", vector_at_similarity(0.7)),
            ],
        )
        .await
        .unwrap();
    let embedder = Arc::new(MockEmbeddingProvider::new(2).failing_on("theme"));
    let config = RagConfig::builder().retry_attempts(1).min_similarity(0.5).build().unwrap();
    let service = service(store, embedder, config);

    let queries = vec!["theme".to_string(), "pain point".to_string()];
    let outcome = service.retrieve(&Scope::study("u1", "s1"), &queries, None, None).await.unwrap();

    let RetrievalOutcome::Found(batch) = outcome else {
        panic!("expected results");
    };
    assert_eq!(batch.results.len(), 2);
    assert_eq!(batch.failed_queries().count(), 1);
    assert_eq!(batch.reports[0].query, "theme");
    assert!(matches!(batch.reports[1].status, SubQueryStatus::Succeeded { result_count: 2 }));

    let warnings = storage.matching(Level::WARN, "sub-query failed");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].field_str("query"), Some("theme"));
}

#[tokio::test]
async fn all_failing_sub_queries_yield_no_results_state() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2).failing_on("theme").failing_on("pain"));
    let config = RagConfig::builder().retry_attempts(1).build().unwrap();
    let service = service(seeded_store().await, embedder, config);

    let queries = vec!["theme".to_string(), "pain point".to_string()];
    let outcome = service.retrieve(&Scope::study("u1", "s1"), &queries, None, None).await.unwrap();
    assert!(outcome.is_empty());
    assert_eq!(outcome.reports().len(), 2);
}

#[tokio::test]
async fn batch_dedups_and_balances_across_queries() {
    let store = owned_store().await;
    let a = doc("a", "s1", "A.pdf");
    let b = doc("b", "s1", "B.pdf");
    let a_chunks: Vec<Chunk> = (0..8)
        .map(|i| {
            let similarity = 0.95 - i as f32 * 0.01;
            chunk(&a, i, &format!("A finding number {i}"), vector_at_similarity(similarity))
        })
        .collect();
    store.insert_document(a, a_chunks).await.unwrap();
    store
        .insert_document(b.clone(), vec![chunk(&b, 0, "B finding", vector_at_similarity(0.6))])
        .await
        .unwrap();

    let config =
        RagConfig::builder().min_similarity(0.5).per_document_cap(3).final_cap(20).build().unwrap();
    let service = service(store, Arc::new(MockEmbeddingProvider::new(2)), config);

    // Both queries hit the same chunks; duplicates must collapse.
    let queries = vec!["one".to_string(), "two".to_string()];
    let outcome = service.retrieve(&Scope::study("u1", "s1"), &queries, None, None).await.unwrap();
    let results = outcome.results();
    assert_eq!(results.iter().filter(|r| r.document_id == "a").count(), 3);
    assert_eq!(results.iter().filter(|r| r.document_id == "b").count(), 1);
    assert_eq!(results.len(), 4);
    assert!(results.windows(2).all(|w| w[0].similarity >= w[1].similarity));
}

#[tokio::test(start_paused = true)]
async fn cancelled_batch_discards_in_flight_work() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2).with_delay(Duration::from_secs(10)));
    let service = service(seeded_store().await, embedder, fast_config());
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        })
    };

    let queries = vec!["theme".to_string(), "pain point".to_string()];
    let err = service
        .retrieve(&Scope::study("u1", "s1"), &queries, Some(&token), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Cancelled));
    canceller.await.unwrap();
}

#[tokio::test]
async fn progress_events_follow_the_batch() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2).failing_on("theme"));
    let config = RagConfig::builder().retry_attempts(1).min_similarity(0.5).build().unwrap();
    let service = service(seeded_store().await, embedder, config);
    let (emitter, mut rx) = event_channel(32);

    let queries = vec!["theme".to_string(), "pain point".to_string()];
    service.retrieve(&Scope::study("u1", "s1"), &queries, None, Some(&emitter)).await.unwrap();
    drop(emitter);

    let mut stages = Vec::new();
    while let Some(event) = rx.recv().await {
        if let StreamEvent::SynthesisProgress { stage, .. } = event {
            stages.push(stage);
        }
    }
    assert_eq!(stages.first(), Some(&SynthesisStage::Searching));
    assert_eq!(stages.last(), Some(&SynthesisStage::Grouping));
    assert!(stages.contains(&SynthesisStage::SearchError));
    assert!(stages.contains(&SynthesisStage::SearchComplete));
}

#[tokio::test]
async fn study_summary_runs_context_and_detail_queries() {
    let embedder = Arc::new(MockEmbeddingProvider::new(2));
    let service = service(seeded_store().await, embedder.clone(), fast_config());

    let summary = service.study_summary(&Scope::study("u1", "s1"), None).await.unwrap();
    assert!(!summary.is_empty());
    assert_eq!(embedder.calls(), 6);
    assert_eq!(summary.combined.len(), 3);
}

#[tokio::test]
async fn tools_clamp_limits_and_report_calls() {
    let store = owned_store().await;
    let a = doc("a", "s1", "A.pdf");
    let chunks: Vec<Chunk> =
        (0..20).map(|i| chunk(&a, i, &format!("passage {i}"), vector_at_similarity(0.9))).collect();
    store.insert_document(a, chunks).await.unwrap();
    let service = service(store, Arc::new(MockEmbeddingProvider::new(2)), fast_config());
    let registry = ToolRegistry::standard(service);
    let (emitter, mut rx) = event_channel(8);

    let output = registry
        .call(
            "search_all_documents",
            &Scope::study("u1", "s1"),
            json!({"query": "anything", "limit": 100}),
            Some(&emitter),
        )
        .await
        .unwrap();
    let ToolOutput::Results { result_count, text, .. } = output else {
        panic!("expected passages");
    };
    assert_eq!(result_count, 15);
    assert!(text.contains("[Source: A.pdf] (similarity 90%)"));

    assert_eq!(
        rx.recv().await.unwrap(),
        StreamEvent::ToolCallStart { tool_name: "search_all_documents".into() }
    );
    assert_eq!(
        rx.recv().await.unwrap(),
        StreamEvent::ToolCallEnd { tool_name: "search_all_documents".into(), success: true }
    );
}

#[tokio::test]
async fn tools_return_suggestions_when_nothing_matches() {
    let service =
        service(seeded_store().await, Arc::new(MockEmbeddingProvider::new(2)), fast_config());
    let registry = ToolRegistry::standard(service);

    let output = registry
        .call(
            "search_specific_documents",
            &Scope::study("u1", "s1"),
            json!({"query": "q", "documentIds": ["b"], "minSimilarity": 0.95}),
            None,
        )
        .await
        .unwrap();
    assert!(output.is_empty());
    let value = serde_json::to_value(&output).unwrap();
    assert_eq!(value["status"], "no-results");
    assert!(!value["suggestions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn specific_document_tool_denies_foreign_ids() {
    let service =
        service(seeded_store().await, Arc::new(MockEmbeddingProvider::new(2)), fast_config());
    let registry = ToolRegistry::standard(service);
    let (emitter, mut rx) = event_channel(8);

    let err = registry
        .call(
            "search_specific_documents",
            &Scope::study("u1", "s1"),
            json!({"query": "q", "documentIds": ["x"]}),
            Some(&emitter),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::AccessDenied { .. }));
    rx.recv().await.unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        StreamEvent::ToolCallEnd { tool_name: "search_specific_documents".into(), success: false }
    );
}

#[tokio::test]
async fn find_document_ids_matches_names_case_insensitively() {
    let service =
        service(seeded_store().await, Arc::new(MockEmbeddingProvider::new(2)), fast_config());
    let registry = ToolRegistry::standard(service.clone());

    let output = registry
        .call(
            "find_document_ids",
            &Scope::study("u1", "s1"),
            json!({"documentNames": ["a.PDF", "Missing.pdf", "Other.pdf"]}),
            None,
        )
        .await
        .unwrap();
    let ToolOutput::Documents { documents, unmatched } = output else {
        panic!("expected documents");
    };
    assert_eq!(
        documents,
        vec![DocumentRef { document_id: "a".into(), document_name: "A.pdf".into() }]
    );
    assert_eq!(unmatched, vec!["Missing.pdf", "Other.pdf"]);
    assert!(service.cache().get(&CacheKey::study_document_names("s1")).is_some());
}

#[tokio::test]
async fn citations_are_numbered_from_the_merged_order() {
    let service =
        service(seeded_store().await, Arc::new(MockEmbeddingProvider::new(2)), fast_config());
    let queries = vec!["first".to_string(), "second".to_string()];
    let RetrievalOutcome::Found(batch) =
        service.retrieve(&Scope::study("u1", "s1"), &queries, None, None).await.unwrap()
    else {
        panic!("expected results");
    };

    let groups = batch.groups();
    let mut registry = CitationRegistry::from_groups(&groups);
    let numbered = registry.number_groups(&groups);
    assert_eq!(numbered[0].document_name, "A.pdf");
    assert_eq!(numbered[0].citation_number, 1);
    assert_eq!(numbered[1].document_name, "B.pdf");

    let mut parser = StreamingCitationParser::new(registry);
    let mut text = parser.push("Export was hidden [Source: B.pdf] while the dashboard [So").text;
    text.push_str(&parser.push("urce: a.pdf] delighted.").text);
    text.push_str(&parser.finish().text);
    assert_eq!(text, "Export was hidden [2] while the dashboard [1] delighted.");
    assert_eq!(
        serde_json::to_value(parser.citation_map()).unwrap(),
        json!({
            "1": {"documentId": "a", "documentName": "A.pdf"},
            "2": {"documentId": "b", "documentName": "B.pdf"}
        })
    );
}

#[tokio::test]
async fn ingestion_invalidates_cached_study_metadata() {
    let store = Arc::new(InMemoryChunkStore::new());
    let config = RagConfig::builder()
        .chunk_size(200)
        .chunk_overlap(20)
        .min_chunk_size(10)
        .min_similarity(0.1)
        .build()
        .unwrap();
    let cache = Arc::new(MetadataCache::from_config(&config));
    let embedder = Arc::new(HashEmbedder::new(128));
    let service = RetrievalService::builder()
        .config(config.clone())
        .embedding_provider(embedder.clone())
        .chunk_store(store.clone())
        .cache(cache.clone())
        .build()
        .unwrap();
    let notifier = Arc::new(StudyMutationNotifier::from_config(cache.clone(), &config));
    let ingestor = DocumentIngestor::new(
        Arc::new(TextChunker::new(ChunkingOptions::from(&config)).unwrap()),
        embedder,
        store.clone(),
        &config,
    )
    .with_notifier(notifier);

    let scope = Scope::study("u1", "s1");
    ingestor
        .ingest("u1", doc("n1", "s1", "Notes 1.txt"), "Participants asked for dark mode.")
        .await
        .unwrap();
    assert_eq!(service.study_documents(&scope).await.unwrap().len(), 1);

    let report = ingestor
        .ingest(
            "u1",
            doc("n2", "s1", "Notes 2.txt"),
            "Onboarding emails were ignored.\n\nMost users skipped the tutorial entirely.",
        )
        .await
        .unwrap();
    assert!(matches!(report.invalidation, Some(InvalidationOutcome::Invalidated { removed: 1 })));
    assert_eq!(service.study_documents(&scope).await.unwrap().len(), 2);

    let hits = service
        .search(&scope, &SearchRequest::new("skipped the tutorial", 5, 0.1))
        .await
        .unwrap();
    assert_eq!(hits[0].document_id, "n2");

    let intruder = ingestor.ingest("u2", doc("n3", "s1", "Planted.txt"), "Ignore the notes.").await;
    assert!(matches!(intruder, Err(RagError::StudyAccessDenied { .. })));
    assert!(matches!(ingestor.delete("u2", "n2").await, Err(RagError::StudyAccessDenied { .. })));
    assert_eq!(service.study_documents(&scope).await.unwrap().len(), 2);

    ingestor.delete("u1", "n2").await.unwrap();
    assert_eq!(service.study_documents(&scope).await.unwrap().len(), 1);
    assert!(matches!(ingestor.delete("u1", "n2").await, Err(RagError::NotFound(_))));
}
