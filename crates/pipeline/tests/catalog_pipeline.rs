mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{FakeProvider, eventually};
use ingest_pipeline::catalog::{
    CHUNKING, IMAGE_PROCESSING, PRODUCT_DETECTION, RELATIONSHIP_BUILDING,
};
use ingest_pipeline::{
    ContentFilter, ContentKind, ContentStore, FanInPolling, InMemoryContentStore,
    InMemoryJobStore, InMemoryTaskStore, Job, JobInput, JobStatus, PipelineConfig,
    PipelineRuntime, RetryPolicy,
};

fn config() -> PipelineConfig {
    PipelineConfig {
        heartbeat_interval: Duration::from_millis(50),
        stuck_threshold: Duration::from_secs(10),
        monitor_interval: Duration::from_millis(50),
        task_retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
        stage_retry: RetryPolicy::fixed(3, Duration::from_millis(10)),
        fan_in: FanInPolling {
            initial: Duration::from_millis(2),
            max: Duration::from_millis(20),
        },
        worker_poll_interval: Duration::from_millis(2),
        max_chunk_chars: 40,
        ..PipelineConfig::default()
    }
}

fn catalog_pages() -> serde_json::Value {
    json!([
        {
            "number": 2,
            "text": "FOLD table collection.\n\nSolid oak top with powder-coated steel legs.",
            "images": [{ "key": "img-3", "uri": "s3://catalog/fold.png" }]
        },
        {
            "number": 1,
            "text": "VALENOVA tiles in matte porcelain.\n\nAvailable in 60x60 and 120x60.",
            "images": [
                { "key": "img-1", "uri": "s3://catalog/valenova.png" },
                { "key": "img-2", "uri": "s3://catalog/broken.png" },
                { "key": "img-4", "uri": "s3://catalog/beat.png" }
            ]
        }
    ])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn catalog_document_is_ingested_end_to_end() {
    let provider = Arc::new(FakeProvider {
        pages: catalog_pages(),
        fatal_uris: HashSet::from(["s3://catalog/broken.png".to_string()]),
        ..Default::default()
    });
    let content = InMemoryContentStore::arc();
    let runtime = PipelineRuntime::catalog(
        &config(),
        InMemoryJobStore::arc(),
        InMemoryTaskStore::arc(),
        provider.clone(),
        content.clone(),
    )
    .unwrap();
    let handle = runtime.start().await.unwrap();
    let orch = handle.orchestrator().clone();

    let job_id = orch.submit(JobInput::new("catalogs/harmony-2024.pdf")).await.unwrap();
    let poll = orch.clone();
    eventually(Duration::from_secs(10), || {
        let orch = poll.clone();
        async move { orch.get_status(job_id).await.unwrap().status.is_terminal() }
    })
    .await;

    let status = orch.get_status(job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.progress_percent, 100);
    assert!(status.completed_with_warnings);
    assert_eq!(status.failed_items, 1);

    let job = orch.get_job(job_id).await.unwrap();
    assert_eq!(
        job.report.stage(IMAGE_PROCESSING).unwrap().summary.as_deref(),
        Some("3/4 images embedded, 1 dead-lettered")
    );
    assert_eq!(
        job.report.stage(IMAGE_PROCESSING).unwrap().failed_item_ids,
        vec!["p1-img-2".to_string()]
    );
    assert_eq!(job.report.stage(CHUNKING).unwrap().processed, 4);
    assert_eq!(
        job.report.stage(CHUNKING).unwrap().summary.as_deref(),
        Some("4 chunks stored; 4/4 chunks embedded")
    );
    // Short catalog lines never qualify as product text.
    assert_eq!(
        job.report.stage(PRODUCT_DETECTION).unwrap().summary.as_deref(),
        Some("4 chunks classified, 0 product candidates; 0 products stored")
    );

    let kinds = |kind| {
        let content = content.clone();
        async move { content.query(ContentFilter::default().kind(kind)).await.unwrap() }
    };
    assert_eq!(kinds(ContentKind::Chunk).await.len(), 4);
    assert_eq!(kinds(ContentKind::Image).await.len(), 3);
    // Three image embeddings and one per chunk.
    assert_eq!(kinds(ContentKind::Embedding).await.len(), 3 + 4);
    assert!(kinds(ContentKind::Product).await.is_empty());

    // Two chunks per page; page 1 kept two images, page 2 one.
    let relationships = kinds(ContentKind::Relationship).await;
    assert_eq!(relationships.len(), 2 * 2 + 2);
    assert_eq!(
        job.report.stage(RELATIONSHIP_BUILDING).unwrap().processed,
        relationships.len()
    );
    let labelled = content
        .query(ContentFilter::for_job(job_id).kind(ContentKind::Relationship))
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.body["confidence"].as_f64().unwrap() > 0.5)
        .count();
    assert_eq!(labelled, 2);

    assert_eq!(provider.calls("extract_document"), 1);
    assert_eq!(provider.calls("embed_text"), 4);
    handle.shutdown().await;
}

/// Submit one document, wait for it to finish and return the final job.
async fn ingest(
    config: &PipelineConfig,
    provider: Arc<FakeProvider>,
    content: Arc<InMemoryContentStore>,
) -> Job {
    let runtime = PipelineRuntime::catalog(
        config,
        InMemoryJobStore::arc(),
        InMemoryTaskStore::arc(),
        provider,
        content,
    )
    .unwrap();
    let handle = runtime.start().await.unwrap();
    let orch = handle.orchestrator().clone();

    let job_id = orch.submit(JobInput::new("catalogs/harmony-2024.pdf")).await.unwrap();
    let poll = orch.clone();
    eventually(Duration::from_secs(10), || {
        let orch = poll.clone();
        async move { orch.get_status(job_id).await.unwrap().status.is_terminal() }
    })
    .await;
    let job = orch.get_job(job_id).await.unwrap();
    handle.shutdown().await;
    job
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn image_keys_are_scoped_to_their_page() {
    // Extractors number images per page, so `img-0` shows up on both pages.
    let provider = Arc::new(FakeProvider {
        pages: json!([
            {
                "number": 1,
                "text": "Oak dining table.",
                "images": [{ "key": "img-0", "uri": "s3://catalog/table.png" }]
            },
            {
                "number": 2,
                "text": "Steel lounge chair.",
                "images": [{ "key": "img-0", "uri": "s3://catalog/chair.png" }]
            }
        ]),
        ..Default::default()
    });
    let content = InMemoryContentStore::arc();
    let job = ingest(&config(), provider.clone(), content.clone()).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(provider.calls("analyze_image"), 2);
    assert_eq!(
        job.report.stage(IMAGE_PROCESSING).unwrap().summary.as_deref(),
        Some("2/2 images embedded")
    );

    let images = content
        .query(ContentFilter::for_job(job.id).kind(ContentKind::Image))
        .await
        .unwrap();
    let uris: HashSet<_> = images
        .iter()
        .map(|i| i.body["uri"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        uris,
        HashSet::from(["s3://catalog/table.png".to_string(), "s3://catalog/chair.png".to_string()])
    );

    // Each chunk links to the image on its own page only.
    let relationships = content
        .query(ContentFilter::for_job(job.id).kind(ContentKind::Relationship))
        .await
        .unwrap();
    assert_eq!(relationships.len(), 2);
    let targets: HashSet<_> = relationships
        .iter()
        .map(|r| r.body["target_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(targets, images.iter().map(|i| i.id.clone()).collect());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn product_pages_are_enriched_into_products() {
    let provider = Arc::new(FakeProvider {
        pages: json!([
            {
                "number": 1,
                "text": "INDEX\nSignature book\nSustainability 8\nFOLD 6\nBEAT 8\nVALENOVA 23\n\
                    PIQUÉ 38\nONA 52\nMARE 66\nLOG 74",
                "images": []
            },
            {
                "number": 23,
                "text": "39661  VALENOVA TAUPE LT/11,8X11,8\n\
                    Q59 (11,8x11,8 cm − 4[5/8]x4[5/8]\")\n\
                    12 patterns · ** 43 Kerakoll\n\
                    39660  VALENOVA SAND LT/11,8X11,8\n\
                    Q59 (11,8x11,8 cm − 4[5/8]x4[5/8]\")\n\
                    39658  VALENOVA WHITE LT/11,8X11,8\n\
                    by Stacy Garcia NY",
                "images": []
            },
            {
                "number": 38,
                "text": "PIQUÉ\nby Estudi{H}ac\n\n\
                    PIQUÉ, a new collection for HARMONY by José Manuel Ferrero from design \
                    studio estudi{H}ac, is inspired by an 18th century technique for weaving \
                    double cloth.",
                "images": []
            }
        ]),
        rejected_products: HashSet::from(["PIQUÉ".to_string()]),
        ..Default::default()
    });
    let content = InMemoryContentStore::arc();
    let config = PipelineConfig {
        max_chunk_chars: 1000,
        ..config()
    };
    let job = ingest(&config, provider.clone(), content.clone()).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(provider.calls("enrich_product"), 2);
    assert_eq!(
        job.report.stage(PRODUCT_DETECTION).unwrap().summary.as_deref(),
        Some("3 chunks classified, 2 product candidates; 1 products stored")
    );

    let products = content
        .query(ContentFilter::for_job(job.id).kind(ContentKind::Product))
        .await
        .unwrap();
    assert_eq!(products.len(), 1);
    let product = &products[0].body;
    assert_eq!(product["name"], "VALENOVA");
    assert_eq!(product["page"], 23);
    assert_eq!(product["metadata"]["designer"], "Stacy Garcia NY");
    assert_eq!(product["metadata"]["colors"], json!(["SAND", "TAUPE", "WHITE"]));
    assert_eq!(product["metadata"]["source"], "fake");
}

#[tokio::test]
async fn malformed_extraction_output_fails_the_job() {
    let provider = Arc::new(FakeProvider {
        pages: json!("not a page list"),
        ..Default::default()
    });
    let runtime = PipelineRuntime::catalog(
        &config(),
        InMemoryJobStore::arc(),
        InMemoryTaskStore::arc(),
        provider,
        InMemoryContentStore::arc(),
    )
    .unwrap();
    let orch = runtime.orchestrator().clone();
    let handle = runtime.start().await.unwrap();

    let job_id = orch.submit(JobInput::new("catalogs/broken.pdf")).await.unwrap();
    let poll = orch.clone();
    eventually(Duration::from_secs(5), || {
        let orch = poll.clone();
        async move { orch.get_status(job_id).await.unwrap().status.is_terminal() }
    })
    .await;

    let status = orch.get_status(job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    assert!(status.error.unwrap().contains("malformed extraction output"));
    assert_eq!(status.progress_percent, 0);
    handle.shutdown().await;
}
