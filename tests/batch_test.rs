//! `BatchProcessor` flushing, caching and failure fan-out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use tollgate::{
    BatchConfig, BatchProcessor, CacheConfig, MemoryStore, RequestScheduler, SchedulerConfig,
    TieredCache, TollgateError,
};

/// Inputs of every handler invocation, in order.
type Calls = Arc<Mutex<Vec<Vec<u32>>>>;

fn scheduler() -> Arc<RequestScheduler> {
    Arc::new(RequestScheduler::new(SchedulerConfig::default()).unwrap())
}

fn cache() -> Arc<TieredCache> {
    Arc::new(TieredCache::new(
        "batch",
        CacheConfig::new(),
        Arc::new(MemoryStore::unbounded()),
    ))
}

/// Processor whose handler multiplies every input by ten.
fn times_ten(config: BatchConfig, cache: Arc<TieredCache>) -> (BatchProcessor<u32, u32>, Calls) {
    let calls: Calls = Arc::default();
    let recorded = Arc::clone(&calls);
    let processor = BatchProcessor::new(config, scheduler(), cache, move |inputs: Vec<u32>| {
        let recorded = Arc::clone(&recorded);
        async move {
            recorded.lock().unwrap().push(inputs.clone());
            Ok(inputs.into_iter().map(|x| x * 10).collect())
        }
    });
    (processor, calls)
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_immediately() {
    let config = BatchConfig::new("LEAD_SCORING", 3, Duration::from_secs(60));
    let (processor, calls) = times_ten(config, cache());
    let start = Instant::now();

    let (a, b, c) = tokio::join!(
        processor.add("score_a", 1),
        processor.add("score_b", 2),
        processor.add("score_c", 3),
    );

    assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (10, 20, 30));
    assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2, 3]]);
    assert!(start.elapsed() < Duration::from_secs(60));
    assert_eq!(processor.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn partial_batch_flushes_after_max_wait() {
    let config = BatchConfig::new("CNPJ_VALIDATOR", 10, Duration::from_millis(2500));
    let (processor, calls) = times_ten(config, cache());
    let start = Instant::now();

    let (a, b) = tokio::join!(processor.add("cnpj_1", 1), processor.add("cnpj_2", 2));

    assert_eq!((a.unwrap(), b.unwrap()), (10, 20));
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert!(start.elapsed() >= Duration::from_millis(2500));
}

#[tokio::test(start_paused = true)]
async fn outputs_are_cached_per_item() {
    let cache = cache();
    let config = BatchConfig::new("CNPJ_VALIDATOR", 2, Duration::from_secs(1));
    let (processor, calls) = times_ten(config, Arc::clone(&cache));

    let (a, b) = tokio::join!(processor.add("cnpj_1", 1), processor.add("cnpj_2", 2));
    a.unwrap();
    b.unwrap();

    // served from the cache without another batch
    assert_eq!(processor.add("cnpj_1", 1).await.unwrap(), 10);
    assert_eq!(calls.lock().unwrap().len(), 1);

    // every stored output is tagged with the processor name
    assert_eq!(cache.invalidate_by_tag("CNPJ_VALIDATOR").await, 2);
}

#[tokio::test(start_paused = true)]
async fn missing_outputs_reject_their_items() {
    let config = BatchConfig::new("DATA_ENRICHMENT", 3, Duration::from_secs(3));
    let processor: BatchProcessor<u32, u32> =
        BatchProcessor::new(config, scheduler(), cache(), |mut inputs: Vec<u32>| async move {
            // drops the last input
            inputs.pop();
            Ok(inputs)
        });

    let (a, b, c) = tokio::join!(
        processor.add("enrich_a", 1),
        processor.add("enrich_b", 2),
        processor.add("enrich_c", 3),
    );

    assert_eq!(a.unwrap(), 1);
    assert_eq!(b.unwrap(), 2);
    assert!(matches!(c, Err(TollgateError::BatchItemMissing)));
}

#[tokio::test(start_paused = true)]
async fn failed_batch_rejects_every_item() {
    let config = BatchConfig::new("LEAD_SCORING", 2, Duration::from_secs(1));
    let processor: BatchProcessor<u32, u32> =
        BatchProcessor::new(config, scheduler(), cache(), |_inputs: Vec<u32>| async {
            Err(TollgateError::Api {
                status: 400,
                message: "response was not valid JSON".into(),
            })
        });

    let (a, b) = tokio::join!(processor.add("a", 1), processor.add("b", 2));

    for result in [a, b] {
        match result {
            Err(TollgateError::BatchFailed { processor: name, message }) => {
                assert_eq!(name, "LEAD_SCORING");
                assert!(message.contains("400"));
            }
            other => panic!("expected BatchFailed, got {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn consecutive_batches_do_not_mix() {
    let config = BatchConfig::new("LEAD_SCORING", 2, Duration::from_millis(1500));
    let (processor, calls) = times_ten(config, cache());

    let (a, b, c) = tokio::join!(
        processor.add("a", 1),
        processor.add("b", 2),
        processor.add("c", 3),
    );
    assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (10, 20, 30));
    assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2], vec![3]]);
}
