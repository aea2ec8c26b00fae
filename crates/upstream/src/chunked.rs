//! Sequential chunked fetching.
//!
//! A large identifier list is cut into chunks that fit the endpoint's limits
//! and fetched one chunk at a time, with a pause in between. Each completed
//! chunk is handed to a [`ChunkSink`] straight away, so a fetch that fails
//! halfway still leaves its earlier chunks published.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use urlencoding::encode;

use crate::errors::UpstreamError;
use crate::models::Payloads;
use crate::request::FetchMode;

fn default_chunk_size() -> usize {
    250
}

fn default_max_ids_len() -> usize {
    2000
}

fn default_chunk_delay_ms() -> u64 {
    1000
}

/// Chunk limits and pacing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Most identifiers per batch request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Longest comma-joined identifier list per batch request.
    #[serde(default = "default_max_ids_len")]
    pub max_ids_len: usize,
    /// Pause between chunks. Zero disables it.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_ids_len: default_max_ids_len(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

/// Fetches one chunk of identifiers from the upstream.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Whether chunks may hold many identifiers.
    fn mode(&self) -> FetchMode;

    /// Fetch `ids` in a single logical request. A single-mode client is only
    /// ever given one identifier.
    async fn fetch_chunk(
        &self,
        cancel: &CancellationToken,
        ids: &[String],
    ) -> Result<Payloads, UpstreamError>;
}

/// Receives each chunk as soon as it has been fetched.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn on_chunk(&self, chunk: &Payloads);
}

/// A sink that drops everything.
pub struct NoopSink;

#[async_trait]
impl ChunkSink for NoopSink {
    async fn on_chunk(&self, _chunk: &Payloads) {}
}

/// Split `ids` into request-sized chunks.
///
/// Single mode yields one identifier per chunk. Batch mode closes a chunk when
/// it reaches `chunk_size` or when adding the next identifier would push the
/// comma-joined length over `max_ids_len`. Lengths are measured after
/// percent-encoding, as the ids appear in the request URL. An identifier
/// longer than the length budget on its own still gets a chunk of its own.
pub fn plan_chunks<'a>(
    ids: &'a [String],
    mode: FetchMode,
    config: &ChunkConfig,
) -> Vec<&'a [String]> {
    if ids.is_empty() {
        return Vec::new();
    }
    if mode == FetchMode::Single {
        return ids.chunks(1).collect();
    }

    let chunk_size = config.chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut joined_len = 0;

    for (i, id) in ids.iter().enumerate() {
        let id_len = encode(id).len();
        let count = i - start;
        let added = if count == 0 { id_len } else { id_len + 1 };
        if count > 0 && (count >= chunk_size || joined_len + added > config.max_ids_len) {
            chunks.push(&ids[start..i]);
            start = i;
            joined_len = id_len;
        } else {
            joined_len += added;
        }
    }
    chunks.push(&ids[start..]);
    chunks
}

/// Drives a [`BatchClient`] over a whole identifier list.
#[derive(Clone)]
pub struct ChunkedFetcher {
    client: Arc<dyn BatchClient>,
    config: ChunkConfig,
}

impl ChunkedFetcher {
    pub fn new(client: Arc<dyn BatchClient>, config: ChunkConfig) -> Self {
        Self { client, config }
    }

    pub fn mode(&self) -> FetchMode {
        self.client.mode()
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Fetch every identifier in `ids`, chunk by chunk.
    ///
    /// Chunks run strictly one after another. The first failing chunk aborts
    /// the fetch with [`UpstreamError::ChunkFailed`]; chunks already passed to
    /// `sink` stay there. The returned map only exists for a fully successful
    /// run.
    pub async fn fetch_data(
        &self,
        cancel: &CancellationToken,
        ids: &[String],
        sink: &dyn ChunkSink,
    ) -> Result<Payloads, UpstreamError> {
        let chunks = plan_chunks(ids, self.mode(), &self.config);
        let total = chunks.len();
        let delay = Duration::from_millis(self.config.chunk_delay_ms);
        let mut data = Payloads::with_capacity(ids.len());

        if total > 1 {
            info!("Fetching {} ids in {} chunks", ids.len(), total);
        }

        for (index, chunk) in chunks.into_iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let fetched = match self.client.fetch_chunk(cancel, chunk).await {
                Ok(fetched) => fetched,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        "Chunk {}/{} ({} ids) failed: {}",
                        index + 1,
                        total,
                        chunk.len(),
                        e
                    );
                    return Err(UpstreamError::ChunkFailed {
                        index: index + 1,
                        total,
                        ids: chunk.len(),
                        source: Box::new(e),
                    });
                }
            };

            debug!(
                "Chunk {}/{}: {} of {} ids returned",
                index + 1,
                total,
                fetched.len(),
                chunk.len()
            );
            sink.on_chunk(&fetched).await;
            data.extend(fetched);
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("coin-{}", i)).collect()
    }

    fn config(chunk_size: usize, max_ids_len: usize) -> ChunkConfig {
        ChunkConfig {
            chunk_size,
            max_ids_len,
            chunk_delay_ms: 0,
        }
    }

    /// Echoes every requested id back, optionally failing one call.
    struct MockClient {
        mode: FetchMode,
        fail_on_call: Option<usize>,
        calls: AtomicUsize,
        requested: Mutex<Vec<Vec<String>>>,
    }

    impl MockClient {
        fn new(mode: FetchMode, fail_on_call: Option<usize>) -> Self {
            Self {
                mode,
                fail_on_call,
                calls: AtomicUsize::new(0),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BatchClient for MockClient {
        fn mode(&self) -> FetchMode {
            self.mode
        }

        async fn fetch_chunk(
            &self,
            _cancel: &CancellationToken,
            ids: &[String],
        ) -> Result<Payloads, UpstreamError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(ids.to_vec());
            if self.fail_on_call == Some(call) {
                return Err(UpstreamError::Status {
                    status: 500,
                    body: String::new(),
                });
            }
            Ok(ids
                .iter()
                .map(|id| (id.clone(), Bytes::from(format!("{{\"id\":\"{}\"}}", id))))
                .collect())
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        chunks: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ChunkSink for CollectingSink {
        async fn on_chunk(&self, chunk: &Payloads) {
            self.chunks.lock().unwrap().push(chunk.len());
        }
    }

    #[test]
    fn test_plan_single_mode() {
        let input = ids(3);
        let chunks = plan_chunks(&input, FetchMode::Single, &config(250, 2000));
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn test_plan_respects_length_budget() {
        let input: Vec<String> = vec!["aaaa".into(), "bbbb".into(), "cccc".into()];
        // "aaaa,bbbb" is 9 chars; adding ",cccc" would make 14
        let chunks = plan_chunks(&input, FetchMode::Batch, &config(250, 10));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[1].len(), 1);
    }

    #[test]
    fn test_plan_budget_counts_encoded_length() {
        let input: Vec<String> = vec!["a b c".into(), "d e f".into()];
        // Each encodes to "a%20b%20c" (9 chars), so both together need 19
        let chunks = plan_chunks(&input, FetchMode::Batch, &config(250, 11));
        assert_eq!(chunks.len(), 2);

        let chunks = plan_chunks(&input, FetchMode::Batch, &config(250, 19));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_plan_oversized_id_gets_own_chunk() {
        let input: Vec<String> = vec!["a".into(), "x".repeat(50), "b".into()];
        let chunks = plan_chunks(&input, FetchMode::Batch, &config(250, 10));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1][0].len(), 50);
    }

    #[test]
    fn test_plan_empty() {
        assert!(plan_chunks(&[], FetchMode::Batch, &ChunkConfig::default()).is_empty());
    }

    proptest! {
        #[test]
        fn prop_chunk_count_is_ceil(n in 0usize..2000, size in 1usize..300) {
            let input = ids(n);
            let chunks = plan_chunks(&input, FetchMode::Batch, &config(size, usize::MAX));

            prop_assert_eq!(chunks.len(), n.div_ceil(size));
            prop_assert!(chunks.iter().all(|c| c.len() <= size));
            let flattened: Vec<&String> = chunks.iter().flat_map(|c| c.iter()).collect();
            prop_assert_eq!(flattened.len(), n);
        }

        #[test]
        fn prop_joined_length_within_budget(
            input in prop::collection::vec("[a-z0-9 &/-]{1,12}", 1..300),
            budget in 20usize..400,
        ) {
            let chunks = plan_chunks(&input, FetchMode::Batch, &config(250, budget));
            for chunk in chunks {
                let joined = chunk
                    .iter()
                    .map(|id| encode(id).into_owned())
                    .collect::<Vec<_>>()
                    .join(",");
                prop_assert!(chunk.len() == 1 || joined.len() <= budget);
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_data_sinks_every_chunk() {
        let client = Arc::new(MockClient::new(FetchMode::Batch, None));
        let fetcher = ChunkedFetcher::new(client.clone(), config(2, 2000));
        let sink = CollectingSink::default();

        let data = fetcher
            .fetch_data(&CancellationToken::new(), &ids(5), &sink)
            .await
            .unwrap();

        assert_eq!(data.len(), 5);
        assert_eq!(*sink.chunks.lock().unwrap(), vec![2, 2, 1]);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_chunk_aborts_but_keeps_sunk_data() {
        let client = Arc::new(MockClient::new(FetchMode::Batch, Some(1)));
        let fetcher = ChunkedFetcher::new(client.clone(), config(2, 2000));
        let sink = CollectingSink::default();

        let result = fetcher
            .fetch_data(&CancellationToken::new(), &ids(6), &sink)
            .await;

        match result {
            Err(UpstreamError::ChunkFailed { index, total, ids, .. }) => {
                assert_eq!((index, total, ids), (2, 3, 2));
            }
            other => panic!("expected ChunkFailed, got {:?}", other),
        }
        // First chunk reached the sink, the third was never requested
        assert_eq!(*sink.chunks.lock().unwrap(), vec![2]);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_requests() {
        let client = Arc::new(MockClient::new(FetchMode::Batch, None));
        let fetcher = ChunkedFetcher::new(client.clone(), ChunkConfig::default());

        let data = fetcher
            .fetch_data(&CancellationToken::new(), &[], &NoopSink)
            .await
            .unwrap();

        assert!(data.is_empty());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_delay_between_chunks() {
        let client = Arc::new(MockClient::new(FetchMode::Single, None));
        let fetcher = ChunkedFetcher::new(
            client,
            ChunkConfig {
                chunk_delay_ms: 1000,
                ..ChunkConfig::default()
            },
        );

        let start = tokio::time::Instant::now();
        fetcher
            .fetch_data(&CancellationToken::new(), &ids(3), &NoopSink)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay() {
        let client = Arc::new(MockClient::new(FetchMode::Single, None));
        let fetcher = ChunkedFetcher::new(
            client.clone(),
            ChunkConfig {
                chunk_delay_ms: 60_000,
                ..ChunkConfig::default()
            },
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = fetcher.fetch_data(&cancel, &ids(3), &NoopSink).await;
        assert!(matches!(result, Err(UpstreamError::Cancelled)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }
}
