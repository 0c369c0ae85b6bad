//! End-to-end test infrastructure for the Papr retrieval core.
//!
//! Provides a shared TestHarness plus helpers for seeding stores and building
//! clients against in-process fakes.

use std::sync::Arc;
use std::time::Duration;

use papr_client::PaprClient;
use papr_embeddings::MockEmbedder;
use papr_sync::{memory_metadata, MemoryApi};
use papr_types::{Memory, Settings, Tier};
use papr_vector::VectorStore;

/// Small dimension keeps the fixtures readable.
pub const TEST_DIM: usize = 4;

pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub settings: Settings,
}

impl TestHarness {
    /// Settings rooted in a temp dir: on-device forced on, metrics off, no
    /// model files.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let settings = Settings {
            data_dir: temp_dir.path().to_path_buf(),
            embedding_dim: TEST_DIM,
            ondevice_processing: Some(true),
            enable_metrics: false,
            enable_coreml: false,
            ..Default::default()
        };
        Self {
            _temp_dir: temp_dir,
            settings,
        }
    }

    /// Local-only client for `user_id`, ready on return.
    pub async fn client(&self, user_id: &str, embedder: Option<Arc<MockEmbedder>>) -> PaprClient {
        self.build(user_id, embedder, None).await
    }

    /// Client backed by `remote`, ready on return.
    pub async fn client_with_remote(
        &self,
        user_id: &str,
        embedder: Option<Arc<MockEmbedder>>,
        remote: Arc<dyn MemoryApi>,
    ) -> PaprClient {
        self.build(user_id, embedder, Some(remote)).await
    }

    async fn build(
        &self,
        user_id: &str,
        embedder: Option<Arc<MockEmbedder>>,
        remote: Option<Arc<dyn MemoryApi>>,
    ) -> PaprClient {
        let mut builder = PaprClient::builder()
            .settings(self.settings.clone())
            .user_id(user_id);
        if let Some(embedder) = embedder {
            builder = builder.embedder(embedder);
        }
        if let Some(remote) = remote {
            builder = builder.remote(remote);
        }
        let client = builder.build().expect("Failed to build client");
        assert!(
            client.wait_until_ready(READY_TIMEOUT).await,
            "client did not become ready"
        );
        client
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Unit vector whose cosine with `[1, 0, 0, 0]` is `cos`.
pub fn unit_with_cos(cos: f32) -> Vec<f32> {
    vec![cos, (1.0 - cos * cos).sqrt(), 0.0, 0.0]
}

pub fn query_vector() -> Vec<f32> {
    vec![1.0, 0.0, 0.0, 0.0]
}

/// Embedder answering `query` with [`query_vector`].
pub fn query_embedder(query: &str) -> Arc<MockEmbedder> {
    Arc::new(MockEmbedder::new(TEST_DIM).with_vector(query, query_vector()))
}

/// Write one memory directly into a tier, stamped with `version`.
pub fn seed_memory(
    store: &VectorStore,
    tier: Tier,
    memory: &Memory,
    vector: &[f32],
    version: u64,
) {
    let metadata = memory_metadata(memory, tier, version).expect("Failed to build metadata");
    store
        .upsert(tier, &memory.id, vector, metadata, &memory.content)
        .expect("Failed to seed memory");
}
