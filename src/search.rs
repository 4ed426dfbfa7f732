//! Similarity search over an [`IndexSnapshot`].
//!
//! Ranking is behind the [`SimilarityBackend`] trait with two
//! implementations:
//!
//! - [`ExactScan`]: cosine similarity against every chunk, sorted descending.
//! - `FlatIpIndex` (feature `accelerated-search`): a dense matrix of
//!   L2-normalised chunk vectors queried with one matrix-vector product.
//!   The matrix is built on first use and cached by the backend.
//!
//! A [`Retriever`] owns one backend, the embedding provider and the
//! snapshot for the lifetime of the process. Both backends return at most
//! `k` hits, best first; ties are not ordered.

use anyhow::Result;
use tokio::sync::OnceCell;

use crate::config::Config;
use crate::embedding::{cosine_similarity, embed_query, EmbeddingProvider};
use crate::index::EmbeddingIndex;
use crate::models::{Chunk, IndexSnapshot};

/// A ranked chunk.
#[derive(Debug, Clone)]
pub struct Hit {
    pub chunk: Chunk,
    pub score: f32,
}

/// Ranks snapshot chunks against a query vector.
pub trait SimilarityBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn rank(&self, snapshot: &IndexSnapshot, query: &[f32], k: usize) -> Vec<Hit>;
}

/// Brute-force cosine similarity.
#[derive(Debug, Default)]
pub struct ExactScan;

impl SimilarityBackend for ExactScan {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn rank(&self, snapshot: &IndexSnapshot, query: &[f32], k: usize) -> Vec<Hit> {
        if k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = snapshot
            .index
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let score = chunk
                    .embedding
                    .as_deref()
                    .map(|v| cosine_similarity(query, v))
                    .unwrap_or(0.0);
                (i, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(i, score)| Hit {
                chunk: snapshot.index[i].clone(),
                score,
            })
            .collect()
    }
}

#[cfg(feature = "accelerated-search")]
pub use flat::FlatIpIndex;

#[cfg(feature = "accelerated-search")]
mod flat {
    use ndarray::{Array1, Array2};
    use std::sync::{Arc, Mutex};

    use super::{Hit, SimilarityBackend};
    use crate::models::IndexSnapshot;

    /// Cached matrix, tagged with the snapshot it was built from.
    struct Matrix {
        created_at: i64,
        rows: Array2<f32>,
    }

    /// Flat inner-product index over unit-length rows.
    ///
    /// Chunks without an embedding, or with the wrong length, are zero rows
    /// and score 0.
    #[derive(Default)]
    pub struct FlatIpIndex {
        cache: Mutex<Option<Arc<Matrix>>>,
    }

    impl FlatIpIndex {
        pub fn new() -> Self {
            Self::default()
        }

        fn matrix(&self, snapshot: &IndexSnapshot) -> Option<Arc<Matrix>> {
            let mut guard = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(m) = guard.as_ref() {
                if m.created_at == snapshot.created_at && m.rows.nrows() == snapshot.index.len()
                {
                    return Some(Arc::clone(m));
                }
            }

            let dims = snapshot.dims()?;
            let mut rows = Array2::<f32>::zeros((snapshot.index.len(), dims));
            for (i, chunk) in snapshot.index.iter().enumerate() {
                if let Some(v) = chunk.embedding.as_deref().filter(|v| v.len() == dims) {
                    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                    if norm > 0.0 {
                        for (j, x) in v.iter().enumerate() {
                            rows[[i, j]] = x / norm;
                        }
                    }
                }
            }
            tracing::debug!(rows = rows.nrows(), dims, "built flat index");

            let built = Arc::new(Matrix {
                created_at: snapshot.created_at,
                rows,
            });
            *guard = Some(Arc::clone(&built));
            Some(built)
        }
    }

    /// Nothing is comparable to the query: every chunk scores 0, as with
    /// [`super::ExactScan`], and the first `k` come back in snapshot order.
    fn unscored(snapshot: &IndexSnapshot, k: usize) -> Vec<Hit> {
        snapshot
            .index
            .iter()
            .take(k)
            .map(|chunk| Hit {
                chunk: chunk.clone(),
                score: 0.0,
            })
            .collect()
    }

    impl SimilarityBackend for FlatIpIndex {
        fn name(&self) -> &'static str {
            "accelerated"
        }

        fn rank(&self, snapshot: &IndexSnapshot, query: &[f32], k: usize) -> Vec<Hit> {
            if k == 0 || snapshot.index.is_empty() {
                return Vec::new();
            }
            let Some(matrix) = self.matrix(snapshot) else {
                return unscored(snapshot, k);
            };
            if query.len() != matrix.rows.ncols() {
                return unscored(snapshot, k);
            }

            let norm = query.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm == 0.0 {
                return unscored(snapshot, k);
            }
            let q = Array1::from_iter(query.iter().map(|x| x / norm));
            let scores = matrix.rows.dot(&q);

            let mut ids: Vec<usize> = (0..scores.len()).collect();
            ids.sort_by(|&a, &b| {
                scores[b]
                    .partial_cmp(&scores[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            ids.truncate(k);

            ids.into_iter()
                .filter_map(|id| {
                    snapshot.index.get(id).map(|chunk| Hit {
                        chunk: chunk.clone(),
                        score: scores[id],
                    })
                })
                .collect()
        }
    }
}

/// Choose the ranking backend once, from `search.backend`.
pub fn select_backend(config: &Config) -> Box<dyn SimilarityBackend> {
    match config.search.backend.as_str() {
        #[cfg(feature = "accelerated-search")]
        "accelerated" => Box::new(FlatIpIndex::new()),
        #[cfg(not(feature = "accelerated-search"))]
        "accelerated" => {
            tracing::warn!(
                "accelerated search requested but built without --features accelerated-search; using exact scan"
            );
            Box::new(ExactScan)
        }
        _ => Box::new(ExactScan),
    }
}

/// Query-time entry point: embeds the query and ranks the snapshot.
///
/// The snapshot is loaded on first use and rebuilt if it is missing or was
/// built for another root or model.
pub struct Retriever {
    index: EmbeddingIndex,
    provider: Box<dyn EmbeddingProvider>,
    backend: Box<dyn SimilarityBackend>,
    snapshot: OnceCell<IndexSnapshot>,
}

impl Retriever {
    pub fn new(
        index: EmbeddingIndex,
        provider: Box<dyn EmbeddingProvider>,
        backend: Box<dyn SimilarityBackend>,
    ) -> Self {
        Self {
            index,
            provider,
            backend,
            snapshot: OnceCell::new(),
        }
    }

    pub fn from_config(config: &Config, provider: Box<dyn EmbeddingProvider>) -> Self {
        Self::new(EmbeddingIndex::new(config), provider, select_backend(config))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// The snapshot in use, loading or building it if needed.
    pub async fn snapshot(&self) -> Result<&IndexSnapshot> {
        self.snapshot
            .get_or_try_init(|| async {
                let model = self.provider.model_name();
                if let Some(existing) = self.index.load() {
                    if !self.index.is_stale(&existing, model) {
                        return Ok(existing);
                    }
                    tracing::info!(
                        snapshot_model = %existing.model,
                        model,
                        "snapshot is stale, rebuilding"
                    );
                } else {
                    tracing::info!(path = %self.index.snapshot_path().display(), "no snapshot, building");
                }
                let (snapshot, _) = self.index.build(self.provider.as_ref()).await?;
                Ok::<_, anyhow::Error>(snapshot)
            })
            .await
    }

    /// Top `k` chunks for `query`, best first.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<Hit>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let snapshot = self.snapshot().await?;
        if snapshot.index.is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = embed_query(self.provider.as_ref(), query).await?;
        Ok(self.backend.rank(snapshot, &query_vec, k))
    }
}
