//! Canonical-schema similarity index.
//!
//! Extraction produces free-form field names ("ionic_cond", "sigma_RT") that
//! must be mapped onto the fixed canonical column set before persistence.
//! The mapping is a nearest-neighbor search over embeddings of the canonical
//! keys; a configurable similarity threshold downstream decides whether the
//! best match is accepted or the record is held for review.

use std::sync::Arc;

use ndarray::{Array1, ArrayView1};
use sha2::{Digest, Sha256};

/// Embeds a field name into a fixed-dimension vector.
///
/// Implementations must be deterministic so that schema resolution is
/// reproducible across reruns of the same batch.
pub trait Embedder: Send + Sync {
    /// Returns the embedding for `text`.
    fn embed(&self, text: &str) -> Array1<f64>;

    /// Dimension of the produced vectors.
    fn dim(&self) -> usize;
}

/// Nearest-neighbor search over the canonical key set.
pub trait SchemaIndex: Send + Sync {
    /// Returns up to `k` candidate canonical keys ranked by similarity,
    /// best first.
    fn matches(&self, field: &str, k: usize) -> Vec<(String, f64)>;

    /// Returns the single best candidate, if the index is non-empty.
    fn best_match(&self, field: &str) -> Option<(String, f64)> {
        self.matches(field, 1).into_iter().next()
    }

    /// The canonical keys this index was built over.
    fn canonical_keys(&self) -> Vec<String>;
}

/// Feature-hashing embedder over word tokens and character trigrams.
///
/// Each feature is hashed to a dimension index and a sign; the accumulated
/// vector is L2-normalized. Shared tokens and trigrams between two field
/// names pull their embeddings together, which is what the schema mapping
/// needs: "ionic_cond" should land near "ionic_conductivity_ms_cm".
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    /// Creates an embedder with the given dimensionality.
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    fn features(text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut features = Vec::new();
        for token in lowered.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            features.push(token.to_string());
            let chars: Vec<char> = token.chars().collect();
            if chars.len() >= 3 {
                for window in chars.windows(3) {
                    features.push(window.iter().collect());
                }
            }
        }
        features
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(128)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Array1<f64> {
        let mut vector = Array1::<f64>::zeros(self.dim);
        for feature in Self::features(text) {
            let digest = Sha256::digest(feature.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            let index = (u64::from_be_bytes(bytes) % self.dim as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.dot(&vector).sqrt();
        if norm > 0.0 {
            vector.mapv_inplace(|v| v / norm);
        }
        vector
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Cosine similarity between two vectors, in [-1, 1].
pub fn cosine(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (a.dot(&b) / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// In-memory cosine index over the canonical key set.
pub struct CosineSchemaIndex {
    keys: Vec<String>,
    vectors: Vec<Array1<f64>>,
    embedder: Arc<dyn Embedder>,
}

impl CosineSchemaIndex {
    /// Builds the index by embedding every canonical key once.
    pub fn new(embedder: Arc<dyn Embedder>, canonical_keys: &[String]) -> Self {
        let vectors = canonical_keys
            .iter()
            .map(|key| embedder.embed(key))
            .collect();
        Self {
            keys: canonical_keys.to_vec(),
            vectors,
            embedder,
        }
    }

    /// Number of canonical keys indexed.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true when no keys are indexed.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl SchemaIndex for CosineSchemaIndex {
    fn matches(&self, field: &str, k: usize) -> Vec<(String, f64)> {
        let query = self.embedder.embed(field);
        let mut scored: Vec<(String, f64)> = self
            .keys
            .iter()
            .zip(&self.vectors)
            .map(|(key, vector)| (key.clone(), cosine(query.view(), vector.view())))
            .collect();

        // Deterministic order: score descending, then key name.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    fn canonical_keys(&self) -> Vec<String> {
        self.keys.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(keys: &[&str]) -> CosineSchemaIndex {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        CosineSchemaIndex::new(Arc::new(HashEmbedder::default()), &keys)
    }

    #[test]
    fn test_embedding_is_deterministic() {
        let embedder = HashEmbedder::default();
        assert_eq!(
            embedder.embed("ionic_cond").to_vec(),
            embedder.embed("ionic_cond").to_vec()
        );
    }

    #[test]
    fn test_identical_text_scores_one() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("activation_energy_ev");
        let score = cosine(a.view(), a.view());
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_exact_key_is_best_match() {
        let idx = index(&[
            "ionic_conductivity_ms_cm",
            "activation_energy_ev",
            "sintering_temp_c",
        ]);
        let (key, score) = idx.best_match("activation_energy_ev").unwrap();
        assert_eq!(key, "activation_energy_ev");
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_related_field_beats_unrelated() {
        let idx = index(&["ionic_conductivity_ms_cm", "ball_milling_rpm"]);
        let (key, score) = idx.best_match("ionic_cond").unwrap();
        assert_eq!(key, "ionic_conductivity_ms_cm");
        assert!(score > 0.0);

        let ranked = idx.matches("ionic_cond", 2);
        assert_eq!(ranked.len(), 2);
        assert!(ranked[0].1 >= ranked[1].1);
    }

    #[test]
    fn test_empty_index_has_no_match() {
        let idx = index(&[]);
        assert!(idx.best_match("anything").is_none());
        assert!(idx.is_empty());
    }
}
