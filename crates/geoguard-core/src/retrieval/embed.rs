//! Dense text embeddings for the semantic half of hybrid retrieval.

/// Maps text to a fixed-length, L2-normalized vector.
///
/// Implementations must be deterministic: the regulation index is built
/// once and queried with vectors from the same embedder.
pub trait Embedder: Send + Sync {
    /// Stable identifier, recorded in the index version.
    fn id(&self) -> &str;

    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Feature-hashing embedder over character trigrams of each word.
///
/// Captures shared stems and morphology ("minor", "minors", "minority")
/// without a trained model, so the index is self-contained.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
    id: String,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            id: format!("hash-trigram-{}", dims),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dims];
        let lowered = text.to_lowercase();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let padded: Vec<char> = format!("#{}#", word).chars().collect();
            for gram in padded.windows(3) {
                let bucket = (fnv1a(gram) % self.dims as u64) as usize;
                vector[bucket] += 1.0;
            }
        }
        normalize(&mut vector);
        vector
    }
}

fn fnv1a(chars: &[char]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for c in chars {
        for byte in (*c as u32).to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity of two normalized vectors, clamped to [0, 1].
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (dot as f64).clamp(0.0, 1.0)
}
