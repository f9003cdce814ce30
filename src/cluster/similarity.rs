//! Vector similarity primitives shared by the clustering pipeline.

/// Compute the L2 norm of a vector.
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity between two vectors, range [-1.0, 1.0].
///
/// Returns 0.0 for zero-norm inputs so degenerate vectors rank below
/// everything instead of poisoning comparisons with NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot_product / (norm_a * norm_b)
}

/// Element-wise mean of a set of equal-length vectors.
///
/// Returns an empty vector for empty input.
pub fn centroid(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };

    let mut mean = vec![0.0f32; first.len()];
    for vector in vectors {
        for (slot, value) in mean.iter_mut().zip(vector.iter()) {
            *slot += value;
        }
    }

    let count = vectors.len() as f32;
    for slot in &mut mean {
        *slot /= count;
    }
    mean
}
