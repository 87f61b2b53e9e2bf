// src/similarity/embedding.rs

use ndarray::ArrayView1;

/// Cosine-based similarity between two embedding vectors, rescaled to [0,1].
///
/// `1 - cosine_distance(a, b)` clamped to [-1,1], then mapped through
/// `(c + 1) / 2`. Returns `None` (signal absent, not zero) when either
/// vector is missing or empty, when dimensions differ, or when a zero-norm
/// vector makes the cosine undefined.
pub fn embedding_similarity(a: Option<&[f32]>, b: Option<&[f32]>) -> Option<f64> {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => (a, b),
        _ => return None,
    };
    if a.len() != b.len() {
        return None;
    }

    let va = ArrayView1::from(a);
    let vb = ArrayView1::from(b);
    let dot = va.dot(&vb) as f64;
    let norm_a = (va.dot(&va) as f64).sqrt();
    let norm_b = (vb.dot(&vb) as f64).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }

    let mut cosine = dot / (norm_a * norm_b);
    if cosine.is_nan() || cosine.is_infinite() {
        return None;
    }
    cosine = cosine.clamp(-1.0, 1.0);
    Some((cosine + 1.0) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![0.3_f32, 0.4, 0.5];
        let sim = embedding_similarity(Some(&v), Some(&v)).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn opposite_vectors_score_zero() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![-1.0_f32, 0.0];
        let sim = embedding_similarity(Some(&a), Some(&b)).unwrap();
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_half() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![0.0_f32, 1.0];
        let sim = embedding_similarity(Some(&a), Some(&b)).unwrap();
        assert!((sim - 0.5).abs() < 1e-6);
    }

    #[test]
    fn missing_vector_is_absent_not_zero() {
        let v = vec![1.0_f32, 0.0];
        assert_eq!(embedding_similarity(None, Some(&v)), None);
        assert_eq!(embedding_similarity(Some(&v), None), None);
        assert_eq!(embedding_similarity(None, None), None);
    }

    #[test]
    fn dimension_mismatch_is_absent() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![1.0_f32, 0.0, 0.0];
        assert_eq!(embedding_similarity(Some(&a), Some(&b)), None);
    }

    #[test]
    fn zero_norm_is_absent() {
        let a = vec![0.0_f32, 0.0];
        let b = vec![1.0_f32, 0.0];
        assert_eq!(embedding_similarity(Some(&a), Some(&b)), None);
    }
}
