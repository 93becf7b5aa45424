//! Distance and vector primitives shared by the extractors and matchers.

use crate::types::Point;

/// Euclidean distance between two image points.
pub fn distance(a: Point, b: Point) -> f32 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

pub fn midpoint(a: Point, b: Point) -> Point {
    Point::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0)
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length. A zero-norm vector is returned unchanged;
/// callers must treat it as a failed extraction.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = l2_norm(v);
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Component-wise mean of equally sized rows. Rows shorter than the first
/// contribute zeros for their missing components.
pub fn mean(rows: &[&[f32]]) -> Vec<f32> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let mut sum = vec![0.0f32; first.len()];
    for row in rows {
        for (acc, v) in sum.iter_mut().zip(row.iter()) {
            *acc += v;
        }
    }
    let n = rows.len() as f32;
    sum.iter_mut().for_each(|v| *v /= n);
    sum
}
