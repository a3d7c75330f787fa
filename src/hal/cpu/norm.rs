use itertools::Itertools;

use crate::hal::ops::NormKind;

/// Row statistics of one normalization group: the value to subtract and the inverse deviation.
fn moments(kind: NormKind, x: &[f32], eps: f32) -> (f32, f32) {
    match kind {
        NormKind::Rms => {
            let square = x.iter().map(|x| x * x).sum::<f32>() / x.len() as f32;
            (0.0, 1.0 / (square + eps).sqrt())
        }
        NormKind::Layer => {
            let (mean, m2, count) = x.iter().fold((0.0, 0.0, 0u32), |(mean, m2, count), &x| {
                let count = count + 1;
                let delta = x - mean;
                let mean = mean + delta / count as f32;
                let m2 = m2 + delta * (x - mean);
                (mean, m2, count)
            });
            let variance = m2 / count as f32 + eps;
            (mean, 1.0 / variance.sqrt())
        }
    }
}

fn normalize_row(
    kind: NormKind,
    x: &[f32],
    w: Option<&[f32]>,
    b: Option<&[f32]>,
    eps: f32,
) -> impl Iterator<Item = f32> {
    let (mean, deviation) = moments(kind, x, eps);
    let w = w.map_or_else(|| vec![1.0; x.len()], <[f32]>::to_vec);
    let b = b.map_or_else(|| vec![0.0; x.len()], <[f32]>::to_vec);
    x.iter()
        .copied()
        .zip_eq(w)
        .zip_eq(b)
        .map(move |((x, w), b)| (x - mean) * deviation * w + b)
}

/// Normalizes every row of `width` elements of `x`.
///
/// `w` and `b`, if given, hold at least `width` elements; only the first row is read.
pub fn norm(
    kind: NormKind,
    x: &[f32],
    width: usize,
    w: Option<&[f32]>,
    b: Option<&[f32]>,
    eps: f32,
) -> Vec<f32> {
    let w = w.map(|w| &w[..width]);
    let b = b.map(|b| &b[..width]);

    #[cfg(not(feature = "rayon"))]
    let output = x
        .chunks_exact(width)
        .flat_map(|x| normalize_row(kind, x, w, b, eps))
        .collect();
    #[cfg(feature = "rayon")]
    let output = {
        use rayon::prelude::*;

        x.par_chunks_exact(width)
            .flat_map_iter(|x| normalize_row(kind, x, w, b, eps))
            .collect()
    };
    output
}

#[cfg(test)]
mod tests {
    use super::norm;
    use crate::hal::ops::NormKind;

    fn assert_close(x: &[f32], y: &[f32], tolerance: f32) {
        assert_eq!(x.len(), y.len());
        for (x, y) in x.iter().zip(y) {
            assert!((x - y).abs() <= tolerance, "{x} vs {y}");
        }
    }

    #[test]
    fn test_rms_norm() {
        let x = [1.0, 2.0, 3.0, 4.0, -2.0, 2.0, -2.0, 2.0];
        let w = [1.0, 1.0, 2.0, 0.5];
        let output = norm(NormKind::Rms, &x, 4, Some(&w[..]), None, 0.0);

        let rms = (30.0f32 / 4.0).sqrt();
        let expected = [1.0 / rms, 2.0 / rms, 6.0 / rms, 2.0 / rms, -1.0, 1.0, -2.0, 0.5];
        assert_close(&output, &expected, 1e-6);
    }

    #[test]
    fn test_rms_norm_eps() {
        let x = [0.0; 8];
        let output = norm(NormKind::Rms, &x, 8, None, None, 1e-5);
        assert!(output.iter().all(|x| *x == 0.0));

        let x = [1e-3; 4];
        let output = norm(NormKind::Rms, &x, 4, None, None, 1e-5);
        let expected = 1e-3 / (1e-6f32 + 1e-5).sqrt();
        assert_close(&output, &[expected; 4], 1e-5);
    }

    #[test]
    fn test_layer_norm() {
        let x: Vec<f32> = (0..64).map(|_| fastrand::f32() * 4.0 - 2.0).collect();
        let w = vec![2.0; 16];
        let b = vec![0.5; 16];
        let output = norm(NormKind::Layer, &x, 16, Some(&w[..]), Some(&b[..]), 1e-5);

        for (x, y) in x.chunks(16).zip(output.chunks(16)) {
            let mean = x.iter().sum::<f32>() / 16.0;
            let var = x.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / 16.0;
            let expected: Vec<f32> = x
                .iter()
                .map(|x| (x - mean) / (var + 1e-5).sqrt() * 2.0 + 0.5)
                .collect();
            assert_close(y, &expected, 1e-4);
        }
    }
}
