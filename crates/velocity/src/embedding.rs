use candle_core::{DType, Result, Tensor};

const MAX_PERIOD: f64 = 10_000.0;

/// Sinusoidal embedding of a rank-1 time tensor into `(batch, dim)`.
///
/// The first half of the columns are sines and the second half cosines over
/// geometrically spaced frequencies; `dim` must be even.
pub fn sinusoidal_embedding(time: &Tensor, dim: usize) -> Result<Tensor> {
    if dim < 2 || dim % 2 != 0 {
        candle_core::bail!("time embedding dimension must be even and >= 2 (got {dim})");
    }
    let half = dim / 2;
    let spacing = if half > 1 {
        MAX_PERIOD.ln() / (half - 1) as f64
    } else {
        0.0
    };
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-spacing * i as f64).exp() as f32)
        .collect();
    let freqs = Tensor::from_vec(freqs, (1, half), time.device())?;

    let batch = time.elem_count();
    let args = time
        .to_dtype(DType::F32)?
        .reshape((batch, 1))?
        .broadcast_mul(&freqs)?;
    Tensor::cat(&[args.sin()?, args.cos()?], 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn embedding_starts_with_zero_sines_and_unit_cosines() {
        let time = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        let emb = sinusoidal_embedding(&time, 8).unwrap();
        assert_eq!(emb.dims(), &[3, 8]);
        let rows = emb.to_vec2::<f32>().unwrap();
        for row in rows {
            assert_eq!(&row[..4], &[0.0; 4]);
            assert_eq!(&row[4..], &[1.0; 4]);
        }
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        let time = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        assert!(sinusoidal_embedding(&time, 7).is_err());
    }
}
