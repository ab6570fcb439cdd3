use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use interpolant::{standard_normal_like, ForwardOperator};
use inverse_data::{
    build_operator, build_source, CleanSource, CorruptionKind, DataError, GaussianNoise,
    TensorDataset,
};
use rand::{rngs::StdRng, SeedableRng};

fn values(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.flatten_all()?.to_vec1::<f32>()?)
}

#[test]
fn corruption_names_resolve_with_aliases() {
    assert_eq!(
        CorruptionKind::parse("noise").unwrap(),
        CorruptionKind::GaussianNoise
    );
    assert_eq!(
        CorruptionKind::parse("Random_Mask").unwrap(),
        CorruptionKind::RandomMask
    );
    assert!(matches!(
        CorruptionKind::parse("blur"),
        Err(DataError::UnknownCorruption(_))
    ));
    assert!(matches!(
        build_operator("gaussian_noise", &[], 0),
        Err(DataError::InvalidLevels { .. })
    ));
    assert!(build_operator("mask", &[1.0], 0).is_err());
    assert!(build_operator("projection", &[1.5], 0).is_err());
}

#[test]
fn gaussian_noise_with_zero_sigma_is_identity() -> Result<()> {
    let op = build_operator("gaussian_noise", &[0.0], 3)?;
    let x = Tensor::randn(0f32, 1f32, (8, 2), &Device::Cpu)?;
    let out = op.apply(&x)?;
    assert!(out.latent.is_none());
    assert_eq!(values(&out.corrupted)?, values(&x)?);
    Ok(())
}

#[test]
fn gaussian_noise_draws_fresh_noise_each_call() -> Result<()> {
    let op = build_operator("gaussian_noise", &[0.5], 3)?;
    let x = Tensor::zeros((16, 2), DType::F32, &Device::Cpu)?;
    let first = values(&op.corrupt(&x)?)?;
    let second = values(&op.corrupt(&x)?)?;
    assert_ne!(first, second);
    Ok(())
}

#[test]
fn gaussian_noise_shares_the_engine_normal_stream() -> Result<()> {
    let x = Tensor::zeros((8, 3), DType::F32, &Device::Cpu)?;
    let op = GaussianNoise::new(2.0, 5);
    let expected = standard_normal_like(&mut StdRng::seed_from_u64(5), &x)?.affine(2.0, 0.0)?;
    let out = op.apply(&x)?;
    for (got, want) in values(&out.corrupted)?.iter().zip(values(&expected)?) {
        assert!((got - want).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn mask_zeroes_dropped_coordinates_and_returns_the_mask() -> Result<()> {
    let op = build_operator("random_mask", &[0.5], 11)?;
    let x = Tensor::ones((32, 4), DType::F32, &Device::Cpu)?;
    let out = op.apply(&x)?;
    let mask = out.latent.expect("mask latent");
    assert_eq!(mask.dims(), &[32, 4]);
    assert_eq!(values(&out.corrupted)?, values(&mask)?);
    let kept: f32 = values(&mask)?.iter().sum();
    assert!(kept > 0.0 && kept < 128.0);
    Ok(())
}

#[test]
fn projection_is_idempotent_on_its_own_output() -> Result<()> {
    let op = build_operator("projection", &[2.0], 5)?;
    let x = Tensor::randn(0f32, 1f32, (6, 5), &Device::Cpu)?;
    let out = op.apply(&x)?;
    let basis = out.latent.expect("basis latent");
    assert_eq!(basis.dims(), &[6, 5, 2]);

    // Q^T Q = I for every example.
    let gram = basis.transpose(1, 2)?.contiguous()?.matmul(&basis)?;
    let eye = Tensor::eye(2, DType::F32, &Device::Cpu)?
        .unsqueeze(0)?
        .broadcast_as((6, 2, 2))?;
    let err = (gram - eye)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert!(err < 1e-4, "basis not orthonormal: {err}");

    let y = out.corrupted.reshape((6, 5, 1))?;
    let reprojected = basis.matmul(&basis.transpose(1, 2)?.contiguous()?.matmul(&y)?)?;
    let drift = (reprojected - y)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert!(drift < 1e-4);
    Ok(())
}

#[test]
fn projection_rank_cannot_exceed_dimension() -> Result<()> {
    let op = build_operator("projection", &[3.0], 0)?;
    let x = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
    assert!(op.apply(&x).is_err());
    Ok(())
}

#[test]
fn latent_widths_follow_the_operator() {
    assert_eq!(CorruptionKind::GaussianNoise.latent_dim(&[0.1], 2), None);
    assert_eq!(CorruptionKind::RandomMask.latent_dim(&[0.3], 6), Some(6));
    assert_eq!(CorruptionKind::Projection.latent_dim(&[2.0], 5), Some(10));
    assert!(!CorruptionKind::GaussianNoise.uses_latents());
}

#[test]
fn synthetic_sources_sample_two_dimensional_batches() -> Result<()> {
    for name in ["checker", "moon", "gmm"] {
        let source = build_source(name, None, 7)?;
        assert_eq!(source.feature_shape(), vec![2]);
        let batch = source.sample(64, &Device::Cpu)?;
        assert_eq!(batch.dims(), &[64, 2]);
        assert!(values(&batch)?.iter().all(|v| v.is_finite()));
    }
    Ok(())
}

#[test]
fn checkerboard_stays_inside_its_box() -> Result<()> {
    let source = build_source("checker", None, 1)?;
    let batch = values(&source.sample(512, &Device::Cpu)?)?;
    assert!(batch.iter().all(|v| (-4.0..=4.0).contains(v)));
    Ok(())
}

#[test]
fn same_seed_gives_the_same_samples() -> Result<()> {
    let a = build_source("gmm", None, 42)?.sample(10, &Device::Cpu)?;
    let b = build_source("gmm", None, 42)?.sample(10, &Device::Cpu)?;
    assert_eq!(values(&a)?, values(&b)?);
    Ok(())
}

#[test]
fn unknown_dataset_without_a_file_is_rejected() {
    assert!(matches!(
        build_source("mnist", None, 0),
        Err(DataError::UnknownDataset(_))
    ));
}

#[test]
fn missing_dataset_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.safetensors");
    assert!(matches!(
        build_source("images", Some(&path), 0),
        Err(DataError::MissingDataset(_))
    ));
}

#[test]
fn tensor_dataset_cycles_through_every_example() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("points.safetensors");
    let examples = Tensor::arange(0f32, 10f32, &Device::Cpu)?.reshape((5, 2))?;
    candle_core::safetensors::save(
        &std::collections::HashMap::from([("points".to_string(), examples)]),
        &path,
    )?;

    let dataset = TensorDataset::open(&path, "points", 9)?;
    assert_eq!(dataset.len(), 5);
    assert_eq!(dataset.feature_shape(), vec![2]);

    let epoch = dataset.sample(5, &Device::Cpu)?;
    let mut firsts: Vec<f32> = epoch.to_vec2::<f32>()?.iter().map(|row| row[0]).collect();
    firsts.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(firsts, vec![0.0, 2.0, 4.0, 6.0, 8.0]);

    let wrapped = dataset.sample(7, &Device::Cpu)?;
    assert_eq!(wrapped.dims(), &[7, 2]);
    assert_eq!(dataset.epoch(), 2);
    assert!(TensorDataset::open(&path, "other", 0).is_err());
    Ok(())
}
