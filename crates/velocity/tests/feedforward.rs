use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use interpolant::VelocityField;
use velocity::{FeedForwardConfig, FeedForwardVelocity, VelocityModel};

fn small_config() -> FeedForwardConfig {
    FeedForwardConfig {
        input_dim: 6,
        time_embedding_dim: 8,
        hidden_widths: vec![16, 16],
        latent_dim: None,
        dtype: DType::F32,
    }
}

#[test]
fn output_matches_the_input_shape() -> Result<()> {
    let device = Device::Cpu;
    let model = FeedForwardVelocity::new(small_config(), &device)?;
    let x = Tensor::randn(0f32, 1f32, (5, 2, 3), &device)?;
    let t = Tensor::rand(0f32, 1f32, 5, &device)?;

    let v = model.forward(&x, &t, None)?;
    assert_eq!(v.dims(), &[5, 2, 3]);
    assert_eq!(v.dtype(), DType::F32);
    Ok(())
}

#[test]
fn parameters_are_named_and_sorted() -> Result<()> {
    let model = FeedForwardVelocity::new(small_config(), &Device::Cpu)?;
    let names: Vec<String> = model
        .named_parameters()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(
        names,
        vec![
            "hidden.0.bias",
            "hidden.0.weight",
            "hidden.1.bias",
            "hidden.1.weight",
            "output.bias",
            "output.weight",
        ]
    );
    // (6 + 8) * 16 + 16 + 16 * 16 + 16 + 16 * 6 + 6
    assert_eq!(model.parameter_count(), 614);
    Ok(())
}

#[test]
fn fork_copies_values_but_not_storage() -> Result<()> {
    let device = Device::Cpu;
    let model = FeedForwardVelocity::new(small_config(), &device)?;
    let shadow = model.fork()?;

    let x = Tensor::randn(0f32, 1f32, (4, 6), &device)?;
    let t = Tensor::rand(0f32, 1f32, 4, &device)?;
    let before = shadow.forward(&x, &t, None)?;
    let reference = model.forward(&x, &t, None)?;
    let diff = (&before - &reference)?.abs()?.sum_all()?.to_vec0::<f32>()?;
    assert_eq!(diff, 0.0);

    for (_, var) in model.named_parameters() {
        var.set(&var.as_tensor().zeros_like()?)?;
    }
    let after = shadow.forward(&x, &t, None)?;
    let drift = (&before - &after)?.abs()?.sum_all()?.to_vec0::<f32>()?;
    assert_eq!(drift, 0.0);
    Ok(())
}

#[test]
fn latent_conditioned_models_require_a_latent() -> Result<()> {
    let device = Device::Cpu;
    let model = FeedForwardVelocity::new(
        FeedForwardConfig {
            latent_dim: Some(4),
            ..small_config()
        },
        &device,
    )?;
    let x = Tensor::randn(0f32, 1f32, (3, 6), &device)?;
    let t = Tensor::rand(0f32, 1f32, 3, &device)?;
    let latent = Tensor::ones((3, 2, 2), DType::F32, &device)?;

    assert_eq!(model.forward(&x, &t, Some(&latent))?.dims(), &[3, 6]);
    assert!(model.forward(&x, &t, None).is_err());
    Ok(())
}

#[test]
fn tracked_evaluation_reaches_every_parameter() -> Result<()> {
    let device = Device::Cpu;
    let model = FeedForwardVelocity::new(small_config(), &device)?;
    let x = Tensor::randn(0f32, 1f32, (4, 6), &device)?;
    let t = Tensor::rand(0f32, 1f32, 4, &device)?;

    let grads = model.velocity_tracked(&x, &t, None)?.sqr()?.sum_all()?.backward()?;
    for (name, var) in model.named_parameters() {
        assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {name}");
    }

    let detached = model.velocity_detached(&x, &t, None)?.sum_all()?.backward()?;
    for (_, var) in model.named_parameters() {
        assert!(detached.get(var.as_tensor()).is_none());
    }
    Ok(())
}

#[test]
fn loading_rejects_parameters_the_model_does_not_have() -> Result<()> {
    let device = Device::Cpu;
    let model = FeedForwardVelocity::new(small_config(), &device)?;
    let donor = FeedForwardVelocity::new(small_config(), &device)?;
    model.load_parameters(&donor.named_parameters())?;

    let stray = candle_core::Var::zeros(3, DType::F32, &device)?;
    let mut source = donor.named_parameters();
    source.push(("hidden.9.weight".to_string(), stray));
    assert!(model.load_parameters(&source).is_err());
    Ok(())
}
