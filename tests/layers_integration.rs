//! Integration tests for the quantized layers.
//!
//! Tests cover:
//! - PTQ round trip: float projection -> codes -> inference projection
//! - Directives read back from a rewritten tree drive the layer
//! - FP8 einsum state stays out of the optimizer while weights train

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use layer_quant::{
    find_target_tpl, for_transformer, set_quantization,
    templates::{transformer_lm, TransformerDims},
    Fp8EinsumConfig, Fp8EinsumOp, LayerKind, OneHeadedAttentionProjection,
    OneHeadedAttentionProjectionConfig, QuantizationHParams, QuantizationMode, QuantizationType,
    TaskConfig, VariableStore, WeightHParams, WeightInit,
};

fn max_abs(t: &Tensor) -> f32 {
    t.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
}

#[test]
fn test_ptq_inference_matches_float() {
    let device = Device::Cpu;
    let float_layer = OneHeadedAttentionProjection::new(
        OneHeadedAttentionProjectionConfig::new(64, 16).with_quantization(
            QuantizationHParams::new(QuantizationType::Ptq, QuantizationMode::Materialize),
        ),
        &device,
    )
    .unwrap();
    let quantized_layer = OneHeadedAttentionProjection::new(
        OneHeadedAttentionProjectionConfig::new(64, 16)
            .with_quantization(QuantizationHParams::ptq_inference()),
        &device,
    )
    .unwrap();

    let weights = float_layer.quantize_weight().unwrap();
    assert_eq!(weights.w.size_bytes(), 64 * 16);
    quantized_layer.load_quantized(&weights).unwrap();

    let x = Tensor::randn(0f32, 1.0, (4, 7, 64), &device).unwrap();
    let expected = float_layer.forward(&x).unwrap();
    let actual = quantized_layer.forward(&x).unwrap();
    assert_eq!(actual.dims(), &[4, 7, 16]);

    let diff = max_abs(&(&expected - &actual).unwrap());
    let tolerance = 0.02 * max_abs(&expected);
    assert!(diff <= tolerance, "diff {diff} exceeds {tolerance}");
}

#[test]
fn test_lower_precision_increases_error() {
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1.0, (32, 64), &device).unwrap();
    let float_layer = OneHeadedAttentionProjection::new(
        OneHeadedAttentionProjectionConfig::new(64, 16)
            .with_bias(false)
            .with_quantization(QuantizationHParams::new(
                QuantizationType::Ptq,
                QuantizationMode::Materialize,
            )),
        &device,
    )
    .unwrap();
    let w = float_layer.weight().unwrap();
    let expected = float_layer.forward(&x).unwrap();

    let error_at = |bits: u32| {
        let config = OneHeadedAttentionProjectionConfig::new(64, 16)
            .with_bias(false)
            .with_quantization(QuantizationHParams::ptq_inference().with_precision(bits));
        let layer = OneHeadedAttentionProjection::new(config.clone(), &device).unwrap();
        let source = OneHeadedAttentionProjection::new(
            OneHeadedAttentionProjectionConfig {
                quantization: QuantizationHParams::new(
                    QuantizationType::Ptq,
                    QuantizationMode::Materialize,
                )
                .with_precision(bits),
                ..config
            },
            &device,
        )
        .unwrap();
        source.variables().assign("w", &w).unwrap();
        layer
            .load_quantized(&source.quantize_weight().unwrap())
            .unwrap();
        max_abs(&(&expected - &layer.forward(&x).unwrap()).unwrap())
    };

    assert!(error_at(4) > error_at(8));
}

#[test]
fn test_fake_quant_directive_rejects_ptq_conversion() {
    let make_task =
        for_transformer(|| TaskConfig::new("lm", transformer_lm(&TransformerDims::default(), 2, 64)));
    let task = make_task().unwrap();

    let proj = find_target_tpl(&task.model, LayerKind::QuantizedAttentionProjection);
    assert_eq!(proj.len(), 1);
    let directive = proj[0].quantization().unwrap().clone();
    assert_eq!(directive.quantization_type, QuantizationType::Fq);

    let layer = OneHeadedAttentionProjection::new(
        OneHeadedAttentionProjectionConfig::new(32, 8).with_quantization(directive),
        &Device::Cpu,
    )
    .unwrap();
    let err = layer.quantize_weight().unwrap_err();
    assert!(err.is_not_implemented());
}

#[test]
fn test_inference_directive_builds_quantized_layer() {
    let mut lm = transformer_lm(&TransformerDims::default(), 2, 64);
    set_quantization(
        &mut lm,
        LayerKind::Transformer,
        QuantizationType::Ptq,
        QuantizationMode::Inference,
    )
    .unwrap();
    let proj = find_target_tpl(&lm, LayerKind::AttentionProjection);
    let directive = proj[0].quantization().unwrap().clone();

    let layer = OneHeadedAttentionProjection::new(
        OneHeadedAttentionProjectionConfig::new(32, 8).with_quantization(directive),
        &Device::Cpu,
    )
    .unwrap();
    assert_eq!(
        layer.variables().non_trainable_names(),
        vec!["w", "w_quantized_scale"]
    );
}

#[test]
fn test_fp8_state_excluded_from_optimizer() {
    let device = Device::Cpu;
    let mut store = VariableStore::new(&device);
    let op = Fp8EinsumOp::setup(Fp8EinsumConfig::with_history_length(8), &mut store).unwrap();
    let w = store
        .create_variable(
            "w",
            WeightHParams::new(vec![16, 4]).with_init(WeightInit::Gaussian { scale: 0.1 }),
        )
        .unwrap();
    let w_before = w.to_vec2::<f32>().unwrap();

    let trainable = store.trainable_vars();
    assert_eq!(trainable.len(), 1);
    let mut opt = AdamW::new(
        trainable,
        ParamsAdamW {
            lr: 1e-2,
            ..Default::default()
        },
    )
    .unwrap();

    let x = Tensor::randn(0f32, 1.0, (8, 16), &device).unwrap();
    let target = Tensor::zeros((8, 4), DType::F32, &device).unwrap();
    for _ in 0..3 {
        let w = store.get("w").unwrap();
        let y = op.forward("...D,DH->...H", &x, &w).unwrap();
        let loss = (y - &target).unwrap().sqr().unwrap().mean_all().unwrap();
        opt.backward_step(&loss).unwrap();
    }

    let w_after = store.get("w").unwrap().to_vec2::<f32>().unwrap();
    assert_ne!(w_before, w_after);

    // Histories were written by the qdq pass only.
    let history = op.input_state().amax_history().unwrap();
    assert!(history[0] > 0.0);
    assert_eq!(history.iter().filter(|&&a| a > 0.0).count(), 3);
    assert!(op.kernel_state().scale().unwrap() > 0.0);
}
