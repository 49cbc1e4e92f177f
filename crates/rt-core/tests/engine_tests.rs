use rt_core::descriptor::{LayerRange, ModelDescriptor};
use rt_core::{LayerWeights, WorkerEngine};
use rt_kernels::{Tensor, TpGroup};
use rt_kernels_cpu::CpuKernels;
use std::sync::Arc;

fn identity(n: usize) -> Tensor {
    let mut data = vec![0.0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Tensor::from_vec(&[n, n], data).unwrap()
}

fn zero_mlp_layer(hidden: usize) -> LayerWeights {
    LayerWeights {
        input_layernorm_weight: vec![1.0; hidden],
        q_proj_t: identity(hidden),
        k_proj_t: identity(hidden),
        v_proj_t: identity(hidden),
        o_proj_t: identity(hidden),
        post_attention_layernorm_weight: vec![1.0; hidden],
        gate_proj_t: Tensor::zeros(&[hidden, hidden]),
        up_proj_t: Tensor::zeros(&[hidden, hidden]),
        down_proj_t: Tensor::zeros(&[hidden, hidden]),
    }
}

fn tiny_model(hidden: usize) -> ModelDescriptor {
    ModelDescriptor {
        num_layers: 2,
        hidden_size: hidden,
        num_attention_heads: 1,
        num_kv_heads: 1,
        head_dim: hidden,
        intermediate_size: hidden,
        vocab_size: 32,
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        max_position_embeddings: 32,
        eos_token_ids: vec![2],
    }
}

#[test]
fn kv_cache_length_grows_with_each_forward_call() {
    let hidden = 2;
    let model = tiny_model(hidden);
    let range = LayerRange::new(0, 2);
    let weights = vec![zero_mlp_layer(hidden), zero_mlp_layer(hidden)];
    let kernels = Arc::new(CpuKernels::new());
    let mut engine = WorkerEngine::new(&model, range, weights, TpGroup::new(1), kernels).unwrap();

    // This engine owns layer 1, the final layer, so `forward` truncates to
    // one row per request regardless of how many rows were packed in.
    let prefill = Tensor::from_vec(&[3, hidden], vec![1.0, 0.0, 0.5, 0.5, 0.0, 1.0]).unwrap();
    let out1 = engine.forward(&["r1".to_string()], &[3], prefill).unwrap();
    assert_eq!(out1.shape, vec![1, hidden]);

    let decode = Tensor::from_vec(&[1, hidden], vec![0.2, 0.8]).unwrap();
    let out2 = engine.forward(&["r1".to_string()], &[1], decode).unwrap();
    assert_eq!(out2.shape, vec![1, hidden]);

    engine.forget(&"r1".to_string());
}

#[test]
fn two_requests_keep_independent_histories() {
    let hidden = 2;
    let model = tiny_model(hidden);
    let range = LayerRange::new(0, 1);
    let weights = vec![zero_mlp_layer(hidden)];
    let kernels = Arc::new(CpuKernels::new());
    let mut engine = WorkerEngine::new(&model, range, weights, TpGroup::new(1), kernels).unwrap();

    let batch = Tensor::from_vec(&[2, hidden], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
    let ids = vec!["a".to_string(), "b".to_string()];
    let out = engine.forward(&ids, &[1, 1], batch).unwrap();
    assert_eq!(out.rows(), 2);

    let only_a = Tensor::from_vec(&[1, hidden], vec![1.0, 1.0]).unwrap();
    let out2 = engine.forward(&["a".to_string()], &[1], only_a).unwrap();
    assert_eq!(out2.rows(), 1);
}
