use rt_core::descriptor::{LayerRange, ModelDescriptor};
use rt_core::LayerWeights;
use rt_kernels::Tensor;
use rt_worker::{router, AppState};

fn identity(n: usize) -> Tensor {
    let mut data = vec![0.0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Tensor::from_vec(&[n, n], data).unwrap()
}

fn tiny_layer(hidden: usize) -> LayerWeights {
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

#[tokio::test]
async fn health_then_set_config_then_forward() {
    let app = router(AppState::new(rt_common::RuntimeConfig::default()));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let base = format!("http://{}:{}", addr.ip(), addr.port());
    let client = reqwest::Client::new();

    let health: serde_json::Value =
        client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["configured"], false);

    let hidden = 2;
    let body = serde_json::json!({
        "master_url": "http://127.0.0.1:9/coordinator",
        "forward_url": null,
        "pp_rank": 0,
        "tp_world_size": 1,
        "layer_range": { "start": 0, "end": 1 },
        "model": ModelDescriptor {
            num_layers: 1,
            hidden_size: hidden,
            num_attention_heads: 1,
            num_kv_heads: 1,
            head_dim: hidden,
            intermediate_size: hidden,
            vocab_size: 32,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            max_position_embeddings: 16,
            eos_token_ids: vec![2],
        },
        "layer_weights": [tiny_layer(hidden)],
    });
    let r = client.post(format!("{base}/set_config")).json(&body).send().await.unwrap();
    assert!(r.status().is_success());

    let forward_body = serde_json::json!({
        "batch": [{ "request_id": "r1", "segment_length": 2 }],
        "hidden_states": Tensor::from_vec(&[2, hidden], vec![1.0, 0.0, 0.0, 1.0]).unwrap(),
    });
    let r = client.post(format!("{base}/forward")).json(&forward_body).send().await.unwrap();
    assert!(r.status().is_success());
    let parsed: serde_json::Value = r.json().await.unwrap();
    assert!(parsed["hidden_states"]["shape"].is_array());

    srv.abort();
}
