//! End-to-end scenario (spec §8 scenario 1): one worker covering the whole
//! model, prefill + two greedy decode steps, via the real HTTP surfaces of
//! both `rt-coordinator` and `rt-worker`.

use rt_core::descriptor::ModelDescriptor;
use rt_core::LayerWeights;
use rt_kernels::Tensor;

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

async fn spawn_worker() -> std::net::SocketAddr {
    let app = rt_worker::router(rt_worker::AppState::new(rt_common::RuntimeConfig::default()));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

async fn spawn_coordinator(total_layers: usize) -> (String, u16) {
    let state = rt_coordinator::AppState::new(total_layers, 1, rt_common::RuntimeConfig::default());
    let app = rt_coordinator::router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr.ip().to_string(), addr.port())
}

#[tokio::test]
async fn single_worker_prefill_then_decode_completes_deterministically() {
    let hidden = 2;
    let vocab = 4;
    let worker_addr = spawn_worker().await;
    let (coord_ip, coord_port) = spawn_coordinator(1).await;
    let base = format!("http://{coord_ip}:{coord_port}");
    let client = reqwest::Client::new();

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert!(health.status().is_success());

    let register_body = serde_json::json!({
        "client_id": "w0",
        "host": worker_addr.ip().to_string(),
        "port": worker_addr.port(),
    });
    let r = client.post(format!("{base}/register_client")).json(&register_body).send().await.unwrap();
    assert!(r.status().is_success());
    let reg: serde_json::Value = r.json().await.unwrap();
    assert_eq!(reg["start_idx"], 0);
    assert_eq!(reg["end_idx"], 1);

    let model = ModelDescriptor {
        num_layers: 1,
        hidden_size: hidden,
        num_attention_heads: 1,
        num_kv_heads: 1,
        head_dim: hidden,
        intermediate_size: hidden,
        vocab_size: vocab,
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        max_position_embeddings: 16,
        eos_token_ids: vec![],
    };
    let embed_tokens_t = Tensor::from_vec(&[vocab, hidden], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0]).unwrap();
    let lm_head_t = embed_tokens_t.clone();
    let set_model_body = serde_json::json!({
        "model": model,
        "embed_tokens_t": embed_tokens_t,
        "final_norm_weight": vec![1.0f32; hidden],
        "lm_head_t": lm_head_t,
        "layer_weights": [tiny_layer(hidden)],
    });
    let r = client.post(format!("{base}/admin/set_model")).json(&set_model_body).send().await.unwrap();
    assert!(r.status().is_success());

    let init_body = serde_json::json!({
        "client_id": "w0",
        "pp_rank": reg["pp_rank"],
        "start_idx": reg["start_idx"],
        "end_idx": reg["end_idx"],
    });
    let r = client.post(format!("{base}/init_model")).json(&init_body).send().await.unwrap();
    assert!(r.status().is_success());

    let completion_body = serde_json::json!({
        "prompt_token_ids": [1, 2],
        "sampling_params": {
            "temperature": 0.0,
            "top_p": 1.0,
            "top_k": 0,
            "max_new_tokens": 2,
            "n": 1,
        },
    });
    let r = client.post(format!("{base}/v1/completions")).json(&completion_body).send().await.unwrap();
    assert!(r.status().is_success());
    let out: serde_json::Value = r.json().await.unwrap();
    assert_eq!(out["is_stop"], true);
    let completions = out["completions"].as_array().unwrap();
    assert_eq!(completions.len(), 1);
    let token_ids = completions[0]["token_ids"].as_array().unwrap();
    assert_eq!(token_ids.len(), 2);
    assert_eq!(completions[0]["finish_reason"], "length");

    let metrics = client.get(format!("{base}/metrics")).send().await.unwrap();
    assert!(metrics.status().is_success());
}

#[tokio::test]
async fn completions_before_any_worker_is_registered_is_rejected() {
    let (coord_ip, coord_port) = spawn_coordinator(4).await;
    let base = format!("http://{coord_ip}:{coord_port}");
    let client = reqwest::Client::new();

    let body = serde_json::json!({
        "prompt_token_ids": [1],
        "sampling_params": { "temperature": 0.0, "top_p": 1.0, "top_k": 0, "max_new_tokens": 1, "n": 1 },
    });
    let r = client.post(format!("{base}/v1/completions")).json(&body).send().await.unwrap();
    assert_eq!(r.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
}
