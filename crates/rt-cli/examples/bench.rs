//! Fires `N` concurrent `/v1/completions` requests at a running coordinator
//! to eyeball batch admission and pipeline throughput.

use std::time::Instant;

#[tokio::main]
async fn main() {
    let n: usize = std::env::var("N").ok().and_then(|v| v.parse().ok()).unwrap_or(16);
    let max_new_tokens: usize = std::env::var("MAX_NEW_TOKENS").ok().and_then(|v| v.parse().ok()).unwrap_or(8);
    let url = std::env::var("URL").unwrap_or_else(|_| "http://127.0.0.1:8080/v1/completions".into());
    let client = reqwest::Client::new();
    let start = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..n {
        let c = client.clone();
        let u = url.clone();
        tasks.push(tokio::spawn(async move {
            let body = serde_json::json!({
                "prompt_token_ids": [1, 10, 20, 30],
                "sampling_params": {
                    "temperature": 0.0,
                    "top_p": 1.0,
                    "top_k": 0,
                    "max_new_tokens": max_new_tokens,
                    "n": 1,
                },
            });
            let _ = c.post(&u).json(&body).send().await.ok();
        }));
    }
    for t in tasks {
        let _ = t.await;
    }
    println!("completed {} requests in {:.2}s", n, start.elapsed().as_secs_f32());
}
