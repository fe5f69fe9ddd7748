use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use reqflow::prelude::{
    HttpClient, Request, Response, StubMatcher, StubResponse, StubTransport, ValidationOutcome,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let stub = StubTransport::new();
    stub.on_sequence(
        StubMatcher::get("/v1/orders"),
        [
            StubResponse::status(StatusCode::UNAUTHORIZED),
            StubResponse::ok().json(serde_json::json!({ "orders": ["A-1", "A-2"] })),
        ],
    );
    stub.on(
        StubMatcher::post("/v1/token"),
        StubResponse::ok()
            .json(serde_json::json!({ "token": "fresh" }))
            .delay(Duration::from_millis(50)),
    );

    let token = Arc::new(Mutex::new(String::from("expired")));
    let refresh = Request::post("/v1/token").build();
    {
        let token = Arc::clone(&token);
        refresh.on_response(move |response: Response| {
            if let Ok(body) = response.json::<TokenResponse>()
                && let Ok(mut current) = token.lock()
            {
                *current = body.token;
            }
        });
    }

    let client = HttpClient::builder("https://api.example.com")
        .client_name("reqflow-example-token-refresh")
        .validator(move |response: &Response| {
            if response.status() == Some(StatusCode::UNAUTHORIZED) {
                ValidationOutcome::RetryAfter(refresh.clone())
            } else {
                ValidationOutcome::Passed
            }
        })
        .build(stub.clone());

    let orders = Request::get("/v1/orders").max_retries(2).build();
    let response = client.send(orders.clone()).await?;

    println!(
        "GET /v1/orders => status={:?} retries_used={} body={}",
        response.status(),
        orders.current_retry(),
        response.text_lossy()
    );
    println!("token after refresh: {:?}", token.lock().map(|token| token.clone()));
    println!("exchange order: {:?}", stub.started_paths());
    println!("metrics: {:?}", client.metrics_snapshot());
    Ok(())
}
