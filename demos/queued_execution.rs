use std::time::Duration;

use reqflow::prelude::{
    DependencyQueue, HttpClient, Request, StubMatcher, StubResponse, StubTransport,
};
use reqflow::stub::StubEvent;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::any(),
        StubResponse::ok()
            .body("done")
            .delay(Duration::from_millis(20)),
    );

    let client = HttpClient::builder("https://api.example.com")
        .client_name("reqflow-example-queue")
        .queue(DependencyQueue::new(2))
        .build(stub.clone());

    let futures: Vec<_> = (1..=6)
        .map(|page| {
            client.send(
                Request::get("/v1/reports")
                    .query_pair("page", page.to_string())
                    .max_retries(2),
            )
        })
        .collect();

    if let Some(queue) = client.queue() {
        println!(
            "queued={} running={} max_concurrent={}",
            queue.len(),
            queue.running(),
            queue.max_concurrent()
        );
    }

    for future in futures {
        let response = future.wait()?;
        println!("status={:?} body={}", response.status(), response.text_lossy());
    }

    let mut running = 0_usize;
    let mut peak = 0_usize;
    for event in stub.events() {
        match event {
            StubEvent::Started { .. } => {
                running += 1;
                peak = peak.max(running);
            }
            StubEvent::Completed { .. } | StubEvent::Cancelled { .. } => {
                running = running.saturating_sub(1);
            }
        }
    }
    println!("peak concurrent exchanges: {peak}");
    println!("metrics: {:?}", client.metrics_snapshot());
    Ok(())
}
