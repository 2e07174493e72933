//! Basic marketplace client walkthrough
//!
//! Usage:
//!   cargo run --example basic_usage

use serde_json::json;
use threadline_rs_client::{
    ApiClient, ApiClientConfig, RealtimeChannel, RealtimeConfig, RealtimeHooks, Role,
    SessionContext,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Configuration
    let config = ApiClientConfig::from_env();
    let token = std::env::var("THREADLINE_TOKEN").ok();

    println!("=== Threadline Rust Client Example ===");
    println!("API base URL: {}", config.base_url);
    println!("Realtime URL: {}", config.realtime_url());
    println!();

    // Create the API client (owns the token store and refresh protocol)
    let client = ApiClient::new(config.clone());
    println!("✓ API client created");

    // Seed a buyer session when a token is provided; otherwise requests go
    // out unauthenticated and public endpoints still work.
    if let Some(token) = &token {
        client.tokens().set_token(token, Role::Buyer);
        println!("✓ Buyer token stored (cookie mirror set for 24h)");
    } else {
        println!("! No THREADLINE_TOKEN set, continuing unauthenticated");
    }
    println!();

    // Fetch the product catalog from the buyer portal
    let session = SessionContext::from_path("/buyer-portal/marketplace");
    println!("Fetching products...");
    match client.get(&session, "/products").await {
        Ok(body) => {
            println!("✓ Got products!");
            println!("  {body}");
        }
        Err(e) => {
            println!("! Product fetch failed: {e}");
            println!("  (This is expected if the API server is not running)");
        }
    }
    println!();

    // Open the realtime channel for chat updates
    let realtime_config = RealtimeConfig::new(config.realtime_url(), token);
    let hooks = RealtimeHooks::new()
        .on_connect(|| println!("✓ Realtime channel connected"))
        .on_disconnect(|| println!("! Realtime channel disconnected"))
        .on_error(|reason| println!("! Realtime channel error: {reason}"));

    let mut channel = RealtimeChannel::connect(realtime_config, hooks);
    channel.on("chat:message", |data| {
        println!("  chat:message -> {data}");
    });

    // Give the channel a moment, then say hello
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
    channel.emit("chat:message", json!({"body": "hello from rust"}));

    println!();
    println!("Listening for realtime events for 30 seconds...");
    tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;

    channel.disconnect().await;
    println!();
    println!("Done!");

    Ok(())
}
