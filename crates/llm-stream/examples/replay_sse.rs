//! Replays a captured SSE trace through the engine.
//!
//! ```text
//! cargo run -p llm-stream --example replay_sse -- trace.sse anthropic
//! ```
use std::sync::Arc;

use llm_stream::init_observability;
use llm_stream::prelude::*;

struct PrintErrors;

impl GenerationHooks for PrintErrors {
    fn on_error(
        &self,
        _at: chrono::DateTime<chrono::Utc>,
        error: &StreamError,
        _raw: Option<&serde_json::Value>,
    ) {
        eprintln!("[{:?}] {error}", error.kind());
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_observability();

    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or("usage: replay_sse <trace-file> [openai|anthropic]")?;
    let provider: ProviderKind = args.next().as_deref().unwrap_or("openai").parse()?;

    let bytes = tokio::fs::read(&path).await?;
    // Small chunks so frames straddle reads the way they do on the wire.
    let chunks: Vec<Vec<u8>> = bytes.chunks(64).map(<[u8]>::to_vec).collect();

    let mut generation = generate(provider)
        .config(StreamConfig::from_env()?)
        .hooks(Arc::new(PrintErrors))
        .start(ByteSource::from_chunks(chunks))?;

    while let Some(text) = generation.next_text().await {
        match text {
            Ok(text) => print!("{text}"),
            Err(error) => eprintln!("\nstream error: {error}"),
        }
    }
    println!();

    match generation.finish().await {
        Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        Err(failure) => {
            eprintln!("generation failed: {failure}");
            if let Some(partial) = failure.partial() {
                println!("{}", serde_json::to_string_pretty(partial)?);
            }
        }
    }
    Ok(())
}
