use llm_stream::init_observability;
use llm_stream::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_observability();

    let request = serde_json::json!({
        "model": std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
        "stream": true,
        "stream_options": {"include_usage": true},
        "messages": [{"role": "user", "content": "Stream a greeting."}],
    });
    let response = reqwest::Client::new()
        .post("https://api.openai.com/v1/chat/completions")
        .bearer_auth(std::env::var("OPENAI_API_KEY")?)
        .json(&request)
        .send()
        .await?
        .error_for_status()?;

    let mut generation = generate(ProviderKind::OpenAi)
        .request_payload(request)
        .start(ByteSource::from_response(response))?;

    while let Some(text) = generation.next_text().await {
        print!("{}", text?);
    }
    println!();

    let result = generation.finish().await?;
    println!(
        "stop={:?} tokens in={} out={}",
        result.stop_reason, result.usage.input, result.usage.output
    );
    Ok(())
}
