use std::env;

use gemini_studio::prelude::*;
use gemini_studio::refinement::CRITIC_SYSTEM_INSTRUCTION;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Without a key the demo answers from a canned transport.
    let builder = match env::var("GEMINI_API_KEY") {
        Ok(key) => StudioBuilder::new().with_api_key(key),
        Err(_) => StudioBuilder::new().with_mock(|request| {
            if request.system_instruction.as_deref() == Some(CRITIC_SYSTEM_INSTRUCTION) {
                Ok(ModelResponse::text("perfect"))
            } else {
                Ok(ModelResponse::text(
                    "```javascript\nconsole.log('hello from the sandbox');\n```",
                ))
            }
        }),
    };
    let studio = builder.build()?;

    let mut settings = studio.select_output_mode("javascript")?;
    settings.batch_size = 2;
    studio.save_settings(&settings)?;

    let mut events = studio.session().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {:?}", event);
        }
    });

    let round = studio.submit("Print a friendly greeting", None)?;
    let round_id = round.round_id.clone();
    round.wait().await;

    if let Some(round) = studio.session().round(round_id).await? {
        for output in &round.outputs {
            println!("--- {} ({} ms)", output.id, output.total_time.unwrap_or_default());
            if output.got_error {
                println!("error: {}", output.error_message.as_deref().unwrap_or("unknown"));
                continue;
            }
            println!("{}", output.output_data.as_deref().unwrap_or_default());
            if let Some(notes) = &output.critique_notes {
                println!("critique:\n{}", notes);
            }
        }
    }

    Ok(())
}
