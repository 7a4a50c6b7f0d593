use std::sync::Arc;

use async_trait::async_trait;
use gemini_studio::refinement::CRITIC_SYSTEM_INSTRUCTION;
use gemini_studio::{
    ChatRole, CodeExecutor, ExecutionTarget, ModelRequest, ModelResponse, Result, SessionKind,
    Studio, StudioBuilder, StudioError, StudioSettings, UserProfile, Variant,
};
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

struct NoErrors;

#[async_trait]
impl CodeExecutor for NoErrors {
    async fn run(&self, _artifact: &str, _target: &ExecutionTarget) -> Vec<String> {
        Vec::new()
    }
}

fn chat_settings(output_mode: &str) -> StudioSettings {
    StudioSettings {
        output_mode: output_mode.to_string(),
        is_chat_mode: true,
        use_supercharge: false,
        ..Default::default()
    }
}

fn studio(
    settings: &StudioSettings,
    handler: impl Fn(&ModelRequest) -> Result<ModelResponse> + Send + Sync + 'static,
) -> Studio {
    init_tracing();
    let studio = StudioBuilder::new()
        .with_mock(handler)
        .with_executor(Arc::new(NoErrors))
        .build()
        .unwrap();
    studio.save_settings(settings).unwrap();
    studio
}

fn profile_b() -> UserProfile {
    serde_json::from_value(json!({
        "id": "p1",
        "name": "Variant B",
        "icon": "science",
        "systemInstruction": "You are B.",
        "model": "gemini-2.5-flash"
    }))
    .unwrap()
}

fn echo_system(request: &ModelRequest) -> Result<ModelResponse> {
    Ok(ModelResponse::text(
        request.system_instruction.clone().unwrap_or_default(),
    ))
}

#[tokio::test]
async fn plain_chat_answers_with_markdown_profile() {
    let mut settings = chat_settings("javascript");
    settings.use_hybrid_chat = false;
    let studio = studio(&settings, echo_system);

    let message = studio.send_chat_message("What is a closure?").await.unwrap();
    assert_eq!(message.role, ChatRole::Model);

    let reply = message.reply().unwrap();
    assert!(!reply.is_thinking);
    assert_eq!(reply.responses.len(), 1);

    let response = &reply.responses[0];
    assert_eq!(response.profile.id, "markdown");
    assert_eq!(response.final_code, "Answer in well structured Markdown.");
    assert_eq!(response.fixer_notes, "Direct response from a single agent.");
    assert_eq!(response.review, "N/A");
    assert!(!response.has_error);
    assert!(response.variant.is_none());

    let history = studio.chat_history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text(), Some("What is a closure?"));
    assert_eq!(history[1], message);
}

#[tokio::test]
async fn ab_chat_puts_both_answers_in_one_message() {
    let mut settings = chat_settings("text");
    settings.is_ab_test_mode = true;
    settings.ab_test_profile_id = Some("p1".into());
    let studio = studio(&settings, echo_system);
    studio.library().save_profile(profile_b()).unwrap();

    let message = studio.send_chat_message("compare").await.unwrap();
    let responses = &message.reply().unwrap().responses;
    assert_eq!(responses.len(), 2);

    let a = responses.iter().find(|r| r.variant == Some(Variant::A)).unwrap();
    let b = responses.iter().find(|r| r.variant == Some(Variant::B)).unwrap();
    assert_eq!(a.profile.id, "text");
    assert_eq!(a.final_code, "Answer in plain text.");
    assert_eq!(b.profile.id, "p1");
    assert_eq!(b.profile.icon, "science");
    assert_eq!(b.final_code, "You are B.");
}

#[tokio::test(start_paused = true)]
async fn failing_profile_answers_with_an_error_response() {
    let mut settings = chat_settings("text");
    settings.is_ab_test_mode = true;
    settings.ab_test_profile_id = Some("p1".into());
    let studio = studio(&settings, |request| {
        if request.system_instruction.as_deref() == Some("You are B.") {
            Err(StudioError::transport("service unavailable"))
        } else {
            Ok(ModelResponse::text("fine"))
        }
    });
    studio.library().save_profile(profile_b()).unwrap();

    let message = studio.send_chat_message("compare").await.unwrap();
    let reply = message.reply().unwrap();
    assert!(!reply.is_thinking);

    let a = reply.responses.iter().find(|r| r.variant == Some(Variant::A)).unwrap();
    let b = reply.responses.iter().find(|r| r.variant == Some(Variant::B)).unwrap();
    assert!(!a.has_error);
    assert_eq!(a.final_code, "fine");

    assert!(b.has_error);
    assert_eq!(b.final_code, "Sorry, I encountered an error.");
    assert!(b.fixer_notes.starts_with("Error: "));
    assert!(b.fixer_notes.contains("service unavailable"));
    assert_eq!(b.review, "The agent failed to respond.");
}

#[tokio::test]
async fn missing_ab_profile_is_left_out_of_the_reply() {
    let mut settings = chat_settings("text");
    settings.is_ab_test_mode = true;
    settings.ab_test_profile_id = Some("deleted".into());
    let studio = studio(&settings, |_| Ok(ModelResponse::text("only A")));

    let message = studio.send_chat_message("hello").await.unwrap();
    let responses = &message.reply().unwrap().responses;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].final_code, "only A");
}

#[tokio::test]
async fn supercharged_code_chat_reuses_refinement() {
    let mut settings = chat_settings("javascript");
    settings.use_supercharge = true;
    let studio = studio(&settings, |request| {
        if request.system_instruction.as_deref() == Some(CRITIC_SYSTEM_INSTRUCTION) {
            Ok(ModelResponse::text("PERFECT"))
        } else {
            Ok(ModelResponse::text("```js\nconsole.log('hi')\n```"))
        }
    });

    let message = studio.send_chat_message("greet").await.unwrap();
    let response = &message.reply().unwrap().responses[0];
    assert_eq!(response.final_code, "console.log('hi')");
    assert_eq!(
        response.fixer_notes,
        "This code was improved using the Supercharge self-correction process."
    );
    assert!(response.review.contains("Passed with no errors or critiques."));
    assert!(studio.session().rounds().await.unwrap().is_empty());
}

#[tokio::test]
async fn chat_sessions_archive_and_reload() {
    let studio = studio(&chat_settings("text"), |_| Ok(ModelResponse::text("hi there")));
    studio.send_chat_message("Say hello to the team").await.unwrap();

    let saved = studio.start_new_session().await.unwrap().unwrap();
    assert_eq!(saved.kind, SessionKind::Chat);
    assert_eq!(saved.preview, "Say hello to the team");
    assert_eq!(saved.chat.len(), 2);
    assert!(studio.chat_history().await.unwrap().is_empty());

    studio.set_chat_mode(false).unwrap();
    studio.submit("a studio prompt", None).unwrap().wait().await;

    studio.load_session(&saved.id).await.unwrap();
    assert!(studio.settings().unwrap().is_chat_mode);
    assert_eq!(studio.chat_history().await.unwrap(), saved.chat);
    assert!(studio.session().rounds().await.unwrap().is_empty());

    let history = studio.library().history().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].kind, SessionKind::Studio);
    assert_eq!(history[0].preview, "a studio prompt");
}
