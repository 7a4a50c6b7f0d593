use std::sync::Arc;

use async_trait::async_trait;
use gemini_studio::refinement::CRITIC_SYSTEM_INSTRUCTION;
use gemini_studio::{
    CodeExecutor, ExecutionTarget, ModelRequest, ModelResponse, ModelTransport, Request, Result,
    SessionEvent, Studio, StudioBuilder, StudioError, StudioSettings, TargetConfig, ToolBinding,
    UserProfile, Variant,
};
use serde_json::json;
use tokio::sync::Semaphore;

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

/// Holds every call until the test releases a permit.
struct Gated {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ModelTransport for Gated {
    async fn generate(&self, _request: &ModelRequest) -> Result<ModelResponse> {
        self.gate.acquire().await.unwrap().forget();
        Ok(ModelResponse::text("<p>done</p>"))
    }
}

fn settings(output_mode: &str, batch_size: usize) -> StudioSettings {
    StudioSettings {
        output_mode: output_mode.to_string(),
        batch_size,
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

fn gated_studio(settings: &StudioSettings, gate: Arc<Semaphore>) -> Studio {
    init_tracing();
    let studio = StudioBuilder::new()
        .with_transport(Arc::new(Gated { gate }))
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
        "systemInstruction": "You are B.",
        "model": "gemini-2.5-flash",
        "temperature": 1.0
    }))
    .unwrap()
}

#[tokio::test]
async fn every_output_is_busy_right_after_dispatch() {
    let gate = Arc::new(Semaphore::new(0));
    let studio = gated_studio(&settings("html", 3), gate.clone());

    let handle = studio.submit("a landing page", None).unwrap();
    let round_id = handle.round_id.clone();

    let round = studio.session().round(&round_id).await.unwrap().unwrap();
    assert_eq!(round.outputs.len(), 3);
    assert!(round.outputs.iter().all(|o| o.is_busy && o.output_data.is_none()));

    gate.add_permits(3);
    handle.wait().await;

    let round = studio.session().round(&round_id).await.unwrap().unwrap();
    assert!(round.outputs.iter().all(|o| o.is_settled() && !o.got_error));
}

#[tokio::test]
async fn batch_of_two_completes_via_direct_path() {
    let studio = studio(&settings("html", 2), |request| {
        assert!(request.system_instruction.is_some());
        assert_eq!(request.sampling.temperature, Some(0.4));
        Ok(ModelResponse::text("```html\n<p>hi</p>\n```"))
    });

    let handle = studio.submit("say hi", None).unwrap();
    let round_id = handle.round_id.clone();
    handle.wait().await;

    let round = studio.session().round(&round_id).await.unwrap().unwrap();
    assert!(!round.is_ab_test);
    assert_eq!(round.outputs.len(), 2);
    assert_ne!(round.outputs[0].id, round.outputs[1].id);
    for output in &round.outputs {
        assert!(!output.is_busy);
        assert!(!output.got_error);
        assert_eq!(output.output_data.as_deref(), Some("<p>hi</p>"));
        assert!(output.total_time.is_some());
        assert!(output.critique_notes.is_none());
        assert_eq!(output.mode_name, "HTML/JS");
    }
}

#[tokio::test]
async fn ab_test_resolves_each_variant_independently() {
    let mut config = settings("text", 2);
    config.is_ab_test_mode = true;
    config.ab_test_profile_id = Some("p1".into());
    let studio = studio(&config, |request| {
        Ok(ModelResponse::text(
            request.system_instruction.clone().unwrap_or_default(),
        ))
    });
    studio.library().save_profile(profile_b()).unwrap();

    let handle = studio.submit("compare", None).unwrap();
    let round_id = handle.round_id.clone();
    handle.wait().await;

    let round = studio.session().round(&round_id).await.unwrap().unwrap();
    assert!(round.is_ab_test);
    assert_eq!(round.outputs.len(), 4);

    let (a, b): (Vec<_>, Vec<_>) = round
        .outputs
        .iter()
        .partition(|o| o.variant == Some(Variant::A));
    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 2);
    assert!(a.iter().all(|o| o.config_id == "text"
        && o.output_data.as_deref() == Some("Answer in plain text.")));
    assert!(b.iter().all(|o| o.config_id == "p1"
        && o.variant == Some(Variant::B)
        && o.output_data.as_deref() == Some("You are B.")));
}

#[tokio::test(start_paused = true)]
async fn failing_variant_does_not_touch_its_sibling() {
    let mut config = settings("text", 1);
    config.is_ab_test_mode = true;
    config.ab_test_profile_id = Some("p1".into());
    let studio = studio(&config, |request| {
        if request.system_instruction.as_deref() == Some("You are B.") {
            Ok(ModelResponse::text("b wins"))
        } else {
            Err(StudioError::transport("rate limited"))
        }
    });
    studio.library().save_profile(profile_b()).unwrap();

    let handle = studio.submit("compare", None).unwrap();
    let round_id = handle.round_id.clone();
    handle.wait().await;

    let round = studio.session().round(&round_id).await.unwrap().unwrap();
    let a = round.outputs.iter().find(|o| o.variant == Some(Variant::A)).unwrap();
    let b = round.outputs.iter().find(|o| o.variant == Some(Variant::B)).unwrap();

    assert!(a.got_error);
    assert!(!a.is_busy);
    assert!(a.output_data.is_none());
    assert!(a.error_message.as_deref().unwrap().contains("rate limited"));

    assert!(!b.got_error);
    assert!(!b.is_busy);
    assert_eq!(b.output_data.as_deref(), Some("b wins"));
    assert!(b.error_message.is_none());
}

#[tokio::test(start_paused = true)]
async fn refining_variant_failing_midway_leaves_sibling_intact() {
    let mut config = settings("javascript", 1);
    config.use_supercharge = true;
    config.is_ab_test_mode = true;
    config.ab_test_profile_id = Some("p1".into());
    let studio = studio(&config, |request| {
        let system = request.system_instruction.as_deref().unwrap_or_default();
        if system == CRITIC_SYSTEM_INSTRUCTION {
            Ok(ModelResponse::text("Add error handling."))
        } else if system == "You are B." {
            Ok(ModelResponse::text("b wins"))
        } else if system.contains("You are revising an earlier attempt") {
            Err(StudioError::transport("quota exhausted"))
        } else {
            Ok(ModelResponse::text("```js\nconsole.log(1)\n```"))
        }
    });
    studio.library().save_profile(profile_b()).unwrap();
    let mut events = studio.session().subscribe();

    let handle = studio.submit("log one", None).unwrap();
    let round_id = handle.round_id.clone();
    handle.wait().await;

    let round = studio.session().round(&round_id).await.unwrap().unwrap();
    let a = round.outputs.iter().find(|o| o.variant == Some(Variant::A)).unwrap();
    let b = round.outputs.iter().find(|o| o.variant == Some(Variant::B)).unwrap();

    assert!(!a.is_busy);
    assert!(a.got_error);
    assert!(a.error_message.as_deref().unwrap().contains("quota exhausted"));
    assert!(a.output_data.is_none());
    assert!(a.total_time.is_some());

    assert!(!b.is_busy);
    assert!(!b.got_error);
    assert_eq!(b.output_data.as_deref(), Some("b wins"));
    assert!(b.critique_notes.is_none());

    let mut a_patches = 0;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::OutputPatched { output_id, .. } = event {
            if output_id == a.id {
                a_patches += 1;
            }
        }
    }
    // A full first iteration, the second "Generating" update and the failure.
    assert_eq!(a_patches, 6);

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    let later = studio.session().round(&round_id).await.unwrap().unwrap();
    assert_eq!(&later, &round);
}

#[tokio::test]
async fn removed_round_is_never_recreated() {
    let gate = Arc::new(Semaphore::new(0));
    let studio = gated_studio(&settings("html", 2), gate.clone());

    let handle = studio.submit("doomed", None).unwrap();
    let round_id = handle.round_id.clone();
    assert!(studio.remove_round(&round_id).await.unwrap());

    gate.add_permits(2);
    handle.wait().await;

    assert!(studio.session().round(&round_id).await.unwrap().is_none());
    assert!(studio.session().rounds().await.unwrap().is_empty());
}

#[tokio::test]
async fn unresolvable_target_is_skipped() {
    let studio = studio(&settings("html", 1), |_| Ok(ModelResponse::text("<p>x</p>")));
    let request = Request {
        prompt: "two targets".into(),
        prompt_image: None,
        target_configs: vec![TargetConfig::new("html"), TargetConfig::new("no-such-profile")],
        batch_size: 2,
    };

    let handle = studio.submit_request(request).unwrap();
    let round_id = handle.round_id.clone();
    handle.wait().await;

    let round = studio.session().round(&round_id).await.unwrap().unwrap();
    assert_eq!(round.outputs.len(), 2);
    assert!(round.outputs.iter().all(|o| o.config_id == "html"));

    let handle = studio
        .submit_request(Request::new("nothing", "no-such-profile"))
        .unwrap();
    assert!(handle.output_ids.is_empty());
    let empty_id = handle.round_id.clone();
    handle.wait().await;

    let empty = studio.session().round(&empty_id).await.unwrap().unwrap();
    assert_eq!(empty.prompt, "nothing");
    assert!(empty.outputs.is_empty());
    assert_eq!(studio.session().rounds().await.unwrap().len(), 2);
}

#[tokio::test]
async fn zero_batch_inserts_a_round_without_outputs() {
    let studio = studio(&settings("html", 0), |_| panic!("a zero batch calls no model"));

    let handle = studio.submit("nothing to do", None).unwrap();
    let round_id = handle.round_id.clone();
    assert!(handle.output_ids.is_empty());
    handle.wait().await;

    let round = studio.session().round(&round_id).await.unwrap().unwrap();
    assert!(round.outputs.is_empty());
}

#[tokio::test]
async fn image_profile_on_text_model_is_skipped() {
    let studio = studio(&settings("text", 1), |_| Ok(ModelResponse::text("fine")));
    let mut painter = profile_b();
    painter.id = "painter".into();
    painter.image_output = true;
    studio.library().save_profile(painter).unwrap();

    let handle = studio
        .submit_request(Request {
            prompt: "a cat".into(),
            prompt_image: None,
            target_configs: vec![TargetConfig::new("painter"), TargetConfig::new("text")],
            batch_size: 1,
        })
        .unwrap();
    let round_id = handle.round_id.clone();
    handle.wait().await;

    let round = studio.session().round(&round_id).await.unwrap().unwrap();
    assert_eq!(round.outputs.len(), 1);
    assert_eq!(round.outputs[0].config_id, "text");
    assert_eq!(round.outputs[0].output_data.as_deref(), Some("fine"));
}

#[tokio::test]
async fn image_mode_prepends_instruction_and_returns_data_uri() {
    let studio = studio(&settings("image", 1), |request| {
        assert!(request.image_output);
        assert_eq!(request.model, "imagen-3.0-generate-002");
        assert!(request.system_instruction.is_none());
        assert!(request.prompt.starts_with("Create a detailed, high quality image.\n\n"));
        assert!(request.prompt.ends_with("a red fox"));
        Ok(ModelResponse::text("data:image/png;base64,AAAA"))
    });

    let handle = studio.submit("a red fox", None).unwrap();
    let round_id = handle.round_id.clone();
    handle.wait().await;

    let round = studio.session().round(&round_id).await.unwrap().unwrap();
    assert_eq!(
        round.outputs[0].output_data.as_deref(),
        Some("data:image/png;base64,AAAA")
    );
}

#[tokio::test]
async fn function_call_is_rendered_as_json() {
    let studio = studio(&settings("text", 1), |_| {
        Ok(ModelResponse {
            text: String::new(),
            grounding_metadata: None,
            function_call: Some(json!({"name": "get_weather", "args": {"city": "Paris"}})),
        })
    });

    let handle = studio.submit("weather in Paris?", None).unwrap();
    let round_id = handle.round_id.clone();
    handle.wait().await;

    let output = &studio.session().round(&round_id).await.unwrap().unwrap().outputs[0];
    assert!(output.is_function_call);
    let call: serde_json::Value =
        serde_json::from_str(output.output_data.as_deref().unwrap()).unwrap();
    assert_eq!(call["functionCall"]["name"], "get_weather");
}

#[tokio::test]
async fn web_search_binding_keeps_grounding_metadata() {
    let mut config = settings("text", 1);
    config.use_google_search = true;
    let studio = studio(&config, |request| {
        assert_eq!(request.binding, ToolBinding::WebSearch);
        Ok(ModelResponse {
            text: "It is sunny.".into(),
            grounding_metadata: Some(json!({"webSearchQueries": ["weather"]})),
            function_call: None,
        })
    });

    let handle = studio.submit("weather?", None).unwrap();
    let round_id = handle.round_id.clone();
    handle.wait().await;

    let output = &studio.session().round(&round_id).await.unwrap().unwrap().outputs[0];
    assert_eq!(
        output.grounding_metadata,
        Some(json!({"webSearchQueries": ["weather"]}))
    );
}

#[tokio::test]
async fn correctable_modes_go_through_refinement() {
    let mut config = settings("javascript", 1);
    config.use_supercharge = true;
    let studio = studio(&config, |request| {
        if request.system_instruction.as_deref() == Some(CRITIC_SYSTEM_INSTRUCTION) {
            Ok(ModelResponse::text("  Perfect \n"))
        } else {
            Ok(ModelResponse::text("```js\nconsole.log(1)\n```"))
        }
    });
    let mut events = studio.session().subscribe();

    let handle = studio.submit("log one", None).unwrap();
    let round_id = handle.round_id.clone();
    handle.wait().await;

    let output = &studio.session().round(&round_id).await.unwrap().unwrap().outputs[0];
    assert_eq!(output.output_data.as_deref(), Some("console.log(1)"));
    assert!(output
        .critique_notes
        .as_deref()
        .unwrap()
        .contains("**Iteration 1**: Passed with no errors or critiques."));
    assert!(!output.is_busy);

    let mut patches = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::OutputPatched { .. }) {
            patches += 1;
        }
    }
    // Four progress updates plus the terminal write.
    assert_eq!(patches, 5);
}

#[tokio::test]
async fn new_session_archives_rounds_into_history() {
    let studio = studio(&settings("text", 1), |_| Ok(ModelResponse::text("ok")));
    for prompt in ["first prompt", "second prompt"] {
        studio.submit(prompt, None).unwrap().wait().await;
    }

    let saved = studio.start_new_session().await.unwrap().unwrap();
    assert_eq!(saved.preview, "first prompt");
    assert_eq!(saved.rounds.len(), 2);
    assert!(studio.session().rounds().await.unwrap().is_empty());
    assert!(studio.start_new_session().await.unwrap().is_none());

    studio.load_session(&saved.id).await.unwrap();
    assert_eq!(studio.session().rounds().await.unwrap().len(), 2);
    assert_eq!(studio.library().history().unwrap().len(), 1);
}
