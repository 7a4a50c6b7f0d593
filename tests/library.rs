use std::sync::Arc;

use gemini_studio::{
    ApiDefinition, ApiKind, BulkKind, CodeCheck, JsonFileStore, KeyValueStore, Library,
    ModelResponse, Round, SavedSession, StudioBuilder, StudioSettings, ToolBinding, UserProfile,
};
use serde_json::json;

fn profile(name: &str) -> UserProfile {
    serde_json::from_value(json!({
        "name": name,
        "systemInstruction": "Write tests first.",
        "model": "gemini-2.5-flash",
        "syntax": "javascript",
        "isRenderable": true
    }))
    .unwrap()
}

fn file_library(dir: &std::path::Path) -> Library {
    Library::new(Arc::new(JsonFileStore::new(dir).unwrap()))
}

#[test]
fn library_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let saved = {
        let library = file_library(dir.path());
        let saved = library.save_profile(profile("Tester")).unwrap();
        library
            .save_api(ApiDefinition {
                id: "api-1".into(),
                name: "Recipe".into(),
                kind: ApiKind::Schema,
                definition: r#"{"type":"object"}"#.into(),
                description: Some("A recipe card".into()),
            })
            .unwrap();
        library
            .save_settings(&StudioSettings {
                batch_size: 4,
                ..Default::default()
            })
            .unwrap();
        library
            .push_history(SavedSession::from_rounds(vec![Round::new("old work", vec![])]))
            .unwrap();
        saved
    };

    let reopened = file_library(dir.path());
    assert_eq!(reopened.profiles().unwrap(), vec![saved]);
    assert_eq!(reopened.apis().unwrap()[0].kind, ApiKind::Schema);
    assert_eq!(reopened.settings().unwrap().batch_size, 4);
    assert_eq!(reopened.history().unwrap()[0].preview, "old work");
}

#[test]
fn missing_keys_load_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("nested")).unwrap();
    assert_eq!(store.load("nothing-here").unwrap(), None);
    store.save("k", "v").unwrap();
    assert_eq!(store.load("k").unwrap().as_deref(), Some("v"));
}

#[test]
fn updating_a_profile_keeps_one_entry() {
    let library = Library::in_memory();
    let mut saved = library.save_profile(profile("Tester")).unwrap();
    saved.temperature = 0.9;
    library.save_profile(saved.clone()).unwrap();

    let profiles = library.profiles().unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].temperature, 0.9);
    assert!(library.delete_profile(&saved.id).unwrap());
    assert!(!library.delete_profile(&saved.id).unwrap());
}

#[test]
fn export_then_import_into_another_library() {
    let source = Library::in_memory();
    source.save_profile(profile("One")).unwrap();
    source.save_profile(profile("Two")).unwrap();
    let exported = source.export_profiles().unwrap();

    let target = Library::in_memory();
    assert_eq!(target.import_profiles(&exported).unwrap(), 2);
    assert_eq!(target.profiles().unwrap(), source.profiles().unwrap());

    let single = r#"{"name": "Solo", "systemInstruction": "Hum.", "model": "gemini-2.5-flash"}"#;
    assert_eq!(target.import_profiles(single).unwrap(), 1);
    assert!(target.import_profiles("not json").is_err());
}

#[tokio::test]
async fn selecting_a_mode_persists_settings() {
    let dir = tempfile::tempdir().unwrap();
    let studio = StudioBuilder::new()
        .with_mock(|_| Ok(ModelResponse::text("")))
        .with_library(file_library(dir.path()))
        .build()
        .unwrap();

    studio.select_output_mode("image").unwrap();

    let settings = file_library(dir.path()).settings().unwrap();
    assert_eq!(settings.output_mode, "image");
    assert_eq!(settings.model, "imagen-3.0-generate-002");
    assert!(studio.select_output_mode("missing").is_err());
}

#[tokio::test]
async fn bulk_created_code_files_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let studio = StudioBuilder::new()
        .with_mock(|request| {
            let ToolBinding::ResponseSchema(schema) = &request.binding else {
                return Ok(ModelResponse::text("OK"));
            };
            assert_eq!(schema["type"], "ARRAY");
            assert_eq!(request.model, "gemini-2.5-flash");
            Ok(ModelResponse::text(
                json!([
                    {"name": "math.js", "language": "javascript", "content": "export const x = 2;"},
                    {"name": "main.py", "language": "python", "content": "print(2)"}
                ])
                .to_string(),
            ))
        })
        .with_library(file_library(dir.path()))
        .build()
        .unwrap();

    let saved = studio
        .bulk_create("a math helper and a script", BulkKind::CodeFiles)
        .await
        .unwrap();
    assert_eq!(saved, 2);

    let files = file_library(dir.path()).code_files().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[1].language, "python");
    assert!(files.iter().all(|f| !f.id.is_empty()));

    let check = studio.check_code(&files[1].content, "python").await.unwrap();
    assert_eq!(check, CodeCheck::Clean);
}
