use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ai_manager::llm::chat::{ChatError, InvokeFuture, ModelInvoker};
use ai_manager::llm::formatter::PromptData;
use ai_manager::llm::gateway::GatewayError;
use ai_manager::llm::schema_store::SchemaStore;
use ai_manager::llm::validated::{
    AttemptFailure, SchemaPromptTemplate, ValidatedChatError, ValidationOrchestrator,
};
use ai_manager::{AiManager, ManagerSettings, Prompt, PromptTable};
use serde_json::{Value, json};
use tokio::sync::Mutex;

type ScriptedReply = Result<Option<String>, ChatError>;

#[derive(Clone, Debug, PartialEq)]
struct SeenCall {
    prompt_name: String,
    model: String,
    prompt: Option<Prompt>,
}

/// Replays a fixed list of replies and records every call.
#[derive(Clone)]
struct ScriptedInvoker {
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenCall>>>,
}

impl ScriptedInvoker {
    fn with_replies(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::from(replies))),
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn text(replies: &[&str]) -> Self {
        Self::with_replies(
            replies
                .iter()
                .map(|reply| Ok(Some((*reply).to_string())))
                .collect(),
        )
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn seen(&self) -> Vec<SeenCall> {
        self.seen.lock().await.clone()
    }
}

impl ModelInvoker for ScriptedInvoker {
    fn invoke<'a>(
        &'a self,
        prompt_name: &'a str,
        _data: &'a PromptData,
        model: &'a str,
        prompts: &'a PromptTable,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().await.push(SeenCall {
                prompt_name: prompt_name.to_string(),
                model: model.to_string(),
                prompt: prompts.get(prompt_name).cloned(),
            });

            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(Some("still not structured data".to_string())))
        })
    }
}

fn data(value: Value) -> PromptData {
    value.as_object().cloned().expect("test data should be an object")
}

fn person_prompts() -> PromptTable {
    [
        ("person".to_string(), Prompt::text("Describe {name} as a record.")),
        (
            "paired".to_string(),
            Prompt::pair("You only speak YAML.", "Describe {name}."),
        ),
        ("no_schema".to_string(), Prompt::text("Say hello")),
    ]
    .into_iter()
    .collect()
}

fn person_schemas() -> SchemaStore {
    let schemas = SchemaStore::new();
    let person = json!({
        "type": "object",
        "required": ["name", "age"],
        "properties": {
            "name": {"type": "string"},
            "age": {"type": "integer", "minimum": 0}
        }
    });
    schemas
        .add("person", person.clone())
        .expect("person schema should compile");
    schemas
        .add("paired", person)
        .expect("paired schema should compile");
    schemas
}

const VALID_PERSON: &str = "Here is the JSON:\n```json\n{\"name\": \"Ada\", \"age\": 36}\n```";

#[tokio::test]
async fn unknown_schema_fails_without_invoking_model() {
    let invoker = ScriptedInvoker::text(&[VALID_PERSON]);
    let prompts = person_prompts();
    let schemas = person_schemas();

    let err = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("no_schema", &PromptData::new(), "test-model", 3)
        .await
        .expect_err("no schema is registered");

    assert_eq!(err.to_string(), "No schema available for prompt 'no_schema'");
    assert!(matches!(err, ValidatedChatError::NoSchema { .. }));
    assert_eq!(invoker.calls(), 0);
}

#[tokio::test]
async fn missing_data_keys_fail_before_any_model_call() {
    let invoker = ScriptedInvoker::text(&[VALID_PERSON]);
    let prompts = person_prompts();
    let schemas = person_schemas();

    let err = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("person", &PromptData::new(), "test-model", 3)
        .await
        .expect_err("name is missing");

    assert!(
        matches!(err, ValidatedChatError::MissingDataKeys { ref missing, .. } if missing == &["name"]),
        "unexpected error: {err:?}"
    );
    assert_eq!(invoker.calls(), 0);
}

#[tokio::test]
async fn missing_prompt_fails_before_any_model_call() {
    let invoker = ScriptedInvoker::text(&[VALID_PERSON]);
    let prompts = PromptTable::new();
    let schemas = person_schemas();

    let err = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("person", &data(json!({"name": "Ada"})), "test-model", 3)
        .await
        .expect_err("prompt table is empty");

    assert!(matches!(err, ValidatedChatError::PromptNotFound { .. }));
    assert_eq!(invoker.calls(), 0);
}

#[tokio::test]
async fn always_invalid_model_is_called_max_retries_plus_one_times() {
    let invoker = ScriptedInvoker::with_replies(Vec::new());
    let prompts = person_prompts();
    let schemas = person_schemas();

    let err = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("person", &data(json!({"name": "Ada"})), "test-model", 3)
        .await
        .expect_err("no reply ever parses");

    assert_eq!(invoker.calls(), 4);
    let exhausted = match err {
        ValidatedChatError::ExhaustedRetries(exhausted) => exhausted,
        other => panic!("expected exhausted retries, got {other:?}"),
    };
    assert_eq!(exhausted.attempts, 4);
    assert_eq!(exhausted.prompt_name, "person");
    assert_eq!(exhausted.error_message(), "Validation failed after all retries");
    assert_eq!(
        exhausted.last_response.as_deref(),
        Some("still not structured data")
    );
    let last = exhausted
        .validation_result()
        .expect("parse failures carry a validation result");
    assert!(!last.valid);
    assert!(last.data.is_none());
    assert!(!last.errors.is_empty());
}

#[tokio::test]
async fn succeeds_on_third_attempt_and_stops_calling() {
    let invoker = ScriptedInvoker::text(&[
        "Sorry, I cannot do that",
        "{\"name\": \"Ada\"}",
        VALID_PERSON,
        VALID_PERSON,
    ]);
    let prompts = person_prompts();
    let schemas = person_schemas();

    let value = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("person", &data(json!({"name": "Ada"})), "test-model", 3)
        .await
        .expect("third reply is valid");

    assert_eq!(value, json!({"name": "Ada", "age": 36}));
    assert_eq!(invoker.calls(), 3);
}

#[tokio::test]
async fn zero_retries_means_exactly_one_attempt() {
    let invoker = ScriptedInvoker::text(&["{\"name\": \"Ada\", \"age\": -1}"]);
    let prompts = person_prompts();
    let schemas = person_schemas();

    let err = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("person", &data(json!({"name": "Ada"})), "test-model", 0)
        .await
        .expect_err("age violates minimum");

    assert_eq!(invoker.calls(), 1);
    let exhausted = match err {
        ValidatedChatError::ExhaustedRetries(exhausted) => exhausted,
        other => panic!("expected exhausted retries, got {other:?}"),
    };
    assert_eq!(exhausted.attempts, 1);
    let AttemptFailure::SchemaMismatch(result) = &exhausted.last_failure else {
        panic!("expected schema mismatch, got {:?}", exhausted.last_failure);
    };
    assert!(result.errors.iter().any(|issue| issue.path == "/age"));
    assert_eq!(result.data, Some(json!({"name": "Ada", "age": -1})));
}

#[tokio::test]
async fn empty_replies_and_faults_are_retried() {
    let invoker = ScriptedInvoker::with_replies(vec![
        Ok(None),
        Ok(Some("   \n".to_string())),
        Err(ChatError::Gateway(GatewayError::Timeout)),
        Ok(Some("name: Ada\nage: 36".to_string())),
    ]);
    let prompts = person_prompts();
    let schemas = person_schemas();

    let value = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("person", &data(json!({"name": "Ada"})), "test-model", 3)
        .await
        .expect("yaml reply on the last attempt is valid");

    assert_eq!(value, json!({"name": "Ada", "age": 36}));
    assert_eq!(invoker.calls(), 4);
}

#[tokio::test]
async fn fault_on_final_attempt_is_reported_as_exception() {
    let invoker = ScriptedInvoker::with_replies(vec![
        Ok(Some("nope".to_string())),
        Err(ChatError::Gateway(GatewayError::ProviderFailure(
            "status=503 code=overloaded".to_string(),
        ))),
    ]);
    let prompts = person_prompts();
    let schemas = person_schemas();

    let err = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("person", &data(json!({"name": "Ada"})), "test-model", 1)
        .await
        .expect_err("final attempt faults");

    let exhausted = match err {
        ValidatedChatError::ExhaustedRetries(exhausted) => exhausted,
        other => panic!("expected exhausted retries, got {other:?}"),
    };
    assert!(
        exhausted
            .error_message()
            .starts_with("Exception after all retries: provider request failed")
    );
    assert_eq!(exhausted.last_response, None);
    assert!(exhausted.validation_result().is_none());
}

#[tokio::test]
async fn empty_final_attempt_reports_no_response() {
    let invoker = ScriptedInvoker::with_replies(vec![
        Ok(Some("garbage one".to_string())),
        Ok(None),
    ]);
    let prompts: PromptTable = [("fruits".to_string(), Prompt::text("List fruits"))]
        .into_iter()
        .collect();
    let schemas = SchemaStore::new();
    schemas.add_example("fruits", "- apple\n- banana");

    let err = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("fruits", &PromptData::new(), "test-model", 1)
        .await
        .expect_err("final reply is empty");

    assert_eq!(invoker.calls(), 2);
    let exhausted = match err {
        ValidatedChatError::ExhaustedRetries(exhausted) => exhausted,
        other => panic!("expected exhausted retries, got {other:?}"),
    };
    assert_eq!(exhausted.attempts, 2);
    assert!(matches!(exhausted.last_failure, AttemptFailure::EmptyResponse));
    assert_eq!(exhausted.last_response, None);
    assert!(exhausted.validation_result().is_none());
}

#[tokio::test]
async fn template_placeholders_are_checked_before_any_model_call() {
    let invoker = ScriptedInvoker::text(&[VALID_PERSON]);
    let prompts = person_prompts();
    let schemas = person_schemas();
    let template = SchemaPromptTemplate::new(
        "{base_prompt}\nAnswer like {\"ok\": true}.\n{schema_example}",
    );

    let err = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .with_template(template)
        .generate_validated("person", &data(json!({"name": "Ada"})), "test-model", 3)
        .await
        .expect_err("template brace is an unfilled placeholder");

    assert!(
        matches!(err, ValidatedChatError::MissingDataKeys { ref missing, .. } if missing == &["\"ok\": true"]),
        "unexpected error: {err:?}"
    );
    assert_eq!(invoker.calls(), 0);
}

#[tokio::test]
async fn augmented_prompt_keeps_system_half_and_embeds_schema() {
    let invoker = ScriptedInvoker::text(&["name: Ada\nage: 36"]);
    let prompts = person_prompts();
    let schemas = person_schemas();

    ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("paired", &data(json!({"name": "Ada"})), "small-model", 2)
        .await
        .expect("yaml reply is valid");

    let seen = invoker.seen().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].prompt_name, "paired");
    assert_eq!(seen[0].model, "small-model");

    let prompt = seen[0].prompt.clone().expect("augmented prompt is visible");
    assert_eq!(prompt.system_template(), Some("You only speak YAML."));
    let user = prompt.user_template().expect("user half");
    assert!(user.starts_with("Describe {name}."));
    assert!(user.contains("Please respond with structured data in the following format:"));
    assert!(user.contains("\"required\""));
    assert!(user.ends_with("Return only the structured data without any additional text or explanations."));

    // The caller's table is untouched.
    assert_eq!(
        prompts.get("paired"),
        Some(&Prompt::pair("You only speak YAML.", "Describe {name}."))
    );
}

#[tokio::test]
async fn example_schemas_accept_any_structured_reply() {
    let invoker = ScriptedInvoker::text(&["plain words", "- apples\n- pears"]);
    let prompts: PromptTable = [("fruits".to_string(), Prompt::text("List fruits"))]
        .into_iter()
        .collect();
    let schemas = SchemaStore::new();
    schemas.add_example("fruits", "- apple\n- banana");

    let value = ValidationOrchestrator::new(&invoker, &prompts, &schemas)
        .generate_validated("fruits", &PromptData::new(), "test-model", 3)
        .await
        .expect("second reply parses");

    assert_eq!(value, json!(["apples", "pears"]));
    assert_eq!(invoker.calls(), 2);
}

#[tokio::test]
async fn manager_loads_directories_and_runs_both_chat_paths() {
    let prompt_dir = tempfile::tempdir().expect("prompt tempdir");
    let schema_dir = tempfile::tempdir().expect("schema tempdir");
    fs::write(
        prompt_dir.path().join("city.txt"),
        "Give facts about {city}.",
    )
    .expect("write prompt");
    fs::write(
        prompt_dir.path().join("greeting.txt"),
        "Greet {name} warmly.",
    )
    .expect("write prompt");
    fs::write(
        schema_dir.path().join("city.schema.json"),
        json!({
            "type": "object",
            "required": ["city", "population"],
            "properties": {
                "city": {"type": "string"},
                "population": {"type": "integer"}
            }
        })
        .to_string(),
    )
    .expect("write schema");

    let schemas = SchemaStore::new();
    let loaded = schemas.load(schema_dir.path()).expect("schema dir loads");
    assert_eq!(loaded, 1);

    let invoker = ScriptedInvoker::text(&[
        "Hello Grace, lovely to see you!",
        "The result:\n{\"city\": \"Oslo\", \"population\": \"many\"}",
        "{\"city\": \"Oslo\", \"population\": 709000}",
    ]);
    let settings = ManagerSettings {
        chat_model: "default-model".to_string(),
        ..ManagerSettings::default()
    };
    let manager = AiManager::with_parts(
        settings,
        PromptTable::load_dir(prompt_dir.path()),
        schemas,
        Arc::new(invoker.clone()),
    );

    assert_eq!(manager.schema_prompts(), vec!["city".to_string()]);

    let greeting = manager
        .chat("greeting", &data(json!({"name": "Grace"})), None)
        .await;
    assert_eq!(greeting.as_deref(), Some("Hello Grace, lovely to see you!"));

    let facts = manager
        .chat_validated("city", &data(json!({"city": "Oslo"})), Some("big-model"))
        .await
        .expect("second validated reply conforms");
    assert_eq!(facts["population"], 709000);

    let models = invoker
        .seen()
        .await
        .into_iter()
        .map(|call| call.model)
        .collect::<Vec<_>>();
    assert_eq!(models, vec!["default-model", "big-model", "big-model"]);

    let err = manager
        .chat_validated("greeting", &data(json!({"name": "Grace"})), None)
        .await
        .expect_err("greeting has no schema");
    assert!(matches!(err, ValidatedChatError::NoSchema { .. }));
    assert_eq!(invoker.calls(), 3);
}
