use super::*;
use crate::llm::streaming::testing::ndjson_line;
use axum::{
    extract::RawQuery,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// Event collector for streaming tests
#[derive(Clone, Default)]
struct EventCollector {
    events: Arc<Mutex<Vec<ChatEvent>>>,
}

impl EventCollector {
    fn callback(&self) -> EventCallback {
        let events = self.events.clone();
        Box::new(move |event: &ChatEvent| {
            events.lock().unwrap().push(event.clone());
            Ok(())
        })
    }

    fn events(&self) -> Vec<ChatEvent> {
        self.events.lock().unwrap().clone()
    }
}

// Behaviour of the mocked local model server
#[derive(Clone)]
struct OllamaScript {
    tags_status: StatusCode,
    generate_status: StatusCode,
    generate_error: Option<String>,
    chunks: Vec<Vec<u8>>,
    // Keep the connection open after the last chunk
    hang: bool,
}

impl OllamaScript {
    fn streaming(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            tags_status: StatusCode::OK,
            generate_status: StatusCode::OK,
            generate_error: None,
            chunks,
            hang: false,
        }
    }
}

#[derive(Clone, Default)]
struct Recorder {
    tags_hits: Arc<AtomicUsize>,
    generate_hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<serde_json::Value>>>,
    queries: Arc<Mutex<Vec<String>>>,
}

async fn serve(app: Router) -> String {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = TcpListener::bind(addr).await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", server_addr)
}

// Helper to create a mock local model server
async fn create_ollama_server(script: OllamaScript, recorder: Recorder) -> String {
    let tags_recorder = recorder.clone();
    let tags_status = script.tags_status;

    let app = Router::new()
        .route(
            "/api/tags",
            get(move || {
                let recorder = tags_recorder.clone();
                async move {
                    recorder.tags_hits.fetch_add(1, Ordering::SeqCst);
                    (
                        tags_status,
                        Json(json!({
                            "models": [
                                { "name": "deepseek-r1:1.5b" },
                                { "name": "llama3.2:latest" }
                            ]
                        })),
                    )
                }
            }),
        )
        .route(
            "/api/generate",
            post(move |Json(body): Json<serde_json::Value>| {
                let script = script.clone();
                let recorder = recorder.clone();
                async move {
                    recorder.generate_hits.fetch_add(1, Ordering::SeqCst);
                    recorder.bodies.lock().unwrap().push(body);

                    if let Some(error) = script.generate_error {
                        return (script.generate_status, Json(json!({ "error": error })))
                            .into_response();
                    }

                    let chunks = stream::iter(
                        script
                            .chunks
                            .into_iter()
                            .map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk))),
                    );
                    let body = if script.hang {
                        axum::body::Body::from_stream(chunks.chain(stream::pending()))
                    } else {
                        axum::body::Body::from_stream(chunks)
                    };

                    Response::builder()
                        .status(script.generate_status)
                        .header("content-type", "application/x-ndjson")
                        .body(body)
                        .unwrap()
                }
            }),
        );

    serve(app).await
}

// Helper to create a mock Gemini endpoint answering every request with `reply`
async fn create_gemini_server(
    status: StatusCode,
    reply: serde_json::Value,
    recorder: Recorder,
) -> String {
    let app = Router::new().route(
        "/v1beta/models/*rest",
        post(
            move |RawQuery(query): RawQuery, Json(body): Json<serde_json::Value>| {
                let reply = reply.clone();
                let recorder = recorder.clone();
                async move {
                    recorder.generate_hits.fetch_add(1, Ordering::SeqCst);
                    recorder.bodies.lock().unwrap().push(body);
                    recorder
                        .queries
                        .lock()
                        .unwrap()
                        .push(query.unwrap_or_default());
                    (status, Json(reply))
                }
            },
        ),
    );

    format!("{}/v1beta", serve(app).await)
}

// Address nothing listens on
async fn closed_port_url() -> String {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn local_transport(base_url: &str) -> ChatTransport {
    ChatTransport::new(
        TransportConfig {
            ollama_base_url: base_url.to_string(),
            emit_interval: Duration::ZERO,
            ..Default::default()
        },
        ProviderRegistry::new(),
    )
}

fn hosted_transport(gemini_url: &str) -> ChatTransport {
    ChatTransport::new(
        TransportConfig {
            ollama_base_url: "http://127.0.0.1:9".to_string(),
            word_delay: Duration::from_millis(1),
            ..Default::default()
        },
        ProviderRegistry::with_defaults(gemini_url),
    )
}

fn request(message: &str, model: &str) -> ChatRequest {
    ChatRequest {
        message: message.to_string(),
        context: String::new(),
        model: model.to_string(),
        api_key: None,
    }
}

#[tokio::test]
async fn test_local_stream_splits_thinking() {
    let recorder = Recorder::default();
    let mut chunks = vec![
        ndjson_line("<think>", false),
        ndjson_line("reasoning A", false),
        ndjson_line("</think>answer A", false),
    ];
    chunks.push(br#"{"model":"deepseek-r1:1.5b","done":true,"eval_count":12}"#.to_vec());
    let url = create_ollama_server(OllamaScript::streaming(chunks), recorder.clone()).await;
    let transport = local_transport(&url);
    let collector = EventCollector::default();

    let mut req = request("What is A?", "");
    req.context = "User: hi\n\nAssistant: hello".to_string();
    let outcome = transport
        .send(&req, &CancellationToken::new(), &collector.callback())
        .await;

    let expected = Snapshot {
        thinking: "reasoning A".to_string(),
        response: "answer A".to_string(),
    };
    assert!(matches!(&outcome, TurnOutcome::Completed(s) if *s == expected));

    let events = collector.events();
    let last = events.last().unwrap();
    assert!(last.done);
    assert!(!last.is_failure());
    assert_eq!(last.snapshot(), expected);
    assert_eq!(events.iter().filter(|e| e.done).count(), 1);
    assert!(events
        .iter()
        .all(|e| !e.thinking.contains("<think>") && !e.response.contains("</think>")));

    assert_eq!(recorder.tags_hits.load(Ordering::SeqCst), 1);
    let bodies = recorder.bodies.lock().unwrap();
    assert_eq!(bodies[0]["model"], "deepseek-r1:1.5b");
    assert_eq!(bodies[0]["stream"], true);
    assert_eq!(
        bodies[0]["prompt"],
        "User: hi\n\nAssistant: hello\n\nHuman: What is A?\n\nAssistant:"
    );
    assert_eq!(bodies[0]["options"]["num_ctx"], 4096);
}

#[tokio::test]
async fn test_local_stream_without_tags() {
    let recorder = Recorder::default();
    let chunks = vec![ndjson_line("no tags ", false), ndjson_line("here", true)];
    let url = create_ollama_server(OllamaScript::streaming(chunks), recorder).await;
    let transport = local_transport(&url);
    let collector = EventCollector::default();

    let outcome = transport
        .send(
            &request("hi", "llama3.2:latest"),
            &CancellationToken::new(),
            &collector.callback(),
        )
        .await;

    assert_eq!(outcome.snapshot().thinking, "");
    assert_eq!(outcome.snapshot().response, "no tags here");
}

#[tokio::test]
async fn test_probe_failure_skips_generation() {
    let recorder = Recorder::default();
    let mut script = OllamaScript::streaming(vec![ndjson_line("never", true)]);
    script.tags_status = StatusCode::INTERNAL_SERVER_ERROR;
    let url = create_ollama_server(script, recorder.clone()).await;
    let transport = local_transport(&url);
    let collector = EventCollector::default();

    let outcome = transport
        .send(&request("hi", ""), &CancellationToken::new(), &collector.callback())
        .await;

    assert!(matches!(
        outcome,
        TurnOutcome::Failed {
            error: TransportError::Unreachable(_),
            ..
        }
    ));
    let events = collector.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].error_kind, Some(ErrorKind::Unreachable));
    assert!(events[0].error.as_ref().unwrap().contains("not running"));
    assert_eq!(recorder.generate_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_server() {
    let transport = local_transport(&closed_port_url().await);
    let collector = EventCollector::default();

    let outcome = transport
        .send(&request("hi", ""), &CancellationToken::new(), &collector.callback())
        .await;

    assert!(matches!(
        outcome,
        TurnOutcome::Failed {
            error: TransportError::Unreachable(_),
            ..
        }
    ));
    assert_eq!(collector.events().len(), 1);
}

#[tokio::test]
async fn test_generate_rejected() {
    let recorder = Recorder::default();
    let mut script = OllamaScript::streaming(Vec::new());
    script.generate_status = StatusCode::NOT_FOUND;
    script.generate_error = Some("model 'missing' not found".to_string());
    let url = create_ollama_server(script, recorder).await;
    let transport = local_transport(&url);
    let collector = EventCollector::default();

    let outcome = transport
        .send(
            &request("hi", "missing"),
            &CancellationToken::new(),
            &collector.callback(),
        )
        .await;

    match outcome {
        TurnOutcome::Failed {
            error: TransportError::Rejected { status, message },
            ..
        } => {
            assert_eq!(status, 404);
            assert_eq!(message, "model 'missing' not found");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(collector.events()[0].error_kind, Some(ErrorKind::Rejected));
}

#[tokio::test]
async fn test_stalled_stream_keeps_partial_response() {
    let recorder = Recorder::default();
    let mut script = OllamaScript::streaming(vec![ndjson_line("partial answer", false)]);
    script.hang = true;
    let url = create_ollama_server(script, recorder).await;
    let transport = ChatTransport::new(
        TransportConfig {
            ollama_base_url: url,
            idle_timeout: Duration::from_millis(300),
            emit_interval: Duration::ZERO,
            ..Default::default()
        },
        ProviderRegistry::new(),
    );
    let collector = EventCollector::default();

    let outcome = transport
        .send(&request("hi", ""), &CancellationToken::new(), &collector.callback())
        .await;

    match outcome {
        TurnOutcome::Failed { error, partial } => {
            assert_eq!(error.kind(), ErrorKind::Stalled);
            assert_eq!(partial.response, "partial answer");
        }
        other => panic!("expected stall, got {other:?}"),
    }
    let last = collector.events().pop().unwrap();
    assert!(last.done);
    assert_eq!(last.error_kind, Some(ErrorKind::Stalled));
    assert_eq!(last.response, "partial answer");
}

#[tokio::test]
async fn test_cancel_releases_open_stream() {
    let recorder = Recorder::default();
    let mut script = OllamaScript::streaming(vec![ndjson_line("<think>first", false)]);
    script.hang = true;
    let url = create_ollama_server(script, recorder).await;
    let transport = local_transport(&url);
    let cancel = CancellationToken::new();
    let collector = EventCollector::default();
    let callback: EventCallback = {
        let events = collector.events.clone();
        let cancel = cancel.clone();
        Box::new(move |event: &ChatEvent| {
            events.lock().unwrap().push(event.clone());
            cancel.cancel();
            Ok(())
        })
    };

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        transport.send(&request("hi", ""), &cancel, &callback),
    )
    .await
    .expect("cancel should end the turn");

    match outcome {
        TurnOutcome::Cancelled(snapshot) => assert_eq!(snapshot.thinking, "first"),
        other => panic!("expected cancel, got {other:?}"),
    }
    let events = collector.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].done);
}

#[tokio::test]
async fn test_in_band_error_line() {
    let recorder = Recorder::default();
    let chunks = vec![
        ndjson_line("Half", false),
        b"{\"error\":\"llama runner process has terminated\"}\n".to_vec(),
    ];
    let url = create_ollama_server(OllamaScript::streaming(chunks), recorder).await;
    let transport = local_transport(&url);
    let collector = EventCollector::default();

    let outcome = transport
        .send(&request("hi", ""), &CancellationToken::new(), &collector.callback())
        .await;

    match outcome {
        TurnOutcome::Failed { error, partial } => {
            assert_eq!(error.kind(), ErrorKind::Rejected);
            assert!(error.to_string().contains("llama runner"));
            assert_eq!(partial.response, "Half");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_hosted_answer_is_replayed_word_by_word() {
    let recorder = Recorder::default();
    let reply = json!({
        "candidates": [{ "content": { "parts": [{ "text": "Hello big world" }], "role": "model" } }]
    });
    let url = create_gemini_server(StatusCode::OK, reply, recorder.clone()).await;
    let transport = hosted_transport(&url);
    let collector = EventCollector::default();

    let mut req = request("Say hello", "gemini-api");
    req.api_key = Some("test-key".to_string());
    req.context = "User: hi\n\nAssistant: hey".to_string();
    let outcome = transport
        .send(&req, &CancellationToken::new(), &collector.callback())
        .await;

    assert!(matches!(&outcome, TurnOutcome::Completed(s) if s.response == "Hello big world"));

    let responses: Vec<String> = collector
        .events()
        .iter()
        .map(|e| e.response.clone())
        .collect();
    assert_eq!(
        responses,
        vec!["Hello ", "Hello big ", "Hello big world", "Hello big world"]
    );
    assert!(collector.events().iter().all(|e| e.thinking.is_empty()));
    assert!(collector.events().last().unwrap().done);

    assert_eq!(recorder.queries.lock().unwrap()[0], "key=test-key");
    let bodies = recorder.bodies.lock().unwrap();
    assert_eq!(bodies[0]["contents"].as_array().unwrap().len(), 3);
    assert_eq!(bodies[0]["contents"][1]["role"], "model");
    assert_eq!(bodies[0]["contents"][2]["parts"][0]["text"], "Say hello");
}

#[tokio::test]
async fn test_hosted_provider_error() {
    for status in [StatusCode::OK, StatusCode::TOO_MANY_REQUESTS] {
        let recorder = Recorder::default();
        let reply = json!({ "error": { "code": 429, "message": "quota exceeded" } });
        let url = create_gemini_server(status, reply, recorder).await;
        let transport = hosted_transport(&url);
        let collector = EventCollector::default();

        let mut req = request("hi", "gemini-api");
        req.api_key = Some("test-key".to_string());
        let outcome = transport
            .send(&req, &CancellationToken::new(), &collector.callback())
            .await;

        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        let events = collector.events();
        assert_eq!(events.len(), 1, "no synthetic snapshots for status {status}");
        assert!(events[0].done);
        assert!(events[0].error.as_ref().unwrap().contains("quota exceeded"));
    }
}

#[tokio::test]
async fn test_hosted_empty_answer_is_an_error() {
    let recorder = Recorder::default();
    let reply = json!({ "candidates": [{ "content": { "parts": [{ "text": "  " }] } }] });
    let url = create_gemini_server(StatusCode::OK, reply, recorder).await;
    let transport = hosted_transport(&url);
    let collector = EventCollector::default();

    let mut req = request("hi", "gemini-api");
    req.api_key = Some("test-key".to_string());
    let outcome = transport
        .send(&req, &CancellationToken::new(), &collector.callback())
        .await;

    assert!(matches!(
        outcome,
        TurnOutcome::Failed {
            error: TransportError::Provider(AdapterError::EmptyAnswer),
            ..
        }
    ));
    assert_eq!(
        collector.events()[0].error_kind,
        Some(ErrorKind::InvalidAnswer)
    );
}

#[tokio::test]
async fn test_hosted_fallback_credential() {
    let recorder = Recorder::default();
    let reply = json!({ "candidates": [{ "content": { "parts": [{ "text": "ok" }] } }] });
    let url = create_gemini_server(StatusCode::OK, reply, recorder.clone()).await;
    let transport =
        hosted_transport(&url).with_fallback_credential("gemini", "env-key".to_string());
    let collector = EventCollector::default();

    let outcome = transport
        .send(
            &request("hi", "gemini-api"),
            &CancellationToken::new(),
            &collector.callback(),
        )
        .await;

    assert!(matches!(&outcome, TurnOutcome::Completed(s) if s.response == "ok"));
    assert_eq!(recorder.queries.lock().unwrap()[0], "key=env-key");
}

#[tokio::test]
async fn test_list_models() {
    let recorder = Recorder::default();
    let url = create_ollama_server(OllamaScript::streaming(Vec::new()), recorder).await;
    let transport = ChatTransport::new(
        TransportConfig {
            ollama_base_url: url,
            ..Default::default()
        },
        ProviderRegistry::with_defaults("http://127.0.0.1:9/v1beta"),
    );

    let models = transport.list_models().await;
    let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["deepseek-r1:1.5b", "llama3.2:latest", "gemini-api"]);
    assert!(models[2].hosted);
    assert_eq!(models[2].name, "Gemini Pro");
    assert!(transport.local_server_reachable().await);
}

#[tokio::test]
async fn test_list_models_without_local_server() {
    let transport = ChatTransport::new(
        TransportConfig {
            ollama_base_url: closed_port_url().await,
            ..Default::default()
        },
        ProviderRegistry::with_defaults("http://127.0.0.1:9/v1beta"),
    );

    let models = transport.list_models().await;
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "gemini-api");
    assert!(!transport.local_server_reachable().await);
}
