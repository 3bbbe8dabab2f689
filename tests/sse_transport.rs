use std::future::poll_fn;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::body::MessageBody;
use actix_web::http::Method;
use actix_web::{App, http::StatusCode, test, web};
use aio_mcp::core::sse::{self, SseState};
use aio_mcp::{
    BoxError, ChangeNotifier, Dispatcher, ExampleModule, McpServerFramework, ModuleManager,
    ModuleParams, ServerConfig, ServerState, Tool, ToolContext, ToolError, TransportKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

async fn prepared<M: ModuleManager + 'static>(module: M) -> Arc<Dispatcher> {
    let config = ServerConfig::builder("sse-test", "2.0.0")
        .build_with_env(|_| None)
        .unwrap();
    let mut server = McpServerFramework::new(config).unwrap();
    server.prepare(move || module).await.unwrap()
}

async fn dispatcher() -> Arc<Dispatcher> {
    prepared(ExampleModule::new()).await
}

/// Tools: `grow` adds a tool and announces the change; `wait` blocks until
/// its caller disconnects or `ms` elapse and reports which came first.
struct Adjustable {
    extra: Mutex<Vec<String>>,
    notifier: Option<ChangeNotifier>,
    outcomes: mpsc::UnboundedSender<&'static str>,
}

impl Adjustable {
    fn new(outcomes: mpsc::UnboundedSender<&'static str>) -> Self {
        Self {
            extra: Mutex::new(Vec::new()),
            notifier: None,
            outcomes,
        }
    }
}

#[async_trait]
impl ModuleManager for Adjustable {
    async fn initialize(&mut self, _params: &ModuleParams) -> Result<(), BoxError> {
        Ok(())
    }

    fn get_tools(&self) -> Vec<Tool> {
        let schema = json!({"type": "object"});
        let mut tools = vec![
            Tool::new("grow", "Adds a tool", schema.clone()),
            Tool::new("wait", "Waits for a disconnect", schema.clone()),
        ];
        for name in self.extra.lock().unwrap().iter() {
            tools.push(Tool::new(name.clone(), "Added at runtime", schema.clone()));
        }
        tools
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        ctx: Option<&ToolContext>,
    ) -> Result<Value, ToolError> {
        match name {
            "grow" => {
                let added = arguments
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ToolError::invalid_arguments("missing 'name'"))?
                    .to_string();
                self.extra.lock().unwrap().push(added.clone());
                if let Some(notifier) = &self.notifier {
                    notifier.tools_changed();
                }
                Ok(json!({ "added": added }))
            }
            "wait" => {
                let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(5_000);
                let ctx = ctx.expect("calls carry a context");
                ctx.info("waiting");
                let outcome = tokio::select! {
                    _ = ctx.cancelled() => "cancelled",
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => "finished",
                };
                self.outcomes.send(outcome).unwrap();
                Ok(json!({ "outcome": outcome }))
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    fn set_change_notifier(&mut self, notifier: ChangeNotifier) {
        self.notifier = Some(notifier);
    }
}

fn tool_call(id: i64, name: &str, arguments: Value) -> String {
    json!({
        "jsonrpc": "2.0", "id": id, "method": "tools/call",
        "params": {"name": name, "arguments": arguments}
    })
    .to_string()
}

/// Next chunk of a streaming body.
async fn next_frame<B: MessageBody>(body: &mut Pin<Box<B>>) -> Bytes {
    let frame = tokio::time::timeout(
        Duration::from_secs(5),
        poll_fn(|cx| body.as_mut().poll_next(cx)),
    )
    .await
    .expect("timed out waiting for an event");
    match frame {
        Some(Ok(bytes)) => bytes,
        Some(Err(_)) => panic!("body stream failed"),
        None => panic!("stream ended"),
    }
}

/// Next `message` event, parsed.
async fn next_message<B: MessageBody>(body: &mut Pin<Box<B>>) -> Value {
    loop {
        let (event, data) = event_data(&next_frame(body).await);
        if event == "message" {
            return serde_json::from_str(&data).unwrap();
        }
    }
}

/// Split one SSE frame into its event name and `data:` payload.
fn event_data(frame: &[u8]) -> (String, String) {
    let text = std::str::from_utf8(frame).unwrap();
    let mut event = String::new();
    let mut data = String::new();
    for line in text.lines() {
        if let Some(name) = line.strip_prefix("event: ") {
            event = name.to_string();
        } else if let Some(payload) = line.strip_prefix("data: ") {
            data.push_str(payload);
        }
    }
    (event, data)
}

#[actix_rt::test]
async fn health_reports_status() {
    let state = web::Data::new(SseState::new(dispatcher().await));
    let app = test::init_service(App::new().app_data(state.clone()).configure(sse::configure)).await;

    for uri in ["/health", "/"] {
        let req = test::TestRequest::get().uri(uri).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "sse-test");
        assert_eq!(body["sessions"], 0);
    }
}

#[actix_rt::test]
async fn direct_requests_are_answered_inline() {
    let state = web::Data::new(SseState::new(dispatcher().await));
    let app = test::init_service(App::new().app_data(state).configure(sse::configure)).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .set_payload(
            json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "hello", "arguments": {"name": "Ada"}}
            })
            .to_string(),
        )
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["id"], 1);
    let payload: Value =
        serde_json::from_str(body["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload, json!({"message": "Hello, Ada!"}));

    let req = test::TestRequest::post()
        .uri("/mcp")
        .set_payload(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
}

#[actix_rt::test]
async fn messages_need_a_live_session() {
    let state = web::Data::new(SseState::new(dispatcher().await));
    let app = test::init_service(App::new().app_data(state).configure(sse::configure)).await;

    let unknown = format!("/messages/?session_id={}", uuid::Uuid::new_v4().simple());
    let req = test::TestRequest::post()
        .uri(&unknown)
        .set_payload(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::post()
        .uri("/messages/?session_id=not-a-uuid")
        .set_payload("{}")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
}

#[actix_rt::test]
async fn session_stream_carries_responses() {
    let state = web::Data::new(SseState::new(dispatcher().await));
    let app = test::init_service(App::new().app_data(state.clone()).configure(sse::configure)).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/sse").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(state.session_count(), 1);

    let mut body = Box::pin(resp.into_body());

    let (event, endpoint) = event_data(&next_frame(&mut body).await);
    assert_eq!(event, "endpoint");
    assert!(endpoint.starts_with("/messages/?session_id="));

    let req = test::TestRequest::post()
        .uri(&endpoint)
        .set_payload(
            json!({
                "jsonrpc": "2.0", "id": 7, "method": "tools/call",
                "params": {"name": "echo", "arguments": {"message": "over sse"}}
            })
            .to_string(),
        )
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::ACCEPTED);

    let response = loop {
        let (event, data) = event_data(&next_frame(&mut body).await);
        if event != "message" {
            continue;
        }
        let message: Value = serde_json::from_str(&data).unwrap();
        if message["id"] == 7 {
            break message;
        }
        assert_eq!(message["method"], "notifications/message");
    };
    let payload: Value =
        serde_json::from_str(response["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload, json!({"result": "over sse"}));

    let req = test::TestRequest::post()
        .uri(&endpoint)
        .set_payload("{broken")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

    drop(body);
    assert_eq!(state.session_count(), 0);

    let req = test::TestRequest::post()
        .uri(&endpoint)
        .set_payload(r#"{"jsonrpc":"2.0","id":8,"method":"ping"}"#)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
}

#[actix_rt::test]
async fn cross_origin_preflight_is_allowed() {
    let state = web::Data::new(SseState::new(dispatcher().await));
    let app = test::init_service(App::new().app_data(state).configure(sse::configure)).await;

    for uri in ["/messages/?session_id=abc", "/mcp", "/sse"] {
        let req = test::TestRequest::default()
            .method(Method::OPTIONS)
            .uri(uri)
            .insert_header(("Origin", "http://localhost:5173"))
            .insert_header(("Access-Control-Request-Method", "POST"))
            .insert_header(("Access-Control-Request-Headers", "content-type"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success(), "{uri}: {}", resp.status());
        assert!(resp.headers().contains_key("access-control-allow-origin"));
        assert!(resp.headers().contains_key("access-control-allow-methods"));
    }

    let req = test::TestRequest::get()
        .uri("/health")
        .insert_header(("Origin", "http://localhost:5173"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("access-control-allow-origin"));
}

#[actix_rt::test]
async fn tool_changes_are_broadcast_to_every_session() {
    let (outcomes, _finished) = mpsc::unbounded_channel();
    let state = web::Data::new(SseState::new(prepared(Adjustable::new(outcomes)).await));
    let app = test::init_service(App::new().app_data(state.clone()).configure(sse::configure)).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/sse").to_request()).await;
    let mut first = Box::pin(resp.into_body());
    let (_, endpoint) = event_data(&next_frame(&mut first).await);
    let resp = test::call_service(&app, test::TestRequest::get().uri("/sse").to_request()).await;
    let mut second = Box::pin(resp.into_body());
    next_frame(&mut second).await;
    assert_eq!(state.session_count(), 2);

    let req = test::TestRequest::post()
        .uri(&endpoint)
        .set_payload(tool_call(1, "grow", json!({"name": "extra"})))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::ACCEPTED);

    let change = next_message(&mut second).await;
    assert_eq!(change["method"], "notifications/tools/list_changed");

    let (mut changed, mut answered) = (false, false);
    while !(changed && answered) {
        let message = next_message(&mut first).await;
        if message["method"] == "notifications/tools/list_changed" {
            changed = true;
        } else if message["id"] == 1 {
            assert_eq!(message["result"]["isError"], false);
            answered = true;
        }
    }

    let req = test::TestRequest::post()
        .uri("/mcp")
        .set_payload(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let names: Vec<_> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["grow", "wait", "extra"]);
}

#[actix_rt::test]
async fn dropping_the_stream_cancels_in_flight_calls() {
    let (outcomes, mut finished) = mpsc::unbounded_channel();
    let state = web::Data::new(SseState::new(prepared(Adjustable::new(outcomes)).await));
    let app = test::init_service(App::new().app_data(state.clone()).configure(sse::configure)).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/sse").to_request()).await;
    let mut body = Box::pin(resp.into_body());
    let (_, endpoint) = event_data(&next_frame(&mut body).await);

    let req = test::TestRequest::post()
        .uri(&endpoint)
        .set_payload(tool_call(1, "wait", json!({"ms": 10_000})))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::ACCEPTED);

    let started = next_message(&mut body).await;
    assert_eq!(started["params"]["data"], "waiting");

    drop(body);
    assert_eq!(state.session_count(), 0);

    let outcome = tokio::time::timeout(Duration::from_secs(5), finished.recv())
        .await
        .expect("tool never observed the disconnect");
    assert_eq!(outcome, Some("cancelled"));
}

/// Buffers a live event stream and yields whole SSE frames.
struct EventReader<S> {
    body: Pin<Box<S>>,
    buffer: String,
}

impl<S, E> EventReader<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Debug,
{
    fn new(body: S) -> Self {
        Self {
            body: Box::pin(body),
            buffer: String::new(),
        }
    }

    async fn next_event(&mut self) -> (String, String) {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let frame: String = self.buffer.drain(..end + 2).collect();
                if frame.starts_with(':') {
                    continue;
                }
                return event_data(frame.as_bytes());
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.body.next())
                .await
                .expect("timed out waiting for an event")
                .expect("stream ended")
                .unwrap();
            self.buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }

    async fn next_message(&mut self) -> Value {
        loop {
            let (event, data) = self.next_event().await;
            if event == "message" {
                return serde_json::from_str(&data).unwrap();
            }
        }
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[actix_rt::test]
async fn served_sse_drains_in_flight_calls_on_shutdown() {
    let port = free_port();
    let mut config = ServerConfig::builder("sse-live", "3.0.0")
        .build_with_env(|_| None)
        .unwrap();
    config.transport = TransportKind::Sse;
    config.host = "127.0.0.1".to_string();
    config.port = port;
    config.workers = 1;
    config.shutdown_timeout = Duration::from_secs(2);

    let (outcomes, mut finished) = mpsc::unbounded_channel();
    let mut server = McpServerFramework::new(config).unwrap();
    let mut states = server.subscribe();
    let shutdown = server.shutdown_handle();
    server.prepare(move || Adjustable::new(outcomes)).await.unwrap();
    let serving = actix_rt::spawn(server.serve());
    states
        .wait_for(|state| *state == ServerState::Serving)
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");
    let mut attempts = 0;
    let stream = loop {
        match client
            .get(format!("{base}/sse"))
            .timeout(Duration::from_secs(30))
            .send()
            .await
        {
            Ok(resp) => break resp,
            Err(e) if attempts < 50 => {
                attempts += 1;
                tracing::debug!(error = %e, "server not accepting yet");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("could not connect: {e}"),
        }
    };
    assert_eq!(stream.status(), reqwest::StatusCode::OK);
    let mut events = EventReader::new(stream.bytes_stream());
    let (event, endpoint) = events.next_event().await;
    assert_eq!(event, "endpoint");

    let resp = client
        .post(format!("{base}{endpoint}"))
        .header("content-type", "application/json")
        .body(tool_call(1, "wait", json!({"ms": 300})))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    drop(resp);

    let started = events.next_message().await;
    assert_eq!(started["params"]["data"], "waiting");

    shutdown.shutdown();

    let response = loop {
        let message = events.next_message().await;
        if message["id"] == 1 {
            break message;
        }
    };
    assert_eq!(response["result"]["isError"], false);
    assert_eq!(finished.recv().await, Some("finished"));

    drop(events);
    drop(client);
    serving.await.unwrap().unwrap();
    assert_eq!(*states.borrow(), ServerState::Stopped);
}
