//! End-to-end tests against the `mock-agent` binary over every transport

use agent_rpc::{
    AgentClient, ClientError, ClientOptions, ConnectionState, MessageOptions, Mode,
    PermissionDecision, PermissionHandler, SessionConfig, Tool,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

const MOCK_AGENT: &str = env!("CARGO_BIN_EXE_mock-agent");

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("agent_rpc=debug")
        .with_test_writer()
        .try_init();
}

fn spawn_options(use_stdio: bool) -> ClientOptions {
    ClientOptions {
        cli_path: Some(MOCK_AGENT.to_string()),
        use_stdio: Some(use_stdio),
        log_level: "info".to_string(),
        auto_start: false,
        ..Default::default()
    }
}

async fn connected(use_stdio: bool) -> AgentClient {
    init_logging();
    let client = AgentClient::new(spawn_options(use_stdio)).unwrap();
    client.start().await.unwrap();
    client
}

/// Run the mock agent ourselves, as an operator would, and return its port
async fn external_agent() -> (Child, u16) {
    let mut child = Command::new(MOCK_AGENT)
        .args(["--port", "0", "--log-level", "info"])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let line = BufReader::new(stdout)
        .lines()
        .next_line()
        .await
        .unwrap()
        .unwrap();
    let port = line
        .strip_prefix("listening on port ")
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    (child, port)
}

/// Poll until `condition` holds or two seconds pass
async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..40 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[tokio::test]
async fn test_ping_over_spawned_transports() {
    for use_stdio in [true, false] {
        let client = connected(use_stdio).await;
        assert_eq!(client.get_state(), ConnectionState::Connected);
        assert!(client.agent_pid().is_some());

        let pong = client.ping("hello").await.unwrap();
        assert_eq!(pong.message, "pong: hello");
        assert_eq!(pong.protocol_version, Some(2));

        let status = client.get_status().await.unwrap();
        assert_eq!(status.protocol_version, 2);

        let errors = client.stop().await;
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(client.get_state(), ConnectionState::Disconnected);
        assert!(client.agent_pid().is_none());
    }
}

#[tokio::test]
async fn test_external_server_and_models_cache() {
    init_logging();
    let (_agent, port) = external_agent().await;
    let client = AgentClient::new(ClientOptions {
        cli_url: Some(format!("127.0.0.1:{port}")),
        auto_start: false,
        ..Default::default()
    })
    .unwrap();

    client.start().await.unwrap();
    assert!(client.agent_pid().is_none());

    let mut first = client.list_models().await.unwrap();
    let second = client.list_models().await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first, second);

    // Callers get copies
    first.clear();
    assert_eq!(client.list_models().await.unwrap().len(), 2);

    let stats = client.request("test.stats", json!({})).await.unwrap();
    assert_eq!(stats["modelsListCalls"], 1);

    assert!(client.stop().await.is_empty());
    client.start().await.unwrap();

    client.list_models().await.unwrap();
    let stats = client.request("test.stats", json!({})).await.unwrap();
    assert_eq!(stats["modelsListCalls"], 2);

    assert!(client.stop().await.is_empty());
}

#[tokio::test]
async fn test_session_round_trip() {
    let client = connected(true).await;
    let session = client
        .create_session(SessionConfig {
            model: Some("mock-small".to_string()),
            tools: vec![Tool::new("echo_tool", "Echo x", |invocation| async move {
                Ok(json!(format!("got {}", invocation.arguments["x"])))
            })],
            excluded_tools: Some(vec!["shell".to_string(), "echo_tool".to_string()]),
            ..Default::default()
        })
        .await
        .unwrap();
    let id = session.id().to_string();
    assert!(client.session(&id).is_some());
    assert!(session.workspace_path().is_some());

    let sent = client
        .request("test.getSessionConfig", json!({ "sessionId": id }))
        .await
        .unwrap();
    assert_eq!(sent["excludedTools"], json!(["shell", "echo_tool"]));
    assert_eq!(sent["tools"][0]["name"], "echo_tool");
    assert_eq!(sent["requestPermission"], false);

    let reply = session
        .send_and_wait(MessageOptions::new("hi"), Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.content(), Some("echo: hi"));
    assert!(session.get_messages().await.unwrap().len() >= 3);

    assert_eq!(session.mode().get().await.unwrap(), Mode::Interactive);
    assert_eq!(session.mode().set(Mode::Plan).await.unwrap(), Mode::Plan);
    assert_eq!(session.mode().get().await.unwrap(), Mode::Plan);

    assert!(!session.plan().read().await.unwrap().exists);
    session.plan().update("1. write tests").await.unwrap();
    let plan = session.plan().read().await.unwrap();
    assert!(plan.exists);
    assert_eq!(plan.content.as_deref(), Some("1. write tests"));
    session.plan().delete().await.unwrap();
    assert!(!session.plan().read().await.unwrap().exists);

    session
        .workspace()
        .create_file("notes.md", "# Notes")
        .await
        .unwrap();
    assert_eq!(session.workspace().list_files().await.unwrap(), vec!["notes.md"]);
    assert_eq!(
        session.workspace().read_file("notes.md").await.unwrap(),
        "# Notes"
    );
    assert!(session.workspace().read_file("missing.md").await.is_err());

    assert_eq!(
        session.model().get_current().await.unwrap().as_deref(),
        Some("mock-small")
    );
    assert_eq!(
        session.model().switch_to("mock-large").await.unwrap().as_deref(),
        Some("mock-large")
    );

    assert_eq!(client.get_last_session_id().await.unwrap(), Some(id.clone()));
    assert_eq!(client.list_sessions().await.unwrap()[0].session_id, id);

    session.destroy().await.unwrap();
    assert!(client.session(&id).is_none());
    assert!(client.stop().await.is_empty());
}

#[tokio::test]
async fn test_agent_calls_back_into_tools() {
    let client = connected(false).await;
    let session = client
        .create_session(SessionConfig {
            tools: vec![
                Tool::new("echo_tool", "Echo x", |invocation| async move {
                    Ok(json!(format!("got {}", invocation.arguments["x"])))
                }),
                Tool::new("broken", "Always fails", |_| async { Err("disk full".into()) }),
            ],
            ..Default::default()
        })
        .await
        .unwrap();

    let invoke = |tool: &str| {
        client.request(
            "test.invokeTool",
            json!({"sessionId": session.id(), "toolName": tool, "arguments": {"x": 1}}),
        )
    };

    let reply = invoke("echo_tool").await.unwrap();
    assert_eq!(reply["result"]["resultType"], "success");
    assert_eq!(reply["result"]["textResultForLlm"], "got 1");

    let reply = invoke("U").await.unwrap();
    assert_eq!(reply["result"]["resultType"], "failure");
    assert_eq!(reply["result"]["error"], "tool 'U' not supported");

    let reply = invoke("broken").await.unwrap();
    assert_eq!(reply["result"]["resultType"], "failure");
    assert_eq!(
        reply["result"]["textResultForLlm"],
        "Invoking this tool produced an error. Detailed information is not available."
    );

    assert!(client.stop().await.is_empty());
}

#[tokio::test]
async fn test_permission_requests() {
    let client = connected(true).await;

    let denied = client.create_session(SessionConfig::default()).await.unwrap();
    let approved = client
        .create_session(SessionConfig {
            on_permission_request: Some(PermissionHandler::approve_all()),
            ..Default::default()
        })
        .await
        .unwrap();

    let ask = |session_id: String| {
        client.request(
            "test.requestPermission",
            json!({"sessionId": session_id, "permissionRequest": {"kind": "shell", "command": "ls"}}),
        )
    };

    let reply = ask(denied.id().to_string()).await.unwrap();
    assert_eq!(reply["result"]["kind"], PermissionDecision::DENIED_NO_RULE);

    let reply = ask(approved.id().to_string()).await.unwrap();
    assert_eq!(reply["result"]["kind"], "approved");

    assert!(client.stop().await.is_empty());
}

#[tokio::test]
async fn test_lifecycle_events_and_delete() {
    let client = connected(true).await;
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let all = client.on_lifecycle(move |event| {
        sink.lock().unwrap().push(event.event_type.clone());
    });
    let created = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&created);
    client.on_lifecycle_type("session.created", move |event| {
        sink.lock().unwrap().push(event.session_id.clone());
    });

    let session = client.create_session(SessionConfig::default()).await.unwrap();
    let id = session.id().to_string();
    assert!(eventually(|| created.lock().unwrap().contains(&id)).await);

    client.delete_session(&id).await.unwrap();
    assert!(client.session(&id).is_none());
    assert!(eventually(|| seen.lock().unwrap().iter().any(|t| t == "session.deleted")).await);

    let error = client.delete_session(&id).await.unwrap_err();
    assert!(matches!(error, ClientError::SessionDelete { .. }));
    assert!(error.to_string().starts_with(&format!("Failed to delete session {id}: ")));

    assert!(client.off_lifecycle(all));
    assert!(!client.off_lifecycle(all));
    assert!(client.stop().await.is_empty());
}

#[tokio::test]
async fn test_foreground_session() {
    let client = connected(false).await;
    assert_eq!(client.get_foreground_session_id().await.unwrap(), None);

    let session = client.create_session(SessionConfig::default()).await.unwrap();
    client.set_foreground_session_id(session.id()).await.unwrap();
    assert_eq!(
        client.get_foreground_session_id().await.unwrap().as_deref(),
        Some(session.id())
    );

    let error = client.set_foreground_session_id("nope").await.unwrap_err();
    assert!(matches!(error, ClientError::Foreground(_)));
    assert!(client.stop().await.is_empty());
}

#[tokio::test]
async fn test_resume_keeps_requested_id() {
    let client = connected(true).await;
    let session = client
        .resume_session("saved-session", SessionConfig::default())
        .await
        .unwrap();
    assert_eq!(session.id(), "saved-session");
    assert!(client.session("saved-session").is_some());
    assert!(client.stop().await.is_empty());
}

#[tokio::test]
async fn test_agent_runs_in_configured_directory() {
    init_logging();
    let workdir = tempfile::tempdir().unwrap();
    let client = AgentClient::new(ClientOptions {
        cwd: Some(workdir.path().to_path_buf()),
        ..spawn_options(false)
    })
    .unwrap();
    client.start().await.unwrap();

    let stats = client.request("test.stats", json!({})).await.unwrap();
    let reported = std::path::PathBuf::from(stats["cwd"].as_str().unwrap());
    assert_eq!(
        reported.canonicalize().unwrap(),
        workdir.path().canonicalize().unwrap()
    );
    assert!(client.stop().await.is_empty());
}

#[tokio::test]
async fn test_auto_start_on_create_session() {
    init_logging();
    let client = AgentClient::new(ClientOptions {
        auto_start: true,
        ..spawn_options(true)
    })
    .unwrap();
    assert_eq!(client.get_state(), ConnectionState::Disconnected);

    client.create_session(SessionConfig::default()).await.unwrap();
    assert_eq!(client.get_state(), ConnectionState::Connected);
    assert!(client.stop().await.is_empty());
}

#[tokio::test]
async fn test_stop_reports_sessions_lost_with_the_agent() {
    let client = connected(true).await;
    let session = client.create_session(SessionConfig::default()).await.unwrap();
    let pid = client.agent_pid().unwrap();

    // SAFETY: signalling a child this test spawned
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let errors = client.stop().await;
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(
        errors[0]
            .to_string()
            .starts_with(&format!("Failed to destroy session {}", session.id())),
        "{}",
        errors[0]
    );
    assert_eq!(client.get_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_force_stop_in_every_state() {
    init_logging();
    let client = AgentClient::new(spawn_options(true)).unwrap();
    client.force_stop().await;
    assert_eq!(client.get_state(), ConnectionState::Disconnected);

    client.start().await.unwrap();
    let session = client.create_session(SessionConfig::default()).await.unwrap();
    client.force_stop().await;
    assert_eq!(client.get_state(), ConnectionState::Disconnected);
    assert!(client.session(session.id()).is_none());
    assert!(matches!(
        client.ping("x").await,
        Err(ClientError::NotConnected { .. })
    ));

    client.force_stop().await;
    client.start().await.unwrap();
    assert_eq!(client.ping("again").await.unwrap().message, "pong: again");
    client.force_stop().await;
    assert!(client.stop().await.is_empty());
}

#[tokio::test]
async fn test_start_failure_carries_agent_stderr() {
    init_logging();
    let client = AgentClient::new(ClientOptions {
        cli_args: vec!["--bogus-flag".to_string()],
        ..spawn_options(true)
    })
    .unwrap();

    let error = client.start().await.unwrap_err();
    assert!(matches!(error, ClientError::StartFailed { .. }), "{error:?}");
    let text = error.to_string();
    assert!(text.contains("stderr"), "{text}");
    assert!(text.contains("--bogus-flag"), "{text}");
    assert_eq!(client.get_state(), ConnectionState::Disconnected);

    let started = std::time::Instant::now();
    assert!(matches!(
        client.ping("x").await,
        Err(ClientError::NotConnected { .. })
    ));
    assert!(client.create_session(SessionConfig::default()).await.is_err());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_protocol_version_mismatch() {
    init_logging();
    let client = AgentClient::new(ClientOptions {
        cli_args: vec!["--protocol-version".to_string(), "1".to_string()],
        ..spawn_options(false)
    })
    .unwrap();

    match client.start().await {
        Err(ClientError::ProtocolMismatch { expected, actual }) => {
            assert_eq!(expected, 2);
            assert_eq!(actual, Some(1));
        }
        other => panic!("expected a protocol mismatch, got {other:?}"),
    }
    assert_eq!(client.get_state(), ConnectionState::Disconnected);
    client.force_stop().await;
}

#[tokio::test]
async fn test_unknown_agent_method_surfaces_remote_error() {
    let client = connected(true).await;
    let error = client.request("no.such.method", Value::Null).await.unwrap_err();
    assert_eq!(error.remote_code(), Some(-32601));
    assert!(client.stop().await.is_empty());
}
