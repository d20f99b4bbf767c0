//! Integration tests for the backend over scripted agent streams.
//!
//! Each test attaches a backend to in-memory duplex streams, serves the
//! handshake from the agent side, and then scripts one flow: prompt
//! streaming, tool-call lifecycle, permissions, capability events,
//! setter synthesis, cancel, and dispose.

use std::sync::Arc;

use serde_json::{json, Value};

use acp_runner::acp::rpc::ServiceFuture;
use acp_runner::backend::{PermissionDecision, PermissionHandler};
use acp_runner::message::{AgentMessage, SessionStatus};
use acp_runner::transport::DefaultTransport;
use acp_runner::Result;

use super::test_helpers::{attach, expect_status, next_event, serve_handshake};

/// Permission handler returning a fixed decision.
struct Decide(PermissionDecision);

impl PermissionHandler for Decide {
    fn decide(
        &self,
        _tool_call_id: String,
        _tool_name: String,
        _input: Value,
    ) -> ServiceFuture<'_, Result<PermissionDecision>> {
        let decision = self.0;
        Box::pin(async move { Ok(decision) })
    }
}

#[tokio::test(start_paused = true)]
async fn startup_announces_capabilities_then_idle() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let extra = json!({
        "configOptions": [{
            "id": "mode",
            "type": "select",
            "category": "mode",
            "currentValue": "code",
            "options": [{ "value": "code", "name": "Code" }],
        }],
        "modes": { "availableModes": [{ "id": "code", "name": "Code" }] },
    });

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", extra);
    let (session_id, ()) = tokio::join!(start, serve);
    assert_eq!(session_id.expect("session must start"), "sess-1");

    expect_status(&mut session.events, SessionStatus::Starting).await;

    match next_event(&mut session.events).await {
        AgentMessage::Event { name, payload } => {
            assert_eq!(name, "config_options_update");
            assert_eq!(payload[0]["id"], "mode");
        }
        other => panic!("expected the config options event, got: {other:?}"),
    }
    match next_event(&mut session.events).await {
        AgentMessage::Event { name, .. } => assert_eq!(name, "modes_update"),
        other => panic!("expected the modes event, got: {other:?}"),
    }
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn prompt_streams_chunks_then_settles_idle() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    let session_id = session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    expect_status(&mut session.events, SessionStatus::Idle).await;

    let prompter = session.backend.clone_handle();
    let prompt_session = session_id.clone();
    let prompt = tokio::spawn(async move { prompter.send_prompt(&prompt_session, "do it").await });

    let request = session.agent.next_request("prompt").await;
    assert_eq!(request["params"]["sessionId"], "sess-1");
    assert_eq!(request["params"]["prompt"][0]["type"], "text");
    assert_eq!(request["params"]["prompt"][0]["text"], "do it");

    expect_status(&mut session.events, SessionStatus::Running).await;

    for chunk in ["hel", "lo"] {
        session
            .agent
            .session_update(
                "sess-1",
                json!({
                    "sessionUpdate": "agent_message_chunk",
                    "content": { "type": "text", "text": chunk },
                }),
            )
            .await;
        match next_event(&mut session.events).await {
            AgentMessage::ModelOutput { text_delta } => assert_eq!(text_delta, chunk),
            other => panic!("expected model output, got: {other:?}"),
        }
    }

    let id = request["id"].clone();
    session.agent.respond(&id, json!({ "stopReason": "end_turn" })).await;
    prompt
        .await
        .expect("join")
        .expect("prompt must resolve once the agent replies");

    // The idle timer fires after the quiet interval (paused time
    // auto-advances through it).
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn bold_header_chunks_become_streaming_thinking() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session
        .agent
        .session_update(
            "sess-1",
            json!({
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": "**Planning**\nfirst step" },
            }),
        )
        .await;

    match next_event(&mut session.events).await {
        AgentMessage::Event { name, payload } => {
            assert_eq!(name, "thinking");
            assert_eq!(payload["streaming"], true);
            assert_eq!(payload["text"], "**Planning**\nfirst step");
        }
        other => panic!("expected a thinking event, got: {other:?}"),
    }

    // A thought chunk maps to the same event kind.
    session
        .agent
        .session_update(
            "sess-1",
            json!({
                "sessionUpdate": "agent_thought_chunk",
                "content": { "type": "text", "text": "hmm" },
            }),
        )
        .await;
    match next_event(&mut session.events).await {
        AgentMessage::Event { name, payload } => {
            assert_eq!(name, "thinking");
            assert_eq!(payload["text"], "hmm");
        }
        other => panic!("expected a thinking event, got: {other:?}"),
    }

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn tool_call_lifecycle_completes_and_settles() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session
        .agent
        .session_update(
            "sess-1",
            json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "t1",
                "kind": "execute",
                "content": { "command": "ls" },
                "locations": [{ "path": "." }],
            }),
        )
        .await;

    expect_status(&mut session.events, SessionStatus::Running).await;
    match next_event(&mut session.events).await {
        AgentMessage::ToolCall {
            call_id,
            tool_name,
            args,
        } => {
            assert_eq!(call_id, "t1");
            assert_eq!(tool_name, "execute", "the kind is the default tool name");
            assert_eq!(args["command"], "ls");
            assert_eq!(args["locations"][0]["path"], ".");
        }
        other => panic!("expected the tool call, got: {other:?}"),
    }

    // A duplicate start for the same id is ignored.
    session
        .agent
        .session_update(
            "sess-1",
            json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t1",
                "status": "in_progress",
            }),
        )
        .await;

    session
        .agent
        .session_update(
            "sess-1",
            json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t1",
                "status": "completed",
                "content": { "output": "ok" },
            }),
        )
        .await;

    match next_event(&mut session.events).await {
        AgentMessage::ToolResult {
            call_id,
            tool_name,
            result,
        } => {
            assert_eq!(call_id, "t1");
            assert_eq!(tool_name, "execute");
            assert_eq!(result["output"], "ok");
        }
        other => panic!("expected the tool result, got: {other:?}"),
    }

    // With the active set drained, idle follows immediately.
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn failed_tool_call_carries_the_extracted_detail() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session
        .agent
        .session_update(
            "sess-1",
            json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "t2",
                "kind": "edit",
            }),
        )
        .await;
    expect_status(&mut session.events, SessionStatus::Running).await;
    let _ = next_event(&mut session.events).await; // the ToolCall itself

    session
        .agent
        .session_update(
            "sess-1",
            json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t2",
                "status": "failed",
                "content": { "error": { "message": "patch rejected" } },
            }),
        )
        .await;

    match next_event(&mut session.events).await {
        AgentMessage::ToolResult { result, .. } => {
            assert_eq!(result["error"], "patch rejected");
            assert_eq!(result["status"], "failed");
        }
        other => panic!("expected the failure result, got: {other:?}"),
    }
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn permission_request_round_trips_the_decision() {
    let mut session = attach(
        Arc::new(DefaultTransport),
        Some(Arc::new(Decide(PermissionDecision::ApprovedForSession))),
    );

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session
        .agent
        .send(&json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "requestPermission",
            "params": {
                "sessionId": "sess-1",
                "toolCall": { "id": "t1", "kind": "Bash", "rawInput": { "command": "rm" } },
                "options": [
                    { "optionId": "proceed_once", "name": "Allow once", "kind": "allow_once" },
                    { "optionId": "proceed_always", "name": "Always allow", "kind": "allow_always" },
                    { "optionId": "cancel", "name": "Cancel", "kind": "reject_once" },
                ],
            },
        }))
        .await;

    match next_event(&mut session.events).await {
        AgentMessage::PermissionRequest { id, reason, .. } => {
            assert_eq!(id, "t1", "the tool-call id doubles as the permission id");
            assert_eq!(reason, "Bash");
        }
        other => panic!("expected the permission request, got: {other:?}"),
    }

    match next_event(&mut session.events).await {
        AgentMessage::ToolResult {
            call_id, result, ..
        } => {
            assert_eq!(call_id, "t1");
            assert_eq!(result["status"], "approved");
            assert_eq!(result["decision"], "approved_for_session");
        }
        other => panic!("expected the synthetic decision result, got: {other:?}"),
    }

    let reply = session.agent.next_message().await;
    assert_eq!(reply["id"], 42);
    assert_eq!(reply["result"]["outcome"]["outcome"], "selected");
    assert_eq!(
        reply["result"]["outcome"]["optionId"], "proceed_always",
        "approved_for_session must select proceed_always"
    );

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn permission_without_handler_auto_selects_proceed_once() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session
        .agent
        .send(&json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "requestPermission",
            "params": {
                "toolCall": { "id": "t9", "kind": "edit" },
                "options": [
                    { "optionId": "proceed_once", "name": "Allow once", "kind": "allow_once" },
                    { "optionId": "cancel", "name": "Cancel", "kind": "reject_once" },
                ],
            },
        }))
        .await;

    match next_event(&mut session.events).await {
        AgentMessage::PermissionRequest { id, .. } => assert_eq!(id, "t9"),
        other => panic!("expected the permission request, got: {other:?}"),
    }

    let reply = session.agent.next_message().await;
    assert_eq!(reply["result"]["outcome"]["optionId"], "proceed_once");

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_update_kinds_are_dropped() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session
        .agent
        .session_update(
            "sess-1",
            json!({ "sessionUpdate": "brand_new_kind", "payload": 1 }),
        )
        .await;
    session
        .agent
        .session_update("sess-1", json!({ "sessionUpdate": "plan", "entries": [] }))
        .await;

    // Only the known kind surfaces.
    match next_event(&mut session.events).await {
        AgentMessage::Event { name, .. } => assert_eq!(name, "plan"),
        other => panic!("expected the plan event, got: {other:?}"),
    }

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn set_config_option_synthesizes_the_update() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let extra = json!({
        "configOptions": [{
            "id": "mode",
            "type": "select",
            "category": "mode",
            "currentValue": "ask",
            "options": [
                { "value": "ask", "name": "Ask" },
                { "value": "code", "name": "Code" },
            ],
        }],
    });

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", extra);
    let (session_id, ()) = tokio::join!(start, serve);
    session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    let _ = next_event(&mut session.events).await; // initial config options
    expect_status(&mut session.events, SessionStatus::Idle).await;

    let setter = session.backend.clone_handle();
    let set = tokio::spawn(async move { setter.set_session_config_option("mode", "code").await });

    let request = session.agent.next_request("setSessionConfigOption").await;
    assert_eq!(request["params"]["configId"], "mode");
    assert_eq!(request["params"]["value"], "code");
    let id = request["id"].clone();
    // No echoed configOptions in the reply: the backend must patch.
    session.agent.respond(&id, json!({})).await;

    assert!(set.await.expect("join"), "the setter must report success");

    match next_event(&mut session.events).await {
        AgentMessage::Event { name, payload } => {
            assert_eq!(name, "config_options_update");
            assert_eq!(
                payload[0]["currentValue"], "code",
                "the stored payload must be patched to the new value"
            );
        }
        other => panic!("expected the synthesized update, got: {other:?}"),
    }

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn set_mode_synthesizes_current_mode_update() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    expect_status(&mut session.events, SessionStatus::Idle).await;

    let setter = session.backend.clone_handle();
    let set = tokio::spawn(async move { setter.set_session_mode("code").await });

    let request = session.agent.next_request("setSessionMode").await;
    assert_eq!(request["params"]["modeId"], "code");
    let id = request["id"].clone();
    session.agent.respond(&id, json!({})).await;

    assert!(set.await.expect("join"));
    match next_event(&mut session.events).await {
        AgentMessage::Event { name, payload } => {
            assert_eq!(name, "current_mode_update");
            assert_eq!(payload["currentModeId"], "code");
        }
        other => panic!("expected the synthesized mode update, got: {other:?}"),
    }

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_emits_stopped_even_without_an_acknowledgement() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    let session_id = session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    expect_status(&mut session.events, SessionStatus::Idle).await;

    // The agent never replies to cancel; the reply cap elapses under
    // paused time.
    session
        .backend
        .cancel(&session_id)
        .await
        .expect("cancel must succeed");
    expect_status(&mut session.events, SessionStatus::Stopped).await;

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn permission_response_is_an_event_only() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    session_id.expect("session must start");

    expect_status(&mut session.events, SessionStatus::Starting).await;
    expect_status(&mut session.events, SessionStatus::Idle).await;

    session.backend.respond_to_permission("p1", true).await;

    match next_event(&mut session.events).await {
        AgentMessage::PermissionResponse { id, approved } => {
            assert_eq!(id, "p1");
            assert!(approved);
        }
        other => panic!("expected the permission response, got: {other:?}"),
    }

    session.backend.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn dispose_is_idempotent_and_closes_the_stream() {
    let mut session = attach(Arc::new(DefaultTransport), None);

    let start = session
        .backend
        .start_session_with_streams(session.local_read, session.local_write, None);
    let serve = serve_handshake(&mut session.agent, "sess-1", json!({}));
    let (session_id, ()) = tokio::join!(start, serve);
    session_id.expect("session must start");

    session.backend.dispose().await;
    session.backend.dispose().await;

    // Drain whatever was emitted before dispose; the channel must close.
    while session.events.recv().await.is_some() {}
}
