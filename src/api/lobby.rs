use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep_until, Instant};

use crate::api::errors::ApiError;
use crate::api::guards::{as_student, as_teacher, authenticate, require_project_owner, Student};
use crate::core::metrics;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::types::ProjectStatus;
use crate::schemas::lobby::{LeaveReason, ServerEvent, StudentMessage, TeacherMessage};
use crate::services::errors::ExamError;
use crate::services::lobby::{LobbyTicket, StudentSignal};

#[derive(Debug, Deserialize)]
pub(crate) struct SocketAuth {
    #[serde(default)]
    token: Option<String>,
}

fn token(auth: &SocketAuth) -> Result<&str, ApiError> {
    auth.token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::Unauthorized("Missing token"))
}

type Sink = SplitSink<WebSocket, Message>;

async fn send_event(sink: &mut Sink, event: &ServerEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    sink.send(Message::Text(text)).await
}

pub(crate) async fn student_socket(
    Path(project_id): Path<String>,
    Query(auth): Query<SocketAuth>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let student = as_student(authenticate(&state, token(&auth)?)?)?;
    let project = state
        .store()
        .find_project(&project_id)
        .await
        .map_err(ExamError::from)?
        .ok_or(ExamError::NotFound("Project"))?;
    if !project.allows_email(&student.email) {
        return Err(ExamError::NotAllowlisted.into());
    }
    if project.status == ProjectStatus::Completed {
        return Err(ExamError::ProjectCompleted.into());
    }

    let ticket = state.lobby().join(&project, &student.id, &student.email, primitive_now_utc())?;
    let connection_id = ticket.connection_id;
    tracing::info!(project_id, student_id = %student.id, connection_id, "Student joined lobby");

    let failed_state = state.clone();
    let failed_project = project_id.clone();
    let failed_student = student.id.clone();

    Ok(ws
        .on_failed_upgrade(move |err| {
            tracing::warn!(error = %err, project_id = %failed_project, "Lobby upgrade failed");
            failed_state.lobby().leave(
                &failed_project,
                &failed_student,
                connection_id,
                LeaveReason::Disconnected,
            );
        })
        .on_upgrade(move |socket| run_student(socket, state, project_id, student, ticket)))
}

async fn run_student(
    socket: WebSocket,
    state: AppState,
    project_id: String,
    student: Student,
    ticket: LobbyTicket,
) {
    metrics::lobby_connections(1.0);
    let LobbyTicket { connection_id, mut signals } = ticket;
    let (mut sink, mut stream) = socket.split();
    let heartbeat = Duration::from_secs(state.settings().lobby().heartbeat_timeout_seconds);
    let mut last_seen = Instant::now();

    // `None` when the registry already removed this connection.
    let reason = loop {
        tokio::select! {
            inbound = stream.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(_)) | None => break Some(LeaveReason::Disconnected),
                };
                last_seen = Instant::now();
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break Some(LeaveReason::Disconnected),
                    _ => continue,
                };
                match serde_json::from_str::<StudentMessage>(&text) {
                    Ok(StudentMessage::Ready) => {
                        state.lobby().set_ready(&project_id, &student.id, connection_id, true);
                    }
                    Ok(StudentMessage::NotReady) => {
                        state.lobby().set_ready(&project_id, &student.id, connection_id, false);
                    }
                    Ok(StudentMessage::Heartbeat) => {}
                    Ok(StudentMessage::Leave) => break Some(LeaveReason::Left),
                    Err(err) => {
                        let event = ServerEvent::Error { detail: format!("invalid message: {err}") };
                        if send_event(&mut sink, &event).await.is_err() {
                            break Some(LeaveReason::Disconnected);
                        }
                    }
                }
            }
            signal = signals.recv() => match signal {
                Some(StudentSignal::Event(event)) => {
                    if send_event(&mut sink, &event).await.is_err() {
                        break Some(LeaveReason::Disconnected);
                    }
                }
                Some(StudentSignal::Close(reason)) => {
                    tracing::debug!(project_id, student_id = %student.id, ?reason, "Lobby channel closed by registry");
                    break None;
                }
                None => break None,
            },
            _ = sleep_until(last_seen + heartbeat) => break Some(LeaveReason::Timeout),
        }
    };

    if let Some(reason) = reason {
        state.lobby().leave(&project_id, &student.id, connection_id, reason);
        tracing::info!(project_id, student_id = %student.id, ?reason, "Student left lobby");
    }
    let _ = sink.send(Message::Close(None)).await;
    metrics::lobby_connections(-1.0);
}

pub(crate) async fn teacher_socket(
    Path(project_id): Path<String>,
    Query(auth): Query<SocketAuth>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let teacher = as_teacher(authenticate(&state, token(&auth)?)?)?;
    require_project_owner(&state, &teacher, &project_id).await?;

    Ok(ws.on_upgrade(move |socket| run_teacher(socket, state, project_id)))
}

async fn run_teacher(socket: WebSocket, state: AppState, project_id: String) {
    metrics::lobby_connections(1.0);
    let (mut sink, mut stream) = socket.split();
    let heartbeat = Duration::from_secs(state.settings().lobby().heartbeat_timeout_seconds);
    let mut last_seen = Instant::now();

    let (snapshot, mut deltas) = state.lobby().subscribe(&project_id);
    let mut open = send_event(&mut sink, &ServerEvent::LobbySnapshot(snapshot)).await.is_ok();

    while open {
        tokio::select! {
            inbound = stream.next() => {
                let Some(Ok(message)) = inbound else { break };
                last_seen = Instant::now();
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let reply = match serde_json::from_str::<TeacherMessage>(&text) {
                    Ok(TeacherMessage::Kick { student_id }) => {
                        if state.lobby().kick(&project_id, &student_id) {
                            None
                        } else {
                            Some(ServerEvent::Error { detail: format!("student {student_id} is not in the lobby") })
                        }
                    }
                    Ok(TeacherMessage::Heartbeat) => None,
                    Err(err) => Some(ServerEvent::Error { detail: format!("invalid message: {err}") }),
                };
                if let Some(event) = reply {
                    open = send_event(&mut sink, &event).await.is_ok();
                }
            }
            delta = deltas.recv() => match delta {
                Ok(event) => open = send_event(&mut sink, &event).await.is_ok(),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(project_id, skipped, "Teacher lobby subscriber lagged; resyncing");
                    let (snapshot, fresh) = state.lobby().subscribe(&project_id);
                    deltas = fresh;
                    open = send_event(&mut sink, &ServerEvent::LobbySnapshot(snapshot)).await.is_ok();
                }
                Err(RecvError::Closed) => break,
            },
            _ = sleep_until(last_seen + heartbeat) => {
                tracing::info!(project_id, "Teacher lobby connection timed out");
                break;
            }
        }
    }

    drop(deltas);
    state.lobby().prune(&project_id);
    let _ = sink.send(Message::Close(None)).await;
    metrics::lobby_connections(-1.0);
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use serde_json::{json, Value};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use super::*;
    use crate::api::router::router;
    use crate::core::config::Settings;
    use crate::db::types::QuestionType;
    use crate::services::exam_window;
    use crate::test_support::{
        build_memory_state_with, create_project_with_variants, question, student_token,
        teacher_token, STUDENT_EMAIL,
    };

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(settings: Settings) -> (AppState, SocketAddr) {
        let state = build_memory_state_with(settings);
        create_project_with_variants(
            state.store(),
            "p1",
            vec![question("p1", 1, 0, QuestionType::TrueFalse, 1.0)],
        )
        .await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, addr)
    }

    async fn next_event(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("event in time")
                .expect("stream open")
                .expect("valid frame");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn presence_deltas_activation_and_kick() {
        let (state, addr) = serve(Settings::for_tests()).await;
        let settings = state.settings();
        let base = format!("ws://{addr}/api/v1/projects/p1/lobby");

        let (mut teacher, _) =
            connect_async(format!("{base}/teacher/ws?token={}", teacher_token(settings))).await.unwrap();
        let snapshot = next_event(&mut teacher).await;
        assert_eq!(snapshot["type"], "lobby.snapshot");
        assert_eq!(snapshot["members"], json!([]));

        let (mut student, _) = connect_async(format!(
            "{base}/ws?token={}",
            student_token("u1", STUDENT_EMAIL, settings)
        ))
        .await
        .unwrap();
        let joined = next_event(&mut teacher).await;
        assert_eq!(joined["type"], "lobby.join");
        assert_eq!(joined["student_id"], "u1");

        student.send(WsMessage::Text(json!({"type": "ready"}).to_string())).await.unwrap();
        let ready = next_event(&mut teacher).await;
        assert_eq!(ready["type"], "lobby.ready");
        assert_eq!(ready["ready"], true);

        let project = state.store().find_project("p1").await.unwrap().unwrap();
        let project =
            exam_window::transition_project(&state, &project, ProjectStatus::Ready, primitive_now_utc())
                .await
                .unwrap();
        exam_window::transition_project(&state, &project, ProjectStatus::Active, primitive_now_utc())
            .await
            .unwrap();
        assert_eq!(next_event(&mut student).await["type"], "exam.activated");
        assert_eq!(next_event(&mut teacher).await["type"], "exam.activated");

        teacher
            .send(WsMessage::Text(json!({"type": "kick", "student_id": "u1"}).to_string()))
            .await
            .unwrap();
        assert_eq!(next_event(&mut student).await["type"], "lobby.kicked");
        let left = next_event(&mut teacher).await;
        assert_eq!(left["type"], "lobby.leave");
        assert_eq!(left["reason"], "kicked");
        assert!(state.lobby().snapshot("p1").members.is_empty());
    }

    #[tokio::test]
    async fn silent_students_time_out() {
        let mut settings = Settings::for_tests();
        settings.lobby_mut().heartbeat_timeout_seconds = 1;
        let (state, addr) = serve(settings).await;
        let settings = state.settings();
        let base = format!("ws://{addr}/api/v1/projects/p1/lobby");

        let (mut teacher, _) =
            connect_async(format!("{base}/teacher/ws?token={}", teacher_token(settings))).await.unwrap();
        next_event(&mut teacher).await;

        let (_student, _) = connect_async(format!(
            "{base}/ws?token={}",
            student_token("u1", STUDENT_EMAIL, settings)
        ))
        .await
        .unwrap();
        assert_eq!(next_event(&mut teacher).await["type"], "lobby.join");

        // Keep the teacher alive past the student's deadline.
        tokio::time::sleep(Duration::from_millis(500)).await;
        teacher.send(WsMessage::Text(json!({"type": "heartbeat"}).to_string())).await.unwrap();
        let left = next_event(&mut teacher).await;
        assert_eq!(left["type"], "lobby.leave");
        assert_eq!(left["reason"], "timeout");
    }

    #[tokio::test]
    async fn handshake_requires_a_valid_allowlisted_token() {
        let (state, addr) = serve(Settings::for_tests()).await;
        let base = format!("ws://{addr}/api/v1/projects/p1/lobby");

        let missing = connect_async(format!("{base}/ws")).await.unwrap_err();
        assert!(matches!(
            missing,
            tokio_tungstenite::tungstenite::Error::Http(ref response) if response.status() == 401
        ));

        let outsider = student_token("u9", "outsider@example.com", state.settings());
        let rejected = connect_async(format!("{base}/ws?token={outsider}")).await.unwrap_err();
        assert!(matches!(
            rejected,
            tokio_tungstenite::tungstenite::Error::Http(ref response) if response.status() == 403
        ));
        assert!(state.lobby().snapshot("p1").members.is_empty());
    }
}
