use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LeaveReason {
    Left,
    Kicked,
    Timeout,
    Replaced,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct LobbyMember {
    pub(crate) student_id: String,
    pub(crate) email: String,
    pub(crate) ready: bool,
    pub(crate) joined_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct LobbySnapshot {
    pub(crate) project_id: String,
    pub(crate) members: Vec<LobbyMember>,
}

/// Events pushed over the lobby channels. Teachers receive presence deltas;
/// students receive lifecycle notifications for their own attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub(crate) enum ServerEvent {
    #[serde(rename = "lobby.snapshot")]
    LobbySnapshot(LobbySnapshot),
    #[serde(rename = "lobby.join")]
    LobbyJoin { project_id: String, student_id: String, email: String, ready: bool },
    #[serde(rename = "lobby.leave")]
    LobbyLeave { project_id: String, student_id: String, reason: LeaveReason },
    #[serde(rename = "lobby.ready")]
    LobbyReady { project_id: String, student_id: String, ready: bool },
    #[serde(rename = "lobby.kicked")]
    LobbyKicked { project_id: String },
    #[serde(rename = "exam.activated")]
    ExamActivated { project_id: String },
    #[serde(rename = "exam.timeExpired")]
    ExamTimeExpired { project_id: String, session_id: String },
    #[serde(rename = "error")]
    Error { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum StudentMessage {
    Ready,
    NotReady,
    Heartbeat,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum TeacherMessage {
    Kick {
        #[serde(alias = "studentId")]
        student_id: String,
    },
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn server_events_are_tagged_with_dotted_names() {
        let event = ServerEvent::ExamTimeExpired { project_id: "p".into(), session_id: "s".into() };
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({"type": "exam.timeExpired", "project_id": "p", "session_id": "s"})
        );

        let leave = ServerEvent::LobbyLeave {
            project_id: "p".into(),
            student_id: "u".into(),
            reason: LeaveReason::Kicked,
        };
        assert_eq!(serde_json::to_value(leave).unwrap()["reason"], "kicked");
    }

    #[test]
    fn client_messages_parse() {
        let parsed: StudentMessage = serde_json::from_value(json!({"type": "not_ready"})).unwrap();
        assert_eq!(parsed, StudentMessage::NotReady);

        let kick: TeacherMessage =
            serde_json::from_value(json!({"type": "kick", "studentId": "u1"})).unwrap();
        assert_eq!(kick, TeacherMessage::Kick { student_id: "u1".into() });
    }
}
