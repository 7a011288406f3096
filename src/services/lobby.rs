use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::PrimitiveDateTime;
use tokio::sync::{broadcast, mpsc};

use crate::core::time::format_primitive;
use crate::db::models::Project;
use crate::schemas::lobby::{LeaveReason, LobbyMember, LobbySnapshot, ServerEvent};
use crate::services::errors::ExamError;

/// What a student connection receives from the registry.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StudentSignal {
    Event(ServerEvent),
    Close(LeaveReason),
}

/// Handle returned by `join`. `connection_id` identifies this connection so a
/// displaced channel cannot remove its replacement.
#[derive(Debug)]
pub(crate) struct LobbyTicket {
    pub(crate) connection_id: u64,
    pub(crate) signals: mpsc::UnboundedReceiver<StudentSignal>,
}

struct Member {
    connection_id: u64,
    email: String,
    ready: bool,
    joined_at: PrimitiveDateTime,
    signals: mpsc::UnboundedSender<StudentSignal>,
}

struct ProjectLobby {
    members: Mutex<HashMap<String, Member>>,
    teachers: broadcast::Sender<ServerEvent>,
    // Set by `prune` under the member lock once the shard leaves the registry.
    retired: AtomicBool,
}

impl ProjectLobby {
    fn members(&self) -> MutexGuard<'_, HashMap<String, Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(project_id: &str, members: &HashMap<String, Member>) -> LobbySnapshot {
        let mut listed: Vec<LobbyMember> = members
            .iter()
            .map(|(student_id, member)| LobbyMember {
                student_id: student_id.clone(),
                email: member.email.clone(),
                ready: member.ready,
                joined_at: format_primitive(member.joined_at),
            })
            .collect();
        listed.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.student_id.cmp(&b.student_id)));

        LobbySnapshot { project_id: project_id.to_string(), members: listed }
    }

    // Deltas are sent while the member map is locked, so teachers observe
    // them in mutation order.
    fn emit(&self, event: ServerEvent) {
        let _ = self.teachers.send(event);
    }
}

/// Server-owned presence for every project lobby, one shard per project.
#[derive(Clone)]
pub(crate) struct LobbyRegistry {
    shards: Arc<Mutex<HashMap<String, Arc<ProjectLobby>>>>,
    capacity: usize,
    next_connection: Arc<AtomicU64>,
}

impl LobbyRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            shards: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    fn shards(&self) -> MutexGuard<'_, HashMap<String, Arc<ProjectLobby>>> {
        self.shards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shard(&self, project_id: &str) -> Option<Arc<ProjectLobby>> {
        self.shards().get(project_id).cloned()
    }

    fn shard_or_create(
        shards: &mut HashMap<String, Arc<ProjectLobby>>,
        project_id: &str,
        capacity: usize,
    ) -> Arc<ProjectLobby> {
        shards
            .entry(project_id.to_string())
            .or_insert_with(|| {
                let (teachers, _) = broadcast::channel(capacity);
                Arc::new(ProjectLobby {
                    members: Mutex::new(HashMap::new()),
                    teachers,
                    retired: AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// Runs `apply` on the project's member map. The registry lock is released
    /// before the member lock is taken; a shard retired in between is looked
    /// up again.
    fn with_live_shard<T>(
        &self,
        project_id: &str,
        apply: impl FnOnce(&ProjectLobby, &mut HashMap<String, Member>) -> T,
    ) -> T {
        loop {
            let lobby = {
                let mut shards = self.shards();
                Self::shard_or_create(&mut shards, project_id, self.capacity)
            };
            let mut members = lobby.members();
            if lobby.retired.load(Ordering::Acquire) {
                continue;
            }
            return apply(&*lobby, &mut *members);
        }
    }

    /// Adds or replaces the student's presence record. A previous connection of
    /// the same student is closed with `replaced`.
    pub(crate) fn join(
        &self,
        project: &Project,
        student_id: &str,
        email: &str,
        now: PrimitiveDateTime,
    ) -> Result<LobbyTicket, ExamError> {
        self.with_live_shard(&project.id, |lobby, members| {
            self.admit(lobby, members, project, student_id, email, now)
        })
    }

    fn admit(
        &self,
        lobby: &ProjectLobby,
        members: &mut HashMap<String, Member>,
        project: &Project,
        student_id: &str,
        email: &str,
        now: PrimitiveDateTime,
    ) -> Result<LobbyTicket, ExamError> {
        if let Some(max_students) = project.max_students {
            let limit = usize::try_from(max_students).unwrap_or(0);
            if !members.contains_key(student_id) && members.len() >= limit {
                return Err(ExamError::LobbyFull);
            }
        }

        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (sender, signals) = mpsc::unbounded_channel();
        let member = Member {
            connection_id,
            email: email.to_string(),
            ready: false,
            joined_at: now,
            signals: sender,
        };

        if let Some(previous) = members.insert(student_id.to_string(), member) {
            let _ = previous.signals.send(StudentSignal::Close(LeaveReason::Replaced));
            tracing::info!(
                project_id = %project.id,
                student_id,
                previous_connection = previous.connection_id,
                "Lobby presence replaced by a new connection"
            );
        }

        lobby.emit(ServerEvent::LobbyJoin {
            project_id: project.id.clone(),
            student_id: student_id.to_string(),
            email: email.to_string(),
            ready: false,
        });

        Ok(LobbyTicket { connection_id, signals })
    }

    pub(crate) fn set_ready(
        &self,
        project_id: &str,
        student_id: &str,
        connection_id: u64,
        ready: bool,
    ) -> bool {
        let Some(lobby) = self.shard(project_id) else {
            return false;
        };
        let mut members = lobby.members();
        let Some(member) = members.get_mut(student_id) else {
            return false;
        };
        if member.connection_id != connection_id {
            return false;
        }
        if member.ready == ready {
            return true;
        }

        member.ready = ready;
        lobby.emit(ServerEvent::LobbyReady {
            project_id: project_id.to_string(),
            student_id: student_id.to_string(),
            ready,
        });
        true
    }

    /// Removes the presence record if it still belongs to `connection_id`.
    /// Disconnects of displaced connections are ignored.
    pub(crate) fn leave(
        &self,
        project_id: &str,
        student_id: &str,
        connection_id: u64,
        reason: LeaveReason,
    ) -> bool {
        let removed = {
            let Some(lobby) = self.shard(project_id) else {
                return false;
            };
            let mut members = lobby.members();
            let owned =
                members.get(student_id).is_some_and(|member| member.connection_id == connection_id);
            if owned {
                members.remove(student_id);
                lobby.emit(ServerEvent::LobbyLeave {
                    project_id: project_id.to_string(),
                    student_id: student_id.to_string(),
                    reason,
                });
            }
            owned
        };

        if removed {
            self.prune(project_id);
        }
        removed
    }

    /// Closes the student's channel. Presence only; the student's attempt, if
    /// any, keeps running.
    pub(crate) fn kick(&self, project_id: &str, student_id: &str) -> bool {
        let removed = {
            let Some(lobby) = self.shard(project_id) else {
                return false;
            };
            let mut members = lobby.members();
            let Some(member) = members.remove(student_id) else {
                return false;
            };

            let _ = member.signals.send(StudentSignal::Event(ServerEvent::LobbyKicked {
                project_id: project_id.to_string(),
            }));
            let _ = member.signals.send(StudentSignal::Close(LeaveReason::Kicked));
            lobby.emit(ServerEvent::LobbyLeave {
                project_id: project_id.to_string(),
                student_id: student_id.to_string(),
                reason: LeaveReason::Kicked,
            });
            true
        };

        if removed {
            tracing::info!(project_id, student_id, "Student kicked from lobby");
            self.prune(project_id);
        }
        removed
    }

    /// Snapshot and delta stream taken under the same lock, so no delta is
    /// lost or duplicated between them.
    pub(crate) fn subscribe(
        &self,
        project_id: &str,
    ) -> (LobbySnapshot, broadcast::Receiver<ServerEvent>) {
        self.with_live_shard(project_id, |lobby, members| {
            let receiver = lobby.teachers.subscribe();
            (ProjectLobby::snapshot(project_id, members), receiver)
        })
    }

    pub(crate) fn snapshot(&self, project_id: &str) -> LobbySnapshot {
        match self.shard(project_id) {
            Some(lobby) => ProjectLobby::snapshot(project_id, &lobby.members()),
            None => LobbySnapshot { project_id: project_id.to_string(), members: Vec::new() },
        }
    }

    pub(crate) fn notify_students(&self, project_id: &str, event: ServerEvent) -> usize {
        let Some(lobby) = self.shard(project_id) else {
            return 0;
        };
        let members = lobby.members();
        members
            .values()
            .filter(|member| member.signals.send(StudentSignal::Event(event.clone())).is_ok())
            .count()
    }

    /// `false` when the student has no live lobby connection.
    pub(crate) fn notify_student(&self, project_id: &str, student_id: &str, event: ServerEvent) -> bool {
        let Some(lobby) = self.shard(project_id) else {
            return false;
        };
        let members = lobby.members();
        members
            .get(student_id)
            .is_some_and(|member| member.signals.send(StudentSignal::Event(event)).is_ok())
    }

    pub(crate) fn notify_teachers(&self, project_id: &str, event: ServerEvent) {
        if let Some(lobby) = self.shard(project_id) {
            lobby.emit(event);
        }
    }

    /// Drops an empty shard with no teacher subscribers. Lock order is
    /// registry, then members; joiners never hold both.
    pub(crate) fn prune(&self, project_id: &str) {
        let mut shards = self.shards();
        let Some(lobby) = shards.get(project_id).cloned() else {
            return;
        };
        let members = lobby.members();
        if lobby.teachers.receiver_count() == 0 && members.is_empty() {
            lobby.retired.store(true, Ordering::Release);
            shards.remove(project_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::test_support::sample_project;

    const NOW: PrimitiveDateTime = datetime!(2025-05-01 09:50:00);

    fn drain(receiver: &mut broadcast::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn deltas_reach_teachers_in_order() {
        let registry = LobbyRegistry::new(16);
        let project = sample_project("p1", 1);
        let (snapshot, mut deltas) = registry.subscribe("p1");
        assert!(snapshot.members.is_empty());

        let ticket = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();
        assert!(registry.set_ready("p1", "u1", ticket.connection_id, true));
        assert!(registry.leave("p1", "u1", ticket.connection_id, LeaveReason::Left));

        let events = drain(&mut deltas);
        assert!(matches!(events[0], ServerEvent::LobbyJoin { ref student_id, .. } if student_id == "u1"));
        assert!(matches!(events[1], ServerEvent::LobbyReady { ready: true, .. }));
        assert!(matches!(events[2], ServerEvent::LobbyLeave { reason: LeaveReason::Left, .. }));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn rejoin_replaces_the_previous_connection() {
        let registry = LobbyRegistry::new(16);
        let project = sample_project("p1", 1);
        let _teacher = registry.subscribe("p1");

        let mut first = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();
        let second = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();

        assert_eq!(first.signals.try_recv().unwrap(), StudentSignal::Close(LeaveReason::Replaced));
        // The displaced connection's disconnect must not remove the new one.
        assert!(!registry.leave("p1", "u1", first.connection_id, LeaveReason::Disconnected));
        assert_eq!(registry.snapshot("p1").members.len(), 1);
        assert!(registry.leave("p1", "u1", second.connection_id, LeaveReason::Left));
        assert!(registry.snapshot("p1").members.is_empty());
    }

    #[test]
    fn kick_closes_only_the_target_channel() {
        let registry = LobbyRegistry::new(16);
        let project = sample_project("p1", 1);
        let (_, mut deltas) = registry.subscribe("p1");
        let mut target = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();
        let mut other = registry.join(&project, "u2", "u2@example.com", NOW).unwrap();
        drain(&mut deltas);

        assert!(registry.kick("p1", "u1"));
        assert!(!registry.kick("p1", "u1"));

        assert!(matches!(target.signals.try_recv(), Ok(StudentSignal::Event(ServerEvent::LobbyKicked { .. }))));
        assert_eq!(target.signals.try_recv().unwrap(), StudentSignal::Close(LeaveReason::Kicked));
        assert!(other.signals.try_recv().is_err());
        assert_eq!(
            drain(&mut deltas),
            vec![ServerEvent::LobbyLeave {
                project_id: "p1".into(),
                student_id: "u1".into(),
                reason: LeaveReason::Kicked,
            }]
        );
    }

    #[test]
    fn capacity_counts_distinct_students() {
        let registry = LobbyRegistry::new(16);
        let mut project = sample_project("p1", 1);
        project.max_students = Some(1);

        let _first = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();
        assert!(matches!(registry.join(&project, "u2", "u2@example.com", NOW), Err(ExamError::LobbyFull)));
        assert!(registry.join(&project, "u1", "u1@example.com", NOW).is_ok());
    }

    #[test]
    fn activation_reaches_every_connected_student() {
        let registry = LobbyRegistry::new(16);
        let project = sample_project("p1", 1);
        let mut a = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();
        let mut b = registry.join(&project, "u2", "u2@example.com", NOW).unwrap();

        let delivered =
            registry.notify_students("p1", ServerEvent::ExamActivated { project_id: "p1".into() });

        assert_eq!(delivered, 2);
        for ticket in [&mut a, &mut b] {
            assert_eq!(
                ticket.signals.try_recv().unwrap(),
                StudentSignal::Event(ServerEvent::ExamActivated { project_id: "p1".into() })
            );
        }
        assert!(!registry.notify_student("p1", "u3", ServerEvent::ExamActivated { project_id: "p1".into() }));
    }

    #[test]
    fn leave_then_rejoin_keeps_a_single_record() {
        let registry = LobbyRegistry::new(16);
        let project = sample_project("p1", 1);
        let _other = registry.join(&project, "u2", "u2@example.com", NOW).unwrap();

        let first = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();
        assert!(registry.leave("p1", "u1", first.connection_id, LeaveReason::Left));
        assert_eq!(registry.snapshot("p1").members.len(), 1);

        let second = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();
        assert_ne!(second.connection_id, first.connection_id);
        let snapshot = registry.snapshot("p1");
        assert_eq!(snapshot.members.len(), 2);
        assert_eq!(snapshot.members.iter().filter(|m| m.student_id == "u1").count(), 1);
        // the stale connection can no longer remove the new record
        assert!(!registry.leave("p1", "u1", first.connection_id, LeaveReason::Disconnected));
        assert_eq!(registry.snapshot("p1").members.len(), 2);
    }

    #[test]
    fn rejoin_after_prune_uses_a_fresh_shard() {
        let registry = LobbyRegistry::new(16);
        let project = sample_project("p1", 1);
        let first = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();
        let retired = registry.shard("p1").unwrap();
        registry.leave("p1", "u1", first.connection_id, LeaveReason::Left);

        assert!(retired.retired.load(Ordering::Acquire));
        let _second = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();
        let live = registry.shard("p1").unwrap();
        assert!(!Arc::ptr_eq(&retired, &live));
        assert!(retired.members().is_empty());
        assert_eq!(registry.snapshot("p1").members.len(), 1);
    }

    #[test]
    fn a_busy_lobby_does_not_block_other_projects() {
        let registry = LobbyRegistry::new(16);
        let first = sample_project("p1", 1);
        let second = sample_project("p2", 1);
        let _seated = registry.join(&first, "u1", "u1@example.com", NOW).unwrap();

        let busy = registry.shard("p1").unwrap();
        let held = busy.members();
        let waiting = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                registry.join(&first, "u2", "u2@example.com", NOW).is_ok()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));

        let (done, finished) = std::sync::mpsc::channel();
        {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let joined = registry.join(&second, "u3", "u3@example.com", NOW).is_ok();
                let _ = done.send(joined);
            });
        }
        assert_eq!(finished.recv_timeout(std::time::Duration::from_secs(5)), Ok(true));

        drop(held);
        assert!(waiting.join().unwrap());
        assert_eq!(registry.snapshot("p1").members.len(), 2);
        assert_eq!(registry.snapshot("p2").members.len(), 1);
    }

    #[test]
    fn idle_shards_are_pruned() {
        let registry = LobbyRegistry::new(16);
        let project = sample_project("p1", 1);
        let ticket = registry.join(&project, "u1", "u1@example.com", NOW).unwrap();
        registry.leave("p1", "u1", ticket.connection_id, LeaveReason::Left);

        assert!(registry.shard("p1").is_none());
    }
}
