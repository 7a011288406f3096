use time::{Duration, PrimitiveDateTime};

use crate::core::state::AppState;
use crate::core::time::seconds_until;
use crate::db::models::Project;
use crate::db::types::ProjectStatus;
use crate::repositories::ProjectWindow;
use crate::schemas::lobby::ServerEvent;
use crate::services::errors::ExamError;
use crate::services::question_bank;

/// Decides whether a student may start or resume an attempt at `now`.
/// A `ready` project whose `start_time` has passed is treated as open
/// without touching the stored status.
pub(crate) fn check_access(project: &Project, now: PrimitiveDateTime) -> Result<(), ExamError> {
    if project.status == ProjectStatus::Completed || project.end_time.is_some_and(|end| end <= now) {
        return Err(ExamError::ProjectCompleted);
    }

    match project.status {
        ProjectStatus::Active => Ok(()),
        ProjectStatus::Ready => match project.start_time {
            Some(start) if start <= now => Ok(()),
            Some(start) => Err(ExamError::NotYetAvailable {
                opens_at: Some(start),
                wait_seconds: Some(seconds_until(now, start)),
            }),
            None => Err(ExamError::NotYetAvailable { opens_at: None, wait_seconds: None }),
        },
        ProjectStatus::Draft | ProjectStatus::Completed => {
            Err(ExamError::NotYetAvailable { opens_at: None, wait_seconds: None })
        }
    }
}

/// Single forward step of the project lifecycle.
pub(crate) fn validate_transition(project: &Project, target: ProjectStatus) -> Result<(), ExamError> {
    let allowed = matches!(
        (project.status, target),
        (ProjectStatus::Draft, ProjectStatus::Ready)
            | (ProjectStatus::Ready, ProjectStatus::Active)
            | (ProjectStatus::Active, ProjectStatus::Completed)
    );
    if !allowed {
        return Err(ExamError::InvalidTransition { from: project.status, to: target });
    }

    // `ready` can open on its own at start_time, so it needs students too.
    if matches!(target, ProjectStatus::Ready | ProjectStatus::Active)
        && project.allowed_student_emails.0.is_empty()
    {
        return Err(ExamError::NoStudentsConfigured);
    }

    Ok(())
}

/// Attempt deadline: the time budget from `started_at`, capped by the
/// project's end time.
pub(crate) fn compute_deadline(project: &Project, started_at: PrimitiveDateTime) -> PrimitiveDateTime {
    let budget_deadline = started_at + Duration::minutes(i64::from(project.total_time_minutes));
    match project.end_time {
        Some(end) if end < budget_deadline => end,
        _ => budget_deadline,
    }
}

/// Immediate activation without a schedule pins a shared window of
/// `total_time_minutes` starting now, so every attempt ends with it.
pub(crate) fn activation_window(
    project: &Project,
    target: ProjectStatus,
    now: PrimitiveDateTime,
) -> Option<ProjectWindow> {
    if target != ProjectStatus::Active || project.end_time.is_some() {
        return None;
    }

    Some(ProjectWindow {
        start_time: now,
        end_time: now + Duration::minutes(i64::from(project.total_time_minutes)),
    })
}

pub(crate) async fn transition_project(
    state: &AppState,
    project: &Project,
    target: ProjectStatus,
    now: PrimitiveDateTime,
) -> Result<Project, ExamError> {
    validate_transition(project, target)?;

    if target == ProjectStatus::Ready {
        let missing = question_bank::missing_variants(state.store(), project).await?;
        if let Some(variant_number) = missing.first() {
            return Err(ExamError::VariantDataMissing {
                project_id: project.id.clone(),
                variant_number: *variant_number,
            });
        }
    }

    let window = activation_window(project, target, now);
    let Some(updated) =
        state.store().transition_project(&project.id, project.status, target, window, now).await?
    else {
        let current = state.store().find_project(&project.id).await?.ok_or(ExamError::NotFound("Project"))?;
        return Err(ExamError::InvalidTransition { from: current.status, to: target });
    };

    tracing::info!(
        project_id = %updated.id,
        from = project.status.as_str(),
        to = target.as_str(),
        "Project status changed"
    );

    match target {
        ProjectStatus::Active => {
            state.lobby().notify_students(&updated.id, ServerEvent::ExamActivated {
                project_id: updated.id.clone(),
            });
            state.lobby().notify_teachers(&updated.id, ServerEvent::ExamActivated {
                project_id: updated.id.clone(),
            });
        }
        ProjectStatus::Completed => {
            state.grading().close_project(&updated.id, now).await?;
        }
        ProjectStatus::Draft | ProjectStatus::Ready => {}
    }

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::test_support::sample_project;

    #[test]
    fn ready_project_opens_at_start_time() {
        let mut project = sample_project("p1", 1);
        project.status = ProjectStatus::Ready;
        project.start_time = Some(datetime!(2025-05-01 10:00:00));

        let early = check_access(&project, datetime!(2025-05-01 09:59:00)).unwrap_err();
        assert!(matches!(early, ExamError::NotYetAvailable { wait_seconds: Some(60), .. }));
        assert!(check_access(&project, datetime!(2025-05-01 10:00:00)).is_ok());
    }

    #[test]
    fn ended_or_completed_projects_are_closed() {
        let mut project = sample_project("p1", 1);
        project.status = ProjectStatus::Active;
        project.end_time = Some(datetime!(2025-05-01 12:00:00));
        assert!(check_access(&project, datetime!(2025-05-01 11:00:00)).is_ok());
        assert!(matches!(
            check_access(&project, datetime!(2025-05-01 12:00:00)),
            Err(ExamError::ProjectCompleted)
        ));

        project.status = ProjectStatus::Completed;
        project.end_time = None;
        assert!(matches!(
            check_access(&project, datetime!(2025-05-01 11:00:00)),
            Err(ExamError::ProjectCompleted)
        ));
    }

    #[test]
    fn draft_is_never_open() {
        let project = sample_project("p1", 1);
        assert!(matches!(
            check_access(&project, datetime!(2025-05-01 11:00:00)),
            Err(ExamError::NotYetAvailable { opens_at: None, .. })
        ));
    }

    #[test]
    fn transitions_move_one_step_forward() {
        let mut project = sample_project("p1", 1);
        assert!(validate_transition(&project, ProjectStatus::Ready).is_ok());
        assert!(matches!(
            validate_transition(&project, ProjectStatus::Active),
            Err(ExamError::InvalidTransition { .. })
        ));

        project.status = ProjectStatus::Active;
        assert!(validate_transition(&project, ProjectStatus::Completed).is_ok());
        assert!(validate_transition(&project, ProjectStatus::Ready).is_err());
        assert!(validate_transition(&project, ProjectStatus::Active).is_err());
    }

    #[test]
    fn activation_requires_students() {
        let mut project = sample_project("p1", 1);
        project.status = ProjectStatus::Ready;
        project.allowed_student_emails.0.clear();

        assert!(matches!(
            validate_transition(&project, ProjectStatus::Active),
            Err(ExamError::NoStudentsConfigured)
        ));
    }

    #[test]
    fn immediate_activation_pins_the_window() {
        let mut project = sample_project("p1", 1);
        project.status = ProjectStatus::Ready;
        project.total_time_minutes = 60;
        let activated_at = datetime!(2025-05-01 10:00:00);

        let window = activation_window(&project, ProjectStatus::Active, activated_at).unwrap();
        assert_eq!(window.end_time, datetime!(2025-05-01 11:00:00));

        project.end_time = Some(window.end_time);
        // A student opening five minutes later gets the remaining 55 minutes.
        let deadline = compute_deadline(&project, datetime!(2025-05-01 10:05:00));
        assert_eq!(deadline, datetime!(2025-05-01 11:00:00));

        assert!(activation_window(&project, ProjectStatus::Active, activated_at).is_none());
        assert!(activation_window(&project, ProjectStatus::Completed, activated_at).is_none());
    }

    #[test]
    fn deadline_is_capped_by_end_time() {
        let mut project = sample_project("p1", 1);
        project.total_time_minutes = 60;
        let started = datetime!(2025-05-01 10:05:00);
        assert_eq!(compute_deadline(&project, started), datetime!(2025-05-01 11:05:00));

        project.end_time = Some(datetime!(2025-05-01 10:30:00));
        assert_eq!(compute_deadline(&project, started), datetime!(2025-05-01 10:30:00));
    }
}
