//! Group lifecycle: status machine, membership and stage eligibility
//!
//! Status moves forward only along [`GROUP_EDGES`]:
//! forming → pending_approval → active → completed, with active ⇄ deferred
//! and active/deferred → rejected.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::GroupPolicy;
use crate::error::{EngineError, Result};
use crate::models::{
    Defense, DefenseKind, DefenseOutcome, Group, GroupAggregate, GroupStatus, Member,
    ProposalStatus,
};

/// Every permitted status change. This table is the source of truth.
pub const GROUP_EDGES: &[(GroupStatus, GroupStatus)] = &[
    (GroupStatus::Forming, GroupStatus::PendingApproval),
    (GroupStatus::PendingApproval, GroupStatus::Active),
    (GroupStatus::Active, GroupStatus::Completed),
    (GroupStatus::Active, GroupStatus::Deferred),
    (GroupStatus::Active, GroupStatus::Rejected),
    (GroupStatus::Deferred, GroupStatus::Active),
    (GroupStatus::Deferred, GroupStatus::Rejected),
];

/// Facts from other components that may move a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEvent {
    ProposalSubmitted,
    ApprovedWithoutDefense,
    DefenseConcluded {
        kind: DefenseKind,
        outcome: DefenseOutcome,
    },
    ResultsPublished {
        final_accepted: bool,
    },
}

/// Applied status change, for logging and notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: GroupStatus,
    pub to: GroupStatus,
}

pub fn is_allowed(from: GroupStatus, to: GroupStatus) -> bool {
    GROUP_EDGES.contains(&(from, to))
}

pub fn allowed_next(from: GroupStatus) -> Vec<GroupStatus> {
    GROUP_EDGES
        .iter()
        .filter(|(f, _)| *f == from)
        .map(|(_, t)| *t)
        .collect()
}

pub fn is_terminal(status: GroupStatus) -> bool {
    allowed_next(status).is_empty()
}

/// Move `group` to `to`, or fail with `InvalidTransition` leaving it untouched.
pub fn transition(group: &mut Group, to: GroupStatus, now: DateTime<Utc>) -> Result<StatusChange> {
    let from = group.status;
    if !is_allowed(from, to) {
        return Err(EngineError::InvalidTransition(format!(
            "group {} cannot move from {} to {}",
            group.id, from, to
        )));
    }
    group.status = to;
    group.updated_at = now;
    Ok(StatusChange { from, to })
}

/// Stage a deferred group is waiting to re-defend: the most recently
/// concluded defense with a deferred outcome.
pub fn deferred_stage(defenses: &[Defense]) -> Option<DefenseKind> {
    defenses
        .iter()
        .filter_map(|d| d.result.as_ref().map(|r| (d.kind, r)))
        .filter(|(_, r)| r.outcome == DefenseOutcome::Deferred)
        .max_by_key(|(_, r)| r.recorded_at)
        .map(|(kind, _)| kind)
}

/// Resolve the target status for `event`. `Ok(None)` means the event is
/// valid for the current status but does not move the group.
pub fn target_status(
    current: GroupStatus,
    event: GroupEvent,
    deferred_kind: Option<DefenseKind>,
) -> Result<Option<GroupStatus>> {
    use GroupStatus::*;

    let invalid = || {
        Err(EngineError::InvalidTransition(format!(
            "{event:?} is not applicable to a {current} group"
        )))
    };

    match event {
        GroupEvent::ProposalSubmitted => match current {
            Forming => Ok(Some(PendingApproval)),
            PendingApproval => Ok(None),
            _ => invalid(),
        },
        GroupEvent::ApprovedWithoutDefense => match current {
            PendingApproval => Ok(Some(Active)),
            _ => invalid(),
        },
        GroupEvent::DefenseConcluded {
            kind: DefenseKind::Proposal,
            outcome,
        } => match current {
            // A failed proposal defense leaves the proposal pipeline open.
            PendingApproval => Ok(match outcome {
                DefenseOutcome::Accepted => Some(Active),
                DefenseOutcome::Deferred | DefenseOutcome::Rejected => None,
            }),
            _ => invalid(),
        },
        GroupEvent::DefenseConcluded { kind, outcome } => match current {
            Active => Ok(match outcome {
                DefenseOutcome::Accepted => None,
                DefenseOutcome::Deferred => Some(Deferred),
                DefenseOutcome::Rejected => Some(Rejected),
            }),
            Deferred if deferred_kind == Some(kind) => Ok(match outcome {
                DefenseOutcome::Accepted => Some(Active),
                DefenseOutcome::Deferred => None,
                DefenseOutcome::Rejected => Some(Rejected),
            }),
            _ => invalid(),
        },
        GroupEvent::ResultsPublished { final_accepted } => match current {
            Active if final_accepted => Ok(Some(Completed)),
            _ => Ok(None),
        },
    }
}

/// Resolve and apply `event` to the group owned by `aggregate`.
pub fn apply_event(
    aggregate: &mut GroupAggregate,
    event: GroupEvent,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>> {
    let deferred_kind = deferred_stage(&aggregate.defenses);
    match target_status(aggregate.group.status, event, deferred_kind)? {
        Some(to) => transition(&mut aggregate.group, to, now).map(Some),
        None => Ok(None),
    }
}

/// What a group may do right now, derived from its status on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eligibility {
    pub accepts_proposals: bool,
    pub accepts_documents: bool,
    pub accepts_meetings: bool,
    pub compilable: bool,
}

pub fn eligibility(status: GroupStatus) -> Eligibility {
    use GroupStatus::*;
    Eligibility {
        accepts_proposals: matches!(status, Forming | PendingApproval),
        accepts_documents: matches!(status, Active | Deferred),
        accepts_meetings: matches!(status, PendingApproval | Active | Deferred),
        compilable: matches!(status, Active | Completed),
    }
}

/// Build a new group in `Forming`. The first student leads unless `lead` says otherwise.
pub fn new_group(
    name: &str,
    department_id: Uuid,
    students: &[Uuid],
    lead: Option<Uuid>,
    policy: &GroupPolicy,
    now: DateTime<Utc>,
) -> Result<Group> {
    if name.trim().is_empty() {
        return Err(EngineError::ValidationFailed("group name must not be empty".to_string()));
    }
    let Some(&first) = students.first() else {
        return Err(EngineError::ValidationFailed("a group needs at least one member".to_string()));
    };
    if students.len() < policy.min_members || students.len() > policy.max_members {
        return Err(EngineError::ValidationFailed(format!(
            "a group needs between {} and {} members, got {}",
            policy.min_members,
            policy.max_members,
            students.len()
        )));
    }
    for (i, student) in students.iter().enumerate() {
        if students[..i].contains(student) {
            return Err(EngineError::ValidationFailed(format!(
                "student {student} listed twice"
            )));
        }
    }
    let lead = lead.unwrap_or(first);
    if !students.contains(&lead) {
        return Err(EngineError::ValidationFailed(format!(
            "lead {lead} is not among the members"
        )));
    }

    let id = Uuid::new_v4();
    let members = students
        .iter()
        .map(|student| Member {
            id: Uuid::new_v4(),
            student_id: *student,
            group_id: id,
            is_lead: *student == lead,
        })
        .collect();

    Ok(Group {
        id,
        name: name.trim().to_string(),
        project_title: None,
        status: GroupStatus::Forming,
        department_id,
        supervisor_id: None,
        members,
        created_at: now,
        updated_at: now,
    })
}

fn ensure_forming(group: &Group) -> Result<()> {
    if group.status != GroupStatus::Forming {
        return Err(EngineError::InvalidTransition(format!(
            "membership of group {} is frozen once it leaves forming (status {})",
            group.id, group.status
        )));
    }
    Ok(())
}

pub fn check_single_lead(group: &Group) -> Result<()> {
    let leads = group.members.iter().filter(|m| m.is_lead).count();
    if leads != 1 {
        return Err(EngineError::ValidationFailed(format!(
            "group {} must have exactly one lead, found {}",
            group.id, leads
        )));
    }
    Ok(())
}

pub fn add_member(group: &mut Group, student_id: Uuid, policy: &GroupPolicy) -> Result<Member> {
    ensure_forming(group)?;
    if group.member_by_student(student_id).is_some() {
        return Err(EngineError::ValidationFailed(format!(
            "student {student_id} is already a member"
        )));
    }
    if group.members.len() >= policy.max_members {
        return Err(EngineError::ValidationFailed(format!(
            "group {} already has {} members",
            group.id, policy.max_members
        )));
    }
    let member = Member {
        id: Uuid::new_v4(),
        student_id,
        group_id: group.id,
        is_lead: false,
    };
    group.members.push(member.clone());
    check_single_lead(group)?;
    Ok(member)
}

pub fn remove_member(group: &mut Group, student_id: Uuid, policy: &GroupPolicy) -> Result<()> {
    ensure_forming(group)?;
    let member = group
        .member_by_student(student_id)
        .ok_or_else(|| EngineError::NotFound(format!("member {student_id}")))?;
    if member.is_lead {
        return Err(EngineError::ValidationFailed(
            "hand over the lead role before removing the lead".to_string(),
        ));
    }
    if group.members.len() <= policy.min_members {
        return Err(EngineError::ValidationFailed(format!(
            "group {} cannot drop below {} members",
            group.id, policy.min_members
        )));
    }
    group.members.retain(|m| m.student_id != student_id);
    check_single_lead(group)
}

pub fn set_lead(group: &mut Group, student_id: Uuid) -> Result<()> {
    ensure_forming(group)?;
    if group.member_by_student(student_id).is_none() {
        return Err(EngineError::NotFound(format!("member {student_id}")));
    }
    for member in group.members.iter_mut() {
        member.is_lead = member.student_id == student_id;
    }
    check_single_lead(group)
}

pub fn assign_supervisor(group: &mut Group, supervisor_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    if !matches!(group.status, GroupStatus::Forming | GroupStatus::PendingApproval) {
        return Err(EngineError::InvalidTransition(format!(
            "supervisor of a {} group cannot be changed",
            group.status
        )));
    }
    group.supervisor_id = Some(supervisor_id);
    group.updated_at = now;
    Ok(())
}

/// Coordinator approval path that activates a group without a proposal defense.
pub fn approve_without_defense(
    aggregate: &mut GroupAggregate,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>> {
    if aggregate.group.supervisor_id.is_none() {
        return Err(EngineError::InvalidTransition(
            "a supervisor must be assigned before approval".to_string(),
        ));
    }
    if !aggregate
        .proposals
        .iter()
        .any(|p| p.status == ProposalStatus::Approved)
    {
        return Err(EngineError::InvalidTransition(
            "at least one approved proposal is required before approval".to_string(),
        ));
    }
    apply_event(aggregate, GroupEvent::ApprovedWithoutDefense, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DefenseResult;
    use crate::models::EvaluationAssignment;
    use chrono::Duration;

    fn make_group(status: GroupStatus) -> Group {
        let mut group = new_group(
            "Team Orion",
            Uuid::new_v4(),
            &[Uuid::new_v4(), Uuid::new_v4()],
            None,
            &GroupPolicy::default(),
            Utc::now(),
        )
        .unwrap();
        group.status = status;
        group
    }

    fn concluded(kind: DefenseKind, outcome: DefenseOutcome, minutes: i64) -> Defense {
        let at = Utc::now() + Duration::minutes(minutes);
        Defense {
            id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            kind,
            scheduled_at: at,
            venue: "Lab 3".to_string(),
            assignment: EvaluationAssignment::Unallocated,
            result: Some(DefenseResult {
                outcome,
                remarks: None,
                recorded_by: Uuid::new_v4(),
                recorded_at: at,
            }),
            corrections: Vec::new(),
        }
    }

    #[test]
    fn test_new_group_without_students_is_refused() {
        let policy = GroupPolicy {
            min_members: 0,
            max_members: 4,
        };
        let err = new_group("Team Lyra", Uuid::new_v4(), &[], None, &policy, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }

    #[test]
    fn test_forming_to_pending_on_first_submission() {
        assert_eq!(
            target_status(GroupStatus::Forming, GroupEvent::ProposalSubmitted, None).unwrap(),
            Some(GroupStatus::PendingApproval)
        );
        assert_eq!(
            target_status(GroupStatus::PendingApproval, GroupEvent::ProposalSubmitted, None)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_proposal_defense_accepted_activates_group() {
        let event = GroupEvent::DefenseConcluded {
            kind: DefenseKind::Proposal,
            outcome: DefenseOutcome::Accepted,
        };
        assert_eq!(
            target_status(GroupStatus::PendingApproval, event, None).unwrap(),
            Some(GroupStatus::Active)
        );
    }

    #[test]
    fn test_rejected_proposal_defense_keeps_pipeline_open() {
        let event = GroupEvent::DefenseConcluded {
            kind: DefenseKind::Proposal,
            outcome: DefenseOutcome::Rejected,
        };
        assert_eq!(target_status(GroupStatus::PendingApproval, event, None).unwrap(), None);
        assert!(eligibility(GroupStatus::PendingApproval).accepts_proposals);
    }

    #[test]
    fn test_deferred_then_accepted_same_kind_returns_to_active() {
        let deferred = GroupEvent::DefenseConcluded {
            kind: DefenseKind::MidTerm,
            outcome: DefenseOutcome::Deferred,
        };
        assert_eq!(
            target_status(GroupStatus::Active, deferred, None).unwrap(),
            Some(GroupStatus::Deferred)
        );

        let accepted = GroupEvent::DefenseConcluded {
            kind: DefenseKind::MidTerm,
            outcome: DefenseOutcome::Accepted,
        };
        assert_eq!(
            target_status(GroupStatus::Deferred, accepted, Some(DefenseKind::MidTerm)).unwrap(),
            Some(GroupStatus::Active)
        );
    }

    #[test]
    fn test_deferred_group_ignores_other_defense_kinds() {
        let accepted = GroupEvent::DefenseConcluded {
            kind: DefenseKind::Final,
            outcome: DefenseOutcome::Accepted,
        };
        let err =
            target_status(GroupStatus::Deferred, accepted, Some(DefenseKind::MidTerm)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[test]
    fn test_rejected_is_terminal() {
        assert!(is_terminal(GroupStatus::Rejected));
        assert!(is_terminal(GroupStatus::Completed));
        assert!(!is_terminal(GroupStatus::Deferred));
        let event = GroupEvent::DefenseConcluded {
            kind: DefenseKind::Final,
            outcome: DefenseOutcome::Accepted,
        };
        assert!(target_status(GroupStatus::Rejected, event, None).is_err());
    }

    #[test]
    fn test_publication_completes_only_after_final_accepted() {
        assert_eq!(
            target_status(
                GroupStatus::Active,
                GroupEvent::ResultsPublished {
                    final_accepted: true
                },
                None
            )
            .unwrap(),
            Some(GroupStatus::Completed)
        );
        assert_eq!(
            target_status(
                GroupStatus::Active,
                GroupEvent::ResultsPublished {
                    final_accepted: false
                },
                None
            )
            .unwrap(),
            None
        );
    }

    #[test]
    fn test_invalid_transition_leaves_status_unchanged() {
        let mut group = make_group(GroupStatus::Forming);
        let err = transition(&mut group, GroupStatus::Completed, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
        assert_eq!(group.status, GroupStatus::Forming);
    }

    #[test]
    fn test_deferred_stage_uses_latest_deferral() {
        let defenses = vec![
            concluded(DefenseKind::Initial, DefenseOutcome::Deferred, 0),
            concluded(DefenseKind::Initial, DefenseOutcome::Accepted, 10),
            concluded(DefenseKind::MidTerm, DefenseOutcome::Deferred, 20),
        ];
        assert_eq!(deferred_stage(&defenses), Some(DefenseKind::MidTerm));
        assert_eq!(deferred_stage(&[]), None);
    }

    #[test]
    fn test_new_group_assigns_single_lead() {
        let students = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let group = new_group(
            "Team Vega",
            Uuid::new_v4(),
            &students,
            Some(students[2]),
            &GroupPolicy::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(group.status, GroupStatus::Forming);
        assert_eq!(group.lead().unwrap().student_id, students[2]);
        check_single_lead(&group).unwrap();
    }

    #[test]
    fn test_new_group_rejects_duplicates_and_oversize() {
        let s = Uuid::new_v4();
        let policy = GroupPolicy::default();
        assert!(new_group("A", Uuid::new_v4(), &[s, s], None, &policy, Utc::now()).is_err());
        let many: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        assert!(new_group("A", Uuid::new_v4(), &many, None, &policy, Utc::now()).is_err());
        assert!(new_group(" ", Uuid::new_v4(), &[s], None, &policy, Utc::now()).is_err());
    }

    #[test]
    fn test_membership_edits_keep_one_lead() {
        let policy = GroupPolicy::default();
        let mut group = make_group(GroupStatus::Forming);
        let newcomer = Uuid::new_v4();
        add_member(&mut group, newcomer, &policy).unwrap();
        set_lead(&mut group, newcomer).unwrap();
        assert_eq!(group.lead().unwrap().student_id, newcomer);

        let err = remove_member(&mut group, newcomer, &policy).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));

        let other = group.members[0].student_id;
        remove_member(&mut group, other, &policy).unwrap();
        check_single_lead(&group).unwrap();
    }

    #[test]
    fn test_membership_frozen_after_forming() {
        let mut group = make_group(GroupStatus::PendingApproval);
        let err = add_member(&mut group, Uuid::new_v4(), &GroupPolicy::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[test]
    fn test_approval_path_requires_supervisor_and_approved_proposal() {
        let group = make_group(GroupStatus::PendingApproval);
        let mut aggregate = GroupAggregate::new(group);
        let err = approve_without_defense(&mut aggregate, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
        assert_eq!(aggregate.group.status, GroupStatus::PendingApproval);
    }

    #[test]
    fn test_eligibility_follows_status() {
        assert!(eligibility(GroupStatus::Active).accepts_documents);
        assert!(!eligibility(GroupStatus::Forming).accepts_documents);
        assert!(eligibility(GroupStatus::Completed).compilable);
        assert!(!eligibility(GroupStatus::Deferred).compilable);
    }
}
