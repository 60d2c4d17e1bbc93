//! Defense scheduling, evaluator assignment and result recording
//!
//! Proposal defenses are judged by the department's active committee; every
//! later defense needs a coordinator-allocated panel before a result can be
//! recorded. A recorded result is never overwritten, only corrected.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::lifecycle::{self, GroupEvent, StatusChange};
use crate::models::{
    Committee, CommitteeStatus, Defense, DefenseKind, DefenseOutcome, DefenseResult,
    EvaluationAssignment, GroupAggregate, GroupStatus, Panel, Registry, ResultCorrection,
};
use crate::results;

/// What a defense needs next, derived at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    Upcoming,
    PanelNeeded,
    NeedsResult,
    Concluded(DefenseOutcome),
}

impl std::fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisplayStatus::Upcoming => write!(f, "upcoming"),
            DisplayStatus::PanelNeeded => write!(f, "panel needed"),
            DisplayStatus::NeedsResult => write!(f, "needs result"),
            DisplayStatus::Concluded(outcome) => write!(f, "concluded ({outcome})"),
        }
    }
}

pub fn display_status(defense: &Defense, now: DateTime<Utc>) -> DisplayStatus {
    if let Some(result) = &defense.result {
        return DisplayStatus::Concluded(result.outcome);
    }
    if matches!(defense.assignment, EvaluationAssignment::Unallocated) {
        return DisplayStatus::PanelNeeded;
    }
    if now >= defense.scheduled_at {
        DisplayStatus::NeedsResult
    } else {
        DisplayStatus::Upcoming
    }
}

fn has_accepted(aggregate: &GroupAggregate, kind: DefenseKind) -> bool {
    aggregate
        .defenses
        .iter()
        .any(|d| d.kind == kind && d.outcome() == Some(DefenseOutcome::Accepted))
}

fn has_pending(aggregate: &GroupAggregate, kind: DefenseKind) -> bool {
    aggregate
        .defenses
        .iter()
        .any(|d| d.kind == kind && d.result.is_none())
}

fn prerequisite(kind: DefenseKind) -> Option<DefenseKind> {
    match kind {
        DefenseKind::Proposal | DefenseKind::Initial => None,
        DefenseKind::MidTerm => Some(DefenseKind::Initial),
        DefenseKind::Final => Some(DefenseKind::MidTerm),
    }
}

/// Fails with `InvalidDefenseSequencing` unless `kind` may be scheduled at `scheduled_at`.
pub fn check_sequencing(
    aggregate: &GroupAggregate,
    kind: DefenseKind,
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    let refuse = |reason: String| Err(EngineError::InvalidDefenseSequencing(reason));

    if scheduled_at <= now {
        return refuse(format!("{kind} defense cannot be scheduled in the past"));
    }
    if has_accepted(aggregate, kind) {
        return refuse(format!("{kind} defense was already accepted"));
    }
    if has_pending(aggregate, kind) {
        return refuse(format!("a {kind} defense is still awaiting its result"));
    }

    let status = aggregate.group.status;
    match kind {
        DefenseKind::Proposal => {
            if status != GroupStatus::PendingApproval {
                return refuse(format!(
                    "proposal defense needs a submitted proposal (group is {status})"
                ));
            }
        }
        _ => match status {
            GroupStatus::Active => {
                if let Some(required) = prerequisite(kind) {
                    if !has_accepted(aggregate, required) {
                        return refuse(format!(
                            "{kind} defense requires an accepted {required} defense"
                        ));
                    }
                }
            }
            GroupStatus::Deferred => {
                let deferred = lifecycle::deferred_stage(&aggregate.defenses);
                if deferred != Some(kind) {
                    return refuse(format!(
                        "a deferred group may only re-defend its deferred stage, not {kind}"
                    ));
                }
            }
            _ => {
                return refuse(format!("{kind} defense is not available to a {status} group"));
            }
        },
    }
    Ok(())
}

pub fn schedule_defense(
    aggregate: &mut GroupAggregate,
    registry: &Registry,
    kind: DefenseKind,
    scheduled_at: DateTime<Utc>,
    venue: &str,
    now: DateTime<Utc>,
) -> Result<Defense> {
    if venue.trim().is_empty() {
        return Err(EngineError::ValidationFailed("venue must not be empty".to_string()));
    }
    check_sequencing(aggregate, kind, scheduled_at, now)?;

    let assignment = match kind {
        DefenseKind::Proposal => {
            let committee = registry
                .active_committee(aggregate.group.department_id)
                .ok_or_else(|| {
                    EngineError::ValidationFailed(format!(
                        "department {} has no active committee",
                        aggregate.group.department_id
                    ))
                })?;
            EvaluationAssignment::Committee {
                committee_id: committee.id,
            }
        }
        DefenseKind::Initial | DefenseKind::MidTerm | DefenseKind::Final => {
            EvaluationAssignment::Unallocated
        }
    };

    let defense = Defense {
        id: Uuid::new_v4(),
        group_id: aggregate.id(),
        kind,
        scheduled_at,
        venue: venue.trim().to_string(),
        assignment,
        result: None,
        corrections: Vec::new(),
    };
    aggregate.defenses.push(defense.clone());
    Ok(defense)
}

#[derive(Debug, Clone)]
pub struct PanelAllocation {
    pub defense: Defense,
    /// Fewer internal evaluators than recommended
    pub undersized: bool,
}

/// Set or replace the panel of a non-proposal defense that has no result yet.
pub fn allocate_panel(
    aggregate: &mut GroupAggregate,
    defense_id: Uuid,
    internal: Vec<Uuid>,
    external: Option<Uuid>,
    allocated_by: Uuid,
    recommended_internal: usize,
    now: DateTime<Utc>,
) -> Result<PanelAllocation> {
    let defense = aggregate.defense_mut(defense_id)?;
    if defense.kind == DefenseKind::Proposal {
        return Err(EngineError::ValidationFailed(
            "proposal defenses are evaluated by the committee, not a panel".to_string(),
        ));
    }
    if defense.result.is_some() {
        return Err(EngineError::InvalidTransition(format!(
            "defense {defense_id} is concluded; its panel is frozen"
        )));
    }
    if internal.is_empty() {
        return Err(EngineError::ValidationFailed(
            "a panel needs at least one internal evaluator".to_string(),
        ));
    }
    let distinct: BTreeSet<Uuid> = internal.iter().copied().collect();
    if distinct.len() != internal.len() {
        return Err(EngineError::ValidationFailed(
            "internal evaluators must be distinct".to_string(),
        ));
    }
    if let Some(external) = external {
        if distinct.contains(&external) {
            return Err(EngineError::ValidationFailed(
                "the external evaluator cannot also sit as internal".to_string(),
            ));
        }
    }

    let undersized = internal.len() < recommended_internal;
    defense.assignment = EvaluationAssignment::Panel(Panel {
        internal,
        external,
        allocated_by,
        allocated_at: now,
    });
    Ok(PanelAllocation {
        defense: defense.clone(),
        undersized,
    })
}

/// Who may record: committee members for proposal defenses, panel members
/// otherwise. `privileged` callers (coordinators) bypass membership.
fn ensure_may_record(
    defense: &Defense,
    registry: &Registry,
    recorder: Uuid,
    privileged: bool,
) -> Result<()> {
    match &defense.assignment {
        EvaluationAssignment::Unallocated => Err(EngineError::PanelNotAllocated(defense.id)),
        EvaluationAssignment::Committee { committee_id } => {
            let committee = registry.committee(*committee_id)?;
            if privileged || committee.members.contains(&recorder) {
                Ok(())
            } else {
                Err(EngineError::Forbidden(format!(
                    "{recorder} is not on committee {}",
                    committee.name
                )))
            }
        }
        EvaluationAssignment::Panel(panel) => {
            if privileged || panel.includes(recorder) {
                Ok(())
            } else {
                Err(EngineError::Forbidden(format!(
                    "{recorder} is not on the panel of defense {}",
                    defense.id
                )))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecorded {
    pub defense: Defense,
    pub status_change: Option<StatusChange>,
}

/// Apply the resolved target, then complete an active group whose results
/// were published before its final defense was accepted.
fn settle_status(
    aggregate: &mut GroupAggregate,
    target: Option<GroupStatus>,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>> {
    let from = aggregate.group.status;
    if let Some(to) = target {
        lifecycle::transition(&mut aggregate.group, to, now)?;
    }
    if aggregate.group.status == GroupStatus::Active
        && aggregate.result_state.is_published
        && results::final_defense_accepted(aggregate)
    {
        lifecycle::transition(&mut aggregate.group, GroupStatus::Completed, now)?;
    }
    let to = aggregate.group.status;
    Ok((from != to).then_some(StatusChange { from, to }))
}

#[allow(clippy::too_many_arguments)]
pub fn record_result(
    aggregate: &mut GroupAggregate,
    registry: &Registry,
    defense_id: Uuid,
    outcome: DefenseOutcome,
    remarks: Option<String>,
    recorder: Uuid,
    privileged: bool,
    now: DateTime<Utc>,
) -> Result<ResultRecorded> {
    let defense = aggregate.defense(defense_id)?;
    if defense.result.is_some() {
        return Err(EngineError::InvalidTransition(format!(
            "defense {defense_id} already has a result; record a correction instead"
        )));
    }
    ensure_may_record(defense, registry, recorder, privileged)?;

    let event = GroupEvent::DefenseConcluded {
        kind: defense.kind,
        outcome,
    };
    let target = lifecycle::target_status(
        aggregate.group.status,
        event,
        lifecycle::deferred_stage(&aggregate.defenses),
    )?;

    let defense = aggregate.defense_mut(defense_id)?;
    defense.result = Some(DefenseResult {
        outcome,
        remarks,
        recorded_by: recorder,
        recorded_at: now,
    });
    let defense = defense.clone();

    let status_change = settle_status(aggregate, target, now)?;
    Ok(ResultRecorded {
        defense,
        status_change,
    })
}

/// Replace a recorded outcome, keeping the previous one in the correction log.
pub fn correct_result(
    aggregate: &mut GroupAggregate,
    defense_id: Uuid,
    corrected: DefenseOutcome,
    reason: &str,
    corrected_by: Uuid,
    now: DateTime<Utc>,
) -> Result<ResultRecorded> {
    if reason.trim().is_empty() {
        return Err(EngineError::ValidationFailed(
            "a correction needs a reason".to_string(),
        ));
    }
    let defense = aggregate.defense(defense_id)?;
    let previous = defense.outcome().ok_or_else(|| {
        EngineError::InvalidTransition(format!("defense {defense_id} has no result to correct"))
    })?;
    if previous == corrected {
        return Err(EngineError::ValidationFailed(format!(
            "defense {defense_id} is already {corrected}"
        )));
    }

    let event = GroupEvent::DefenseConcluded {
        kind: defense.kind,
        outcome: corrected,
    };
    let target = lifecycle::target_status(
        aggregate.group.status,
        event,
        lifecycle::deferred_stage(&aggregate.defenses),
    )?;

    let defense = aggregate.defense_mut(defense_id)?;
    if let Some(result) = defense.result.as_mut() {
        result.outcome = corrected;
    }
    defense.corrections.push(ResultCorrection {
        previous,
        corrected,
        reason: reason.trim().to_string(),
        corrected_by,
        at: now,
    });
    let defense = defense.clone();

    let status_change = settle_status(aggregate, target, now)?;
    Ok(ResultRecorded {
        defense,
        status_change,
    })
}

pub fn create_committee(
    registry: &mut Registry,
    name: &str,
    department_id: Uuid,
    members: BTreeSet<Uuid>,
) -> Result<Committee> {
    if name.trim().is_empty() {
        return Err(EngineError::ValidationFailed(
            "committee name must not be empty".to_string(),
        ));
    }
    if members.is_empty() {
        return Err(EngineError::ValidationFailed(
            "a committee needs at least one member".to_string(),
        ));
    }
    let committee = Committee {
        id: Uuid::new_v4(),
        name: name.trim().to_string(),
        department_id,
        members,
        status: CommitteeStatus::PendingApproval,
    };
    registry.committees.push(committee.clone());
    Ok(committee)
}

pub fn approve_committee(registry: &mut Registry, committee_id: Uuid) -> Result<Committee> {
    let committee = registry.committee(committee_id)?;
    if committee.status == CommitteeStatus::Active {
        return Err(EngineError::InvalidTransition(format!(
            "committee {} is already active",
            committee.name
        )));
    }
    if let Some(active) = registry.active_committee(committee.department_id) {
        return Err(EngineError::ValidationFailed(format!(
            "department already has an active committee ({})",
            active.name
        )));
    }

    let committee = registry
        .committees
        .iter_mut()
        .find(|c| c.id == committee_id)
        .ok_or_else(|| EngineError::NotFound(format!("committee {committee_id}")))?;
    committee.status = CommitteeStatus::Active;
    Ok(committee.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupPolicy;
    use chrono::Duration;

    struct Fixture {
        aggregate: GroupAggregate,
        registry: Registry,
        committee_member: Uuid,
        now: DateTime<Utc>,
    }

    fn fixture(status: GroupStatus) -> Fixture {
        let now = Utc::now();
        let mut group = lifecycle::new_group(
            "Team Hydra",
            Uuid::new_v4(),
            &[Uuid::new_v4(), Uuid::new_v4()],
            None,
            &GroupPolicy::default(),
            now,
        )
        .unwrap();
        group.status = status;
        let department = group.department_id;

        let mut registry = Registry::default();
        let committee_member = Uuid::new_v4();
        let committee = create_committee(
            &mut registry,
            "Proposal Committee",
            department,
            [committee_member].into_iter().collect(),
        )
        .unwrap();
        approve_committee(&mut registry, committee.id).unwrap();

        Fixture {
            aggregate: GroupAggregate::new(group),
            registry,
            committee_member,
            now,
        }
    }

    fn later(f: &Fixture) -> DateTime<Utc> {
        f.now + Duration::days(3)
    }

    #[test]
    fn proposal_defense_binds_active_committee() {
        let mut f = fixture(GroupStatus::PendingApproval);
        let at = later(&f);
        let defense =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Proposal, at, "Hall A", f.now)
                .unwrap();
        assert!(matches!(
            defense.assignment,
            EvaluationAssignment::Committee { .. }
        ));
    }

    #[test]
    fn proposal_defense_accepted_activates_group() {
        let mut f = fixture(GroupStatus::PendingApproval);
        let at = later(&f);
        let defense =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Proposal, at, "Hall A", f.now)
                .unwrap();
        let recorded = record_result(
            &mut f.aggregate,
            &f.registry,
            defense.id,
            DefenseOutcome::Accepted,
            None,
            f.committee_member,
            false,
            at,
        )
        .unwrap();
        assert_eq!(f.aggregate.group.status, GroupStatus::Active);
        assert_eq!(
            recorded.status_change.map(|c| c.to),
            Some(GroupStatus::Active)
        );
    }

    #[test]
    fn non_member_cannot_record_committee_result() {
        let mut f = fixture(GroupStatus::PendingApproval);
        let at = later(&f);
        let defense =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Proposal, at, "Hall A", f.now)
                .unwrap();
        let err = record_result(
            &mut f.aggregate,
            &f.registry,
            defense.id,
            DefenseOutcome::Accepted,
            None,
            Uuid::new_v4(),
            false,
            at,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
        assert!(f.aggregate.defenses[0].result.is_none());
    }

    #[test]
    fn initial_result_needs_panel_first() {
        let mut f = fixture(GroupStatus::Active);
        let at = later(&f);
        let coordinator = Uuid::new_v4();
        let defense =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, at, "Lab 2", f.now)
                .unwrap();

        let err = record_result(
            &mut f.aggregate,
            &f.registry,
            defense.id,
            DefenseOutcome::Accepted,
            None,
            coordinator,
            true,
            at,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::PanelNotAllocated(id) if id == defense.id));

        let allocation = allocate_panel(
            &mut f.aggregate,
            defense.id,
            vec![Uuid::new_v4()],
            None,
            coordinator,
            2,
            f.now,
        )
        .unwrap();
        assert!(allocation.undersized);

        record_result(
            &mut f.aggregate,
            &f.registry,
            defense.id,
            DefenseOutcome::Accepted,
            None,
            coordinator,
            true,
            at,
        )
        .unwrap();
        assert_eq!(
            f.aggregate.defenses[0].outcome(),
            Some(DefenseOutcome::Accepted)
        );
    }

    #[test]
    fn panel_rules() {
        let mut f = fixture(GroupStatus::Active);
        let at = later(&f);
        let defense =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, at, "Lab 2", f.now)
                .unwrap();
        let a = Uuid::new_v4();
        let by = Uuid::new_v4();

        let err = allocate_panel(&mut f.aggregate, defense.id, vec![], None, by, 2, f.now);
        assert!(matches!(err, Err(EngineError::ValidationFailed(_))));
        let err = allocate_panel(&mut f.aggregate, defense.id, vec![a, a], None, by, 2, f.now);
        assert!(matches!(err, Err(EngineError::ValidationFailed(_))));
        let err = allocate_panel(&mut f.aggregate, defense.id, vec![a], Some(a), by, 2, f.now);
        assert!(matches!(err, Err(EngineError::ValidationFailed(_))));
        assert!(matches!(
            f.aggregate.defenses[0].assignment,
            EvaluationAssignment::Unallocated
        ));

        let ok = allocate_panel(
            &mut f.aggregate,
            defense.id,
            vec![a, Uuid::new_v4()],
            Some(Uuid::new_v4()),
            by,
            2,
            f.now,
        )
        .unwrap();
        assert!(!ok.undersized);
    }

    #[test]
    fn evaluator_outside_panel_is_forbidden() {
        let mut f = fixture(GroupStatus::Active);
        let at = later(&f);
        let defense =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, at, "Lab 2", f.now)
                .unwrap();
        let evaluator = Uuid::new_v4();
        allocate_panel(&mut f.aggregate, defense.id, vec![evaluator], None, evaluator, 2, f.now)
            .unwrap();

        let err = record_result(
            &mut f.aggregate,
            &f.registry,
            defense.id,
            DefenseOutcome::Accepted,
            None,
            Uuid::new_v4(),
            false,
            at,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        record_result(
            &mut f.aggregate,
            &f.registry,
            defense.id,
            DefenseOutcome::Accepted,
            None,
            evaluator,
            false,
            at,
        )
        .unwrap();
    }

    #[test]
    fn result_is_not_overwritten() {
        let mut f = fixture(GroupStatus::Active);
        let at = later(&f);
        let defense =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, at, "Lab 2", f.now)
                .unwrap();
        let c = Uuid::new_v4();
        allocate_panel(&mut f.aggregate, defense.id, vec![c], None, c, 1, f.now).unwrap();
        record_result(&mut f.aggregate, &f.registry, defense.id, DefenseOutcome::Deferred, None, c, true, at)
            .unwrap();
        assert_eq!(f.aggregate.group.status, GroupStatus::Deferred);

        let err = record_result(
            &mut f.aggregate,
            &f.registry,
            defense.id,
            DefenseOutcome::Accepted,
            None,
            c,
            true,
            at,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));

        let corrected = correct_result(
            &mut f.aggregate,
            defense.id,
            DefenseOutcome::Accepted,
            "marks were mis-entered",
            c,
            at,
        )
        .unwrap();
        assert_eq!(corrected.defense.corrections.len(), 1);
        assert_eq!(corrected.defense.corrections[0].previous, DefenseOutcome::Deferred);
        assert_eq!(f.aggregate.group.status, GroupStatus::Active);
    }

    fn pending_final(f: &mut Fixture) -> Uuid {
        let id = Uuid::new_v4();
        let group_id = f.aggregate.id();
        let scheduled_at = later(f);
        f.aggregate.defenses.push(Defense {
            id,
            group_id,
            kind: DefenseKind::Final,
            scheduled_at,
            venue: "Auditorium".to_string(),
            assignment: EvaluationAssignment::Unallocated,
            result: None,
            corrections: Vec::new(),
        });
        id
    }

    #[test]
    fn final_accepted_after_publication_completes_group() {
        let mut f = fixture(GroupStatus::Active);
        f.aggregate.result_state.is_compiled = true;
        f.aggregate.result_state.is_published = true;
        let final_id = pending_final(&mut f);
        let c = Uuid::new_v4();
        allocate_panel(&mut f.aggregate, final_id, vec![c], None, c, 1, f.now).unwrap();

        let at = later(&f);
        let recorded = record_result(
            &mut f.aggregate,
            &f.registry,
            final_id,
            DefenseOutcome::Accepted,
            None,
            c,
            false,
            at,
        )
        .unwrap();
        assert_eq!(
            recorded.status_change,
            Some(StatusChange {
                from: GroupStatus::Active,
                to: GroupStatus::Completed
            })
        );
        assert_eq!(f.aggregate.group.status, GroupStatus::Completed);
    }

    #[test]
    fn final_accepted_before_publication_keeps_group_active() {
        let mut f = fixture(GroupStatus::Active);
        let final_id = pending_final(&mut f);
        let c = Uuid::new_v4();
        allocate_panel(&mut f.aggregate, final_id, vec![c], None, c, 1, f.now).unwrap();

        let at = later(&f);
        let recorded = record_result(
            &mut f.aggregate,
            &f.registry,
            final_id,
            DefenseOutcome::Accepted,
            None,
            c,
            false,
            at,
        )
        .unwrap();
        assert_eq!(recorded.status_change, None);
        assert_eq!(f.aggregate.group.status, GroupStatus::Active);
    }

    #[test]
    fn corrected_final_after_publication_completes_deferred_group() {
        let mut f = fixture(GroupStatus::Active);
        f.aggregate.result_state.is_compiled = true;
        f.aggregate.result_state.is_published = true;
        let final_id = pending_final(&mut f);
        let c = Uuid::new_v4();
        allocate_panel(&mut f.aggregate, final_id, vec![c], None, c, 1, f.now).unwrap();
        let at = later(&f);
        record_result(&mut f.aggregate, &f.registry, final_id, DefenseOutcome::Deferred, None, c, false, at)
            .unwrap();
        assert_eq!(f.aggregate.group.status, GroupStatus::Deferred);

        let corrected =
            correct_result(&mut f.aggregate, final_id, DefenseOutcome::Accepted, "panel recount", c, at)
                .unwrap();
        assert_eq!(
            corrected.status_change.map(|c| (c.from, c.to)),
            Some((GroupStatus::Deferred, GroupStatus::Completed))
        );
    }

    #[test]
    fn correction_that_breaks_lifecycle_changes_nothing() {
        let mut f = fixture(GroupStatus::Active);
        let at = later(&f);
        let defense =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, at, "Lab 2", f.now)
                .unwrap();
        let c = Uuid::new_v4();
        allocate_panel(&mut f.aggregate, defense.id, vec![c], None, c, 1, f.now).unwrap();
        record_result(&mut f.aggregate, &f.registry, defense.id, DefenseOutcome::Rejected, None, c, true, at)
            .unwrap();
        assert_eq!(f.aggregate.group.status, GroupStatus::Rejected);

        let before = f.aggregate.clone();
        let err = correct_result(&mut f.aggregate, defense.id, DefenseOutcome::Accepted, "appeal", c, at)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
        assert_eq!(f.aggregate, before);
    }

    #[test]
    fn sequencing_rules() {
        let mut f = fixture(GroupStatus::Active);
        let past = f.now - Duration::hours(1);
        let at = later(&f);

        let err = schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, past, "Lab", f.now)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefenseSequencing(_)));

        let err = schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::MidTerm, at, "Lab", f.now)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefenseSequencing(_)));

        let err = schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Proposal, at, "Lab", f.now)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefenseSequencing(_)));

        schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, at, "Lab", f.now).unwrap();
        let err = schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, at, "Lab", f.now)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefenseSequencing(_)));
        assert_eq!(f.aggregate.defenses.len(), 1);
    }

    #[test]
    fn deferred_group_may_only_redefend_its_stage() {
        let mut f = fixture(GroupStatus::Active);
        let at = later(&f);
        let c = Uuid::new_v4();
        let initial =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, at, "Lab", f.now).unwrap();
        allocate_panel(&mut f.aggregate, initial.id, vec![c], None, c, 1, f.now).unwrap();
        record_result(&mut f.aggregate, &f.registry, initial.id, DefenseOutcome::Deferred, None, c, true, at)
            .unwrap();

        let err = schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::MidTerm, at, "Lab", f.now)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefenseSequencing(_)));

        let redo = at + Duration::days(7);
        let again =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, redo, "Lab", f.now).unwrap();
        allocate_panel(&mut f.aggregate, again.id, vec![c], None, c, 1, f.now).unwrap();
        record_result(&mut f.aggregate, &f.registry, again.id, DefenseOutcome::Accepted, None, c, true, redo)
            .unwrap();
        assert_eq!(f.aggregate.group.status, GroupStatus::Active);
    }

    #[test]
    fn missing_committee_blocks_proposal_defense() {
        let mut f = fixture(GroupStatus::PendingApproval);
        f.registry.committees.clear();
        let at = later(&f);
        let err = schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Proposal, at, "Hall", f.now)
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }

    #[test]
    fn display_status_is_derived_from_time_and_assignment() {
        let mut f = fixture(GroupStatus::Active);
        let at = later(&f);
        let defense =
            schedule_defense(&mut f.aggregate, &f.registry, DefenseKind::Initial, at, "Lab", f.now).unwrap();
        assert_eq!(display_status(&defense, f.now), DisplayStatus::PanelNeeded);

        let c = Uuid::new_v4();
        let allocated = allocate_panel(&mut f.aggregate, defense.id, vec![c], None, c, 1, f.now)
            .unwrap()
            .defense;
        assert_eq!(display_status(&allocated, f.now), DisplayStatus::Upcoming);
        assert_eq!(
            display_status(&allocated, at + Duration::hours(1)),
            DisplayStatus::NeedsResult
        );

        let recorded = record_result(&mut f.aggregate, &f.registry, defense.id, DefenseOutcome::Accepted, None, c, true, at)
            .unwrap()
            .defense;
        assert_eq!(
            display_status(&recorded, at),
            DisplayStatus::Concluded(DefenseOutcome::Accepted)
        );
    }

    #[test]
    fn one_active_committee_per_department() {
        let mut registry = Registry::default();
        let department = Uuid::new_v4();
        let members: BTreeSet<Uuid> = [Uuid::new_v4()].into_iter().collect();
        let first = create_committee(&mut registry, "A", department, members.clone()).unwrap();
        let second = create_committee(&mut registry, "B", department, members).unwrap();
        approve_committee(&mut registry, first.id).unwrap();

        assert!(matches!(
            approve_committee(&mut registry, first.id),
            Err(EngineError::InvalidTransition(_))
        ));
        assert!(matches!(
            approve_committee(&mut registry, second.id),
            Err(EngineError::ValidationFailed(_))
        ));
        assert!(create_committee(&mut registry, "C", department, BTreeSet::new()).is_err());
    }
}
