//! Marks, compilation and publication of group results

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{ComponentWeights, GradeBand, ResultsPolicy, SupervisionWeights};
use crate::error::{EngineError, Result};
use crate::lifecycle::{self, GroupEvent, StatusChange};
use crate::models::{
    DefenseKind, DefenseOutcome, FinalResult, GroupAggregate, GroupStatus, MarkComponent,
    ResultRecord,
};

pub const MAX_MARK: f64 = 100.0;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Weighted mean of the four components; missing marks count as zero.
pub fn weighted_total(record: &ResultRecord, weights: &ComponentWeights) -> f64 {
    let sum = weights.sum();
    if sum <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = MarkComponent::ALL
        .iter()
        .map(|c| record.component(*c).unwrap_or(0.0) * weights.weight(*c))
        .sum();
    round2(weighted / sum)
}

/// First band whose threshold `total` reaches. Bands are ordered high to low.
pub fn grade_for(bands: &[GradeBand], total: f64) -> Option<&str> {
    bands
        .iter()
        .find(|band| total >= band.min)
        .map(|band| band.grade.as_str())
}

/// Supervisor's scores on the four supervision criteria, each 0-100.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisionAssessment {
    pub regularity: f64,
    pub progress: f64,
    pub technical: f64,
    pub documentation: f64,
}

impl SupervisionAssessment {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("regularity", self.regularity),
            ("progress", self.progress),
            ("technical", self.technical),
            ("documentation", self.documentation),
        ] {
            check_mark(name, value)?;
        }
        Ok(())
    }

    pub fn score(&self, weights: &SupervisionWeights) -> f64 {
        let weighted = self.regularity * weights.regularity
            + self.progress * weights.progress
            + self.technical * weights.technical
            + self.documentation * weights.documentation;
        round2(weighted / weights.sum())
    }
}

fn check_mark(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=MAX_MARK).contains(&value) {
        return Err(EngineError::ValidationFailed(format!(
            "{name} marks must be between 0 and {MAX_MARK}, got {value}"
        )));
    }
    Ok(())
}

fn ensure_unpublished(aggregate: &GroupAggregate) -> Result<()> {
    if aggregate.result_state.is_published {
        return Err(EngineError::ResultsAlreadyPublished(aggregate.id()));
    }
    Ok(())
}

/// Drop result rows of students who are no longer members.
pub fn drop_departed_results(aggregate: &mut GroupAggregate) {
    let members = &aggregate.group.members;
    aggregate
        .results
        .retain(|r| members.iter().any(|m| m.id == r.member_id));
}

/// Make sure every current member, and only current members, has a result row.
pub fn ensure_result_rows(aggregate: &mut GroupAggregate) {
    drop_departed_results(aggregate);
    for member in &aggregate.group.members {
        if !aggregate.results.iter().any(|r| r.member_id == member.id) {
            aggregate.results.push(ResultRecord::new(member));
        }
    }
}

fn record_for_student(aggregate: &mut GroupAggregate, student_id: Uuid) -> Result<&mut ResultRecord> {
    if aggregate.group.status == GroupStatus::Forming {
        return Err(EngineError::InvalidTransition(format!(
            "group {} is still forming; marks open once its proposal is submitted",
            aggregate.id()
        )));
    }
    if aggregate.group.member_by_student(student_id).is_none() {
        return Err(EngineError::NotFound(format!(
            "student {student_id} in group {}",
            aggregate.id()
        )));
    }
    ensure_result_rows(aggregate);
    let group_id = aggregate.id();
    aggregate
        .results
        .iter_mut()
        .find(|r| r.student_id == student_id)
        .ok_or_else(|| EngineError::NotFound(format!("result of {student_id} in group {group_id}")))
}

/// Set one component mark. Any edit invalidates the last compilation.
pub fn record_mark(
    aggregate: &mut GroupAggregate,
    student_id: Uuid,
    component: MarkComponent,
    value: f64,
) -> Result<()> {
    ensure_unpublished(aggregate)?;
    check_mark(component.as_str(), value)?;
    let record = record_for_student(aggregate, student_id)?;
    *record.component_mut(component) = Some(value);
    aggregate.result_state.is_compiled = false;
    Ok(())
}

pub fn record_supervision(
    aggregate: &mut GroupAggregate,
    student_id: Uuid,
    assessment: &SupervisionAssessment,
    weights: &SupervisionWeights,
) -> Result<f64> {
    assessment.validate()?;
    let score = assessment.score(weights);
    record_mark(aggregate, student_id, MarkComponent::Supervisor, score)?;
    Ok(score)
}

/// Manual per-member verdict, independent of the computed grade.
pub fn set_final_result(
    aggregate: &mut GroupAggregate,
    student_id: Uuid,
    result: FinalResult,
) -> Result<()> {
    ensure_unpublished(aggregate)?;
    let record = record_for_student(aggregate, student_id)?;
    record.final_result = Some(result);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled { members: usize },
    SkippedPublished,
    NotEligible,
}

/// Recompute totals and grades for one group. Re-running on unchanged marks
/// yields identical values and keeps the original compilation time.
pub fn compile_group(
    aggregate: &mut GroupAggregate,
    policy: &ResultsPolicy,
    now: DateTime<Utc>,
) -> CompileOutcome {
    if aggregate.result_state.is_published {
        return CompileOutcome::SkippedPublished;
    }
    if !lifecycle::eligibility(aggregate.group.status).compilable {
        return CompileOutcome::NotEligible;
    }

    ensure_result_rows(aggregate);
    for record in aggregate.results.iter_mut() {
        let total = weighted_total(record, &policy.weights);
        record.total_marks = Some(total);
        record.grade = grade_for(&policy.bands, total).map(str::to_string);
    }
    if !aggregate.result_state.is_compiled {
        aggregate.result_state.is_compiled = true;
        aggregate.result_state.compiled_at = Some(now);
    }
    CompileOutcome::Compiled {
        members: aggregate.results.len(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationSummary {
    pub compiled_groups: Vec<Uuid>,
    pub compiled_members: usize,
    pub skipped_published: Vec<Uuid>,
    pub not_eligible: usize,
}

impl CompilationSummary {
    pub fn record(&mut self, group_id: Uuid, outcome: CompileOutcome) {
        match outcome {
            CompileOutcome::Compiled { members } => {
                self.compiled_groups.push(group_id);
                self.compiled_members += members;
            }
            CompileOutcome::SkippedPublished => self.skipped_published.push(group_id),
            CompileOutcome::NotEligible => self.not_eligible += 1,
        }
    }
}

pub fn final_defense_accepted(aggregate: &GroupAggregate) -> bool {
    aggregate
        .defenses
        .iter()
        .any(|d| d.kind == DefenseKind::Final && d.outcome() == Some(DefenseOutcome::Accepted))
}

/// Freeze the group's results. One-way: there is no unpublish.
pub fn publish_group(
    aggregate: &mut GroupAggregate,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>> {
    ensure_unpublished(aggregate)?;
    if !aggregate.result_state.is_compiled {
        return Err(EngineError::NothingToPublish);
    }
    let final_accepted = final_defense_accepted(aggregate);
    let change = lifecycle::apply_event(
        aggregate,
        GroupEvent::ResultsPublished { final_accepted },
        now,
    )?;
    aggregate.result_state.is_published = true;
    aggregate.result_state.published_at = Some(now);
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupPolicy;
    use crate::models::{
        Defense, DefenseResult, EvaluationAssignment, GroupStatus,
    };

    fn aggregate(status: GroupStatus) -> GroupAggregate {
        let mut group = lifecycle::new_group(
            "Team Lyra",
            Uuid::new_v4(),
            &[Uuid::new_v4(), Uuid::new_v4()],
            None,
            &GroupPolicy::default(),
            Utc::now(),
        )
        .unwrap();
        group.status = status;
        GroupAggregate::new(group)
    }

    fn student(agg: &GroupAggregate, i: usize) -> Uuid {
        agg.group.members[i].student_id
    }

    fn accepted_final(agg: &mut GroupAggregate) {
        agg.defenses.push(Defense {
            id: Uuid::new_v4(),
            group_id: agg.id(),
            kind: DefenseKind::Final,
            scheduled_at: Utc::now(),
            venue: "Auditorium".to_string(),
            assignment: EvaluationAssignment::Unallocated,
            result: Some(DefenseResult {
                outcome: DefenseOutcome::Accepted,
                remarks: None,
                recorded_by: Uuid::new_v4(),
                recorded_at: Utc::now(),
            }),
            corrections: Vec::new(),
        });
    }

    #[test]
    fn equal_weights_give_plain_mean() {
        let mut agg = aggregate(GroupStatus::Active);
        let s = student(&agg, 0);
        record_mark(&mut agg, s, MarkComponent::Proposal, 80.0).unwrap();
        record_mark(&mut agg, s, MarkComponent::MidEval, 70.0).unwrap();
        record_mark(&mut agg, s, MarkComponent::FinalEval, 90.0).unwrap();
        record_mark(&mut agg, s, MarkComponent::Supervisor, 85.0).unwrap();

        let policy = ResultsPolicy::default();
        compile_group(&mut agg, &policy, Utc::now());
        let record = agg.results.iter().find(|r| r.student_id == s).unwrap();
        assert_eq!(record.total_marks, Some(81.25));
        assert_eq!(record.grade.as_deref(), Some("A-"));
    }

    #[test]
    fn missing_components_count_as_zero() {
        let mut record = ResultRecord::new(&aggregate(GroupStatus::Active).group.members[0]);
        record.proposal_marks = Some(80.0);
        assert_eq!(weighted_total(&record, &ComponentWeights::default()), 20.0);
    }

    #[test]
    fn band_edges_are_inclusive() {
        let bands = ResultsPolicy::default().bands;
        assert_eq!(grade_for(&bands, 85.0), Some("A"));
        assert_eq!(grade_for(&bands, 84.99), Some("A-"));
        assert_eq!(grade_for(&bands, 0.0), Some("F"));
        assert_eq!(grade_for(&bands, 100.0), Some("A"));
    }

    #[test]
    fn supervision_assessment_uses_sub_weights() {
        let assessment = SupervisionAssessment {
            regularity: 100.0,
            progress: 80.0,
            technical: 60.0,
            documentation: 50.0,
        };
        // 20 + 20 + 21 + 10
        assert_eq!(assessment.score(&SupervisionWeights::default()), 71.0);

        let mut agg = aggregate(GroupStatus::Active);
        let s = student(&agg, 1);
        let score =
            record_supervision(&mut agg, s, &assessment, &SupervisionWeights::default()).unwrap();
        assert_eq!(score, 71.0);
        let record = agg.results.iter().find(|r| r.student_id == s).unwrap();
        assert_eq!(record.supervisor_marks, Some(71.0));
    }

    #[test]
    fn marks_outside_scale_are_rejected() {
        let mut agg = aggregate(GroupStatus::Active);
        let s = student(&agg, 0);
        assert!(matches!(
            record_mark(&mut agg, s, MarkComponent::MidEval, 101.0),
            Err(EngineError::ValidationFailed(_))
        ));
        assert!(record_mark(&mut agg, s, MarkComponent::MidEval, f64::NAN).is_err());
        assert!(matches!(
            record_mark(&mut agg, Uuid::new_v4(), MarkComponent::MidEval, 50.0),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn forming_groups_take_no_marks() {
        let mut agg = aggregate(GroupStatus::Forming);
        let s = student(&agg, 0);
        assert!(matches!(
            record_mark(&mut agg, s, MarkComponent::Proposal, 80.0),
            Err(EngineError::InvalidTransition(_))
        ));
        assert!(agg.results.is_empty());
    }

    #[test]
    fn departed_members_are_not_compiled() {
        let mut agg = aggregate(GroupStatus::Active);
        let (stays, leaves) = (student(&agg, 0), student(&agg, 1));
        record_mark(&mut agg, stays, MarkComponent::Proposal, 80.0).unwrap();
        record_mark(&mut agg, leaves, MarkComponent::Proposal, 60.0).unwrap();
        agg.group.members.retain(|m| m.student_id != leaves);

        let outcome = compile_group(&mut agg, &ResultsPolicy::default(), Utc::now());
        assert_eq!(outcome, CompileOutcome::Compiled { members: 1 });
        assert_eq!(agg.results.len(), 1);
        assert_eq!(agg.results[0].student_id, stays);
    }

    #[test]
    fn compile_twice_is_identical() {
        let mut agg = aggregate(GroupStatus::Active);
        let s = student(&agg, 0);
        record_mark(&mut agg, s, MarkComponent::FinalEval, 66.6).unwrap();
        let policy = ResultsPolicy::default();

        compile_group(&mut agg, &policy, Utc::now());
        let first = agg.clone();
        compile_group(&mut agg, &policy, Utc::now());
        assert_eq!(agg, first);
    }

    #[test]
    fn edits_clear_compiled_flag() {
        let mut agg = aggregate(GroupStatus::Active);
        let s = student(&agg, 0);
        compile_group(&mut agg, &ResultsPolicy::default(), Utc::now());
        assert!(agg.result_state.is_compiled);
        record_mark(&mut agg, s, MarkComponent::Proposal, 50.0).unwrap();
        assert!(!agg.result_state.is_compiled);
        assert!(matches!(
            publish_group(&mut agg, Utc::now()),
            Err(EngineError::NothingToPublish)
        ));
    }

    #[test]
    fn ineligible_groups_are_not_compiled() {
        let mut agg = aggregate(GroupStatus::Deferred);
        assert_eq!(
            compile_group(&mut agg, &ResultsPolicy::default(), Utc::now()),
            CompileOutcome::NotEligible
        );
        assert!(agg.results.is_empty());
    }

    #[test]
    fn publish_freezes_final_results() {
        let mut agg = aggregate(GroupStatus::Active);
        let s = student(&agg, 0);
        set_final_result(&mut agg, s, FinalResult::Approved).unwrap();
        compile_group(&mut agg, &ResultsPolicy::default(), Utc::now());
        let change = publish_group(&mut agg, Utc::now()).unwrap();
        assert!(change.is_none());
        assert_eq!(agg.group.status, GroupStatus::Active);

        assert!(matches!(
            set_final_result(&mut agg, s, FinalResult::Failed),
            Err(EngineError::ResultsAlreadyPublished(_))
        ));
        assert!(matches!(
            record_mark(&mut agg, s, MarkComponent::Proposal, 10.0),
            Err(EngineError::ResultsAlreadyPublished(_))
        ));
        assert!(matches!(
            publish_group(&mut agg, Utc::now()),
            Err(EngineError::ResultsAlreadyPublished(_))
        ));
        assert_eq!(
            compile_group(&mut agg, &ResultsPolicy::default(), Utc::now()),
            CompileOutcome::SkippedPublished
        );
    }

    #[test]
    fn publish_after_final_acceptance_completes_group() {
        let mut agg = aggregate(GroupStatus::Active);
        accepted_final(&mut agg);
        compile_group(&mut agg, &ResultsPolicy::default(), Utc::now());
        let change = publish_group(&mut agg, Utc::now()).unwrap();
        assert_eq!(change.map(|c| c.to), Some(GroupStatus::Completed));
        assert!(agg.result_state.is_published);
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut summary = CompilationSummary::default();
        let id = Uuid::new_v4();
        summary.record(id, CompileOutcome::Compiled { members: 3 });
        summary.record(Uuid::new_v4(), CompileOutcome::NotEligible);
        summary.record(Uuid::new_v4(), CompileOutcome::SkippedPublished);
        assert_eq!(summary.compiled_groups, vec![id]);
        assert_eq!(summary.compiled_members, 3);
        assert_eq!(summary.not_eligible, 1);
        assert_eq!(summary.skipped_published.len(), 1);
    }
}
