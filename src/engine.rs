//! Request/response service over a [`Store`]
//!
//! Every mutating call authorizes the principal, runs one domain operation
//! inside a single per-group (or registry) unit of work, logs the outcome and
//! dispatches notifications once the change is committed.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::authz::{Action, Authorizer, Principal, Role, RolePolicy};
use crate::config::EngineConfig;
use crate::defense::{self, DisplayStatus, PanelAllocation, ResultRecorded};
use crate::error::{EngineError, Result};
use crate::lifecycle::{self, Eligibility, StatusChange};
use crate::meetings::{self, AttendanceSummary, NewMeeting, NewMonthlyReport};
use crate::models::{
    ArtifactRef, Committee, Defense, DefenseKind, DefenseOutcome, Document, DocumentType,
    DocumentTypeControl, EvaluationAssignment, FinalResult, FormType, GateKey, Group,
    GroupAggregate, MarkComponent, MeetingRecord, MonthlyReport, Proposal, Registry,
};
use crate::notify::{LogNotifier, Notification, Notifier};
use crate::report;
use crate::results::{self, CompilationSummary, CompileOutcome, SupervisionAssessment};
use crate::store::Store;
use crate::submissions::{self, GateState, ReviewDecision};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateView {
    pub gate: GateKey,
    pub state: GateState,
    pub control: DocumentTypeControl,
}

pub struct Engine<S: Store> {
    store: S,
    config: EngineConfig,
    authorizer: Arc<dyn Authorizer>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

fn log_change(group_id: Uuid, change: Option<StatusChange>) {
    if let Some(change) = change {
        tracing::info!(
            group_id = %group_id,
            from = %change.from,
            to = %change.to,
            "group status changed"
        );
    }
}

impl<S: Store> Engine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Engine {
            store,
            config,
            authorizer: Arc::new(RolePolicy),
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// One authorized unit of work against a group.
    async fn in_group<T, F>(
        &self,
        principal: &Principal,
        action: Action,
        group_id: Uuid,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut GroupAggregate, &Registry, DateTime<Utc>) -> Result<T> + Send,
        T: Send,
    {
        let now = self.now();
        let authorizer = self.authorizer.as_ref();
        let result = self
            .store
            .update_group(group_id, move |aggregate, registry| {
                authorizer.require(principal, action, Some(&aggregate.group))?;
                f(aggregate, registry, now)
            })
            .await;
        if let Err(err) = &result {
            tracing::debug!(group_id = %group_id, action = %action, error = %err, "operation rejected");
        }
        result
    }

    async fn in_registry<T, F>(&self, principal: &Principal, action: Action, f: F) -> Result<T>
    where
        F: FnOnce(&mut Registry, DateTime<Utc>) -> Result<T> + Send,
        T: Send,
    {
        let now = self.now();
        if let Err(err) = self.authorizer.require(principal, action, None) {
            tracing::debug!(action = %action, error = %err, "operation rejected");
            return Err(err);
        }
        let result = self.store.update_registry(move |registry| f(registry, now)).await;
        if let Err(err) = &result {
            tracing::debug!(action = %action, error = %err, "operation rejected");
        }
        result
    }

    fn notify_members(&self, group: &Group, subject: String, body: String) {
        self.notifier
            .notify(Notification::to_users(group.student_ids(), subject, body).about(group.id));
    }

    // Groups

    pub async fn create_group(
        &self,
        principal: &Principal,
        name: &str,
        department_id: Uuid,
        students: &[Uuid],
        lead: Option<Uuid>,
    ) -> Result<Group> {
        self.authorizer.require(principal, Action::CreateGroup, None)?;
        if principal.role == Role::Student && !students.contains(&principal.user_id) {
            return Err(EngineError::Forbidden(
                "students may only form groups they belong to".to_string(),
            ));
        }
        let group = lifecycle::new_group(
            name,
            department_id,
            students,
            lead,
            &self.config.groups,
            self.now(),
        )?;
        self.store
            .insert_group(GroupAggregate::new(group.clone()))
            .await?;
        tracing::info!(group_id = %group.id, members = group.members.len(), "group formed");
        Ok(group)
    }

    pub async fn add_member(&self, principal: &Principal, group_id: Uuid, student_id: Uuid) -> Result<()> {
        let policy = self.config.groups.clone();
        self.in_group(principal, Action::EditMembers, group_id, move |agg, _, now| {
            lifecycle::add_member(&mut agg.group, student_id, &policy)?;
            agg.group.updated_at = now;
            Ok(())
        })
        .await?;
        tracing::info!(group_id = %group_id, student_id = %student_id, "member added");
        Ok(())
    }

    pub async fn remove_member(
        &self,
        principal: &Principal,
        group_id: Uuid,
        student_id: Uuid,
    ) -> Result<()> {
        let policy = self.config.groups.clone();
        self.in_group(principal, Action::EditMembers, group_id, move |agg, _, now| {
            lifecycle::remove_member(&mut agg.group, student_id, &policy)?;
            results::drop_departed_results(agg);
            agg.group.updated_at = now;
            Ok(())
        })
        .await?;
        tracing::info!(group_id = %group_id, student_id = %student_id, "member removed");
        Ok(())
    }

    pub async fn set_lead(&self, principal: &Principal, group_id: Uuid, student_id: Uuid) -> Result<()> {
        self.in_group(principal, Action::EditMembers, group_id, move |agg, _, now| {
            lifecycle::set_lead(&mut agg.group, student_id)?;
            agg.group.updated_at = now;
            Ok(())
        })
        .await
    }

    pub async fn assign_supervisor(
        &self,
        principal: &Principal,
        group_id: Uuid,
        supervisor_id: Uuid,
    ) -> Result<()> {
        self.in_group(principal, Action::AssignSupervisor, group_id, move |agg, _, now| {
            lifecycle::assign_supervisor(&mut agg.group, supervisor_id, now)
        })
        .await?;
        tracing::info!(group_id = %group_id, supervisor_id = %supervisor_id, "supervisor assigned");
        Ok(())
    }

    pub async fn approve_group(
        &self,
        principal: &Principal,
        group_id: Uuid,
    ) -> Result<Option<StatusChange>> {
        let (change, group) = self
            .in_group(principal, Action::ApproveGroup, group_id, |agg, _, now| {
                let change = lifecycle::approve_without_defense(agg, now)?;
                Ok((change, agg.group.clone()))
            })
            .await?;
        log_change(group_id, change);
        self.notify_members(
            &group,
            "Group approved".to_string(),
            format!("{} is now active.", group.name),
        );
        Ok(change)
    }

    pub async fn eligibility(&self, principal: &Principal, group_id: Uuid) -> Result<Eligibility> {
        let aggregate = self.view_group(principal, group_id).await?;
        Ok(lifecycle::eligibility(aggregate.group.status))
    }

    pub async fn view_group(&self, principal: &Principal, group_id: Uuid) -> Result<GroupAggregate> {
        let aggregate = self.store.load_group(group_id).await?;
        self.authorizer
            .require(principal, Action::ViewStatus, Some(&aggregate.group))?;
        Ok(aggregate)
    }

    // Gates

    pub async fn unlock_gate(
        &self,
        principal: &Principal,
        gate: GateKey,
        deadline: DateTime<Utc>,
        message: &str,
    ) -> Result<DocumentTypeControl> {
        let control = self
            .in_registry(principal, Action::ManageGates, move |registry, now| {
                submissions::unlock(registry, gate, deadline, message, now)
            })
            .await?;
        tracing::info!(gate = %gate, deadline = %deadline, "gate unlocked");
        self.notifier.notify(Notification::to_role(
            Role::Student,
            format!("{gate} is open for submission"),
            format!("{} (deadline {deadline})", control.message),
        ));
        Ok(control)
    }

    pub async fn lock_gate(&self, principal: &Principal, gate: GateKey) -> Result<DocumentTypeControl> {
        let control = self
            .in_registry(principal, Action::ManageGates, move |registry, now| {
                Ok(submissions::lock(registry, gate, now))
            })
            .await?;
        tracing::info!(gate = %gate, "gate locked");
        Ok(control)
    }

    pub async fn list_gates(&self) -> Result<Vec<GateView>> {
        let registry = self.store.registry().await?;
        let now = self.now();
        Ok(registry
            .gates
            .values()
            .map(|control| GateView {
                gate: control.gate,
                state: submissions::gate_state(Some(control), now),
                control: control.clone(),
            })
            .collect())
    }

    // Proposals

    pub async fn create_proposal(
        &self,
        principal: &Principal,
        group_id: Uuid,
        form_type: FormType,
        content: serde_json::Value,
    ) -> Result<Proposal> {
        let author = principal.user_id;
        let proposal = self
            .in_group(principal, Action::DraftProposal, group_id, move |agg, registry, now| {
                submissions::create_proposal(agg, registry, form_type, content, author, now)
            })
            .await?;
        tracing::info!(group_id = %group_id, proposal_id = %proposal.id, form = %form_type, "proposal drafted");
        Ok(proposal)
    }

    pub async fn submit_proposal(
        &self,
        principal: &Principal,
        group_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<Option<StatusChange>> {
        let change = self
            .in_group(principal, Action::SubmitProposal, group_id, move |agg, registry, now| {
                submissions::submit_proposal(agg, registry, proposal_id, now)
            })
            .await?;
        tracing::info!(group_id = %group_id, proposal_id = %proposal_id, "proposal submitted");
        log_change(group_id, change);
        Ok(change)
    }

    pub async fn begin_review(
        &self,
        principal: &Principal,
        group_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<()> {
        let reviewer = principal.user_id;
        self.in_group(principal, Action::ReviewProposal, group_id, move |agg, _, now| {
            submissions::begin_review(agg, proposal_id, reviewer, now)
        })
        .await
    }

    pub async fn review_proposal(
        &self,
        principal: &Principal,
        group_id: Uuid,
        proposal_id: Uuid,
        decision: ReviewDecision,
        remarks: Option<String>,
    ) -> Result<Proposal> {
        let reviewer = principal.user_id;
        let (proposal, group) = self
            .in_group(principal, Action::ReviewProposal, group_id, move |agg, _, now| {
                let proposal =
                    submissions::review_proposal(agg, proposal_id, reviewer, decision, remarks, now)?;
                Ok((proposal, agg.group.clone()))
            })
            .await?;
        tracing::info!(
            group_id = %group_id,
            proposal_id = %proposal_id,
            status = %proposal.status,
            "proposal reviewed"
        );
        self.notify_members(
            &group,
            format!("{} {}", proposal.form_type, proposal.status),
            proposal.reviewer_remarks.clone().unwrap_or_default(),
        );
        Ok(proposal)
    }

    // Documents

    pub async fn submit_document(
        &self,
        principal: &Principal,
        group_id: Uuid,
        document_type: DocumentType,
        artifact: ArtifactRef,
    ) -> Result<Document> {
        let author = principal.user_id;
        let document = self
            .in_group(principal, Action::SubmitDocument, group_id, move |agg, registry, now| {
                submissions::submit_document(agg, registry, document_type, artifact, author, now)
            })
            .await?;
        tracing::info!(
            group_id = %group_id,
            document_id = %document.id,
            document_type = %document_type,
            "document submitted"
        );
        Ok(document)
    }

    pub async fn review_document(
        &self,
        principal: &Principal,
        group_id: Uuid,
        document_id: Uuid,
        approve: bool,
        remarks: Option<String>,
    ) -> Result<Document> {
        let reviewer = principal.user_id;
        let privileged = principal.role == Role::Admin;
        let (document, group) = self
            .in_group(principal, Action::SupervisorReview, group_id, move |agg, _, now| {
                if !privileged {
                    submissions::ensure_group_supervisor(agg, reviewer)?;
                }
                let document =
                    submissions::supervisor_review(agg, document_id, reviewer, approve, remarks, now)?;
                Ok((document, agg.group.clone()))
            })
            .await?;
        tracing::info!(group_id = %group_id, document_id = %document_id, status = %document.status, "document reviewed");
        self.notify_members(
            &group,
            format!("{} {}", document.document_type, document.status),
            document
                .supervisor_review
                .as_ref()
                .and_then(|r| r.remarks.clone())
                .unwrap_or_default(),
        );
        Ok(document)
    }

    pub async fn finalize_document(
        &self,
        principal: &Principal,
        group_id: Uuid,
        document_id: Uuid,
    ) -> Result<Document> {
        let coordinator = principal.user_id;
        let (document, group) = self
            .in_group(principal, Action::FinalizeDocument, group_id, move |agg, _, now| {
                let document = submissions::finalize_document(agg, document_id, coordinator, now)?;
                Ok((document, agg.group.clone()))
            })
            .await?;
        tracing::info!(group_id = %group_id, document_id = %document_id, "document finalized");
        self.notify_members(
            &group,
            format!("{} finalized", document.document_type),
            String::new(),
        );
        Ok(document)
    }

    // Meetings

    pub async fn record_meeting(
        &self,
        principal: &Principal,
        group_id: Uuid,
        meeting: NewMeeting,
    ) -> Result<MeetingRecord> {
        let recorder = principal.user_id;
        let record = self
            .in_group(principal, Action::RecordMeeting, group_id, move |agg, _, _| {
                meetings::record_meeting(agg, meeting, recorder)
            })
            .await?;
        tracing::info!(
            group_id = %group_id,
            month = record.month,
            week = record.week,
            "meeting recorded"
        );
        Ok(record)
    }

    pub async fn file_monthly_report(
        &self,
        principal: &Principal,
        group_id: Uuid,
        report: NewMonthlyReport,
    ) -> Result<MonthlyReport> {
        let author = principal.user_id;
        let filed = self
            .in_group(principal, Action::FileMonthlyReport, group_id, move |agg, _, now| {
                meetings::file_monthly_report(agg, report, author, now)
            })
            .await?;
        tracing::info!(group_id = %group_id, month = filed.month, "monthly report filed");
        Ok(filed)
    }

    pub async fn attendance(
        &self,
        principal: &Principal,
        group_id: Uuid,
    ) -> Result<Vec<AttendanceSummary>> {
        let aggregate = self.view_group(principal, group_id).await?;
        Ok(meetings::attendance_summary(&aggregate))
    }

    // Committees and defenses

    pub async fn create_committee(
        &self,
        principal: &Principal,
        name: &str,
        department_id: Uuid,
        members: BTreeSet<Uuid>,
    ) -> Result<Committee> {
        let committee = self
            .in_registry(principal, Action::ManageCommittees, move |registry, _| {
                defense::create_committee(registry, name, department_id, members)
            })
            .await?;
        tracing::info!(committee_id = %committee.id, name = %committee.name, "committee created");
        Ok(committee)
    }

    pub async fn approve_committee(&self, principal: &Principal, committee_id: Uuid) -> Result<Committee> {
        let committee = self
            .in_registry(principal, Action::ManageCommittees, move |registry, _| {
                defense::approve_committee(registry, committee_id)
            })
            .await?;
        tracing::info!(committee_id = %committee_id, "committee approved");
        self.notifier.notify(
            Notification::to_users(
                committee.members.iter().copied().collect(),
                format!("{} is active", committee.name),
                "You may now record proposal defense results.".to_string(),
            )
            .about(committee.id),
        );
        Ok(committee)
    }

    pub async fn schedule_defense(
        &self,
        principal: &Principal,
        group_id: Uuid,
        kind: DefenseKind,
        scheduled_at: DateTime<Utc>,
        venue: &str,
    ) -> Result<Defense> {
        let (defense, group) = self
            .in_group(principal, Action::ScheduleDefense, group_id, move |agg, registry, now| {
                let defense = defense::schedule_defense(agg, registry, kind, scheduled_at, venue, now)?;
                Ok((defense, agg.group.clone()))
            })
            .await?;
        tracing::info!(
            group_id = %group_id,
            defense_id = %defense.id,
            kind = %kind,
            scheduled_at = %scheduled_at,
            "defense scheduled"
        );
        self.notify_members(
            &group,
            format!("{kind} defense scheduled"),
            format!("{} at {}", scheduled_at, defense.venue),
        );
        Ok(defense)
    }

    pub async fn allocate_panel(
        &self,
        principal: &Principal,
        group_id: Uuid,
        defense_id: Uuid,
        internal: Vec<Uuid>,
        external: Option<Uuid>,
    ) -> Result<PanelAllocation> {
        let allocated_by = principal.user_id;
        let recommended = self.config.panels.recommended_internal;
        let allocation = self
            .in_group(principal, Action::AllocatePanel, group_id, move |agg, _, now| {
                defense::allocate_panel(agg, defense_id, internal, external, allocated_by, recommended, now)
            })
            .await?;
        if allocation.undersized {
            tracing::warn!(
                group_id = %group_id,
                defense_id = %defense_id,
                recommended,
                "panel has fewer internal evaluators than recommended"
            );
        }
        tracing::info!(group_id = %group_id, defense_id = %defense_id, "panel allocated");
        if let EvaluationAssignment::Panel(panel) = &allocation.defense.assignment {
            let mut evaluators = panel.internal.clone();
            evaluators.extend(panel.external);
            self.notifier.notify(
                Notification::to_users(
                    evaluators,
                    format!("{} defense panel", allocation.defense.kind),
                    format!(
                        "{} at {}",
                        allocation.defense.scheduled_at, allocation.defense.venue
                    ),
                )
                .about(defense_id),
            );
        }
        Ok(allocation)
    }

    pub async fn record_defense_result(
        &self,
        principal: &Principal,
        group_id: Uuid,
        defense_id: Uuid,
        outcome: DefenseOutcome,
        remarks: Option<String>,
    ) -> Result<ResultRecorded> {
        let recorder = principal.user_id;
        let privileged = principal.role.is_privileged();
        let (recorded, group) = self
            .in_group(
                principal,
                Action::RecordDefenseResult,
                group_id,
                move |agg, registry, now| {
                    let recorded = defense::record_result(
                        agg, registry, defense_id, outcome, remarks, recorder, privileged, now,
                    )?;
                    Ok((recorded, agg.group.clone()))
                },
            )
            .await?;
        tracing::info!(
            group_id = %group_id,
            defense_id = %defense_id,
            outcome = %outcome,
            "defense result recorded"
        );
        log_change(group_id, recorded.status_change);
        self.notify_members(
            &group,
            format!("{} defense {}", recorded.defense.kind, outcome),
            recorded
                .defense
                .result
                .as_ref()
                .and_then(|r| r.remarks.clone())
                .unwrap_or_default(),
        );
        Ok(recorded)
    }

    pub async fn correct_defense_result(
        &self,
        principal: &Principal,
        group_id: Uuid,
        defense_id: Uuid,
        corrected: DefenseOutcome,
        reason: &str,
    ) -> Result<ResultRecorded> {
        let corrected_by = principal.user_id;
        let (recorded, group) = self
            .in_group(
                principal,
                Action::CorrectDefenseResult,
                group_id,
                move |agg, _, now| {
                    let recorded =
                        defense::correct_result(agg, defense_id, corrected, reason, corrected_by, now)?;
                    Ok((recorded, agg.group.clone()))
                },
            )
            .await?;
        tracing::info!(
            group_id = %group_id,
            defense_id = %defense_id,
            corrected = %corrected,
            "defense result corrected"
        );
        log_change(group_id, recorded.status_change);
        self.notify_members(
            &group,
            format!("{} defense result corrected", recorded.defense.kind),
            format!("Outcome is now {corrected}: {reason}"),
        );
        Ok(recorded)
    }

    pub async fn defense_statuses(
        &self,
        principal: &Principal,
        group_id: Uuid,
    ) -> Result<Vec<(Defense, DisplayStatus)>> {
        let aggregate = self.view_group(principal, group_id).await?;
        let now = self.now();
        Ok(aggregate
            .defenses
            .into_iter()
            .map(|d| {
                let status = defense::display_status(&d, now);
                (d, status)
            })
            .collect())
    }

    // Results

    pub async fn record_mark(
        &self,
        principal: &Principal,
        group_id: Uuid,
        student_id: Uuid,
        component: MarkComponent,
        value: f64,
    ) -> Result<()> {
        self.in_group(principal, Action::RecordMarks, group_id, move |agg, _, _| {
            results::record_mark(agg, student_id, component, value)
        })
        .await?;
        tracing::info!(group_id = %group_id, student_id = %student_id, component = %component, value, "mark recorded");
        Ok(())
    }

    pub async fn record_supervision(
        &self,
        principal: &Principal,
        group_id: Uuid,
        student_id: Uuid,
        assessment: SupervisionAssessment,
    ) -> Result<f64> {
        let weights = self.config.results.supervision.clone();
        let score = self
            .in_group(principal, Action::AssessSupervision, group_id, move |agg, _, _| {
                results::record_supervision(agg, student_id, &assessment, &weights)
            })
            .await?;
        tracing::info!(group_id = %group_id, student_id = %student_id, score, "supervision assessed");
        Ok(score)
    }

    pub async fn set_final_result(
        &self,
        principal: &Principal,
        group_id: Uuid,
        student_id: Uuid,
        result: FinalResult,
    ) -> Result<()> {
        self.in_group(principal, Action::SetFinalResult, group_id, move |agg, _, _| {
            results::set_final_result(agg, student_id, result)
        })
        .await?;
        tracing::info!(group_id = %group_id, student_id = %student_id, result = %result, "final result set");
        Ok(())
    }

    /// Compile every group the principal may compile. Groups outside the
    /// principal's scope are counted as not eligible.
    pub async fn compile(&self, principal: &Principal) -> Result<CompilationSummary> {
        self.authorizer
            .require(principal, Action::CompileResults, None)?;
        let authorizer = self.authorizer.as_ref();
        let policy = &self.config.results;
        let mut summary = CompilationSummary::default();

        for group_id in self.store.group_ids().await? {
            let now = self.now();
            let outcome = self
                .store
                .update_group(group_id, move |agg, _| {
                    if !authorizer.authorize(principal, Action::CompileResults, Some(&agg.group)) {
                        return Ok(CompileOutcome::NotEligible);
                    }
                    Ok(results::compile_group(agg, policy, now))
                })
                .await?;
            summary.record(group_id, outcome);
        }

        tracing::info!(
            groups = summary.compiled_groups.len(),
            members = summary.compiled_members,
            skipped_published = summary.skipped_published.len(),
            "results compiled"
        );
        Ok(summary)
    }

    fn announce_publication(&self, group: &Group, change: Option<StatusChange>) {
        tracing::info!(group_id = %group.id, "results published");
        log_change(group.id, change);
        self.notify_members(
            group,
            "Results published".to_string(),
            format!("Final results for {} are available.", group.name),
        );
    }

    pub async fn publish(&self, principal: &Principal, group_id: Uuid) -> Result<Option<StatusChange>> {
        let (change, group) = self
            .in_group(principal, Action::PublishResults, group_id, |agg, _, now| {
                let change = results::publish_group(agg, now)?;
                Ok((change, agg.group.clone()))
            })
            .await?;
        self.announce_publication(&group, change);
        Ok(change)
    }

    /// Publish every compiled, unpublished group in scope. Each group is
    /// checked and published inside its own unit of work.
    pub async fn publish_all(&self, principal: &Principal) -> Result<Vec<Uuid>> {
        self.authorizer
            .require(principal, Action::PublishResults, None)?;
        let authorizer = self.authorizer.as_ref();
        let mut published = Vec::new();

        for group_id in self.store.group_ids().await? {
            let now = self.now();
            let outcome = self
                .store
                .update_group(group_id, move |agg, _| {
                    let state = &agg.result_state;
                    if !state.is_compiled
                        || state.is_published
                        || !authorizer.authorize(principal, Action::PublishResults, Some(&agg.group))
                    {
                        return Ok(None);
                    }
                    let change = results::publish_group(agg, now)?;
                    Ok(Some((change, agg.group.clone())))
                })
                .await?;
            if let Some((change, group)) = outcome {
                self.announce_publication(&group, change);
                published.push(group_id);
            }
        }
        if published.is_empty() {
            return Err(EngineError::NothingToPublish);
        }
        Ok(published)
    }

    // Reporting

    pub async fn status_report(&self, principal: &Principal, group_id: Uuid) -> Result<String> {
        let aggregate = self.view_group(principal, group_id).await?;
        let registry = self.store.registry().await?;
        Ok(report::build_report(&aggregate, &registry, self.now()))
    }
}
