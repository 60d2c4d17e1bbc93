//! Proposal and document pipelines, and the shared per-type gate
//!
//! Proposals: draft → submitted → under_review → approved | rejected | revision.
//! Documents: student_submitted → supervisor_reviewed → coordinator_finalized,
//! or student_submitted → supervisor_rejected (a new submission may follow).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::lifecycle::{self, GroupEvent, StatusChange};
use crate::meetings;
use crate::models::{
    ArtifactRef, Document, DocumentStatus, DocumentType, DocumentTypeControl, FormType, GateKey,
    GroupAggregate, Proposal, ProposalStatus, Registry, ReviewNote,
};

pub const PROPOSAL_EDGES: &[(ProposalStatus, ProposalStatus)] = &[
    (ProposalStatus::Draft, ProposalStatus::Submitted),
    (ProposalStatus::Submitted, ProposalStatus::UnderReview),
    (ProposalStatus::UnderReview, ProposalStatus::Approved),
    (ProposalStatus::UnderReview, ProposalStatus::Rejected),
    (ProposalStatus::UnderReview, ProposalStatus::Revision),
];

pub const DOCUMENT_EDGES: &[(DocumentStatus, DocumentStatus)] = &[
    (DocumentStatus::StudentSubmitted, DocumentStatus::SupervisorReviewed),
    (DocumentStatus::StudentSubmitted, DocumentStatus::SupervisorRejected),
    (DocumentStatus::SupervisorReviewed, DocumentStatus::CoordinatorFinalized),
];

/// Derived state of a gate at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    Locked,
    Expired,
}

pub fn gate_state(control: Option<&DocumentTypeControl>, now: DateTime<Utc>) -> GateState {
    match control {
        None => GateState::Locked,
        Some(c) if !c.is_unlocked => GateState::Locked,
        Some(c) => match c.deadline {
            Some(deadline) if now > deadline => GateState::Expired,
            _ => GateState::Open,
        },
    }
}

/// Fails with `StageLocked` unless the gate for `key` is open at `now`.
pub fn ensure_gate_open(registry: &Registry, key: GateKey, now: DateTime<Utc>) -> Result<()> {
    match gate_state(registry.gate(key), now) {
        GateState::Open => Ok(()),
        GateState::Locked => Err(EngineError::StageLocked(format!("{key} is locked"))),
        GateState::Expired => Err(EngineError::StageLocked(format!(
            "{key} deadline has passed"
        ))),
    }
}

pub fn unlock(
    registry: &mut Registry,
    key: GateKey,
    deadline: DateTime<Utc>,
    message: &str,
    now: DateTime<Utc>,
) -> Result<DocumentTypeControl> {
    if deadline <= now {
        return Err(EngineError::ValidationFailed(format!(
            "deadline for {key} must be in the future"
        )));
    }
    let control = DocumentTypeControl {
        gate: key,
        is_unlocked: true,
        deadline: Some(deadline),
        message: message.to_string(),
        updated_at: now,
    };
    registry.gates.insert(key, control.clone());
    Ok(control)
}

/// Close the gate for new submissions; anything already in flight is untouched.
pub fn lock(registry: &mut Registry, key: GateKey, now: DateTime<Utc>) -> DocumentTypeControl {
    let control = registry
        .gates
        .entry(key)
        .or_insert_with(|| DocumentTypeControl {
            gate: key,
            is_unlocked: false,
            deadline: None,
            message: String::new(),
            updated_at: now,
        });
    control.is_unlocked = false;
    control.updated_at = now;
    control.clone()
}

fn proposal_mut(aggregate: &mut GroupAggregate, proposal_id: Uuid) -> Result<&mut Proposal> {
    aggregate
        .proposals
        .iter_mut()
        .find(|p| p.id == proposal_id)
        .ok_or_else(|| EngineError::NotFound(format!("proposal {proposal_id}")))
}

fn move_proposal(proposal: &mut Proposal, to: ProposalStatus) -> Result<()> {
    if !PROPOSAL_EDGES.contains(&(proposal.status, to)) {
        return Err(EngineError::InvalidTransition(format!(
            "proposal {} cannot move from {} to {}",
            proposal.id, proposal.status, to
        )));
    }
    proposal.status = to;
    Ok(())
}

/// A form type is open for a new draft only when no draft, pending or
/// approved instance exists for it.
pub fn has_active_proposal(aggregate: &GroupAggregate, form_type: FormType) -> bool {
    aggregate.proposals.iter().any(|p| {
        p.form_type == form_type
            && !matches!(p.status, ProposalStatus::Rejected | ProposalStatus::Revision)
    })
}

pub fn create_proposal(
    aggregate: &mut GroupAggregate,
    registry: &Registry,
    form_type: FormType,
    content: serde_json::Value,
    created_by: Uuid,
    now: DateTime<Utc>,
) -> Result<Proposal> {
    ensure_gate_open(registry, GateKey::Proposal(form_type), now)?;
    if !lifecycle::eligibility(aggregate.group.status).accepts_proposals {
        return Err(EngineError::InvalidTransition(format!(
            "a {} group does not accept proposals",
            aggregate.group.status
        )));
    }
    if !content.is_object() {
        return Err(EngineError::ValidationFailed(
            "proposal content must be a JSON object".to_string(),
        ));
    }
    if has_active_proposal(aggregate, form_type) {
        return Err(EngineError::InvalidTransition(format!(
            "group already holds an active {form_type} proposal"
        )));
    }

    let proposal = Proposal {
        id: Uuid::new_v4(),
        group_id: aggregate.id(),
        form_type,
        status: ProposalStatus::Draft,
        content,
        created_by,
        created_at: now,
        submitted_at: None,
        reviewer_id: None,
        reviewer_remarks: None,
        reviewed_at: None,
    };
    aggregate.proposals.push(proposal.clone());
    Ok(proposal)
}

/// Draft → submitted. The first submission moves a forming group to pending approval.
pub fn submit_proposal(
    aggregate: &mut GroupAggregate,
    registry: &Registry,
    proposal_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>> {
    let form_type = proposal_mut(aggregate, proposal_id)?.form_type;
    ensure_gate_open(registry, GateKey::Proposal(form_type), now)?;
    if !lifecycle::eligibility(aggregate.group.status).accepts_proposals {
        return Err(EngineError::InvalidTransition(format!(
            "a {} group does not accept proposals",
            aggregate.group.status
        )));
    }

    let proposal = proposal_mut(aggregate, proposal_id)?;
    move_proposal(proposal, ProposalStatus::Submitted)?;
    proposal.submitted_at = Some(now);
    let title = proposal
        .content
        .get("project_title")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    if form_type == FormType::FormA {
        if let Some(title) = title {
            aggregate.group.project_title = Some(title);
        }
    }
    lifecycle::apply_event(aggregate, GroupEvent::ProposalSubmitted, now)
}

pub fn begin_review(
    aggregate: &mut GroupAggregate,
    proposal_id: Uuid,
    reviewer_id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    let proposal = proposal_mut(aggregate, proposal_id)?;
    move_proposal(proposal, ProposalStatus::UnderReview)?;
    proposal.reviewer_id = Some(reviewer_id);
    proposal.reviewed_at = Some(now);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
    RequestRevision,
}

impl ReviewDecision {
    fn status(self) -> ProposalStatus {
        match self {
            ReviewDecision::Approve => ProposalStatus::Approved,
            ReviewDecision::Reject => ProposalStatus::Rejected,
            ReviewDecision::RequestRevision => ProposalStatus::Revision,
        }
    }
}

pub fn review_proposal(
    aggregate: &mut GroupAggregate,
    proposal_id: Uuid,
    reviewer_id: Uuid,
    decision: ReviewDecision,
    remarks: Option<String>,
    now: DateTime<Utc>,
) -> Result<Proposal> {
    let proposal = proposal_mut(aggregate, proposal_id)?;
    if decision != ReviewDecision::Approve && remarks.as_deref().map_or(true, |r| r.trim().is_empty())
    {
        return Err(EngineError::ValidationFailed(
            "remarks are required when a proposal is not approved".to_string(),
        ));
    }
    move_proposal(proposal, decision.status())?;
    proposal.reviewer_id = Some(reviewer_id);
    proposal.reviewer_remarks = remarks;
    proposal.reviewed_at = Some(now);
    Ok(proposal.clone())
}

fn document_mut(aggregate: &mut GroupAggregate, document_id: Uuid) -> Result<&mut Document> {
    aggregate
        .documents
        .iter_mut()
        .find(|d| d.id == document_id)
        .ok_or_else(|| EngineError::NotFound(format!("document {document_id}")))
}

fn move_document(document: &mut Document, to: DocumentStatus) -> Result<()> {
    if !DOCUMENT_EDGES.contains(&(document.status, to)) {
        return Err(EngineError::InvalidTransition(format!(
            "document {} cannot move from {} to {}",
            document.id, document.status, to
        )));
    }
    document.status = to;
    Ok(())
}

pub fn submit_document(
    aggregate: &mut GroupAggregate,
    registry: &Registry,
    document_type: DocumentType,
    artifact: ArtifactRef,
    submitted_by: Uuid,
    now: DateTime<Utc>,
) -> Result<Document> {
    ensure_gate_open(registry, GateKey::Document(document_type), now)?;
    if !lifecycle::eligibility(aggregate.group.status).accepts_documents {
        return Err(EngineError::InvalidTransition(format!(
            "a {} group does not accept documents",
            aggregate.group.status
        )));
    }
    if let Some(month) = document_type.meeting_month() {
        meetings::ensure_month_ready(aggregate, month)?;
    }
    if aggregate
        .documents
        .iter()
        .any(|d| d.document_type == document_type && d.status != DocumentStatus::SupervisorRejected)
    {
        return Err(EngineError::InvalidTransition(format!(
            "{document_type} is already submitted or finalized"
        )));
    }

    let document = Document {
        id: Uuid::new_v4(),
        group_id: aggregate.id(),
        document_type,
        status: DocumentStatus::StudentSubmitted,
        submitted_by,
        artifact,
        submitted_at: now,
        supervisor_review: None,
        finalized_by: None,
        finalized_at: None,
    };
    aggregate.documents.push(document.clone());
    Ok(document)
}

/// Fails with `Forbidden` when `reviewer_id` does not supervise the group.
pub fn ensure_group_supervisor(aggregate: &GroupAggregate, reviewer_id: Uuid) -> Result<()> {
    if aggregate.group.supervisor_id != Some(reviewer_id) {
        return Err(EngineError::Forbidden(format!(
            "{reviewer_id} does not supervise group {}",
            aggregate.id()
        )));
    }
    Ok(())
}

pub fn supervisor_review(
    aggregate: &mut GroupAggregate,
    document_id: Uuid,
    reviewer_id: Uuid,
    approve: bool,
    remarks: Option<String>,
    now: DateTime<Utc>,
) -> Result<Document> {
    let document = document_mut(aggregate, document_id)?;
    let to = if approve {
        DocumentStatus::SupervisorReviewed
    } else {
        DocumentStatus::SupervisorRejected
    };
    move_document(document, to)?;
    document.supervisor_review = Some(ReviewNote {
        reviewer_id,
        remarks,
        reviewed_at: now,
    });
    Ok(document.clone())
}

pub fn finalize_document(
    aggregate: &mut GroupAggregate,
    document_id: Uuid,
    coordinator_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Document> {
    let document = document_mut(aggregate, document_id)?;
    move_document(document, DocumentStatus::CoordinatorFinalized)?;
    document.finalized_by = Some(coordinator_id);
    document.finalized_at = Some(now);
    Ok(document.clone())
}
