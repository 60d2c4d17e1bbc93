use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Closed enums are stored as text; this keeps the column value, the
/// `Display` output and the parser in one table.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(EngineError::ValidationFailed(format!(
                        "unknown {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Forming,
    PendingApproval,
    Active,
    Completed,
    Deferred,
    Rejected,
}

text_enum!(GroupStatus {
    Forming => "forming",
    PendingApproval => "pending_approval",
    Active => "active",
    Completed => "completed",
    Deferred => "deferred",
    Rejected => "rejected",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormType {
    FormA,
    FormB,
    FormD,
}

text_enum!(FormType {
    FormA => "form_a",
    FormB => "form_b",
    FormD => "form_d",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    Submitted,
    UnderReview,
    Approved,
    Rejected,
    Revision,
}

text_enum!(ProposalStatus {
    Draft => "draft",
    Submitted => "submitted",
    UnderReview => "under_review",
    Approved => "approved",
    Rejected => "rejected",
    Revision => "revision",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    StudentSubmitted,
    SupervisorReviewed,
    SupervisorRejected,
    CoordinatorFinalized,
}

text_enum!(DocumentStatus {
    StudentSubmitted => "student_submitted",
    SupervisorReviewed => "supervisor_reviewed",
    SupervisorRejected => "supervisor_rejected",
    CoordinatorFinalized => "coordinator_finalized",
});

/// Highest month number accepted for numbered document families and meetings.
pub const MAX_MONTH: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Srs,
    Sdd,
    MonthlyReport(u8),
    LogForm(u8),
    FinalReport,
    SourceCode,
}

impl DocumentType {
    pub fn key(&self) -> String {
        match self {
            DocumentType::Srs => "srs".to_string(),
            DocumentType::Sdd => "sdd".to_string(),
            DocumentType::MonthlyReport(n) => format!("monthly_report_{n}"),
            DocumentType::LogForm(n) => format!("log_form_{n}"),
            DocumentType::FinalReport => "final_report".to_string(),
            DocumentType::SourceCode => "source_code".to_string(),
        }
    }

    /// Month whose meeting ledger gates this document, if any.
    pub fn meeting_month(&self) -> Option<u8> {
        match self {
            DocumentType::MonthlyReport(n) | DocumentType::LogForm(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for DocumentType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let numbered = |rest: &str| -> Result<u8, EngineError> {
            let n: u8 = rest
                .parse()
                .map_err(|_| EngineError::ValidationFailed(format!("bad document number in {s}")))?;
            if n == 0 || n > MAX_MONTH {
                return Err(EngineError::ValidationFailed(format!(
                    "document number out of range in {s}"
                )));
            }
            Ok(n)
        };

        match s {
            "srs" => Ok(DocumentType::Srs),
            "sdd" => Ok(DocumentType::Sdd),
            "final_report" => Ok(DocumentType::FinalReport),
            "source_code" => Ok(DocumentType::SourceCode),
            _ => {
                if let Some(rest) = s.strip_prefix("monthly_report_") {
                    Ok(DocumentType::MonthlyReport(numbered(rest)?))
                } else if let Some(rest) = s.strip_prefix("log_form_") {
                    Ok(DocumentType::LogForm(numbered(rest)?))
                } else {
                    Err(EngineError::ValidationFailed(format!("unknown DocumentType: {s}")))
                }
            }
        }
    }
}

/// Key of a submission gate: one per form type and one per document type,
/// shared by every group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GateKey {
    Proposal(FormType),
    Document(DocumentType),
}

impl GateKey {
    pub fn key(&self) -> String {
        match self {
            GateKey::Proposal(form) => form.as_str().to_string(),
            GateKey::Document(doc) => doc.key(),
        }
    }
}

impl fmt::Display for GateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for GateKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(form) = s.parse::<FormType>() {
            return Ok(GateKey::Proposal(form));
        }
        s.parse::<DocumentType>()
            .map(GateKey::Document)
            .map_err(|_| EngineError::ValidationFailed(format!("unknown gate key: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefenseKind {
    Proposal,
    Initial,
    MidTerm,
    Final,
}

text_enum!(DefenseKind {
    Proposal => "proposal",
    Initial => "initial",
    MidTerm => "mid_term",
    Final => "final",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefenseOutcome {
    Accepted,
    Deferred,
    Rejected,
}

text_enum!(DefenseOutcome {
    Accepted => "accepted",
    Deferred => "deferred",
    Rejected => "rejected",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitteeStatus {
    PendingApproval,
    Active,
}

text_enum!(CommitteeStatus {
    PendingApproval => "pending_approval",
    Active => "active",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalResult {
    Approved,
    Deferred,
    Failed,
}

text_enum!(FinalResult {
    Approved => "approved",
    Deferred => "deferred",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkComponent {
    Proposal,
    MidEval,
    FinalEval,
    Supervisor,
}

text_enum!(MarkComponent {
    Proposal => "proposal",
    MidEval => "mid_eval",
    FinalEval => "final_eval",
    Supervisor => "supervisor",
});

/// Opaque reference into the external blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(reference: impl Into<String>) -> Result<Self, EngineError> {
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(EngineError::ValidationFailed(
                "artifact reference must not be empty".to_string(),
            ));
        }
        Ok(ArtifactRef(reference))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub student_id: Uuid,
    pub group_id: Uuid,
    pub is_lead: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub project_title: Option<String>,
    pub status: GroupStatus,
    pub department_id: Uuid,
    pub supervisor_id: Option<Uuid>,
    pub members: Vec<Member>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn member_by_student(&self, student_id: Uuid) -> Option<&Member> {
        self.members.iter().find(|m| m.student_id == student_id)
    }

    pub fn lead(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.is_lead)
    }

    pub fn student_ids(&self) -> Vec<Uuid> {
        self.members.iter().map(|m| m.student_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub group_id: Uuid,
    pub form_type: FormType,
    pub status: ProposalStatus,
    /// Structured form fields as entered by the students
    pub content: serde_json::Value,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub reviewer_id: Option<Uuid>,
    pub reviewer_remarks: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewNote {
    pub reviewer_id: Uuid,
    pub remarks: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub group_id: Uuid,
    pub document_type: DocumentType,
    pub status: DocumentStatus,
    pub submitted_by: Uuid,
    pub artifact: ArtifactRef,
    pub submitted_at: DateTime<Utc>,
    pub supervisor_review: Option<ReviewNote>,
    pub finalized_by: Option<Uuid>,
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTypeControl {
    pub gate: GateKey,
    pub is_unlocked: bool,
    pub deadline: Option<DateTime<Utc>>,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub id: Uuid,
    pub group_id: Uuid,
    pub month: u8,
    pub week: u8,
    pub meeting_date: NaiveDate,
    pub attendees: BTreeSet<Uuid>,
    pub notes: String,
    pub recorded_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyReport {
    pub id: Uuid,
    pub group_id: Uuid,
    pub month: u8,
    pub summary: String,
    pub challenges: String,
    pub plan: String,
    pub progress_percent: u8,
    pub artifact: ArtifactRef,
    pub submitted_by: Uuid,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    pub internal: Vec<Uuid>,
    pub external: Option<Uuid>,
    pub allocated_by: Uuid,
    pub allocated_at: DateTime<Utc>,
}

impl Panel {
    pub fn includes(&self, evaluator: Uuid) -> bool {
        self.internal.contains(&evaluator) || self.external == Some(evaluator)
    }
}

/// Who evaluates a defense. Proposal defenses are bound to the shared
/// committee; every other kind carries its own panel once allocated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluationAssignment {
    Committee { committee_id: Uuid },
    Unallocated,
    Panel(Panel),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseResult {
    pub outcome: DefenseOutcome,
    pub remarks: Option<String>,
    pub recorded_by: Uuid,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultCorrection {
    pub previous: DefenseOutcome,
    pub corrected: DefenseOutcome,
    pub reason: String,
    pub corrected_by: Uuid,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defense {
    pub id: Uuid,
    pub group_id: Uuid,
    pub kind: DefenseKind,
    pub scheduled_at: DateTime<Utc>,
    pub venue: String,
    pub assignment: EvaluationAssignment,
    pub result: Option<DefenseResult>,
    pub corrections: Vec<ResultCorrection>,
}

impl Defense {
    pub fn outcome(&self) -> Option<DefenseOutcome> {
        self.result.as_ref().map(|r| r.outcome)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Committee {
    pub id: Uuid,
    pub name: String,
    pub department_id: Uuid,
    pub members: BTreeSet<Uuid>,
    pub status: CommitteeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub member_id: Uuid,
    pub student_id: Uuid,
    pub proposal_marks: Option<f64>,
    pub mid_eval_marks: Option<f64>,
    pub final_eval_marks: Option<f64>,
    pub supervisor_marks: Option<f64>,
    pub total_marks: Option<f64>,
    pub grade: Option<String>,
    pub final_result: Option<FinalResult>,
}

impl ResultRecord {
    pub fn new(member: &Member) -> Self {
        ResultRecord {
            member_id: member.id,
            student_id: member.student_id,
            proposal_marks: None,
            mid_eval_marks: None,
            final_eval_marks: None,
            supervisor_marks: None,
            total_marks: None,
            grade: None,
            final_result: None,
        }
    }

    pub fn component(&self, component: MarkComponent) -> Option<f64> {
        match component {
            MarkComponent::Proposal => self.proposal_marks,
            MarkComponent::MidEval => self.mid_eval_marks,
            MarkComponent::FinalEval => self.final_eval_marks,
            MarkComponent::Supervisor => self.supervisor_marks,
        }
    }

    pub fn component_mut(&mut self, component: MarkComponent) -> &mut Option<f64> {
        match component {
            MarkComponent::Proposal => &mut self.proposal_marks,
            MarkComponent::MidEval => &mut self.mid_eval_marks,
            MarkComponent::FinalEval => &mut self.final_eval_marks,
            MarkComponent::Supervisor => &mut self.supervisor_marks,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupResultState {
    pub is_compiled: bool,
    pub is_published: bool,
    pub compiled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

/// A group and everything it owns; the unit of locking and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAggregate {
    pub group: Group,
    pub proposals: Vec<Proposal>,
    pub documents: Vec<Document>,
    pub meetings: Vec<MeetingRecord>,
    pub monthly_reports: Vec<MonthlyReport>,
    pub defenses: Vec<Defense>,
    pub results: Vec<ResultRecord>,
    pub result_state: GroupResultState,
}

impl GroupAggregate {
    pub fn new(group: Group) -> Self {
        GroupAggregate {
            group,
            proposals: Vec::new(),
            documents: Vec::new(),
            meetings: Vec::new(),
            monthly_reports: Vec::new(),
            defenses: Vec::new(),
            results: Vec::new(),
            result_state: GroupResultState::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.group.id
    }

    pub fn defense(&self, defense_id: Uuid) -> Result<&Defense, EngineError> {
        self.defenses
            .iter()
            .find(|d| d.id == defense_id)
            .ok_or_else(|| EngineError::NotFound(format!("defense {defense_id}")))
    }

    pub fn defense_mut(&mut self, defense_id: Uuid) -> Result<&mut Defense, EngineError> {
        self.defenses
            .iter_mut()
            .find(|d| d.id == defense_id)
            .ok_or_else(|| EngineError::NotFound(format!("defense {defense_id}")))
    }
}

/// Process-wide tables shared by all groups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    pub gates: BTreeMap<GateKey, DocumentTypeControl>,
    pub committees: Vec<Committee>,
}

impl Registry {
    pub fn gate(&self, key: GateKey) -> Option<&DocumentTypeControl> {
        self.gates.get(&key)
    }

    pub fn committee(&self, committee_id: Uuid) -> Result<&Committee, EngineError> {
        self.committees
            .iter()
            .find(|c| c.id == committee_id)
            .ok_or_else(|| EngineError::NotFound(format!("committee {committee_id}")))
    }

    pub fn active_committee(&self, department_id: Uuid) -> Option<&Committee> {
        self.committees
            .iter()
            .find(|c| c.department_id == department_id && c.status == CommitteeStatus::Active)
    }
}
