//! Role checks against the identity provider's principal
//!
//! Authentication happens elsewhere; the engine only asks whether a principal
//! may perform an action, optionally scoped to one group.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::Group;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Supervisor,
    Coordinator,
    CommitteeMember,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Supervisor => "supervisor",
            Role::Coordinator => "coordinator",
            Role::CommitteeMember => "committee_member",
            Role::Admin => "admin",
        }
    }

    /// Roles that bypass per-defense evaluator membership.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Coordinator | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "supervisor" => Ok(Role::Supervisor),
            "coordinator" => Ok(Role::Coordinator),
            "committee_member" | "committee" => Ok(Role::CommitteeMember),
            "admin" => Ok(Role::Admin),
            other => Err(EngineError::ValidationFailed(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub role: Role,
    /// Group the identity provider scoped this session to, if any
    pub group_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
}

impl Principal {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Principal {
            user_id,
            role,
            group_id: None,
            department_id: None,
        }
    }

    pub fn for_group(mut self, group_id: Uuid) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn in_department(mut self, department_id: Uuid) -> Self {
        self.department_id = Some(department_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    CreateGroup,
    EditMembers,
    AssignSupervisor,
    ApproveGroup,
    ManageGates,
    DraftProposal,
    SubmitProposal,
    ReviewProposal,
    SubmitDocument,
    SupervisorReview,
    FinalizeDocument,
    RecordMeeting,
    FileMonthlyReport,
    ManageCommittees,
    ScheduleDefense,
    AllocatePanel,
    RecordDefenseResult,
    CorrectDefenseResult,
    RecordMarks,
    AssessSupervision,
    CompileResults,
    PublishResults,
    SetFinalResult,
    ViewStatus,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, principal: &Principal, action: Action, group: Option<&Group>) -> bool;

    /// `Forbidden` unless [`Authorizer::authorize`] allows the action.
    fn require(&self, principal: &Principal, action: Action, group: Option<&Group>) -> Result<()> {
        if self.authorize(principal, action, group) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "{} {} may not {}",
                principal.role, principal.user_id, action
            )))
        }
    }
}

/// Default grant table keyed on role, with group scoping for students and
/// supervisors and optional department scoping for coordinators. Recording a
/// defense result is open to every staff evaluator role; committee or panel
/// membership is enforced by the defense.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePolicy;

impl RolePolicy {
    fn grants(role: Role, action: Action) -> bool {
        use Action::*;
        match role {
            Role::Admin => true,
            Role::Student => matches!(
                action,
                CreateGroup
                    | EditMembers
                    | DraftProposal
                    | SubmitProposal
                    | SubmitDocument
                    | FileMonthlyReport
                    | ViewStatus
            ),
            Role::Supervisor => matches!(
                action,
                RecordMeeting | SupervisorReview | AssessSupervision | FileMonthlyReport | ViewStatus
            ),
            Role::Coordinator => !matches!(
                action,
                DraftProposal | SubmitProposal | SubmitDocument | SupervisorReview | RecordMeeting
            ),
            Role::CommitteeMember => {
                matches!(action, RecordDefenseResult | ReviewProposal | ViewStatus)
            }
        }
    }

    fn in_scope(principal: &Principal, group: Option<&Group>) -> bool {
        let Some(group) = group else {
            return true;
        };
        if principal.group_id.is_some_and(|scoped| scoped != group.id) {
            return false;
        }
        match principal.role {
            Role::Student => group.member_by_student(principal.user_id).is_some(),
            Role::Supervisor => group.supervisor_id == Some(principal.user_id),
            Role::Coordinator => principal
                .department_id
                .map_or(true, |dept| dept == group.department_id),
            Role::CommitteeMember | Role::Admin => true,
        }
    }
}

impl Authorizer for RolePolicy {
    fn authorize(&self, principal: &Principal, action: Action, group: Option<&Group>) -> bool {
        // Evaluators sit on panels of groups they do not supervise; the
        // defense itself checks committee or panel membership.
        if action == Action::RecordDefenseResult
            && matches!(principal.role, Role::Supervisor | Role::CommitteeMember)
        {
            return true;
        }
        Self::grants(principal.role, action) && Self::in_scope(principal, group)
    }
}
