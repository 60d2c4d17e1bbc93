use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use super::Store;
use crate::error::{EngineError, Result};
use crate::models::{
    ArtifactRef, Committee, Defense, DefenseResult, Document, DocumentTypeControl,
    EvaluationAssignment, GateKey, Group, GroupAggregate, GroupResultState, MeetingRecord, Member,
    MonthlyReport, Proposal, Registry, ResultCorrection, ResultRecord, ReviewNote,
};

/// Key for the transaction-scoped advisory lock guarding the registry tables.
const REGISTRY_LOCK_KEY: i64 = 0x6679_705f_7265_67;

/// Postgres-backed store; every unit of work is one transaction holding the
/// group row lock.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(PgStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create or upgrade the schema.
    pub async fn init_db(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn small(value: i16, column: &str) -> Result<u8> {
    u8::try_from(value)
        .map_err(|_| EngineError::ValidationFailed(format!("{column} out of range: {value}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn group_from_row(row: &PgRow, members: Vec<Member>) -> Result<(Group, GroupResultState)> {
    let status: String = row.try_get("status")?;
    let group = Group {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        project_title: row.try_get("project_title")?,
        status: status.parse()?,
        department_id: row.try_get("department_id")?,
        supervisor_id: row.try_get("supervisor_id")?,
        members,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    };
    let state = GroupResultState {
        is_compiled: row.try_get("is_compiled")?,
        is_published: row.try_get("is_published")?,
        compiled_at: row.try_get("compiled_at")?,
        published_at: row.try_get("published_at")?,
    };
    Ok((group, state))
}

async fn fetch_aggregate(
    conn: &mut PgConnection,
    group_id: Uuid,
    for_update: bool,
) -> Result<GroupAggregate> {
    let mut query = String::from(
        "SELECT id, name, project_title, status, department_id, supervisor_id, \
         is_compiled, is_published, compiled_at, published_at, created_at, updated_at \
         FROM fyp_stage.groups WHERE id = $1",
    );
    if for_update {
        query.push_str(" FOR UPDATE");
    }
    let group_row = sqlx::query(&query)
        .bind(group_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("group {group_id}")))?;

    let mut members = Vec::new();
    for row in sqlx::query(
        "SELECT id, student_id, is_lead FROM fyp_stage.group_members \
         WHERE group_id = $1 ORDER BY position",
    )
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?
    {
        members.push(Member {
            id: row.try_get("id")?,
            student_id: row.try_get("student_id")?,
            group_id,
            is_lead: row.try_get("is_lead")?,
        });
    }
    let (group, result_state) = group_from_row(&group_row, members)?;

    let mut proposals = Vec::new();
    for row in sqlx::query(
        "SELECT id, form_type, status, content, created_by, created_at, submitted_at, \
         reviewer_id, reviewer_remarks, reviewed_at \
         FROM fyp_stage.proposals WHERE group_id = $1 ORDER BY created_at, id",
    )
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?
    {
        let form_type: String = row.try_get("form_type")?;
        let status: String = row.try_get("status")?;
        proposals.push(Proposal {
            id: row.try_get("id")?,
            group_id,
            form_type: form_type.parse()?,
            status: status.parse()?,
            content: row.try_get("content")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            submitted_at: row.try_get("submitted_at")?,
            reviewer_id: row.try_get("reviewer_id")?,
            reviewer_remarks: row.try_get("reviewer_remarks")?,
            reviewed_at: row.try_get("reviewed_at")?,
        });
    }

    let mut documents = Vec::new();
    for row in sqlx::query(
        "SELECT id, document_type, status, submitted_by, artifact, submitted_at, \
         reviewer_id, review_remarks, reviewed_at, finalized_by, finalized_at \
         FROM fyp_stage.documents WHERE group_id = $1 ORDER BY submitted_at, id",
    )
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?
    {
        let document_type: String = row.try_get("document_type")?;
        let status: String = row.try_get("status")?;
        let artifact: String = row.try_get("artifact")?;
        let reviewer_id: Option<Uuid> = row.try_get("reviewer_id")?;
        let reviewed_at: Option<DateTime<Utc>> = row.try_get("reviewed_at")?;
        let supervisor_review = match (reviewer_id, reviewed_at) {
            (Some(reviewer_id), Some(reviewed_at)) => Some(ReviewNote {
                reviewer_id,
                remarks: row.try_get("review_remarks")?,
                reviewed_at,
            }),
            _ => None,
        };
        documents.push(Document {
            id: row.try_get("id")?,
            group_id,
            document_type: document_type.parse()?,
            status: status.parse()?,
            submitted_by: row.try_get("submitted_by")?,
            artifact: ArtifactRef::new(artifact)?,
            submitted_at: row.try_get("submitted_at")?,
            supervisor_review,
            finalized_by: row.try_get("finalized_by")?,
            finalized_at: row.try_get("finalized_at")?,
        });
    }

    let mut meetings = Vec::new();
    for row in sqlx::query(
        "SELECT id, month, week, meeting_date, attendees, notes, recorded_by \
         FROM fyp_stage.meeting_records WHERE group_id = $1 ORDER BY month, week",
    )
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?
    {
        let attendees: Vec<Uuid> = row.try_get("attendees")?;
        meetings.push(MeetingRecord {
            id: row.try_get("id")?,
            group_id,
            month: small(row.try_get("month")?, "month")?,
            week: small(row.try_get("week")?, "week")?,
            meeting_date: row.try_get("meeting_date")?,
            attendees: attendees.into_iter().collect(),
            notes: row.try_get("notes")?,
            recorded_by: row.try_get("recorded_by")?,
        });
    }

    let mut monthly_reports = Vec::new();
    for row in sqlx::query(
        "SELECT id, month, summary, challenges, plan, progress_percent, artifact, \
         submitted_by, submitted_at \
         FROM fyp_stage.monthly_reports WHERE group_id = $1 ORDER BY month",
    )
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?
    {
        let artifact: String = row.try_get("artifact")?;
        monthly_reports.push(MonthlyReport {
            id: row.try_get("id")?,
            group_id,
            month: small(row.try_get("month")?, "month")?,
            summary: row.try_get("summary")?,
            challenges: row.try_get("challenges")?,
            plan: row.try_get("plan")?,
            progress_percent: small(row.try_get("progress_percent")?, "progress_percent")?,
            artifact: ArtifactRef::new(artifact)?,
            submitted_by: row.try_get("submitted_by")?,
            submitted_at: row.try_get("submitted_at")?,
        });
    }

    let mut defenses = Vec::new();
    for row in sqlx::query(
        "SELECT id, kind, scheduled_at, venue, assignment, outcome, remarks, \
         recorded_by, recorded_at, corrections \
         FROM fyp_stage.defenses WHERE group_id = $1 ORDER BY scheduled_at, id",
    )
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?
    {
        let kind: String = row.try_get("kind")?;
        let outcome: Option<String> = row.try_get("outcome")?;
        let recorded_by: Option<Uuid> = row.try_get("recorded_by")?;
        let recorded_at: Option<DateTime<Utc>> = row.try_get("recorded_at")?;
        let result = match (outcome, recorded_by, recorded_at) {
            (Some(outcome), Some(recorded_by), Some(recorded_at)) => Some(DefenseResult {
                outcome: outcome.parse()?,
                remarks: row.try_get("remarks")?,
                recorded_by,
                recorded_at,
            }),
            _ => None,
        };
        let Json(assignment): Json<EvaluationAssignment> = row.try_get("assignment")?;
        let Json(corrections): Json<Vec<ResultCorrection>> = row.try_get("corrections")?;
        defenses.push(Defense {
            id: row.try_get("id")?,
            group_id,
            kind: kind.parse()?,
            scheduled_at: row.try_get("scheduled_at")?,
            venue: row.try_get("venue")?,
            assignment,
            result,
            corrections,
        });
    }

    let mut results = Vec::new();
    for row in sqlx::query(
        "SELECT member_id, student_id, proposal_marks, mid_eval_marks, final_eval_marks, \
         supervisor_marks, total_marks, grade, final_result \
         FROM fyp_stage.result_records WHERE group_id = $1",
    )
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?
    {
        let final_result: Option<String> = row.try_get("final_result")?;
        results.push(ResultRecord {
            member_id: row.try_get("member_id")?,
            student_id: row.try_get("student_id")?,
            proposal_marks: row.try_get("proposal_marks")?,
            mid_eval_marks: row.try_get("mid_eval_marks")?,
            final_eval_marks: row.try_get("final_eval_marks")?,
            supervisor_marks: row.try_get("supervisor_marks")?,
            total_marks: row.try_get("total_marks")?,
            grade: row.try_get("grade")?,
            final_result: final_result.map(|r| r.parse()).transpose()?,
        });
    }
    // Keep result rows in member order, matching the in-memory store.
    results.sort_by_key(|r| {
        group
            .members
            .iter()
            .position(|m| m.id == r.member_id)
            .unwrap_or(usize::MAX)
    });

    Ok(GroupAggregate {
        group,
        proposals,
        documents,
        meetings,
        monthly_reports,
        defenses,
        results,
        result_state,
    })
}

async fn save_aggregate(conn: &mut PgConnection, aggregate: &GroupAggregate) -> Result<()> {
    let group = &aggregate.group;
    let state = &aggregate.result_state;
    sqlx::query(
        r#"
        UPDATE fyp_stage.groups
        SET name = $2, project_title = $3, status = $4, supervisor_id = $5,
            is_compiled = $6, is_published = $7, compiled_at = $8, published_at = $9,
            updated_at = $10
        WHERE id = $1
        "#,
    )
    .bind(group.id)
    .bind(&group.name)
    .bind(&group.project_title)
    .bind(group.status.as_str())
    .bind(group.supervisor_id)
    .bind(state.is_compiled)
    .bind(state.is_published)
    .bind(state.compiled_at)
    .bind(state.published_at)
    .bind(group.updated_at)
    .execute(&mut *conn)
    .await?;

    let member_ids: Vec<Uuid> = group.members.iter().map(|m| m.id).collect();
    sqlx::query("DELETE FROM fyp_stage.group_members WHERE group_id = $1 AND NOT (id = ANY($2))")
        .bind(group.id)
        .bind(&member_ids)
        .execute(&mut *conn)
        .await?;
    for (position, member) in group.members.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO fyp_stage.group_members (id, group_id, student_id, is_lead, position)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET is_lead = EXCLUDED.is_lead, position = EXCLUDED.position
            "#,
        )
        .bind(member.id)
        .bind(group.id)
        .bind(member.student_id)
        .bind(member.is_lead)
        .bind(position as i32)
        .execute(&mut *conn)
        .await?;
    }

    for proposal in &aggregate.proposals {
        sqlx::query(
            r#"
            INSERT INTO fyp_stage.proposals
            (id, group_id, form_type, status, content, created_by, created_at,
             submitted_at, reviewer_id, reviewer_remarks, reviewed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, content = EXCLUDED.content,
                submitted_at = EXCLUDED.submitted_at, reviewer_id = EXCLUDED.reviewer_id,
                reviewer_remarks = EXCLUDED.reviewer_remarks, reviewed_at = EXCLUDED.reviewed_at
            "#,
        )
        .bind(proposal.id)
        .bind(group.id)
        .bind(proposal.form_type.as_str())
        .bind(proposal.status.as_str())
        .bind(&proposal.content)
        .bind(proposal.created_by)
        .bind(proposal.created_at)
        .bind(proposal.submitted_at)
        .bind(proposal.reviewer_id)
        .bind(&proposal.reviewer_remarks)
        .bind(proposal.reviewed_at)
        .execute(&mut *conn)
        .await?;
    }

    for document in &aggregate.documents {
        let review = document.supervisor_review.as_ref();
        sqlx::query(
            r#"
            INSERT INTO fyp_stage.documents
            (id, group_id, document_type, status, submitted_by, artifact, submitted_at,
             reviewer_id, review_remarks, reviewed_at, finalized_by, finalized_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, reviewer_id = EXCLUDED.reviewer_id,
                review_remarks = EXCLUDED.review_remarks, reviewed_at = EXCLUDED.reviewed_at,
                finalized_by = EXCLUDED.finalized_by, finalized_at = EXCLUDED.finalized_at
            "#,
        )
        .bind(document.id)
        .bind(group.id)
        .bind(document.document_type.key())
        .bind(document.status.as_str())
        .bind(document.submitted_by)
        .bind(document.artifact.as_str())
        .bind(document.submitted_at)
        .bind(review.map(|r| r.reviewer_id))
        .bind(review.and_then(|r| r.remarks.clone()))
        .bind(review.map(|r| r.reviewed_at))
        .bind(document.finalized_by)
        .bind(document.finalized_at)
        .execute(&mut *conn)
        .await?;
    }

    for meeting in &aggregate.meetings {
        let attendees: Vec<Uuid> = meeting.attendees.iter().copied().collect();
        sqlx::query(
            r#"
            INSERT INTO fyp_stage.meeting_records
            (id, group_id, month, week, meeting_date, attendees, notes, recorded_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(meeting.id)
        .bind(group.id)
        .bind(i16::from(meeting.month))
        .bind(i16::from(meeting.week))
        .bind(meeting.meeting_date)
        .bind(&attendees)
        .bind(&meeting.notes)
        .bind(meeting.recorded_by)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EngineError::DuplicateMeetingRecord {
                    month: meeting.month,
                    week: meeting.week,
                }
            } else {
                e.into()
            }
        })?;
    }

    for report in &aggregate.monthly_reports {
        sqlx::query(
            r#"
            INSERT INTO fyp_stage.monthly_reports
            (id, group_id, month, summary, challenges, plan, progress_percent, artifact,
             submitted_by, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(report.id)
        .bind(group.id)
        .bind(i16::from(report.month))
        .bind(&report.summary)
        .bind(&report.challenges)
        .bind(&report.plan)
        .bind(i16::from(report.progress_percent))
        .bind(report.artifact.as_str())
        .bind(report.submitted_by)
        .bind(report.submitted_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EngineError::InvalidTransition(format!(
                    "monthly report for month {} is already filed",
                    report.month
                ))
            } else {
                e.into()
            }
        })?;
    }

    for defense in &aggregate.defenses {
        let result = defense.result.as_ref();
        sqlx::query(
            r#"
            INSERT INTO fyp_stage.defenses
            (id, group_id, kind, scheduled_at, venue, assignment, outcome, remarks,
             recorded_by, recorded_at, corrections)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET assignment = EXCLUDED.assignment, outcome = EXCLUDED.outcome,
                remarks = EXCLUDED.remarks, recorded_by = EXCLUDED.recorded_by,
                recorded_at = EXCLUDED.recorded_at, corrections = EXCLUDED.corrections
            "#,
        )
        .bind(defense.id)
        .bind(group.id)
        .bind(defense.kind.as_str())
        .bind(defense.scheduled_at)
        .bind(&defense.venue)
        .bind(Json(&defense.assignment))
        .bind(result.map(|r| r.outcome.as_str()))
        .bind(result.and_then(|r| r.remarks.clone()))
        .bind(result.map(|r| r.recorded_by))
        .bind(result.map(|r| r.recorded_at))
        .bind(Json(&defense.corrections))
        .execute(&mut *conn)
        .await?;
    }

    let recorded: Vec<Uuid> = aggregate.results.iter().map(|r| r.member_id).collect();
    sqlx::query(
        "DELETE FROM fyp_stage.result_records WHERE group_id = $1 AND NOT (member_id = ANY($2))",
    )
    .bind(group.id)
    .bind(&recorded)
    .execute(&mut *conn)
    .await?;
    for record in &aggregate.results {
        sqlx::query(
            r#"
            INSERT INTO fyp_stage.result_records
            (group_id, member_id, student_id, proposal_marks, mid_eval_marks,
             final_eval_marks, supervisor_marks, total_marks, grade, final_result)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (group_id, member_id) DO UPDATE
            SET proposal_marks = EXCLUDED.proposal_marks,
                mid_eval_marks = EXCLUDED.mid_eval_marks,
                final_eval_marks = EXCLUDED.final_eval_marks,
                supervisor_marks = EXCLUDED.supervisor_marks,
                total_marks = EXCLUDED.total_marks,
                grade = EXCLUDED.grade,
                final_result = EXCLUDED.final_result
            "#,
        )
        .bind(group.id)
        .bind(record.member_id)
        .bind(record.student_id)
        .bind(record.proposal_marks)
        .bind(record.mid_eval_marks)
        .bind(record.final_eval_marks)
        .bind(record.supervisor_marks)
        .bind(record.total_marks)
        .bind(&record.grade)
        .bind(record.final_result.map(|r| r.as_str()))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn fetch_registry(conn: &mut PgConnection) -> Result<Registry> {
    let mut gates = BTreeMap::new();
    for row in sqlx::query(
        "SELECT gate_key, is_unlocked, deadline, message, updated_at \
         FROM fyp_stage.document_type_controls",
    )
    .fetch_all(&mut *conn)
    .await?
    {
        let key: String = row.try_get("gate_key")?;
        let gate: GateKey = key.parse()?;
        gates.insert(
            gate,
            DocumentTypeControl {
                gate,
                is_unlocked: row.try_get("is_unlocked")?,
                deadline: row.try_get("deadline")?,
                message: row.try_get("message")?,
                updated_at: row.try_get("updated_at")?,
            },
        );
    }

    let mut committees = Vec::new();
    for row in sqlx::query(
        "SELECT id, name, department_id, members, status FROM fyp_stage.committees ORDER BY name, id",
    )
    .fetch_all(&mut *conn)
    .await?
    {
        let members: Vec<Uuid> = row.try_get("members")?;
        let status: String = row.try_get("status")?;
        committees.push(Committee {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            department_id: row.try_get("department_id")?,
            members: members.into_iter().collect(),
            status: status.parse()?,
        });
    }

    Ok(Registry { gates, committees })
}

async fn save_registry(conn: &mut PgConnection, registry: &Registry) -> Result<()> {
    for control in registry.gates.values() {
        sqlx::query(
            r#"
            INSERT INTO fyp_stage.document_type_controls
            (gate_key, is_unlocked, deadline, message, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (gate_key) DO UPDATE
            SET is_unlocked = EXCLUDED.is_unlocked, deadline = EXCLUDED.deadline,
                message = EXCLUDED.message, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(control.gate.key())
        .bind(control.is_unlocked)
        .bind(control.deadline)
        .bind(&control.message)
        .bind(control.updated_at)
        .execute(&mut *conn)
        .await?;
    }

    for committee in &registry.committees {
        let members: Vec<Uuid> = committee.members.iter().copied().collect();
        sqlx::query(
            r#"
            INSERT INTO fyp_stage.committees (id, name, department_id, members, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, members = EXCLUDED.members, status = EXCLUDED.status
            "#,
        )
        .bind(committee.id)
        .bind(&committee.name)
        .bind(committee.department_id)
        .bind(&members)
        .bind(committee.status.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EngineError::ValidationFailed(
                    "department already has an active committee".to_string(),
                )
            } else {
                e.into()
            }
        })?;
    }
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn insert_group(&self, aggregate: GroupAggregate) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let group = &aggregate.group;
        let inserted = sqlx::query(
            r#"
            INSERT INTO fyp_stage.groups
            (id, name, project_title, status, department_id, supervisor_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(group.id)
        .bind(&group.name)
        .bind(&group.project_title)
        .bind(group.status.as_str())
        .bind(group.department_id)
        .bind(group.supervisor_id)
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(EngineError::ValidationFailed(format!(
                "group {} already exists",
                group.id
            )));
        }
        save_aggregate(&mut tx, &aggregate).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn group_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM fyp_stage.groups ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("id")?);
        }
        Ok(ids)
    }

    async fn load_group(&self, group_id: Uuid) -> Result<GroupAggregate> {
        let mut tx = self.pool.begin().await?;
        let aggregate = fetch_aggregate(&mut tx, group_id, false).await?;
        tx.commit().await?;
        Ok(aggregate)
    }

    async fn registry(&self) -> Result<Registry> {
        let mut conn = self.pool.acquire().await?;
        fetch_registry(&mut conn).await
    }

    async fn update_group<T, F>(&self, group_id: Uuid, f: F) -> Result<T>
    where
        F: FnOnce(&mut GroupAggregate, &Registry) -> Result<T> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut aggregate = fetch_aggregate(&mut tx, group_id, true).await?;
        let registry = fetch_registry(&mut tx).await?;

        // Dropping the transaction on error rolls it back.
        let out = f(&mut aggregate, &registry)?;
        save_aggregate(&mut tx, &aggregate).await?;
        tx.commit().await?;
        Ok(out)
    }

    async fn update_registry<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Registry) -> Result<T> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(REGISTRY_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        let mut registry = fetch_registry(&mut tx).await?;
        let out = f(&mut registry)?;
        save_registry(&mut tx, &registry).await?;
        tx.commit().await?;
        Ok(out)
    }
}
