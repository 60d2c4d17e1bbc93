//! Weekly supervisor meetings and the monthly filings they unlock

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::lifecycle;
use crate::models::{ArtifactRef, GroupAggregate, MeetingRecord, MonthlyReport, MAX_MONTH};

pub const WEEKS_PER_MONTH: u8 = 4;

#[derive(Debug, Clone)]
pub struct NewMeeting {
    pub month: u8,
    pub week: u8,
    pub meeting_date: NaiveDate,
    pub attendees: BTreeSet<Uuid>,
    pub notes: String,
}

#[derive(Debug, Clone)]
pub struct NewMonthlyReport {
    pub month: u8,
    pub summary: String,
    pub challenges: String,
    pub plan: String,
    pub progress_percent: u8,
    pub artifact: ArtifactRef,
}

fn check_month(month: u8) -> Result<()> {
    if month == 0 || month > MAX_MONTH {
        return Err(EngineError::ValidationFailed(format!(
            "month must be between 1 and {MAX_MONTH}, got {month}"
        )));
    }
    Ok(())
}

/// Number of distinct weeks recorded for `month`.
pub fn readiness(aggregate: &GroupAggregate, month: u8) -> usize {
    aggregate
        .meetings
        .iter()
        .filter(|m| m.month == month)
        .map(|m| m.week)
        .collect::<BTreeSet<_>>()
        .len()
}

pub fn ensure_month_ready(aggregate: &GroupAggregate, month: u8) -> Result<()> {
    let recorded = readiness(aggregate, month);
    let required = WEEKS_PER_MONTH as usize;
    if recorded < required {
        return Err(EngineError::MeetingsIncomplete {
            month,
            recorded,
            missing: required - recorded,
        });
    }
    Ok(())
}

pub fn record_meeting(
    aggregate: &mut GroupAggregate,
    meeting: NewMeeting,
    recorded_by: Uuid,
) -> Result<MeetingRecord> {
    check_month(meeting.month)?;
    if meeting.week == 0 || meeting.week > WEEKS_PER_MONTH {
        return Err(EngineError::ValidationFailed(format!(
            "week must be between 1 and {WEEKS_PER_MONTH}, got {}",
            meeting.week
        )));
    }
    if !lifecycle::eligibility(aggregate.group.status).accepts_meetings {
        return Err(EngineError::InvalidTransition(format!(
            "a {} group does not hold supervised meetings",
            aggregate.group.status
        )));
    }
    if let Some(stranger) = meeting
        .attendees
        .iter()
        .find(|s| aggregate.group.member_by_student(**s).is_none())
    {
        return Err(EngineError::ValidationFailed(format!(
            "attendee {stranger} is not a member of group {}",
            aggregate.id()
        )));
    }
    if aggregate
        .meetings
        .iter()
        .any(|m| m.month == meeting.month && m.week == meeting.week)
    {
        return Err(EngineError::DuplicateMeetingRecord {
            month: meeting.month,
            week: meeting.week,
        });
    }

    let record = MeetingRecord {
        id: Uuid::new_v4(),
        group_id: aggregate.id(),
        month: meeting.month,
        week: meeting.week,
        meeting_date: meeting.meeting_date,
        attendees: meeting.attendees,
        notes: meeting.notes,
        recorded_by,
    };
    aggregate.meetings.push(record.clone());
    Ok(record)
}

pub fn file_monthly_report(
    aggregate: &mut GroupAggregate,
    report: NewMonthlyReport,
    submitted_by: Uuid,
    now: DateTime<Utc>,
) -> Result<MonthlyReport> {
    check_month(report.month)?;
    if report.progress_percent > 100 {
        return Err(EngineError::ValidationFailed(format!(
            "progress must be a percentage, got {}",
            report.progress_percent
        )));
    }
    if report.summary.trim().is_empty() {
        return Err(EngineError::ValidationFailed(
            "monthly report summary must not be empty".to_string(),
        ));
    }
    ensure_month_ready(aggregate, report.month)?;
    if aggregate
        .monthly_reports
        .iter()
        .any(|r| r.month == report.month)
    {
        return Err(EngineError::InvalidTransition(format!(
            "monthly report for month {} is already filed",
            report.month
        )));
    }

    let filed = MonthlyReport {
        id: Uuid::new_v4(),
        group_id: aggregate.id(),
        month: report.month,
        summary: report.summary,
        challenges: report.challenges,
        plan: report.plan,
        progress_percent: report.progress_percent,
        artifact: report.artifact,
        submitted_by,
        submitted_at: now,
    };
    aggregate.monthly_reports.push(filed.clone());
    Ok(filed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceSummary {
    pub student_id: Uuid,
    pub attended: usize,
    pub held: usize,
}

/// Attendance per member across every recorded meeting, in member order.
pub fn attendance_summary(aggregate: &GroupAggregate) -> Vec<AttendanceSummary> {
    let held = aggregate.meetings.len();
    let mut attended: BTreeMap<Uuid, usize> = BTreeMap::new();
    for meeting in &aggregate.meetings {
        for student in &meeting.attendees {
            *attended.entry(*student).or_default() += 1;
        }
    }
    aggregate
        .group
        .members
        .iter()
        .map(|m| AttendanceSummary {
            student_id: m.student_id,
            attended: attended.get(&m.student_id).copied().unwrap_or(0),
            held,
        })
        .collect()
}
