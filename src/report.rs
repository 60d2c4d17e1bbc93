use std::collections::BTreeSet;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::defense;
use crate::lifecycle;
use crate::meetings::{self, WEEKS_PER_MONTH};
use crate::models::{GateKey, GroupAggregate, Registry};
use crate::submissions;

/// Months that have at least one meeting or monthly report on file.
fn active_months(aggregate: &GroupAggregate) -> BTreeSet<u8> {
    aggregate
        .meetings
        .iter()
        .map(|m| m.month)
        .chain(aggregate.monthly_reports.iter().map(|r| r.month))
        .collect()
}

fn flag(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

pub fn build_report(aggregate: &GroupAggregate, registry: &Registry, now: DateTime<Utc>) -> String {
    let group = &aggregate.group;
    let eligibility = lifecycle::eligibility(group.status);
    let mut output = String::new();

    let _ = writeln!(output, "# FYP Progress Report: {}", group.name);
    let _ = writeln!(
        output,
        "Generated {} for group {}",
        now.format("%Y-%m-%d %H:%M UTC"),
        group.id
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Group");
    let _ = writeln!(output, "- Status: {}", group.status);
    let _ = writeln!(
        output,
        "- Project: {}",
        group.project_title.as_deref().unwrap_or("untitled")
    );
    match group.supervisor_id {
        Some(supervisor) => {
            let _ = writeln!(output, "- Supervisor: {supervisor}");
        }
        None => {
            let _ = writeln!(output, "- Supervisor: not assigned");
        }
    }
    for member in &group.members {
        let _ = writeln!(
            output,
            "- Member {}{}",
            member.student_id,
            if member.is_lead { " (lead)" } else { "" }
        );
    }
    let _ = writeln!(
        output,
        "- Accepts proposals: {}, documents: {}, meetings: {}; compilable: {}",
        flag(eligibility.accepts_proposals),
        flag(eligibility.accepts_documents),
        flag(eligibility.accepts_meetings),
        flag(eligibility.compilable)
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Proposals");
    if aggregate.proposals.is_empty() {
        let _ = writeln!(output, "No proposals drafted yet.");
    } else {
        for proposal in &aggregate.proposals {
            let _ = writeln!(output, "- {}: {}", proposal.form_type, proposal.status);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Documents");
    if aggregate.documents.is_empty() {
        let _ = writeln!(output, "No documents submitted yet.");
    } else {
        for document in &aggregate.documents {
            let gate = GateKey::Document(document.document_type);
            let _ = writeln!(
                output,
                "- {}: {} (gate {:?})",
                document.document_type,
                document.status,
                submissions::gate_state(registry.gate(gate), now)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Meetings");
    let months = active_months(aggregate);
    if months.is_empty() {
        let _ = writeln!(output, "No meetings recorded yet.");
    } else {
        for month in months {
            let filed = aggregate.monthly_reports.iter().any(|r| r.month == month);
            let _ = writeln!(
                output,
                "- Month {}: {}/{} weeks recorded, monthly report {}",
                month,
                meetings::readiness(aggregate, month),
                WEEKS_PER_MONTH,
                if filed { "filed" } else { "pending" }
            );
        }
        for summary in meetings::attendance_summary(aggregate) {
            let _ = writeln!(
                output,
                "- Attendance {}: {} of {}",
                summary.student_id, summary.attended, summary.held
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Defenses");
    if aggregate.defenses.is_empty() {
        let _ = writeln!(output, "No defenses scheduled.");
    } else {
        let mut defenses = aggregate.defenses.clone();
        defenses.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        for d in defenses.iter() {
            let _ = writeln!(
                output,
                "- {} on {} at {}: {}",
                d.kind,
                d.scheduled_at.format("%Y-%m-%d %H:%M"),
                d.venue,
                defense::display_status(d, now)
            );
            for correction in &d.corrections {
                let _ = writeln!(
                    output,
                    "  - corrected {} -> {}: {}",
                    correction.previous, correction.corrected, correction.reason
                );
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Results");
    let state = &aggregate.result_state;
    let _ = writeln!(
        output,
        "Compiled: {}, published: {}",
        flag(state.is_compiled),
        flag(state.is_published)
    );
    for record in &aggregate.results {
        let total = record
            .total_marks
            .map(|t| format!("{t:.2}"))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            output,
            "- {}: total {} grade {} final {}",
            record.student_id,
            total,
            record.grade.as_deref().unwrap_or("-"),
            record
                .final_result
                .map(|r| r.to_string())
                .unwrap_or_else(|| "pending".to_string())
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupPolicy;
    use crate::models::{GroupStatus, MeetingRecord};
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn aggregate() -> GroupAggregate {
        let mut group = lifecycle::new_group(
            "Team Perseus",
            Uuid::new_v4(),
            &[Uuid::new_v4(), Uuid::new_v4()],
            None,
            &GroupPolicy::default(),
            Utc::now(),
        )
        .unwrap();
        group.status = GroupStatus::Active;
        GroupAggregate::new(group)
    }

    #[test]
    fn empty_group_renders_placeholders() {
        let report = build_report(&aggregate(), &Registry::default(), Utc::now());
        assert!(report.starts_with("# FYP Progress Report: Team Perseus"));
        assert!(report.contains("- Status: active"));
        assert!(report.contains("No proposals drafted yet."));
        assert!(report.contains("No defenses scheduled."));
        assert!(report.contains("Compiled: no, published: no"));
    }

    #[test]
    fn meeting_readiness_is_listed_per_month() {
        let mut agg = aggregate();
        let student = agg.group.members[0].student_id;
        for week in 1..=3u8 {
            agg.meetings.push(MeetingRecord {
                id: Uuid::new_v4(),
                group_id: agg.id(),
                month: 2,
                week,
                meeting_date: NaiveDate::from_ymd_opt(2026, 3, week as u32).unwrap(),
                attendees: [student].into_iter().collect(),
                notes: String::new(),
                recorded_by: Uuid::new_v4(),
            });
        }
        let report = build_report(&agg, &Registry::default(), Utc::now());
        assert!(report.contains("- Month 2: 3/4 weeks recorded, monthly report pending"));
        assert!(report.contains(&format!("- Attendance {student}: 3 of 3")));
    }
}
