//! Bulk meeting import from CSV
//!
//! Columns: `group_id,month,week,meeting_date,attendees,notes`, attendees
//! separated by `;`. Re-running an import is safe: rows for weeks that are
//! already on file are skipped.

use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use crate::authz::Principal;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::meetings::NewMeeting;
use crate::store::Store;

#[derive(Debug, Deserialize)]
struct MeetingRow {
    group_id: Uuid,
    month: u8,
    week: u8,
    meeting_date: NaiveDate,
    #[serde(default)]
    attendees: String,
    #[serde(default)]
    notes: String,
}

impl MeetingRow {
    fn into_meeting(self) -> Result<(Uuid, NewMeeting)> {
        let attendees = self
            .attendees
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                Uuid::parse_str(s)
                    .map_err(|e| EngineError::ValidationFailed(format!("bad attendee id {s}: {e}")))
            })
            .collect::<Result<_>>()?;
        Ok((
            self.group_id,
            NewMeeting {
                month: self.month,
                week: self.week,
                meeting_date: self.meeting_date,
                attendees,
                notes: self.notes,
            },
        ))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub skipped_duplicates: usize,
}

pub async fn import_meetings<S: Store>(
    engine: &Engine<S>,
    principal: &Principal,
    csv_path: &Path,
) -> Result<ImportSummary> {
    let file = std::fs::File::open(csv_path)?;
    import_meetings_from_reader(engine, principal, file).await
}

pub async fn import_meetings_from_reader<S: Store, R: Read>(
    engine: &Engine<S>,
    principal: &Principal,
    source: R,
) -> Result<ImportSummary> {
    let mut reader = csv::Reader::from_reader(source);
    let rows = reader
        .deserialize::<MeetingRow>()
        .collect::<std::result::Result<Vec<_>, csv::Error>>()?;

    let mut summary = ImportSummary::default();
    for row in rows {
        let (group_id, meeting) = row.into_meeting()?;
        match engine.record_meeting(principal, group_id, meeting).await {
            Ok(_) => summary.inserted += 1,
            Err(EngineError::DuplicateMeetingRecord { month, week }) => {
                tracing::debug!(group_id = %group_id, month, week, "meeting already on file");
                summary.skipped_duplicates += 1;
            }
            Err(err) => return Err(err),
        }
    }
    tracing::info!(
        inserted = summary.inserted,
        skipped = summary.skipped_duplicates,
        "meeting import finished"
    );
    Ok(summary)
}
