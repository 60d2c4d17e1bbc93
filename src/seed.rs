//! Demo data with fixed identifiers, safe to load more than once.

use chrono::Duration;
use uuid::Uuid;

use crate::authz::{Principal, Role};
use crate::engine::Engine;
use crate::error::Result;
use crate::lifecycle;
use crate::models::{FormType, GateKey, GroupAggregate};
use crate::store::Store;
use crate::submissions::{self, GateState};

pub const DEPARTMENT_ID: Uuid = Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0001);
pub const SUPERVISOR_ID: Uuid = Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0002);
pub const GROUP_ID: Uuid = Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0010);
pub const STUDENT_IDS: [Uuid; 3] = [
    Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0101),
    Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0102),
    Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0103),
];
pub const COMMITTEE_MEMBER_IDS: [Uuid; 2] = [
    Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0201),
    Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0202),
];

const COMMITTEE_NAME: &str = "Computing Proposal Committee";
const GROUP_NAME: &str = "Team Orion";
const FORM_A_WINDOW_DAYS: i64 = 21;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub committee_created: bool,
    pub group_created: bool,
    pub gate_unlocked: bool,
}

pub async fn seed<S: Store>(engine: &Engine<S>) -> Result<SeedSummary> {
    let admin = Principal::new(Uuid::nil(), Role::Admin);
    let mut summary = SeedSummary::default();

    let registry = engine.store().registry().await?;
    let has_committee = registry
        .committees
        .iter()
        .any(|c| c.department_id == DEPARTMENT_ID);
    if !has_committee {
        let committee = engine
            .create_committee(
                &admin,
                COMMITTEE_NAME,
                DEPARTMENT_ID,
                COMMITTEE_MEMBER_IDS.into_iter().collect(),
            )
            .await?;
        engine.approve_committee(&admin, committee.id).await?;
        summary.committee_created = true;
    }

    if !engine.store().group_ids().await?.contains(&GROUP_ID) {
        let mut group = lifecycle::new_group(
            GROUP_NAME,
            DEPARTMENT_ID,
            &STUDENT_IDS,
            Some(STUDENT_IDS[0]),
            &engine.config().groups,
            engine.now(),
        )?;
        group.id = GROUP_ID;
        group.project_title = Some("Campus shuttle tracking".to_string());
        for member in &mut group.members {
            member.group_id = GROUP_ID;
        }
        engine.store().insert_group(GroupAggregate::new(group)).await?;
        engine.assign_supervisor(&admin, GROUP_ID, SUPERVISOR_ID).await?;
        summary.group_created = true;
    }

    let form_a = GateKey::Proposal(FormType::FormA);
    let now = engine.now();
    if submissions::gate_state(registry.gate(form_a), now) != GateState::Open {
        engine
            .unlock_gate(
                &admin,
                form_a,
                now + Duration::days(FORM_A_WINDOW_DAYS),
                "Form A submissions are open",
            )
            .await?;
        summary.gate_unlocked = true;
    }

    tracing::info!(
        committee = summary.committee_created,
        group = summary.group_created,
        gate = summary.gate_unlocked,
        "seed finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::{CommitteeStatus, GroupStatus};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn seeding_twice_changes_nothing_the_second_time() {
        let engine = Engine::new(MemoryStore::new(), EngineConfig::default());

        let first = seed(&engine).await.unwrap();
        assert_eq!(
            first,
            SeedSummary {
                committee_created: true,
                group_created: true,
                gate_unlocked: true,
            }
        );

        let second = seed(&engine).await.unwrap();
        assert_eq!(second, SeedSummary::default());

        let registry = engine.store().registry().await.unwrap();
        assert_eq!(registry.committees.len(), 1);
        assert_eq!(registry.committees[0].status, CommitteeStatus::Active);

        let group = engine.store().load_group(GROUP_ID).await.unwrap().group;
        assert_eq!(group.status, GroupStatus::Forming);
        assert_eq!(group.supervisor_id, Some(SUPERVISOR_ID));
        assert!(group.members.iter().all(|m| m.group_id == GROUP_ID));
    }
}
