use crate::config::{ConsensusParams, PERCENT_100};
use crate::errors::{ChainError, ChainResult};
use crate::state::{Database, DynamicGlobalPropertyObject, GlobalPropertyObject};
use crate::types::{AccountName, ProducerKey, ProducerSchedule};

pub fn is_start_of_round(block_num: u64, params: &ConsensusParams) -> bool {
    block_num % params.blocks_per_round() == 0
}

/// Read-only view over the rows that drive slot arithmetic and producer
/// rotation.
pub struct SchedulerView<'a> {
    pub params: &'a ConsensusParams,
    pub gpo: &'a GlobalPropertyObject,
    pub dgp: &'a DynamicGlobalPropertyObject,
}

impl SchedulerView<'_> {
    /// Producer owed the block `slot` intervals after the head. Slot 0 is
    /// the head itself and is never a valid production slot.
    pub fn scheduled_producer(&self, slot: u64) -> ChainResult<AccountName> {
        let absolute_slot = self.dgp.current_absolute_slot + slot;
        let index =
            (absolute_slot % self.params.blocks_per_round()) / u64::from(self.params.producer_repetitions);
        self.gpo
            .active_producers
            .producers
            .get(index as usize)
            .map(|producer| producer.producer_name.clone())
            .ok_or_else(|| {
                ChainError::Config("producer schedule is shorter than the round".into())
            })
    }

    pub fn slot_time_ms(&self, slot: u64) -> u64 {
        if slot == 0 {
            return 0;
        }
        // before the first block, head time carries the genesis timestamp
        self.dgp.time_ms + slot * self.params.block_interval_ms
    }

    /// Inverse of `slot_time_ms`; times before the first open slot map to 0.
    pub fn slot_at_time_ms(&self, when_ms: u64) -> u64 {
        let first_slot_time = self.slot_time_ms(1);
        if when_ms < first_slot_time {
            return 0;
        }
        (when_ms - first_slot_time) / self.params.block_interval_ms + 1
    }

    /// Share of the last 64 slots that carried a block, in basis points.
    pub fn participation_rate(&self) -> u32 {
        let filled = u64::from(self.dgp.recent_slots_filled.count_ones());
        (u64::from(PERCENT_100) * filled / 64) as u32
    }
}

/// The schedule currently queued to take effect, or the active one when
/// nothing is queued.
pub fn head_producer_schedule(gpo: &GlobalPropertyObject) -> &ProducerSchedule {
    gpo.pending_active_producers
        .last()
        .map(|(_, schedule)| schedule)
        .unwrap_or(&gpo.active_producers)
}

/// Top `producer_count` producers by descending vote tally (ties broken by
/// name), skipping any producer without a signing key. The version bumps iff
/// the resulting set differs from the schedule queued at the head.
pub fn calculate_producer_schedule(db: &Database) -> ChainResult<ProducerSchedule> {
    let gpo = db.global_property()?;
    let count = gpo.params.producer_count as usize;
    let mut producers = Vec::with_capacity(count);
    for vote in db.producer_votes.by_order().rev() {
        if producers.len() == count {
            break;
        }
        let producer = db.producers.get(&vote.owner)?;
        if producer.signing_key.is_empty() {
            continue;
        }
        producers.push(ProducerKey {
            producer_name: producer.owner.clone(),
            signing_key: producer.signing_key.clone(),
        });
    }
    let head_schedule = head_producer_schedule(gpo);
    let mut schedule = ProducerSchedule {
        version: head_schedule.version,
        producers,
    };
    if schedule != *head_schedule {
        schedule.version += 1;
    }
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ProducerObject, ProducerVoteObject};

    fn params() -> ConsensusParams {
        ConsensusParams {
            producer_count: 3,
            producer_repetitions: 2,
            block_interval_ms: 500,
            ..ConsensusParams::default()
        }
    }

    fn schedule_of(names: &[&str]) -> ProducerSchedule {
        ProducerSchedule {
            version: 0,
            producers: names
                .iter()
                .map(|name| ProducerKey {
                    producer_name: (*name).to_string(),
                    signing_key: format!("{:064x}", 1),
                })
                .collect(),
        }
    }

    fn view_fixture(
        params: &ConsensusParams,
        gpo: &GlobalPropertyObject,
        dgp: &DynamicGlobalPropertyObject,
    ) -> Vec<AccountName> {
        let view = SchedulerView { params, gpo, dgp };
        (1..=params.blocks_per_round())
            .map(|slot| view.scheduled_producer(slot).unwrap())
            .collect()
    }

    #[test]
    fn rotation_repeats_each_producer() {
        let params = params();
        let gpo = GlobalPropertyObject {
            params: params.clone(),
            active_producers: schedule_of(&["alpha", "beta", "gamma"]),
            pending_active_producers: Vec::new(),
        };
        let dgp = DynamicGlobalPropertyObject::default();
        let rotation = view_fixture(&params, &gpo, &dgp);
        assert_eq!(
            rotation,
            ["alpha", "beta", "beta", "gamma", "gamma", "alpha"]
        );
    }

    #[test]
    fn slot_time_round_trips_with_slot_at_time() {
        let params = params();
        let gpo = GlobalPropertyObject {
            params: params.clone(),
            active_producers: schedule_of(&["alpha", "beta", "gamma"]),
            pending_active_producers: Vec::new(),
        };
        let mut dgp = DynamicGlobalPropertyObject::default();
        dgp.time_ms = 10_000;
        let view = SchedulerView {
            params: &params,
            gpo: &gpo,
            dgp: &dgp,
        };
        assert_eq!(view.slot_time_ms(0), 0);
        assert_eq!(view.slot_time_ms(1), 10_500);
        assert_eq!(view.slot_at_time_ms(10_499), 0);
        for slot in 1..6 {
            assert_eq!(view.slot_at_time_ms(view.slot_time_ms(slot)), slot);
        }
        // mid-interval times resolve to the open slot
        assert_eq!(view.slot_at_time_ms(10_700), 1);
    }

    #[test]
    fn participation_counts_recent_slot_bits() {
        let params = params();
        let gpo = GlobalPropertyObject {
            params: params.clone(),
            active_producers: schedule_of(&["alpha", "beta", "gamma"]),
            pending_active_producers: Vec::new(),
        };
        let mut dgp = DynamicGlobalPropertyObject::default();
        dgp.recent_slots_filled = u64::MAX;
        let view = SchedulerView {
            params: &params,
            gpo: &gpo,
            dgp: &dgp,
        };
        assert_eq!(view.participation_rate(), PERCENT_100);
        dgp.recent_slots_filled = u64::MAX >> 32;
        let view = SchedulerView {
            params: &params,
            gpo: &gpo,
            dgp: &dgp,
        };
        assert_eq!(view.participation_rate(), PERCENT_100 / 2);
    }

    fn seeded_db(entries: &[(&str, u128, &str)]) -> Database {
        let mut db = Database::new();
        db.global_properties
            .create(GlobalPropertyObject {
                params: params(),
                active_producers: ProducerSchedule::default(),
                pending_active_producers: Vec::new(),
            })
            .unwrap();
        for (name, votes, key) in entries {
            db.producers
                .create(ProducerObject {
                    owner: (*name).to_string(),
                    signing_key: (*key).to_string(),
                    last_aslot: 0,
                    last_confirmed_block_num: 0,
                    total_missed: 0,
                })
                .unwrap();
            db.producer_votes
                .create(ProducerVoteObject {
                    owner: (*name).to_string(),
                    votes: *votes,
                })
                .unwrap();
        }
        db
    }

    #[test]
    fn schedule_selects_top_votes_and_skips_keyless_producers() {
        let key = "aa".repeat(32);
        let db = seeded_db(&[
            ("alpha", 50, key.as_str()),
            ("beta", 90, ""),
            ("gamma", 70, key.as_str()),
            ("delta", 60, key.as_str()),
            ("omega", 10, key.as_str()),
        ]);
        let schedule = calculate_producer_schedule(&db).unwrap();
        let names: Vec<&str> = schedule
            .producers
            .iter()
            .map(|p| p.producer_name.as_str())
            .collect();
        // beta leads the tally but has no signing key
        assert_eq!(names, ["gamma", "delta", "alpha"]);
        assert_eq!(schedule.version, 1);
    }

    #[test]
    fn identical_schedule_keeps_its_version() {
        let key = "aa".repeat(32);
        let mut db = seeded_db(&[
            ("alpha", 3, key.as_str()),
            ("beta", 2, key.as_str()),
            ("gamma", 1, key.as_str()),
        ]);
        let first = calculate_producer_schedule(&db).unwrap();
        db.modify_global_property(|gpo| gpo.active_producers = first.clone())
            .unwrap();
        let second = calculate_producer_schedule(&db).unwrap();
        assert_eq!(second, first);
    }
}
