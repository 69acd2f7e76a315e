//! Derives the concrete occurrence set of a recurring calendar event from a
//! recurrence rule plus override patches, per spec §4.5. RRULE stepping is
//! hand-rolled (no RRULE crate appears anywhere in the retrieved pack); date
//! and IANA-timezone handling uses `chrono`/`chrono-tz`, the crate the wider
//! pack reaches for this job.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;

use crate::patch::is_valid_patch;

/// The instant identifying one occurrence: the occurrence's *original*
/// (unmoved) start time, used as the key into `recurrence_overrides`.
pub type RecurrenceId = DateTime<Utc>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Yearly,
    Monthly,
    Weekly,
    Daily,
    Other,
}

impl Frequency {
    /// The per-spec §4.5 frequency cap used in the range-expansion safety
    /// margin: 366/31/7/1 day(s) for YEARLY/MONTHLY/WEEKLY/other.
    fn cap(self) -> ChronoDuration {
        match self {
            Frequency::Yearly => ChronoDuration::days(366),
            Frequency::Monthly => ChronoDuration::days(31),
            Frequency::Weekly => ChronoDuration::days(7),
            Frequency::Daily | Frequency::Other => ChronoDuration::days(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    /// Stop after this many occurrences, if bounded.
    pub count: Option<u32>,
    /// Stop at or after this instant, if bounded (RFC 5545 UNTIL).
    pub until: Option<DateTime<Utc>>,
    pub interval: u32,
}

impl RecurrenceRule {
    fn is_bounded(&self) -> bool {
        self.count.is_some() || self.until.is_some()
    }

    fn step(&self) -> ChronoDuration {
        let unit = match self.frequency {
            Frequency::Yearly => ChronoDuration::days(365),
            Frequency::Monthly => ChronoDuration::days(30),
            Frequency::Weekly => ChronoDuration::weeks(1),
            Frequency::Daily | Frequency::Other => ChronoDuration::days(1),
        };
        unit * self.interval.max(1) as i32
    }
}

/// A per-instance patch on a recurring event, keyed by the instance's
/// original start time. `excluded` models an EXDATE; `start`/`duration`/
/// `time_zone` a moved occurrence; `attribute_patches` addresses further
/// overrides by JSON-Pointer path into the occurrence's materialized view.
#[derive(Debug, Clone, Default)]
pub struct OverridePatch {
    pub excluded: bool,
    pub start: Option<DateTime<Utc>>,
    pub duration: Option<ChronoDuration>,
    pub time_zone: Option<Tz>,
    pub attribute_patches: BTreeMap<String, Option<Value>>,
}

impl OverridePatch {
    fn is_rdate(&self) -> bool {
        self.start.is_some() || self.duration.is_some() || self.time_zone.is_some()
    }
}

/// One concrete occurrence of a recurring (or non-recurring) event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub recurrence_id: RecurrenceId,
    pub start: DateTime<Utc>,
    pub duration: ChronoDuration,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub start: DateTime<Utc>,
    pub time_zone: Tz,
    pub duration: ChronoDuration,
    pub recurrence_rule: Option<RecurrenceRule>,
    pub recurrence_overrides: BTreeMap<RecurrenceId, OverridePatch>,
    /// Memoized occurrence handles, per spec §4.5 "Occurrence identity":
    /// the same `recurrenceId` always yields the same handle until a
    /// `start`/`timeZone`/`recurrence*` change invalidates the cache.
    occurrence_cache: BTreeMap<RecurrenceId, Occurrence>,
}

impl Event {
    pub fn new(
        start: DateTime<Utc>,
        time_zone: Tz,
        duration: ChronoDuration,
        recurrence_rule: Option<RecurrenceRule>,
    ) -> Self {
        Self {
            start,
            time_zone,
            duration,
            recurrence_rule,
            recurrence_overrides: BTreeMap::new(),
            occurrence_cache: BTreeMap::new(),
        }
    }

    /// Prune any override whose path no longer resolves against
    /// `current_data`, per spec §4.5's "invalid overrides ... are pruned in
    /// a `before` run-loop phase" and the testable property in spec §8.
    pub fn prune_invalid_overrides(&mut self, current_data: &Value) {
        self.recurrence_overrides.retain(|_, patch| {
            patch
                .attribute_patches
                .keys()
                .all(|path| is_valid_patch(current_data, path))
        });
    }

    /// Translate every override id by `delta` (e.g. after the parent
    /// event's `start` is moved), preserving each override's payload.
    pub fn shift_overrides(&mut self, delta: ChronoDuration) {
        let shifted: BTreeMap<RecurrenceId, OverridePatch> = std::mem::take(&mut self.recurrence_overrides)
            .into_iter()
            .map(|(id, patch)| (id + delta, patch))
            .collect();
        self.recurrence_overrides = shifted;
        self.invalidate_occurrence_cache();
    }

    pub fn invalidate_occurrence_cache(&mut self) {
        self.occurrence_cache.clear();
    }

    fn safety_margin(&self) -> ChronoDuration {
        let cap = self
            .recurrence_rule
            .as_ref()
            .map(|rule| rule.frequency.cap())
            .unwrap_or_else(|| ChronoDuration::days(1));
        self.duration.min(cap)
    }

    /// For unbounded rules, the engine refuses to enumerate infinite sets
    /// and returns just `[start]`; for bounded rules (`count` or `until`),
    /// enumerate every rule-generated start, apply overrides, and sort
    /// ascending.
    /// Returns *recurrence ids* (each occurrence's original, unmoved start),
    /// not the overridden display start — a moved occurrence keeps its
    /// original id as its identity; `materialize_occurrence` is what
    /// resolves the actual displayed start from an override.
    pub fn all_start_dates(&self) -> Vec<DateTime<Utc>> {
        let mut starts: Vec<DateTime<Utc>> = match &self.recurrence_rule {
            Some(rule) if rule.is_bounded() => self.enumerate_bounded(rule),
            _ => vec![self.start],
        };

        // Genuine new RDATEs (ids the rule never generated) are added by
        // identity; EXDATEs on ids the rule generated were already skipped
        // during generation, so excluded ids never entered `starts`.
        for (id, patch) in &self.recurrence_overrides {
            if !patch.excluded && patch.is_rdate() && !starts.contains(id) {
                starts.push(*id);
            }
        }

        starts.sort();
        starts.dedup();
        starts
    }

    /// Generates the rule's series up to `count`/`until`. An excluded id
    /// does not consume a slot in `count` — the series keeps stepping
    /// until `count` *surviving* occurrences are found, matching spec §8
    /// scenario 6 (COUNT=4 with one EXDATE still yields 4 occurrences).
    fn enumerate_bounded(&self, rule: &RecurrenceRule) -> Vec<DateTime<Utc>> {
        let step = rule.step();
        let mut starts = Vec::new();
        let mut current = self.start;
        let mut count = 0u32;
        loop {
            if let Some(until) = rule.until {
                if current > until {
                    break;
                }
            }
            let excluded = self
                .recurrence_overrides
                .get(&current)
                .map(|patch| patch.excluded)
                .unwrap_or(false);
            if !excluded {
                starts.push(current);
                count += 1;
                if let Some(limit) = rule.count {
                    if count >= limit {
                        break;
                    }
                }
            }
            current += step;
        }
        starts
    }

    /// Occurrences whose start may fall within `[range_start, range_end)`,
    /// per spec §4.5's range-expansion algorithm: convert the range into
    /// the event's time zone (approximated here in UTC, since the engine's
    /// stored instants are already UTC-normalized), compute the safety
    /// margin, and either replay the precomputed bounded series or expand
    /// unbounded rule starts plus RDATE/EXDATE overrides.
    pub fn get_occurrences_that_may_be_in_date_range(
        &mut self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Vec<Occurrence> {
        let margin = self.safety_margin();
        let earliest_start = range_start - margin + ChronoDuration::seconds(1);

        let candidate_starts: Vec<DateTime<Utc>> = match &self.recurrence_rule {
            Some(rule) if rule.is_bounded() => self.all_start_dates(),
            Some(rule) => {
                let mut starts = self.enumerate_unbounded(rule, earliest_start, range_end);
                self.apply_overrides_to_range(&mut starts, range_start, range_end);
                starts
            }
            None => {
                let mut starts = vec![self.start];
                self.apply_overrides_to_range(&mut starts, range_start, range_end);
                starts
            }
        };

        candidate_starts
            .into_iter()
            .filter(|start| *start >= earliest_start && *start < range_end)
            .map(|start| self.materialize_occurrence(start))
            .collect()
    }

    fn enumerate_unbounded(
        &self,
        rule: &RecurrenceRule,
        earliest_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let step = rule.step();
        let mut starts = Vec::new();
        let mut current = self.start;

        if current < earliest_start && step > ChronoDuration::zero() {
            let behind = earliest_start - current;
            let steps = (behind.num_seconds() / step.num_seconds()).max(0);
            current += step * steps as i32;
        }

        while current < range_end {
            if current >= earliest_start {
                starts.push(current);
            }
            current += step;
        }
        starts
    }

    /// Add RDATEs (when inside the range, or when they alter the
    /// start/duration/timeZone) and remove EXDATEs, unioned by
    /// `recurrenceId`. Entries already present (generated by the rule
    /// itself) are moved-occurrence overrides, not new RDATEs, and are left
    /// for `materialize_occurrence` to resolve by identity.
    fn apply_overrides_to_range(
        &self,
        starts: &mut Vec<DateTime<Utc>>,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) {
        for (id, patch) in &self.recurrence_overrides {
            if patch.excluded {
                starts.retain(|s| *s != *id);
                continue;
            }
            if patch.is_rdate() && !starts.contains(id) {
                let effective = patch.start.unwrap_or(*id);
                let id_in_range = *id >= range_start && *id < range_end;
                let effective_in_range = effective >= range_start && effective < range_end;
                if id_in_range || effective_in_range {
                    starts.push(*id);
                }
            }
        }
        starts.sort();
        starts.dedup();
    }

    fn materialize_occurrence(&mut self, recurrence_id: RecurrenceId) -> Occurrence {
        if let Some(existing) = self.occurrence_cache.get(&recurrence_id) {
            return existing.clone();
        }
        let patch = self.recurrence_overrides.get(&recurrence_id);
        let start = patch.and_then(|p| p.start).unwrap_or(recurrence_id);
        let duration = patch.and_then(|p| p.duration).unwrap_or(self.duration);
        let occurrence = Occurrence {
            recurrence_id,
            start,
            duration,
        };
        self.occurrence_cache.insert(recurrence_id, occurrence.clone());
        occurrence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn recurrence_range_expansion_scenario() {
        // spec §8 scenario 6
        let mut event = Event::new(
            dt(2024, 6, 1, 10, 0),
            chrono_tz::UTC,
            ChronoDuration::hours(1),
            Some(RecurrenceRule {
                frequency: Frequency::Weekly,
                count: Some(4),
                until: None,
                interval: 1,
            }),
        );
        event.recurrence_overrides.insert(
            dt(2024, 6, 8, 10, 0),
            OverridePatch {
                excluded: true,
                ..Default::default()
            },
        );
        event.recurrence_overrides.insert(
            dt(2024, 6, 22, 10, 0),
            OverridePatch {
                start: Some(dt(2024, 6, 22, 11, 0)),
                ..Default::default()
            },
        );

        let occurrences = event.get_occurrences_that_may_be_in_date_range(
            dt(2024, 6, 1, 0, 0),
            dt(2024, 7, 1, 0, 0),
        );
        let mut starts: Vec<DateTime<Utc>> = occurrences.iter().map(|o| o.start).collect();
        starts.sort();

        assert_eq!(
            starts,
            vec![
                dt(2024, 6, 1, 10, 0),
                dt(2024, 6, 15, 10, 0),
                dt(2024, 6, 22, 11, 0),
                dt(2024, 6, 29, 10, 0),
            ]
        );
    }

    #[test]
    fn unbounded_rule_all_start_dates_refuses_to_enumerate() {
        let event = Event::new(
            dt(2024, 1, 1, 0, 0),
            chrono_tz::UTC,
            ChronoDuration::hours(1),
            Some(RecurrenceRule {
                frequency: Frequency::Daily,
                count: None,
                until: None,
                interval: 1,
            }),
        );
        assert_eq!(event.all_start_dates(), vec![dt(2024, 1, 1, 0, 0)]);
    }

    #[test]
    fn bounded_rule_all_start_dates_enumerates_and_sorts() {
        let event = Event::new(
            dt(2024, 1, 1, 0, 0),
            chrono_tz::UTC,
            ChronoDuration::hours(1),
            Some(RecurrenceRule {
                frequency: Frequency::Daily,
                count: Some(3),
                until: None,
                interval: 1,
            }),
        );
        assert_eq!(
            event.all_start_dates(),
            vec![dt(2024, 1, 1, 0, 0), dt(2024, 1, 2, 0, 0), dt(2024, 1, 3, 0, 0)]
        );
    }

    #[test]
    fn occurrence_identity_is_memoized() {
        let mut event = Event::new(
            dt(2024, 1, 1, 0, 0),
            chrono_tz::UTC,
            ChronoDuration::hours(1),
            None,
        );
        let first = event.materialize_occurrence(dt(2024, 1, 1, 0, 0));
        let second = event.materialize_occurrence(dt(2024, 1, 1, 0, 0));
        assert_eq!(first, second);
    }

    #[test]
    fn invalidate_occurrence_cache_clears_memoized_handles() {
        let mut event = Event::new(
            dt(2024, 1, 1, 0, 0),
            chrono_tz::UTC,
            ChronoDuration::hours(1),
            None,
        );
        event.materialize_occurrence(dt(2024, 1, 1, 0, 0));
        assert_eq!(event.occurrence_cache.len(), 1);
        event.invalidate_occurrence_cache();
        assert!(event.occurrence_cache.is_empty());
    }

    #[test]
    fn shift_overrides_translates_ids_by_delta() {
        let mut event = Event::new(
            dt(2024, 1, 1, 0, 0),
            chrono_tz::UTC,
            ChronoDuration::hours(1),
            None,
        );
        event.recurrence_overrides.insert(
            dt(2024, 1, 1, 0, 0),
            OverridePatch {
                excluded: true,
                ..Default::default()
            },
        );
        event.shift_overrides(ChronoDuration::hours(2));
        assert!(event.recurrence_overrides.contains_key(&dt(2024, 1, 1, 2, 0)));
    }

    #[test]
    fn invalid_override_pruning_scenario() {
        let mut event = Event::new(
            dt(2024, 1, 1, 0, 0),
            chrono_tz::UTC,
            ChronoDuration::hours(1),
            None,
        );
        event.recurrence_overrides.insert(
            dt(2024, 1, 1, 0, 0),
            OverridePatch {
                attribute_patches: BTreeMap::from([("/locations/loc1/name".to_string(), None)]),
                ..Default::default()
            },
        );
        let current_data = serde_json::json!({"locations": {}});
        event.prune_invalid_overrides(&current_data);
        assert!(event.recurrence_overrides.is_empty());
    }
}
