use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// Rule slots in persisted order: the everyday rule, then Sunday through Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleSlot {
    Everyday,
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl ScheduleSlot {
    pub const ALL: [ScheduleSlot; 8] = [
        Self::Everyday,
        Self::Sun,
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Everyday => 0,
            Self::Sun => 1,
            Self::Mon => 2,
            Self::Tue => 3,
            Self::Wed => 4,
            Self::Thu => 5,
            Self::Fri => 6,
            Self::Sat => 7,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Everyday => "everyday",
            Self::Sun => "sun",
            Self::Mon => "mon",
            Self::Tue => "tue",
            Self::Wed => "wed",
            Self::Thu => "thu",
            Self::Fri => "fri",
            Self::Sat => "sat",
        }
    }
}

impl FromStr for ScheduleSlot {
    type Err = RuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|slot| slot.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| RuleError::Day(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRule {
    pub enabled: bool,
    pub hour: u8,
    pub minute: u8,
    #[serde(rename = "durationMs")]
    pub duration_ms: u32,
}

impl DayRule {
    pub fn start_minutes(&self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }
}

/// Partial rule update; `None` leaves the field as it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleUpdate {
    pub hour: Option<u8>,
    pub minute: Option<u8>,
    pub duration_ms: Option<u32>,
    pub enabled: Option<bool>,
}

impl RuleUpdate {
    /// Builds an update from raw API values where `-1` (or absence) means unchanged.
    /// Durations arrive in minutes.
    pub fn from_api(
        hour: Option<i64>,
        minute: Option<i64>,
        duration_min: Option<i64>,
        enabled: Option<i64>,
    ) -> Result<Self, RuleError> {
        let hour = match unchanged_if_unset(hour) {
            None => None,
            Some(h) if (0..24).contains(&h) => Some(h as u8),
            Some(h) => return Err(RuleError::Hour(h)),
        };
        let minute = match unchanged_if_unset(minute) {
            None => None,
            Some(m) if (0..60).contains(&m) => Some(m as u8),
            Some(m) => return Err(RuleError::Minute(m)),
        };
        let duration_ms = match unchanged_if_unset(duration_min) {
            None => None,
            Some(d) => Some(
                u32::try_from(d)
                    .ok()
                    .and_then(|minutes| minutes.checked_mul(60_000))
                    .ok_or(RuleError::Duration(d))?,
            ),
        };
        let enabled = match unchanged_if_unset(enabled) {
            None => None,
            Some(0) => Some(false),
            Some(e) if e > 0 => Some(true),
            Some(e) => return Err(RuleError::Enabled(e)),
        };

        Ok(Self {
            hour,
            minute,
            duration_ms,
            enabled,
        })
    }

    pub fn apply(&self, rule: &mut DayRule) {
        if let Some(hour) = self.hour {
            rule.hour = hour;
        }
        if let Some(minute) = self.minute {
            rule.minute = minute;
        }
        if let Some(duration_ms) = self.duration_ms {
            rule.duration_ms = duration_ms;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
    }
}

fn unchanged_if_unset(value: Option<i64>) -> Option<i64> {
    value.filter(|v| *v != -1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeeklySchedule {
    rules: [DayRule; 8],
}

impl WeeklySchedule {
    pub fn from_rules(rules: [DayRule; 8]) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[DayRule; 8] {
        &self.rules
    }

    pub fn rule(&self, slot: ScheduleSlot) -> DayRule {
        self.rules[slot.index()]
    }

    pub fn set_rule(&mut self, slot: ScheduleSlot, update: RuleUpdate) -> DayRule {
        let rule = &mut self.rules[slot.index()];
        update.apply(rule);
        *rule
    }

    /// The rule governing `weekday`: its own rule when enabled, otherwise the everyday rule.
    pub fn applicable(&self, weekday: Weekday) -> Option<(ScheduleSlot, DayRule)> {
        let slot = ScheduleSlot::from_chrono(weekday);
        let day_rule = self.rule(slot);
        if day_rule.enabled {
            return Some((slot, day_rule));
        }

        let everyday = self.rule(ScheduleSlot::Everyday);
        everyday
            .enabled
            .then_some((ScheduleSlot::Everyday, everyday))
    }

    /// Rule whose start minute is exactly `now`'s hour:minute.
    pub fn due(&self, now: DateTime<FixedOffset>) -> Option<(ScheduleSlot, DayRule)> {
        self.applicable(now.weekday()).filter(|(_, rule)| {
            rule.hour as u32 == now.hour() && rule.minute as u32 == now.minute()
        })
    }

    pub fn next_run_epoch(&self, now: DateTime<FixedOffset>) -> Option<i64> {
        let now_minute = now.hour() as i64 * 60 + now.minute() as i64;

        for day_offset in 0..=7i64 {
            let date = now.date_naive() + Duration::days(day_offset);
            let Some((_, rule)) = self.applicable(date.weekday()) else {
                continue;
            };
            if rule.duration_ms == 0 {
                continue;
            }
            if day_offset == 0 && rule.start_minutes() as i64 <= now_minute {
                continue;
            }

            let Some(naive) = date.and_hms_opt(rule.hour as u32, rule.minute as u32, 0) else {
                continue;
            };
            if let Some(candidate) = now.offset().from_local_datetime(&naive).single() {
                return Some(candidate.timestamp());
            }
        }

        None
    }

    pub fn reset(&mut self) {
        self.rules = [DayRule::default(); 8];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn rule(hour: u8, minute: u8, minutes: u32) -> DayRule {
        DayRule {
            enabled: true,
            hour,
            minute,
            duration_ms: minutes * 60_000,
        }
    }

    #[test]
    fn slot_parses_path_segments() {
        assert_eq!("mon".parse::<ScheduleSlot>(), Ok(ScheduleSlot::Mon));
        assert_eq!("SAT".parse::<ScheduleSlot>(), Ok(ScheduleSlot::Sat));
        assert_eq!(
            "funday".parse::<ScheduleSlot>(),
            Err(RuleError::Day("funday".to_string()))
        );
        assert_eq!(ScheduleSlot::Sun.index(), 1);
        assert_eq!(ScheduleSlot::Sat.index(), 7);
    }

    #[test]
    fn partial_update_leaves_unset_fields() {
        let mut schedule = WeeklySchedule::default();
        schedule.set_rule(
            ScheduleSlot::Mon,
            RuleUpdate {
                hour: Some(6),
                minute: Some(30),
                duration_ms: Some(600_000),
                enabled: Some(false),
            },
        );

        let update = RuleUpdate::from_api(Some(-1), Some(5), Some(-1), Some(1)).unwrap();
        let result = schedule.set_rule(ScheduleSlot::Mon, update);

        assert_eq!(
            result,
            DayRule {
                enabled: true,
                hour: 6,
                minute: 5,
                duration_ms: 600_000,
            }
        );
    }

    #[test]
    fn api_update_rejects_out_of_range() {
        assert_eq!(
            RuleUpdate::from_api(Some(24), None, None, None),
            Err(RuleError::Hour(24))
        );
        assert_eq!(
            RuleUpdate::from_api(None, Some(60), None, None),
            Err(RuleError::Minute(60))
        );
        assert_eq!(
            RuleUpdate::from_api(None, None, Some(-5), None),
            Err(RuleError::Duration(-5))
        );
        assert_eq!(
            RuleUpdate::from_api(None, None, None, Some(-2)),
            Err(RuleError::Enabled(-2))
        );
        assert_eq!(
            RuleUpdate::from_api(None, None, None, None),
            Ok(RuleUpdate::default())
        );
    }

    #[test]
    fn day_rule_takes_precedence_over_everyday() {
        let mut rules = [DayRule::default(); 8];
        rules[ScheduleSlot::Everyday.index()] = rule(6, 0, 5);
        rules[ScheduleSlot::Mon.index()] = rule(6, 0, 20);
        let schedule = WeeklySchedule::from_rules(rules);

        // Jan 5, 2026 is a Monday.
        let (slot, due) = schedule.due(fixed_time(5, 6, 0)).unwrap();
        assert_eq!(slot, ScheduleSlot::Mon);
        assert_eq!(due.duration_ms, 20 * 60_000);

        // Tuesday falls back to the everyday rule.
        let (slot, due) = schedule.due(fixed_time(6, 6, 0)).unwrap();
        assert_eq!(slot, ScheduleSlot::Everyday);
        assert_eq!(due.duration_ms, 5 * 60_000);
    }

    #[test]
    fn enabled_day_rule_suppresses_everyday_at_other_times() {
        let mut rules = [DayRule::default(); 8];
        rules[ScheduleSlot::Everyday.index()] = rule(6, 0, 5);
        rules[ScheduleSlot::Mon.index()] = rule(19, 30, 20);
        let schedule = WeeklySchedule::from_rules(rules);

        assert!(schedule.due(fixed_time(5, 6, 0)).is_none());
        assert!(schedule.due(fixed_time(5, 19, 30)).is_some());
        assert!(schedule.due(fixed_time(5, 19, 31)).is_none());
    }

    #[test]
    fn disabled_rules_never_fire() {
        let mut rules = [DayRule::default(); 8];
        rules[ScheduleSlot::Mon.index()] = DayRule {
            enabled: false,
            ..rule(6, 0, 5)
        };
        let schedule = WeeklySchedule::from_rules(rules);

        assert!(schedule.due(fixed_time(5, 6, 0)).is_none());
        assert!(schedule.next_run_epoch(fixed_time(5, 5, 0)).is_none());
    }

    #[test]
    fn finds_next_run_later_in_week() {
        let mut rules = [DayRule::default(); 8];
        rules[ScheduleSlot::Wed.index()] = rule(7, 15, 10);
        let schedule = WeeklySchedule::from_rules(rules);

        let next = schedule.next_run_epoch(fixed_time(5, 9, 0)).unwrap();
        assert_eq!(next, fixed_time(7, 7, 15).timestamp());

        // Past today's start on Wednesday, the next run is a week out.
        let next = schedule.next_run_epoch(fixed_time(7, 8, 0)).unwrap();
        assert_eq!(next, fixed_time(14, 7, 15).timestamp());
    }
}
