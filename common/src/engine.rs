use chrono::{DateTime, FixedOffset, NaiveDate, Timelike};
use log::info;

use crate::{
    actuator::ValveState,
    config::DEFAULT_MANUAL_DURATION_MS,
    schedule::{DayRule, RuleUpdate, ScheduleSlot, WeeklySchedule},
    types::{RunPhase, SprinklerStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running { remaining_ms: u64, last_tick_ms: u64 },
    Paused { remaining_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TriggerMinute {
    date: NaiveDate,
    hour: u32,
    minute: u32,
}

impl TriggerMinute {
    fn of(now: DateTime<FixedOffset>) -> Self {
        Self {
            date: now.date_naive(),
            hour: now.hour(),
            minute: now.minute(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleEngine {
    schedule: WeeklySchedule,
    run: RunState,
    manual_duration_ms: u32,
    cycles: u32,
    last_trigger: Option<TriggerMinute>,
}

impl ScheduleEngine {
    pub fn new(schedule: WeeklySchedule) -> Self {
        Self {
            schedule,
            run: RunState::Idle,
            manual_duration_ms: 0,
            cycles: 0,
            last_trigger: None,
        }
    }

    pub fn schedule(&self) -> &WeeklySchedule {
        &self.schedule
    }

    pub fn run_state(&self) -> RunState {
        self.run
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn desired(&self) -> ValveState {
        match self.run {
            RunState::Running { .. } => ValveState::On,
            RunState::Idle | RunState::Paused { .. } => ValveState::Off,
        }
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        match self.run {
            RunState::Idle => 0,
            RunState::Paused { remaining_ms } => remaining_ms,
            RunState::Running {
                remaining_ms,
                last_tick_ms,
            } => remaining_ms.saturating_sub(now_ms.saturating_sub(last_tick_ms)),
        }
    }

    /// Advances the countdown and fires any rule due at `wall_clock`. Rules only fire
    /// once the wall clock is known.
    pub fn evaluate(
        &mut self,
        now_ms: u64,
        wall_clock: Option<DateTime<FixedOffset>>,
    ) -> ValveState {
        self.advance_countdown(now_ms);

        if let Some(now) = wall_clock {
            self.fire_due_rule(now, now_ms);
        }

        self.desired()
    }

    pub fn start(
        &mut self,
        now_ms: u64,
        duration_override_ms: Option<u32>,
        cycles: Option<u32>,
    ) -> ValveState {
        if let Some(duration_ms) = duration_override_ms {
            self.manual_duration_ms = duration_ms;
        }
        self.cycles = cycles.unwrap_or(0);

        let duration_ms = self.effective_manual_duration_ms();
        info!(
            "manual run started for {}s ({} cycles)",
            duration_ms / 1_000,
            self.cycles
        );
        self.run = RunState::Running {
            remaining_ms: duration_ms as u64,
            last_tick_ms: now_ms,
        };
        self.desired()
    }

    pub fn stop(&mut self) -> ValveState {
        if self.run != RunState::Idle {
            info!("run stopped");
        }
        self.run = RunState::Idle;
        self.desired()
    }

    pub fn pause(&mut self, now_ms: u64) -> ValveState {
        if let RunState::Running { .. } = self.run {
            let remaining_ms = self.remaining_ms(now_ms);
            self.run = if remaining_ms == 0 {
                RunState::Idle
            } else {
                info!("run paused with {}s remaining", remaining_ms / 1_000);
                RunState::Paused { remaining_ms }
            };
        }
        self.desired()
    }

    pub fn resume(&mut self, now_ms: u64) -> ValveState {
        if let RunState::Paused { remaining_ms } = self.run {
            info!("run resumed with {}s remaining", remaining_ms / 1_000);
            self.run = RunState::Running {
                remaining_ms,
                last_tick_ms: now_ms,
            };
        }
        self.desired()
    }

    pub fn set_rule(&mut self, slot: ScheduleSlot, update: RuleUpdate) -> DayRule {
        let rule = self.schedule.set_rule(slot, update);
        info!(
            "{} rule set: enabled={} at {:02}:{:02} for {}s",
            slot.as_str(),
            rule.enabled,
            rule.hour,
            rule.minute,
            rule.duration_ms / 1_000
        );
        rule
    }

    pub fn reset(&mut self) {
        self.schedule.reset();
        self.run = RunState::Idle;
        self.manual_duration_ms = 0;
        self.cycles = 0;
        self.last_trigger = None;
    }

    pub fn status(
        &self,
        now_ms: u64,
        wall_clock: Option<DateTime<FixedOffset>>,
        timezone: &str,
    ) -> SprinklerStatus {
        let remaining_ms = self.remaining_ms(now_ms);
        let phase = match self.run {
            RunState::Idle => RunPhase::Idle,
            RunState::Running { .. } => RunPhase::Running,
            RunState::Paused { .. } => RunPhase::Paused,
        };

        SprinklerStatus {
            state: phase,
            valve_on: self.desired().is_on(),
            remaining_ms,
            remaining_min: remaining_ms / 60_000,
            duration_ms: self.effective_manual_duration_ms(),
            cycles: self.cycles,
            next_run_epoch: wall_clock.and_then(|now| self.schedule.next_run_epoch(now)),
            time_synced: wall_clock.is_some(),
            timezone: timezone.to_string(),
        }
    }

    fn effective_manual_duration_ms(&self) -> u32 {
        let everyday = self.schedule.rule(ScheduleSlot::Everyday).duration_ms;
        [self.manual_duration_ms, everyday]
            .into_iter()
            .find(|duration| *duration > 0)
            .unwrap_or(DEFAULT_MANUAL_DURATION_MS)
    }

    fn advance_countdown(&mut self, now_ms: u64) {
        if let RunState::Running { .. } = self.run {
            let remaining_ms = self.remaining_ms(now_ms);
            if remaining_ms == 0 {
                info!("run complete");
                self.run = RunState::Idle;
                self.cycles = 0;
            } else {
                self.run = RunState::Running {
                    remaining_ms,
                    last_tick_ms: now_ms,
                };
            }
        }
    }

    fn fire_due_rule(&mut self, now: DateTime<FixedOffset>, now_ms: u64) {
        let Some((slot, rule)) = self.schedule.due(now) else {
            return;
        };

        let minute = TriggerMinute::of(now);
        if self.last_trigger == Some(minute) {
            return;
        }
        self.last_trigger = Some(minute);

        if self.run != RunState::Idle {
            info!("{} rule due while a run is active; ignored", slot.as_str());
            return;
        }
        if rule.duration_ms == 0 {
            info!("{} rule due with zero duration; skipped", slot.as_str());
            return;
        }

        info!(
            "{} rule fired for {}s",
            slot.as_str(),
            rule.duration_ms / 1_000
        );
        self.cycles = 0;
        self.run = RunState::Running {
            remaining_ms: rule.duration_ms as u64,
            last_tick_ms: now_ms,
        };
    }
}
