use chrono::{DateTime, FixedOffset, TimeZone};
use pretty_assertions::assert_eq;
use sprinkler_common::{
    config::STORAGE_SIZE, sim::SimulatedValve, MemoryStorage, RuleUpdate, RunPhase, RunState,
    ScheduleSlot, SprinklerApp, StartQuery, ValveState,
};

fn boot() -> SprinklerApp<MemoryStorage, SimulatedValve> {
    SprinklerApp::boot(
        MemoryStorage::new(STORAGE_SIZE),
        SimulatedValve::default(),
        7,
    )
}

fn local(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(2 * 3600)
        .unwrap()
        .with_ymd_and_hms(2026, 6, day, hour, minute, second)
        .unwrap()
}

#[test]
fn manual_run_closes_valve_when_countdown_ends() {
    let mut app = boot();

    app.start(
        5_000,
        StartQuery {
            t: Some(10),
            z: None,
        },
    );
    assert_eq!(
        app.engine().run_state(),
        RunState::Running {
            remaining_ms: 600_000,
            last_tick_ms: 5_000
        }
    );
    assert_eq!(app.actuator().state(), ValveState::On);

    assert_eq!(app.tick(605_000, None), ValveState::Off);
    assert_eq!(app.engine().run_state(), RunState::Idle);
    assert_eq!(app.actuator().state(), ValveState::Off);
}

#[test]
fn paused_run_does_not_count_down() {
    let mut app = boot();
    app.start(
        0,
        StartQuery {
            t: Some(2),
            z: Some(3),
        },
    );

    app.tick(30_000, None);
    app.pause(60_000);
    app.pause(90_000);
    app.tick(200_000, None);

    let status = app.status(200_000, None, "UTC");
    assert_eq!(status.state, RunPhase::Paused);
    assert_eq!(status.remaining_ms, 60_000);
    assert_eq!(status.cycles, 3);
    assert!(!status.valve_on);

    app.resume(200_000);
    assert_eq!(app.actuator().state(), ValveState::On);
    assert_eq!(app.tick(260_000, None), ValveState::Off);
    assert_eq!(
        app.actuator().history(),
        &[ValveState::On, ValveState::Off, ValveState::On, ValveState::Off]
    );
}

#[test]
fn weekday_rule_overrides_everyday_rule() {
    let mut app = boot();
    app.update_rule(
        ScheduleSlot::Everyday,
        RuleUpdate::from_api(Some(6), Some(0), Some(5), Some(1)).unwrap(),
    )
    .unwrap();
    app.update_rule(
        ScheduleSlot::Mon,
        RuleUpdate::from_api(Some(6), Some(0), Some(20), Some(1)).unwrap(),
    )
    .unwrap();

    // June 1, 2026 is a Monday.
    app.tick(0, Some(local(1, 5, 59, 59)));
    assert_eq!(app.actuator().state(), ValveState::Off);

    app.tick(1_000, Some(local(1, 6, 0, 0)));
    assert_eq!(app.engine().remaining_ms(1_000), 20 * 60_000);

    // Tuesday runs the everyday rule.
    app.stop();
    app.tick(2_000, Some(local(2, 6, 0, 0)));
    assert_eq!(app.engine().remaining_ms(2_000), 5 * 60_000);

    let status = app.status(2_000, Some(local(2, 6, 0, 0)), "Europe/Berlin");
    assert_eq!(status.next_run_epoch, Some(local(3, 6, 0, 0).timestamp()));
    assert!(status.time_synced);
}

#[test]
fn partial_rule_update_changes_only_given_fields() {
    let mut app = boot();
    app.update_rule(
        ScheduleSlot::Mon,
        RuleUpdate::from_api(Some(7), Some(45), Some(12), Some(0)).unwrap(),
    )
    .unwrap();

    let rule = app
        .update_rule(
            ScheduleSlot::Mon,
            RuleUpdate::from_api(Some(-1), Some(5), Some(-1), Some(1)).unwrap(),
        )
        .unwrap();

    assert_eq!(rule.hour, 7);
    assert_eq!(rule.minute, 5);
    assert_eq!(rule.duration_ms, 12 * 60_000);
    assert!(rule.enabled);
}
