//! Channel control-loop tests: full cycle sequencing, safety aborts and
//! the per-phase charge controls, all against the register simulator with
//! the tokio clock paused so rests and retry delays cost nothing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{SimBehavior, SimUnit};
use tempfile::TempDir;
use tokio::sync::watch;
use voltage_cycler::constants::{cell, ns, unit, MODE_DISCHARGE, MODE_IDLE, MODE_STOPPED};
use voltage_cycler::{codec, Channel, CyclerError, Device, LogSink, Settings, TestState, TestType};

struct Rig {
    sim: SimUnit,
    device: Arc<Device>,
    channel: Channel,
    sink: LogSink,
    _dir: TempDir,
}

async fn rig(behavior: SimBehavior, tweak: impl FnOnce(&mut Settings)) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.log_directory = dir.path().to_path_buf();
    settings.rest_period = 0.0;
    settings.impedance_reporting_period = 0.0;
    tweak(&mut settings);
    let (sim, link) = SimUnit::spawn(behavior);
    let sink = LogSink::new();
    let device = Device::connect(link, "sim0", sink.clone(), Arc::new(settings))
        .await
        .unwrap();
    let channel = Channel::spawn(Arc::clone(&device), 0);
    Rig {
        sim,
        device,
        channel,
        sink,
        _dir: dir,
    }
}

/// Collect every published state until the channel goes idle.
async fn states_until_idle(rx: &mut watch::Receiver<TestState>) -> Vec<TestState> {
    let mut seen = Vec::new();
    loop {
        rx.changed().await.unwrap();
        let state = *rx.borrow();
        seen.push(state);
        if state == TestState::Idle {
            return seen;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn cycle_test_walks_every_phase_per_cycle() {
    let rig = rig(
        SimBehavior {
            instant_stop: true,
            ..SimBehavior::default()
        },
        |s| s.num_measurement_cycles = 2,
    )
    .await;
    let mut rx = rig.channel.watch_state();
    rig.channel
        .start_test("CELL_A", TestType::Cycle, None)
        .await
        .unwrap();

    let seen = states_until_idle(&mut rx).await;
    assert_eq!(
        seen,
        vec![
            TestState::PreCharge,
            TestState::ChargeRest,
            TestState::Discharge,
            TestState::DischargeRest,
            TestState::Charge,
            TestState::ChargeRest,
            TestState::Discharge,
            TestState::DischargeRest,
            TestState::Charge,
            TestState::Idle,
        ]
    );

    // one telemetry row per tick plus one summary per transition,
    // every row a well-formed 19-column line
    rig.sink.flush().await;
    let settings = rig.device.settings().await;
    let contents = std::fs::read_to_string(settings.logfile()).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 18);
    assert!(lines.iter().all(|l| l.split(',').count() == 19));
    assert!(lines.iter().any(|l| l.contains(",PRECHARGE,")));
}

#[tokio::test(start_paused = true)]
async fn storage_discharge_appends_post_discharge_tail() {
    let rig = rig(
        SimBehavior {
            instant_stop: true,
            ..SimBehavior::default()
        },
        |s| s.storage_discharge = true,
    )
    .await;
    let mut rx = rig.channel.watch_state();
    rig.channel
        .start_test("CELL_B", TestType::Cycle, None)
        .await
        .unwrap();

    let seen = states_until_idle(&mut rx).await;
    assert_eq!(
        seen,
        vec![
            TestState::PreCharge,
            TestState::ChargeRest,
            TestState::Discharge,
            TestState::DischargeRest,
            TestState::Charge,
            TestState::PostDischarge,
            TestState::Idle,
        ]
    );
    assert_eq!(rig.sim.get_register(0, cell::MODE).await, MODE_STOPPED);
}

#[tokio::test(start_paused = true)]
async fn collapsed_supply_rail_aborts_after_two_ticks() {
    let rig = rig(SimBehavior::default(), |_| {}).await;
    rig.sim
        .set_register(ns::UNIT, unit::VCC, codec::encode_vcc(4.0))
        .await;
    let mut rx = rig.channel.watch_state();
    rig.channel
        .start_test("CELL_C", TestType::Discharge, None)
        .await
        .unwrap();

    let seen = states_until_idle(&mut rx).await;
    assert_eq!(seen.len(), 3); // discharge, discharge, idle
    assert_eq!(rig.sim.get_register(0, cell::MODE).await, MODE_STOPPED);
}

#[tokio::test(start_paused = true)]
async fn voltage_drop_with_stable_current_aborts() {
    let rig = rig(SimBehavior::default(), |_| {}).await;
    // big drop each tick while the current register never moves
    rig.sim
        .script_reads(
            0,
            cell::VOLTAGE,
            [3.5, 3.2, 2.9, 2.6, 2.3, 2.0].map(codec::encode_voltage),
        )
        .await;
    let mut rx = rig.channel.watch_state();
    rig.channel
        .start_test("CELL_D", TestType::Discharge, None)
        .await
        .unwrap();

    let seen = states_until_idle(&mut rx).await;
    assert_eq!(*seen.last().unwrap(), TestState::Idle);
    assert_eq!(rig.sim.get_register(0, cell::MODE).await, MODE_STOPPED);
}

#[tokio::test(start_paused = true)]
async fn discharge_timeout_stops_the_firmware() {
    let rig = rig(SimBehavior::default(), |_| {}).await;
    let mut rx = rig.channel.watch_state();
    rig.channel
        .start_test("CELL_E", TestType::Discharge, Some(Duration::from_secs(3)))
        .await
        .unwrap();

    let seen = states_until_idle(&mut rx).await;
    assert_eq!(*seen.last().unwrap(), TestState::Idle);
    let mode_writes = rig.sim.writes_to(0, cell::MODE).await;
    assert!(mode_writes.contains(&MODE_STOPPED));
    // start_test settles the slot to idle for cell detection before
    // commanding the discharge
    assert_eq!(&mode_writes[..2], &[MODE_IDLE, MODE_DISCHARGE]);
}

#[tokio::test(start_paused = true)]
async fn trickle_latches_once_near_the_engage_voltage() {
    let rig = rig(SimBehavior::default(), |s| {
        s.trickle_enable = true;
        // cell sits at 3.8 V, already past the engage point
        s.trickle_chrg_engage_voltage = 3.0;
        s.trickle_chrg_rate = 0.5;
    })
    .await;
    let mut rx = rig.channel.watch_state();
    rig.channel
        .start_test("CELL_F", TestType::Cycle, None)
        .await
        .unwrap();

    // a few precharge ticks
    for _ in 0..4 {
        rx.changed().await.unwrap();
    }
    let writes = rig.sim.writes_to(0, cell::CURRENT_SETPOINT).await;
    assert_eq!(
        writes,
        vec![0, codec::encode_setpoint(2.0), codec::encode_setpoint(0.5)]
    );
    rig.channel.end_test().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn constant_voltage_taper_walks_the_setpoint_down() {
    let rig = rig(SimBehavior::default(), |s| {
        s.constant_voltage_enable = true;
    })
    .await;
    rig.sim
        .set_register(0, cell::VOLTAGE, codec::encode_voltage(4.19))
        .await;
    let mut rx = rig.channel.watch_state();
    rig.channel
        .start_test("CELL_G", TestType::Cycle, None)
        .await
        .unwrap();

    for _ in 0..3 {
        rx.changed().await.unwrap();
    }
    // precharge setpoint was 256; each tick shaves one LSB
    assert!(rig.device.setpoint_shadow(0).await < 256);
    let writes = rig.sim.writes_to(0, cell::CURRENT_SETPOINT).await;
    assert_eq!(&writes[..4], &[0, 256, 255, 254]);
    rig.channel.end_test().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn pulse_charge_toggles_between_rates() {
    let rig = rig(SimBehavior::default(), |s| {
        s.pulse_enable = true;
        s.pulse_chrg_on_time = 1.5;
        s.pulse_chrg_off_time = 1.5;
        s.pulse_chrg_off_rate = 0.0;
    })
    .await;
    let mut rx = rig.channel.watch_state();
    rig.channel
        .start_test("CELL_H", TestType::Cycle, None)
        .await
        .unwrap();

    for _ in 0..5 {
        rx.changed().await.unwrap();
    }
    let writes = rig.sim.writes_to(0, cell::CURRENT_SETPOINT).await;
    // start pre-zero + precharge rate, then off-pulse, then back on at the
    // charge rate
    assert_eq!(&writes[..4], &[0, 256, 0, 256]);
    rig.channel.end_test().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn empty_slot_refuses_to_start() {
    let rig = rig(
        SimBehavior {
            no_cell: [true, false, false, false],
            ..SimBehavior::default()
        },
        |_| {},
    )
    .await;
    let err = rig
        .channel
        .start_test("CELL_I", TestType::Cycle, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CyclerError::NoCellDetected(0)));
    assert_eq!(rig.channel.state(), TestState::Idle);
}

#[tokio::test(start_paused = true)]
async fn second_start_is_refused_while_testing() {
    let rig = rig(SimBehavior::default(), |_| {}).await;
    rig.channel
        .start_test("CELL_J", TestType::Discharge, None)
        .await
        .unwrap();
    let err = rig
        .channel
        .start_test("CELL_J", TestType::Discharge, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CyclerError::TestAlreadyRunning(0)));
    rig.channel.end_test().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn end_test_stops_the_firmware_and_idles() {
    let rig = rig(SimBehavior::default(), |_| {}).await;
    let mut rx = rig.channel.watch_state();
    rig.channel
        .start_test("CELL_K", TestType::Discharge, None)
        .await
        .unwrap();
    rx.changed().await.unwrap(); // test accepted and running
    rig.channel.end_test().await.unwrap();
    assert_eq!(rig.channel.state(), TestState::Idle);
    assert_eq!(rig.sim.get_register(0, cell::MODE).await, MODE_STOPPED);
    assert!(!rig.channel.is_testing());
}
