//! Per-slot test control loop.
//!
//! Each channel runs one tokio task that ticks at the reporting period:
//! software current compensation, watchdog feed, telemetry sampling, the
//! safety interlocks, and the cycle-test state machine. Commands arrive
//! over an mpsc queue and the current `TestState` is published through a
//! watch channel.
//!
//! Tick errors never kill the loop: recoverable errors log, back off and
//! continue, so a flaky sample cannot orphan a cell mid-charge. Losing the
//! serial link idles the channel and ends the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::codec;
use crate::constants::{
    cell, COMPENSATION_DEAD_BAND, COMPENSATION_PIN_THRESHOLD, COMPENSATION_SATURATION,
    CURRENT_STABLE_BAND, MODE_CHARGE, MODE_DISCHARGE, MODE_IDLE, MODE_NO_CELL, MODE_STOPPED,
    RELAY_DELAY, SETPOINT_MAX_RAW, TICK_ERROR_BACKOFF, VCC_HARD_FLOOR, VCC_SOFT_FLOOR,
    VOLTAGE_FAULT_DELTA, VOLTAGE_FAULT_TICKS,
};
use crate::device::Device;
use crate::error::{CyclerError, CyclerResult};
use crate::frame::Namespace;
use crate::logging::{SummaryRow, TelemetryRow};
use crate::settings::Settings;

/// Kind of test to run on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestType {
    /// Charge/discharge cycling with rests and summary rows per phase.
    Cycle,
    /// Single discharge to the low-voltage cutoff.
    Discharge,
}

/// Test state machine position. `Idle` means no test is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    Idle,
    PreCharge,
    Charge,
    ChargeRest,
    Discharge,
    DischargeRest,
    PostDischarge,
}

impl TestState {
    /// Label used in telemetry and summary rows.
    pub fn label(self) -> &'static str {
        match self {
            TestState::Idle => "IDLE",
            TestState::PreCharge => "PRECHARGE",
            TestState::Charge => "CHARGE",
            TestState::ChargeRest => "CHARGEREST",
            TestState::Discharge => "DISCHARGE",
            TestState::DischargeRest => "DISCHARGEREST",
            TestState::PostDischarge => "POSTDISCHARGE",
        }
    }
}

enum Command {
    Start(Box<ActiveTest>, oneshot::Sender<()>),
    End(oneshot::Sender<CyclerResult<()>>),
}

/// Handle to one channel's control loop.
pub struct Channel {
    device: Arc<Device>,
    slot: usize,
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<TestState>,
    cancel: CancellationToken,
}

impl Channel {
    /// Spawn the control loop for one slot.
    pub fn spawn(device: Arc<Device>, slot: usize) -> Channel {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(TestState::Idle);
        let cancel = CancellationToken::new();
        let control = ChannelLoop {
            device: Arc::clone(&device),
            slot,
            test: None,
            state_tx,
        };
        tokio::spawn(control.run(cmd_rx, cancel.clone()));
        Channel {
            device,
            slot,
            commands: cmd_tx,
            state_rx,
            cancel,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> TestState {
        *self.state_rx.borrow()
    }

    pub fn is_testing(&self) -> bool {
        self.state() != TestState::Idle
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<TestState> {
        self.state_rx.clone()
    }

    /// Configure the channel and start a test.
    ///
    /// Captures a settings snapshot, writes every limit register with
    /// verification, then kicks the firmware into the first phase. Refuses
    /// when a test is already running or no cell is seated in the slot.
    pub async fn start_test(
        &self,
        cell_name: impl Into<String>,
        test_type: TestType,
        timeout: Option<Duration>,
    ) -> CyclerResult<()> {
        if self.is_testing() {
            return Err(CyclerError::TestAlreadyRunning(self.slot));
        }
        let settings = self.device.settings().await;
        let ns = Namespace::cell(self.slot);
        let calibration = self.device.calibration().await;
        let r = calibration.r[self.slot];
        let b = calibration.b[self.slot];

        // The configuration sequence holds the unit critical section so a
        // sibling channel's tick cannot interleave its own writes.
        let cs = self.device.critical_section().await;

        self.device.write(ns, cell::MODE, i32::from(MODE_IDLE)).await?;
        let mode = self.device.read(ns, cell::MODE).await?;
        if mode.value() == Some(MODE_NO_CELL) {
            return Err(CyclerError::NoCellDetected(self.slot));
        }

        // Limit registers are the hardware safety net; every one of them
        // must be confirmed on the device before any current flows.
        self.device
            .write_verify(
                ns,
                cell::VOLTAGE_LIMIT_CHG,
                i32::from(codec::encode_voltage(settings.high_voltage_cutoff)),
            )
            .await?;
        self.device
            .write_verify(
                ns,
                cell::VOLTAGE_LIMIT_DCHG,
                i32::from(codec::encode_voltage(settings.low_voltage_cutoff)),
            )
            .await?;
        self.device
            .write_verify(
                ns,
                cell::CURRENT_LIMIT_CHG,
                i32::from(codec::encode_current(settings.charge_current_safety_cutoff)),
            )
            .await?;
        self.device
            .write_verify(
                ns,
                cell::CURRENT_LIMIT_DCHG,
                i32::from(codec::encode_current(
                    settings.discharge_current_safety_cutoff,
                )),
            )
            .await?;
        self.device
            .write_verify(
                ns,
                cell::TEMP_LIMIT_CHG,
                i32::from(codec::encode_temperature_c(
                    settings.charge_temperature_cutoff,
                    r,
                    b,
                )),
            )
            .await?;
        self.device
            .write_verify(
                ns,
                cell::TEMP_LIMIT_DCHG,
                i32::from(codec::encode_temperature_c(
                    settings.discharge_temperature_cutoff,
                    r,
                    b,
                )),
            )
            .await?;
        self.device.zero_charge(self.slot).await?;

        let initial_state = match test_type {
            TestType::Cycle => {
                // Pre-zero the setpoint so the output relay closes with no
                // current programmed, then ramp after the relay settles.
                self.device
                    .write(ns, cell::CURRENT_SETPOINT, 0)
                    .await?;
                self.device
                    .write(ns, cell::MODE, i32::from(MODE_CHARGE))
                    .await?;
                sleep(RELAY_DELAY).await;
                self.device
                    .write(
                        ns,
                        cell::CURRENT_SETPOINT,
                        i32::from(codec::encode_setpoint(settings.precharge_rate)),
                    )
                    .await?;
                TestState::PreCharge
            }
            TestType::Discharge => {
                self.device
                    .write(
                        ns,
                        cell::CURRENT_SETPOINT,
                        i32::from(codec::encode_setpoint(settings.discharge_rate)),
                    )
                    .await?;
                self.device
                    .write(ns, cell::MODE, i32::from(MODE_DISCHARGE))
                    .await?;
                TestState::Discharge
            }
        };

        let temperature0 = self.device.temperature_c(self.slot).await?;
        drop(cs);

        let now = Instant::now();
        let test = Box::new(ActiveTest {
            cell_name: cell_name.into(),
            test_type,
            timeout,
            settings,
            state: initial_state,
            started: now,
            last_summary_at: now,
            last_impedance_at: now,
            rest_started: now,
            vavg: 0.0,
            vcnt: 0,
            iavg: 0.0,
            icnt: 0,
            zavg: 0.0,
            zcnt: 0,
            temperature0,
            charge_c: 0.0,
            energy_j: 0.0,
            delta_t: 0.0,
            current_cycle: 0,
            pulse_on: true,
            pulse_phase_started: now,
            trickle_engaged: false,
            vcc_low_ticks: 0,
            fault_ticks: 0,
            prev_sample: None,
        });

        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Start(test, ack_tx))
            .await
            .map_err(|_| CyclerError::ChannelStopped(self.slot))?;
        ack_rx
            .await
            .map_err(|_| CyclerError::ChannelStopped(self.slot))?;
        Ok(())
    }

    /// Stop any running test and idle the slot.
    pub async fn end_test(&self) -> CyclerResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::End(ack_tx))
            .await
            .map_err(|_| CyclerError::ChannelStopped(self.slot))?;
        ack_rx
            .await
            .map_err(|_| CyclerError::ChannelStopped(self.slot))?
    }

    /// Cancel the control loop task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Runtime state of one started test.
struct ActiveTest {
    cell_name: String,
    test_type: TestType,
    timeout: Option<Duration>,
    settings: Arc<Settings>,
    state: TestState,
    started: Instant,
    last_summary_at: Instant,
    last_impedance_at: Instant,
    rest_started: Instant,
    vavg: f64,
    vcnt: u32,
    iavg: f64,
    icnt: u32,
    zavg: f64,
    zcnt: u32,
    temperature0: f64,
    charge_c: f64,
    energy_j: f64,
    delta_t: f64,
    current_cycle: u32,
    pulse_on: bool,
    pulse_phase_started: Instant,
    trickle_engaged: bool,
    vcc_low_ticks: u32,
    fault_ticks: u32,
    prev_sample: Option<(f64, f64)>,
}

impl ActiveTest {
    /// Running impedance estimate, seeded from the settings threshold
    /// until the first measurement lands.
    fn impedance_estimate(&self) -> f64 {
        if self.zcnt == 0 {
            self.settings.acceptable_impedance_threshold
        } else {
            self.zavg
        }
    }
}

/// One tick's measurement snapshot.
struct Sample {
    v: f64,
    i: f64,
    t: f64,
    q: f64,
    e: f64,
    mode: Option<u16>,
}

struct ChannelLoop {
    device: Arc<Device>,
    slot: usize,
    test: Option<Box<ActiveTest>>,
    state_tx: watch::Sender<TestState>,
}

impl ChannelLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        loop {
            let period = match &self.test {
                Some(test) => test.settings.effective_reporting_period(),
                None => Duration::from_millis(500),
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    None => break,
                    Some(Command::Start(test, ack)) => {
                        let _ = self.state_tx.send(test.state);
                        self.test = Some(test);
                        let _ = ack.send(());
                    }
                    Some(Command::End(ack)) => {
                        let _ = ack.send(self.force_idle().await);
                    }
                },
                _ = sleep(period) => {
                    match self.tick().await {
                        Ok(()) => {}
                        Err(err) if !err.is_recoverable() => {
                            warn!(slot = self.slot, %err, "serial link lost, idling channel");
                            self.test = None;
                            let _ = self.state_tx.send(TestState::Idle);
                            break;
                        }
                        Err(err) => {
                            warn!(slot = self.slot, %err, "channel tick failed, continuing test");
                            sleep(TICK_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    async fn force_idle(&mut self) -> CyclerResult<()> {
        if self.test.take().is_some() {
            let _cs = self.device.critical_section().await;
            self.device
                .write(
                    Namespace::cell(self.slot),
                    cell::MODE,
                    i32::from(MODE_STOPPED),
                )
                .await?;
        }
        let _ = self.state_tx.send(TestState::Idle);
        Ok(())
    }

    async fn tick(&mut self) -> CyclerResult<()> {
        if self.device.is_link_closed() {
            return Err(CyclerError::LinkClosed);
        }
        let device = Arc::clone(&self.device);
        let slot = self.slot;
        let ns = Namespace::cell(slot);
        let caps = device.caps().await;

        // The whole tick holds the unit critical section: sampling, the
        // interlocks and every state-machine register write, so two
        // channels never interleave their sequences on one unit.
        let _cs = device.critical_section().await;
        let mode = device.read(ns, cell::MODE).await?.value();

        if caps.needs_sw_current_compensation
            && matches!(mode, Some(MODE_CHARGE) | Some(MODE_DISCHARGE))
        {
            Self::compensate(&device, slot).await?;
        }
        device.reset_watchdog().await?;

        let Some(test) = self.test.as_mut().filter(|test| test.state != TestState::Idle)
        else {
            return Ok(());
        };

        let v = device.read(ns, cell::VOLTAGE).await?.as_voltage();
        test.vcnt += 1;
        test.vavg += (v - test.vavg) / f64::from(test.vcnt);
        let i = device.read(ns, cell::CURRENT).await?.as_current();
        test.icnt += 1;
        test.iavg += (i - test.iavg) / f64::from(test.icnt);
        let t = device.temperature_c(slot).await?;
        let q = device.charge(slot).await?;
        let e = q * test.vavg;
        let mode = device.read(ns, cell::MODE).await?.value();
        let _err = device.read(ns, cell::ERROR).await?.raw;
        test.charge_c = q;
        test.energy_j = e;
        test.delta_t = t - test.temperature0;
        let sample = Sample { v, i, t, q, e, mode };

        // Supply rail interlock: a collapsing VCC means measurements and
        // limit enforcement can no longer be trusted.
        let vcc = device.vcc().await?;
        if vcc.is_finite() {
            if vcc < VCC_HARD_FLOOR {
                test.vcc_low_ticks += 1;
                if test.vcc_low_ticks >= 2 {
                    Self::abort(&device, slot, test, "supply rail collapsed").await?;
                    self.finish_tick();
                    return Ok(());
                }
                warn!(slot, vcc, "supply rail below hard floor");
            } else {
                test.vcc_low_ticks = 0;
                if vcc < VCC_SOFT_FLOOR {
                    warn!(slot, vcc, "supply rail sagging");
                }
            }
        }

        // Voltage-fault heuristic: a big voltage drop with stable current
        // is a broken sense line or slipped contact, not cell behavior.
        if let Some((prev_v, prev_i)) = test.prev_sample {
            if (sample.i - prev_i).abs() < CURRENT_STABLE_BAND
                && (prev_v - sample.v) > VOLTAGE_FAULT_DELTA
            {
                test.fault_ticks += 1;
                if test.fault_ticks >= VOLTAGE_FAULT_TICKS {
                    Self::abort(&device, slot, test, "voltage measurement fault").await?;
                    self.finish_tick();
                    return Ok(());
                }
            } else {
                test.fault_ticks = 0;
            }
        }
        test.prev_sample = Some((sample.v, sample.i));

        // Periodic impedance measurement, folded into the running average.
        let mut measured_z = None;
        let impedance_interval = test.settings.impedance_interval();
        if !impedance_interval.is_zero()
            && test.last_impedance_at.elapsed() > impedance_interval
            && !test.trickle_engaged
        {
            let z = device.impedance_unguarded(slot).await?;
            test.last_impedance_at = Instant::now();
            if z.is_finite() {
                test.zcnt += 1;
                test.zavg += (z - test.zavg) / f64::from(test.zcnt);
            }
            measured_z = Some(z);
        }

        let row = TelemetryRow {
            cell_name: test.cell_name.clone(),
            device_sn: device.sn().await,
            channel: slot,
            timestamp: Local::now(),
            voltage: sample.v,
            current: sample.i,
            temperature: sample.t,
            impedance: measured_z,
            energy: sample.e,
            charge: sample.q,
            state: test.state.label(),
        };
        device.logger().log(row.to_csv(), test.settings.logfile());
        if test.settings.individual_cell_logs {
            device
                .logger()
                .log(row.to_csv(), test.settings.cell_logfile(&test.cell_name));
        }

        Self::step_state_machine(&device, slot, test, sample.mode, sample.v).await?;
        self.finish_tick();
        Ok(())
    }

    /// Publish the post-tick state and drop a finished test.
    fn finish_tick(&mut self) {
        let Some(state) = self.test.as_ref().map(|test| test.state) else {
            return;
        };
        let _ = self.state_tx.send(state);
        if state == TestState::Idle {
            self.test = None;
        }
    }

    /// Software current-compensation nudge for old firmware: walk the
    /// hardware setpoint one LSB toward the shadow target.
    async fn compensate(device: &Device, slot: usize) -> CyclerResult<()> {
        let ns = Namespace::cell(slot);
        let i = device.read(ns, cell::CURRENT).await?.as_current();
        if i.is_nan() {
            return Ok(());
        }
        let mut op_raw = device.read(ns, cell::CURRENT_SETPOINT).await?.raw;
        let sp_raw = device.setpoint_shadow(slot).await;
        let sp = f64::from(sp_raw) / 128.0;
        if i > 0.0 && sp > 0.5 {
            if i < sp - COMPENSATION_DEAD_BAND {
                op_raw = op_raw.saturating_add(1);
            } else if i > sp + COMPENSATION_DEAD_BAND {
                op_raw = op_raw.saturating_sub(1);
            }
        }
        if i > COMPENSATION_SATURATION {
            op_raw = op_raw.saturating_sub(1);
        }
        if sp > COMPENSATION_PIN_THRESHOLD {
            op_raw = SETPOINT_MAX_RAW;
        }
        device.nudge_setpoint(slot, op_raw).await
    }

    async fn abort(
        device: &Device,
        slot: usize,
        test: &mut ActiveTest,
        reason: &str,
    ) -> CyclerResult<()> {
        let sn = device.sn().await;
        error!(
            sn,
            channel = slot,
            cell = %test.cell_name,
            reason,
            "test aborted"
        );
        device
            .write(Namespace::cell(slot), cell::MODE, i32::from(MODE_STOPPED))
            .await?;
        test.state = TestState::Idle;
        Ok(())
    }

    /// Write the per-phase summary row and reset the accumulators.
    async fn log_summary(
        device: &Device,
        slot: usize,
        test: &mut ActiveTest,
        phase: &str,
    ) -> CyclerResult<()> {
        let runtime = test.last_summary_at.elapsed();
        test.last_summary_at = Instant::now();
        let row = SummaryRow {
            cell_name: test.cell_name.clone(),
            device_sn: device.sn().await,
            channel: slot,
            timestamp: Local::now(),
            test_type: phase.into(),
            charge_capacity: test.charge_c,
            energy_capacity: test.energy_j,
            avg_impedance: test.zavg,
            delta_temperature: test.delta_t,
            avg_current: test.iavg,
            avg_voltage: test.vavg,
            runtime_seconds: runtime.as_secs_f64(),
        };
        device.logger().log(row.to_csv(), test.settings.logfile());
        if test.settings.individual_cell_logs {
            device
                .logger()
                .log(row.to_csv(), test.settings.cell_logfile(&test.cell_name));
        }
        test.vcnt = 0;
        test.icnt = 0;
        test.zcnt = 0;
        test.temperature0 = device.temperature_c(slot).await?;
        device.zero_charge(slot).await?;
        Ok(())
    }

    async fn set_rate(device: &Device, slot: usize, amps: f64) -> CyclerResult<()> {
        device.set_current(slot, amps).await?;
        Ok(())
    }

    /// Cycle-test state machine, driven by the firmware mode register and
    /// the latest voltage sample.
    async fn step_state_machine(
        device: &Device,
        slot: usize,
        test: &mut ActiveTest,
        mode: Option<u16>,
        v: f64,
    ) -> CyclerResult<()> {
        let ns = Namespace::cell(slot);
        let settings = Arc::clone(&test.settings);
        match test.state {
            TestState::Idle => {}

            TestState::PreCharge => {
                Self::charge_phase_controls(device, slot, test, v).await?;
                if mode == Some(MODE_STOPPED) {
                    Self::log_summary(device, slot, test, "PRECHARGE").await?;
                    test.state = TestState::ChargeRest;
                    test.rest_started = Instant::now();
                    Self::maybe_complete(device, slot, test).await?;
                }
            }

            TestState::ChargeRest => {
                if test.rest_started.elapsed() > settings.rest_duration() {
                    Self::log_summary(device, slot, test, "CHARGEREST").await?;
                    test.state = TestState::Discharge;
                    test.pulse_on = true;
                    test.pulse_phase_started = Instant::now();
                    test.trickle_engaged = false;
                    Self::set_rate(device, slot, settings.discharge_rate).await?;
                    device
                        .write(ns, cell::MODE, i32::from(MODE_DISCHARGE))
                        .await?;
                    test.current_cycle += 1;
                }
            }

            TestState::Discharge => {
                if let Some(timeout) = test.timeout {
                    if !timeout.is_zero() && test.started.elapsed() > timeout {
                        device
                            .write(ns, cell::MODE, i32::from(MODE_STOPPED))
                            .await?;
                    }
                }
                Self::discharge_phase_controls(device, slot, test, v).await?;
                if mode == Some(MODE_STOPPED) {
                    Self::log_summary(device, slot, test, "DISCHARGE").await?;
                    match test.test_type {
                        TestType::Cycle => {
                            test.state = TestState::DischargeRest;
                            test.rest_started = Instant::now();
                        }
                        TestType::Discharge => {
                            let sn = device.sn().await;
                            info!(sn, channel = slot, "test completed");
                            test.state = TestState::Idle;
                        }
                    }
                }
            }

            TestState::DischargeRest => {
                if test.rest_started.elapsed() > settings.rest_duration() {
                    Self::log_summary(device, slot, test, "DISCHARGEREST").await?;
                    test.state = TestState::Charge;
                    test.pulse_on = true;
                    test.pulse_phase_started = Instant::now();
                    test.trickle_engaged = false;
                    device.write(ns, cell::CURRENT_SETPOINT, 0).await?;
                    device.write(ns, cell::MODE, i32::from(MODE_CHARGE)).await?;
                    sleep(RELAY_DELAY).await;
                    Self::set_rate(device, slot, settings.charge_rate).await?;
                }
            }

            TestState::Charge => {
                Self::charge_phase_controls(device, slot, test, v).await?;
                if mode == Some(MODE_STOPPED) {
                    Self::log_summary(device, slot, test, "CHARGE").await?;
                    test.state = TestState::ChargeRest;
                    test.rest_started = Instant::now();
                    Self::maybe_complete(device, slot, test).await?;
                }
            }

            TestState::PostDischarge => {
                if mode == Some(MODE_STOPPED) || v < settings.storage_discharge_voltage {
                    device
                        .write(ns, cell::MODE, i32::from(MODE_STOPPED))
                        .await?;
                    Self::log_summary(device, slot, test, "POSTDISCHARGE").await?;
                    let sn = device.sn().await;
                    info!(sn, channel = slot, "test completed");
                    test.state = TestState::Idle;
                }
            }
        }
        Ok(())
    }

    /// End-of-charge bookkeeping: either start the storage discharge tail
    /// or finish the test once every cycle has run.
    async fn maybe_complete(
        device: &Device,
        slot: usize,
        test: &mut ActiveTest,
    ) -> CyclerResult<()> {
        if test.current_cycle >= test.settings.total_cycles() {
            if test.settings.storage_discharge {
                test.state = TestState::PostDischarge;
                Self::set_rate(device, slot, test.settings.discharge_rate).await?;
                device
                    .write(
                        Namespace::cell(slot),
                        cell::MODE,
                        i32::from(MODE_DISCHARGE),
                    )
                    .await?;
            } else {
                let sn = device.sn().await;
                info!(sn, channel = slot, "test completed");
                test.state = TestState::Idle;
            }
        }
        Ok(())
    }

    /// Charge-direction per-tick controls: pulse scheduling, the trickle
    /// latch near the voltage limit, and the constant-voltage taper.
    async fn charge_phase_controls(
        device: &Device,
        slot: usize,
        test: &mut ActiveTest,
        v: f64,
    ) -> CyclerResult<()> {
        let settings = Arc::clone(&test.settings);
        if settings.pulse_enable {
            if test.pulse_on {
                if settings.pulse_chrg_on_time > 0.0
                    && test.pulse_phase_started.elapsed().as_secs_f64()
                        > settings.pulse_chrg_on_time
                {
                    Self::set_rate(device, slot, settings.pulse_chrg_off_rate).await?;
                    test.pulse_on = false;
                    test.pulse_phase_started = Instant::now();
                }
            } else if settings.pulse_chrg_off_time > 0.0
                && test.pulse_phase_started.elapsed().as_secs_f64() > settings.pulse_chrg_off_time
            {
                let rate = if test.trickle_engaged {
                    settings.trickle_chrg_rate
                } else {
                    settings.charge_rate
                };
                Self::set_rate(device, slot, rate).await?;
                test.pulse_on = true;
                test.pulse_phase_started = Instant::now();
            }
        }

        if settings.trickle_enable
            && v > settings.trickle_chrg_engage_voltage
            && !test.trickle_engaged
        {
            Self::set_rate(device, slot, settings.trickle_chrg_rate).await?;
            test.trickle_engaged = true;
        }

        // Constant-voltage taper: as the cell approaches the cutoff, the
        // IR step v + i*z would trip the limit early, so walk the setpoint
        // down one LSB per tick while the projected step overshoots.
        if settings.constant_voltage_enable && !test.trickle_engaged && v.is_finite() {
            let raw = device.setpoint_shadow(slot).await;
            if raw > 0 {
                let amps = f64::from(raw) / 128.0;
                let headroom = settings.high_voltage_cutoff - v;
                let projected =
                    amps * test.impedance_estimate() * settings.constant_voltage_sensitivity;
                if headroom < projected {
                    device
                        .write(
                            Namespace::cell(slot),
                            cell::CURRENT_SETPOINT,
                            i32::from(raw - 1),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Discharge-direction per-tick controls: pulse scheduling and the
    /// trickle latch near the low-voltage limit.
    async fn discharge_phase_controls(
        device: &Device,
        slot: usize,
        test: &mut ActiveTest,
        v: f64,
    ) -> CyclerResult<()> {
        let settings = Arc::clone(&test.settings);
        if settings.pulse_enable {
            if test.pulse_on {
                if settings.pulse_dischrg_on_time > 0.0
                    && test.pulse_phase_started.elapsed().as_secs_f64()
                        > settings.pulse_dischrg_on_time
                {
                    Self::set_rate(device, slot, settings.pulse_dischrg_off_rate).await?;
                    test.pulse_on = false;
                    test.pulse_phase_started = Instant::now();
                }
            } else if settings.pulse_dischrg_off_time > 0.0
                && test.pulse_phase_started.elapsed().as_secs_f64()
                    > settings.pulse_dischrg_off_time
            {
                let rate = if test.trickle_engaged {
                    settings.trickle_dischrg_rate
                } else {
                    settings.discharge_rate
                };
                Self::set_rate(device, slot, rate).await?;
                test.pulse_on = true;
                test.pulse_phase_started = Instant::now();
            }
        }

        if settings.trickle_enable
            && v < settings.trickle_dischrg_engage_voltage
            && !test.trickle_engaged
        {
            Self::set_rate(device, slot, settings.trickle_dischrg_rate).await?;
            test.trickle_engaged = true;
        }
        Ok(())
    }
}
