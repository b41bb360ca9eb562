//! Resolved test settings.
//!
//! Settings arrive as a JSON playlist document with camelCase keys; this
//! module owns the deserialized form, the built-in defaults, and the LiPo
//! safety window applied to every numeric field. A running test captures an
//! `Arc<Settings>` snapshot at start, so later edits never reach it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::MIN_REPORTING_PERIOD;

/// Complete test configuration for one playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub cell_playlist_file_version: String,
    pub cell_playlist_name: String,

    /// Ohms. Seeds the running impedance estimate for the CV taper.
    pub acceptable_impedance_threshold: f64,

    // Rates and cutoffs (amps / volts / celsius)
    pub charge_current_safety_cutoff: f64,
    pub charge_rate: f64,
    pub precharge_rate: f64,
    pub charge_temperature_cutoff: f64,
    pub discharge_current_safety_cutoff: f64,
    pub discharge_rate: f64,
    pub discharge_temperature_cutoff: f64,
    pub high_voltage_cutoff: f64,
    pub low_voltage_cutoff: f64,

    // Periods (seconds)
    pub impedance_reporting_period: f64,
    pub reporting_period: f64,
    pub rest_period: f64,

    // Cycle counts
    pub num_measurement_cycles: u32,
    pub num_warmup_cycles: u32,

    // Impedance sine excitation
    pub sine_wave_frequency: f64,
    pub sine_wave_magnitude: f64,

    // Storage discharge tail
    pub storage_discharge: bool,
    pub storage_discharge_voltage: f64,

    // Trickle block
    pub trickle_enable: bool,
    pub trickle_dischrg_engage_voltage: f64,
    pub trickle_chrg_engage_voltage: f64,
    pub trickle_chrg_rate: f64,
    pub trickle_dischrg_rate: f64,

    // Pulse block
    pub pulse_enable: bool,
    pub pulse_chrg_on_time: f64,
    pub pulse_chrg_off_time: f64,
    pub pulse_chrg_off_rate: f64,
    pub pulse_dischrg_on_time: f64,
    pub pulse_dischrg_off_time: f64,
    pub pulse_dischrg_off_rate: f64,

    // Constant-voltage taper
    pub constant_voltage_enable: bool,
    pub constant_voltage_sensitivity: f64,

    pub individual_cell_logs: bool,

    /// Directory the CSV log files are written into.
    pub log_directory: PathBuf,

    /// Disables the LiPo clamps in `validate`. For chemistry experts only.
    pub ignore_safety_limits: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cell_playlist_file_version: "0.0.1".into(),
            cell_playlist_name: "DefaultPlaylist".into(),
            acceptable_impedance_threshold: 1.0,
            charge_current_safety_cutoff: 4.096,
            charge_rate: 2.0,
            precharge_rate: 2.0,
            charge_temperature_cutoff: 50.0,
            discharge_current_safety_cutoff: 4.096,
            discharge_rate: 2.0,
            discharge_temperature_cutoff: 80.0,
            high_voltage_cutoff: 4.2,
            low_voltage_cutoff: 2.5,
            impedance_reporting_period: 60.0,
            reporting_period: 1.0,
            rest_period: 60.0,
            num_measurement_cycles: 1,
            num_warmup_cycles: 0,
            sine_wave_frequency: 10000.0 / 256.0,
            sine_wave_magnitude: 2.0,
            storage_discharge: false,
            storage_discharge_voltage: 3.8,
            trickle_enable: false,
            trickle_dischrg_engage_voltage: 4.1,
            trickle_chrg_engage_voltage: 2.8,
            trickle_chrg_rate: 0.5,
            trickle_dischrg_rate: 0.5,
            pulse_enable: false,
            pulse_chrg_on_time: 60.0,
            pulse_chrg_off_time: 10.0,
            pulse_chrg_off_rate: 0.0,
            pulse_dischrg_on_time: 60.0,
            pulse_dischrg_off_time: 10.0,
            pulse_dischrg_off_rate: 0.0,
            constant_voltage_enable: false,
            constant_voltage_sensitivity: 1.0,
            individual_cell_logs: false,
            log_directory: PathBuf::from("."),
            ignore_safety_limits: false,
        }
    }
}

impl Settings {
    /// Parse a JSON playlist document and apply the safety window.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let mut settings: Settings = serde_json::from_str(text)?;
        settings.validate();
        Ok(settings)
    }

    /// Clamp every bounded field back to its default when it falls outside
    /// the LiPo safety window. No-op when `ignore_safety_limits` is set.
    pub fn validate(&mut self) {
        if self.ignore_safety_limits {
            return;
        }
        let defaults = Settings::default();
        let clamp = |name: &str, field: &mut f64, min: f64, max: f64, default: f64| {
            if *field < min || *field > max {
                warn!(
                    setting = name,
                    value = *field,
                    "value is not safe for LiPo cells, reverting to {default}"
                );
                *field = default;
            }
        };
        clamp(
            "chargeCurrentSafetyCutoff",
            &mut self.charge_current_safety_cutoff,
            0.0,
            4.096,
            defaults.charge_current_safety_cutoff,
        );
        clamp("chargeRate", &mut self.charge_rate, 0.0, 4.0, defaults.charge_rate);
        clamp(
            "prechargeRate",
            &mut self.precharge_rate,
            0.0,
            4.0,
            defaults.precharge_rate,
        );
        clamp(
            "chargeTemperatureCutoff",
            &mut self.charge_temperature_cutoff,
            -60.0,
            80.0,
            defaults.charge_temperature_cutoff,
        );
        clamp(
            "dischargeCurrentSafetyCutoff",
            &mut self.discharge_current_safety_cutoff,
            0.0,
            4.096,
            defaults.discharge_current_safety_cutoff,
        );
        clamp(
            "dischargeRate",
            &mut self.discharge_rate,
            0.0,
            4.0,
            defaults.discharge_rate,
        );
        clamp(
            "dischargeTemperatureCutoff",
            &mut self.discharge_temperature_cutoff,
            -60.0,
            80.0,
            defaults.discharge_temperature_cutoff,
        );
        clamp(
            "highVoltageCutoff",
            &mut self.high_voltage_cutoff,
            3.0,
            4.3,
            defaults.high_voltage_cutoff,
        );
        clamp(
            "lowVoltageCutoff",
            &mut self.low_voltage_cutoff,
            2.4324,
            4.25,
            defaults.low_voltage_cutoff,
        );
        clamp(
            "sineWaveFrequency",
            &mut self.sine_wave_frequency,
            39.0625,
            1054.6875,
            defaults.sine_wave_frequency,
        );
        clamp(
            "sineWaveMagnitude",
            &mut self.sine_wave_magnitude,
            0.0,
            2.0,
            defaults.sine_wave_magnitude,
        );
        clamp(
            "storageDischargeVoltage",
            &mut self.storage_discharge_voltage,
            2.5,
            4.3,
            defaults.storage_discharge_voltage,
        );
    }

    /// Playlist summary log file path.
    pub fn logfile(&self) -> PathBuf {
        self.log_directory
            .join(format!("cycler-log_{}.csv", self.cell_playlist_name))
    }

    /// Per-cell log file path.
    pub fn cell_logfile(&self, cell_name: &str) -> PathBuf {
        self.log_directory.join(format!(
            "cycler-log_{}_{}.csv",
            self.cell_playlist_name, cell_name
        ))
    }

    /// Reporting period with the hardware floor applied.
    pub fn effective_reporting_period(&self) -> Duration {
        let requested = Duration::from_secs_f64(self.reporting_period.max(0.0));
        requested.max(MIN_REPORTING_PERIOD)
    }

    pub fn rest_duration(&self) -> Duration {
        Duration::from_secs_f64(self.rest_period.max(0.0))
    }

    pub fn impedance_interval(&self) -> Duration {
        Duration::from_secs_f64(self.impedance_reporting_period.max(0.0))
    }

    /// Snapshot for a starting test.
    pub fn snapshot(&self) -> Arc<Settings> {
        Arc::new(self.clone())
    }

    /// Total cycles a cycle test runs: warmups then measured cycles.
    pub fn total_cycles(&self) -> u32 {
        self.num_measurement_cycles + self.num_warmup_cycles
    }
}
