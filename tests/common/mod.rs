//! Register-level unit simulator for integration tests.
//!
//! Speaks the real wire protocol over a `tokio::io::duplex` link: 5-byte
//! commands in, echo frames out, with a register map behind it. Behavior
//! is scriptable (instant firmware stops, empty slots, per-register read
//! scripts) and every register operation lands in an op log so tests can
//! assert on command sequences and their ordering.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

use voltage_cycler::codec;
use voltage_cycler::constants::{
    bootloader, cell, ns, unit, COMMAND_ERROR, MODE_CHARGE, MODE_DISCHARGE, MODE_IDLE,
    MODE_NO_CELL, MODE_STOPPED, RESPONSE_START, WRITE_BIT,
};

/// One register operation observed by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read { ns: u8, addr: u8 },
    Write { ns: u8, addr: u8, value: u16 },
}

impl Op {
    pub fn namespace(&self) -> u8 {
        match self {
            Op::Read { ns, .. } | Op::Write { ns, .. } => *ns,
        }
    }
}

/// Simulator configuration.
#[derive(Debug, Clone)]
pub struct SimBehavior {
    pub firmware_version: u16,
    /// Entering charge or discharge mode lands directly in STOPPED, as if
    /// the firmware tripped its limit immediately.
    pub instant_stop: bool,
    /// Slots that report no seated cell.
    pub no_cell: [bool; 4],
    /// Probe answer: true simulates a unit stuck in its bootloader.
    pub in_bootloader: bool,
}

impl Default for SimBehavior {
    fn default() -> Self {
        SimBehavior {
            firmware_version: 4,
            instant_stop: false,
            no_cell: [false; 4],
            in_bootloader: false,
        }
    }
}

struct SimState {
    registers: HashMap<(u8, u8), u16>,
    /// Scripted read values, popped per read, falling back to the map.
    scripts: HashMap<(u8, u8), VecDeque<u16>>,
    ops: Vec<Op>,
    behavior: SimBehavior,
}

/// Handle to a running simulator.
#[derive(Clone)]
pub struct SimUnit {
    state: Arc<Mutex<SimState>>,
}

impl SimUnit {
    /// Spawn a simulator task, returning the handle and the host-side
    /// link to hand to `Device::connect`.
    pub fn spawn(behavior: SimBehavior) -> (SimUnit, DuplexStream) {
        let (host, device_side) = tokio::io::duplex(4096);
        let state = Arc::new(Mutex::new(SimState {
            registers: default_registers(&behavior),
            scripts: HashMap::new(),
            ops: Vec::new(),
            behavior,
        }));
        let sim = SimUnit {
            state: Arc::clone(&state),
        };
        tokio::spawn(run(device_side, state));
        (sim, host)
    }

    pub async fn set_register(&self, ns: u8, addr: u8, value: u16) {
        self.state.lock().await.registers.insert((ns, addr), value);
    }

    pub async fn get_register(&self, ns: u8, addr: u8) -> u16 {
        self.state
            .lock()
            .await
            .registers
            .get(&(ns, addr))
            .copied()
            .unwrap_or(0)
    }

    /// Queue scripted values returned by successive reads of a register.
    pub async fn script_reads(&self, ns: u8, addr: u8, values: impl IntoIterator<Item = u16>) {
        self.state
            .lock()
            .await
            .scripts
            .entry((ns, addr))
            .or_default()
            .extend(values);
    }

    pub async fn ops(&self) -> Vec<Op> {
        self.state.lock().await.ops.clone()
    }

    pub async fn clear_ops(&self) {
        self.state.lock().await.ops.clear();
    }

    /// Writes observed for one register, in order.
    pub async fn writes_to(&self, target_ns: u8, target_addr: u8) -> Vec<u16> {
        self.state
            .lock()
            .await
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Write { ns, addr, value } if *ns == target_ns && *addr == target_addr => {
                    Some(*value)
                }
                _ => None,
            })
            .collect()
    }
}

fn default_registers(behavior: &SimBehavior) -> HashMap<(u8, u8), u16> {
    let mut map = HashMap::new();
    let probe = if behavior.in_bootloader { 0 } else { COMMAND_ERROR };
    map.insert((ns::BOOTLOADER, bootloader::BL_ADDR), probe);
    map.insert((ns::UNIT, unit::SERIAL_NUM), 0x3039); // 12345
    map.insert((ns::UNIT, unit::DEVICE_ID), 0x0001);
    map.insert((ns::UNIT, unit::FIRMWARE_VER), behavior.firmware_version);
    map.insert((ns::UNIT, unit::VCC), codec::encode_vcc(5.0));
    map.insert((ns::UNIT, unit::SETTINGS), 0);
    map.insert((ns::UNIT, unit::LOCK), 0);
    for slot in 0..4u8 {
        let mode = if behavior.no_cell[slot as usize] {
            MODE_NO_CELL
        } else {
            MODE_IDLE
        };
        map.insert((slot, cell::MODE), mode);
        map.insert((slot, cell::ERROR), 0);
        map.insert((slot, cell::TEMP_CALIB_R), 10000);
        map.insert((slot, cell::TEMP_CALIB_B), 3380);
        map.insert((slot, cell::TEMPERATURE), 16384); // ~25 C
        map.insert((slot, cell::VOLTAGE), codec::encode_voltage(3.8));
        map.insert((slot, cell::CURRENT), codec::encode_current(2.0));
        map.insert((slot, cell::CURRENT_SETPOINT), 0);
        map.insert((slot, cell::CHARGEL), 0);
        map.insert((slot, cell::CHARGEH), 0);
        map.insert((slot, cell::CURRENT_PP), codec::encode_current(0.5));
        map.insert((slot, cell::VOLTAGE_PP), codec::encode_voltage(0.05));
    }
    map
}

async fn run(mut link: DuplexStream, state: Arc<Mutex<SimState>>) {
    let mut cmd = [0u8; 5];
    while link.read_exact(&mut cmd).await.is_ok() {
        if cmd[0] != RESPONSE_START {
            // resync pad or garbage, skip one byte's worth by realigning:
            // commands are fixed-size, so just drop this chunk
            continue;
        }
        let nsc = cmd[1];
        let addr = cmd[2] & !WRITE_BIT;
        let is_write = cmd[2] & WRITE_BIT != 0;
        let value = u16::from_le_bytes([cmd[3], cmd[4]]);
        let reply_value = {
            let mut st = state.lock().await;
            if is_write {
                st.ops.push(Op::Write {
                    ns: nsc,
                    addr,
                    value,
                });
                apply_write(&mut st, nsc, addr, value);
                value
            } else {
                st.ops.push(Op::Read { ns: nsc, addr });
                if let Some(script) = st.scripts.get_mut(&(nsc, addr)) {
                    if let Some(scripted) = script.pop_front() {
                        st.registers.insert((nsc, addr), scripted);
                    }
                }
                st.registers.get(&(nsc, addr)).copied().unwrap_or(0)
            }
        };
        let [lo, hi] = reply_value.to_le_bytes();
        let echo_addr = if is_write { addr | WRITE_BIT } else { addr };
        let reply = [RESPONSE_START, nsc, echo_addr, lo, hi];
        if link.write_all(&reply).await.is_err() {
            break;
        }
    }
}

fn apply_write(st: &mut SimState, nsc: u8, addr: u8, value: u16) {
    if nsc < 4 && addr == cell::MODE {
        let slot = nsc as usize;
        if st.behavior.no_cell[slot] {
            // an empty slot never leaves NO_CELL
            st.registers.insert((nsc, addr), MODE_NO_CELL);
            return;
        }
        if st.behavior.instant_stop && (value == MODE_CHARGE || value == MODE_DISCHARGE) {
            st.registers.insert((nsc, addr), MODE_STOPPED);
            return;
        }
    }
    st.registers.insert((nsc, addr), value);
}
