//! Jitter buffer.
//!
//! Packets are queued in arrival order; a Kalman filter smooths the
//! inter-arrival interval and the pull side compares it against the buffered
//! playout depth to decide, per tick, whether to emit the head or hold one
//! more frame. When arrivals speed up the buffer drains, when they slow it
//! grows.
//!
//! There is deliberately no drain loop on the pull path: draining a congested
//! session produced audible skips in the field. A configurable hard cap
//! bounds the queue instead, dropping the oldest packet on overflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{trace, warn};

use confero_transport_core::socket::{Packet, PacketSink};
use confero_transport_core::{Address, RtpPacket};

use crate::time::TimeMeter;

/// Buffer operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterMode {
    /// Same-process playback: deliver the head unconditionally.
    Local,
    /// 10 ms audio frames.
    Sound,
    /// 40 ms (or slower) video frames.
    Video,
}

impl JitterMode {
    fn as_str(&self) -> &'static str {
        match self {
            JitterMode::Local => "Local",
            JitterMode::Sound => "Sound",
            JitterMode::Video => "Video",
        }
    }
}

/// Kalman parameters for the scalar arrival-interval estimator.
const KALMAN_Q: f64 = 2.0;
const KALMAN_R: f64 = 2.0;

struct State {
    buffer: VecDeque<RtpPacket>,
    frame_duration: u32,
    prev_rx_ts: u32,
    rx_interval: u32,
    state_rx: f64,
    covariance_rx: f64,
    check_time: u32,
    prev_seq: u16,
}

impl State {
    /// Scalar Kalman correction (`f = h = 1`): predict, gain, update.
    fn kalman_correct(&mut self, measurement: u32) -> u32 {
        let x0 = self.state_rx;
        let p0 = self.covariance_rx + KALMAN_Q;

        let k = p0 / (p0 + KALMAN_R);
        self.state_rx = x0 + k * (measurement as f64 - x0);
        self.covariance_rx = (1.0 - k) * p0;

        self.state_rx as u32
    }
}

/// Arrival-paced packet buffer between the network and a paced consumer.
pub struct JitterBuffer {
    time_meter: TimeMeter,
    mode: Mutex<JitterMode>,
    name: Mutex<String>,
    state: Mutex<State>,
    max_depth: Mutex<Option<usize>>,
    runned: AtomicBool,
}

impl JitterBuffer {
    pub fn new(time_meter: TimeMeter) -> Self {
        Self {
            time_meter,
            mode: Mutex::new(JitterMode::Video),
            name: Mutex::new(String::new()),
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                frame_duration: 10,
                prev_rx_ts: 0,
                rx_interval: 10,
                state_rx: 10.0,
                covariance_rx: 0.1,
                check_time: 0,
                prev_seq: 0,
            }),
            max_depth: Mutex::new(None),
            runned: AtomicBool::new(false),
        }
    }

    /// Bound the queue depth; `None` leaves it unbounded.
    pub fn set_max_depth(&self, depth: Option<usize>) {
        *self.max_depth.lock() = depth;
    }

    pub fn start(&self, mode: JitterMode, name: &str) {
        if self.runned.load(Ordering::SeqCst) {
            return;
        }
        *self.mode.lock() = mode;
        *self.name.lock() = name.to_string();

        let mut state = self.state.lock();
        state.frame_duration = match mode {
            JitterMode::Sound => 10,
            _ => state.frame_duration.max(40),
        };
        state.prev_seq = 0;
        state.prev_rx_ts = self.time_meter.measure_ms();
        state.rx_interval = state.frame_duration;
        state.state_rx = state.frame_duration as f64;
        state.covariance_rx = 0.1;
        state.check_time = 0;
        state.buffer.clear();
        drop(state);

        self.runned.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.runned.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.runned.load(Ordering::SeqCst)
    }

    pub fn set_frame_duration(&self, ms: u32) {
        let was_runned = self.runned.swap(false, Ordering::SeqCst);
        self.state.lock().frame_duration = ms;
        if was_runned {
            let mode = *self.mode.lock();
            let name = self.name.lock().clone();
            self.start(mode, &name);
        }
    }

    /// Current smoothed inter-arrival interval estimate in milliseconds.
    pub fn rx_interval_ms(&self) -> u32 {
        self.state.lock().rx_interval
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push one packet from the network. The Kalman estimate only updates on
    /// exactly consecutive sequence numbers so loss does not pollute it.
    pub fn push(&self, packet: RtpPacket) {
        if !self.runned.load(Ordering::SeqCst) {
            return;
        }
        let mode = *self.mode.lock();
        let max_depth = *self.max_depth.lock();
        let mut state = self.state.lock();

        let seq = packet.header.seq;
        state.buffer.push_back(packet);
        if let Some(cap) = max_depth {
            while state.buffer.len() > cap {
                state.buffer.pop_front();
            }
        }

        if seq == state.prev_seq.wrapping_add(1) {
            let now = self.time_meter.measure_ms();
            let interarrival = now.saturating_sub(state.prev_rx_ts);
            state.prev_rx_ts = now;
            state.rx_interval = state.kalman_correct(interarrival);
        } else {
            trace!(
                "{}_JB[{}] :: packet loss (prev_seq: {}, current_seq: {seq})",
                mode.as_str(),
                self.name.lock(),
                state.prev_seq
            );
            state.prev_rx_ts = self.time_meter.measure_ms();
        }
        state.prev_seq = seq;
    }

    /// Pull one frame on the consumer's tick. Returns `None` while the
    /// buffer is accumulating or empty.
    pub fn get_frame(&self) -> Option<RtpPacket> {
        if !self.runned.load(Ordering::SeqCst) {
            return None;
        }
        let mode = *self.mode.lock();
        let mut state = self.state.lock();

        let check_period = state.frame_duration
            * if mode == JitterMode::Sound { 300 } else { 150 };
        if state.check_time == check_period {
            trace!(
                "{}_JB[{}] :: check (rx_interval: {}, buffer size: {})",
                mode.as_str(),
                self.name.lock(),
                state.rx_interval,
                state.buffer.len()
            );
            state.check_time = 0;
        }
        state.check_time += state.frame_duration;

        if state.buffer.is_empty() {
            warn!(
                "{}_JB[{}] :: empty (rx_interval: {})",
                mode.as_str(),
                self.name.lock(),
                state.rx_interval
            );
            return None;
        }

        if mode == JitterMode::Local
            || (state.rx_interval as usize) < state.buffer.len() * state.frame_duration as usize
        {
            state.buffer.pop_front()
        } else {
            trace!(
                "{}_JB[{}] :: buffering (rx_interval: {}, buffer size: {})",
                mode.as_str(),
                self.name.lock(),
                state.rx_interval,
                state.buffer.len()
            );
            None
        }
    }
}

impl PacketSink for JitterBuffer {
    fn send_packet(&self, packet: Packet, _addr: Option<&Address>) {
        if let Packet::Rtp(packet) = packet {
            self.push(packet);
        }
    }
}
