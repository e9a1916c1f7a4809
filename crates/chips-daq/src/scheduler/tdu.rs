// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Externally triggered spill scheduler.
//!
//! Accelerator spill signals arrive from the TDU spill server as XML-RPC
//! calls carrying NOvA-clock timestamps. An embedded HTTP endpoint receives
//! the calls, converts the clock, and feeds a median-filter predictor; the
//! scheduler then centres a window on each predicted future trigger.

use crate::config;
use crate::scheduler::SpillScheduler;
use crate::spill::Spill;
use crate::time::{nova::NovaTimestamp, TaiTimestamp};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Accelerator spill signal types, as sent by the TDU. Used for
/// discrimination and logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillSignalType {
    /// MIBS $74 proton extraction into NuMI.
    NuMi = 0,
    /// $1B parasitic beam inhibit.
    Bnb,
    /// Tevatron clock, $A9 or $AD.
    NuMiTclk,
    /// Booster extraction, $1F.
    BnbTclk,
    /// $8F 1 Hz clock.
    AccelOneHzTclk,
    /// Assigned on parity error.
    Fake,
    TestConnection,
    /// $00, super cycle and master clock reset.
    SuperCycle,
    /// $A4, NuMI cycle sample trigger.
    NuMiSampleTrig,
    /// $A5, NuMI reset for beam.
    NuMiReset,
    /// $39, start of testbeam slow extraction.
    TbSpill,
    /// Testbeam trigger card signal.
    TbTrig,
}

impl SpillSignalType {
    pub fn from_code(code: i64) -> Option<Self> {
        use SpillSignalType::*;
        Some(match code {
            0 => NuMi,
            1 => Bnb,
            2 => NuMiTclk,
            3 => BnbTclk,
            4 => AccelOneHzTclk,
            5 => Fake,
            6 => TestConnection,
            7 => SuperCycle,
            8 => NuMiSampleTrig,
            9 => NuMiReset,
            10 => TbSpill,
            11 => TbTrig,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NuMi => "NuMI",
            Self::Bnb => "BNB",
            Self::NuMiTclk => "NuMItclk",
            Self::BnbTclk => "BNBtclk",
            Self::AccelOneHzTclk => "AccelOneHztclk",
            Self::Fake => "Fake",
            Self::TestConnection => "TestConnection",
            Self::SuperCycle => "SuperCycle",
            Self::NuMiSampleTrig => "NuMISampleTrig",
            Self::NuMiReset => "NuMIReset",
            Self::TbSpill => "TBSpill",
            Self::TbTrig => "TBTrig",
        }
    }
}

/// Median-filter predictor for the trigger period.
///
/// Remembers the last N inter-trigger intervals and reports their median
/// as the learned interval; a median survives the occasional missed or
/// doubled trigger that would wreck a mean.
pub struct TriggerPredictor {
    state: Mutex<PredictorState>,
}

struct PredictorState {
    observed: Vec<f64>,
    next: usize,
    last_timestamp: f64,
    learned_interval: f64,
}

impl TriggerPredictor {
    pub fn new(n_last: usize, init_interval_secs: f64) -> Self {
        Self {
            state: Mutex::new(PredictorState {
                observed: vec![init_interval_secs; n_last.max(1)],
                next: 0,
                last_timestamp: 0.0,
                learned_interval: init_interval_secs,
            }),
        }
    }

    /// Record one observed trigger at `timestamp` (seconds).
    pub fn add_trigger(&self, timestamp: f64) {
        let mut state = self.state.lock();

        if state.last_timestamp != 0.0 {
            let interval = timestamp - state.last_timestamp;
            if interval > 0.0 {
                let at = state.next;
                state.observed[at] = interval;
                state.next = (at + 1) % state.observed.len();

                let mut sorted = state.observed.clone();
                sorted.sort_by(|a, b| a.total_cmp(b));
                state.learned_interval = sorted[sorted.len() / 2];
            }
        }

        state.last_timestamp = timestamp;
    }

    /// Last trigger timestamp and learned interval, read together so the
    /// scheduler never pairs a fresh timestamp with a stale interval.
    pub fn snapshot(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.last_timestamp, state.learned_interval)
    }

    pub fn learned_interval(&self) -> f64 {
        self.state.lock().learned_interval
    }
}

/// Spill scheduler driven by accelerator trigger signals.
pub struct TduSpillScheduler {
    n_spills_ahead: usize,
    window_radius_secs: f64,
    predictor: Arc<TriggerPredictor>,
    server: TriggerServer,
}

impl TduSpillScheduler {
    /// Start the trigger endpoint on `port` and build the scheduler.
    ///
    /// `trigger_memory_size` intervals feed the predictor, seeded with
    /// `init_period_guess` seconds until real triggers arrive.
    pub fn new(
        port: u16,
        trigger_memory_size: usize,
        init_period_guess_secs: f64,
        n_spills_ahead: usize,
        window_radius_secs: f64,
    ) -> std::io::Result<Self> {
        let predictor = Arc::new(TriggerPredictor::new(
            trigger_memory_size,
            init_period_guess_secs,
        ));
        let server = TriggerServer::spawn(port, Arc::clone(&predictor))?;
        Ok(Self {
            n_spills_ahead,
            window_radius_secs,
            predictor,
            server,
        })
    }

    /// Defaults from [`config`].
    pub fn with_defaults(port: u16, init_period_guess_secs: f64) -> std::io::Result<Self> {
        Self::new(
            port,
            config::TRIGGER_MEMORY_SIZE,
            init_period_guess_secs,
            config::SPILLS_AHEAD,
            config::TRIGGER_WINDOW_RADIUS_SECS,
        )
    }

    pub fn predictor(&self) -> &Arc<TriggerPredictor> {
        &self.predictor
    }

    fn tai_from_secs(secs: f64) -> TaiTimestamp {
        let clamped = secs.max(0.0);
        let whole = clamped.floor();
        TaiTimestamp::new(whole as u64, ((clamped - whole) * 1e9) as u32)
    }
}

impl SpillScheduler for TduSpillScheduler {
    fn update_schedule(&self, schedule: &mut Vec<Arc<Spill>>, last_approx: TaiTimestamp) {
        if schedule.len() >= self.n_spills_ahead {
            return;
        }

        let (last_trigger, learned_interval) = self.predictor.snapshot();

        // Schedule from the most recent of: observed data, already
        // scheduled intervals. Otherwise a short schedule would re-create
        // spills in the past.
        let mut basis = last_approx.combined_secs();
        if let Some(last_spill) = schedule.last() {
            let last_scheduled = last_spill.end_time().combined_secs();
            if last_scheduled >= basis {
                basis = last_scheduled;
            } else {
                log::warn!(
                    "[TduSpillScheduler] data ({:.3}) is more recent than the last scheduled spill ({:.3}); \
                     some spills were likely missed, try increasing the schedule capacity",
                    basis,
                    last_scheduled
                );
            }
        }

        if basis < 1e-3 {
            log::warn!("[TduSpillScheduler] no packets received, cannot schedule spills yet");
            return;
        }

        // Determine at which predicted trigger the scheduling starts.
        let coef = if basis < last_trigger {
            // The last trigger (and possibly earlier ones) are not yet
            // scheduled.
            0
        } else {
            // Extrapolate past the last observed trigger so scheduled
            // spills stay ahead of incoming data.
            1 + ((basis - last_trigger) / learned_interval) as u64
        };

        log::info!(
            "[TduSpillScheduler] will schedule {} more spills starting after {:.3} (extrapolation factor {})",
            self.n_spills_ahead - schedule.len(),
            basis,
            coef
        );

        let mut coef = coef;
        while schedule.len() < self.n_spills_ahead {
            let centre = last_trigger + learned_interval * coef as f64;
            schedule.push(Arc::new(Spill::created(
                Self::tai_from_secs(centre - self.window_radius_secs),
                Self::tai_from_secs(centre + self.window_radius_secs),
            )));
            coef += 1;
        }
    }

    fn end_scheduling(&self) {
        self.server.stop();
    }
}

/// The embedded XML-RPC-over-HTTP endpoint receiving trigger signals.
///
/// The TDU posts `Spill(nova_time_string, signal_type_int)` method calls;
/// the handler converts the NOvA clock to UTC and feeds the predictor.
struct TriggerServer {
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerServer {
    fn spawn(port: u16, predictor: Arc<TriggerPredictor>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name("chips-trigger-rx".into())
            .spawn(move || Self::serve(&listener, &running_clone, &predictor))?;

        log::info!("[TriggerServer] up and running at port {}", port);
        Ok(Self {
            running,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        log::info!("[TriggerServer] signing off");
    }

    fn serve(listener: &TcpListener, running: &AtomicBool, predictor: &Arc<TriggerPredictor>) {
        while running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, _peer)) => {
                    if let Err(err) = Self::handle_connection(stream, predictor) {
                        log::debug!("[TriggerServer] connection error: {}", err);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    log::warn!("[TriggerServer] accept error: {}", err);
                    std::thread::sleep(Duration::from_millis(500));
                }
            }
        }
    }

    fn handle_connection(
        mut stream: std::net::TcpStream,
        predictor: &Arc<TriggerPredictor>,
    ) -> std::io::Result<()> {
        stream.set_read_timeout(Some(Duration::from_millis(500)))?;

        let body = read_http_request(&mut stream)?;
        let ok = match parse_spill_call(&body) {
            Some((nova_time, signal_type)) => {
                let utc = nova_time.to_utc();
                let name = signal_type.map_or("Undefined", |s| s.name());
                log::debug!(
                    "[TriggerServer] received spill '{}' at timestamp {:.6}",
                    name,
                    utc.combined_secs()
                );
                predictor.add_trigger(utc.combined_secs());
                true
            }
            None => {
                log::warn!("[TriggerServer] received bad spill request");
                false
            }
        };

        let payload = if ok { "Ok" } else { "bad" };
        let body = format!(
            "<?xml version=\"1.0\"?>\n<methodResponse><params><param><value><string>{}</string></value></param></params></methodResponse>\n",
            payload
        );
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes())
    }
}

impl Drop for TriggerServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Read one HTTP request off the stream and return its body.
fn read_http_request(stream: &mut std::net::TcpStream) -> std::io::Result<String> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break raw.len();
        }
        raw.extend_from_slice(&chunk[..n]);
        if let Some(at) = find_header_end(&raw) {
            break at;
        }
        if raw.len() > 1 << 20 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized request header",
            ));
        }
    };

    let header = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let content_length = header
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let body_start = (header_end + 4).min(raw.len());
    let mut body = raw[body_start..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    if content_length > 0 {
        body.truncate(content_length);
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Parse an XML-RPC `Spill` call: a NOvA time (as a decimal string, since
/// XML-RPC integers cannot carry 64 bits) and a signal type code.
fn parse_spill_call(body: &str) -> Option<(NovaTimestamp, Option<SpillSignalType>)> {
    let document = roxmltree::Document::parse(body).ok()?;
    let root = document.root_element();
    if root.tag_name().name() != "methodCall" {
        return None;
    }

    let method = root
        .descendants()
        .find(|node| node.tag_name().name() == "methodName")?
        .text()?
        .trim()
        .to_owned();
    if method != "Spill" {
        return None;
    }

    let values: Vec<String> = root
        .descendants()
        .filter(|node| node.tag_name().name() == "value")
        .filter_map(|node| {
            let text = match node.first_element_child() {
                Some(typed) => typed.text(),
                None => node.text(),
            };
            text.map(|t| t.trim().to_owned())
        })
        .collect();
    if values.len() != 2 {
        return None;
    }

    let nova_ticks: u64 = values[0].parse().ok()?;
    let signal_type = values[1]
        .parse::<i64>()
        .ok()
        .and_then(SpillSignalType::from_code);

    Some((NovaTimestamp::from_ticks(nova_ticks), signal_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predictor_learns_median_interval() {
        let predictor = TriggerPredictor::new(5, 1.0);
        // Intervals: 2, 2, 8, 2 -> median of {2, 2, 8, 2, 1(seed)} = 2.
        for t in [10.0, 12.0, 14.0, 22.0, 24.0] {
            predictor.add_trigger(t);
        }
        let (last, interval) = predictor.snapshot();
        assert_eq!(last, 24.0);
        assert_eq!(interval, 2.0);
    }

    #[test]
    fn test_predictor_first_trigger_sets_no_interval() {
        let predictor = TriggerPredictor::new(4, 1.5);
        predictor.add_trigger(100.0);
        let (last, interval) = predictor.snapshot();
        assert_eq!(last, 100.0);
        assert_eq!(interval, 1.5);
    }

    #[test]
    fn test_parse_spill_call() {
        let body = "<?xml version=\"1.0\"?>\
            <methodCall><methodName>Spill</methodName><params>\
            <param><value><string>640000000</string></value></param>\
            <param><value><int>1</int></value></param>\
            </params></methodCall>";
        let (time, signal) = parse_spill_call(body).expect("well-formed call");
        assert_eq!(time.ticks(), 640_000_000);
        assert_eq!(signal, Some(SpillSignalType::Bnb));
    }

    #[test]
    fn test_parse_rejects_wrong_method_and_arity() {
        let wrong_method = "<methodCall><methodName>Ping</methodName><params>\
            <param><value><string>1</string></value></param>\
            <param><value><int>1</int></value></param></params></methodCall>";
        assert!(parse_spill_call(wrong_method).is_none());

        let one_param = "<methodCall><methodName>Spill</methodName><params>\
            <param><value><string>1</string></value></param></params></methodCall>";
        assert!(parse_spill_call(one_param).is_none());
    }

    #[test]
    fn test_tai_from_secs_clamps_negative() {
        assert_eq!(
            TduSpillScheduler::tai_from_secs(-0.5),
            TaiTimestamp::new(0, 0)
        );
        let time = TduSpillScheduler::tai_from_secs(1.25);
        assert_eq!(time.secs, 1);
        assert_eq!(time.nanosecs, 250_000_000);
    }

    #[test]
    fn test_update_schedule_waits_for_data() {
        let scheduler = TduSpillScheduler::new(0, 4, 1.0, 4, 0.005)
            .expect("bind trigger server on an ephemeral port");
        let mut schedule = Vec::new();
        scheduler.update_schedule(&mut schedule, TaiTimestamp::default());
        assert!(schedule.is_empty());
        scheduler.end_scheduling();
    }

    #[test]
    fn test_update_schedule_centres_on_predicted_triggers() {
        let scheduler = TduSpillScheduler::new(0, 4, 1.0, 3, 0.005)
            .expect("bind trigger server on an ephemeral port");
        // Triggers at 100 and 102: learned interval settles on seeds + 2.
        scheduler.predictor().add_trigger(100.0);
        scheduler.predictor().add_trigger(102.0);

        let mut schedule = Vec::new();
        scheduler.update_schedule(&mut schedule, TaiTimestamp::new(103, 0));
        assert_eq!(schedule.len(), 3);

        // Intervals are disjoint and ahead of the data timestamp.
        for window in schedule.windows(2) {
            assert!(window[0].end_time() <= window[1].start_time());
        }
        assert!(schedule[0].start_time() > TaiTimestamp::new(102, 0));
        scheduler.end_scheduling();
    }
}
