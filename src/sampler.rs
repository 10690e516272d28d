//! Adaptive throughput sampler.
//!
//! A session repeats one request at a time, sizing each so it should take
//! about `target` to transfer. Early samples are thrown away until one lands
//! near the target (ramp-up); from then on every sample feeds two EWMAs, one
//! over the rate and one over the elapsed time. The session stops once
//! enough samples were taken and the smoothed elapsed time sits near the
//! target, or when the sample cap is reached.

use std::fmt;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::TestError;
use crate::ewma::Ewma;
use crate::payload::Payload;
use crate::transport::{StopFlag, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Download,
    Upload,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Download => f.write_str("download"),
            Mode::Upload => f.write_str("upload"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    RampUp,
    Steady,
    Done,
}

/// Open interval `(low * target, high * target)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Band {
    pub low: f64,
    pub high: f64,
}

impl Band {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, elapsed: Duration, target: Duration) -> bool {
        let elapsed = elapsed.as_secs_f64();
        let target = target.as_secs_f64();
        elapsed > target * self.low && elapsed < target * self.high
    }

    fn validate(&self, name: &str) -> Result<(), TestError> {
        if !(self.low.is_finite() && self.high.is_finite()) || self.low < 0.0 || self.low >= self.high {
            return Err(TestError::Settings(format!(
                "{name} band ({}, {}) must satisfy 0 <= low < high",
                self.low, self.high
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SamplerSettings {
    /// Duration each request should take once sized correctly.
    pub target: Duration,
    pub ewma_weight: f64,
    pub min_samples: usize,
    pub max_samples: usize,
    pub initial_download: u64,
    pub initial_upload: u64,
    /// Elapsed time that ends ramp-up.
    pub ramp_up_band: Band,
    /// Smoothed elapsed time that counts as converged.
    pub convergence_band: Band,
    /// Multiplier applied when resizing the next request.
    pub overshoot: f64,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            target: Duration::from_secs(1),
            ewma_weight: 8.0,
            min_samples: 10,
            max_samples: 50,
            initial_download: 1024 * 1024,
            initial_upload: 128 * 1024,
            ramp_up_band: Band::new(0.9, 1.5),
            convergence_band: Band::new(0.95, 1.25),
            overshoot: 1.0,
        }
    }
}

impl SamplerSettings {
    pub fn validate(&self) -> Result<(), TestError> {
        if !self.ewma_weight.is_finite() || self.ewma_weight <= 0.0 {
            return Err(TestError::Settings(format!(
                "EWMA weight must be positive, got {}",
                self.ewma_weight
            )));
        }
        if self.target.is_zero() {
            return Err(TestError::Settings("target duration must be positive".into()));
        }
        if self.min_samples == 0 {
            return Err(TestError::Settings("minimum samples must be at least 1".into()));
        }
        if self.max_samples < self.min_samples {
            return Err(TestError::Settings(format!(
                "maximum samples ({}) is below minimum samples ({})",
                self.max_samples, self.min_samples
            )));
        }
        if !self.overshoot.is_finite() || self.overshoot <= 0.0 {
            return Err(TestError::Settings(format!(
                "overshoot must be positive, got {}",
                self.overshoot
            )));
        }
        self.ramp_up_band.validate("ramp-up")?;
        self.convergence_band.validate("convergence")?;
        Ok(())
    }

    pub fn initial_bytes(&self, mode: Mode) -> u64 {
        match mode {
            Mode::Download => self.initial_download,
            Mode::Upload => self.initial_upload,
        }
    }

    /// Bytes a request should carry to last `target` at `rate_bps`.
    pub fn projected_bytes(&self, rate_bps: f64) -> u64 {
        let bytes = (rate_bps * self.target.as_secs_f64() / 8.0 * self.overshoot).floor();
        if bytes.is_finite() && bytes >= 1.0 {
            // `as` saturates at u64::MAX.
            bytes as u64
        } else {
            1
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub bytes: u64,
    pub elapsed: Duration,
    pub rate_bps: f64,
}

impl Sample {
    fn new(bytes: u64, elapsed: Duration) -> Result<Self, TestError> {
        if elapsed.is_zero() {
            return Err(TestError::Protocol(format!(
                "{bytes} bytes transferred in zero time"
            )));
        }
        Ok(Self {
            bytes,
            elapsed,
            rate_bps: bytes as f64 * 8.0 / elapsed.as_secs_f64(),
        })
    }
}

/// What a [`Session::step`] did with its sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    /// Ramp-up sample outside the band; the next request was resized.
    Discarded(Sample),
    Recorded(Sample),
    /// The session was already done; no request was made.
    Finished,
}

/// Events for a progress display.
#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    /// A ramp-up sample was discarded.
    RampUp { mode: Mode, rate_bps: f64, requests: u64 },
    /// A steady sample was recorded. `confidence` is smoothed elapsed over target.
    Steady {
        mode: Mode,
        ewma_rate_bps: f64,
        confidence: f64,
        requests: u64,
    },
    Finished { mode: Mode },
}

#[derive(Clone, Debug, Serialize)]
pub struct Summary {
    pub mode: Mode,
    pub rate_bps: f64,
    /// Bytes moved by the counted (steady) samples.
    pub bytes: u64,
    pub samples: usize,
    /// Every request issued, including the hello request and discarded ramp-up attempts.
    pub requests: u64,
    #[serde(rename = "duration_secs", serialize_with = "as_secs")]
    pub duration: Duration,
    #[serde(rename = "mean_elapsed_secs", serialize_with = "as_secs")]
    pub mean_elapsed: Duration,
    pub stdev_bps: Option<f64>,
    pub min_bps: Option<f64>,
    pub max_bps: Option<f64>,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Sample standard deviation; `None` below two values.
pub fn sample_stdev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(var.sqrt())
}

/// One download or upload test, exclusively owned by its driver.
#[derive(Debug)]
pub struct Session {
    mode: Mode,
    settings: SamplerSettings,
    projected_bytes: u64,
    ewma_rate: Ewma<f64>,
    ewma_elapsed: Ewma<Duration>,
    samples: Vec<Sample>,
    phase: Phase,
    requests: u64,
    started: Instant,
}

impl Session {
    /// Validates settings and checks the server with a hello request.
    pub fn start<T: Transport>(transport: &mut T, mode: Mode, settings: SamplerSettings) -> Result<Self, TestError> {
        settings.validate()?;
        let started = Instant::now();

        let banner = transport.hello()?;
        let banner = banner.trim();
        debug!(server = %banner, "Hello");
        if !banner.starts_with("hello") {
            return Err(TestError::Protocol(format!(
                "expected hello response from server, got: {banner:?}"
            )));
        }

        Ok(Self {
            mode,
            projected_bytes: settings.initial_bytes(mode).max(1),
            ewma_rate: Ewma::new(settings.ewma_weight),
            ewma_elapsed: Ewma::new(settings.ewma_weight),
            samples: Vec::new(),
            phase: Phase::RampUp,
            requests: 1,
            started,
            settings,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn projected_bytes(&self) -> u64 {
        self.projected_bytes
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Smoothed elapsed time relative to the target.
    pub fn confidence(&self) -> f64 {
        self.ewma_elapsed.average().as_secs_f64() / self.settings.target.as_secs_f64()
    }

    /// Issues one request and advances the state machine.
    ///
    /// A failed step records nothing.
    pub fn step<T: Transport>(&mut self, transport: &mut T, stop: &StopFlag) -> Result<Outcome, TestError> {
        if self.phase == Phase::Done {
            return Ok(Outcome::Finished);
        }
        if stop.load(Ordering::Relaxed) {
            return Err(TestError::Interrupted);
        }

        let size = self.projected_bytes;
        self.requests += 1;
        let sample = match self.mode {
            Mode::Download => {
                debug!(bytes = size, "Requesting download payload");
                let reply = transport.download(size, stop)?;
                if reply.received != size {
                    return Err(TestError::Protocol(format!(
                        "requested {size} bytes from server, got {}",
                        reply.received
                    )));
                }
                Sample::new(size, reply.elapsed)?
            }
            Mode::Upload => {
                debug!(bytes = size, "Sending upload payload");
                let reply = transport.upload(Payload::new(size), stop)?;
                let confirmed = parse_confirmation(&reply.confirmation)?;
                if confirmed != size {
                    return Err(TestError::Protocol(format!(
                        "expected confirmation of {size} bytes from server, got {confirmed}"
                    )));
                }
                Sample::new(size, reply.elapsed)?
            }
        };
        debug!(
            bytes = sample.bytes,
            elapsed_ms = sample.elapsed.as_secs_f64() * 1000.0,
            rate_bps = sample.rate_bps,
            "Transfer finished"
        );

        if self.phase == Phase::RampUp {
            if !self.settings.ramp_up_band.contains(sample.elapsed, self.settings.target) {
                self.projected_bytes = self.settings.projected_bytes(sample.rate_bps);
                debug!(
                    elapsed_ms = sample.elapsed.as_secs_f64() * 1000.0,
                    target_ms = self.settings.target.as_secs_f64() * 1000.0,
                    next_bytes = self.projected_bytes,
                    "Confidence not yet high on early sample, not counting it"
                );
                return Ok(Outcome::Discarded(sample));
            }
            self.phase = Phase::Steady;
        }

        self.ewma_rate.add(sample.rate_bps);
        self.ewma_elapsed.add(sample.elapsed);
        self.samples.push(sample);
        debug!(
            ewma_bps = self.ewma_rate.average(),
            ewma_elapsed_ms = self.ewma_elapsed.average().as_secs_f64() * 1000.0,
            samples = self.samples.len(),
            "EWMA updated"
        );

        let count = self.samples.len();
        if count >= self.settings.max_samples {
            debug!(samples = count, "Reached maximum samples");
            self.phase = Phase::Done;
        } else if count >= self.settings.min_samples
            && self
                .settings
                .convergence_band
                .contains(self.ewma_elapsed.average(), self.settings.target)
        {
            debug!(samples = count, "Converged");
            self.phase = Phase::Done;
        } else {
            self.projected_bytes = self.settings.projected_bytes(self.ewma_rate.average());
        }

        Ok(Outcome::Recorded(sample))
    }

    pub fn summary(&self) -> Summary {
        let rates: Vec<f64> = self.samples.iter().map(|s| s.rate_bps).collect();
        let stdev_bps = sample_stdev(&rates);
        let (min_bps, max_bps) = if stdev_bps.is_some() {
            (
                rates.iter().copied().reduce(f64::min),
                rates.iter().copied().reduce(f64::max),
            )
        } else {
            (None, None)
        };
        Summary {
            mode: self.mode,
            rate_bps: self.ewma_rate.average(),
            bytes: self.samples.iter().map(|s| s.bytes).sum(),
            samples: self.samples.len(),
            requests: self.requests,
            duration: self.started.elapsed(),
            mean_elapsed: self.ewma_elapsed.average(),
            stdev_bps,
            min_bps,
            max_bps,
        }
    }
}

/// Parses an upload confirmation of the form `size=N`.
fn parse_confirmation(body: &str) -> Result<u64, TestError> {
    let body = body.trim();
    body.split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "size")
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .ok_or_else(|| TestError::Protocol(format!("expected size=N confirmation from server, got: {body:?}")))
}

/// Runs a whole test to completion.
pub fn run<T: Transport>(
    transport: &mut T,
    mode: Mode,
    settings: &SamplerSettings,
    stop: &StopFlag,
    progress: Option<&Sender<Progress>>,
) -> Result<Summary, TestError> {
    let mut session = Session::start(transport, mode, settings.clone())?;
    while session.phase() != Phase::Done {
        let event = match session.step(transport, stop)? {
            Outcome::Discarded(sample) => Progress::RampUp {
                mode,
                rate_bps: sample.rate_bps,
                requests: session.requests(),
            },
            Outcome::Recorded(_) => Progress::Steady {
                mode,
                ewma_rate_bps: session.ewma_rate.average(),
                confidence: session.confidence(),
                requests: session.requests(),
            },
            Outcome::Finished => break,
        };
        if let Some(tx) = progress {
            let _ = tx.send(event);
        }
    }
    if let Some(tx) = progress {
        let _ = tx.send(Progress::Finished { mode });
    }

    let summary = session.summary();
    info!(
        mode = %mode,
        rate_bps = summary.rate_bps,
        samples = summary.samples,
        requests = summary.requests,
        "Test finished"
    );
    Ok(summary)
}
