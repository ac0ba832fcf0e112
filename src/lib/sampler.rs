//! Shunt current sampling: ADC words from the driver go into a ring, a
//! periodic task averages the trailing window into amperes.

use std::convert::TryFrom;
use std::fmt::Display;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace};
use thiserror::Error;

use crate::protocol::{BusPirate, DriverError};
use crate::ring::{self, RingBuffer};
use crate::shutdown::{Shutdown, Ticker};

/// ADC counts per full scale.
pub const ADC_RESOLUTION: f64 = 1024.0;

/// Voltage at full scale on the Bus Pirate ADC probe.
pub const ADC_FULL_SCALE_VOLTS: f64 = 6.6;

/// Single-shot cadence used in triggered mode unless configured otherwise.
pub const DEFAULT_TRIGGER_PERIOD: Duration = Duration::from_millis(500);

/// Retention used when sizing the ring from a sample period.
pub const DEFAULT_HISTORY: Duration = Duration::from_secs(3600);

/// Largest ring a pipeline allocates, in samples.
pub const MAX_HISTORY: usize = 1 << 27;

/// Longest time between two reports.
pub const MAX_REPORT_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// Ten bits on the wire per byte, two bytes per streamed sample.
const BITS_PER_SAMPLE: f64 = 20.0;

const MIN_REPORT_PERIOD: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("sample period must be non-zero")]
    ZeroPeriod,
    #[error("history of {0} samples is outside 1..={max}", max = MAX_HISTORY)]
    History(usize),
    #[error("average count {0} is outside 1..=history ({1})")]
    AverageCount(usize, usize),
    #[error("report period {0:?} is longer than {max:?}", max = MAX_REPORT_PERIOD)]
    ReportPeriod(Duration),
    #[error("shunt resistance must be positive, got {0}")]
    Shunt(f64),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

pub fn raw_to_volts(raw: u16) -> f64 {
    f64::from(raw) / ADC_RESOLUTION * ADC_FULL_SCALE_VOLTS
}

/// Samples per second the device streams at `baudrate`.
pub fn continuous_sample_rate(baudrate: u32) -> f64 {
    f64::from(baudrate) / BITS_PER_SAMPLE
}

/// Time per streamed sample, rounded to whole nanoseconds. Sample counts
/// come from [`continuous_sample_rate`] instead.
pub fn continuous_sample_period(baudrate: u32) -> Duration {
    Duration::from_secs_f64(BITS_PER_SAMPLE / f64::from(baudrate.max(1)))
}

/// Number of samples covering `span` at `period`, at least one. A zero
/// period saturates.
pub fn samples_in(span: Duration, period: Duration) -> usize {
    if period.is_zero() {
        return usize::MAX;
    }
    ((span.as_secs_f64() / period.as_secs_f64()).round() as usize).max(1)
}

fn samples_at_rate(span: Duration, rate: f64) -> usize {
    ((span.as_secs_f64() * rate).round() as usize).max(1)
}

/// What the averaging task does when the ring holds no samples yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyWindow {
    /// Report a zero reading.
    ReportZero,
    /// Skip the report.
    Skip,
}

impl Default for EmptyWindow {
    fn default() -> Self {
        EmptyWindow::ReportZero
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// The device streams samples on its own at `baudrate`.
    Continuous { baudrate: u32 },
    /// One single-shot request per `period`.
    Triggered { period: Duration },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: SamplingMode,
    /// Expected time between two samples.
    pub sample_period: Duration,
    /// Trailing samples per reading.
    pub average_count: usize,
    /// Ring capacity in samples.
    pub history: usize,
    pub shunt_ohms: f64,
    pub empty_window: EmptyWindow,
}

impl PipelineConfig {
    /// Streaming at `baudrate`, one reading per second, one hour retained.
    pub fn continuous(baudrate: u32, shunt_ohms: f64) -> Self {
        let mut config = Self {
            mode: SamplingMode::Continuous { baudrate },
            sample_period: continuous_sample_period(baudrate),
            average_count: 1,
            history: 1,
            shunt_ohms,
            empty_window: EmptyWindow::default(),
        };
        config.average_count = config.samples_over(Duration::from_secs(1));
        config.history = config.samples_over(DEFAULT_HISTORY);
        config
    }

    /// One request per `period`, one reading per second, one hour retained.
    pub fn triggered(period: Duration, shunt_ohms: f64) -> Self {
        Self {
            mode: SamplingMode::Triggered { period },
            sample_period: period,
            average_count: samples_in(Duration::from_secs(1), period),
            history: samples_in(DEFAULT_HISTORY, period),
            shunt_ohms,
            empty_window: EmptyWindow::default(),
        }
    }

    /// Number of samples arriving over `span`, at least one.
    pub fn samples_over(&self, span: Duration) -> usize {
        match self.mode {
            SamplingMode::Continuous { baudrate } => {
                samples_at_rate(span, continuous_sample_rate(baudrate))
            }
            SamplingMode::Triggered { .. } => samples_in(span, self.sample_period),
        }
    }

    /// Time between two reports. Saturates instead of overflowing.
    pub fn report_period(&self) -> Duration {
        u32::try_from(self.average_count)
            .ok()
            .and_then(|count| self.sample_period.checked_mul(count))
            .unwrap_or(Duration::MAX)
            .max(MIN_REPORT_PERIOD)
    }

    /// Rejects settings that would stall the pipeline or exhaust memory.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sample_period.is_zero() {
            return Err(PipelineError::ZeroPeriod);
        }
        if self.history == 0 || self.history > MAX_HISTORY {
            return Err(PipelineError::History(self.history));
        }
        if self.average_count == 0 || self.average_count > self.history {
            return Err(PipelineError::AverageCount(self.average_count, self.history));
        }
        let report_period = self.report_period();
        if report_period > MAX_REPORT_PERIOD {
            return Err(PipelineError::ReportPeriod(report_period));
        }
        if self.shunt_ohms.is_nan() || self.shunt_ohms <= 0.0 {
            return Err(PipelineError::Shunt(self.shunt_ohms));
        }
        Ok(())
    }

    fn averager(&self) -> Averager {
        Averager {
            average_count: self.average_count,
            shunt_ohms: self.shunt_ohms,
            empty_window: self.empty_window,
        }
    }
}

/// One averaged measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Samples that went into the average.
    pub samples: usize,
    pub volts: f64,
    pub amps: f64,
}

impl Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.6} A ({:.4} V over {} samples)",
            self.amps, self.volts, self.samples
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Averager {
    pub average_count: usize,
    pub shunt_ohms: f64,
    pub empty_window: EmptyWindow,
}

impl Averager {
    /// Averages the newest `average_count` samples (or as many as are
    /// retained) and converts them to a current through the shunt.
    pub fn compute(&self, ring: &RingBuffer<u16>) -> Option<Reading> {
        let window = ring.last(self.average_count);
        let n = window.len();

        if n == 0 {
            return match self.empty_window {
                EmptyWindow::ReportZero => Some(Reading {
                    samples: 0,
                    volts: 0.0,
                    amps: 0.0,
                }),
                EmptyWindow::Skip => None,
            };
        }

        let volts = window.iter().map(|&raw| raw_to_volts(raw)).sum::<f64>() / n as f64;

        Some(Reading {
            samples: n,
            volts,
            amps: volts / self.shunt_ohms,
        })
    }
}

/// Running measurement session.
///
/// Dropping it stops the trigger and averaging tasks; the driver's reader
/// stops when the shared [`Shutdown`] fires.
pub struct SamplingPipeline {
    driver: Arc<BusPirate>,
    ring: Arc<RingBuffer<u16>>,
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
}

impl SamplingPipeline {
    /// Hooks a fresh ring onto `driver`, starts sampling in the configured
    /// mode and calls `report` with every reading. The driver must already
    /// be in binary mode.
    pub fn start<R>(
        driver: Arc<BusPirate>,
        config: PipelineConfig,
        shutdown: Shutdown,
        report: R,
    ) -> Result<Self, PipelineError>
    where
        R: FnMut(Reading) + Send + 'static,
    {
        config.validate()?;
        let (mut producer, ring) = ring::channel::<u16>(config.history);

        info!("Bus Pirate ADC sample-n-average");
        info!("  ADC sample period : {:?}", config.sample_period);
        info!("  average count     : {}", config.average_count);
        info!("  report period     : {:?}", config.report_period());
        info!("  history           : {} samples", config.history);
        info!("  shunt             : {} ohm", config.shunt_ohms);

        driver.install_sample_sink(move |raw| {
            trace!("sample {} ({:.4} V)", raw, raw_to_volts(raw));
            producer.push(raw);
        });

        let mut pipeline = Self {
            driver,
            ring,
            shutdown,
            tasks: Vec::new(),
        };

        match config.mode {
            SamplingMode::Continuous { .. } => pipeline.driver.request_continuous()?,
            SamplingMode::Triggered { period } => {
                let task = pipeline.spawn_trigger(period)?;
                pipeline.tasks.push(task);
            }
        }

        let task = pipeline.spawn_averager(&config, report)?;
        pipeline.tasks.push(task);

        Ok(pipeline)
    }

    pub fn ring(&self) -> &Arc<RingBuffer<u16>> {
        &self.ring
    }

    pub fn driver(&self) -> &Arc<BusPirate> {
        &self.driver
    }

    /// Blocks until the session is shut down.
    pub fn join(mut self) {
        self.join_tasks();
    }

    pub fn shutdown(self) {
        self.shutdown.trigger();
    }

    fn spawn_trigger(&self, period: Duration) -> Result<JoinHandle<()>, DriverError> {
        let driver = Arc::clone(&self.driver);
        let shutdown = self.shutdown.clone();

        thread::Builder::new()
            .name("adc-trigger".into())
            .spawn(move || {
                debug!("trigger: ready to loop");
                let mut ticker = Ticker::new(period);
                while ticker.wait(&shutdown) {
                    match driver.request_single_shot() {
                        Ok(()) => (),
                        Err(DriverError::Closed) | Err(DriverError::Cancelled) => {
                            error!("trigger: device link gone, stopping");
                            break;
                        }
                        Err(e) => error!("trigger: single shot request failed: {}", e),
                    }
                }
                debug!("trigger: end");
            })
            .map_err(|e| DriverError::Spawn("trigger", e))
    }

    fn spawn_averager<R>(
        &self,
        config: &PipelineConfig,
        mut report: R,
    ) -> Result<JoinHandle<()>, DriverError>
    where
        R: FnMut(Reading) + Send + 'static,
    {
        let ring = Arc::clone(&self.ring);
        let shutdown = self.shutdown.clone();
        let averager = config.averager();
        let period = config.report_period();

        thread::Builder::new()
            .name("adc-average".into())
            .spawn(move || {
                debug!("average: ready to loop");
                let mut ticker = Ticker::new(period);
                while ticker.wait(&shutdown) {
                    match averager.compute(&ring) {
                        Some(reading) => report(reading),
                        None => debug!("average: no samples yet"),
                    }
                }
                debug!("average: end");
            })
            .map_err(|e| DriverError::Spawn("average", e))
    }

    fn join_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            if task.join().is_err() {
                error!("sampling task panicked");
            }
        }
    }
}

impl Drop for SamplingPipeline {
    fn drop(&mut self) {
        self.shutdown.trigger();
        self.join_tasks();
    }
}
