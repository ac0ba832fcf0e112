use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use thiserror::Error;

use super::{
    Command, Decoded, DeviceMode, LinkState, PendingCommand, ADC_RESPONSE_LEN, CONSOLE_PROBE,
    CONSOLE_RESET, MAX_READ_LEN,
};
use crate::lock;
use crate::port::Transport;
use crate::shutdown::Shutdown;

/// Pause after a failed read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Granularity at which handshake waits notice shutdown.
const WAIT_SLICE: Duration = Duration::from_millis(50);

pub type SampleSink = Box<dyn FnMut(u16) + Send>;

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Maximum number of probe bytes sent per handshake.
    pub attempts: usize,
    /// Wait between two probes.
    pub interval: Duration,
    /// Overall limit for one handshake, regardless of attempts left.
    pub timeout: Option<Duration>,
}

impl HandshakeConfig {
    /// End of a handshake started now. Timeouts too large to represent
    /// mean no limit.
    fn deadline(&self) -> Option<Instant> {
        self.timeout
            .and_then(|timeout| Instant::now().checked_add(timeout))
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            attempts: 40,
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    pub handshake: HandshakeConfig,
    /// Close the link for good when the device falls back to its console
    /// prompt. Otherwise the reader keeps listening for mode tokens.
    pub close_on_console: bool,
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no response to console probe after {0} attempts")]
    SyncTimeout(usize),
    #[error("binary mode not confirmed after {0} attempts")]
    BinaryModeTimeout(usize),
    #[error("device did not enter {0} mode")]
    ModeSwitchTimeout(DeviceMode),
    #[error("{0} is not a binary sub-mode")]
    InvalidMode(DeviceMode),
    #[error("device mode unknown, synchronize first")]
    NotSynchronized,
    #[error("device link closed")]
    Closed,
    #[error("driver shut down")]
    Cancelled,
    #[error("can't spawn {0} thread")]
    Spawn(&'static str, #[source] io::Error),
    #[error(transparent)]
    Transport(#[from] io::Error),
}

#[derive(Default)]
struct Link {
    state: LinkState,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    link: Mutex<Link>,
    changed: Condvar,
    sink: Mutex<Option<SampleSink>>,
}

enum Wait {
    Ready,
    Elapsed,
    Expired,
}

/// Session with one Bus Pirate.
///
/// A background reader owns a clone of the transport and decodes
/// everything the device sends; the methods here only write commands and
/// wait for the reader to observe the answer.
pub struct BusPirate {
    shared: Arc<Shared>,
    port: Mutex<Box<dyn Transport>>,
    config: DriverConfig,
    shutdown: Shutdown,
    reader: Option<JoinHandle<()>>,
}

impl BusPirate {
    pub fn new(
        mut port: Box<dyn Transport>,
        config: DriverConfig,
        shutdown: Shutdown,
    ) -> Result<Self, DriverError> {
        port.set_min_read(1)?;
        let reader_port = port.try_clone_transport()?;

        let shared = Arc::new(Shared::default());
        let reader = {
            let shared = Arc::clone(&shared);
            let shutdown = shutdown.clone();
            let close_on_console = config.close_on_console;
            thread::Builder::new()
                .name("buspirate-reader".into())
                .spawn(move || read_loop(reader_port, shared, shutdown, close_on_console))
                .map_err(|e| DriverError::Spawn("reader", e))?
        };

        Ok(Self {
            shared,
            port: Mutex::new(port),
            config,
            shutdown,
            reader: Some(reader),
        })
    }

    pub fn mode(&self) -> DeviceMode {
        lock(&self.shared.link).state.mode
    }

    pub fn pending(&self) -> PendingCommand {
        lock(&self.shared.link).state.pending
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.link).closed
    }

    /// Installs the callback run on the reader thread for every decoded
    /// ADC word. It must return quickly.
    pub fn install_sample_sink<F>(&self, sink: F)
    where
        F: FnMut(u16) + Send + 'static,
    {
        *lock(&self.shared.sink) = Some(Box::new(sink));
    }

    /// Probes the console with line feeds until the device announces any
    /// mode.
    pub fn sync(&self) -> Result<(), DriverError> {
        let attempts = self.config.handshake.attempts;
        self.handshake(CONSOLE_PROBE, |state| state.mode != DeviceMode::Unknown)?
            .then(|| ())
            .ok_or(DriverError::SyncTimeout(attempts))
    }

    /// Reboots the device console. Needs a synchronized device.
    pub fn reset(&self) -> Result<(), DriverError> {
        if self.mode() == DeviceMode::Unknown {
            return Err(DriverError::NotSynchronized);
        }

        self.set_state(|state| {
            state.mode = DeviceMode::Unknown;
            state.set_pending(PendingCommand::Idle);
        });
        self.send(CONSOLE_RESET)?;

        // the reboot banner may or may not end in a prompt
        match self.wait_for(self.config.handshake.interval, None, |state| {
            state.mode != DeviceMode::Unknown
        })? {
            Wait::Ready => debug!("reset: device reports {} mode", self.mode()),
            Wait::Elapsed | Wait::Expired => debug!("reset: no prompt yet"),
        }
        Ok(())
    }

    /// Sends zero bytes until the device confirms binary base mode.
    /// Resending is harmless once the device is already there.
    pub fn enter_binary(&self) -> Result<(), DriverError> {
        let attempts = self.config.handshake.attempts;
        self.handshake(&[Command::EnterBinary.byte()], |state| {
            state.mode == DeviceMode::BinaryBase
        })?
        .then(|| info!("binary mode confirmed"))
        .ok_or(DriverError::BinaryModeTimeout(attempts))
    }

    /// Moves from binary base mode into one of its protocol sub-modes.
    ///
    /// The entry byte is sent once: inside a sub-mode it would mean
    /// something else.
    pub fn switch_mode(&self, target: DeviceMode) -> Result<(), DriverError> {
        let command = target
            .entry_command()
            .ok_or(DriverError::InvalidMode(target))?;

        match self.mode() {
            mode if mode == target => return Ok(()),
            DeviceMode::BinaryBase => (),
            _ => return Err(DriverError::NotSynchronized),
        }

        self.send(&[command.byte()])?;

        let hs = &self.config.handshake;
        let budget = u32::try_from(hs.attempts)
            .ok()
            .and_then(|attempts| hs.interval.checked_mul(attempts))
            .unwrap_or(Duration::MAX);
        match self.wait_for(budget, hs.deadline(), |state| {
            state.mode == target
        })? {
            Wait::Ready => Ok(()),
            Wait::Elapsed | Wait::Expired => Err(DriverError::ModeSwitchTimeout(target)),
        }
    }

    /// Drops the device back to its text console.
    pub fn reset_to_console(&self) -> Result<(), DriverError> {
        self.set_state(|state| {
            state.mode = DeviceMode::Unknown;
            state.set_pending(PendingCommand::Idle);
        });
        self.send(&[Command::ResetToConsole.byte()])
    }

    /// Requests one ADC reading; the reader delivers it to the sample sink
    /// and then treats further input as text again.
    pub fn request_single_shot(&self) -> Result<(), DriverError> {
        self.request(PendingCommand::AdcSingleShot)
    }

    /// Starts unprompted ADC streaming.
    pub fn request_continuous(&self) -> Result<(), DriverError> {
        self.request(PendingCommand::AdcContinuous)
    }

    /// Stops the reader. Pending and future requests fail with `Cancelled`.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        self.shared.changed.notify_all();
    }

    fn request(&self, pending: PendingCommand) -> Result<(), DriverError> {
        let command = match pending.command() {
            Some(command) => command,
            None => return Ok(()),
        };

        self.ensure_open()?;
        lock(&self.port).set_min_read(ADC_RESPONSE_LEN as u8)?;
        self.set_state(|state| state.set_pending(pending));
        self.send(&[command.byte()])
    }

    fn handshake<P>(&self, probe: &[u8], done: P) -> Result<bool, DriverError>
    where
        P: Fn(&LinkState) -> bool,
    {
        let hs = &self.config.handshake;
        let deadline = hs.deadline();

        for attempt in 1..=hs.attempts {
            if done(&lock(&self.shared.link).state) {
                return Ok(true);
            }

            debug!("handshake attempt {}/{}", attempt, hs.attempts);
            self.send(probe)?;

            match self.wait_for(hs.interval, deadline, &done)? {
                Wait::Ready => return Ok(true),
                Wait::Elapsed => (),
                Wait::Expired => return Ok(false),
            }
        }

        Ok(done(&lock(&self.shared.link).state))
    }

    /// Waits up to `interval` (and never past `deadline`) for the reader to
    /// reach a state satisfying `done`.
    fn wait_for<P>(
        &self,
        interval: Duration,
        deadline: Option<Instant>,
        done: P,
    ) -> Result<Wait, DriverError>
    where
        P: Fn(&LinkState) -> bool,
    {
        // an interval past the end of the clock never elapses
        let interval_end = Instant::now().checked_add(interval);
        let (end, outcome) = match (deadline, interval_end) {
            (Some(deadline), Some(interval_end)) if deadline <= interval_end => {
                (Some(deadline), Wait::Expired)
            }
            (Some(deadline), None) => (Some(deadline), Wait::Expired),
            (_, interval_end) => (interval_end, Wait::Elapsed),
        };

        let mut link = lock(&self.shared.link);
        loop {
            if done(&link.state) {
                return Ok(Wait::Ready);
            }
            if self.shutdown.is_triggered() {
                return Err(DriverError::Cancelled);
            }
            if link.closed {
                return Err(DriverError::Closed);
            }

            let slice = match end {
                Some(end) => {
                    let now = Instant::now();
                    if now >= end {
                        return Ok(outcome);
                    }
                    (end - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            link = match self.shared.changed.wait_timeout(link, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn set_state<F: FnOnce(&mut LinkState)>(&self, update: F) {
        update(&mut lock(&self.shared.link).state);
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.shutdown.is_triggered() {
            Err(DriverError::Cancelled)
        } else if self.is_closed() {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }

    fn send(&self, bytes: &[u8]) -> Result<(), DriverError> {
        self.ensure_open()?;

        debug!("send {:02x?}", bytes);
        let mut port = lock(&self.port);
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }
}

impl Drop for BusPirate {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("reader thread panicked");
            }
        }
    }
}

fn read_loop(
    mut port: Box<dyn Transport>,
    shared: Arc<Shared>,
    shutdown: Shutdown,
    close_on_console: bool,
) {
    let mut buf = [0u8; MAX_READ_LEN];

    debug!("reader: begin");
    while !shutdown.is_triggered() {
        let len = lock(&shared.link).state.read_len();

        let n = match port.read(&mut buf[..len]) {
            Ok(0) => {
                shutdown.wait_timeout(READ_ERROR_BACKOFF);
                continue;
            }
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                error!("reader: read failed: {}", e);
                shutdown.wait_timeout(READ_ERROR_BACKOFF);
                continue;
            }
        };

        let (decoded, closing) = {
            let mut link = lock(&shared.link);
            let decoded = link.state.decode(&buf[..n]);
            let closing = close_on_console
                && decoded.contains(&Decoded::Mode(DeviceMode::Ascii));
            if closing {
                link.closed = true;
            }
            (decoded, closing)
        };

        for item in decoded {
            match item {
                Decoded::Sample(sample) => {
                    trace!("reader: sample {:#06x}", sample);
                    if let Some(sink) = lock(&shared.sink).as_mut() {
                        sink(sample);
                    }
                }
                Decoded::Mode(mode) => {
                    info!("entered {} mode", mode);
                    shared.changed.notify_all();
                }
                Decoded::Unrecognized(e) => warn!("reader: {} ({} bytes)", e, n),
            }
        }

        if closing {
            info!("reader: device fell back to console, closing link");
            break;
        }
    }

    lock(&shared.link).closed = true;
    shared.changed.notify_all();
    debug!("reader: end");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn fast_config(attempts: usize, interval_ms: u64) -> DriverConfig {
        DriverConfig {
            handshake: HandshakeConfig {
                attempts,
                interval: Duration::from_millis(interval_ms),
                timeout: None,
            },
            close_on_console: false,
        }
    }

    fn driver(mock: &MockTransport, config: DriverConfig) -> BusPirate {
        BusPirate::new(Box::new(mock.clone()), config, Shutdown::new()).unwrap()
    }

    fn binary_device() -> MockTransport {
        MockTransport::with_responder(|written| match written {
            [0x00] => Some(b"BBIO1".to_vec()),
            _ => None,
        })
    }

    #[test]
    fn sync_times_out_after_exact_budget() {
        let mock = MockTransport::new();
        let bp = driver(&mock, fast_config(5, 2));

        assert!(matches!(bp.sync(), Err(DriverError::SyncTimeout(5))));
        assert_eq!(mock.written(CONSOLE_PROBE), 5);
        assert_eq!(mock.writes().len(), 5);
        assert_eq!(bp.mode(), DeviceMode::Unknown);
    }

    #[test]
    fn sync_stops_at_prompt() {
        let probes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&probes);
        let mock = MockTransport::with_responder(move |written| {
            if written == CONSOLE_PROBE && seen.fetch_add(1, Ordering::SeqCst) == 2 {
                Some(b"HiZ>".to_vec())
            } else {
                None
            }
        });
        let bp = driver(&mock, fast_config(40, 100));

        bp.sync().unwrap();
        assert_eq!(bp.mode(), DeviceMode::Ascii);
        assert_eq!(mock.written(CONSOLE_PROBE), 3);
        assert!(!bp.is_closed());
    }

    #[test]
    fn sync_respects_overall_timeout() {
        let mock = MockTransport::new();
        let mut config = fast_config(1000, 10);
        config.handshake.timeout = Some(Duration::from_millis(50));
        let bp = driver(&mock, config);

        let start = Instant::now();
        assert!(matches!(bp.sync(), Err(DriverError::SyncTimeout(1000))));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(mock.written(CONSOLE_PROBE) < 1000);
    }

    #[test]
    fn sync_is_cancellable() {
        let mock = MockTransport::new();
        let shutdown = Shutdown::new();
        let bp =
            BusPirate::new(Box::new(mock.clone()), fast_config(40, 1000), shutdown.clone()).unwrap();

        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            shutdown.trigger();
        });

        let start = Instant::now();
        assert!(matches!(bp.sync(), Err(DriverError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
        trigger.join().unwrap();
    }

    #[test]
    fn enter_binary_confirms() {
        let mock = binary_device();
        let bp = driver(&mock, fast_config(40, 500));

        bp.enter_binary().unwrap();
        assert_eq!(bp.mode(), DeviceMode::BinaryBase);
        assert_eq!(mock.written(&[0x00]), 1);

        // already there: nothing more is sent
        bp.enter_binary().unwrap();
        assert_eq!(mock.written(&[0x00]), 1);
    }

    #[test]
    fn enter_binary_needs_repeated_zeroes() {
        let zeroes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&zeroes);
        let mock = MockTransport::with_responder(move |written| {
            if written == [0x00] && seen.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                Some(b"BBIO1".to_vec())
            } else {
                None
            }
        });
        let bp = driver(&mock, fast_config(40, 20));

        bp.enter_binary().unwrap();
        assert!(mock.written(&[0x00]) >= 3);
    }

    #[test]
    fn enter_binary_times_out() {
        let mock = MockTransport::new();
        let bp = driver(&mock, fast_config(3, 5));

        assert!(matches!(
            bp.enter_binary(),
            Err(DriverError::BinaryModeTimeout(3))
        ));
        assert_eq!(mock.written(&[0x00]), 3);
    }

    #[test]
    fn single_shot_delivers_one_sample() {
        let mock = MockTransport::with_responder(|written| match written {
            [0x00] => Some(b"BBIO1".to_vec()),
            [0x14] => Some(vec![0x01, 0x80]),
            _ => None,
        });
        let bp = driver(&mock, fast_config(40, 500));
        bp.enter_binary().unwrap();

        let (tx, rx) = mpsc::channel();
        bp.install_sample_sink(move |sample| {
            let _ = tx.send(sample);
        });

        bp.request_single_shot().unwrap();
        assert_eq!(mock.min_read(), ADC_RESPONSE_LEN as u8);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(0x0180));
        assert_eq!(bp.pending(), PendingCommand::Idle);

        // unrelated two bytes without a request are not a sample
        mock.feed(&[0x02, 0x00]);
        assert!(mock.wait_drained(Duration::from_secs(2)));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(bp.pending(), PendingCommand::Idle);
    }

    #[test]
    fn continuous_streams_until_dropped() {
        let mock = binary_device();
        let bp = driver(&mock, fast_config(40, 500));
        bp.enter_binary().unwrap();

        let (tx, rx) = mpsc::channel();
        bp.install_sample_sink(move |sample| {
            let _ = tx.send(sample);
        });
        bp.request_continuous().unwrap();
        assert_eq!(mock.written(&[0x15]), 1);

        for raw in [100u16, 200, 300] {
            mock.feed(&raw.to_be_bytes());
        }

        let got: Vec<u16> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(got, vec![100, 200, 300]);
        assert_eq!(bp.pending(), PendingCommand::AdcContinuous);
    }

    #[test]
    fn continuous_burst_stays_aligned() {
        let mock = MockTransport::with_responder(|written| match written {
            [0x00] => Some(b"BBIO1".to_vec()),
            [0x15] => Some(vec![0x00, 0x64, 0x00, 0xc8, 0x01]),
            _ => None,
        });
        let bp = driver(&mock, fast_config(40, 500));
        bp.enter_binary().unwrap();

        let (tx, rx) = mpsc::channel();
        bp.install_sample_sink(move |sample| {
            let _ = tx.send(sample);
        });
        bp.request_continuous().unwrap();
        mock.feed(&[0x2c, 0x01, 0x90]);

        let got: Vec<u16> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(got, vec![100, 200, 300, 400]);
    }

    #[test]
    fn reader_survives_transport_error() {
        let mock = binary_device();
        let bp = driver(&mock, fast_config(40, 500));
        bp.enter_binary().unwrap();

        let (tx, rx) = mpsc::channel();
        bp.install_sample_sink(move |sample| {
            let _ = tx.send(sample);
        });
        bp.request_continuous().unwrap();

        mock.fail_next_read(io::ErrorKind::BrokenPipe);
        let deadline = Instant::now() + Duration::from_secs(2);
        while mock.failures_left() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(mock.failures_left(), 0);

        mock.feed(&512u16.to_be_bytes());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(512));
        assert!(!bp.is_closed());
    }

    #[test]
    fn unrecognized_text_is_not_fatal() {
        let mock = binary_device();
        let bp = driver(&mock, fast_config(40, 500));

        mock.feed(b"garbage");
        assert!(mock.wait_drained(Duration::from_secs(2)));

        bp.enter_binary().unwrap();
        assert_eq!(bp.mode(), DeviceMode::BinaryBase);
    }

    #[test]
    fn console_fallback_closes_when_configured() {
        let mock = MockTransport::with_responder(|written| match written {
            b"\n" => Some(b"HiZ>".to_vec()),
            _ => None,
        });
        let mut config = fast_config(40, 500);
        config.close_on_console = true;
        let bp = driver(&mock, config);

        bp.sync().unwrap();
        assert_eq!(bp.mode(), DeviceMode::Ascii);
        assert!(bp.is_closed());
        assert!(matches!(bp.request_single_shot(), Err(DriverError::Closed)));
    }

    #[test]
    fn switch_mode_waits_for_token() {
        let mock = MockTransport::with_responder(|written| match written {
            [0x00] => Some(b"BBIO1".to_vec()),
            [0x01] => Some(b"SPI1".to_vec()),
            _ => None,
        });
        let bp = driver(&mock, fast_config(40, 500));

        assert!(matches!(
            bp.switch_mode(DeviceMode::BinarySpi),
            Err(DriverError::NotSynchronized)
        ));

        bp.enter_binary().unwrap();
        bp.switch_mode(DeviceMode::BinarySpi).unwrap();
        assert_eq!(bp.mode(), DeviceMode::BinarySpi);

        assert!(matches!(
            bp.switch_mode(DeviceMode::Ascii),
            Err(DriverError::InvalidMode(DeviceMode::Ascii))
        ));
    }

    #[test]
    fn huge_budgets_do_not_overflow() {
        let mock = MockTransport::with_responder(|written| match written {
            b"\n" => Some(b"HiZ>".to_vec()),
            [0x00] => Some(b"BBIO1".to_vec()),
            [0x01] => Some(b"SPI1".to_vec()),
            _ => None,
        });
        let config = DriverConfig {
            handshake: HandshakeConfig {
                attempts: usize::MAX,
                interval: Duration::from_secs(u64::MAX / 2),
                timeout: Some(Duration::MAX),
            },
            close_on_console: false,
        };
        let bp = driver(&mock, config);

        bp.sync().unwrap();
        bp.enter_binary().unwrap();
        bp.switch_mode(DeviceMode::BinarySpi).unwrap();
        assert_eq!(bp.mode(), DeviceMode::BinarySpi);
    }

    #[test]
    fn switch_mode_times_out() {
        let mock = binary_device();
        let bp = driver(&mock, fast_config(2, 10));
        bp.enter_binary().unwrap();

        assert!(matches!(
            bp.switch_mode(DeviceMode::BinaryI2c),
            Err(DriverError::ModeSwitchTimeout(DeviceMode::BinaryI2c))
        ));
        assert_eq!(mock.written(&[0x02]), 1);
    }

    #[test]
    fn reset_requires_sync() {
        let mock = MockTransport::new();
        let bp = driver(&mock, fast_config(1, 5));

        assert!(matches!(bp.reset(), Err(DriverError::NotSynchronized)));
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn reset_sends_console_reset() {
        let mock = MockTransport::with_responder(|written| match written {
            b"\n" | b"#\n" => Some(b"HiZ>".to_vec()),
            _ => None,
        });
        let bp = driver(&mock, fast_config(40, 500));

        bp.sync().unwrap();
        bp.reset().unwrap();
        assert_eq!(mock.written(CONSOLE_RESET), 1);
        assert_eq!(bp.mode(), DeviceMode::Ascii);
    }

    #[test]
    fn reset_to_console_clears_state() {
        let mock = binary_device();
        let bp = driver(&mock, fast_config(40, 500));
        bp.enter_binary().unwrap();
        bp.request_continuous().unwrap();

        bp.reset_to_console().unwrap();
        assert_eq!(bp.mode(), DeviceMode::Unknown);
        assert_eq!(bp.pending(), PendingCommand::Idle);
        assert_eq!(mock.written(&[0x0F]), 1);
    }

    #[test]
    fn requests_fail_after_shutdown() {
        let mock = MockTransport::new();
        let bp = driver(&mock, fast_config(1, 5));

        bp.shutdown();
        assert!(matches!(bp.request_continuous(), Err(DriverError::Cancelled)));
        assert!(mock.writes().is_empty());
    }
}
