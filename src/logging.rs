//! `log` backend that keeps formatting and stderr writes off the event loop.
//!
//! The hot side only formats the message and pushes it into an SPSC ring; a
//! cold thread pinned to its own core pops and writes. A full ring drops the
//! record and counts it instead of blocking.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use core_affinity::CoreId;
use log::{Level, LevelFilter, Log, Metadata, Record};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::error::ServerError;

pub const LOG_RING_CAPACITY: usize = 4096;

/// Upper bound on how long `flush` waits for the drain thread.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// Time since the logger was installed.
    pub elapsed: Duration,
    pub level: Level,
    pub target: String,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>10.3}s {:<5} {}] {}",
            self.elapsed.as_secs_f64(),
            self.level,
            self.target,
            self.text
        )
    }
}

struct RingLogger {
    producer: Mutex<Producer<LogLine>>,
    level: LevelFilter,
    start: Instant,
    dropped: Arc<AtomicU64>,
    /// Lines pushed but not yet written by the drain thread.
    pending: Arc<AtomicUsize>,
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = LogLine {
            elapsed: self.start.elapsed(),
            level: record.level(),
            target: record.target().to_string(),
            text: record.args().to_string(),
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        let pushed = match self.producer.lock() {
            Ok(mut producer) => producer.push(line).is_ok(),
            Err(_) => false,
        };
        if !pushed {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Blocks until the drain thread has written every queued line, or the
    /// timeout passes.
    fn flush(&self) {
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        while self.pending.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn drain(
    mut consumer: Consumer<LogLine>,
    dropped: Arc<AtomicU64>,
    pending: Arc<AtomicUsize>,
    core: Option<CoreId>,
) {
    if let Some(core) = core {
        core_affinity::set_for_current(core);
    }

    let mut reported = 0;
    loop {
        match consumer.pop() {
            Ok(line) => {
                let _ = writeln!(io::stderr().lock(), "{line}");
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            Err(_) => {
                let total = dropped.load(Ordering::Relaxed);
                if total != reported {
                    let _ = writeln!(io::stderr().lock(), "[log] {} lines dropped", total - reported);
                    reported = total;
                }
                if consumer.is_abandoned() {
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Installs the ring logger and starts the drain thread on `cold_core`.
pub fn init(level: LevelFilter, cold_core: Option<CoreId>) -> Result<JoinHandle<()>, ServerError> {
    let (producer, consumer) = RingBuffer::<LogLine>::new(LOG_RING_CAPACITY);
    let dropped = Arc::new(AtomicU64::new(0));
    let pending = Arc::new(AtomicUsize::new(0));

    log::set_boxed_logger(Box::new(RingLogger {
        producer: Mutex::new(producer),
        level,
        start: Instant::now(),
        dropped: Arc::clone(&dropped),
        pending: Arc::clone(&pending),
    }))?;
    log::set_max_level(level);

    let handle = thread::Builder::new()
        .name("log-drain".into())
        .spawn(move || drain(consumer, dropped, pending, cold_core))?;
    Ok(handle)
}
