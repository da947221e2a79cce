//! Bounded asynchronous stderr logger.
//!
//! Serving threads hand formatted lines to a writer thread over a
//! bounded channel and never wait for I/O: when the queue is full the
//! line is dropped and counted. Level filtering happens before
//! formatting.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::thread;

use log::{LevelFilter, Log, Metadata, Record};

struct AsyncLog {
    tx: SyncSender<String>,
    level: LevelFilter,
    dropped: AtomicUsize,
}

impl Log for AsyncLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{:<5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
        if let Err(TrySendError::Full(_)) = self.tx.try_send(line) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self) {}
}

/// Map the numeric config level (0 = most verbose) onto the facade.
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Debug,
        1 => LevelFilter::Info,
        2 => LevelFilter::Warn,
        _ => LevelFilter::Error,
    }
}

/// Install the logger. Call once, before the server starts logging.
pub fn init(level: LevelFilter, queue_depth: usize) {
    let (tx, rx) = sync_channel::<String>(queue_depth.max(1));

    thread::Builder::new()
        .name("skiff-log".into())
        .spawn(move || {
            let stderr = std::io::stderr();
            for line in rx {
                let _ = writeln!(stderr.lock(), "{}", line);
            }
        })
        .expect("failed to spawn log thread");

    let logger = AsyncLog {
        tx,
        level,
        dropped: AtomicUsize::new(0),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(level);
    }
}
