//! Logging backend for the Garnet binaries.
//!
//! The hot path does one bounded-channel send per record; a dedicated writer
//! thread formats and writes. Timestamps are captured at the call site, so a
//! record queued behind a burst still carries the moment it was logged.

use chrono::{DateTime, Local};
use log::{Level, Log, SetLoggerError, set_boxed_logger, set_max_level};
use std::io::{BufWriter, Stdout, Write, stdout};
use std::sync::mpsc;
use std::thread;

enum Command {
    Line {
        at: DateTime<Local>,
        level: Level,
        target: String,
        message: String,
    },
    Flush,
}

pub struct GarnetLogger {
    max_level: Level,
    tx: mpsc::SyncSender<Command>,
}

impl GarnetLogger {
    /// Installs the logger as the global `log` backend and spawns its writer
    /// thread. `buffer_size` bounds how many records may queue; past that,
    /// records are dropped rather than stalling the caller.
    pub fn init(max_level: Level, buffer_size: usize) -> Result<(), SetLoggerError> {
        let (tx, rx) = mpsc::sync_channel(buffer_size);

        thread::Builder::new()
            .name("garnet-log-writer".into())
            .spawn(move || run_writer(rx))
            .expect("failed to spawn logger thread");

        set_boxed_logger(Box::new(GarnetLogger { max_level, tx }))?;
        set_max_level(max_level.to_level_filter());
        Ok(())
    }
}

impl Log for GarnetLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = self.tx.try_send(Command::Line {
            at: Local::now(),
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {
        let _ = self.tx.send(Command::Flush);
    }
}

/// Writer loop: drain each burst completely, flush once it passes. The
/// buffer also flushes when the channel closes on shutdown.
fn run_writer(rx: mpsc::Receiver<Command>) {
    let mut out = BufWriter::new(stdout());
    while let Ok(command) = rx.recv() {
        handle_command(&mut out, command);
        while let Ok(command) = rx.try_recv() {
            handle_command(&mut out, command);
        }
        let _ = out.flush();
    }
    let _ = out.flush();
}

fn handle_command(out: &mut BufWriter<Stdout>, command: Command) {
    match command {
        Command::Line {
            at,
            level,
            target,
            message,
        } => {
            let line = format_line(at, level, &target, &message);
            if let Err(e) = out.write_all(line.as_bytes()) {
                eprintln!("garnet-log: failed to write record: {e}");
            }
        }
        Command::Flush => {
            if let Err(e) = out.flush() {
                eprintln!("garnet-log: failed to flush: {e}");
            }
        }
    }
}

fn format_line(at: DateTime<Local>, level: Level, target: &str, message: &str) -> String {
    format!(
        "{} {:<5} {}: {}\n",
        at.format("%H:%M:%S%.3f"),
        level,
        target,
        message
    )
}
