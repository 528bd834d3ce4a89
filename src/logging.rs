//! Leveled logging sinks driven by the configuration store.
//!
//! Installs a single `tracing` subscriber per process with a reloadable
//! level filter and a swappable sink, so a configuration reload can
//! retarget log routing without touching the subscriber itself.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{CommonConfiguration, LOG_ROTATION_DISABLED, LogLevel, LogMode, LogType};
use crate::error::{Error, Result};

enum Sink {
    Console,
    File {
        file: File,
        path: PathBuf,
        prefix: String,
        written: u64,
        rotation_size: u64,
        rotation_age: Option<Duration>,
        opened: Instant,
        rotations: u32,
    },
}

impl Sink {
    fn open(common: &CommonConfiguration) -> Result<Sink> {
        match common.log_type {
            LogType::Console => Ok(Sink::Console),
            LogType::Syslog => {
                // No syslog transport is wired; route to the console
                // instead of dropping events.
                eprintln!("syslog log_type is not supported, logging to console");
                Ok(Sink::Console)
            }
            LogType::File => {
                let path = PathBuf::from(&common.log_path);
                let file = open_log_file(&path, common.log_mode).map_err(|e| {
                    Error::Config(crate::error::ConfigError::Validation(format!(
                        "could not open log file {}: {e}",
                        path.display()
                    )))
                })?;
                let written = file.metadata().map(|m| m.len()).unwrap_or(0);

                Ok(Sink::File {
                    file,
                    path,
                    prefix: common.log_line_prefix.clone(),
                    written,
                    rotation_size: common.log_rotation_size.max(0) as u64,
                    rotation_age: match common.log_rotation_age {
                        LOG_ROTATION_DISABLED => None,
                        age => Some(Duration::from_secs(age.max(0) as u64)),
                    },
                    opened: Instant::now(),
                    rotations: 0,
                })
            }
        }
    }

    fn write_event(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Console => std::io::stdout().write(buf),
            Sink::File {
                file,
                path,
                prefix,
                written,
                rotation_size,
                rotation_age,
                opened,
                rotations,
            } => {
                let rotate_by_size = *rotation_size > 0 && *written + buf.len() as u64 > *rotation_size;
                let rotate_by_age = rotation_age.is_some_and(|age| opened.elapsed() >= age);

                if rotate_by_size || rotate_by_age {
                    file.flush()?;
                    *rotations += 1;
                    let rotated = path.with_extension(format!("{rotations}"));
                    std::fs::rename(&*path, rotated)?;
                    *file = open_log_file(path, LogMode::Create)?;
                    *written = 0;
                    *opened = Instant::now();
                }

                if !prefix.is_empty() {
                    file.write_all(prefix.as_bytes())?;
                    *written += prefix.len() as u64;
                }
                file.write_all(buf)?;
                *written += buf.len() as u64;

                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Console => std::io::stdout().flush(),
            Sink::File { file, .. } => file.flush(),
        }
    }
}

fn open_log_file(path: &PathBuf, mode: LogMode) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    match mode {
        LogMode::Append => options.append(true),
        LogMode::Create => options.write(true).truncate(true),
    };

    options.open(path)
}

#[derive(Clone)]
struct SinkWriter(Arc<Mutex<Sink>>);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write_event(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SinkWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Fatal | LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug1 => "debug",
        _ => "trace",
    }
}

/// The process logger. Holds the reload handles a configuration reload
/// needs to retarget routing or adjust the level.
pub struct Logging {
    sink: Arc<Mutex<Sink>>,
    filter: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
}

impl Logging {
    /// Opens the configured sink and installs the global subscriber.
    pub fn start(common: &CommonConfiguration) -> Result<Logging> {
        let sink = Arc::new(Mutex::new(Sink::open(common)?));

        let filter = EnvFilter::new(directive(common.log_level));
        let (filter, handle) = reload::Layer::new(filter);

        let subscriber = tracing_subscriber::registry().with(filter).with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(SinkWriter(sink.clone())),
        );

        // A second start in the same process (tests) keeps the first
        // subscriber; the sink handle still swaps.
        let _ = subscriber.try_init();

        Ok(Logging {
            sink,
            filter: handle,
        })
    }

    /// Swaps the sink and level in place; the log-restart reload class.
    pub fn restart(&self, common: &CommonConfiguration) {
        match Sink::open(common) {
            Ok(sink) => *self.sink.lock() = sink,
            Err(e) => {
                eprintln!("could not reopen log sink, falling back to console: {e}");
                *self.sink.lock() = Sink::Console;
            }
        }

        self.set_level(common.log_level);
    }

    /// Adjusts the level filter; a hot reload field.
    pub fn set_level(&self, level: LogLevel) {
        let _ = self.filter.reload(EnvFilter::new(directive(level)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_common(dir: &std::path::Path, mode: LogMode) -> CommonConfiguration {
        CommonConfiguration {
            log_type: LogType::File,
            log_path: dir.join("pgvictoria.log").display().to_string(),
            log_mode: mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_directives() {
        assert_eq!("error", directive(LogLevel::Fatal));
        assert_eq!("error", directive(LogLevel::Error));
        assert_eq!("warn", directive(LogLevel::Warn));
        assert_eq!("info", directive(LogLevel::Info));
        assert_eq!("debug", directive(LogLevel::Debug1));
        assert_eq!("trace", directive(LogLevel::Debug2));
        assert_eq!("trace", directive(LogLevel::Debug5));
    }

    #[test]
    fn test_file_sink_writes_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut common = file_common(dir.path(), LogMode::Create);
        common.log_line_prefix = "pgv: ".into();

        let mut sink = Sink::open(&common).unwrap();
        sink.write_event(b"started\n").unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(dir.path().join("pgvictoria.log")).unwrap();
        assert_eq!("pgv: started\n", content);
    }

    #[test]
    fn test_append_mode_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let common = file_common(dir.path(), LogMode::Append);

        let mut sink = Sink::open(&common).unwrap();
        sink.write_event(b"one\n").unwrap();
        sink.flush().unwrap();
        drop(sink);

        let mut sink = Sink::open(&common).unwrap();
        sink.write_event(b"two\n").unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(dir.path().join("pgvictoria.log")).unwrap();
        assert_eq!("one\ntwo\n", content);
    }

    #[test]
    fn test_create_mode_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let common = file_common(dir.path(), LogMode::Create);

        let mut sink = Sink::open(&common).unwrap();
        sink.write_event(b"old\n").unwrap();
        sink.flush().unwrap();
        drop(sink);

        let mut sink = Sink::open(&common).unwrap();
        sink.write_event(b"new\n").unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(dir.path().join("pgvictoria.log")).unwrap();
        assert_eq!("new\n", content);
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut common = file_common(dir.path(), LogMode::Create);
        common.log_rotation_size = 8;

        let mut sink = Sink::open(&common).unwrap();
        sink.write_event(b"aaaa\n").unwrap();
        sink.write_event(b"bbbb\n").unwrap();
        sink.flush().unwrap();

        let rotated = std::fs::read_to_string(dir.path().join("pgvictoria.1")).unwrap();
        assert_eq!("aaaa\n", rotated);
        let current = std::fs::read_to_string(dir.path().join("pgvictoria.log")).unwrap();
        assert_eq!("bbbb\n", current);
    }
}
