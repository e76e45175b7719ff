use crate::library::utils::lock;
use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
};
use tracing::{Dispatch, level_filters::LevelFilter};
use tracing_subscriber::fmt::MakeWriter;

/// Where formatted log lines end up.
///
/// Each call to `append` carries exactly one complete line. Implementations
/// must not log through `tracing` themselves.
pub trait LogSink: Send + Sync {
    fn append(&self, bytes: &[u8]);
    fn flush(&self);
}

/// Unbuffered standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn append(&self, bytes: &[u8]) {
        // Nowhere left to report a failing stderr
        let _ = io::stderr().lock().write_all(bytes);
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Append-only file behind a buffer. Flushed on demand and on drop.
#[derive(Debug)]
pub struct FileSink {
    file: Mutex<BufWriter<File>>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(BufWriter::with_capacity(64 * 1024, file)),
        })
    }
}

impl LogSink for FileSink {
    fn append(&self, bytes: &[u8]) {
        let _ = lock(&self.file).write_all(bytes);
    }

    fn flush(&self) {
        let _ = lock(&self.file).flush();
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        LogSink::flush(self);
    }
}

/// Hands `tracing_subscriber` one [`SinkLine`] per event.
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<dyn LogSink>,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl<'a> MakeWriter<'a> for SinkWriter {
    type Writer = SinkLine;

    fn make_writer(&'a self) -> Self::Writer {
        SinkLine {
            sink: Arc::clone(&self.sink),
            line: Vec::with_capacity(256),
        }
    }
}

/// Collects one formatted event and appends it to the sink when dropped.
pub struct SinkLine {
    sink: Arc<dyn LogSink>,
    line: Vec<u8>,
}

impl Write for SinkLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SinkLine {
    fn drop(&mut self) {
        if !self.line.is_empty() {
            self.sink.append(&self.line);
        }
    }
}

/// Resolved once at startup, never consulted again.
#[derive(Clone)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub ansi: bool,
    pub sink: Arc<dyn LogSink>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            ansi: true,
            sink: Arc::new(StderrSink),
        }
    }
}

/// An explicitly passed logger. Nothing here touches the global default:
/// threads opt in with `tracing::dispatcher::set_default(logger.dispatch())`.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LogConfig) -> Self {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(config.level)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_target(false)
            .compact()
            .with_ansi(config.ansi)
            .with_writer(SinkWriter::new(Arc::clone(&config.sink)))
            .finish();
        Self {
            dispatch: Dispatch::new(subscriber),
            sink: config.sink,
        }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn flush(&self) {
        self.sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, warn};

    #[derive(Default)]
    struct MemorySink {
        lines: Mutex<Vec<String>>,
        flushes: Mutex<usize>,
    }

    impl LogSink for MemorySink {
        fn append(&self, bytes: &[u8]) {
            lock(&self.lines).push(String::from_utf8_lossy(bytes).into_owned());
        }

        fn flush(&self) {
            *lock(&self.flushes) += 1;
        }
    }

    fn logger(level: LevelFilter) -> (Logger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::new(LogConfig {
            level,
            ansi: false,
            sink: sink.clone(),
        });
        (logger, sink)
    }

    #[test]
    fn one_append_per_event() {
        let (logger, sink) = logger(LevelFilter::INFO);
        tracing::dispatcher::with_default(logger.dispatch(), || {
            info!("Listening on {}", "127.0.0.1:8080");
            warn!("second line");
        });
        let lines = lock(&sink.lines);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Listening on 127.0.0.1:8080"));
        assert!(lines[0].ends_with('\n'));
        assert!(lines[1].contains("second line"));
    }

    #[test]
    fn level_filter_applies() {
        let (logger, sink) = logger(LevelFilter::WARN);
        tracing::dispatcher::with_default(logger.dispatch(), || {
            debug!("hidden");
            info!("hidden too");
            warn!("shown");
        });
        assert_eq!(lock(&sink.lines).len(), 1);
    }

    #[test]
    fn flush_reaches_the_sink() {
        let (logger, sink) = logger(LevelFilter::INFO);
        logger.flush();
        assert_eq!(*lock(&sink.flushes), 1);
    }

    #[test]
    fn file_sink_appends() {
        let path = std::env::temp_dir().join(format!("reactor-log-{}.log", std::process::id()));
        {
            let sink = FileSink::open(&path).unwrap();
            sink.append(b"first\n");
            sink.append(b"second\n");
        }
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
