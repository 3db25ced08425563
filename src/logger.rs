use crate::config::LogConfig;
use crate::error::ServerResult;
use chrono::{Local, NaiveDate};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

enum Message {
    Line(Level, String),
    Flush(Sender<()>),
    Shutdown,
}

/// Fire-and-forget log sink backed by a bounded queue and a writer thread.
///
/// Built explicitly and owned by whoever starts the server; `handle()` gives
/// out cheap clones for the `log` facade.
pub struct AsyncLogger {
    tx: Sender<Message>,
    level: LevelFilter,
    dropped: Arc<AtomicUsize>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLogger {
    pub fn new(config: &LogConfig) -> ServerResult<Self> {
        let level = config.level_filter()?;
        if let Some(dir) = &config.directory {
            fs::create_dir_all(dir)?;
        }

        let (tx, rx) = channel::bounded(config.queue_capacity);
        let mut sink = LogFile::new(config.directory.clone(), config.suffix.clone(), config.max_lines);
        let writer = thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || sink.run(rx))?;

        Ok(Self {
            tx,
            level,
            dropped: Arc::new(AtomicUsize::new(0)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Queue one line. A full queue drops the line instead of blocking.
    pub fn record(&self, level: Level, line: impl Into<String>) {
        send_line(&self.tx, &self.dropped, level, line.into());
    }

    /// A `log::Log` front end for this sink
    pub fn handle(&self) -> LogHandle {
        LogHandle {
            tx: self.tx.clone(),
            level: self.level,
            dropped: Arc::clone(&self.dropped),
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    /// Lines lost to a full queue
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until everything queued so far has been written.
    pub fn flush(&self) {
        flush(&self.tx);
    }

    /// Write out the queue, close the file and join the writer.
    /// Later calls do nothing.
    pub fn shutdown(&self) {
        let writer = match self.writer.lock().take() {
            Some(writer) => writer,
            None => return,
        };
        let _ = self.tx.send(Message::Shutdown);
        if writer.join().is_err() {
            eprintln!("log writer thread panicked");
        }
    }
}

impl Drop for AsyncLogger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable handle installed with `log::set_boxed_logger`.
#[derive(Clone)]
pub struct LogHandle {
    tx: Sender<Message>,
    level: LevelFilter,
    dropped: Arc<AtomicUsize>,
}

impl Log for LogHandle {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        send_line(&self.tx, &self.dropped, record.level(), record.args().to_string());
    }

    fn flush(&self) {
        flush(&self.tx);
    }
}

fn send_line(tx: &Sender<Message>, dropped: &AtomicUsize, level: Level, line: String) {
    match tx.try_send(Message::Line(level, line)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
        // writer already gone
        Err(TrySendError::Disconnected(_)) => {}
    }
}

fn flush(tx: &Sender<Message>) {
    let (done_tx, done_rx) = channel::bounded(1);
    if tx.send_timeout(Message::Flush(done_tx), FLUSH_TIMEOUT).is_ok() {
        let _ = done_rx.recv_timeout(FLUSH_TIMEOUT);
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "[error]: ",
        Level::Warn => "[warn] : ",
        Level::Info => "[info] : ",
        Level::Debug => "[debug]: ",
        Level::Trace => "[trace]: ",
    }
}

/// Writer-side state: the current file and when to roll it.
struct LogFile {
    directory: Option<PathBuf>,
    suffix: String,
    max_lines: usize,
    day: Option<NaiveDate>,
    lines: usize,
    /// Files already rolled today for `max_lines`
    sequence: usize,
    out: Option<BufWriter<File>>,
}

impl LogFile {
    fn new(directory: Option<PathBuf>, suffix: String, max_lines: usize) -> Self {
        Self {
            directory,
            suffix,
            max_lines,
            day: None,
            lines: 0,
            sequence: 0,
            out: None,
        }
    }

    fn run(&mut self, rx: Receiver<Message>) {
        while let Ok(message) = rx.recv() {
            if !self.handle(message) {
                break;
            }
            // batch whatever else is queued before flushing
            loop {
                match rx.try_recv() {
                    Ok(message) => {
                        if !self.handle(message) {
                            self.flush_out();
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }
            self.flush_out();
        }
        self.flush_out();
    }

    fn handle(&mut self, message: Message) -> bool {
        match message {
            Message::Line(level, line) => {
                self.write_line(level, &line);
                true
            }
            Message::Flush(done) => {
                self.flush_out();
                let _ = done.send(());
                true
            }
            Message::Shutdown => false,
        }
    }

    fn write_line(&mut self, level: Level, line: &str) {
        let now = Local::now();
        let text = format!(
            "{} {}{}\n",
            now.format("%Y-%m-%d %H:%M:%S%.6f"),
            level_tag(level),
            line
        );

        if self.directory.is_none() {
            let _ = io::stderr().write_all(text.as_bytes());
            return;
        }

        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.sequence = 0;
            self.open();
        } else if self.lines >= self.max_lines {
            self.sequence += 1;
            self.open();
        }

        let written = match &mut self.out {
            Some(out) => out.write_all(text.as_bytes()),
            None => io::stderr().write_all(text.as_bytes()),
        };
        if let Err(e) = written {
            eprintln!("log write failed: {}", e);
        }
        self.lines += 1;
    }

    fn file_name(&self, day: NaiveDate) -> String {
        let date = day.format("%Y_%m_%d");
        if self.sequence == 0 {
            format!("{}{}", date, self.suffix)
        } else {
            format!("{}-{}{}", date, self.sequence, self.suffix)
        }
    }

    fn open(&mut self) {
        self.flush_out();
        self.out = None;
        self.lines = 0;

        let (dir, day) = match (&self.directory, self.day) {
            (Some(dir), Some(day)) => (dir.clone(), day),
            _ => return,
        };
        let path = dir.join(self.file_name(day));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => self.out = Some(BufWriter::new(file)),
            Err(e) => eprintln!("cannot open log file {}: {}", path.display(), e),
        }
    }

    fn flush_out(&mut self) {
        if let Some(out) = &mut self.out {
            let _ = out.flush();
        }
    }
}
