//! Three-level logging interface with interchangeable sinks.
//!
//! The runtime never talks to a global logging facade; host code hands a
//! [`Logger`] to the runtime provider and reads output back out of it. The
//! memory and ring implementations exist for embedding and tests, the
//! buffer implementation adapts any writer (log files, network streams).

use std::{
    collections::VecDeque,
    fmt,
    io::Write,
    sync::Mutex,
};

use strum::{Display, EnumString};

/// Log levels, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString)]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

/// Receiver for runtime log output.
pub trait Logger: Send + Sync {
    fn log_error(&self, scope: &str, msg: fmt::Arguments<'_>);
    fn log_info(&self, scope: &str, msg: fmt::Arguments<'_>);
    fn log_debug(&self, scope: &str, msg: fmt::Arguments<'_>);
}

/// Shared loggers can be handed to the runtime while the host keeps a
/// handle to read collected output back out.
impl<L: Logger + ?Sized> Logger for std::sync::Arc<L> {
    fn log_error(&self, scope: &str, msg: fmt::Arguments<'_>) {
        (**self).log_error(scope, msg);
    }

    fn log_info(&self, scope: &str, msg: fmt::Arguments<'_>) {
        (**self).log_info(scope, msg);
    }

    fn log_debug(&self, scope: &str, msg: fmt::Arguments<'_>) {
        (**self).log_debug(scope, msg);
    }
}

fn line(level: LogLevel, scope: &str, msg: fmt::Arguments<'_>) -> String {
    let prefix = match level {
        LogLevel::Error => "error: ",
        LogLevel::Info => "",
        LogLevel::Debug => "debug: ",
    };
    if scope.is_empty() {
        format!("{prefix}{msg}")
    } else {
        format!("{prefix}{scope}: {msg}")
    }
}

/// Logger writing all levels to stdout.
#[derive(Debug, Default)]
pub struct StdoutLogger;

impl Logger for StdoutLogger {
    fn log_error(&self, scope: &str, msg: fmt::Arguments<'_>) {
        println!("{}", line(LogLevel::Error, scope, msg));
    }

    fn log_info(&self, scope: &str, msg: fmt::Arguments<'_>) {
        println!("{}", line(LogLevel::Info, scope, msg));
    }

    fn log_debug(&self, scope: &str, msg: fmt::Arguments<'_>) {
        println!("{}", line(LogLevel::Debug, scope, msg));
    }
}

/// Logger writing all levels to stderr, keeping stdout free for program
/// output.
#[derive(Debug, Default)]
pub struct StderrLogger;

impl Logger for StderrLogger {
    fn log_error(&self, scope: &str, msg: fmt::Arguments<'_>) {
        eprintln!("{}", line(LogLevel::Error, scope, msg));
    }

    fn log_info(&self, scope: &str, msg: fmt::Arguments<'_>) {
        eprintln!("{}", line(LogLevel::Info, scope, msg));
    }

    fn log_debug(&self, scope: &str, msg: fmt::Arguments<'_>) {
        eprintln!("{}", line(LogLevel::Debug, scope, msg));
    }
}

/// Logger collecting all lines in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected lines in order.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("logger lock poisoned").clone()
    }

    pub fn reset(&self) {
        self.lines.lock().expect("logger lock poisoned").clear();
    }

    fn push(&self, text: String) {
        self.lines.lock().expect("logger lock poisoned").push(text);
    }
}

impl Logger for MemoryLogger {
    fn log_error(&self, scope: &str, msg: fmt::Arguments<'_>) {
        self.push(line(LogLevel::Error, scope, msg));
    }

    fn log_info(&self, scope: &str, msg: fmt::Arguments<'_>) {
        self.push(line(LogLevel::Info, scope, msg));
    }

    fn log_debug(&self, scope: &str, msg: fmt::Arguments<'_>) {
        self.push(line(LogLevel::Debug, scope, msg));
    }
}

/// Logger keeping only the newest `max` lines.
#[derive(Debug)]
pub struct RingLogger {
    max: usize,
    lines: Mutex<VecDeque<String>>,
}

impl RingLogger {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            lines: Mutex::new(VecDeque::new()),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("logger lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn push(&self, text: String) {
        let mut lines = self.lines.lock().expect("logger lock poisoned");
        if lines.len() == self.max {
            lines.pop_front();
        }
        lines.push_back(text);
    }
}

impl Logger for RingLogger {
    fn log_error(&self, scope: &str, msg: fmt::Arguments<'_>) {
        self.push(line(LogLevel::Error, scope, msg));
    }

    fn log_info(&self, scope: &str, msg: fmt::Arguments<'_>) {
        self.push(line(LogLevel::Info, scope, msg));
    }

    fn log_debug(&self, scope: &str, msg: fmt::Arguments<'_>) {
        self.push(line(LogLevel::Debug, scope, msg));
    }
}

/// Logger appending lines to an arbitrary writer.
pub struct BufferLogger {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl BufferLogger {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    fn write(&self, text: &str) {
        let mut writer = self.writer.lock().expect("logger lock poisoned");
        let _ = writeln!(writer, "{text}");
        let _ = writer.flush();
    }
}

impl Logger for BufferLogger {
    fn log_error(&self, scope: &str, msg: fmt::Arguments<'_>) {
        self.write(&line(LogLevel::Error, scope, msg));
    }

    fn log_info(&self, scope: &str, msg: fmt::Arguments<'_>) {
        self.write(&line(LogLevel::Info, scope, msg));
    }

    fn log_debug(&self, scope: &str, msg: fmt::Arguments<'_>) {
        self.write(&line(LogLevel::Debug, scope, msg));
    }
}

impl std::fmt::Debug for BufferLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BufferLogger")
    }
}

/// Wrapper dropping messages below a minimum level.
pub struct LevelFilterLogger<L> {
    level: LogLevel,
    inner: L,
}

impl<L: Logger> LevelFilterLogger<L> {
    pub fn new(level: LogLevel, inner: L) -> Self {
        Self { level, inner }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

impl<L: Logger> Logger for LevelFilterLogger<L> {
    fn log_error(&self, scope: &str, msg: fmt::Arguments<'_>) {
        if self.level <= LogLevel::Error {
            self.inner.log_error(scope, msg);
        }
    }

    fn log_info(&self, scope: &str, msg: fmt::Arguments<'_>) {
        if self.level <= LogLevel::Info {
            self.inner.log_info(scope, msg);
        }
    }

    fn log_debug(&self, scope: &str, msg: fmt::Arguments<'_>) {
        if self.level <= LogLevel::Debug {
            self.inner.log_debug(scope, msg);
        }
    }
}
