//! ECAL command line interface.
//!
//! `ecal {console|run|debug|format|pack}` plus the self-extracting mode: a
//! binary produced by `ecal pack` carries a source archive after a marker
//! line and runs its entry script directly at launch.

mod format;
mod pack;
mod session;
mod telnet;

use std::{path::PathBuf, process::ExitCode, str::FromStr, sync::Arc};

use clap::{Args, Parser, Subcommand};

use ecal::{
    BufferLogger, EcalDebugger, ErrorKind, FileImportLocator, LevelFilterLogger, LogLevel, Logger,
    MemoryImportLocator, RuntimeProvider, StdoutLogger, Value,
};

#[derive(Debug, Parser)]
#[command(name = "ecal", about = "ECAL - Event Condition Action Language", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct SharedArgs {
    /// Root directory for scripts and the plugin configuration.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Append log output to a file instead of stdout.
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Minimum log level: Debug, Info or Error.
    #[arg(long, default_value = "Info", value_parser = parse_level)]
    loglevel: LogLevel,
}

#[derive(Debug, Args)]
struct DebugArgs {
    /// Address of the debug telnet server.
    #[arg(long = "server-addr", default_value = "localhost:33274")]
    server_addr: String,

    /// Start the debug telnet server.
    #[arg(long)]
    server: bool,

    /// Echo received server input to the log.
    #[arg(long)]
    echo: bool,

    /// Run an interactive console next to the server.
    #[arg(
        long,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    interactive: bool,

    /// Suspend every new thread on its first statement.
    #[arg(long = "break-on-start")]
    break_on_start: bool,

    /// Suspend a thread when an evaluation error occurs.
    #[arg(long = "break-on-error")]
    break_on_error: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive console.
    Console {
        #[command(flatten)]
        shared: SharedArgs,
    },
    /// Run an ECAL script.
    Run {
        #[command(flatten)]
        shared: SharedArgs,

        /// Entry script, relative to the root directory.
        entry: String,
    },
    /// Run the console with the debugger attached.
    Debug {
        #[command(flatten)]
        shared: SharedArgs,

        #[command(flatten)]
        debug: DebugArgs,

        /// Optional script to run before entering the console.
        entry: Option<String>,
    },
    /// Pretty-print all ECAL files below a directory.
    Format {
        #[command(flatten)]
        shared: SharedArgs,
    },
    /// Build a self-contained binary from a script directory.
    Pack {
        #[command(flatten)]
        shared: SharedArgs,

        /// Directory with the scripts to pack.
        #[arg(long)]
        source: PathBuf,

        /// Output binary.
        #[arg(long)]
        target: PathBuf,

        /// Entry script inside the source directory.
        #[arg(default_value = "main.ecal")]
        entry: String,
    },
}

fn parse_level(value: &str) -> Result<LogLevel, String> {
    LogLevel::from_str(value).map_err(|_| format!("unknown log level: {value}"))
}

fn build_logger(shared: &SharedArgs) -> Box<dyn Logger> {
    match &shared.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|err| {
                    eprintln!("error: cannot open log file {}: {err}", path.display());
                    std::process::exit(1);
                });
            Box::new(LevelFilterLogger::new(shared.loglevel, BufferLogger::new(file)))
        }
        None => Box::new(LevelFilterLogger::new(shared.loglevel, StdoutLogger)),
    }
}

fn build_provider(shared: &SharedArgs) -> RuntimeProvider {
    let rtp = RuntimeProvider::new(
        "ecal",
        Box::new(FileImportLocator::new(&shared.dir)),
        build_logger(shared),
    );
    if let Err(err) = rtp.load_plugin_config(&shared.dir) {
        eprintln!("error: {err}");
        // A corrupted plugin load must not leave a partially wired
        // runtime behind.
        if err.kind == ErrorKind::Fatal {
            std::process::exit(1);
        }
    }
    rtp
}

/// Turns a script result into a process exit code: the numeric value
/// truncated to an integer, zero otherwise.
fn exit_value(value: &Value) -> u8 {
    match value {
        Value::Number(n) => (*n as i64) as u8,
        _ => 0,
    }
}

fn run_entry(rtp: &RuntimeProvider, name: &str, text: &str) -> ExitCode {
    let result = ecal::parse(name, text)
        .and_then(|ast| {
            rtp.validate(&ast)?;
            Ok(ast)
        })
        .and_then(|ast| rtp.eval(&ast, rtp.global_scope()));
    match result {
        Ok(value) => ExitCode::from(exit_value(&value)),
        Err(err) => {
            eprintln!("{}", err.format_with_trace());
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    // A packed binary runs its embedded archive and ignores the CLI.
    match pack::find_embedded_archive() {
        Ok(Some(archive)) => return run_packed(&archive),
        Ok(None) => {}
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Console { shared } => {
            let rtp = build_provider(&shared);
            rtp.start();
            let code = session::Session::new(rtp.clone(), None, shared.dir.clone()).console();
            rtp.stop();
            code
        }
        Command::Run { shared, entry } => {
            let path = shared.dir.join(&entry);
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) => {
                    eprintln!("error: cannot read {}: {err}", path.display());
                    return ExitCode::FAILURE;
                }
            };
            let rtp = build_provider(&shared);
            rtp.start();
            let code = run_entry(&rtp, &entry, &text);
            rtp.stop();
            code
        }
        Command::Debug {
            shared,
            debug,
            entry,
        } => {
            let rtp = build_provider(&shared);
            let debugger = rtp.attach_debugger();
            debugger.set_break_on_start(debug.break_on_start);
            debugger.set_break_on_error(debug.break_on_error);
            rtp.start();
            if let Some(entry) = &entry {
                let path = shared.dir.join(entry);
                match std::fs::read_to_string(&path) {
                    Ok(text) => {
                        debugger.register_source(entry, &text);
                        run_entry(&rtp, entry, &text);
                    }
                    Err(err) => eprintln!("error: cannot read {}: {err}", path.display()),
                }
            }
            let session = session::Session::new(rtp.clone(), Some(Arc::clone(&debugger)), shared.dir.clone());
            if debug.server {
                telnet::serve(&debug.server_addr, session.clone(), debug.echo);
            }
            let code = if debug.interactive {
                session.console()
            } else {
                wait_forever()
            };
            rtp.stop();
            code
        }
        Command::Format { shared } => format::format_dir(&shared.dir),
        Command::Pack {
            shared: _,
            source,
            target,
            entry,
        } => pack::pack(&source, &target, &entry),
    }
}

fn wait_forever() -> ExitCode {
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

fn run_packed(archive: &pack::EmbeddedArchive) -> ExitCode {
    let locator = MemoryImportLocator::new();
    for (name, text) in &archive.files {
        locator.add(name, text);
    }
    let rtp = RuntimeProvider::new("ecal", Box::new(locator), Box::new(StdoutLogger));
    rtp.start();
    let os_args: Vec<Value> = std::env::args().map(Value::from).collect();
    if let Err(err) = rtp.global_scope().set_value("osArgs", Value::List(os_args)) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }
    let code = run_entry(&rtp, pack::ENTRY_FILE, &archive.entry);
    rtp.stop();
    code
}

#[cfg(test)]
mod tests {
    use super::exit_value;
    use ecal::Value;

    /// A numeric script result becomes the process exit code, truncated.
    #[test]
    fn numeric_exit_code() {
        assert_eq!(exit_value(&Value::Number(5.7)), 5);
        assert_eq!(exit_value(&Value::Null), 0);
        assert_eq!(exit_value(&Value::Str("x".into())), 0);
    }
}
