//! Interactive console shared by the terminal REPL and the debug server.

use std::{io::Write, path::PathBuf, process::ExitCode, sync::Arc};

use ecal::{EcalDebugger, RuntimeProvider, Value};

const HELP: &str = "\
Console input types:
   Information about a connected debugger: @dbg [glob]
   Show all known symbols: @sym [glob]
   Show symbols of a package: @std <package> [glob]
   Reload the plugin configuration: @reload
   Debugger commands are prefixed with ##
   Everything else is evaluated as an ECAL expression.
Type 'q' or 'quit' to exit the console.";

const DEBUG_COMMANDS: &[(&str, &str)] = &[
    ("break <source:line | identifier>", "Set an enabled breakpoint"),
    ("disable <source:line>", "Disable a breakpoint"),
    ("remove <source:line>", "Remove a breakpoint"),
    ("status", "Show breakpoints, sources and threads"),
    ("inspect <tid>", "Show current node, call stack and scopes of a thread"),
    ("extract <tid> <var> <dest>", "Copy a variable from a thread into the global scope"),
    ("inject <tid> <var> <expression>", "Assign an expression result into a thread's scope"),
    ("cont <tid> <resume | stepIn | stepOver | stepOut>", "Continue a suspended thread"),
];

/// One console session against a runtime provider.
#[derive(Clone)]
pub struct Session {
    rtp: RuntimeProvider,
    debugger: Option<Arc<EcalDebugger>>,
    dir: PathBuf,
}

impl Session {
    pub fn new(rtp: RuntimeProvider, debugger: Option<Arc<EcalDebugger>>, dir: PathBuf) -> Self {
        Self { rtp, debugger, dir }
    }

    pub fn debugger(&self) -> Option<&Arc<EcalDebugger>> {
        self.debugger.as_ref()
    }

    /// Runs the terminal read-eval-print loop until an exit command.
    pub fn console(&self) -> ExitCode {
        println!("ECAL console (type ? for help)");
        let stdin = std::io::stdin();
        loop {
            print!(">>> ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => return ExitCode::SUCCESS,
                Ok(_) => {}
            }
            let line = line.trim();
            if is_exit(line) {
                return ExitCode::SUCCESS;
            }
            if line.is_empty() {
                continue;
            }
            let output = self.handle_line(line);
            if !output.is_empty() {
                println!("{output}");
            }
        }
    }

    /// Handles one input line and returns the textual output.
    pub fn handle_line(&self, line: &str) -> String {
        if line == "?" {
            return HELP.to_owned();
        }
        if let Some(command) = line.strip_prefix("##") {
            return match &self.debugger {
                Some(debugger) => match debugger.handle_command(command.trim()) {
                    Ok(result) => {
                        serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string())
                    }
                    Err(err) => err.to_string(),
                },
                None => String::from("Debugger is not active"),
            };
        }
        if let Some(special) = line.strip_prefix('@') {
            return self.special(special);
        }
        self.eval_line(line)
    }

    fn eval_line(&self, line: &str) -> String {
        if let Some(debugger) = &self.debugger {
            debugger.register_source("console", line);
        }
        let result = ecal::parse("console", line)
            .and_then(|ast| {
                self.rtp.validate(&ast)?;
                Ok(ast)
            })
            .and_then(|ast| self.rtp.eval(&ast, self.rtp.global_scope()));
        match result {
            Ok(Value::Null) => String::new(),
            Ok(value) => value.to_string(),
            Err(err) => err.format_with_trace(),
        }
    }

    fn special(&self, input: &str) -> String {
        let mut tokens = input.split_whitespace();
        match tokens.next().unwrap_or("") {
            "reload" => match self.rtp.load_plugin_config(&self.dir) {
                Ok(()) => String::from("Done"),
                Err(err) => {
                    // A corrupted plugin load must not leave a partially
                    // wired runtime behind.
                    if err.kind == ecal::ErrorKind::Fatal {
                        eprintln!("{err}");
                        std::process::exit(1);
                    }
                    err.to_string()
                }
            },
            "sym" => {
                let filter = glob_filter(tokens.next());
                let mut out = vec![String::from("Packages:")];
                for (name, doc) in self.rtp.stdlib().packages() {
                    if filter(&name) {
                        out.push(format!("  {name} : {doc}"));
                    }
                }
                out.push(String::from("Inbuild functions:"));
                let mut names = self.rtp.stdlib().internal_names();
                names.sort();
                for name in names {
                    if filter(&name) {
                        let doc = self.rtp.stdlib().doc(&name).unwrap_or_default();
                        out.push(format!("  {name} : {doc}"));
                    }
                }
                out.join("\n")
            }
            "std" => {
                let Some(pkg) = tokens.next() else {
                    return String::from("Usage: @std <package> [glob]");
                };
                let filter = glob_filter(tokens.next());
                let symbols = self.rtp.stdlib().package_symbols(pkg);
                if symbols.is_empty() {
                    return format!("Unknown package: {pkg}");
                }
                let mut out = vec![format!("Package {pkg}:")];
                for (name, doc) in symbols {
                    if filter(&name) {
                        out.push(format!("  {name} : {doc}"));
                    }
                }
                out.join("\n")
            }
            "dbg" => {
                let filter = glob_filter(tokens.next());
                let mut out = vec![String::from("Debugger commands:")];
                for (usage, doc) in DEBUG_COMMANDS {
                    if filter(usage) {
                        out.push(format!("  ##{usage} : {doc}"));
                    }
                }
                out.join("\n")
            }
            other => format!("Unknown special command: @{other}"),
        }
    }
}

/// True for all accepted connection and console terminators.
pub fn is_exit(line: &str) -> bool {
    matches!(line, "exit" | "q" | "quit" | "bye") || line.contains('\u{4}')
}

/// Builds a name filter from an optional glob argument.
fn glob_filter(glob: Option<&str>) -> impl Fn(&str) -> bool + '_ {
    let regex = glob.map(|glob| {
        let mut pattern = String::from("^");
        for c in glob.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                c => pattern.push_str(&regex::escape(&c.to_string())),
            }
        }
        pattern.push('$');
        regex::Regex::new(&pattern).expect("escaped glob is a valid pattern")
    });
    move |name: &str| match &regex {
        Some(regex) => regex.is_match(name),
        None => true,
    }
}
