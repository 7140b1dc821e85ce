//! Debug wire server: line-delimited ASCII over TCP.
//!
//! Lines starting with `##` are debugger commands and answer with their
//! JSON result. Everything else runs through the console session and
//! answers with `{"EncodedOutput": <base64 text>}`.

use std::{
    io::{BufRead, BufReader, Write},
    net::{TcpListener, TcpStream},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::json;

use crate::session::{Session, is_exit};

/// Starts the server in a background thread.
pub fn serve(addr: &str, session: Session, echo: bool) {
    let listener = match TcpListener::bind(addr) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("error: cannot bind debug server to {addr}: {err}");
            return;
        }
    };
    println!("Debug server listening on {addr}");
    std::thread::Builder::new()
        .name("ecal-debug-server".into())
        .spawn(move || {
            for stream in listener.incoming().flatten() {
                let session = session.clone();
                let _ = std::thread::Builder::new()
                    .name("ecal-debug-conn".into())
                    .spawn(move || handle_connection(stream, &session, echo));
            }
        })
        .expect("failed to spawn debug server thread");
}

fn handle_connection(stream: TcpStream, session: &Session, echo: bool) {
    let Ok(reader_stream) = stream.try_clone() else {
        return;
    };
    let reader = BufReader::new(reader_stream);
    let mut writer = stream;
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }
        if is_exit(&line) {
            break;
        }
        if echo {
            println!("debug server: {line}");
        }
        let response = respond(session, &line);
        if writeln!(writer, "{response}").is_err() {
            break;
        }
    }
}

fn respond(session: &Session, line: &str) -> String {
    if let Some(command) = line.strip_prefix("##") {
        let result = match session.debugger() {
            Some(debugger) => match debugger.handle_command(command.trim()) {
                Ok(result) => result,
                Err(err) => json!({ "DebuggerError": err.to_string() }),
            },
            None => json!({ "DebuggerError": "Debugger is not active" }),
        };
        return result.to_string();
    }
    let output = sanitize(&session.handle_line(line));
    json!({ "EncodedOutput": STANDARD.encode(output.as_bytes()) }).to_string()
}

/// Replaces graphical table glyphs with `*` so the wire stays ASCII.
fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii() || c.is_alphanumeric() { c } else { '*' })
        .collect()
}
