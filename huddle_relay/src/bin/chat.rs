// Interactive terminal client for Huddle.
//
// Prompts for `start`, `join`, or `exit`. `start` and `join` ask the
// coordinator for a relay address, connect to it, and enter chat mode: every
// line typed is sent to the relay as-is, and everything the relay forwards is
// printed by a background receiver thread. Typing `exit` in chat mode closes
// the connection and returns to the action prompt. Ctrl+C closes the active
// connection (if any) and quits.
//
// Lines are sent without a trailing newline, so text typed quickly by several
// participants may be printed merged or split; the relay does not frame
// messages.

use std::io::{self, BufRead, StdinLock, Write};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use huddle_protocol::{RelayEndpoint, SessionId};
use huddle_relay::client::{CoordinatorClient, RelayConnection};
use huddle_relay::error::ClientError;
use huddle_relay::logging::init_logging;
use parking_lot::Mutex;

/// Huddle chat client.
#[derive(Parser, Debug)]
#[command(name = "chat", version, about)]
struct Args {
    /// Coordinator UDP address
    #[arg(long, default_value = "127.0.0.1:5000", env = "HUDDLE_COORDINATOR")]
    coordinator: SocketAddr,

    /// Seconds to wait for a coordinator reply (waits forever if unset)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Connection shared with the Ctrl+C handler so it can be closed on exit.
type ActiveConnection = Arc<Mutex<Option<RelayConnection>>>;

type InputLines = io::Lines<StdinLock<'static>>;

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let mut client = CoordinatorClient::new(args.coordinator);
    if let Some(secs) = args.timeout_secs {
        client = client.with_timeout(Duration::from_secs(secs));
    }

    let active: ActiveConnection = Arc::new(Mutex::new(None));
    let active_handler = Arc::clone(&active);
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\nShutting down the client.");
        if let Some(conn) = active_handler.lock().as_ref() {
            conn.close();
        }
        std::process::exit(0);
    }) {
        eprintln!("Failed to install Ctrl+C handler: {e}");
        return ExitCode::FAILURE;
    }

    let mut lines = io::stdin().lock().lines();
    loop {
        let Some(action) = prompt(&mut lines, "Enter action (start/join/exit): ") else {
            break;
        };
        match action.trim() {
            "start" => match client.start_session() {
                Ok((session_id, endpoint)) => {
                    println!("Started session {session_id} at {endpoint}");
                    chat(&endpoint, &mut lines, &active);
                }
                Err(e) => report(&e),
            },
            "join" => {
                let Some(input) = prompt(&mut lines, "Enter session ID to join: ") else {
                    break;
                };
                let Ok(id) = input.trim().parse::<u64>() else {
                    println!("Invalid session ID: {}", input.trim());
                    continue;
                };
                match client.join_session(SessionId(id)) {
                    Ok(endpoint) => chat(&endpoint, &mut lines, &active),
                    Err(e) => report(&e),
                }
            }
            "exit" => break,
            "" => {}
            other => println!("Unknown action: {other}"),
        }
    }

    if let Some(conn) = active.lock().take() {
        conn.close();
    }
    ExitCode::SUCCESS
}

/// Print `text`, then read one line. `None` on end of input.
fn prompt(lines: &mut InputLines, text: &str) -> Option<String> {
    print!("{text}");
    let _ = io::stdout().flush();
    lines.next()?.ok()
}

fn report(err: &ClientError) {
    match err {
        ClientError::Rejected(reason) => println!("Error: {reason}"),
        other => println!("Error contacting coordinator: {other}"),
    }
}

/// Chat mode: connect, print incoming chunks, send typed lines until `exit`.
fn chat(endpoint: &RelayEndpoint, lines: &mut InputLines, active: &ActiveConnection) {
    let mut conn = match RelayConnection::connect(endpoint) {
        Ok(conn) => conn,
        Err(e) => {
            println!("Error connecting to chat server: {e}");
            return;
        }
    };
    println!("Connected to chat server at {endpoint}");

    let inbox = match conn.spawn_receiver() {
        Ok(inbox) => inbox,
        Err(e) => {
            println!("Error starting receiver: {e}");
            conn.close();
            return;
        }
    };
    *active.lock() = conn.try_clone().ok();

    let printer = thread::spawn(move || {
        for chunk in inbox {
            println!("Received message: {}", String::from_utf8_lossy(&chunk));
        }
    });

    for line in lines.by_ref() {
        let Ok(line) = line else {
            break;
        };
        if line.trim() == "exit" {
            break;
        }
        match conn.send(line.as_bytes()) {
            Ok(()) => println!("Sent message: {line}"),
            Err(e) => {
                println!("Error sending message: {e}");
                break;
            }
        }
    }

    conn.close();
    *active.lock() = None;
    let _ = printer.join();
}
