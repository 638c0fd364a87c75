use std::process;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing::info;

use tcpwire::{Client, LogConfig, Server, ServerConfig, Value, init_logging, wait_for_signal};

const USAGE: &str = "\
Usage: tcpwire-demo serve [--host <host>] [--port <port>]
       tcpwire-demo send [--host <host>] [--port <port>] <json>

Commands:
  serve            Answer every request with {\"status\": true} until SIGINT/SIGTERM
  send <json>      Send one JSON request and print the response

Options:
  --host <host>    Host to bind or connect to [default: 127.0.0.1]
  --port <port>    Port to bind or connect to [default: 8000]";

#[derive(Debug, PartialEq)]
enum Command {
    Serve { host: String, port: u16 },
    Send { host: String, port: u16, request: Value },
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    if let Err(e) = run(command).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut host = "127.0.0.1".to_string();
    let mut port: u16 = 8000;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let raw = args.get(i).ok_or("--port requires a value")?;
                port = raw
                    .parse()
                    .map_err(|_| format!("invalid port '{raw}'"))?;
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg),
        }
        i += 1;
    }

    match positional.as_slice() {
        ["serve"] => Ok(Command::Serve { host, port }),
        ["send", raw] => {
            let request =
                serde_json::from_str(raw).map_err(|e| format!("request is not valid JSON: {e}"))?;
            Ok(Command::Send {
                host,
                port,
                request,
            })
        }
        ["send"] => Err("missing required argument: <json>".to_string()),
        [] => Err("missing command".to_string()),
        [other, ..] => Err(format!("unexpected argument: {other}")),
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    init_logging(&LogConfig::from_env()?)?;

    match command {
        Command::Serve { host, port } => serve(host, port).await,
        Command::Send {
            host,
            port,
            request,
        } => send(&host, port, &request).await,
    }
}

async fn serve(host: String, port: u16) -> anyhow::Result<()> {
    info!("tcpwire-demo {}", env!("CARGO_PKG_VERSION"));

    let server = Arc::new(Server::new(
        ServerConfig::new(host, port),
        |request: Value| {
            tracing::debug!(%request, "Received request");
            json!({"status": true})
        },
    ));

    let runner = Arc::clone(&server);
    let mut accept = tokio::spawn(async move { runner.start().await });

    tokio::select! {
        result = &mut accept => {
            result.context("accept task failed")??;
            return Ok(());
        }
        signal = wait_for_signal() => {
            let signal = signal.context("failed to install signal handler")?;
            info!(signal, "Shutdown signal received");
        }
    }

    server.stop().await;
    accept.await.context("accept task failed")??;
    Ok(())
}

async fn send(host: &str, port: u16, request: &Value) -> anyhow::Result<()> {
    let mut client = Client::new();
    client.connect(host, port).await?;
    let response = client.send(request).await;
    client.close().await;

    println!("{}", serde_json::to_string_pretty(&response?)?);
    Ok(())
}
