use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "7878";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("agentctl")
        .version("0.1.0")
        .author("Vehicle Systems Engineering Team")
        .about("🚗 fleetbridge debug CLI - send actuator commands and inspect buffer state")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Agent bridge host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Agent bridge port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("set")
                .about("🔧 Send a setActuatorValue command")
                .arg(
                    Arg::with_name("manifest")
                        .long("manifest")
                        .value_name("DECODER_MANIFEST_ID")
                        .help("Decoder manifest id the command is issued against")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("signal")
                        .long("signal")
                        .value_name("SIGNAL_ID")
                        .help("Numeric signal id")
                        .takes_value(true)
                        .required(true)
                        .validator(|v| v.parse::<u32>().map(|_| ()).map_err(|_| "signal id must be a u32".to_string())),
                )
                .arg(
                    Arg::with_name("type")
                        .long("type")
                        .value_name("TYPE")
                        .help("Scalar type of the value")
                        .takes_value(true)
                        .required(true)
                        .possible_values(&[
                            "uint8", "int8", "uint16", "int16", "uint32", "int32", "uint64", "int64",
                            "float", "double", "boolean", "string",
                        ]),
                )
                .arg(
                    Arg::with_name("value")
                        .help("Value to set")
                        .required(true),
                )
                .arg(
                    Arg::with_name("timeout")
                        .long("timeout")
                        .value_name("MS")
                        .help("Execution timeout in milliseconds (0 = no timeout)")
                        .takes_value(true)
                        .default_value("5000"),
                )
                .arg(
                    Arg::with_name("command-id")
                        .long("command-id")
                        .value_name("ID")
                        .help("Explicit command id (random one generated if omitted)")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("last-known-state")
                .about("📦 Send a last-known-state batch command")
                .arg(
                    Arg::with_name("command-id")
                        .long("command-id")
                        .value_name("ID")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("state-template")
                        .long("state-template")
                        .value_name("SYNC_ID")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("operation")
                        .long("operation")
                        .value_name("OPERATION")
                        .takes_value(true)
                        .possible_values(&["activate", "deactivate", "fetch-snapshot"])
                        .required(true),
                )
                .arg(
                    Arg::with_name("deactivate-after")
                        .long("deactivate-after")
                        .value_name("SECONDS")
                        .help("Required with --operation activate")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("listen")
                .about("📡 Print command responses as they arrive on the egress stream")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Listen duration in seconds (default: infinite)")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap();
    let port = matches.value_of("port").unwrap().parse::<u16>()?;
    let format = matches.value_of("format").unwrap();
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "🚗 agentctl - fleetbridge debug CLI".bright_blue().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
    }

    match matches.subcommand() {
        ("set", Some(sub_matches)) => handle_set(sub_matches, host, port, format).await?,
        ("last-known-state", Some(sub_matches)) => {
            handle_last_known_state(sub_matches, host, port, format).await?
        }
        ("listen", Some(sub_matches)) => handle_listen(sub_matches, host, port).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!(
                "  {} Set an INT32 actuator",
                "agentctl set --manifest dm1 --signal 6 --type int32 1500".bright_cyan()
            );
            println!("  {} Listen for responses", "agentctl listen".bright_cyan());
        }
    }

    Ok(())
}

fn generate_command_id() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis();
    format!("agentctl-{now}")
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

fn parse_typed_value(type_name: &str, raw: &str) -> Result<serde_json::Value, String> {
    let value = match type_name {
        "uint8" | "int8" | "uint16" | "int16" | "uint32" | "int32" | "int64" => {
            json!(raw.parse::<i64>().map_err(|e| e.to_string())?)
        }
        "uint64" => json!(raw.parse::<u64>().map_err(|e| e.to_string())?),
        "float" | "double" => json!(raw.parse::<f64>().map_err(|e| e.to_string())?),
        "boolean" => json!(raw.parse::<bool>().map_err(|e| e.to_string())?),
        "string" => json!(raw),
        other => return Err(format!("unsupported type '{other}'")),
    };
    Ok(value)
}

async fn handle_set(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = matches.value_of("manifest").unwrap();
    let signal_id: u32 = matches.value_of("signal").unwrap().parse()?;
    let type_name = matches.value_of("type").unwrap();
    let timeout_ms: u64 = matches.value_of("timeout").unwrap().parse()?;
    let command_id = matches
        .value_of("command-id")
        .map(str::to_string)
        .unwrap_or_else(generate_command_id);
    let raw_value = matches.value_of("value").unwrap();

    let value = parse_typed_value(type_name, raw_value)
        .map_err(|e| format!("invalid --value for type {type_name}: {e}"))?;

    let body = json!({
        "kind": "actuator_command",
        "command_id": command_id,
        "decoder_manifest_id": manifest,
        "issued_timestamp_ms": now_ms(),
        "timeout_ms": timeout_ms,
        "signal_id": signal_id,
        "value": { "type": type_name, "value": value },
    });

    let response = send_line(host, port, &body.to_string()).await?;
    print_command_response("setActuatorValue", &command_id, &response, format);
    Ok(())
}

async fn handle_last_known_state(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let command_id = matches.value_of("command-id").unwrap();
    let state_template_sync_id = matches.value_of("state-template").unwrap();
    let operation = matches.value_of("operation").unwrap();

    let mut entry = json!({
        "state_template_sync_id": state_template_sync_id,
        "operation": operation.replace('-', "_"),
    });
    if operation == "activate" {
        let seconds: u32 = matches
            .value_of("deactivate-after")
            .ok_or("--deactivate-after is required with --operation activate")?
            .parse()?;
        entry["deactivate_after_seconds"] = json!(seconds);
    }

    let body = json!({
        "kind": "last_known_state_command",
        "command_id": command_id,
        "state_templates": [entry],
    });

    let response = send_line(host, port, &body.to_string()).await?;
    print_command_response("lastKnownState", command_id, &response, format);
    Ok(())
}

async fn handle_listen(matches: &ArgMatches<'_>, host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let duration = matches.value_of("duration").map(|d| d.parse::<u64>().unwrap());
    let addr = format!("{host}:{port}");
    let stream = TcpStream::connect(&addr).await.map_err(|e| {
        eprintln!("{} Failed to connect to fleetbridge at {}", "❌".red(), addr.bright_white());
        e
    })?;
    println!("{} {}", "📡".bright_blue(), "Listening for command responses... (Ctrl+C to stop)".dimmed());

    let (read_half, _write_half) = stream.into_split();
    let mut lines = tokio::io::BufReader::new(read_half).lines();

    let listen = async {
        while let Some(line) = lines.next_line().await? {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&line) {
                print_response_line(&parsed);
            }
        }
        Ok::<(), std::io::Error>(())
    };

    match duration {
        Some(seconds) => {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(seconds), listen).await;
        }
        None => listen.await?,
    }
    Ok(())
}

fn print_response_line(parsed: &serde_json::Value) {
    if parsed.get("kind").and_then(|k| k.as_str()) == Some("command_response") {
        let command_id = parsed["command_id"].as_str().unwrap_or("?");
        let status = parsed["status"].as_str().unwrap_or("?");
        let color = match status {
            "Succeeded" => status.bright_green(),
            "InProgress" => status.bright_yellow(),
            _ => status.bright_red(),
        };
        println!("{} {} -> {}", "↩".bright_blue(), command_id.bright_white(), color);
    } else {
        println!("{parsed}");
    }
}

fn print_command_response(label: &str, command_id: &str, response: &str, format: &str) {
    match format {
        "json" => println!("{response}"),
        _ => match serde_json::from_str::<serde_json::Value>(response) {
            Ok(parsed) => print_response_line(&parsed),
            Err(_) if response.is_empty() => {
                println!(
                    "{} {} ({}) queued, no immediate response",
                    "⏳".yellow(),
                    label.bright_white(),
                    command_id
                );
            }
            Err(_) => println!("{} {}", "⚠".yellow(), response),
        },
    }
}

async fn send_line(host: &str, port: u16, line: &str) -> Result<String, Box<dyn std::error::Error>> {
    let addr = format!("{host}:{port}");
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to fleetbridge at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "agent-bridge".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            return Err(e.into());
        }
    };

    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;

    // A fast-fail response, if any, arrives promptly; an accepted command may
    // not reply on this connection at all (§6.1 single-reader egress), so we
    // don't treat a timeout here as an error.
    let mut buffer = vec![0u8; 4096];
    match tokio::time::timeout(std::time::Duration::from_millis(800), stream.read(&mut buffer)).await {
        Ok(Ok(n)) if n > 0 => Ok(String::from_utf8_lossy(&buffer[..n]).trim().to_string()),
        _ => Ok(String::new()),
    }
}
