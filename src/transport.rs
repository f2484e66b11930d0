//! Minimal transport adapter (§6.1): not the cloud wire protocol named in
//! §1's Non-goals, just a newline-delimited JSON stand-in over TCP so the
//! crate has a runnable end-to-end binary, the way the teacher crate ships
//! a simulator binary alongside its library.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::command::CommandResponse;
use crate::ingress::{IngestOutcome, Ingress};
use crate::manager::ActuatorCommandManager;

/// One line of inbound traffic. Tagged so a single socket can carry both
/// actuator commands and last-known-state batches.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum InboundLine {
    ActuatorCommand(serde_json::Value),
    LastKnownStateCommand(serde_json::Value),
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OutboundLine {
    CommandResponse(CommandResponse),
}

/// Runs the TCP server until the listener errors out. Only the first
/// connected client drains the shared egress receiver; this mirrors a
/// single edge-device-to-cloud uplink rather than a general pub/sub bus.
pub async fn serve(
    listen_addr: &str,
    ingress: Arc<Ingress>,
    manager: ActuatorCommandManager,
    egress_rx: mpsc::Receiver<CommandResponse>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(%listen_addr, "transport adapter listening");
    let egress_rx = Arc::new(Mutex::new(Some(egress_rx)));

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "client connected");
        let ingress = Arc::clone(&ingress);
        let manager = manager.clone();
        let egress_rx = Arc::clone(&egress_rx);
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, ingress, manager, egress_rx).await {
                warn!(%peer, error = %e, "client connection ended with an error");
            }
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    ingress: Arc<Ingress>,
    manager: ActuatorCommandManager,
    egress_rx: Arc<Mutex<Option<mpsc::Receiver<CommandResponse>>>>,
) -> std::io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let write_half = Arc::new(tokio::sync::Mutex::new(write_half));

    let taken_rx = egress_rx.lock().expect("egress receiver mutex poisoned").take();
    let writer_task = taken_rx.map(|mut rx| {
        let write_half = Arc::clone(&write_half);
        tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let line = match serde_json::to_string(&OutboundLine::CommandResponse(response)) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "failed to serialize outbound command response");
                        continue;
                    }
                };
                let mut half = write_half.lock().await;
                if half.write_all(line.as_bytes()).await.is_err() || half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        })
    });

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<InboundLine>(&line) {
            Ok(InboundLine::ActuatorCommand(body)) => {
                let payload = serde_json::to_vec(&body).expect("re-serializing parsed JSON cannot fail");
                match ingress.parse_actuator_command(&payload) {
                    IngestOutcome::Accepted(req) => manager.on_receiving_command_request(req),
                    IngestOutcome::FastFail(response) => {
                        let line = serde_json::to_string(&OutboundLine::CommandResponse(response))
                            .expect("CommandResponse always serializes");
                        let mut half = write_half.lock().await;
                        half.write_all(line.as_bytes()).await?;
                        half.write_all(b"\n").await?;
                    }
                    IngestOutcome::Rejected => {}
                }
            }
            Ok(InboundLine::LastKnownStateCommand(body)) => {
                let payload = serde_json::to_vec(&body).expect("re-serializing parsed JSON cannot fail");
                match ingress.parse_last_known_state_command(&payload) {
                    Ok(requests) => {
                        for req in requests {
                            info!(command_id = %req.command_id, "last-known-state command accepted (no-op sink)");
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed last-known-state command"),
                }
            }
            Err(e) => {
                warn!(error = %e, "dropping unrecognized inbound line");
            }
        }
    }

    if let Some(task) = writer_task {
        task.abort();
    }
    Ok(())
}
