//! Minimal operator console on standard input.
//!
//! Stands in for the graphical control panel: each input line maps to a
//! device command handed to the server, plus a local `status` query. Unknown
//! input is logged and ignored; console mistakes never disturb ingestion.

use crate::protocol::{Command, Measurement};
use crate::server::Server;
use crate::storage::Store;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Action resolved from one console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleAction {
    /// Forward a command to the device.
    Device(Command),
    /// Report connection and store state locally.
    Status,
}

/// Read console lines until stdin closes.
pub async fn run(server: Arc<Server>, store: Arc<Store>) {
    info!("Operator console ready: start | stop | mode1 | mode2 | freq <ms> | window <ms> | status");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(&line) {
            Some(ConsoleAction::Device(command)) => server.send_command(&command).await,
            Some(ConsoleAction::Status) => report_status(&server, &store).await,
            None => warn!(input = %line.trim(), "Unknown console command"),
        }
    }
}

/// Map one console line to an action.
fn parse_line(line: &str) -> Option<ConsoleAction> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    match parts.as_slice() {
        ["start"] => Some(ConsoleAction::Device(Command::Start)),
        ["stop"] => Some(ConsoleAction::Device(Command::Stop)),
        ["mode1"] => Some(ConsoleAction::Device(Command::Mode1)),
        ["mode2"] => Some(ConsoleAction::Device(Command::Mode2)),
        ["freq", ms] => ms.parse().ok().map(|ms| ConsoleAction::Device(Command::SetFreq(ms))),
        ["window", ms] => ms
            .parse()
            .ok()
            .map(|ms| ConsoleAction::Device(Command::SetWindow(ms))),
        ["status"] => Some(ConsoleAction::Status),
        _ => None,
    }
}

async fn report_status(server: &Server, store: &Store) {
    let connected = server.has_device().await;
    info!(
        address = %server.local_addr(),
        connected,
        records = store.len(),
        "Status"
    );

    if store.is_empty() {
        info!("No readings stored yet");
        return;
    }

    for record in store.fetch_recent(1) {
        match record.measurement {
            Measurement::Raw {
                temperature,
                humidity,
            } => info!(
                timestamp = %record.timestamp_display(),
                temperature,
                humidity,
                "Most recent reading"
            ),
            Measurement::Aggregate(stats) => info!(
                timestamp = %record.timestamp_display(),
                temp_avg = stats.temp_avg,
                hum_avg = stats.hum_avg,
                "Most recent window statistics"
            ),
        }
    }
}
