//! CLI surface (spec §6 "CLI surface"): a line-oriented TTY REPL for host
//! builds, distinct from the four cooperative tasks of §5 — this task only
//! exists for interactive debugging of a running process, never on a real
//! board.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::metrics;
use crate::netmgr::NetworkState;
use crate::ocpp::charger::RebootRequest;
use crate::ocpp::connector::ReleaseOutcome;
use crate::runtime::Supervisor;

const COMMANDS: &[&str] = &["help", "exit", "reboot", "info", "log", "metric", "dbg", "config", "net", "xmodem", "chg", "idtag", "ocpp"];

/// Reads commands from stdin until EOF or `exit`; writes all output to
/// stdout, mirroring the reference firmware's "writes to the attached TTY"
/// framing (spec §6).
pub async fn run(supervisor: Arc<Supervisor>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let _ = stdout.write_all(b"evse> ").await;
        let _ = stdout.flush().await;

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = stdout.write_all(format!("read error: {e}\n").as_bytes()).await;
                continue;
            }
        };

        let mut tokens = line.split_whitespace();
        let Some(cmd) = tokens.next() else { continue };
        let args: Vec<&str> = tokens.collect();

        let output = dispatch(&supervisor, cmd, &args).await;
        let _ = stdout.write_all(output.as_bytes()).await;
        if !output.ends_with('\n') {
            let _ = stdout.write_all(b"\n").await;
        }
        if cmd == "exit" {
            break;
        }
    }
}

async fn dispatch(supervisor: &Arc<Supervisor>, cmd: &str, args: &[&str]) -> String {
    match cmd {
        "help" => COMMANDS.join(" "),
        "exit" => "bye".to_string(),
        "reboot" => {
            supervisor.charger().request_reboot(RebootRequest::Forced).await;
            "reboot requested".to_string()
        }
        "info" => cmd_info(supervisor).await,
        "log" => format!("log level = {}", supervisor.config().telemetry.log_level),
        "metric" => cmd_metric().await,
        "dbg" => cmd_dbg(supervisor).await,
        "config" => cmd_config(supervisor),
        "net" => format!("net state = {:?}", supervisor.netmgr().state()),
        "xmodem" => "xmodem transfer is not supported in this build".to_string(),
        "chg" => cmd_chg(supervisor).await,
        "idtag" => cmd_idtag(supervisor, args).await,
        "ocpp" => format!("csms connected = {}", supervisor.netmgr().state() == NetworkState::Connected),
        "" => String::new(),
        other => format!("unknown command: {other} (try 'help')"),
    }
}

async fn cmd_info(supervisor: &Arc<Supervisor>) -> String {
    format!(
        "charge_point_id={} server_url={} connectors={} uptime_s={}",
        supervisor.config().ocpp.charge_point_id,
        supervisor.config().ocpp.server_url,
        supervisor.charger().connector_count().await,
        metrics::uptime_secs(),
    )
}

async fn cmd_metric() -> String {
    let snap = metrics::snapshot();
    let counters: Vec<String> = snap.counters.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("uptime_s={} {}", snap.uptime_secs, counters.join(" "))
}

async fn cmd_dbg(supervisor: &Arc<Supervisor>) -> String {
    let physical = supervisor.charge_state().await;
    let pilot_status = supervisor.pilot().status().await;
    let connectors = supervisor.charger().connectors().lock().await;
    let connector = connectors.first();
    format!(
        "physical={} pilot_status={:?} connector_status={:?} transaction_id={}",
        physical,
        pilot_status,
        connector.map(|c| c.status()),
        connector.map(|c| c.session().transaction_id).unwrap_or(0),
    )
}

fn cmd_config(supervisor: &Arc<Supervisor>) -> String {
    let cfg = supervisor.config();
    format!(
        "hardware_mode={:?} pilot_scan_ms={} meter_sample_s={} heartbeat_s={}",
        cfg.hardware.mode, cfg.pilot.scan_interval_ms, cfg.connector.meter_value_sample_interval_secs, cfg.ocpp.heartbeat_interval_secs,
    )
}

async fn cmd_chg(supervisor: &Arc<Supervisor>) -> String {
    let connectors = supervisor.charger().connectors().lock().await;
    let Some(connector) = connectors.first() else { return "no connectors configured".to_string() };
    format!(
        "connector_id={} status={:?} transaction_id={} session_active={}",
        connector.connector_id(),
        connector.status(),
        connector.session().transaction_id,
        connector.session().is_active(),
    )
}

/// `idtag <id>` simulates a card swipe at the first connector (spec §4.4
/// "Authorization flow"): releases an active session carrying a matching
/// tag, or else attempts to occupy the connector with it — mirroring the
/// reference CLI's `do_tag`, which is the only caller `try_release` ever
/// had in the original firmware.
async fn cmd_idtag(supervisor: &Arc<Supervisor>, args: &[&str]) -> String {
    let Some(id_tag) = args.first().copied() else {
        return "usage: idtag <id_tag>".to_string();
    };

    let mut connectors = supervisor.charger().connectors().lock().await;
    let Some(connector) = connectors.first_mut() else {
        return "no connectors configured".to_string();
    };

    if connector.session().is_active() {
        return match connector.try_release(id_tag, false) {
            Some(ReleaseOutcome::Released) => "tag matched, releasing session".to_string(),
            Some(ReleaseOutcome::NotMatched) => "tag does not match active session".to_string(),
            None => "no active session to release".to_string(),
        };
    }

    let csms_up = supervisor.netmgr().state() == NetworkState::Connected;
    let local_status = supervisor.auth_store().authorize(id_tag, csms_up).await;
    let cfg = &supervisor.config().ocpp;
    match connector.try_occupy(id_tag, false, local_status, csms_up, cfg.authorize_remote_tx_requests, cfg.local_pre_authorize) {
        Some(status) => format!("occupy result: {status:?}"),
        None => "occupy pending CSMS authorization".to_string(),
    }
}
