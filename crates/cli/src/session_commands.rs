use std::{path::Path, sync::Arc, time::Duration};

use {
    anyhow::{Context, Result, bail},
    clap::Subcommand,
    recibo_whatsapp::{BranchId, ConnectOutcome, ConnectionState, SessionManager},
    serde::Serialize,
    serde_json::json,
    tracing::info,
};

const PAIRING_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Subcommand)]
pub enum SessionAction {
    /// List live and persisted sessions.
    List,
    /// Remove persisted sessions that hold no credentials.
    Clean,
    /// Disconnect a branch and delete its credentials.
    Delete { branch: BranchId },
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn handle_sessions(manager: &SessionManager, action: SessionAction) -> Result<()> {
    match action {
        SessionAction::List => print_json(&manager.list_sessions()?),
        SessionAction::Clean => print_json(&json!({ "removed": manager.clean_invalid_sessions()? })),
        SessionAction::Delete { branch } => {
            let deleted = manager.delete_session(&branch).await?;
            print_json(&json!({ "branch": branch, "deleted": deleted }))
        },
    }
}

/// Recover every persisted branch and keep the sessions alive until Ctrl-C.
pub async fn serve(manager: Arc<SessionManager>) -> Result<()> {
    let recovered = manager.recover_all();
    info!(count = recovered.len(), "serving; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    manager.shutdown().await;
    Ok(())
}

/// Print the pairing code, then wait for the scan to complete.
pub async fn pair(manager: &SessionManager, branch: &BranchId) -> Result<()> {
    let response = manager.get_pairing_code(branch).await?;
    print_json(&response)?;
    if !response.requires_pairing {
        return Ok(());
    }

    if response.timeout {
        bail!("no pairing code for branch {branch} yet; try again");
    }

    let wait = async {
        loop {
            let status = manager.get_status(branch);
            match status.state {
                ConnectionState::Connected => return Ok::<_, anyhow::Error>(status),
                ConnectionState::Disconnected | ConnectionState::LoggedOut => {
                    bail!("session for branch {branch} dropped before pairing completed")
                },
                _ => tokio::time::sleep(PAIRING_POLL_INTERVAL).await,
            }
        }
    };

    tokio::select! {
        status = wait => print_json(&status?)?,
        _ = tokio::signal::ctrl_c() => info!(branch = %branch, "pairing interrupted"),
    }
    manager.shutdown().await;
    Ok(())
}

pub async fn status(manager: &SessionManager, branch: &BranchId) -> Result<()> {
    if manager.get_status(branch).has_credentials {
        let outcome = manager.ensure_connection(branch).await?;
        info!(branch = %branch, ?outcome, "connection attempt finished");
    }
    print_json(&manager.get_status(branch))?;
    manager.shutdown().await;
    Ok(())
}

pub async fn send(
    manager: &SessionManager,
    branch: &BranchId,
    to: &str,
    message: &str,
    file: Option<&Path>,
) -> Result<()> {
    match manager.ensure_connection(branch).await? {
        ConnectOutcome::Connected { .. } => {},
        ConnectOutcome::PairingRequired { .. } => bail!("branch {branch} must be paired first"),
        ConnectOutcome::TimedOut => bail!("branch {branch} did not connect in time"),
    }

    let id = match file {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .context("attachment path has no file name")?;
            manager
                .send_document_as(branch, to, message, bytes, file_name)
                .await?
        },
        None => manager.send_text_as(branch, to, message).await?,
    };
    print_json(&json!({ "branch": branch, "to": to, "id": id }))?;
    manager.shutdown().await;
    Ok(())
}
