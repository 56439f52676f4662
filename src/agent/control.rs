//! Control and self-upgrade handling on the agent.
//!
//! Control frames map to platform service commands, falling back to a
//! plain process exit for external supervision. Upgrades enforce the
//! policy: https-only download, mandatory sha256, backup before swap.

use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use opsfabric_core::error::{FabricError, Result};
use opsfabric_core::protocol::{ControlAction, ControlBody, UpgradeBody};

const ACTION_DELAY: Duration = Duration::from_secs(3);
const UPGRADE_DEADLINE: Duration = Duration::from_secs(600);
pub const AGENT_SERVICE: &str = "opsfabric-agent";
pub const SERVER_SERVICE: &str = "opsfabric-server";

pub async fn handle_control(body: ControlBody) {
    warn!(action = ?body.action, reason = %body.reason, "control command received");
    match body.action {
        ControlAction::Start => {
            info!("agent already running, ignoring start");
        }
        ControlAction::Stop | ControlAction::Restart => {
            tokio::time::sleep(ACTION_DELAY).await;
            run_service_action(body.action, AGENT_SERVICE).await;
        }
    }
}

pub async fn run_service_action(action: ControlAction, service: &str) {
    let (program, args): (&str, Vec<String>) = if cfg!(windows) {
        let verb = if action == ControlAction::Stop { "Stop-Service" } else { "Restart-Service" };
        (
            "powershell",
            vec!["-Command".into(), format!("{verb} -Name {service}")],
        )
    } else {
        let verb = if action == ControlAction::Stop { "stop" } else { "restart" };
        ("systemctl", vec![verb.into(), service.into()])
    };

    match tokio::process::Command::new(program).args(&args).status().await {
        Ok(status) if status.success() => {}
        other => {
            warn!(?other, "service command failed, exiting for external supervision");
            std::process::exit(0);
        }
    }
}

pub async fn handle_upgrade(body: UpgradeBody, http: reqwest::Client) {
    upgrade_and_restart(body, http, AGENT_SERVICE).await;
}

/// Download, verify, swap, restart; shared by agent upgrade frames and the
/// server's self-upgrade endpoint.
pub async fn upgrade_and_restart(body: UpgradeBody, http: reqwest::Client, service: &str) {
    info!(target_version = %body.target_version, "upgrade command received");
    let result = tokio::time::timeout(UPGRADE_DEADLINE, perform_upgrade(&body, &http)).await;
    match result {
        Ok(Ok(())) => {
            info!("binary replaced, restarting");
            tokio::time::sleep(Duration::from_secs(1)).await;
            run_service_action(ControlAction::Restart, service).await;
        }
        Ok(Err(e)) => error!(error = %e, "upgrade failed"),
        Err(_) => error!("upgrade deadline exceeded"),
    }
}

async fn perform_upgrade(body: &UpgradeBody, http: &reqwest::Client) -> Result<()> {
    if !body.download_url.starts_with("https://") {
        return Err(FabricError::invalid_param("upgrade download_url must be https"));
    }
    let Some(sha256) = body.sha256_hash.as_deref().filter(|h| !h.is_empty()) else {
        return Err(FabricError::invalid_param("upgrade requires sha256 checksum"));
    };

    let tmp_path = std::env::temp_dir().join("opsfabric-agent-new");
    download_to(http, &body.download_url, &tmp_path).await?;
    info!(path = %tmp_path.display(), "upgrade binary downloaded");

    verify_sha256(&tmp_path, sha256).await?;
    info!("sha256 checksum verified");

    let current = std::env::current_exe().map_err(|e| FabricError::internal(format!("current exe: {e}")))?;
    let backup = current.with_extension("bak");

    std::fs::rename(&current, &backup).map_err(|e| FabricError::FileWrite {
        message: format!("backup current binary: {e}"),
    })?;
    if let Err(e) = std::fs::rename(&tmp_path, &current) {
        // Restore the backup so the host keeps a runnable binary.
        let _ = std::fs::rename(&backup, &current);
        return Err(FabricError::FileWrite {
            message: format!("swap binary: {e}"),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&current, std::fs::Permissions::from_mode(0o755));
    }
    Ok(())
}

async fn download_to(http: &reqwest::Client, url: &str, dest: &PathBuf) -> Result<()> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| FabricError::Network { message: e.to_string() })?;
    if !resp.status().is_success() {
        return Err(FabricError::ResponseError {
            message: format!("download status {}", resp.status().as_u16()),
        });
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| FabricError::Network { message: e.to_string() })?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| FabricError::FileWrite { message: e.to_string() })?;
    file.write_all(&bytes)
        .await
        .map_err(|e| FabricError::FileWrite { message: e.to_string() })?;
    file.flush()
        .await
        .map_err(|e| FabricError::FileWrite { message: e.to_string() })?;
    Ok(())
}

async fn verify_sha256(path: &PathBuf, expected: &str) -> Result<()> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| FabricError::FileRead { message: e.to_string() })?;
    let actual = hex::encode(Sha256::digest(&data));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(FabricError::TransferFailed {
            message: format!("sha256 mismatch: expected {expected}, got {actual}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upgrade_rejects_plain_http() {
        let body = UpgradeBody {
            target_version: "1.2.3".into(),
            download_url: "http://example/agent".into(),
            md5_hash: None,
            sha256_hash: Some("ab".into()),
        };
        let err = perform_upgrade(&body, &reqwest::Client::new()).await.unwrap_err();
        assert!(err.to_string().contains("https"));
    }

    #[tokio::test]
    async fn test_upgrade_requires_sha256() {
        let body = UpgradeBody {
            target_version: "1.2.3".into(),
            download_url: "https://example/agent".into(),
            md5_hash: Some("deadbeef".into()),
            sha256_hash: None,
        };
        let err = perform_upgrade(&body, &reqwest::Client::new()).await.unwrap_err();
        assert!(err.to_string().contains("sha256"));
    }

    #[tokio::test]
    async fn test_verify_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        tokio::fs::write(&path, b"payload").await.unwrap();

        let good = hex::encode(Sha256::digest(b"payload"));
        assert!(verify_sha256(&path.clone(), &good).await.is_ok());
        assert!(verify_sha256(&path, &hex::encode(Sha256::digest(b"other")))
            .await
            .is_err());
    }
}
