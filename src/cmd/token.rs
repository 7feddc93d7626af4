use anyhow::{Context, Result};
use commsync::config::ServerConfig;
use commsync::server::gatekeeper::CredentialVerifier;
use commsync_common::ParticipantId;

/// Print a bearer credential for `user`, signed with the configured secret.
pub fn cmd_token(config: &ServerConfig, user: &str, email: Option<&str>, ttl_hours: i64) -> Result<()> {
    let participant = ParticipantId::user(user).context("Invalid user id")?;
    if ttl_hours <= 0 {
        anyhow::bail!("--ttl-hours must be positive");
    }
    let label = email.unwrap_or(user);
    let ttl = chrono::Duration::try_hours(ttl_hours).context("--ttl-hours is out of range")?;
    let token = CredentialVerifier::new(&config.jwt_secret).issue(&participant, label, ttl)?;
    println!("{}", token);
    Ok(())
}
