//! Debug client that stands in for the UI driver or the swizzling peer.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use relay_proto::{ExecutionResult, OutboundEnvelope, RoleAnnouncement, INITIAL_PATH};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::PeerArgs;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn socket_url(base: &str) -> String {
    format!("{}/socket", base.trim_end_matches('/'))
}

/// The result a peer reports for `envelope`, if it answers at all.
pub fn respond_to(envelope: &OutboundEnvelope, args: &PeerArgs) -> Option<ExecutionResult> {
    if !args.ack || envelope.path == INITIAL_PATH {
        return None;
    }
    Some(ExecutionResult {
        status: args.status,
        summary: envelope.path.clone(),
        detail: String::new(),
    })
}

pub async fn run_peer(args: PeerArgs) -> Result<()> {
    let url = socket_url(&args.url);
    debug!("connecting to {} as {}", url, args.role);

    let (stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", url, e);
            return Err(anyhow!("connection failed: {}", e));
        }
        Err(_) => {
            error!("connection timeout after {} seconds", CONNECT_TIMEOUT.as_secs());
            return Err(anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = stream.split();

    let announcement = serde_json::to_string(&RoleAnnouncement::new(args.role))?;
    write
        .send(Message::Text(announcement.into()))
        .await
        .context("failed to announce role")?;
    info!(role = %args.role, url = %url, "announced role");

    while let Some(message) = read.next().await {
        let frame = match message.context("websocket receive failed")? {
            Message::Text(text) => text.as_str().as_bytes().to_vec(),
            Message::Binary(data) => data.to_vec(),
            Message::Close(frame) => {
                info!(reason = ?frame.map(|f| f.reason.to_string()), "relay closed the connection");
                break;
            }
            _ => continue,
        };

        let envelope: OutboundEnvelope = match serde_json::from_slice(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "ignoring frame that is not an envelope");
                continue;
            }
        };
        info!(
            path = %envelope.path,
            data = %envelope.data.clone().unwrap_or_default(),
            "received envelope"
        );

        if let Some(result) = respond_to(&envelope, &args) {
            let text = serde_json::to_string(&result)?;
            write
                .send(Message::Text(text.into()))
                .await
                .context("failed to send execution result")?;
        }
    }

    Ok(())
}
