//! Redeeming pub invites.

use serde_json::json;
use tracing::{debug, info};

use scuttle_net::{ProcedureType, Request, Transport};
use scuttle_shared::{FeedRef, Invite};

use crate::error::{NodeError, Result};

/// Dial the pub named in `invite` with the invite's own keypair and ask it
/// to follow `local`.
///
/// A pub that already follows us answers with an error mentioning
/// "already following", which is reported as [`NodeError::AlreadyFollowing`].
pub async fn redeem_invite(transport: &Transport, invite: &Invite, local: &FeedRef) -> Result<()> {
    let guest = invite.identity();
    let peer = transport
        .dial_as(&guest, &invite.remote, &invite.address)
        .await?;
    debug!(pub_key = %invite.remote, address = %invite.address, "redeeming invite");

    let request = Request::new(
        &["invite", "use"],
        ProcedureType::Async,
        json!([{"feed": local}]),
    );
    let result = peer.conn().call_json(request).await;
    peer.conn().close();

    match result {
        Ok(_) => {
            info!(pub_key = %invite.remote, "invite accepted");
            Ok(())
        }
        Err(e) if e.remote_message_contains("already following") => Err(NodeError::AlreadyFollowing),
        Err(e) => Err(e.into()),
    }
}
