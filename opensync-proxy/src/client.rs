//! The client task: serves one member's request channel against its plugin.

use crate::proto::{RemoteError, Reply, Request};
use opensync_plugin::{PluginError, SyncPlugin};
use opensync_types::MemberId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) struct Envelope {
    pub request: Request,
    pub reply: oneshot::Sender<Result<Reply, RemoteError>>,
}

/// Spawns the serving task for one member.
///
/// Requests are served strictly in arrival order, one at a time, which is
/// what gives the member proxy its FIFO guarantee. A `Finalize` request or
/// a plugin hangup ends the task; dropping the channel sender does too.
pub(crate) fn spawn_client(
    member_id: MemberId,
    plugin: Arc<dyn SyncPlugin>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(member = %member_id, "client task started");
        while let Some(envelope) = rx.recv().await {
            let finalize = matches!(envelope.request, Request::Finalize);
            match serve(plugin.as_ref(), envelope.request).await {
                Ok(reply) => {
                    let _ = envelope.reply.send(Ok(reply));
                }
                Err(PluginError::Hup) => {
                    warn!(member = %member_id, "plugin hung up, client task exiting");
                    // Dropping the reply sender (and the channel) surfaces
                    // ConnectionLost to this and all queued requests.
                    return;
                }
                Err(err) => {
                    let _ = envelope.reply.send(Err(RemoteError::new(err.to_string())));
                }
            }
            if finalize {
                break;
            }
        }
        debug!(member = %member_id, "client task finished");
    })
}

async fn serve(plugin: &dyn SyncPlugin, request: Request) -> Result<Reply, PluginError> {
    match request {
        Request::Initialize { config } => {
            plugin.initialize(&config).await?;
            Ok(Reply::Ok)
        }
        Request::Discover => Ok(Reply::Discovered {
            objtypes: plugin.discover().await?,
            batch_commit: plugin.supports_batch_commit(),
        }),
        Request::Connect { objtype, slow_sync } => {
            plugin.connect(objtype.as_ref(), slow_sync).await?;
            Ok(Reply::Ok)
        }
        Request::GetChanges { objtype, slow_sync } => {
            Ok(Reply::Changes(plugin.get_changes(&objtype, slow_sync).await?))
        }
        Request::CommitChange { objtype, change } => {
            plugin.commit(&objtype, &change).await?;
            Ok(Reply::Committed { uid: change.uid })
        }
        Request::CommittedAll { objtype } => {
            plugin.committed_all(&objtype).await?;
            Ok(Reply::Ok)
        }
        Request::SyncDone { objtype } => {
            plugin.sync_done(objtype.as_ref()).await?;
            Ok(Reply::Ok)
        }
        Request::Disconnect { objtype } => {
            plugin.disconnect(objtype.as_ref()).await?;
            Ok(Reply::Ok)
        }
        Request::Finalize => {
            plugin.finalize().await;
            Ok(Reply::Ok)
        }
        Request::CallPlugin { name, data } => {
            Ok(Reply::Custom(plugin.call(&name, &data).await?))
        }
    }
}
