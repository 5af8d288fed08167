//! The engine-side member proxy.

use crate::client::{spawn_client, Envelope};
use crate::error::{ProxyError, ProxyResult};
use crate::proto::{Reply, Request, RequestKind};
use opensync_plugin::SyncPlugin;
use opensync_types::{MemberId, ObjType};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Per-request-kind reply deadlines.
///
/// Defaults follow the plugin protocol's observed ranges; tests shrink
/// them. A plugin that does not answer within the deadline is treated
/// exactly like one that reported an error, except for the error kind.
#[derive(Debug, Clone)]
pub struct ProxyTimeouts {
    pub initialize: Duration,
    pub discover: Duration,
    pub connect: Duration,
    pub get_changes: Duration,
    pub commit: Duration,
    pub committed_all: Duration,
    pub sync_done: Duration,
    pub disconnect: Duration,
    pub finalize: Duration,
    pub call_plugin: Duration,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            initialize: Duration::from_secs(30),
            discover: Duration::from_secs(30),
            connect: Duration::from_secs(60),
            get_changes: Duration::from_secs(600),
            commit: Duration::from_secs(60),
            committed_all: Duration::from_secs(60),
            sync_done: Duration::from_secs(60),
            disconnect: Duration::from_secs(60),
            finalize: Duration::from_secs(30),
            call_plugin: Duration::from_secs(60),
        }
    }
}

impl ProxyTimeouts {
    /// Uniform deadline for every request kind; test convenience.
    #[must_use]
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            initialize: timeout,
            discover: timeout,
            connect: timeout,
            get_changes: timeout,
            commit: timeout,
            committed_all: timeout,
            sync_done: timeout,
            disconnect: timeout,
            finalize: timeout,
            call_plugin: timeout,
        }
    }

    fn for_kind(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Initialize => self.initialize,
            RequestKind::Discover => self.discover,
            RequestKind::Connect => self.connect,
            RequestKind::GetChanges => self.get_changes,
            RequestKind::CommitChange => self.commit,
            RequestKind::CommittedAll => self.committed_all,
            RequestKind::SyncDone => self.sync_done,
            RequestKind::Disconnect => self.disconnect,
            RequestKind::Finalize => self.finalize,
            RequestKind::CallPlugin => self.call_plugin,
        }
    }
}

/// Member-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Disconnected,
    Connecting,
    Connected,
    Reading,
    Disconnecting,
    /// Absorbing failure state; only teardown requests may still be sent.
    Error,
}

/// One entry of the proxy's request log, in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub kind: RequestKind,
    pub objtype: Option<ObjType>,
    pub phase_index: Option<u8>,
}

/// Reliable request/reply transport to one plugin client.
pub struct MemberProxy {
    member_id: MemberId,
    tx: mpsc::UnboundedSender<Envelope>,
    timeouts: ProxyTimeouts,
    state: Mutex<ProxyState>,
    log: Mutex<Vec<SentRequest>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemberProxy {
    /// Spawns the client task for a member and returns its proxy.
    pub fn spawn(
        member_id: MemberId,
        plugin: Arc<dyn SyncPlugin>,
        timeouts: ProxyTimeouts,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = spawn_client(member_id, plugin, rx);
        Self {
            member_id,
            tx,
            timeouts,
            state: Mutex::new(ProxyState::Disconnected),
            log: Mutex::new(Vec::new()),
            task: Mutex::new(Some(task)),
        }
    }

    /// The member this proxy speaks for.
    #[must_use]
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// Current member-level connection state.
    #[must_use]
    pub fn state(&self) -> ProxyState {
        *self.state.lock().unwrap()
    }

    /// Puts the proxy into the absorbing error state. The engine calls
    /// this when it quarantines a member; only disconnect and finalize go
    /// through afterwards.
    pub fn set_error(&self) {
        self.transition(ProxyState::Error, "quarantined");
    }

    /// The requests sent so far, in send order.
    #[must_use]
    pub fn request_log(&self) -> Vec<SentRequest> {
        self.log.lock().unwrap().clone()
    }

    /// Clears the request log; the engine does this at round start so the
    /// log covers exactly one round.
    pub fn clear_request_log(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Sends a request and awaits its single resolution: reply, remote
    /// error, timeout, or hangup.
    pub async fn send_request(&self, request: Request) -> ProxyResult<Reply> {
        let kind = request.kind();

        {
            let state = *self.state.lock().unwrap();
            if state == ProxyState::Error
                && !matches!(kind, RequestKind::Disconnect | RequestKind::Finalize)
            {
                return Err(ProxyError::Protocol(format!(
                    "member {} is in error state, cannot send {kind:?}",
                    self.member_id
                )));
            }
        }

        self.log.lock().unwrap().push(SentRequest {
            kind,
            objtype: request.objtype().cloned(),
            phase_index: kind.phase_index(),
        });

        match kind {
            RequestKind::Connect => self.transition_if(
                ProxyState::Disconnected,
                ProxyState::Connecting,
                "connect attempted",
            ),
            RequestKind::GetChanges => {
                self.transition(ProxyState::Reading, "get_changes sent");
            }
            RequestKind::Disconnect => {
                self.transition(ProxyState::Disconnecting, "disconnect sent");
            }
            _ => {}
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            request,
            reply: reply_tx,
        };
        if self.tx.send(envelope).is_err() {
            self.transition(ProxyState::Error, "channel closed");
            return Err(ProxyError::ChannelClosed(self.member_id));
        }

        let deadline = self.timeouts.for_kind(kind);
        match tokio::time::timeout(deadline, reply_rx).await {
            Err(_) => {
                warn!(member = %self.member_id, ?kind, ?deadline, "request timed out");
                self.transition(ProxyState::Error, "timeout");
                Err(ProxyError::Timeout(deadline))
            }
            Ok(Err(_)) => {
                warn!(member = %self.member_id, ?kind, "client task gone (hangup)");
                self.transition(ProxyState::Error, "hangup");
                Err(ProxyError::ConnectionLost(self.member_id))
            }
            Ok(Ok(Err(remote))) => {
                trace!(member = %self.member_id, ?kind, error = %remote, "remote error reply");
                self.on_remote_error(kind);
                Err(ProxyError::Remote(remote))
            }
            Ok(Ok(Ok(reply))) => {
                self.on_success(kind);
                Ok(reply)
            }
        }
    }

    /// Stops the client task. Call after `Finalize` has been sent (or when
    /// abandoning a hung member); safe to call twice.
    pub async fn shutdown(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        debug!(member = %self.member_id, "proxy shut down");
    }

    fn on_success(&self, kind: RequestKind) {
        match kind {
            RequestKind::Connect => self.transition(ProxyState::Connected, "connect succeeded"),
            RequestKind::GetChanges => {
                self.transition(ProxyState::Connected, "get_changes complete");
            }
            // The main-sink disconnect is the last one the engine sends
            // for a member, so the member is down once it acks.
            RequestKind::Disconnect => {
                self.transition(ProxyState::Disconnected, "disconnect acked");
            }
            RequestKind::Finalize => self.transition(ProxyState::Disconnected, "finalized"),
            _ => {}
        }
    }

    fn on_remote_error(&self, kind: RequestKind) {
        // Per-request application errors do not poison the connection by
        // themselves; the engine decides whether to quarantine. Reading
        // still ended, and a failed teardown is teardown regardless.
        match kind {
            RequestKind::GetChanges => {
                self.transition_if(ProxyState::Reading, ProxyState::Connected, "read failed");
            }
            RequestKind::Connect => {
                self.transition_if(
                    ProxyState::Connecting,
                    ProxyState::Disconnected,
                    "connect failed",
                );
            }
            RequestKind::Disconnect => {
                self.transition(ProxyState::Disconnected, "disconnect failed, treated as down");
            }
            _ => {}
        }
    }

    fn transition(&self, next: ProxyState, why: &str) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            trace!(member = %self.member_id, from = ?*state, to = ?next, why, "proxy state");
            *state = next;
        }
    }

    fn transition_if(&self, expected: ProxyState, next: ProxyState, why: &str) {
        let mut state = self.state.lock().unwrap();
        if *state == expected {
            trace!(member = %self.member_id, from = ?expected, to = ?next, why, "proxy state");
            *state = next;
        }
    }
}
