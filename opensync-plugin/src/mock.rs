//! Instrumented in-memory plugin for engine and proxy tests.
//!
//! Fault injection is typed and per phase/sink rather than encoded in
//! environment variables: tests ask a [`MockPlugin`] to error, hang or hang
//! up at an exact point, and the engine under test sees a plugin that is
//! indistinguishable from a real one.

use crate::{PluginConfig, PluginError, PluginResult, SyncPlugin};
use async_trait::async_trait;
use opensync_types::{Change, ChangeKind, ObjType};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// The plugin capability a fault is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Initialize,
    Discover,
    Connect,
    GetChanges,
    Commit,
    CommittedAll,
    SyncDone,
    Disconnect,
    Finalize,
}

/// How the faulty capability misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Report an explicit plugin error.
    Error,
    /// Never reply; the proxy's deadline fires instead.
    Hang,
    /// Drop the connection; the serving task dies and the proxy reports a
    /// hangup.
    Hup,
    /// Reply normally, but only after this many milliseconds. Lets tests
    /// interleave member completions without failing anything.
    Delay(u64),
}

/// One recorded capability invocation, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub phase: Phase,
    /// `None` for main-sink calls and untyped phases.
    pub objtype: Option<ObjType>,
}

#[derive(Default)]
struct MockState {
    entries: HashMap<ObjType, BTreeMap<String, Vec<u8>>>,
    pending: HashMap<ObjType, Vec<Change>>,
    committed: Vec<Change>,
    log: Vec<Invocation>,
    faults: HashMap<(Phase, Option<ObjType>), Fault>,
}

/// In-memory data source with staged changes, a commit record, an
/// invocation log and per-phase fault injection.
pub struct MockPlugin {
    objtypes: Vec<ObjType>,
    format: String,
    batch: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockPlugin {
    /// Creates a mock supporting the given object types.
    pub fn new(objtypes: impl IntoIterator<Item = ObjType>) -> Arc<Self> {
        Arc::new(Self {
            objtypes: objtypes.into_iter().collect(),
            format: "plain".into(),
            batch: false,
            state: Arc::new(Mutex::new(MockState::default())),
        })
    }

    /// Same as [`new`](Self::new) but advertising batch-commit support.
    pub fn with_batch_commit(objtypes: impl IntoIterator<Item = ObjType>) -> Arc<Self> {
        Arc::new(Self {
            objtypes: objtypes.into_iter().collect(),
            format: "plain".into(),
            batch: true,
            state: Arc::new(Mutex::new(MockState::default())),
        })
    }

    /// Injects a fault for one capability of one sink (`None` = main sink).
    pub fn set_fault(&self, phase: Phase, objtype: Option<ObjType>, fault: Fault) {
        self.state
            .lock()
            .unwrap()
            .faults
            .insert((phase, objtype), fault);
    }

    /// Removes all injected faults.
    pub fn clear_faults(&self) {
        self.state.lock().unwrap().faults.clear();
    }

    /// Seeds the backing store without staging a change report.
    pub fn seed_entry(&self, objtype: &ObjType, uid: &str, payload: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .entries
            .entry(objtype.clone())
            .or_default()
            .insert(uid.to_string(), payload.to_vec());
    }

    /// Stages a change to be reported by the next `get_changes`, applying
    /// it to the backing store as a real device would have.
    pub fn stage_change(&self, change: Change) {
        let mut state = self.state.lock().unwrap();
        let entries = state.entries.entry(change.objtype.clone()).or_default();
        match change.kind {
            ChangeKind::Deleted => {
                entries.remove(&change.uid);
            }
            _ => {
                entries.insert(change.uid.clone(), change.payload.clone());
            }
        }
        state.pending.entry(change.objtype.clone()).or_default().push(change);
    }

    /// The commits this plugin has received, in arrival order.
    pub fn committed(&self) -> Vec<Change> {
        self.state.lock().unwrap().committed.clone()
    }

    /// The capability invocations this plugin has served, in call order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().log.clone()
    }

    /// Current payload of an entry, if present.
    pub fn entry(&self, objtype: &ObjType, uid: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(objtype)
            .and_then(|m| m.get(uid))
            .cloned()
    }

    /// Number of entries stored for an object type.
    pub fn entry_count(&self, objtype: &ObjType) -> usize {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(objtype)
            .map_or(0, BTreeMap::len)
    }

    /// Records the invocation and resolves any injected fault for it.
    async fn trip(&self, phase: Phase, objtype: Option<&ObjType>) -> PluginResult<()> {
        let fault = {
            let mut state = self.state.lock().unwrap();
            state.log.push(Invocation {
                phase,
                objtype: objtype.cloned(),
            });
            state.faults.get(&(phase, objtype.cloned())).copied()
        };
        match fault {
            None => Ok(()),
            Some(Fault::Error) => Err(PluginError::Remote(format!("injected {phase:?} error"))),
            Some(Fault::Hup) => Err(PluginError::Hup),
            Some(Fault::Delay(millis)) => {
                tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
                Ok(())
            }
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

#[async_trait]
impl SyncPlugin for MockPlugin {
    async fn initialize(&self, _config: &PluginConfig) -> PluginResult<()> {
        self.trip(Phase::Initialize, None).await
    }

    async fn discover(&self) -> PluginResult<Vec<ObjType>> {
        self.trip(Phase::Discover, None).await?;
        Ok(self.objtypes.clone())
    }

    async fn connect(&self, objtype: Option<&ObjType>, _slow_sync: bool) -> PluginResult<()> {
        self.trip(Phase::Connect, objtype).await
    }

    async fn get_changes(&self, objtype: &ObjType, slow_sync: bool) -> PluginResult<Vec<Change>> {
        self.trip(Phase::GetChanges, Some(objtype)).await?;
        let mut state = self.state.lock().unwrap();
        if slow_sync {
            state.pending.remove(objtype);
            let entries = state.entries.get(objtype).cloned().unwrap_or_default();
            Ok(entries
                .into_iter()
                .map(|(uid, payload)| {
                    Change::new(uid, objtype.clone(), ChangeKind::Added, self.format.clone(), payload)
                })
                .collect())
        } else {
            Ok(state.pending.remove(objtype).unwrap_or_default())
        }
    }

    async fn commit(&self, objtype: &ObjType, change: &Change) -> PluginResult<()> {
        self.trip(Phase::Commit, Some(objtype)).await?;
        let mut state = self.state.lock().unwrap();
        let entries = state.entries.entry(objtype.clone()).or_default();
        match change.kind {
            ChangeKind::Deleted => {
                entries.remove(&change.uid);
            }
            _ => {
                entries.insert(change.uid.clone(), change.payload.clone());
            }
        }
        state.committed.push(change.clone());
        Ok(())
    }

    async fn committed_all(&self, objtype: &ObjType) -> PluginResult<()> {
        self.trip(Phase::CommittedAll, Some(objtype)).await
    }

    async fn sync_done(&self, objtype: Option<&ObjType>) -> PluginResult<()> {
        self.trip(Phase::SyncDone, objtype).await
    }

    async fn disconnect(&self, objtype: Option<&ObjType>) -> PluginResult<()> {
        self.trip(Phase::Disconnect, objtype).await
    }

    async fn finalize(&self) {
        let _ = self.trip(Phase::Finalize, None).await;
    }

    fn supports_batch_commit(&self) -> bool {
        self.batch
    }

    async fn call(&self, name: &str, data: &[u8]) -> PluginResult<Vec<u8>> {
        // Echo handler, enough to exercise the passthrough path.
        let mut reply = name.as_bytes().to_vec();
        reply.push(b':');
        reply.extend_from_slice(data);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> ObjType {
        ObjType::new("contact")
    }

    #[tokio::test]
    async fn staged_changes_are_drained() {
        let plugin = MockPlugin::new([contact()]);
        plugin.stage_change(Change::new("a", "contact", ChangeKind::Added, "plain", b"1".to_vec()));

        let first = plugin.get_changes(&contact(), false).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = plugin.get_changes(&contact(), false).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn slow_sync_reports_full_store() {
        let plugin = MockPlugin::new([contact()]);
        plugin.seed_entry(&contact(), "a", b"1");
        plugin.seed_entry(&contact(), "b", b"2");

        let changes = plugin.get_changes(&contact(), true).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.kind == ChangeKind::Added));
    }

    #[tokio::test]
    async fn injected_error_fires_once_per_lookup() {
        let plugin = MockPlugin::new([contact()]);
        plugin.set_fault(Phase::Connect, Some(contact()), Fault::Error);

        assert!(plugin.connect(Some(&contact()), false).await.is_err());
        // Main sink is unaffected.
        assert!(plugin.connect(None, false).await.is_ok());
    }

    #[tokio::test]
    async fn commit_applies_to_store() {
        let plugin = MockPlugin::new([contact()]);
        let change = Change::new("a", "contact", ChangeKind::Added, "plain", b"xyz".to_vec());
        plugin.commit(&contact(), &change).await.unwrap();

        assert_eq!(plugin.entry(&contact(), "a"), Some(b"xyz".to_vec()));
        assert_eq!(plugin.committed().len(), 1);

        plugin.commit(&contact(), &Change::deleted("a", "contact")).await.unwrap();
        assert_eq!(plugin.entry(&contact(), "a"), None);
    }
}
