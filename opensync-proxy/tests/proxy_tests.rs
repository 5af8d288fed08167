use opensync_plugin::mock::{Fault, MockPlugin, Phase};
use opensync_plugin::PluginConfig;
use opensync_proxy::{
    MemberProxy, ProxyError, ProxyState, ProxyTimeouts, Reply, Request, RequestKind,
};
use opensync_types::{MemberId, ObjType};
use std::sync::Arc;
use std::time::Duration;

fn contact() -> ObjType {
    ObjType::new("contact")
}

fn make_proxy(plugin: Arc<MockPlugin>) -> MemberProxy {
    MemberProxy::spawn(MemberId::new(1), plugin, ProxyTimeouts::default())
}

fn make_proxy_with_timeout(plugin: Arc<MockPlugin>, timeout: Duration) -> MemberProxy {
    MemberProxy::spawn(MemberId::new(1), plugin, ProxyTimeouts::uniform(timeout))
}

// ── Request/reply basics ─────────────────────────────────────────

#[tokio::test]
async fn initialize_round_trip() {
    let plugin = MockPlugin::new([contact()]);
    let proxy = make_proxy(plugin.clone());

    let reply = proxy
        .send_request(Request::Initialize {
            config: PluginConfig::default(),
        })
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Ok));
    assert_eq!(plugin.invocations().len(), 1);
    proxy.shutdown().await;
}

#[tokio::test]
async fn discover_reports_objtypes() {
    let plugin = MockPlugin::new([contact(), ObjType::new("event")]);
    let proxy = make_proxy(plugin);

    match proxy.send_request(Request::Discover).await.unwrap() {
        Reply::Discovered {
            objtypes,
            batch_commit,
        } => {
            assert_eq!(objtypes.len(), 2);
            assert!(!batch_commit);
        }
        other => panic!("expected Discovered, got {other:?}"),
    }
    proxy.shutdown().await;
}

#[tokio::test]
async fn batch_capability_is_surfaced() {
    let plugin = MockPlugin::with_batch_commit([contact()]);
    let proxy = make_proxy(plugin);

    match proxy.send_request(Request::Discover).await.unwrap() {
        Reply::Discovered { batch_commit, .. } => assert!(batch_commit),
        other => panic!("expected Discovered, got {other:?}"),
    }
    proxy.shutdown().await;
}

#[tokio::test]
async fn get_changes_returns_changes() {
    use opensync_types::{Change, ChangeKind};

    let plugin = MockPlugin::new([contact()]);
    plugin.stage_change(Change::new(
        "a",
        "contact",
        ChangeKind::Added,
        "plain",
        b"data".to_vec(),
    ));
    let proxy = make_proxy(plugin);

    proxy
        .send_request(Request::Connect {
            objtype: None,
            slow_sync: false,
        })
        .await
        .unwrap();
    match proxy
        .send_request(Request::GetChanges {
            objtype: contact(),
            slow_sync: false,
        })
        .await
        .unwrap()
    {
        Reply::Changes(changes) => assert_eq!(changes.len(), 1),
        other => panic!("expected Changes, got {other:?}"),
    }
    proxy.shutdown().await;
}

#[tokio::test]
async fn call_plugin_passthrough() {
    let plugin = MockPlugin::new([contact()]);
    let proxy = make_proxy(plugin);

    match proxy
        .send_request(Request::CallPlugin {
            name: "ping".into(),
            data: b"xyz".to_vec(),
        })
        .await
        .unwrap()
    {
        Reply::Custom(data) => assert_eq!(data, b"ping:xyz"),
        other => panic!("expected Custom, got {other:?}"),
    }
    proxy.shutdown().await;
}

// ── Ordering ─────────────────────────────────────────────────────

#[tokio::test]
async fn requests_are_served_in_send_order() {
    let plugin = MockPlugin::new([contact()]);
    let proxy = make_proxy(plugin.clone());

    // Awaiting both concurrently; the channel still serves them in the
    // order they were enqueued.
    let connect = proxy.send_request(Request::Connect {
        objtype: None,
        slow_sync: false,
    });
    let sync_done = proxy.send_request(Request::SyncDone { objtype: None });
    let (a, b) = tokio::join!(connect, sync_done);
    a.unwrap();
    b.unwrap();

    let phases: Vec<Phase> = plugin.invocations().iter().map(|i| i.phase).collect();
    assert_eq!(phases, vec![Phase::Connect, Phase::SyncDone]);
    proxy.shutdown().await;
}

#[tokio::test]
async fn request_log_records_send_order() {
    let plugin = MockPlugin::new([contact()]);
    let proxy = make_proxy(plugin);

    proxy
        .send_request(Request::Connect {
            objtype: Some(contact()),
            slow_sync: false,
        })
        .await
        .unwrap();
    proxy
        .send_request(Request::GetChanges {
            objtype: contact(),
            slow_sync: false,
        })
        .await
        .unwrap();

    let log = proxy.request_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].kind, RequestKind::Connect);
    assert_eq!(log[0].phase_index, Some(0));
    assert_eq!(log[1].kind, RequestKind::GetChanges);
    assert_eq!(log[1].phase_index, Some(1));

    proxy.clear_request_log();
    assert!(proxy.request_log().is_empty());
    proxy.shutdown().await;
}

// ── State machine ────────────────────────────────────────────────

#[tokio::test]
async fn connect_transitions_state() {
    let plugin = MockPlugin::new([contact()]);
    let proxy = make_proxy(plugin);
    assert_eq!(proxy.state(), ProxyState::Disconnected);

    proxy
        .send_request(Request::Connect {
            objtype: None,
            slow_sync: false,
        })
        .await
        .unwrap();
    assert_eq!(proxy.state(), ProxyState::Connected);

    proxy
        .send_request(Request::Disconnect { objtype: None })
        .await
        .unwrap();
    assert_eq!(proxy.state(), ProxyState::Disconnected);
    proxy.shutdown().await;
}

#[tokio::test]
async fn remote_error_does_not_poison_connection() {
    let plugin = MockPlugin::new([contact()]);
    plugin.set_fault(Phase::GetChanges, Some(contact()), Fault::Error);
    let proxy = make_proxy(plugin);

    proxy
        .send_request(Request::Connect {
            objtype: None,
            slow_sync: false,
        })
        .await
        .unwrap();
    let err = proxy
        .send_request(Request::GetChanges {
            objtype: contact(),
            slow_sync: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Remote(_)));
    // Still connected; the engine decides what to do with the member.
    assert_eq!(proxy.state(), ProxyState::Connected);
    proxy.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timeout_is_synthesized_and_poisons() {
    let plugin = MockPlugin::new([contact()]);
    plugin.set_fault(Phase::Connect, None, Fault::Hang);
    let proxy = make_proxy_with_timeout(plugin, Duration::from_millis(100));

    let err = proxy
        .send_request(Request::Connect {
            objtype: None,
            slow_sync: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Timeout(_)));
    assert_eq!(proxy.state(), ProxyState::Error);
    proxy.shutdown().await;
}

#[tokio::test]
async fn hangup_is_distinct_from_remote_error() {
    let plugin = MockPlugin::new([contact()]);
    plugin.set_fault(Phase::Connect, None, Fault::Hup);
    let proxy = make_proxy(plugin);

    let err = proxy
        .send_request(Request::Connect {
            objtype: None,
            slow_sync: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::ConnectionLost(_)));
    assert_eq!(proxy.state(), ProxyState::Error);

    // The client task is gone; nothing can be enqueued any more.
    let err = proxy
        .send_request(Request::Disconnect { objtype: None })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProxyError::ChannelClosed(_) | ProxyError::ConnectionLost(_)
    ));
    proxy.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn error_state_blocks_everything_but_teardown() {
    let plugin = MockPlugin::new([contact()]);
    plugin.set_fault(Phase::Connect, None, Fault::Hang);
    let proxy = make_proxy_with_timeout(plugin.clone(), Duration::from_millis(100));

    proxy
        .send_request(Request::Connect {
            objtype: None,
            slow_sync: false,
        })
        .await
        .unwrap_err();
    assert_eq!(proxy.state(), ProxyState::Error);

    let err = proxy
        .send_request(Request::GetChanges {
            objtype: contact(),
            slow_sync: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Protocol(_)));

    // Disconnect is still allowed from the error state; the hung client
    // never answers, so it times out, but it was sent.
    let err = proxy
        .send_request(Request::Disconnect { objtype: None })
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Timeout(_)));
    proxy.shutdown().await;
}

#[tokio::test]
async fn quarantine_puts_proxy_into_error_state() {
    let plugin = MockPlugin::new([contact()]);
    let proxy = make_proxy(plugin);

    proxy
        .send_request(Request::Connect {
            objtype: None,
            slow_sync: false,
        })
        .await
        .unwrap();
    proxy.set_error();
    assert_eq!(proxy.state(), ProxyState::Error);

    let err = proxy
        .send_request(Request::SyncDone { objtype: None })
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Protocol(_)));
    proxy.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let plugin = MockPlugin::new([contact()]);
    let proxy = make_proxy(plugin);
    proxy.shutdown().await;
    proxy.shutdown().await;

    let err = proxy
        .send_request(Request::Connect {
            objtype: None,
            slow_sync: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProxyError::ChannelClosed(_) | ProxyError::ConnectionLost(_)
    ));
}

#[tokio::test]
async fn finalize_stops_the_client() {
    let plugin = MockPlugin::new([contact()]);
    let proxy = make_proxy(plugin.clone());

    proxy.send_request(Request::Finalize).await.unwrap();
    assert_eq!(plugin.invocations().last().unwrap().phase, Phase::Finalize);

    // Client task ended after finalize; further sends fail.
    let err = proxy
        .send_request(Request::Connect {
            objtype: None,
            slow_sync: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProxyError::ChannelClosed(_) | ProxyError::ConnectionLost(_)
    ));
    proxy.shutdown().await;
}
