/// Reconnect behaviour: the session comes back after the link drops and
/// rejoins its conversation room without being asked
use async_trait::async_trait;
use gigchat_core::credential::unsigned_token;
use gigchat_core::error::Result;
use gigchat_core::transport::{Dialer, RelayLink};
use gigchat_core::{
    ChatConfig, ChatSession, ChatSnapshot, ConnectionState, Credential, ReconnectPolicy, Relay,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Proxies in-process links to a relay and can cut all of them at once
struct FlakyDialer {
    relay: Relay,
    dials: AtomicUsize,
    cuts: Mutex<Vec<CancellationToken>>,
}

impl FlakyDialer {
    fn new(relay: Relay) -> Arc<Self> {
        Arc::new(Self {
            relay,
            dials: AtomicUsize::new(0),
            cuts: Mutex::new(Vec::new()),
        })
    }

    fn cut(&self) {
        for cut in self.cuts.lock().unwrap().drain(..) {
            cut.cancel();
        }
    }
}

#[async_trait]
impl Dialer for FlakyDialer {
    async fn dial(&self) -> Result<RelayLink> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let RelayLink {
            outbound: relay_out,
            inbound: mut relay_in,
        } = self.relay.dial().await?;
        let (client_out, mut from_client) = mpsc::unbounded_channel();
        let (to_client, client_in) = mpsc::unbounded_channel();
        let cut = CancellationToken::new();
        self.cuts.lock().unwrap().push(cut.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cut.cancelled() => break,
                    frame = from_client.recv() => match frame {
                        Some(frame) => { let _ = relay_out.send(frame); }
                        None => break,
                    },
                    frame = relay_in.recv() => match frame {
                        Some(frame) => { let _ = to_client.send(frame); }
                        None => break,
                    },
                }
            }
        });

        Ok(RelayLink {
            outbound: client_out,
            inbound: client_in,
        })
    }
}

fn config(reconnect: ReconnectPolicy) -> ChatConfig {
    ChatConfig {
        ack_timeout: Duration::from_secs(2),
        reconnect,
        ..Default::default()
    }
}

fn fast_retries() -> ReconnectPolicy {
    ReconnectPolicy {
        enabled: true,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        max_attempts: 5,
    }
}

async fn wait_until(session: &ChatSession, pred: impl Fn(&ChatSnapshot) -> bool) {
    let mut rx = session.subscribe();
    timeout(Duration::from_secs(3), async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if pred(&snapshot) {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("snapshot never matched");
}

#[tokio::test]
async fn test_rejoins_room_after_reconnect() {
    let relay = Relay::in_memory().unwrap();
    let flaky = FlakyDialer::new(relay.clone());

    let alice = ChatSession::new(config(fast_retries()), flaky.clone());
    alice.open(Credential::from_token(unsigned_token("alice")).unwrap());
    alice.wait_connected(Duration::from_secs(2)).await.unwrap();
    let conversation = alice.start_or_join("bob").await.unwrap();

    flaky.cut();
    wait_until(&alice, |s| !s.connection.is_connected()).await;
    wait_until(&alice, |s| s.connection.is_connected()).await;
    assert_eq!(flaky.dials.load(Ordering::SeqCst), 2);

    // Bob talks over his own direct link; alice only hears it if the
    // room was joined again on the new link
    let bob = ChatSession::new(config(ReconnectPolicy::disabled()), Arc::new(relay.clone()));
    bob.open(Credential::from_token(unsigned_token("bob")).unwrap());
    bob.wait_connected(Duration::from_secs(2)).await.unwrap();
    bob.start_or_join("alice").await.unwrap();

    // The rejoin frame travels right after the link comes up; give it a moment
    tokio::time::sleep(Duration::from_millis(50)).await;
    bob.send("welcome back").await.unwrap();

    wait_until(&alice, |s| {
        s.messages
            .iter()
            .any(|e| e.body == "welcome back" && e.conversation_id == conversation.id)
    })
    .await;
}

#[tokio::test]
async fn test_no_reconnect_when_disabled() {
    let relay = Relay::in_memory().unwrap();
    let flaky = FlakyDialer::new(relay);

    let alice = ChatSession::new(config(ReconnectPolicy::disabled()), flaky.clone());
    alice.open(Credential::from_token(unsigned_token("alice")).unwrap());
    alice.wait_connected(Duration::from_secs(2)).await.unwrap();

    flaky.cut();
    wait_until(&alice, |s| s.connection == ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(flaky.dials.load(Ordering::SeqCst), 1);
    assert!(!alice.connection_state().is_connected());
}
