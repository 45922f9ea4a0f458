//! Signed event fixtures and a scripted transport shared by unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
};

use futures_util::{
    future::BoxFuture,
    stream::{self, StreamExt},
};
use parking_lot::Mutex;
use secp256k1::{Keypair, Message, Secp256k1};
use tokio::sync::mpsc;

use crate::{
    error::SyncError,
    event::{Event, Tag},
    filter::Filter,
    transport::{Delivery, DeliveryStream, Transport},
    validator::event_hash,
};

pub struct Signer {
    kp: Keypair,
    pub pubkey: String,
}

impl Signer {
    /// Deterministic key derived from a single repeated byte.
    pub fn new(seed: u8) -> Self {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap();
        let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
        Self { kp, pubkey }
    }
}

pub fn tags(raw: Vec<Vec<&str>>) -> Vec<Tag> {
    raw.into_iter()
        .map(|t| Tag(t.into_iter().map(String::from).collect()))
        .collect()
}

pub fn signed(
    signer: &Signer,
    kind: u32,
    created_at: u64,
    raw_tags: Vec<Vec<&str>>,
    content: &str,
) -> Event {
    let secp = Secp256k1::new();
    let mut ev = Event {
        id: String::new(),
        pubkey: signer.pubkey.clone(),
        kind,
        created_at,
        tags: tags(raw_tags),
        content: content.into(),
        sig: String::new(),
    };
    let hash = event_hash(&ev);
    ev.id = hex::encode(hash);
    let msg = Message::from_digest(hash);
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &signer.kp);
    ev.sig = hex::encode(sig.as_ref());
    ev
}

/// Same event with a corrupted signature that still decodes.
pub fn with_bad_sig(mut ev: Event) -> Event {
    let flipped = if &ev.sig[126..] == "00" { "11" } else { "00" };
    ev.sig.replace_range(126.., flipped);
    ev
}

/// How a scripted relay behaves.
pub enum Script {
    Unreachable,
    /// Deliver these events, then signal end of stored events and stay open.
    Deliver(Vec<Event>),
    /// Deliver whatever the test pushes through the paired sender.
    Channel(Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>),
    /// Accept the connection and never send anything.
    Silent,
}

impl Script {
    pub fn channel() -> (mpsc::UnboundedSender<Delivery>, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Script::Channel(Mutex::new(Some(rx))))
    }
}

/// In-memory transport keyed by relay url. Unknown relays are unreachable.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: HashMap<String, Script>,
    pub subscribes: AtomicUsize,
    pub published: Mutex<Vec<(String, String)>>,
    pub reject: Mutex<HashSet<String>>,
}

impl ScriptedTransport {
    pub fn with(mut self, relay: &str, script: Script) -> Self {
        self.scripts.insert(relay.to_string(), script);
        self
    }
}

impl Transport for ScriptedTransport {
    fn subscribe(
        &self,
        relay: &str,
        _filter: &Filter,
    ) -> BoxFuture<'static, Result<DeliveryStream, SyncError>> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let res = match self.scripts.get(relay) {
            None | Some(Script::Unreachable) => {
                Err(SyncError::Transport(format!("{relay} unreachable")))
            }
            Some(Script::Deliver(events)) => {
                let items: Vec<Result<Delivery, SyncError>> = events
                    .iter()
                    .cloned()
                    .map(|e| Ok(Delivery::Event(e)))
                    .chain(std::iter::once(Ok(Delivery::EndOfStored)))
                    .collect();
                Ok(stream::iter(items).chain(stream::pending()).boxed())
            }
            Some(Script::Channel(rx)) => match rx.lock().take() {
                Some(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|d| (Ok(d), rx))
                })
                .boxed()),
                None => Err(SyncError::Transport("channel already taken".into())),
            },
            Some(Script::Silent) => Ok(stream::pending().boxed()),
        };
        Box::pin(async move { res })
    }

    fn publish(&self, relay: &str, event: &Event) -> BoxFuture<'static, Result<bool, SyncError>> {
        let res = match self.scripts.get(relay) {
            None | Some(Script::Unreachable) => {
                Err(SyncError::Transport(format!("{relay} unreachable")))
            }
            Some(_) => {
                self.published
                    .lock()
                    .push((relay.to_string(), event.id.clone()));
                Ok(!self.reject.lock().contains(relay))
            }
        };
        Box::pin(async move { res })
    }
}
