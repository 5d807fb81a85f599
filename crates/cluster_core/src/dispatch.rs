//! Message dispatch table.
//!
//! The `CmdSet` maps message ids to handlers, each with a decoded
//! argument type, and decides whether a message runs locally or must
//! be forwarded to another named service. Registration happens at
//! process start; the lock guards the rare registration race, not
//! steady-state dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::context::HandlerContext;
use crate::error::NetError;
use crate::ids::split_target;
use crate::queue::{Hook, QueueSender, QueuedTask, Task};

/// Forwards a message addressed to a non-local service. Implemented
/// over the process's client links; the router process itself runs
/// without one.
pub trait Forwarder: Send + Sync {
    fn forward(
        &self,
        ctx: &HandlerContext,
        server_name: &str,
        id: &str,
        raw: &[u8],
    ) -> Result<(), NetError>;
}

/// Decodes raw bytes into the entry's argument type and produces the
/// ready-to-run task. This is the factory-plus-decode pair that
/// replaces reflective argument construction.
type Invoker = Arc<dyn Fn(&[u8]) -> Result<Task, NetError> + Send + Sync>;

/// The dispatch table: message id → (decoder, handler).
pub struct CmdSet {
    local_name: String,
    entries: RwLock<HashMap<String, Invoker>>,
    hook: RwLock<Option<Hook>>,
    forwarder: RwLock<Option<Arc<dyn Forwarder>>>,
    queue: QueueSender,
}

impl CmdSet {
    /// Creates a dispatch table for the process named `local_name`.
    pub fn new(local_name: impl Into<String>, queue: QueueSender) -> Self {
        Self {
            local_name: local_name.into(),
            entries: RwLock::new(HashMap::new()),
            hook: RwLock::new(None),
            forwarder: RwLock::new(None),
            queue,
        }
    }

    /// Name of the local process; dotted ids with any other prefix
    /// are forwarded.
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Installs the forwarder for non-local dotted ids.
    pub async fn set_forwarder(&self, forwarder: Arc<dyn Forwarder>) {
        *self.forwarder.write().await = Some(forwarder);
    }

    /// Registers a handler for `id` with argument type `T`.
    ///
    /// Duplicate registration is a logged warning, not fatal: the
    /// first registration wins and later calls are ignored.
    pub async fn bind<T, F>(&self, id: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(&mut HandlerContext, T) + Send + Sync + 'static,
    {
        let mut entries = self.entries.write().await;
        if entries.contains_key(id) {
            warn!("⚠️ duplicate handler for '{id}'; keeping the first registration");
            return;
        }
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |raw: &[u8]| {
            let args: T = serde_json::from_slice(raw)?;
            let handler = handler.clone();
            let task: Task = Box::new(move |ctx: &mut HandlerContext| handler(ctx, args));
            Ok(task)
        });
        entries.insert(id.to_string(), invoker);
    }

    /// Registers the single global pre-handler. A second call is a
    /// logged warning; the first hook stays in place.
    pub async fn hook<F>(&self, hook: F)
    where
        F: Fn(&mut HandlerContext) + Send + Sync + 'static,
    {
        let mut slot = self.hook.write().await;
        if slot.is_some() {
            warn!("⚠️ hook already registered; keeping the first one");
            return;
        }
        *slot = Some(Arc::new(hook));
    }

    /// Routes one message: forward, or decode and enqueue.
    ///
    /// Empty bodies normalize to `{}`. A dotted id naming a non-local
    /// service is handed to the forwarder and never runs a local
    /// handler. An unknown bare id is [`NetError::InvalidMessageId`];
    /// a body that fails to decode surfaces to the caller; neither
    /// is enqueued. On success the task is queued and this returns
    /// immediately; handler execution happens on the consumer.
    pub async fn handle(
        &self,
        ctx: HandlerContext,
        id: &str,
        raw: &[u8],
    ) -> Result<(), NetError> {
        let raw: &[u8] = if raw.is_empty() { b"{}" } else { raw };

        let bare = match split_target(id) {
            Some((server, _)) if server != self.local_name => {
                let forwarder = self.forwarder.read().await.clone();
                return match forwarder {
                    Some(forwarder) => forwarder.forward(&ctx, server, id, raw),
                    None => {
                        debug!("no forwarder for '{id}' addressed to '{server}'");
                        Err(NetError::InvalidMessageId(id.to_string()))
                    }
                };
            }
            Some((_, msg)) => msg,
            None => id,
        };

        let invoker = self
            .entries
            .read()
            .await
            .get(bare)
            .cloned()
            .ok_or_else(|| NetError::InvalidMessageId(id.to_string()))?;
        let task = invoker(raw)?;
        let hook = self.hook.read().await.clone();

        self.queue.push(QueuedTask {
            id: bare.to_string(),
            ctx,
            hook,
            task,
        })
    }

    /// Number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::message_queue;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Deserialize)]
    struct Empty {}

    #[derive(Deserialize)]
    struct JoinArgs {
        room: String,
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_handler_is_invoked_exactly_once() {
        let (tx, mut consumer) = message_queue();
        let cmdset = CmdSet::new("room", tx);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in = calls.clone();
        cmdset
            .bind("Foo", move |_ctx, _args: Empty| {
                calls_in.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        cmdset
            .handle(HandlerContext::default(), "Foo", b"{}")
            .await
            .unwrap();
        consumer.drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_prefix_resolves_to_the_bare_handler() {
        let (tx, mut consumer) = message_queue();
        let cmdset = CmdSet::new("room", tx);
        let rooms = Arc::new(Mutex::new(Vec::new()));

        let rooms_in = rooms.clone();
        cmdset
            .bind("C2S_Join", move |_ctx, args: JoinArgs| {
                rooms_in.lock().unwrap().push(args.room);
            })
            .await;

        cmdset
            .handle(
                HandlerContext::default(),
                "room.C2S_Join",
                br#"{"room":"lobby"}"#,
            )
            .await
            .unwrap();
        consumer.drain().await;
        assert_eq!(*rooms.lock().unwrap(), vec!["lobby".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_local_prefix_is_forwarded_not_executed() {
        struct Recorder(Arc<Mutex<Vec<(String, String)>>>);
        impl Forwarder for Recorder {
            fn forward(
                &self,
                _ctx: &HandlerContext,
                server_name: &str,
                id: &str,
                _raw: &[u8],
            ) -> Result<(), NetError> {
                self.0
                    .lock()
                    .unwrap()
                    .push((server_name.to_string(), id.to_string()));
                Ok(())
            }
        }

        let (tx, mut consumer) = message_queue();
        let cmdset = CmdSet::new("gate", tx);
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        cmdset
            .set_forwarder(Arc::new(Recorder(forwarded.clone())))
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        cmdset
            .bind("Foo", move |_ctx, _args: Empty| {
                calls_in.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        cmdset
            .handle(HandlerContext::default(), "svcA.Foo", b"{}")
            .await
            .unwrap();
        consumer.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0, "local handler must not run");
        assert_eq!(
            *forwarded.lock().unwrap(),
            vec![("svcA".to_string(), "svcA.Foo".to_string())]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_id_is_invalid_message_id() {
        let (tx, _consumer) = message_queue();
        let cmdset = CmdSet::new("room", tx);
        let result = cmdset
            .handle(HandlerContext::default(), "Nope", b"{}")
            .await;
        assert!(matches!(result, Err(NetError::InvalidMessageId(id)) if id == "Nope"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decode_failure_surfaces_and_nothing_is_enqueued() {
        let (tx, mut consumer) = message_queue();
        let cmdset = CmdSet::new("room", tx);
        cmdset.bind("Join", |_ctx, _args: JoinArgs| {}).await;

        let result = cmdset
            .handle(HandlerContext::default(), "Join", b"not json")
            .await;
        assert!(matches!(result, Err(NetError::Json(_))));
        assert!(!consumer.run_once().await, "nothing should be queued");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_body_normalizes_to_an_object() {
        let (tx, mut consumer) = message_queue();
        let cmdset = CmdSet::new("room", tx);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        cmdset
            .bind("HeartBeat", move |_ctx, _args: Empty| {
                calls_in.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        cmdset
            .handle(HandlerContext::default(), "HeartBeat", b"")
            .await
            .unwrap();
        consumer.drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_bind_keeps_the_first_registration() {
        let (tx, mut consumer) = message_queue();
        let cmdset = CmdSet::new("room", tx);
        let winner = Arc::new(Mutex::new(String::new()));

        let first = winner.clone();
        cmdset
            .bind("Foo", move |_ctx, _args: Empty| {
                *first.lock().unwrap() = "first".into();
            })
            .await;
        let second = winner.clone();
        cmdset
            .bind("Foo", move |_ctx, _args: Empty| {
                *second.lock().unwrap() = "second".into();
            })
            .await;

        assert_eq!(cmdset.handler_count().await, 1);
        cmdset
            .handle(HandlerContext::default(), "Foo", b"{}")
            .await
            .unwrap();
        consumer.drain().await;
        assert_eq!(*winner.lock().unwrap(), "first");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_hook_registration_is_ignored() {
        let (tx, mut consumer) = message_queue();
        let cmdset = CmdSet::new("room", tx);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        cmdset.hook(move |_ctx| first.lock().unwrap().push("first")).await;
        let second = seen.clone();
        cmdset.hook(move |_ctx| second.lock().unwrap().push("second")).await;

        cmdset.bind("Foo", |_ctx, _args: Empty| {}).await;
        cmdset
            .handle(HandlerContext::default(), "Foo", b"{}")
            .await
            .unwrap();
        consumer.drain().await;
        assert_eq!(*seen.lock().unwrap(), vec!["first"]);
    }
}
