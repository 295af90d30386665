//! C8: the message model. Grounded on `morp/message.py`'s `Message` class
//! (`send`, `recv`, `process`/`handle` dispatch) with the REDESIGN FLAGS
//! applied: classpath-based runtime reflection becomes a compile-time
//! registry of named message kinds, and the context-manager `recv` becomes
//! an explicit outcome enum consumed by `process`.

use crate::error::InterfaceError;
use crate::interface::{compute_release_delay, Interface};
use crate::registry;
use crate::value::{Fields, FieldsExt};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// What a handler decided should happen to the message it was given.
/// The Rust-native replacement for the Python source's
/// `ReleaseMessage(delay)`/`AckMessage` control-flow exceptions (spec
/// §4.7/§9 REDESIGN FLAGS).
pub enum Outcome {
    /// Processing succeeded; acknowledge and remove the message.
    Ack,
    /// Processing should be retried after `delay_seconds` (0 means the
    /// engine computes backoff from the delivery count).
    Release { delay_seconds: Option<u64> },
}

/// Errors a handler can return from `handle()`. Anything other than
/// `Outcome::Ack`/`Outcome::Release` propagating out is a `Handler` error,
/// which per spec §4.7/§7 releases the message (unless `ack_on_recv` is
/// set) and is re-raised to the caller of `process`.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error("handler failed: {0}")]
    Handler(String),
}

/// A concrete message type: schema + queue routing + the behavior
/// invoked on receive. Implemented by user code, one `impl` per message
/// kind, mirroring a `Message` subclass in the original.
pub trait MessageKind: Sized + Send + Sync + 'static {
    /// Unique tag used for `_classpath` and message-kind lookups.
    /// Replaces Python's fully-qualified class path.
    const CLASSPATH: &'static str;

    /// The bare queue name (before `MORP_PREFIX` is applied), normally the
    /// type name, matching `Message.get_name()`.
    fn queue_name() -> &'static str;

    /// Build the wire fields for this instance, excluding metadata (which
    /// `send` injects).
    fn to_fields(&self) -> Fields;

    /// Hydrate an instance from received fields (metadata included).
    fn from_fields(fields: Fields) -> Result<Self, InterfaceError>;

    /// Invoked once per delivery by `process`. Returning `Err` is always
    /// treated as a handler error; use `Outcome::Release` to retry
    /// deliberately rather than returning an error.
    fn handle(&self) -> Result<Outcome, String>;
}

fn prefixed_queue_name(bare: &str) -> String {
    let prefix = registry::queue_prefix();
    if prefix.is_empty() {
        bare.to_string()
    } else {
        format!("{prefix}-{bare}")
    }
}

/// Options accepted by [`send`].
#[derive(Default)]
pub struct SendOpts {
    pub delay_seconds: u64,
}

/// Build `fields`, inject `_classpath`, and call `Interface::send`.
/// Absorbs `_id`/backend metadata back onto the returned fields, matching
/// `Message.send` in `message.py`. A no-op (logged) when `MORP_DISABLED=1`.
pub async fn send<M: MessageKind>(
    interface: &dyn Interface,
    message: &M,
    opts: SendOpts,
) -> Result<Fields, InterfaceError> {
    let name = prefixed_queue_name(M::queue_name());

    if registry::is_disabled() {
        tracing::info!(queue = %name, "MORP_DISABLED=1, skipping send");
        let mut fields = message.to_fields();
        fields.set_classpath(M::CLASSPATH);
        return Ok(fields);
    }

    let mut fields = message.to_fields();
    fields.set_classpath(M::CLASSPATH);

    let sent = interface.send(&name, fields, opts.delay_seconds).await?;
    tracing::debug!(queue = %name, id = ?sent.id(), "sent message");
    Ok(sent)
}

/// Options accepted by [`process`].
#[derive(Default)]
pub struct ProcessOpts {
    /// If the handler errors (not via `Outcome`), ack instead of release.
    pub ack_on_recv: bool,
    /// How long each `recv` call may long-poll.
    pub recv_timeout: Duration,
}

/// Repeatedly `recv`, dispatch to `handle()`, and resolve the delivery
/// per spec §4.7/§7. Stops after `count` successfully dispatched
/// messages, or immediately on a handler error (which is propagated to
/// the caller after the message has been released/acked).
pub async fn process<M: MessageKind>(
    interface: &dyn Interface,
    count: usize,
    opts: ProcessOpts,
) -> Result<usize, ProcessError> {
    let name = prefixed_queue_name(M::queue_name());
    let mut processed = 0;

    while processed < count {
        let Some(fields) = interface.recv(&name, opts.recv_timeout).await? else {
            continue;
        };

        let delivery_count = fields.count();
        let message = match M::from_fields(fields.clone()) {
            Ok(m) => m,
            Err(e) => {
                // Hydration failure is a decode-shaped failure per spec §7:
                // release with a long backoff rather than losing the
                // message, then propagate.
                let delay =
                    compute_release_delay(delivery_count, 3600, 5, None).max(60);
                interface.release(&name, &fields, Some(delay)).await?;
                return Err(ProcessError::Interface(e));
            }
        };

        match message.handle() {
            Ok(Outcome::Ack) => {
                interface.ack(&name, &fields).await?;
            }
            Ok(Outcome::Release { delay_seconds }) => {
                interface.release(&name, &fields, delay_seconds).await?;
            }
            Err(handler_err) => {
                if opts.ack_on_recv {
                    interface.ack(&name, &fields).await?;
                } else {
                    interface.release(&name, &fields, None).await?;
                }
                return Err(ProcessError::Handler(handler_err));
            }
        }

        processed += 1;
    }

    Ok(processed)
}

/// The compile-time classpath -> hydrator registry that replaces runtime
/// reflection (REDESIGN FLAGS). Each `AnyMessageKind` impl registers
/// itself via [`register_kind`]; polymorphic receive on a shared queue
/// looks the hydrator up by the `_classpath` metadata field.
pub type Hydrator = fn(Fields) -> Result<Box<dyn ErasedMessage>, InterfaceError>;

/// Object-safe handle to a hydrated message, used by polymorphic receive.
pub trait ErasedMessage: Send {
    fn handle(&self) -> Result<Outcome, String>;
    fn classpath(&self) -> &'static str;
}

struct Erased<M: MessageKind>(M);

impl<M: MessageKind> ErasedMessage for Erased<M> {
    fn handle(&self) -> Result<Outcome, String> {
        self.0.handle()
    }

    fn classpath(&self) -> &'static str {
        M::CLASSPATH
    }
}

static KINDS: once_cell::sync::Lazy<dashmap::DashMap<&'static str, (Hydrator, &'static str)>> =
    once_cell::sync::Lazy::new(dashmap::DashMap::new);

/// Register a message kind's hydrator under its `_classpath` tag and
/// queue name, so the base-queue receive path (spec §4.7, "Receive on the
/// base class dispatches polymorphically") can find it.
pub fn register_kind<M: MessageKind>() {
    let hydrate: Hydrator = |fields| {
        let message = M::from_fields(fields)?;
        Ok(Box::new(Erased(message)) as Box<dyn ErasedMessage>)
    };
    KINDS.insert(M::CLASSPATH, (hydrate, M::queue_name()));
}

/// Receive one message from `queue_name` and hydrate it using whichever
/// [`MessageKind`] its `_classpath` metadata names, dispatching
/// polymorphically across message kinds sharing one queue (spec §8,
/// scenario S6).
pub async fn recv_polymorphic(
    interface: &dyn Interface,
    queue_name: &str,
    timeout: Duration,
) -> Result<Option<(Fields, Box<dyn ErasedMessage>)>, InterfaceError> {
    let Some(fields) = interface.recv(queue_name, timeout).await? else {
        return Ok(None);
    };

    let classpath = fields.classpath().ok_or_else(|| {
        InterfaceError::Backend("received message is missing _classpath metadata".to_string())
    })?;

    let (hydrate, _) = *KINDS
        .get(classpath)
        .ok_or_else(|| InterfaceError::Backend(format!("unknown message classpath: {classpath}")))?;

    let message = hydrate(fields.clone())?;
    Ok(Some((fields, message)))
}

/// Helper for building `Fields` from declared attributes in `to_fields`
/// implementations, analogous to the original's flat `fields` dict.
pub fn fields_from(pairs: impl IntoIterator<Item = (&'static str, crate::value::Value)>) -> Fields {
    let mut fields: Fields = HashMap::new();
    for (k, v) in pairs {
        fields.insert(k.to_string(), v);
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct OrderCreated {
        order_id: String,
        should_fail: bool,
    }

    impl MessageKind for OrderCreated {
        const CLASSPATH: &'static str = "tests.OrderCreated";

        fn queue_name() -> &'static str {
            "orders"
        }

        fn to_fields(&self) -> Fields {
            fields_from([
                ("order_id", Value::String(self.order_id.clone())),
                ("should_fail", Value::Bool(self.should_fail)),
            ])
        }

        fn from_fields(fields: Fields) -> Result<Self, InterfaceError> {
            let order_id = fields
                .get("order_id")
                .and_then(Value::as_str)
                .ok_or_else(|| InterfaceError::Backend("missing order_id".into()))?
                .to_string();
            let should_fail = matches!(fields.get("should_fail"), Some(Value::Bool(true)));
            Ok(OrderCreated {
                order_id,
                should_fail,
            })
        }

        fn handle(&self) -> Result<Outcome, String> {
            if self.should_fail {
                Err("boom".to_string())
            } else {
                Ok(Outcome::Ack)
            }
        }
    }

    struct FakeInterface {
        queue: Mutex<Vec<Fields>>,
        acked: Mutex<Vec<Fields>>,
        released: Mutex<Vec<(Fields, Option<u64>)>>,
    }

    impl FakeInterface {
        fn new() -> Self {
            FakeInterface {
                queue: Mutex::new(Vec::new()),
                acked: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Interface for FakeInterface {
        async fn connect(&self) -> Result<(), InterfaceError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), InterfaceError> {
            Ok(())
        }
        async fn send(
            &self,
            _name: &str,
            mut fields: Fields,
            _delay_seconds: u64,
        ) -> Result<Fields, InterfaceError> {
            fields.set_id(uuid_like());
            self.queue.lock().unwrap().push(fields.clone());
            Ok(fields)
        }
        async fn recv(
            &self,
            _name: &str,
            _timeout: Duration,
        ) -> Result<Option<Fields>, InterfaceError> {
            let mut q = self.queue.lock().unwrap();
            Ok(q.pop().map(|mut f| {
                let next = f.count() + 1;
                f.set_count(next);
                f
            }))
        }
        async fn ack(&self, _name: &str, fields: &Fields) -> Result<(), InterfaceError> {
            self.acked.lock().unwrap().push(fields.clone());
            Ok(())
        }
        async fn release(
            &self,
            _name: &str,
            fields: &Fields,
            delay_seconds: Option<u64>,
        ) -> Result<(), InterfaceError> {
            self.released
                .lock()
                .unwrap()
                .push((fields.clone(), delay_seconds));
            Ok(())
        }
        async fn count(&self, _name: &str) -> Result<u64, InterfaceError> {
            Ok(self.queue.lock().unwrap().len() as u64)
        }
        async fn unsafe_clear(&self, _name: &str) -> Result<(), InterfaceError> {
            self.queue.lock().unwrap().clear();
            Ok(())
        }
        async fn unsafe_delete(&self, _name: &str) -> Result<(), InterfaceError> {
            self.queue.lock().unwrap().clear();
            Ok(())
        }
    }

    fn uuid_like() -> String {
        format!("id-{}", rand::random::<u32>())
    }

    #[tokio::test]
    async fn send_injects_classpath() {
        let iface = FakeInterface::new();
        let message = OrderCreated {
            order_id: "o-1".to_string(),
            should_fail: false,
        };

        let sent = send(&iface, &message, SendOpts::default()).await.unwrap();
        assert_eq!(sent.classpath(), Some(OrderCreated::CLASSPATH));
        assert!(sent.id().is_some());
    }

    #[tokio::test]
    async fn process_acks_on_success() {
        let iface = FakeInterface::new();
        let message = OrderCreated {
            order_id: "o-2".to_string(),
            should_fail: false,
        };
        send(&iface, &message, SendOpts::default()).await.unwrap();

        let processed = process::<OrderCreated>(&iface, 1, ProcessOpts::default())
            .await
            .unwrap();

        assert_eq!(processed, 1);
        assert_eq!(iface.acked.lock().unwrap().len(), 1);
        assert!(iface.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_releases_on_handler_error() {
        let iface = FakeInterface::new();
        let message = OrderCreated {
            order_id: "o-3".to_string(),
            should_fail: true,
        };
        send(&iface, &message, SendOpts::default()).await.unwrap();

        let err = process::<OrderCreated>(&iface, 1, ProcessOpts::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Handler(_)));
        assert_eq!(iface.released.lock().unwrap().len(), 1);
        assert!(iface.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_acks_on_handler_error_when_ack_on_recv() {
        let iface = FakeInterface::new();
        let message = OrderCreated {
            order_id: "o-4".to_string(),
            should_fail: true,
        };
        send(&iface, &message, SendOpts::default()).await.unwrap();

        let opts = ProcessOpts {
            ack_on_recv: true,
            ..Default::default()
        };
        let err = process::<OrderCreated>(&iface, 1, opts).await.unwrap_err();

        assert!(matches!(err, ProcessError::Handler(_)));
        assert_eq!(iface.acked.lock().unwrap().len(), 1);
        assert!(iface.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn polymorphic_recv_dispatches_by_classpath() {
        register_kind::<OrderCreated>();

        let iface = FakeInterface::new();
        let message = OrderCreated {
            order_id: "o-5".to_string(),
            should_fail: false,
        };
        send(&iface, &message, SendOpts::default()).await.unwrap();

        let (_, hydrated) = recv_polymorphic(&iface, "orders", Duration::from_secs(0))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(hydrated.classpath(), OrderCreated::CLASSPATH);
    }
}
