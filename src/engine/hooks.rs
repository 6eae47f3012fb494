//! Typed hook registry.
//!
//! Hooks are callbacks attached to lifecycle events. Each event admits
//! exactly one callback shape, recorded in the event table; registration
//! is checked against the table up front so a mismatched callback is a
//! registration-time error, never a dispatch-time surprise.
//!
//! Per event, hooks form an ordered list and run in registration order.
//! Registration hands back a [`HookId`] that can later be used to remove
//! the hook again.

use std::fmt;

use tracing::debug;

use crate::conn::tx::Transaction;
use crate::conn::Connection;
use crate::context::Context;
use crate::engine::events::{event_table, HookKind, StateEvent, EVENT_COUNT};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

/// The parsed request line handed to [`StateEvent::RequestStarted`] hooks.
#[derive(Debug, Clone, Default)]
pub struct ParsedRequestLine {
    /// Raw request line as seen on the wire.
    pub raw: String,
    /// Request method.
    pub method: String,
    /// Request URI.
    pub uri: String,
    /// Protocol version, empty for HTTP/0.9 style requests.
    pub protocol: String,
}

/// The parsed response line handed to [`StateEvent::ResponseStarted`] hooks.
#[derive(Debug, Clone, Default)]
pub struct ParsedResponseLine {
    /// Raw status line as seen on the wire.
    pub raw: String,
    /// Protocol version.
    pub protocol: String,
    /// Status code.
    pub status: String,
    /// Reason phrase.
    pub message: String,
}

/// One parsed header field handed to header-data hooks.
#[derive(Debug, Clone)]
pub struct ParsedHeader {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: String,
}

type NullFn = dyn Fn(&Engine, StateEvent) -> EngineResult<()> + Send + Sync;
type ContextFn = dyn Fn(&Engine, StateEvent, &Context) -> EngineResult<()> + Send + Sync;
type ConnFn = dyn Fn(&Engine, StateEvent, &Connection) -> EngineResult<()> + Send + Sync;
type TxFn = dyn Fn(&Engine, StateEvent, &Transaction) -> EngineResult<()> + Send + Sync;
type TxDataFn = dyn Fn(&Engine, StateEvent, &Transaction, &[u8]) -> EngineResult<()> + Send + Sync;
type RequestLineFn =
    dyn Fn(&Engine, StateEvent, &Transaction, &ParsedRequestLine) -> EngineResult<()> + Send + Sync;
type ResponseLineFn = dyn Fn(&Engine, StateEvent, &Transaction, &ParsedResponseLine) -> EngineResult<()>
    + Send
    + Sync;
type HeaderFn =
    dyn Fn(&Engine, StateEvent, &Transaction, &ParsedHeader) -> EngineResult<()> + Send + Sync;

/// A registered callback, tagged by its shape.
pub enum Hook {
    /// No event payload.
    Null(Box<NullFn>),
    /// Configuration context payload.
    Context(Box<ContextFn>),
    /// Connection payload.
    Connection(Box<ConnFn>),
    /// Transaction payload.
    Transaction(Box<TxFn>),
    /// Transaction plus a body data chunk.
    TransactionData(Box<TxDataFn>),
    /// Parsed request line payload.
    RequestLine(Box<RequestLineFn>),
    /// Parsed response line payload.
    ResponseLine(Box<ResponseLineFn>),
    /// One parsed header field.
    Header(Box<HeaderFn>),
}

impl Hook {
    /// The kind tag of this callback's shape.
    #[must_use]
    pub fn kind(&self) -> HookKind {
        match self {
            Self::Null(_) => HookKind::Null,
            Self::Context(_) => HookKind::Context,
            Self::Connection(_) => HookKind::Connection,
            Self::Transaction(_) => HookKind::Transaction,
            Self::TransactionData(_) => HookKind::TransactionData,
            Self::RequestLine(_) => HookKind::RequestLine,
            Self::ResponseLine(_) => HookKind::ResponseLine,
            Self::Header(_) => HookKind::Header,
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hook").field(&self.kind().name()).finish()
    }
}

/// Identifier handed out at registration, used for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct HookEntry {
    id: HookId,
    hook: Hook,
}

/// Ordered per-event hook lists.
pub struct HookRegistry {
    lists: Vec<Vec<HookEntry>>,
    next_id: u64,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Creates an empty registry with one list per known event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lists: (0..EVENT_COUNT).map(|_| Vec::new()).collect(),
            next_id: 0,
        }
    }

    /// Registers a callback for `event`, appending it to the event's
    /// list.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] if the callback's shape
    /// does not match the shape the event table requires.
    pub fn register(&mut self, event: StateEvent, hook: Hook) -> EngineResult<HookId> {
        hook_check(event, hook.kind())?;

        let id = HookId(self.next_id);
        self.next_id += 1;
        self.lists[event.index()].push(HookEntry { id, hook });

        debug!(
            event = %event,
            kind = hook_kind_name(event),
            hooks = self.lists[event.index()].len(),
            "registered hook"
        );
        Ok(id)
    }

    /// Removes a previously registered callback.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if `id` is not registered for
    /// `event`.
    pub fn unregister(&mut self, event: StateEvent, id: HookId) -> EngineResult<()> {
        let list = &mut self.lists[event.index()];
        let before = list.len();
        list.retain(|entry| entry.id != id);
        if list.len() == before {
            return Err(EngineError::NotFound(format!(
                "no hook {id:?} registered for {event}"
            )));
        }
        debug!(event = %event, "unregistered hook");
        Ok(())
    }

    /// Number of callbacks registered for `event`.
    #[must_use]
    pub fn count(&self, event: StateEvent) -> usize {
        self.lists[event.index()].len()
    }

    /// The registered callbacks for `event`, in registration order.
    pub(crate) fn hooks(&self, event: StateEvent) -> impl Iterator<Item = &Hook> {
        self.lists[event.index()].iter().map(|entry| &entry.hook)
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total: usize = self.lists.iter().map(Vec::len).sum();
        f.debug_struct("HookRegistry")
            .field("hooks", &total)
            .finish()
    }
}

fn hook_kind_name(event: StateEvent) -> &'static str {
    event.hook_kind().name()
}

/// Checks that a callback of `kind` may be registered for `event`.
///
/// # Errors
///
/// Returns [`EngineError::InvalidArgument`] if `kind` is the placeholder
/// kind or differs from the kind the event table assigns to `event`.
pub fn hook_check(event: StateEvent, kind: HookKind) -> EngineResult<()> {
    if kind == HookKind::Invalid {
        return Err(EngineError::InvalidArgument(
            "placeholder hook kind is not registrable".to_string(),
        ));
    }
    let expected = event_table().entry(event).kind;
    if kind != expected {
        return Err(EngineError::InvalidArgument(format!(
            "event {} requires {} hooks, got {}",
            event,
            expected.name(),
            kind.name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_hook() -> Hook {
        Hook::Null(Box::new(|_, _| Ok(())))
    }

    fn conn_hook() -> Hook {
        Hook::Connection(Box::new(|_, _, _| Ok(())))
    }

    #[test]
    fn test_register_matching_kind() {
        let mut registry = HookRegistry::new();
        let id = registry
            .register(StateEvent::ConnOpened, conn_hook())
            .unwrap();
        assert_eq!(registry.count(StateEvent::ConnOpened), 1);
        registry.unregister(StateEvent::ConnOpened, id).unwrap();
        assert_eq!(registry.count(StateEvent::ConnOpened), 0);
    }

    #[test]
    fn test_register_mismatched_kind() {
        let mut registry = HookRegistry::new();
        let err = registry
            .register(StateEvent::ConnOpened, null_hook())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        assert_eq!(registry.count(StateEvent::ConnOpened), 0);
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let mut registry = HookRegistry::new();
        registry
            .register(StateEvent::EngineShutdownInitiated, null_hook())
            .unwrap();
        registry
            .register(StateEvent::EngineShutdownInitiated, null_hook())
            .unwrap();
        assert_eq!(registry.count(StateEvent::EngineShutdownInitiated), 2);
    }

    #[test]
    fn test_unregister_unknown_id() {
        let mut registry = HookRegistry::new();
        let id = registry
            .register(StateEvent::ConnOpened, conn_hook())
            .unwrap();
        let err = registry
            .unregister(StateEvent::ConnClosed, id)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_hook_check_invalid_kind() {
        let err = hook_check(StateEvent::ConnOpened, HookKind::Invalid).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_hook_check_every_event_accepts_its_table_kind() {
        for event in StateEvent::all() {
            assert!(hook_check(event, event.hook_kind()).is_ok());
        }
    }
}
