//! Lifecycle events and the event table.
//!
//! Every hookable point in the connection/transaction/context lifecycle is
//! one [`StateEvent`]. The event table maps each event to the single hook
//! capability kind allowed to register for it; it is built exactly once
//! and validated at build time. A table entry left as a placeholder is a
//! programming error and aborts, not a runtime error.

use std::sync::OnceLock;

use crate::error::{EngineError, EngineResult};

/// Number of events in the table.
pub const EVENT_COUNT: usize = 33;

/// One named point in the engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum StateEvent {
    /// Connection started.
    ConnStarted = 0,
    /// Connection finished.
    ConnFinished,
    /// Transaction started.
    TxStarted,
    /// Transaction is about to be processed.
    TxProcess,
    /// Transaction finished.
    TxFinished,

    /// Connection context has been chosen.
    HandleContextConn,
    /// Handle a connect.
    HandleConnect,
    /// Transaction context has been chosen.
    HandleContextTx,
    /// Handle the request header.
    HandleRequestHeader,
    /// Handle the full request.
    HandleRequest,
    /// Handle the response header.
    HandleResponseHeader,
    /// Handle the full response.
    HandleResponse,
    /// Handle a disconnect.
    HandleDisconnect,
    /// Handle transaction post processing.
    HandlePostprocess,
    /// Handle transaction logging.
    HandleLogging,

    /// Server notified the connection opened.
    ConnOpened,
    /// Server notified the connection closed.
    ConnClosed,

    /// Parser saw the request line.
    RequestStarted,
    /// Parser produced request header data.
    RequestHeaderData,
    /// Parser is processing the request header.
    RequestHeaderProcess,
    /// Parser finished the request header.
    RequestHeaderFinished,
    /// Parser produced request body data.
    RequestBodyData,
    /// Parser finished the request.
    RequestFinished,
    /// Parser saw the response line.
    ResponseStarted,
    /// Parser produced response header data.
    ResponseHeaderData,
    /// Parser finished the response header.
    ResponseHeaderFinished,
    /// Parser produced response body data.
    ResponseBodyData,
    /// Parser finished the response.
    ResponseFinished,

    /// A log event was added or updated on the transaction.
    HandleLogevent,

    /// A configuration context opened.
    ContextOpen,
    /// A configuration context closed.
    ContextClose,
    /// A configuration context is being destroyed.
    ContextDestroy,

    /// Engine shutdown has been requested.
    EngineShutdownInitiated,
}

impl StateEvent {
    /// Returns the event's programmatic name.
    #[must_use]
    pub fn name(self) -> &'static str {
        event_table().entry(self).name
    }

    /// Returns the hook kind required to register for this event.
    #[must_use]
    pub fn hook_kind(self) -> HookKind {
        event_table().entry(self).kind
    }

    /// Converts a raw event index back into an event, if in range.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        if index < EVENT_COUNT {
            // Discriminants are assigned contiguously from 0.
            Some(unsafe { std::mem::transmute::<usize, StateEvent>(index) })
        } else {
            None
        }
    }

    /// Returns the event's index into per-event storage.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Iterates over every event in table order.
    pub fn all() -> impl Iterator<Item = StateEvent> {
        (0..EVENT_COUNT).map(|i| StateEvent::from_index(i).expect("event index in range"))
    }
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The capability kind a hook callback must have for a given event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Placeholder for an unassigned table entry; never valid at runtime.
    Invalid,
    /// Callback takes no event payload.
    Null,
    /// Callback receives the configuration context.
    Context,
    /// Callback receives the connection.
    Connection,
    /// Callback receives the transaction.
    Transaction,
    /// Callback receives the transaction plus a data chunk.
    TransactionData,
    /// Callback receives the parsed request line.
    RequestLine,
    /// Callback receives the parsed response line.
    ResponseLine,
    /// Callback receives one parsed header field.
    Header,
}

impl HookKind {
    /// Returns the kind's name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Null => "null",
            Self::Context => "context",
            Self::Connection => "connection",
            Self::Transaction => "transaction",
            Self::TransactionData => "transaction_data",
            Self::RequestLine => "request_line",
            Self::ResponseLine => "response_line",
            Self::Header => "header",
        }
    }
}

/// One event table entry.
#[derive(Debug, Clone, Copy)]
pub struct EventInfo {
    /// The event this entry describes.
    pub event: StateEvent,
    /// Programmatic name, used in logs and diagnostics.
    pub name: &'static str,
    /// The hook kind required for registration.
    pub kind: HookKind,
}

/// The complete event table.
#[derive(Debug)]
pub struct EventTable {
    entries: [EventInfo; EVENT_COUNT],
}

impl EventTable {
    /// Looks up an entry by typed event.
    #[must_use]
    pub fn entry(&self, event: StateEvent) -> &EventInfo {
        &self.entries[event.index()]
    }

    /// Looks up an entry by raw index, the recoverable path for callers
    /// holding an untrusted event number.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] if `index` is out of
    /// range.
    pub fn lookup(&self, index: usize) -> EngineResult<&EventInfo> {
        self.entries.get(index).ok_or_else(|| {
            EngineError::InvalidArgument(format!("unknown event index {index}"))
        })
    }

    /// All entries in event order.
    #[must_use]
    pub fn entries(&self) -> &[EventInfo] {
        &self.entries
    }
}

/// Returns the process-wide event table, building it on first use.
///
/// The builder is idempotent: later calls return the same table and only
/// re-run the cheap validation pass. A missing name or placeholder kind
/// is a construction-time programming error and aborts.
#[must_use]
pub fn event_table() -> &'static EventTable {
    static TABLE: OnceLock<EventTable> = OnceLock::new();
    let table = TABLE.get_or_init(build_event_table);
    validate(table);
    table
}

fn build_event_table() -> EventTable {
    let entries = std::array::from_fn(|i| {
        let event = StateEvent::from_index(i).expect("event index in range");
        EventInfo {
            event,
            name: static_name(event),
            kind: kind_for(event),
        }
    });
    EventTable { entries }
}

fn validate(table: &EventTable) {
    for entry in table.entries() {
        assert!(
            !entry.name.is_empty(),
            "event table entry {:?} has no name",
            entry.event
        );
        assert!(
            entry.kind != HookKind::Invalid,
            "event table entry {} has a placeholder hook kind",
            entry.name
        );
    }
}

fn static_name(event: StateEvent) -> &'static str {
    use StateEvent::*;
    match event {
        ConnStarted => "conn_started",
        ConnFinished => "conn_finished",
        TxStarted => "tx_started",
        TxProcess => "tx_process",
        TxFinished => "tx_finished",
        HandleContextConn => "handle_context_conn",
        HandleConnect => "handle_connect",
        HandleContextTx => "handle_context_tx",
        HandleRequestHeader => "handle_request_header",
        HandleRequest => "handle_request",
        HandleResponseHeader => "handle_response_header",
        HandleResponse => "handle_response",
        HandleDisconnect => "handle_disconnect",
        HandlePostprocess => "handle_postprocess",
        HandleLogging => "handle_logging",
        ConnOpened => "conn_opened",
        ConnClosed => "conn_closed",
        RequestStarted => "request_started",
        RequestHeaderData => "request_header_data",
        RequestHeaderProcess => "request_header_process",
        RequestHeaderFinished => "request_header_finished",
        RequestBodyData => "request_body_data",
        RequestFinished => "request_finished",
        ResponseStarted => "response_started",
        ResponseHeaderData => "response_header_data",
        ResponseHeaderFinished => "response_header_finished",
        ResponseBodyData => "response_body_data",
        ResponseFinished => "response_finished",
        HandleLogevent => "handle_logevent",
        ContextOpen => "context_open",
        ContextClose => "context_close",
        ContextDestroy => "context_destroy",
        EngineShutdownInitiated => "engine_shutdown_initiated",
    }
}

fn kind_for(event: StateEvent) -> HookKind {
    use StateEvent::*;
    match event {
        ConnStarted | ConnFinished | ConnOpened | ConnClosed | HandleContextConn
        | HandleConnect | HandleDisconnect => HookKind::Connection,

        TxStarted | TxProcess | TxFinished | HandleContextTx | HandleRequestHeader
        | HandleRequest | HandleResponseHeader | HandleResponse | HandlePostprocess
        | HandleLogging | RequestHeaderProcess | RequestHeaderFinished | RequestFinished
        | ResponseHeaderFinished | ResponseFinished | HandleLogevent => HookKind::Transaction,

        RequestBodyData | ResponseBodyData => HookKind::TransactionData,

        RequestStarted => HookKind::RequestLine,
        ResponseStarted => HookKind::ResponseLine,
        RequestHeaderData | ResponseHeaderData => HookKind::Header,

        ContextOpen | ContextClose | ContextDestroy => HookKind::Context,

        EngineShutdownInitiated => HookKind::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_covers_every_event() {
        let table = event_table();
        assert_eq!(table.entries().len(), EVENT_COUNT);
        for (i, entry) in table.entries().iter().enumerate() {
            assert_eq!(entry.event.index(), i);
            assert!(!entry.name.is_empty());
            assert_ne!(entry.kind, HookKind::Invalid);
        }
    }

    #[test]
    fn test_table_is_idempotent() {
        let first = event_table() as *const EventTable;
        let second = event_table() as *const EventTable;
        assert_eq!(first, second);
    }

    #[test]
    fn test_lookup_out_of_range() {
        let table = event_table();
        assert!(table.lookup(EVENT_COUNT).is_err());
        assert!(table.lookup(0).is_ok());
    }

    #[test]
    fn test_known_kinds() {
        assert_eq!(StateEvent::ConnOpened.hook_kind(), HookKind::Connection);
        assert_eq!(StateEvent::TxProcess.hook_kind(), HookKind::Transaction);
        assert_eq!(
            StateEvent::RequestBodyData.hook_kind(),
            HookKind::TransactionData
        );
        assert_eq!(StateEvent::RequestStarted.hook_kind(), HookKind::RequestLine);
        assert_eq!(
            StateEvent::ResponseStarted.hook_kind(),
            HookKind::ResponseLine
        );
        assert_eq!(StateEvent::RequestHeaderData.hook_kind(), HookKind::Header);
        assert_eq!(StateEvent::ContextOpen.hook_kind(), HookKind::Context);
        assert_eq!(
            StateEvent::EngineShutdownInitiated.hook_kind(),
            HookKind::Null
        );
    }

    #[test]
    fn test_from_index_round_trip() {
        for event in StateEvent::all() {
            assert_eq!(StateEvent::from_index(event.index()), Some(event));
        }
        assert_eq!(StateEvent::from_index(EVENT_COUNT), None);
    }

    #[test]
    fn test_event_names_match_table() {
        assert_eq!(StateEvent::RequestHeaderFinished.name(), "request_header_finished");
        assert_eq!(StateEvent::ContextDestroy.name(), "context_destroy");
        assert_eq!(format!("{}", StateEvent::ConnStarted), "conn_started");
    }
}
