//! Transactions.
//!
//! One transaction per request/response exchange on a connection. The
//! transaction carries the parsed artifacts, buffered body data, a flag
//! bitfield mirrored into the variable store, the log-event list, and
//! one data slot per registered module.

use uuid::Uuid;

use crate::module::ModuleDataArray;
use crate::pool::Pool;
use crate::vars::VarStore;

/// Per-connection transaction sequence number. Monotonic, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub(crate) u64);

impl TxId {
    /// The raw sequence number.
    #[must_use]
    pub fn seq(self) -> u64 {
        self.0
    }
}

/// Transaction flag bitfield.
///
/// Every flag set on a transaction is mirrored into the variable store
/// under the flag's lowercase name, so rules can match on lifecycle
/// progress without special cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxFlags(u64);

impl TxFlags {
    /// No flags.
    pub const NONE: TxFlags = TxFlags(0);
    /// Part of a pipelined sequence on its connection.
    pub const PIPELINED: TxFlags = TxFlags(1 << 0);
    /// Request line seen.
    pub const REQ_STARTED: TxFlags = TxFlags(1 << 1);
    /// Request header complete.
    pub const REQ_SEEN_HEADER: TxFlags = TxFlags(1 << 2);
    /// At least one request body chunk seen.
    pub const REQ_SEEN_BODY: TxFlags = TxFlags(1 << 3);
    /// Request complete.
    pub const REQ_FINISHED: TxFlags = TxFlags(1 << 4);
    /// Response line seen.
    pub const RES_STARTED: TxFlags = TxFlags(1 << 5);
    /// Response header complete.
    pub const RES_SEEN_HEADER: TxFlags = TxFlags(1 << 6);
    /// At least one response body chunk seen.
    pub const RES_SEEN_BODY: TxFlags = TxFlags(1 << 7);
    /// Response complete.
    pub const RES_FINISHED: TxFlags = TxFlags(1 << 8);
    /// Post-processing ran.
    pub const POSTPROCESS: TxFlags = TxFlags(1 << 9);
    /// Logging ran.
    pub const LOGGING: TxFlags = TxFlags(1 << 10);
    /// The transaction hit an error.
    pub const ERROR: TxFlags = TxFlags(1 << 11);

    const NAMES: &'static [(TxFlags, &'static str)] = &[
        (Self::PIPELINED, "pipelined"),
        (Self::REQ_STARTED, "req_started"),
        (Self::REQ_SEEN_HEADER, "req_seen_header"),
        (Self::REQ_SEEN_BODY, "req_seen_body"),
        (Self::REQ_FINISHED, "req_finished"),
        (Self::RES_STARTED, "res_started"),
        (Self::RES_SEEN_HEADER, "res_seen_header"),
        (Self::RES_SEEN_BODY, "res_seen_body"),
        (Self::RES_FINISHED, "res_finished"),
        (Self::POSTPROCESS, "postprocess"),
        (Self::LOGGING, "logging"),
        (Self::ERROR, "error"),
    ];

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub fn contains(self, other: TxFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`.
    #[must_use]
    pub fn intersects(self, other: TxFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Names of the individual flags set in `self`.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
    }
}

impl std::ops::BitOr for TxFlags {
    type Output = TxFlags;

    fn bitor(self, rhs: TxFlags) -> TxFlags {
        TxFlags(self.0 | rhs.0)
    }
}

/// Severity classification of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEventType {
    /// Something noted for correlation, not actionable alone.
    Observation,
    /// An actionable finding.
    Alert,
}

/// One event recorded against a transaction by a rule or module.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Per-transaction event id, assigned at add time.
    pub id: u64,
    /// Classification.
    pub event_type: LogEventType,
    /// Rule that produced the event, if any.
    pub rule_id: Option<String>,
    /// Human-readable message.
    pub msg: String,
    /// Severity, 0-100.
    pub severity: u8,
    /// Confidence, 0-100.
    pub confidence: u8,
    /// Free-form tags.
    pub tags: Vec<String>,
}

/// Defaults a transaction inherits from its context's configuration.
#[derive(Debug, Clone, Copy)]
pub struct TxDefaults {
    /// Whether audit logging applies to this transaction.
    pub audit: bool,
    /// Whether blocking actions are permitted.
    pub blocking: bool,
}

impl Default for TxDefaults {
    fn default() -> Self {
        Self {
            audit: true,
            blocking: true,
        }
    }
}

/// One request/response exchange on a connection.
pub struct Transaction {
    uuid: Uuid,
    id: TxId,
    ctx: crate::context::ContextId,
    remote_addr: String,
    defaults: TxDefaults,
    flags: TxFlags,
    vars: VarStore,
    logevents: Vec<LogEvent>,
    next_logevent_id: u64,
    request_body: Vec<u8>,
    response_body: Vec<u8>,
    data: ModuleDataArray,
    pool: Pool,
}

impl Transaction {
    pub(crate) fn new(
        id: TxId,
        ctx: crate::context::ContextId,
        remote_addr: impl Into<String>,
        defaults: TxDefaults,
        pool: Pool,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            id,
            ctx,
            remote_addr: remote_addr.into(),
            defaults,
            flags: TxFlags::NONE,
            vars: VarStore::new(),
            logevents: Vec::new(),
            next_logevent_id: 0,
            request_body: Vec::new(),
            response_body: Vec::new(),
            data: ModuleDataArray::new(),
            pool,
        }
    }

    /// Globally unique transaction id.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Position of this transaction on its connection.
    #[must_use]
    pub fn id(&self) -> TxId {
        self.id
    }

    /// The context this transaction runs under.
    #[must_use]
    pub fn context(&self) -> crate::context::ContextId {
        self.ctx
    }

    /// Repoints the transaction at a more specific context, as chosen
    /// during context selection.
    pub fn set_context(&mut self, ctx: crate::context::ContextId) {
        self.ctx = ctx;
    }

    /// Remote address inherited from the connection.
    #[must_use]
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Defaults inherited from the context configuration.
    #[must_use]
    pub fn defaults(&self) -> TxDefaults {
        self.defaults
    }

    /// Current flag bitfield.
    #[must_use]
    pub fn flags(&self) -> TxFlags {
        self.flags
    }

    /// Whether every bit of `flags` is set.
    #[must_use]
    pub fn has_flag(&self, flags: TxFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Sets `flags`, mirroring each newly named flag into the variable
    /// store as `"1"`.
    pub fn set_flag(&mut self, flags: TxFlags) {
        self.flags = self.flags | flags;
        for name in flags.names() {
            self.vars.set_flag(name, true);
        }
    }

    /// The transaction's variable store.
    #[must_use]
    pub fn vars(&self) -> &VarStore {
        &self.vars
    }

    /// Mutable access to the variable store.
    pub fn vars_mut(&mut self) -> &mut VarStore {
        &mut self.vars
    }

    /// Appends a request body chunk, setting [`TxFlags::REQ_SEEN_BODY`].
    pub fn append_request_body(&mut self, chunk: &[u8]) {
        self.set_flag(TxFlags::REQ_SEEN_BODY);
        self.request_body.extend_from_slice(chunk);
        self.pool.record_allocation();
    }

    /// Appends a response body chunk, setting [`TxFlags::RES_SEEN_BODY`].
    pub fn append_response_body(&mut self, chunk: &[u8]) {
        self.set_flag(TxFlags::RES_SEEN_BODY);
        self.response_body.extend_from_slice(chunk);
        self.pool.record_allocation();
    }

    /// Buffered request body.
    #[must_use]
    pub fn request_body(&self) -> &[u8] {
        &self.request_body
    }

    /// Buffered response body.
    #[must_use]
    pub fn response_body(&self) -> &[u8] {
        &self.response_body
    }

    /// Records a log event, returning its per-transaction id.
    pub fn add_logevent(
        &mut self,
        event_type: LogEventType,
        rule_id: Option<String>,
        msg: impl Into<String>,
        severity: u8,
        confidence: u8,
    ) -> u64 {
        let id = self.next_logevent_id;
        self.next_logevent_id += 1;
        self.logevents.push(LogEvent {
            id,
            event_type,
            rule_id,
            msg: msg.into(),
            severity,
            confidence,
            tags: Vec::new(),
        });
        id
    }

    /// Log events recorded so far, in order.
    #[must_use]
    pub fn logevents(&self) -> &[LogEvent] {
        &self.logevents
    }

    /// Mutable access to a log event by id.
    #[must_use]
    pub fn logevent_mut(&mut self, id: u64) -> Option<&mut LogEvent> {
        self.logevents.iter_mut().find(|e| e.id == id)
    }

    /// Per-module data slots.
    #[must_use]
    pub fn data(&self) -> &ModuleDataArray {
        &self.data
    }

    /// Mutable per-module data slots.
    pub fn data_mut(&mut self) -> &mut ModuleDataArray {
        &mut self.data
    }

    /// The transaction's pool.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("uuid", &self.uuid)
            .field("seq", &self.id.seq())
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextId;

    fn tx() -> Transaction {
        Transaction::new(
            TxId(0),
            ContextId::from_raw(0),
            "10.0.0.1",
            TxDefaults::default(),
            Pool::new("tx"),
        )
    }

    #[test]
    fn test_flag_mirroring_into_vars() {
        let mut tx = tx();
        assert!(tx.vars().get("req_started").is_none());
        tx.set_flag(TxFlags::REQ_STARTED);
        assert!(tx.has_flag(TxFlags::REQ_STARTED));
        assert_eq!(tx.vars().get("req_started"), Some("1"));
    }

    #[test]
    fn test_combined_flags_mirror_each_name() {
        let mut tx = tx();
        tx.set_flag(TxFlags::REQ_STARTED | TxFlags::PIPELINED);
        assert_eq!(tx.vars().get("pipelined"), Some("1"));
        assert_eq!(tx.vars().get("req_started"), Some("1"));
    }

    #[test]
    fn test_body_chunks_set_seen_flags() {
        let mut tx = tx();
        tx.append_request_body(b"user=");
        tx.append_request_body(b"admin");
        assert_eq!(tx.request_body(), b"user=admin");
        assert!(tx.has_flag(TxFlags::REQ_SEEN_BODY));
        assert!(!tx.has_flag(TxFlags::RES_SEEN_BODY));
    }

    #[test]
    fn test_logevent_ids_monotonic() {
        let mut tx = tx();
        let first = tx.add_logevent(LogEventType::Observation, None, "probe", 20, 50);
        let second = tx.add_logevent(
            LogEventType::Alert,
            Some("rule/42".to_string()),
            "sqli",
            90,
            80,
        );
        assert_eq!((first, second), (0, 1));
        assert_eq!(tx.logevents().len(), 2);

        tx.logevent_mut(second).unwrap().tags.push("sqli".to_string());
        assert_eq!(tx.logevents()[1].tags, vec!["sqli"]);
    }

    #[test]
    fn test_flag_name_iteration() {
        let flags = TxFlags::REQ_SEEN_BODY | TxFlags::LOGGING;
        let names: Vec<_> = flags.names().collect();
        assert_eq!(names, vec!["req_seen_body", "logging"]);
    }
}
