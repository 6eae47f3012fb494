//! Connections and the per-connection transaction chain.
//!
//! A connection is owned by the server binding that accepted it; the
//! engine creates it, hands it back, and is given it again for each
//! notification. Transactions live inside their connection in arrival
//! order. A connection is single-threaded by discipline, so none of
//! this needs internal locking.

pub mod tx;

use tracing::warn;
use uuid::Uuid;

use crate::context::ContextId;
use crate::error::EngineResult;
use crate::module::ModuleDataArray;
use crate::pool::Pool;

use self::tx::{Transaction, TxDefaults, TxFlags, TxId};

/// Connection flag bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnFlags(u32);

impl ConnFlags {
    /// No flags.
    pub const NONE: ConnFlags = ConnFlags(0);
    /// The server reported the connection open.
    pub const OPENED: ConnFlags = ConnFlags(1 << 0);
    /// Inbound data observed.
    pub const SEEN_DATA_IN: ConnFlags = ConnFlags(1 << 1);
    /// Outbound data observed.
    pub const SEEN_DATA_OUT: ConnFlags = ConnFlags(1 << 2);
    /// The server reported the connection closed.
    pub const CLOSED: ConnFlags = ConnFlags(1 << 3);

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub fn contains(self, other: ConnFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ConnFlags {
    type Output = ConnFlags;

    fn bitor(self, rhs: ConnFlags) -> ConnFlags {
        ConnFlags(self.0 | rhs.0)
    }
}

/// One client connection and its transactions.
pub struct Connection {
    id: Uuid,
    ctx: ContextId,
    local_addr: String,
    local_port: u16,
    remote_addr: String,
    remote_port: u16,
    flags: ConnFlags,
    data: ModuleDataArray,
    txs: Vec<Transaction>,
    current: Option<TxId>,
    next_seq: u64,
    pool: Pool,
}

impl Connection {
    pub(crate) fn new(
        ctx: ContextId,
        local_addr: impl Into<String>,
        local_port: u16,
        remote_addr: impl Into<String>,
        remote_port: u16,
        pool: Pool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ctx,
            local_addr: local_addr.into(),
            local_port,
            remote_addr: remote_addr.into(),
            remote_port,
            flags: ConnFlags::NONE,
            data: ModuleDataArray::new(),
            txs: Vec::new(),
            current: None,
            next_seq: 0,
            pool,
        }
    }

    /// Globally unique connection id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The context this connection runs under.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.ctx
    }

    /// Repoints the connection at a more specific context.
    pub fn set_context(&mut self, ctx: ContextId) {
        self.ctx = ctx;
    }

    /// Local (server-side) address.
    #[must_use]
    pub fn local_addr(&self) -> (&str, u16) {
        (&self.local_addr, self.local_port)
    }

    /// Remote (client-side) address.
    #[must_use]
    pub fn remote_addr(&self) -> (&str, u16) {
        (&self.remote_addr, self.remote_port)
    }

    /// Current flag bitfield.
    #[must_use]
    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    /// Whether every bit of `flags` is set.
    #[must_use]
    pub fn has_flag(&self, flags: ConnFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Sets `flags`.
    pub fn set_flag(&mut self, flags: ConnFlags) {
        self.flags = self.flags | flags;
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

    /// The connection's pool.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Starts a new transaction on this connection and makes it current.
    ///
    /// A transaction joining an empty chain is created unflagged. A
    /// transaction joining a non-empty chain is flagged pipelined at
    /// creation, and the moment the chain grows from one to two the
    /// head is retroactively flagged too. A chain that never holds two
    /// transactions at once never flags any.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::EngineError::Alloc`] if the connection's
    /// pool has been released.
    pub fn tx_create(&mut self, ctx: ContextId, defaults: TxDefaults) -> EngineResult<TxId> {
        let id = TxId(self.next_seq);
        let pool = self.pool.subpool(format!("tx/{}", id.seq()))?;

        let mut tx = Transaction::new(id, ctx, self.remote_addr.clone(), defaults, pool);
        if !self.txs.is_empty() {
            tx.set_flag(TxFlags::PIPELINED);
            // The chain head predates the knowledge that the connection
            // pipelines; flag it the moment a second one appears.
            if self.txs.len() == 1 {
                self.txs[0].set_flag(TxFlags::PIPELINED);
            }
        }

        // Publish only after the transaction is fully built.
        self.next_seq += 1;
        self.txs.push(tx);
        self.current = Some(id);
        Ok(id)
    }

    /// Removes a transaction from the chain and releases its subtree.
    ///
    /// A transaction that carried body data but was never seen through
    /// post-processing and logging is a lifecycle violation worth
    /// flagging, but not fatal.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not on this connection's chain; destroying a
    /// transaction through the wrong connection is a programmer error.
    pub fn tx_destroy(&mut self, id: TxId) {
        let pos = self
            .txs
            .iter()
            .position(|tx| tx.id() == id)
            .unwrap_or_else(|| panic!("transaction {} not on its connection chain", id.seq()));

        let tx = self.txs.remove(pos);
        let seen_body = tx.flags().intersects(TxFlags::REQ_SEEN_BODY | TxFlags::RES_SEEN_BODY);
        let completed = tx.has_flag(TxFlags::POSTPROCESS | TxFlags::LOGGING);
        if seen_body && !completed {
            warn!(
                tx = %tx.uuid(),
                seq = id.seq(),
                flags = ?tx.flags(),
                "transaction destroyed with body data but without postprocess+logging"
            );
        }

        if self.current == Some(id) {
            self.current = self.txs.last().map(Transaction::id);
        }
        tx.pool().release();
    }

    /// The current (most recently started) transaction's id.
    #[must_use]
    pub fn current_tx(&self) -> Option<TxId> {
        self.current
    }

    /// Borrows a transaction by id.
    #[must_use]
    pub fn tx(&self, id: TxId) -> Option<&Transaction> {
        self.txs.iter().find(|tx| tx.id() == id)
    }

    /// Mutably borrows a transaction by id.
    #[must_use]
    pub fn tx_mut(&mut self, id: TxId) -> Option<&mut Transaction> {
        self.txs.iter_mut().find(|tx| tx.id() == id)
    }

    /// The first transaction still on the chain.
    #[must_use]
    pub fn first_tx(&self) -> Option<&Transaction> {
        self.txs.first()
    }

    /// Live transactions in arrival order.
    #[must_use]
    pub fn transactions(&self) -> &[Transaction] {
        &self.txs
    }

    /// Number of transactions ever started on this connection.
    #[must_use]
    pub fn tx_count(&self) -> u64 {
        self.next_seq
    }

    /// Releases the connection's subtree. Outstanding transactions are
    /// released with it.
    pub fn destroy(self) {
        if !self.txs.is_empty() {
            warn!(
                conn = %self.id,
                outstanding = self.txs.len(),
                "connection destroyed with outstanding transactions"
            );
        }
        self.pool.release();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &format_args!("{}:{}", self.remote_addr, self.remote_port))
            .field("txs", &self.txs.len())
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(
            ContextId::from_raw(0),
            "10.0.0.2",
            443,
            "203.0.113.9",
            51612,
            Pool::new("connection"),
        )
    }

    fn create_tx(conn: &mut Connection) -> TxId {
        conn.tx_create(ContextId::from_raw(0), TxDefaults::default())
            .unwrap()
    }

    #[test]
    fn test_single_tx_never_flagged_pipelined() {
        let mut conn = conn();
        let id = create_tx(&mut conn);
        assert!(!conn.tx(id).unwrap().has_flag(TxFlags::PIPELINED));
        conn.tx_destroy(id);
        assert!(conn.current_tx().is_none());
    }

    #[test]
    fn test_second_tx_retroactively_flags_first() {
        let mut conn = conn();
        let first = create_tx(&mut conn);
        assert!(!conn.tx(first).unwrap().has_flag(TxFlags::PIPELINED));

        let second = create_tx(&mut conn);
        assert!(conn.tx(first).unwrap().has_flag(TxFlags::PIPELINED));
        assert!(conn.tx(second).unwrap().has_flag(TxFlags::PIPELINED));
        assert_eq!(conn.current_tx(), Some(second));
    }

    #[test]
    fn test_tx_on_emptied_chain_starts_unflagged() {
        let mut conn = conn();
        let first = create_tx(&mut conn);
        let second = create_tx(&mut conn);
        conn.tx_destroy(first);
        conn.tx_destroy(second);

        // Once the chain drains, a later transaction is the head of a
        // fresh sequence and starts unflagged, even though the
        // connection pipelined before.
        let third = create_tx(&mut conn);
        assert!(!conn.tx(third).unwrap().has_flag(TxFlags::PIPELINED));

        let fourth = create_tx(&mut conn);
        assert!(conn.tx(third).unwrap().has_flag(TxFlags::PIPELINED));
        assert!(conn.tx(fourth).unwrap().has_flag(TxFlags::PIPELINED));
    }

    #[test]
    fn test_destroy_repairs_chain_order() {
        let mut conn = conn();
        let a = create_tx(&mut conn);
        let b = create_tx(&mut conn);
        let c = create_tx(&mut conn);

        conn.tx_destroy(b);
        let seqs: Vec<_> = conn.transactions().iter().map(|t| t.id()).collect();
        assert_eq!(seqs, vec![a, c]);
        assert_eq!(conn.current_tx(), Some(c));

        conn.tx_destroy(c);
        assert_eq!(conn.current_tx(), Some(a));
    }

    #[test]
    #[should_panic(expected = "not on its connection chain")]
    fn test_destroy_unknown_tx_panics() {
        let mut conn = conn();
        let id = create_tx(&mut conn);
        conn.tx_destroy(id);
        conn.tx_destroy(id);
    }

    #[test]
    fn test_tx_ids_never_reused() {
        let mut conn = conn();
        let a = create_tx(&mut conn);
        conn.tx_destroy(a);
        let b = create_tx(&mut conn);
        assert_ne!(a, b);
        assert_eq!(conn.tx_count(), 2);
    }

    #[test]
    fn test_tx_pool_nested_under_connection() {
        let mut conn = conn();
        let id = create_tx(&mut conn);
        assert_eq!(conn.tx(id).unwrap().pool().depth(), 1);
        assert_eq!(conn.pool().live_children(), 1);
    }

    #[test]
    fn test_connection_flags() {
        let mut conn = conn();
        conn.set_flag(ConnFlags::OPENED | ConnFlags::SEEN_DATA_IN);
        assert!(conn.has_flag(ConnFlags::OPENED));
        assert!(!conn.has_flag(ConnFlags::CLOSED));
    }
}
