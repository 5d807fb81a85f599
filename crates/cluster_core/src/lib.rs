//! # Cluster Core
//!
//! The command layer shared by every process that speaks the internal
//! protocol: connection lifecycle, session registry, message dispatch,
//! the single-consumer message queue, and long-lived outbound links
//! with reconnect-and-backoff.
//!
//! ## Architecture
//!
//! * **[`Conn`]**: a transport-agnostic connection handle with a
//!   bounded outbound queue, an idempotent close, and a writer task
//!   per connection. The TCP writer lives here; the gateway supplies
//!   its own WebSocket writer over the same handle.
//! * **[`SessionRegistry`]**: process-wide map from session id to
//!   connection, used to route a reply back to the socket that
//!   originated a request, even when the reply traveled through
//!   another process.
//! * **[`CmdSet`]**: maps message ids to handlers with a decoded
//!   argument type each, plus one global pre-handler hook, and decides
//!   whether a message runs locally or is forwarded to another named
//!   service.
//! * **[`QueueConsumer`]**: the single consumer that executes all
//!   dispatched handlers in total order; network I/O produces, one
//!   cooperative loop consumes.
//! * **[`ClientPool`]**: at most one outbound link per remote service
//!   name, each with automatic reconnect, fixed backoff schedule, and
//!   an auth-signed first frame.
//!
//! ## Ordering
//!
//! Frames on a single connection are processed in arrival order.
//! Handler execution is totally ordered process-wide because there is
//! exactly one queue consumer. Handlers never lock against each
//! other, but a blocking handler stalls the whole process.

pub use balance::{pick_min_weight, TieBreak};
pub use client::{backoff_delay, request, AddrResolver, ClientLink, ClientPool, InboundHandler, LinkState, BACKOFF_MS};
pub use conn::{
    authenticate, serve_connection, Conn, ConnDriver, OutFrame, AUTH_DEADLINE, OUTBOUND_CAPACITY,
    PING_PERIOD, PONG_WAIT,
};
pub use context::HandlerContext;
pub use dispatch::{CmdSet, Forwarder};
pub use error::NetError;
pub use protocol::{ConcurrentArgs, RegisterArgs, ServiceNotice, UnavailableNotice};
pub use queue::{message_queue, Hook, QueueConsumer, QueueSender, QueuedTask, POP_TIMEOUT};
pub use session::{Session, SessionRegistry};

pub mod balance;
pub mod client;
pub mod conn;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod protocol;
pub mod queue;
pub mod session;
