//! The per-peer BGP FSM: timers, the I/O contract, the Connection/Session
//! data model, the exception/NOTIFICATION subsystem, and the dispatcher
//! that ties them together.

pub mod connection;
pub mod exception;
pub mod fsm;
pub mod io;
pub mod routeing;
pub mod session;
pub mod timers;
pub mod types;

pub use connection::Connection;
pub use fsm::raise_event;
pub use io::{classify_io_error, ConnectionIo, IoErrorClass, TcpIoDriver, WriteOutcome};
pub use routeing::{ChannelRouteingEngine, RoutEngineMessage, RouteingEngine};
pub use session::{disable_session, enable_session, spawn_event_pump, OpenTemplate, Session};
pub use timers::Timer;
pub use types::{AdminState, Event, ExceptKind, Exception, Ordinal, OrdinalCell, SessionEvent, State};

#[cfg(test)]
mod tests;
