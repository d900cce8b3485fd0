//! WebSocket side of a connection: the two transport pumps and the
//! per-socket lifecycle that ties them to a broker connection.

pub mod pump;
pub mod socket;

pub use pump::{InboundEnd, inbound_pump, outbound_pump};
pub use socket::{handle_socket, serve_connection};
