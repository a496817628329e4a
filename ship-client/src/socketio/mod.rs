//! Socket.IO client plumbing: the packet codec and the transports.

pub mod packet;
pub mod transport;

pub use packet::{EnginePacket, OpenInfo, PacketError, SocketPacket};
pub use transport::{
    endpoint, Connector, EventStream, PollingEvents, SocketIoConnector, TransportError,
    TransportKind, WebSocketEvents, WireEvent,
};
