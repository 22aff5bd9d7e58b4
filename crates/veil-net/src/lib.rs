// Framed wire protocol and transport capabilities.

pub mod error;
pub mod framed;
pub mod transport;

pub use error::NetError;
pub use framed::{decode_frame, encode_frame, CloseHandle, FramedConnection};
pub use transport::{
    with_timeout, AsyncStream, BoxedStream, LoopbackDirectory, ServiceRegistrar, TcpTransport,
    Transport,
};
