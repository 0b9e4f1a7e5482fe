//! Wire protocol between the service and its clients

pub mod client;
pub mod codec;
pub mod message;

pub use client::{ClientError, ServiceClient, VpnStatusCallback};
pub use codec::{CodecError, JsonCodec};
pub use message::{
    ClientMessage, ErrorCode, LogLevel, LogStream, ServiceMessage, StatusData, VpnStatus,
};
