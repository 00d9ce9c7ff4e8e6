//! Marshaled transport between client facades and the broker

pub mod loopback;
pub mod messages;

pub use loopback::LoopbackAccessor;
pub use messages::{decode_frame, encode_frame, Frame, Request, Response};
