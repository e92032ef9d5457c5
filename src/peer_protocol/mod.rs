pub mod codec;
pub mod extended;
pub mod handshake;
