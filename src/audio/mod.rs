//! Telephony audio frames <-> 16 kHz mono PCM16.

pub mod codec;
pub mod constants;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::Frame;
