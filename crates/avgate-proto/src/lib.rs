pub mod codec;
pub mod event;

pub use codec::{encode_payload, invert_bytes, render_ascii, render_hex, EncodeError, EncodeMode, Suffix};
pub use event::{DataFrame, Direction, EventBus, EventKind, GatewayEvent, SerialStatus};
