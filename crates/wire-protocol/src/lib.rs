pub mod codec;
pub mod message;
pub mod request_id;

pub use codec::{FramerError, JsonLineCodec};
pub use message::{methods, JsonRpcMessage, MessageKind};
pub use request_id::RequestId;
