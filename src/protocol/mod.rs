//! Message capabilities shared by every wire protocol.
//!
//! The client and server engines are generic over these traits and never look inside
//! a message. A protocol supplies:
//!
//! - [`Message`]: something that serializes to a complete, framed byte buffer.
//! - [`Decoder`]: an incremental parser fed with whatever bytes a read produced. It
//!   either asks for more ([`Decoded::NeedMore`]), yields a finished value
//!   ([`Decoded::Done`]) or fails with a [`ProtocolError`], which is fatal to the
//!   connection it came from.
//! - [`Request`]: an outgoing message that knows how to parse its own response.
//! - [`Incoming`]: a message a server can parse from scratch.
//!
//! # Binary Format
//!
//! Messages travel as record-marked fragments (see [`record`]). Inside a record,
//! integers are big-endian and fixed-width; bodies are encoded with `bincode` using
//! [`codec_config`], which lines up with XDR for `u32` fields and discriminated unions.
//!
//! # See Also
//!
//! - [`rpc`]: the ONC-RPC call and reply built on these traits.
use bincode::config::{BigEndian, Configuration, Fixint};
use thiserror::Error;

pub mod record;
pub mod rpc;

pub use record::{DecodeState, FRAGMENT_MAX, RecordDecoder};
pub use rpc::{Call, Reply, RpcError};

/// Progress reported by a [`Decoder`].
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<T> {
    /// At least this many more bytes are needed before anything else can happen.
    NeedMore(usize),
    Done(T),
}

pub trait Decoder: Send + 'static {
    type Item;

    /// Consumes bytes from the front of `input`, advancing it past everything used.
    /// After [`Decoded::Done`], bytes left in `input` belong to the next message.
    fn decode(&mut self, input: &mut &[u8]) -> Result<Decoded<Self::Item>, ProtocolError>;
}

pub trait Message: Send + 'static {
    /// Encodes the message body and its framing.
    fn serialize(&self) -> Result<Vec<u8>, ProtocolError>;
}

pub trait Request: Message {
    type Response: Send + 'static;
    type Decoder: Decoder<Item = Self::Response>;

    /// A decoder for the response that answers this request.
    fn create_response(&self) -> Self::Decoder;
}

pub trait Incoming: Sized + Send + 'static {
    type Decoder: Decoder<Item = Self> + Default;
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("record fragment of {0} bytes exceeds the {FRAGMENT_MAX} byte limit")]
    FragmentTooLarge(usize),
    #[error("record of {0} bytes exceeds the {FRAGMENT_MAX} byte limit")]
    RecordTooLarge(usize),
    #[error("{0} unexpected bytes after a complete message")]
    TrailingBytes(usize),
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("unexpected message type: {0}")]
    MessageType(&'static str),
    #[error("unsupported RPC version {0}")]
    RpcVersion(u32),
    #[error("reply xid {found:#x} does not match call xid {expected:#x}")]
    XidMismatch { expected: u32, found: u32 },
    #[error("authentication body of {0} bytes exceeds 400 bytes")]
    AuthTooLarge(usize),
    #[error("unknown discriminant {0}")]
    UnknownStatus(u32),
}

/// Big-endian, fixed-width integers: the layout every message body uses.
pub fn codec_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}
