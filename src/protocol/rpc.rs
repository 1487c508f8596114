//! ONC-RPC calls and replies.
//!
//! Headers follow the RPC version 2 layout: an xid, the message type, then either the
//! call body (`rpcvers`, program, version, procedure, credential, verifier) or the reply
//! status. Arguments and results are opaque to the engines and encoded with `bincode`
//! right after the header, all inside one record.
use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use bincode::{
    Decode, Encode,
    de::{Decoder as BincodeDecoder, read::Reader},
    enc::{Encoder, write::Writer},
    error::{DecodeError, EncodeError},
};
use thiserror::Error;

use super::{
    Decoded, Decoder, Incoming, Message, ProtocolError, Request, codec_config,
    record::{self, RecordDecoder},
};

pub const RPC_VERSION: u32 = 2;
pub const AUTH_NONE: u32 = 0;
pub const AUTH_BODY_MAX: usize = 400;

static XID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A fresh transaction id: the current Unix second offset by a process-wide counter,
/// so calls made within the same second still differ.
pub fn next_xid() -> u32 {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or_default();
    seconds.wrapping_add(XID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Credential or verifier: an auth flavor and up to 400 opaque bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Vec<u8>,
}

impl OpaqueAuth {
    pub fn new(flavor: u32, body: impl Into<Vec<u8>>) -> Result<Self, ProtocolError> {
        let body = body.into();
        if body.len() > AUTH_BODY_MAX {
            return Err(ProtocolError::AuthTooLarge(body.len()));
        }
        Ok(Self { flavor, body })
    }

    pub fn none() -> Self {
        Self::default()
    }
}

impl Encode for OpaqueAuth {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        let len = self.body.len();
        if len > AUTH_BODY_MAX {
            return Err(EncodeError::OtherString(format!(
                "auth body of {len} bytes exceeds {AUTH_BODY_MAX}"
            )));
        }
        self.flavor.encode(encoder)?;
        (len as u32).encode(encoder)?;
        encoder.writer().write(&self.body)?;
        encoder.writer().write(&[0u8; 3][..padding(len)])
    }
}

impl<Context> Decode<Context> for OpaqueAuth {
    fn decode<D: BincodeDecoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let flavor = u32::decode(decoder)?;
        let len = u32::decode(decoder)? as usize;
        if len > AUTH_BODY_MAX {
            return Err(DecodeError::OtherString(format!(
                "auth body of {len} bytes exceeds {AUTH_BODY_MAX}"
            )));
        }
        decoder.claim_bytes_read(len + padding(len))?;

        let mut body = vec![0; len];
        decoder.reader().read(&mut body)?;
        let mut pad = [0u8; 3];
        decoder.reader().read(&mut pad[..padding(len)])?;
        Ok(Self { flavor, body })
    }
}

bincode::impl_borrow_decode!(OpaqueAuth);

/// Outcome of a call the server accepted. Discriminants match `accept_stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum AcceptedStatus {
    Success,
    ProgramUnavailable,
    ProgramMismatch { low: u32, high: u32 },
    ProcedureUnavailable,
    GarbageArgs,
    SystemError,
}

/// Why a call was denied. Discriminants match `reject_stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum RejectedStatus {
    RpcMismatch { low: u32, high: u32 },
    AuthError { stat: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ReplyStatus {
    Accepted {
        verf: OpaqueAuth,
        status: AcceptedStatus,
    },
    Denied(RejectedStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct CallBody {
    rpcvers: u32,
    prog: u32,
    vers: u32,
    procedure: u32,
    cred: OpaqueAuth,
    verf: OpaqueAuth,
}

/// `msg_type` 0 is a call, 1 a reply.
#[derive(Debug, Encode, Decode)]
enum Body {
    Call(CallBody),
    Reply(ReplyStatus),
}

#[derive(Debug, Encode, Decode)]
struct Header {
    xid: u32,
    body: Body,
}

fn from_decode(e: DecodeError) -> ProtocolError {
    match e {
        DecodeError::UnexpectedVariant { found, .. } => ProtocolError::UnknownStatus(found),
        e => ProtocolError::Decode(e),
    }
}

fn frame(header: Header, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut buffer = record::start();
    bincode::encode_into_std_write(header, &mut buffer, codec_config())?;
    buffer.extend_from_slice(payload);
    record::finish(&mut buffer)?;
    Ok(buffer)
}

fn parse(record: &[u8]) -> Result<(Header, &[u8]), ProtocolError> {
    let (header, used): (Header, usize) =
        bincode::decode_from_slice(record, codec_config()).map_err(from_decode)?;
    Ok((header, &record[used..]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    xid: u32,
    body: CallBody,
    args: Vec<u8>,
}

impl Call {
    /// A call with a fresh xid and `AUTH_NONE` credentials.
    pub fn new<A: Encode>(prog: u32, vers: u32, procedure: u32, args: &A) -> Result<Self, ProtocolError> {
        Ok(Self {
            xid: next_xid(),
            body: CallBody {
                rpcvers: RPC_VERSION,
                prog,
                vers,
                procedure,
                cred: OpaqueAuth::none(),
                verf: OpaqueAuth::none(),
            },
            args: bincode::encode_to_vec(args, codec_config())?,
        })
    }

    pub fn with_credential(mut self, cred: OpaqueAuth, verf: OpaqueAuth) -> Self {
        self.body.cred = cred;
        self.body.verf = verf;
        self
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn program(&self) -> u32 {
        self.body.prog
    }

    pub fn version(&self) -> u32 {
        self.body.vers
    }

    pub fn procedure(&self) -> u32 {
        self.body.procedure
    }

    pub fn credential(&self) -> &OpaqueAuth {
        &self.body.cred
    }

    pub fn verifier(&self) -> &OpaqueAuth {
        &self.body.verf
    }

    pub fn args(&self) -> &[u8] {
        &self.args
    }

    pub fn decode_args<A: Decode<()>>(&self) -> Result<A, ProtocolError> {
        let (args, _) = bincode::decode_from_slice(&self.args, codec_config())?;
        Ok(args)
    }

    /// A successful reply carrying `result`.
    pub fn reply<T: Encode>(&self, result: &T) -> Result<Reply, ProtocolError> {
        Ok(Reply {
            xid: self.xid,
            status: ReplyStatus::Accepted {
                verf: OpaqueAuth::none(),
                status: AcceptedStatus::Success,
            },
            results: bincode::encode_to_vec(result, codec_config())?,
        })
    }

    pub fn reply_error(&self, status: AcceptedStatus) -> Reply {
        Reply {
            xid: self.xid,
            status: ReplyStatus::Accepted {
                verf: OpaqueAuth::none(),
                status,
            },
            results: Vec::new(),
        }
    }

    pub fn reply_denied(&self, status: RejectedStatus) -> Reply {
        Reply {
            xid: self.xid,
            status: ReplyStatus::Denied(status),
            results: Vec::new(),
        }
    }

    fn from_record(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (header, args) = parse(bytes)?;
        let Body::Call(body) = header.body else {
            return Err(ProtocolError::MessageType("expected a call, got a reply"));
        };
        if body.rpcvers != RPC_VERSION {
            return Err(ProtocolError::RpcVersion(body.rpcvers));
        }
        Ok(Self {
            xid: header.xid,
            body,
            args: args.to_vec(),
        })
    }
}

impl Message for Call {
    fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        let header = Header {
            xid: self.xid,
            body: Body::Call(self.body.clone()),
        };
        frame(header, &self.args)
    }
}

impl Request for Call {
    type Response = Reply;
    type Decoder = ReplyDecoder;

    fn create_response(&self) -> ReplyDecoder {
        ReplyDecoder {
            record: RecordDecoder::new(),
            xid: self.xid,
        }
    }
}

impl Incoming for Call {
    type Decoder = CallDecoder;
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("program unavailable")]
    ProgramUnavailable,
    #[error("program version mismatch, server supports {low}..={high}")]
    ProgramMismatch { low: u32, high: u32 },
    #[error("procedure unavailable")]
    ProcedureUnavailable,
    #[error("server could not decode the arguments")]
    GarbageArgs,
    #[error("server system error")]
    SystemError,
    #[error("RPC version mismatch, server supports {low}..={high}")]
    RpcMismatch { low: u32, high: u32 },
    #[error("authentication error {0}")]
    AuthError(u32),
    #[error("failed to decode results: {0}")]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    xid: u32,
    status: ReplyStatus,
    results: Vec<u8>,
}

impl Reply {
    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn status(&self) -> &ReplyStatus {
        &self.status
    }

    /// Decodes the results of a successful call, or maps the failure status.
    pub fn result<T: Decode<()>>(&self) -> Result<T, RpcError> {
        let status = match &self.status {
            ReplyStatus::Accepted { status, .. } => *status,
            ReplyStatus::Denied(RejectedStatus::RpcMismatch { low, high }) => {
                return Err(RpcError::RpcMismatch {
                    low: *low,
                    high: *high,
                });
            }
            ReplyStatus::Denied(RejectedStatus::AuthError { stat }) => {
                return Err(RpcError::AuthError(*stat));
            }
        };

        match status {
            AcceptedStatus::Success => {
                let (result, _) = bincode::decode_from_slice(&self.results, codec_config())?;
                Ok(result)
            }
            AcceptedStatus::ProgramUnavailable => Err(RpcError::ProgramUnavailable),
            AcceptedStatus::ProgramMismatch { low, high } => {
                Err(RpcError::ProgramMismatch { low, high })
            }
            AcceptedStatus::ProcedureUnavailable => Err(RpcError::ProcedureUnavailable),
            AcceptedStatus::GarbageArgs => Err(RpcError::GarbageArgs),
            AcceptedStatus::SystemError => Err(RpcError::SystemError),
        }
    }

    fn from_record(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (header, results) = parse(bytes)?;
        let Body::Reply(status) = header.body else {
            return Err(ProtocolError::MessageType("expected a reply, got a call"));
        };
        Ok(Self {
            xid: header.xid,
            status,
            results: results.to_vec(),
        })
    }
}

impl Message for Reply {
    fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        let header = Header {
            xid: self.xid,
            body: Body::Reply(self.status.clone()),
        };
        frame(header, &self.results)
    }
}

/// Parses calls arriving at a server.
#[derive(Debug, Default)]
pub struct CallDecoder {
    record: RecordDecoder,
}

impl Decoder for CallDecoder {
    type Item = Call;

    fn decode(&mut self, input: &mut &[u8]) -> Result<Decoded<Call>, ProtocolError> {
        match self.record.decode(input)? {
            Decoded::NeedMore(k) => Ok(Decoded::NeedMore(k)),
            Decoded::Done(bytes) => Ok(Decoded::Done(Call::from_record(&bytes)?)),
        }
    }
}

/// Parses the reply to one particular call, rejecting any other xid.
#[derive(Debug)]
pub struct ReplyDecoder {
    record: RecordDecoder,
    xid: u32,
}

impl Decoder for ReplyDecoder {
    type Item = Reply;

    fn decode(&mut self, input: &mut &[u8]) -> Result<Decoded<Reply>, ProtocolError> {
        let bytes = match self.record.decode(input)? {
            Decoded::NeedMore(k) => return Ok(Decoded::NeedMore(k)),
            Decoded::Done(bytes) => bytes,
        };
        let reply = Reply::from_record(&bytes)?;
        if reply.xid != self.xid {
            return Err(ProtocolError::XidMismatch {
                expected: self.xid,
                found: reply.xid,
            });
        }
        Ok(Decoded::Done(reply))
    }
}
