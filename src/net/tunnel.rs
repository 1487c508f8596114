//! Secure-tunnel handshakes.
//!
//! A tunnel socket is an ordinary TCP stream that runs a [`Handshake`] once, right
//! after it is connected or accepted and before any record is read or written. The
//! handshake runs on a worker thread with the socket temporarily in blocking mode.
use std::{
    fmt,
    io::{self, ErrorKind, Read, Write},
};

/// Anything a handshake can talk through.
pub trait Stream: Read + Write {}

impl<T: Read + Write + ?Sized> Stream for T {}

pub trait Handshake: Send + Sync + 'static {
    /// Runs the connecting side of the handshake.
    fn client(&self, stream: &mut dyn Stream) -> io::Result<()>;

    /// Runs the accepting side of the handshake.
    fn server(&self, stream: &mut dyn Stream) -> io::Result<()>;
}

const MAGIC: &[u8; 4] = b"SKN1";
const SECRET_MAX: usize = 256;
const ACCEPTED: u8 = 0x01;
const REJECTED: u8 = 0x00;

/// Admits peers that present the same pre-shared secret.
///
/// The client sends `SKN1`, a big-endian `u32` length and the secret; the server
/// answers with a single acknowledgement byte. Traffic is not encrypted.
#[derive(Clone)]
pub struct SharedSecret {
    secret: Vec<u8>,
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("len", &self.secret.len())
            .finish()
    }
}

impl SharedSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> io::Result<Self> {
        let secret = secret.into();
        if secret.is_empty() || secret.len() > SECRET_MAX {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("shared secret must be 1..={SECRET_MAX} bytes"),
            ));
        }
        Ok(Self { secret })
    }

    fn matches(&self, presented: &[u8]) -> bool {
        presented.len() == self.secret.len()
            && presented
                .iter()
                .zip(&self.secret)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

impl Handshake for SharedSecret {
    fn client(&self, stream: &mut dyn Stream) -> io::Result<()> {
        let mut hello = Vec::with_capacity(MAGIC.len() + 4 + self.secret.len());
        hello.extend_from_slice(MAGIC);
        hello.extend_from_slice(&(self.secret.len() as u32).to_be_bytes());
        hello.extend_from_slice(&self.secret);
        stream.write_all(&hello)?;
        stream.flush()?;

        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack)?;
        match ack[0] {
            ACCEPTED => Ok(()),
            _ => Err(io::Error::new(
                ErrorKind::PermissionDenied,
                "peer rejected the shared secret",
            )),
        }
    }

    fn server(&self, stream: &mut dyn Stream) -> io::Result<()> {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header)?;
        if &header[..4] != MAGIC {
            return Err(io::Error::new(ErrorKind::InvalidData, "bad tunnel magic"));
        }

        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > SECRET_MAX {
            stream.write_all(&[REJECTED])?;
            return Err(io::Error::new(ErrorKind::InvalidData, "oversized secret"));
        }
        let mut presented = vec![0u8; len];
        stream.read_exact(&mut presented)?;

        if self.matches(&presented) {
            stream.write_all(&[ACCEPTED])?;
            stream.flush()
        } else {
            stream.write_all(&[REJECTED])?;
            Err(io::Error::new(
                ErrorKind::PermissionDenied,
                "client presented the wrong secret",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::net::UnixStream, thread};

    use super::*;

    fn run(client: SharedSecret, server: SharedSecret) -> (io::Result<()>, io::Result<()>) {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || server.server(&mut b));
        let client = client.client(&mut a);
        (client, server.join().unwrap())
    }

    #[test]
    fn matching_secrets_pass() {
        let secret = SharedSecret::new("hunter2").unwrap();
        let (client, server) = run(secret.clone(), secret);
        client.unwrap();
        server.unwrap();
    }

    #[test]
    fn wrong_secret_is_denied_on_both_sides() {
        let (client, server) = run(
            SharedSecret::new("hunter2").unwrap(),
            SharedSecret::new("swordfish").unwrap(),
        );
        assert_eq!(client.unwrap_err().kind(), ErrorKind::PermissionDenied);
        assert_eq!(server.unwrap_err().kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn bad_magic_is_invalid_data() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.write_all(b"HTTP/1.1").unwrap();
        let err = SharedSecret::new("x").unwrap().server(&mut b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn secret_length_is_bounded() {
        assert!(SharedSecret::new("").is_err());
        assert!(SharedSecret::new(vec![1u8; SECRET_MAX + 1]).is_err());
        assert!(SharedSecret::new(vec![1u8; SECRET_MAX]).is_ok());
    }
}
