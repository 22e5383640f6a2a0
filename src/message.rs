//! Wire records for the session layer.
//!
//! The message header is the outer framing every datagram carries. Handshake
//! payloads travel unencrypted with session id 0; everything else is AEAD
//! protected with the header bytes as associated data. All fields are
//! bounds-checked during decode, before any cryptographic operation looks at
//! them.

use crate::error::Error;

/// Uncompressed SEC1 P-256 point length.
pub(crate) const P256_POINT_LEN: usize = 65;

/// Resumption id length.
pub(crate) const RESUMPTION_ID_LEN: usize = 16;

/// AEAD tag length (AES-128-GCM).
pub(crate) const TAG_LEN: usize = 16;

const FLAG_ENCRYPTED: u8 = 0b0000_0001;
const FLAG_SOURCE: u8 = 0b0000_0010;
const FLAG_DEST: u8 = 0b0000_0100;
const FLAG_CONTROL: u8 = 0b0000_1000;

/// Bounds-checked cursor over an inbound datagram.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Remaining unread bytes.
    pub fn rest(&mut self) -> &'a [u8] {
        let r = &self.buf[self.pos..];
        self.pos = self.buf.len();
        r
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() - self.pos < n {
            return Err(Error::TooShort);
        }
        let r = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(r)
    }

    pub fn arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let s = self.take(N)?;
        // Length is checked by take().
        let mut out = [0u8; N];
        out.copy_from_slice(s);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.arr()?))
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.arr()?))
    }

    pub fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.arr()?))
    }

    /// Require that the whole input was consumed.
    pub fn expect_end(&self, what: &'static str) -> Result<(), Error> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(Error::Decode(what))
        }
    }
}

/// Outer message header.
///
/// For encrypted traffic `session_id` is the id the *receiver* allocated for
/// the session and the encoded header doubles as the AEAD associated data.
/// Handshake messages carry session id 0 and counter 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub session_id: u16,
    pub counter: u32,
    pub source: Option<u64>,
    pub dest: Option<u64>,
    pub encrypted: bool,
    pub control: bool,
}

impl MessageHeader {
    pub fn plain() -> Self {
        MessageHeader {
            session_id: 0,
            counter: 0,
            source: None,
            dest: None,
            encrypted: false,
            control: false,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut flags = 0;
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if self.source.is_some() {
            flags |= FLAG_SOURCE;
        }
        if self.dest.is_some() {
            flags |= FLAG_DEST;
        }
        if self.control {
            flags |= FLAG_CONTROL;
        }

        out.push(flags);
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.counter.to_le_bytes());
        if let Some(source) = self.source {
            out.extend_from_slice(&source.to_le_bytes());
        }
        if let Some(dest) = self.dest {
            out.extend_from_slice(&dest.to_le_bytes());
        }
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Self, Error> {
        let flags = r.u8()?;
        let session_id = r.u16()?;
        let counter = r.u32()?;

        let source = if flags & FLAG_SOURCE != 0 {
            Some(r.u64()?)
        } else {
            None
        };
        let dest = if flags & FLAG_DEST != 0 {
            Some(r.u64()?)
        } else {
            None
        };

        Ok(MessageHeader {
            session_id,
            counter,
            source,
            dest,
            encrypted: flags & FLAG_ENCRYPTED != 0,
            control: flags & FLAG_CONTROL != 0,
        })
    }
}

/// Handshake status codes.
pub(crate) const STATUS_OK: u16 = 0;
pub(crate) const STATUS_FAILED: u16 = 1;
pub(crate) const STATUS_BUSY: u16 = 2;

const OP_PAKE1: u8 = 0x22;
const OP_PAKE2: u8 = 0x23;
const OP_PAKE3: u8 = 0x24;
const OP_SIGMA1: u8 = 0x30;
const OP_SIGMA2: u8 = 0x31;
const OP_SIGMA3: u8 = 0x32;
const OP_SIGMA2_RESUME: u8 = 0x33;
const OP_STATUS: u8 = 0x40;

/// First password-authenticated exchange message: prover's session id and
/// ephemeral share.
#[derive(Debug, Clone)]
pub struct Pake1 {
    pub initiator_session_id: u16,
    pub pa: [u8; P256_POINT_LEN],
}

/// Second password-authenticated exchange message: verifier's session id and
/// ephemeral share plus its confirmation tag over the transcript.
#[derive(Debug, Clone)]
pub struct Pake2 {
    pub responder_session_id: u16,
    pub pb: [u8; P256_POINT_LEN],
    pub cb: [u8; 32],
}

/// Third password-authenticated exchange message: prover's confirmation tag.
#[derive(Debug, Clone)]
pub struct Pake3 {
    pub ca: [u8; 32],
}

/// First certificate-authenticated exchange message.
#[derive(Debug, Clone)]
pub struct Sigma1 {
    pub initiator_random: [u8; 32],
    pub initiator_session_id: u16,
    /// Keyed digest identifying which responder identity is addressed.
    pub destination_id: [u8; 32],
    pub ephemeral_pub: [u8; P256_POINT_LEN],
    /// Present when the initiator attempts an abbreviated resumption run.
    pub resumption: Option<Sigma1Resumption>,
}

#[derive(Debug, Clone)]
pub struct Sigma1Resumption {
    pub id: [u8; RESUMPTION_ID_LEN],
    pub mic: [u8; TAG_LEN],
}

/// Second certificate-authenticated exchange message (full path).
///
/// `encrypted` holds the responder certificate and transcript signature,
/// sealed under a key derived from the fresh shared secret.
#[derive(Debug, Clone)]
pub struct Sigma2 {
    pub responder_random: [u8; 32],
    pub responder_session_id: u16,
    pub ephemeral_pub: [u8; P256_POINT_LEN],
    pub encrypted: Vec<u8>,
}

/// Abbreviated second message on the resumption path.
#[derive(Debug, Clone)]
pub struct Sigma2Resume {
    pub resumption_id: [u8; RESUMPTION_ID_LEN],
    pub resume_mic: [u8; TAG_LEN],
    pub responder_session_id: u16,
}

/// Third certificate-authenticated exchange message (full path only).
#[derive(Debug, Clone)]
pub struct Sigma3 {
    pub encrypted: Vec<u8>,
}

/// Final handshake confirmation / rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub code: u16,
}

/// All unencrypted handshake payloads, discriminated by a leading opcode.
#[derive(Debug, Clone)]
pub enum HandshakePayload {
    Pake1(Pake1),
    Pake2(Pake2),
    Pake3(Pake3),
    Sigma1(Sigma1),
    Sigma2(Sigma2),
    Sigma2Resume(Sigma2Resume),
    Sigma3(Sigma3),
    Status(StatusReport),
}

impl HandshakePayload {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            HandshakePayload::Pake1(m) => {
                out.push(OP_PAKE1);
                out.extend_from_slice(&m.initiator_session_id.to_le_bytes());
                out.extend_from_slice(&m.pa);
            }
            HandshakePayload::Pake2(m) => {
                out.push(OP_PAKE2);
                out.extend_from_slice(&m.responder_session_id.to_le_bytes());
                out.extend_from_slice(&m.pb);
                out.extend_from_slice(&m.cb);
            }
            HandshakePayload::Pake3(m) => {
                out.push(OP_PAKE3);
                out.extend_from_slice(&m.ca);
            }
            HandshakePayload::Sigma1(m) => {
                out.push(OP_SIGMA1);
                out.extend_from_slice(&m.initiator_random);
                out.extend_from_slice(&m.initiator_session_id.to_le_bytes());
                out.extend_from_slice(&m.destination_id);
                out.extend_from_slice(&m.ephemeral_pub);
                match &m.resumption {
                    Some(res) => {
                        out.push(1);
                        out.extend_from_slice(&res.id);
                        out.extend_from_slice(&res.mic);
                    }
                    None => out.push(0),
                }
            }
            HandshakePayload::Sigma2(m) => {
                out.push(OP_SIGMA2);
                out.extend_from_slice(&m.responder_random);
                out.extend_from_slice(&m.responder_session_id.to_le_bytes());
                out.extend_from_slice(&m.ephemeral_pub);
                out.extend_from_slice(&(m.encrypted.len() as u16).to_le_bytes());
                out.extend_from_slice(&m.encrypted);
            }
            HandshakePayload::Sigma2Resume(m) => {
                out.push(OP_SIGMA2_RESUME);
                out.extend_from_slice(&m.resumption_id);
                out.extend_from_slice(&m.resume_mic);
                out.extend_from_slice(&m.responder_session_id.to_le_bytes());
            }
            HandshakePayload::Sigma3(m) => {
                out.push(OP_SIGMA3);
                out.extend_from_slice(&(m.encrypted.len() as u16).to_le_bytes());
                out.extend_from_slice(&m.encrypted);
            }
            HandshakePayload::Status(m) => {
                out.push(OP_STATUS);
                out.extend_from_slice(&m.code.to_le_bytes());
            }
        }
    }

    /// Encode into a fresh buffer. Used for transcripts.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(bytes);
        let opcode = r.u8()?;

        let payload = match opcode {
            OP_PAKE1 => HandshakePayload::Pake1(Pake1 {
                initiator_session_id: r.u16()?,
                pa: r.arr()?,
            }),
            OP_PAKE2 => HandshakePayload::Pake2(Pake2 {
                responder_session_id: r.u16()?,
                pb: r.arr()?,
                cb: r.arr()?,
            }),
            OP_PAKE3 => HandshakePayload::Pake3(Pake3 { ca: r.arr()? }),
            OP_SIGMA1 => {
                let initiator_random = r.arr()?;
                let initiator_session_id = r.u16()?;
                let destination_id = r.arr()?;
                let ephemeral_pub = r.arr()?;
                let resumption = match r.u8()? {
                    0 => None,
                    1 => Some(Sigma1Resumption {
                        id: r.arr()?,
                        mic: r.arr()?,
                    }),
                    _ => return Err(Error::Decode("sigma1")),
                };
                HandshakePayload::Sigma1(Sigma1 {
                    initiator_random,
                    initiator_session_id,
                    destination_id,
                    ephemeral_pub,
                    resumption,
                })
            }
            OP_SIGMA2 => {
                let responder_random = r.arr()?;
                let responder_session_id = r.u16()?;
                let ephemeral_pub = r.arr()?;
                let len = r.u16()? as usize;
                let encrypted = r.take(len)?.to_vec();
                HandshakePayload::Sigma2(Sigma2 {
                    responder_random,
                    responder_session_id,
                    ephemeral_pub,
                    encrypted,
                })
            }
            OP_SIGMA2_RESUME => HandshakePayload::Sigma2Resume(Sigma2Resume {
                resumption_id: r.arr()?,
                resume_mic: r.arr()?,
                responder_session_id: r.u16()?,
            }),
            OP_SIGMA3 => {
                let len = r.u16()? as usize;
                HandshakePayload::Sigma3(Sigma3 {
                    encrypted: r.take(len)?.to_vec(),
                })
            }
            OP_STATUS => HandshakePayload::Status(StatusReport { code: r.u16()? }),
            other => return Err(Error::UnknownOpcode(other)),
        };

        r.expect_end("handshake payload")?;

        Ok(payload)
    }
}

const OP_SYNC_REQUEST: u8 = 0x50;
const OP_SYNC_RESPONSE: u8 = 0x51;

/// Control payloads carried inside an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPayload {
    /// Ask the peer for its current send counter. The challenge proves the
    /// answer is fresh.
    SyncRequest { challenge: [u8; 8] },
    /// Echo of the challenge plus the sender's current send counter.
    SyncResponse { challenge: [u8; 8], counter: u32 },
}

impl ControlPayload {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ControlPayload::SyncRequest { challenge } => {
                out.push(OP_SYNC_REQUEST);
                out.extend_from_slice(challenge);
            }
            ControlPayload::SyncResponse { challenge, counter } => {
                out.push(OP_SYNC_RESPONSE);
                out.extend_from_slice(challenge);
                out.extend_from_slice(&counter.to_le_bytes());
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(bytes);
        let opcode = r.u8()?;

        let payload = match opcode {
            OP_SYNC_REQUEST => ControlPayload::SyncRequest {
                challenge: r.arr()?,
            },
            OP_SYNC_RESPONSE => ControlPayload::SyncResponse {
                challenge: r.arr()?,
                counter: r.u32()?,
            },
            other => return Err(Error::UnknownOpcode(other)),
        };

        r.expect_end("control payload")?;

        Ok(payload)
    }
}
