//! Encoding and decoding for the cells the circuit-construction core
//! sends and receives.
//!
//! Cell framing, link encryption, and queueing belong to the channel
//! layer; this module only knows the bodies of the create/created
//! family, the extend/extended relay messages, the relay header, and
//! the begin/end messages used by the end-of-life probe.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::bytes::{BytesError, Readable, Reader, Result, Writeable, Writer};
use crate::ids::{IdDigest, StreamId};

/// Number of bytes in a cell body (after the header).
pub const CELL_PAYLOAD_SIZE: usize = 509;
/// Number of bytes in a relay cell header.
pub const RELAY_HEADER_SIZE: usize = 11;
/// Number of payload bytes available in one relay cell.
pub const RELAY_PAYLOAD_SIZE: usize = CELL_PAYLOAD_SIZE - RELAY_HEADER_SIZE;

/// Number of bytes in a client's TAP onionskin.
pub const TAP_C_HANDSHAKE_LEN: usize = 186;
/// Number of bytes in a relay's TAP reply.
pub const TAP_S_HANDSHAKE_LEN: usize = 148;
/// Number of bytes in a client's CREATE_FAST handshake.
pub const FAST_C_HANDSHAKE_LEN: usize = 20;
/// Number of bytes in a relay's CREATED_FAST reply.
pub const FAST_S_HANDSHAKE_LEN: usize = 40;
/// Number of bytes in a client's ntor onionskin.
pub const NTOR_C_HANDSHAKE_LEN: usize = 84;
/// Number of bytes in a relay's ntor reply.
pub const NTOR_S_HANDSHAKE_LEN: usize = 64;

/// A type of circuit-extension handshake, as tagged in CREATE2 and
/// EXTEND2 cells.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct HandshakeType(u16);

impl HandshakeType {
    /// The legacy RSA/DH handshake.
    pub const TAP: HandshakeType = HandshakeType(0);
    /// The keyless CREATE_FAST handshake; first hop only.
    pub const FAST: HandshakeType = HandshakeType(1);
    /// The curve25519-based ntor handshake.
    pub const NTOR: HandshakeType = HandshakeType(2);
}
impl From<u16> for HandshakeType {
    fn from(v: u16) -> Self {
        HandshakeType(v)
    }
}
impl From<HandshakeType> for u16 {
    fn from(v: HandshakeType) -> u16 {
        v.0
    }
}
impl std::fmt::Display for HandshakeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            HandshakeType::TAP => write!(f, "TAP"),
            HandshakeType::FAST => write!(f, "FAST"),
            HandshakeType::NTOR => write!(f, "NTOR"),
            HandshakeType(x) => write!(f, "HandshakeType({})", x),
        }
    }
}

/// A relay message command, as found in a relay cell header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RelayCmd(u8);

impl RelayCmd {
    /// Start a new stream.
    pub const BEGIN: RelayCmd = RelayCmd(1);
    /// Data on a stream.
    pub const DATA: RelayCmd = RelayCmd(2);
    /// Close a stream.
    pub const END: RelayCmd = RelayCmd(3);
    /// Acknowledge a BEGIN; stream is open.
    pub const CONNECTED: RelayCmd = RelayCmd(4);
    /// Extend the circuit through the last hop (legacy).
    pub const EXTEND: RelayCmd = RelayCmd(6);
    /// Reply to a legacy EXTEND.
    pub const EXTENDED: RelayCmd = RelayCmd(7);
    /// Remove last hop (unused by this core).
    pub const TRUNCATE: RelayCmd = RelayCmd(8);
    /// The circuit has been truncated.
    pub const TRUNCATED: RelayCmd = RelayCmd(9);
    /// Extend the circuit through the last hop.
    pub const EXTEND2: RelayCmd = RelayCmd(14);
    /// Reply to an EXTEND2.
    pub const EXTENDED2: RelayCmd = RelayCmd(15);
}
impl From<u8> for RelayCmd {
    fn from(v: u8) -> Self {
        RelayCmd(v)
    }
}
impl From<RelayCmd> for u8 {
    fn from(v: RelayCmd) -> u8 {
        v.0
    }
}

/// Reason codes carried in a relay END message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct EndReason(u8);

impl EndReason {
    /// Catch-all.
    pub const MISC: EndReason = EndReason(1);
    /// The exit's policy rejected the target.
    pub const EXITPOLICY: EndReason = EndReason(4);
    /// The stream was destroyed with the circuit.
    pub const DESTROY: EndReason = EndReason(5);
}
impl From<u8> for EndReason {
    fn from(v: u8) -> Self {
        EndReason(v)
    }
}
impl From<EndReason> for u8 {
    fn from(v: EndReason) -> u8 {
        v.0
    }
}

/// An object that can be encoded onto (and decoded from) a message
/// body.
pub trait Body: Sized {
    /// Decode a message body from `r`.
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self>;
    /// Encode this message body onto `w`.
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()>;
}

/// Which cell command carries an outbound handshake.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum CreateVariant {
    /// A legacy CREATE cell (TAP payload).
    Create,
    /// A CREATE_FAST cell.
    CreateFast,
    /// A CREATE2 cell (tagged handshake).
    Create2,
}

/// The body of an outbound circuit-creation cell, in any of its
/// three variants.
#[derive(Clone, Debug)]
pub struct CreateCell {
    /// Which cell command to use on the wire.
    variant: CreateVariant,
    /// Which handshake the onionskin belongs to.
    handshake_type: HandshakeType,
    /// The client's onionskin.
    onionskin: Vec<u8>,
}

impl CreateCell {
    /// Construct a new create cell.
    pub fn new(variant: CreateVariant, handshake_type: HandshakeType, onionskin: Vec<u8>) -> Self {
        CreateCell {
            variant,
            handshake_type,
            onionskin,
        }
    }
    /// Return the wire variant of this cell.
    pub fn variant(&self) -> CreateVariant {
        self.variant
    }
    /// Return the handshake type of this cell.
    pub fn handshake_type(&self) -> HandshakeType {
        self.handshake_type
    }
    /// Return the onionskin carried in this cell.
    pub fn onionskin(&self) -> &[u8] {
        &self.onionskin
    }

    /// Encode the cell body (everything after the cell command).
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let mut w = Vec::new();
        match self.variant {
            CreateVariant::Create => {
                if self.onionskin.len() != TAP_C_HANDSHAKE_LEN {
                    return Err(BytesError::InvalidMessage("bad TAP onionskin length"));
                }
                w.write_all(&self.onionskin);
            }
            CreateVariant::CreateFast => {
                if self.onionskin.len() != FAST_C_HANDSHAKE_LEN {
                    return Err(BytesError::InvalidMessage("bad CREATE_FAST length"));
                }
                w.write_all(&self.onionskin);
            }
            CreateVariant::Create2 => {
                w.write_u16(self.handshake_type.into());
                let hlen: u16 = self
                    .onionskin
                    .len()
                    .try_into()
                    .map_err(|_| BytesError::BadLengthValue)?;
                w.write_u16(hlen);
                w.write_all(&self.onionskin);
            }
        }
        Ok(w)
    }

    /// Parse a cell body previously encoded with [`encode_body`](Self::encode_body).
    pub fn parse_body(variant: CreateVariant, body: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(body);
        let cell = match variant {
            CreateVariant::Create => CreateCell {
                variant,
                handshake_type: HandshakeType::TAP,
                onionskin: r.take(TAP_C_HANDSHAKE_LEN)?.into(),
            },
            CreateVariant::CreateFast => CreateCell {
                variant,
                handshake_type: HandshakeType::FAST,
                onionskin: r.take(FAST_C_HANDSHAKE_LEN)?.into(),
            },
            CreateVariant::Create2 => {
                let handshake_type = HandshakeType::from(r.take_u16()?);
                let hlen = r.take_u16()?;
                CreateCell {
                    variant,
                    handshake_type,
                    onionskin: r.take(hlen as usize)?.into(),
                }
            }
        };
        Ok(cell)
    }
}

/// Which cell command carries an inbound handshake reply.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum CreatedVariant {
    /// A legacy CREATED cell.
    Created,
    /// A CREATED_FAST cell.
    CreatedFast,
    /// A CREATED2 cell.
    Created2,
}

/// The body of an inbound circuit-creation reply, in any of its
/// three variants.
#[derive(Clone, Debug)]
pub struct CreatedCell {
    /// Which cell command arrived on the wire.
    variant: CreatedVariant,
    /// The relay's handshake reply.
    reply: Vec<u8>,
}

impl CreatedCell {
    /// Construct a new created cell.
    pub fn new(variant: CreatedVariant, reply: Vec<u8>) -> Self {
        CreatedCell { variant, reply }
    }
    /// Return the wire variant of this cell.
    pub fn variant(&self) -> CreatedVariant {
        self.variant
    }
    /// Return the handshake reply in this cell.
    pub fn reply(&self) -> &[u8] {
        &self.reply
    }

    /// Encode the cell body.
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let mut w = Vec::new();
        match self.variant {
            CreatedVariant::Created => {
                if self.reply.len() != TAP_S_HANDSHAKE_LEN {
                    return Err(BytesError::InvalidMessage("bad CREATED length"));
                }
                w.write_all(&self.reply);
            }
            CreatedVariant::CreatedFast => {
                if self.reply.len() != FAST_S_HANDSHAKE_LEN {
                    return Err(BytesError::InvalidMessage("bad CREATED_FAST length"));
                }
                w.write_all(&self.reply);
            }
            CreatedVariant::Created2 => {
                let hlen: u16 = self
                    .reply
                    .len()
                    .try_into()
                    .map_err(|_| BytesError::BadLengthValue)?;
                w.write_u16(hlen);
                w.write_all(&self.reply);
            }
        }
        Ok(w)
    }

    /// Parse a cell body.
    pub fn parse_body(variant: CreatedVariant, body: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(body);
        let reply = match variant {
            CreatedVariant::Created => r.take(TAP_S_HANDSHAKE_LEN)?.into(),
            CreatedVariant::CreatedFast => r.take(FAST_S_HANDSHAKE_LEN)?.into(),
            CreatedVariant::Created2 => {
                let hlen = r.take_u16()?;
                r.take(hlen as usize)?.into()
            }
        };
        Ok(CreatedCell { variant, reply })
    }
}

/// A single "link specifier", describing one way to address the
/// target of an EXTEND2 cell.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum LinkSpec {
    /// An IPv4 address and OR port.
    OrPort4(Ipv4Addr, u16),
    /// An IPv6 address and OR port.
    OrPort6(Ipv6Addr, u16),
    /// A legacy RSA identity digest.
    RsaId(IdDigest),
    /// An ed25519 identity.
    Ed25519([u8; 32]),
    /// A link specifier we don't recognize.
    Unrecognized(u8, Vec<u8>),
}

/// Link specifier type code for an IPv4 OR port.
const LSTYPE_ORPORT_V4: u8 = 0;
/// Link specifier type code for an IPv6 OR port.
const LSTYPE_ORPORT_V6: u8 = 1;
/// Link specifier type code for a legacy identity.
const LSTYPE_RSAID: u8 = 2;
/// Link specifier type code for an ed25519 identity.
const LSTYPE_ED25519: u8 = 3;

impl Readable for LinkSpec {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let lstype = r.take_u8()?;
        let lslen = r.take_u8()? as usize;
        let body = r.take(lslen)?;
        let mut br = Reader::from_slice(body);
        Ok(match lstype {
            LSTYPE_ORPORT_V4 => {
                let addr = br.extract::<Ipv4Addr>()?;
                let port = br.take_u16()?;
                br.should_be_exhausted()?;
                LinkSpec::OrPort4(addr, port)
            }
            LSTYPE_ORPORT_V6 => {
                let addr = br.extract::<Ipv6Addr>()?;
                let port = br.take_u16()?;
                br.should_be_exhausted()?;
                LinkSpec::OrPort6(addr, port)
            }
            LSTYPE_RSAID => {
                let id = br.extract::<IdDigest>()?;
                br.should_be_exhausted()?;
                LinkSpec::RsaId(id)
            }
            LSTYPE_ED25519 => {
                let id = br.take_array::<32>()?;
                br.should_be_exhausted()?;
                LinkSpec::Ed25519(id)
            }
            other => LinkSpec::Unrecognized(other, body.into()),
        })
    }
}
impl Writeable for LinkSpec {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
        let mut body: Vec<u8> = Vec::new();
        let lstype = match self {
            LinkSpec::OrPort4(addr, port) => {
                body.write(addr)?;
                body.write_u16(*port);
                LSTYPE_ORPORT_V4
            }
            LinkSpec::OrPort6(addr, port) => {
                body.write(addr)?;
                body.write_u16(*port);
                LSTYPE_ORPORT_V6
            }
            LinkSpec::RsaId(id) => {
                body.write(id)?;
                LSTYPE_RSAID
            }
            LinkSpec::Ed25519(id) => {
                body.write_all(&id[..]);
                LSTYPE_ED25519
            }
            LinkSpec::Unrecognized(t, b) => {
                body.write_all(b);
                *t
            }
        };
        w.write_u8(lstype);
        let lslen: u8 = body.len().try_into().map_err(|_| BytesError::BadLengthValue)?;
        w.write_u8(lslen);
        w.write_all(&body);
        Ok(())
    }
}

/// An extend request, in either of its wire encodings.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ExtendMsg {
    /// A legacy EXTEND message: IPv4 target, TAP onionskin, RSA id.
    Extend {
        /// Target relay IPv4 address.
        addr: Ipv4Addr,
        /// Target relay OR port.
        port: u16,
        /// The TAP onionskin to forward.
        onionskin: Vec<u8>,
        /// Identity of the target relay.
        rsaid: IdDigest,
    },
    /// An EXTEND2 message, carrying link specifiers and a tagged
    /// handshake.
    Extend2 {
        /// How to reach and identify the target relay.
        linkspec: Vec<LinkSpec>,
        /// Which handshake the onionskin belongs to.
        handshake_type: HandshakeType,
        /// The onionskin to forward.
        onionskin: Vec<u8>,
    },
}

impl ExtendMsg {
    /// Return the relay command that carries this message.
    pub fn cmd(&self) -> RelayCmd {
        match self {
            ExtendMsg::Extend { .. } => RelayCmd::EXTEND,
            ExtendMsg::Extend2 { .. } => RelayCmd::EXTEND2,
        }
    }

    /// Decode an extend message body for the given relay command.
    pub fn decode(cmd: RelayCmd, body: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(body);
        let msg = match cmd {
            RelayCmd::EXTEND => {
                let addr = r.extract::<Ipv4Addr>()?;
                let port = r.take_u16()?;
                let onionskin = r.take(TAP_C_HANDSHAKE_LEN)?.into();
                let rsaid = r.extract::<IdDigest>()?;
                ExtendMsg::Extend {
                    addr,
                    port,
                    onionskin,
                    rsaid,
                }
            }
            RelayCmd::EXTEND2 => {
                let n = r.take_u8()?;
                let linkspec = r.extract_n::<LinkSpec>(n as usize)?;
                let handshake_type = HandshakeType::from(r.take_u16()?);
                let hlen = r.take_u16()?;
                let onionskin = r.take(hlen as usize)?.into();
                ExtendMsg::Extend2 {
                    linkspec,
                    handshake_type,
                    onionskin,
                }
            }
            _ => return Err(BytesError::InvalidMessage("not an extend command")),
        };
        Ok(msg)
    }
}

impl Body for ExtendMsg {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        // Callers normally go through ExtendMsg::decode, which knows
        // the relay command; here we assume EXTEND2.
        let body = r.take_rest();
        ExtendMsg::decode(RelayCmd::EXTEND2, body)
    }
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
        match self {
            ExtendMsg::Extend {
                addr,
                port,
                onionskin,
                rsaid,
            } => {
                if onionskin.len() != TAP_C_HANDSHAKE_LEN {
                    return Err(BytesError::InvalidMessage("bad TAP onionskin length"));
                }
                w.write(addr)?;
                w.write_u16(*port);
                w.write_all(onionskin);
                w.write(rsaid)?;
            }
            ExtendMsg::Extend2 {
                linkspec,
                handshake_type,
                onionskin,
            } => {
                let n: u8 = linkspec
                    .len()
                    .try_into()
                    .map_err(|_| BytesError::BadLengthValue)?;
                w.write_u8(n);
                for ls in linkspec {
                    w.write(ls)?;
                }
                w.write_u16((*handshake_type).into());
                let hlen: u16 = onionskin
                    .len()
                    .try_into()
                    .map_err(|_| BytesError::BadLengthValue)?;
                w.write_u16(hlen);
                w.write_all(onionskin);
            }
        }
        Ok(())
    }
}

/// An extend reply, in either of its wire encodings.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ExtendedMsg {
    /// Reply to a legacy EXTEND.
    Extended(Vec<u8>),
    /// Reply to an EXTEND2.
    Extended2(Vec<u8>),
}

impl ExtendedMsg {
    /// Return the relay command that carries this message.
    pub fn cmd(&self) -> RelayCmd {
        match self {
            ExtendedMsg::Extended(_) => RelayCmd::EXTENDED,
            ExtendedMsg::Extended2(_) => RelayCmd::EXTENDED2,
        }
    }
    /// Decode an extended message body for the given relay command.
    pub fn decode(cmd: RelayCmd, body: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(body);
        match cmd {
            RelayCmd::EXTENDED => Ok(ExtendedMsg::Extended(r.take(TAP_S_HANDSHAKE_LEN)?.into())),
            RelayCmd::EXTENDED2 => {
                let hlen = r.take_u16()?;
                Ok(ExtendedMsg::Extended2(r.take(hlen as usize)?.into()))
            }
            _ => Err(BytesError::InvalidMessage("not an extended command")),
        }
    }
    /// Convert this reply into a [`CreatedCell`] for handshake
    /// processing.
    pub fn into_created_cell(self) -> CreatedCell {
        match self {
            ExtendedMsg::Extended(reply) => CreatedCell::new(CreatedVariant::Created, reply),
            ExtendedMsg::Extended2(reply) => CreatedCell::new(CreatedVariant::Created2, reply),
        }
    }
}

impl Body for ExtendedMsg {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let body = r.take_rest();
        ExtendedMsg::decode(RelayCmd::EXTENDED2, body)
    }
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
        match self {
            ExtendedMsg::Extended(reply) => {
                if reply.len() != TAP_S_HANDSHAKE_LEN {
                    return Err(BytesError::InvalidMessage("bad EXTENDED length"));
                }
                w.write_all(reply);
            }
            ExtendedMsg::Extended2(reply) => {
                let hlen: u16 = reply
                    .len()
                    .try_into()
                    .map_err(|_| BytesError::BadLengthValue)?;
                w.write_u16(hlen);
                w.write_all(reply);
            }
        }
        Ok(())
    }
}

/// The header of a relay cell, as it appears after decryption.
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct RelayHeader {
    /// The relay command.
    pub cmd: RelayCmd,
    /// The "recognized" field; zero on cells addressed to us.
    pub recognized: u16,
    /// The stream this cell belongs to (zero for circuit-level
    /// messages).
    pub stream_id: StreamId,
    /// Running-digest check bytes.
    pub digest: [u8; 4],
    /// Number of meaningful payload bytes.
    pub length: u16,
}

impl RelayHeader {
    /// Decode a relay header from the front of a relay cell body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(body);
        let cmd = RelayCmd::from(r.take_u8()?);
        let recognized = r.take_u16()?;
        let stream_id = StreamId(r.take_u16()?);
        let digest = r.take_array::<4>()?;
        let length = r.take_u16()?;
        if length as usize > RELAY_PAYLOAD_SIZE {
            return Err(BytesError::InvalidMessage("relay length too large"));
        }
        Ok(RelayHeader {
            cmd,
            recognized,
            stream_id,
            digest,
            length,
        })
    }
    /// Encode this header onto the front of `body`.
    pub fn encode_into(&self, body: &mut [u8]) {
        body[0] = self.cmd.into();
        body[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        body[3..5].copy_from_slice(&self.stream_id.0.to_be_bytes());
        body[5..9].copy_from_slice(&self.digest);
        body[9..11].copy_from_slice(&self.length.to_be_bytes());
    }
}

/// A BEGIN message, as sent by the end-of-life probe.
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct BeginMsg {
    /// The "address:port" string to connect to.
    pub addr_port: String,
    /// Flags appended after the NUL, if any.
    pub flags: u32,
}

impl Body for BeginMsg {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let rest = r.take_rest();
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(BytesError::InvalidMessage("unterminated begin target"))?;
        let addr_port = std::str::from_utf8(&rest[..nul])
            .map_err(|_| BytesError::InvalidMessage("begin target not ascii"))?
            .to_owned();
        let flags = if rest.len() >= nul + 5 {
            u32::from_be_bytes(
                rest[nul + 1..nul + 5]
                    .try_into()
                    .expect("slice length mismatch"),
            )
        } else {
            0
        };
        Ok(BeginMsg { addr_port, flags })
    }
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_all(self.addr_port.as_bytes());
        w.write_u8(0);
        if self.flags != 0 {
            w.write_u32(self.flags);
        }
        Ok(())
    }
}

/// An END message, as produced by an exit closing a stream.
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct EndMsg {
    /// Why the stream ended.
    pub reason: EndReason,
    /// For EXITPOLICY: the address the exit refused to connect to.
    pub addr: Option<Ipv4Addr>,
    /// For EXITPOLICY: advisory TTL for the refusal.
    pub ttl: Option<u32>,
}

impl EndMsg {
    /// Construct an EXITPOLICY END message echoing `addr`.
    pub fn exit_policy(addr: Ipv4Addr, ttl: u32) -> Self {
        EndMsg {
            reason: EndReason::EXITPOLICY,
            addr: Some(addr),
            ttl: Some(ttl),
        }
    }
}

impl Body for EndMsg {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        if r.remaining() == 0 {
            return Ok(EndMsg {
                reason: EndReason::MISC,
                addr: None,
                ttl: None,
            });
        }
        let reason = EndReason::from(r.take_u8()?);
        let (addr, ttl) = if reason == EndReason::EXITPOLICY && r.remaining() >= 8 {
            (Some(r.extract::<Ipv4Addr>()?), Some(r.take_u32()?))
        } else {
            (None, None)
        };
        Ok(EndMsg { reason, addr, ttl })
    }
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u8(self.reason.into());
        if let (Some(addr), Some(ttl)) = (self.addr, self.ttl) {
            w.write(&addr)?;
            w.write_u32(ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn extend2_msg() -> ExtendMsg {
        ExtendMsg::Extend2 {
            linkspec: vec![
                LinkSpec::OrPort4("192.0.2.10".parse().unwrap(), 9001),
                LinkSpec::RsaId(IdDigest::new([0x42; 20])),
            ],
            handshake_type: HandshakeType::NTOR,
            onionskin: vec![0x5a; NTOR_C_HANDSHAKE_LEN],
        }
    }

    #[test]
    fn extend2_roundtrip() {
        let msg = extend2_msg();
        let mut w: Vec<u8> = Vec::new();
        msg.encode_onto(&mut w).unwrap();
        let parsed = ExtendMsg::decode(RelayCmd::EXTEND2, &w).unwrap();
        let mut w2: Vec<u8> = Vec::new();
        parsed.encode_onto(&mut w2).unwrap();
        assert_eq!(w, w2);
        match parsed {
            ExtendMsg::Extend2 {
                linkspec,
                handshake_type,
                onionskin,
            } => {
                assert_eq!(linkspec.len(), 2);
                assert_eq!(handshake_type, HandshakeType::NTOR);
                assert_eq!(onionskin.len(), NTOR_C_HANDSHAKE_LEN);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn extend_legacy_roundtrip() {
        let msg = ExtendMsg::Extend {
            addr: "192.0.2.99".parse().unwrap(),
            port: 443,
            onionskin: vec![0x77; TAP_C_HANDSHAKE_LEN],
            rsaid: IdDigest::new([0x24; 20]),
        };
        let mut w: Vec<u8> = Vec::new();
        msg.encode_onto(&mut w).unwrap();
        assert_eq!(w.len(), 4 + 2 + TAP_C_HANDSHAKE_LEN + 20);
        let parsed = ExtendMsg::decode(RelayCmd::EXTEND, &w).unwrap();
        let mut w2: Vec<u8> = Vec::new();
        parsed.encode_onto(&mut w2).unwrap();
        assert_eq!(w, w2);
    }

    #[test]
    fn extended_roundtrip() {
        for msg in [
            ExtendedMsg::Extended(vec![1; TAP_S_HANDSHAKE_LEN]),
            ExtendedMsg::Extended2(vec![2; NTOR_S_HANDSHAKE_LEN]),
        ] {
            let mut w: Vec<u8> = Vec::new();
            msg.encode_onto(&mut w).unwrap();
            let parsed = ExtendedMsg::decode(msg.cmd(), &w).unwrap();
            let mut w2: Vec<u8> = Vec::new();
            parsed.encode_onto(&mut w2).unwrap();
            assert_eq!(w, w2);
        }
    }

    #[test]
    fn create_cell_roundtrips() {
        let cases = [
            (
                CreateVariant::Create,
                HandshakeType::TAP,
                TAP_C_HANDSHAKE_LEN,
            ),
            (
                CreateVariant::CreateFast,
                HandshakeType::FAST,
                FAST_C_HANDSHAKE_LEN,
            ),
            (
                CreateVariant::Create2,
                HandshakeType::NTOR,
                NTOR_C_HANDSHAKE_LEN,
            ),
        ];
        for (variant, ht, len) in cases {
            let cell = CreateCell::new(variant, ht, vec![0x61; len]);
            let body = cell.encode_body().unwrap();
            let parsed = CreateCell::parse_body(variant, &body).unwrap();
            assert_eq!(parsed.handshake_type(), ht);
            assert_eq!(parsed.onionskin(), cell.onionskin());
            assert_eq!(parsed.encode_body().unwrap(), body);
        }
    }

    #[test]
    fn create_cell_length_mismatch() {
        let cell = CreateCell::new(CreateVariant::Create, HandshakeType::TAP, vec![1; 10]);
        assert!(cell.encode_body().is_err());
    }

    #[test]
    fn relay_header_roundtrip() {
        let hdr = RelayHeader {
            cmd: RelayCmd::BEGIN,
            recognized: 0,
            stream_id: StreamId(17),
            digest: [9, 8, 7, 6],
            length: 12,
        };
        let mut body = [0_u8; CELL_PAYLOAD_SIZE];
        hdr.encode_into(&mut body);
        assert_eq!(RelayHeader::decode(&body).unwrap(), hdr);
    }

    #[test]
    fn begin_msg() {
        let msg = BeginMsg {
            addr_port: "0.12.34.56:25".into(),
            flags: 0,
        };
        let mut w: Vec<u8> = Vec::new();
        msg.encode_onto(&mut w).unwrap();
        assert_eq!(&w[..], b"0.12.34.56:25\0");
        let mut r = Reader::from_slice(&w);
        assert_eq!(BeginMsg::decode_from_reader(&mut r).unwrap(), msg);
    }

    #[test]
    fn end_msg_exit_policy() {
        let msg = EndMsg::exit_policy("0.1.2.3".parse().unwrap(), 60);
        let mut w: Vec<u8> = Vec::new();
        msg.encode_onto(&mut w).unwrap();
        // reason + ipv4 + ttl
        assert_eq!(w.len(), 9);
        let mut r = Reader::from_slice(&w);
        let parsed = EndMsg::decode_from_reader(&mut r).unwrap();
        assert_eq!(parsed, msg);
    }
}
