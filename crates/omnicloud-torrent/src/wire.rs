//! BitTorrent v1 peer wire protocol: handshake and message codecs.

use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol identifier exchanged in the handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Transfer block size; requests larger than this are protocol violations.
pub(crate) const BLOCK_SIZE: u32 = 16 * 1024;

/// Handshake message exchanged once at connection start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub(crate) prot: [u8; 19],
    pub(crate) reserved: [u8; 8],
    pub(crate) info_hash: [u8; 20],
    pub(crate) peer_id: [u8; 20],
}

impl Handshake {
    pub(crate) fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Codec for the handshake.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> io::Result<()> {
        buf.put_u8(handshake.prot.len() as u8);
        buf.extend_from_slice(&handshake.prot);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash);
        buf.extend_from_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut tmp = Cursor::new(&buf[..]);
        let prot_len = tmp.get_u8() as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected protocol string length",
            ));
        }

        let needed = 1 + prot_len + 8 + 20 + 20;
        if buf.len() < needed {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// Read one handshake (exactly 68 bytes) from a raw stream. Used by the
/// engine's accept loop to route inbound peers by info-hash before handing
/// the socket to a torrent task.
pub(crate) async fn read_handshake(
    stream: &mut tokio::net::TcpStream,
) -> io::Result<Handshake> {
    use tokio::io::AsyncReadExt;

    let mut raw = [0u8; 68];
    stream.read_exact(&mut raw).await?;
    let mut buf = BytesMut::from(&raw[..]);
    HandshakeCodec
        .decode(&mut buf)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short handshake"))
}

/// Identifies one block within a piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockInfo {
    pub(crate) piece_index: u32,
    pub(crate) offset: u32,
    pub(crate) len: u32,
}

/// A peer's piece availability, bit 7 of byte 0 being piece 0.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Bitfield {
    bytes: Vec<u8>,
}

impl Bitfield {
    pub(crate) fn with_piece_count(pieces: u32) -> Self {
        Self {
            bytes: vec![0u8; (pieces as usize).div_ceil(8)],
        }
    }

    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn has(&self, index: u32) -> bool {
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8);
        self.bytes
            .get(byte)
            .is_some_and(|value| value & (1 << bit) != 0)
    }

    pub(crate) fn set(&mut self, index: u32) {
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8);
        if byte >= self.bytes.len() {
            self.bytes.resize(byte + 1, 0);
        }
        self.bytes[byte] |= 1 << bit;
    }

    #[allow(dead_code)]
    pub(crate) fn count_set(&self, pieces: u32) -> u32 {
        (0..pieces).filter(|index| self.has(*index)).count() as u32
    }
}

/// IDs for peer wire messages (all but keep-alive).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown message id",
            )),
        }
    }
}

/// All peer wire messages exchanged after the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

/// Codec for post-handshake messages.
#[derive(Default)]
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        match msg {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_bytes();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bytes);
            }
            Message::Request(info) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(info.piece_index);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 2 * 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Cancel(info) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(info.piece_index);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut tmp = Cursor::new(&buf[..]);
        let msg_len = tmp.get_u32() as usize;
        if buf.len() < 4 + msg_len {
            return Ok(None);
        }
        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if msg_len != 5 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "bad have length",
                    ));
                }
                Message::Have {
                    piece_index: buf.get_u32(),
                }
            }
            MessageId::Bitfield => {
                let mut bytes = vec![0u8; msg_len - 1];
                buf.copy_to_slice(&mut bytes);
                Message::Bitfield(Bitfield::from_bytes(bytes))
            }
            MessageId::Request => {
                if msg_len != 13 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "bad request length",
                    ));
                }
                Message::Request(BlockInfo {
                    piece_index: buf.get_u32(),
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                })
            }
            MessageId::Block => {
                if msg_len < 9 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "bad block length",
                    ));
                }
                let piece_index = buf.get_u32();
                let offset = buf.get_u32();
                let mut data = vec![0u8; msg_len - 9];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => {
                if msg_len != 13 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "bad cancel length",
                    ));
                }
                Message::Cancel(BlockInfo {
                    piece_index: buf.get_u32(),
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                })
            }
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Message {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).expect("encode");
        codec
            .decode(&mut buf)
            .expect("decode")
            .expect("complete message")
    }

    #[test]
    fn handshake_round_trip() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        let handshake = Handshake::new([0xab; 20], [0xcd; 20]);
        codec.encode(handshake, &mut buf).expect("encode");
        let decoded = codec
            .decode(&mut buf)
            .expect("decode")
            .expect("complete handshake");
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_handshake_waits_for_more_bytes() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Handshake::new([1; 20], [2; 20]), &mut buf)
            .expect("encode");
        let mut partial = buf.split_to(20);
        assert!(codec.decode(&mut partial).expect("decode").is_none());
    }

    #[test]
    fn message_round_trips() {
        assert_eq!(round_trip(Message::KeepAlive), Message::KeepAlive);
        assert_eq!(round_trip(Message::Choke), Message::Choke);
        assert_eq!(round_trip(Message::Unchoke), Message::Unchoke);
        assert_eq!(round_trip(Message::Interested), Message::Interested);
        assert_eq!(
            round_trip(Message::Have { piece_index: 7 }),
            Message::Have { piece_index: 7 }
        );
        let request = Message::Request(BlockInfo {
            piece_index: 3,
            offset: 16_384,
            len: BLOCK_SIZE,
        });
        assert_eq!(round_trip(request.clone()), request);
        let block = Message::Block {
            piece_index: 3,
            offset: 16_384,
            data: vec![9u8; 64],
        };
        assert_eq!(round_trip(block.clone()), block);
    }

    #[test]
    fn bitfield_bit_order_is_msb_first() {
        let mut bitfield = Bitfield::with_piece_count(9);
        bitfield.set(0);
        bitfield.set(8);
        assert_eq!(bitfield.as_bytes(), &[0b1000_0000, 0b1000_0000]);
        assert!(bitfield.has(0));
        assert!(!bitfield.has(1));
        assert!(bitfield.has(8));
        assert_eq!(bitfield.count_set(9), 2);
    }

    #[test]
    fn unknown_message_id_is_an_error() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(42);
        assert!(codec.decode(&mut buf).is_err());
    }
}
