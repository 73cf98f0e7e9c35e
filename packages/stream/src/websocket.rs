//! RFC 6455 WebSocket over an upgraded request transport.

use base64::Engine;
use capbridge_core::{Deadline, Error, Result};

use crate::io::{read_full, write_all_within, RequestIo};

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest message accepted from a peer.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = sha1_smol::Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.digest().bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl MessageKind {
    fn opcode(self) -> u8 {
        match self {
            MessageKind::Text => 0x1,
            MessageKind::Binary => 0x2,
            MessageKind::Close => 0x8,
            MessageKind::Ping => 0x9,
            MessageKind::Pong => 0xA,
        }
    }

    fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x1 => Some(MessageKind::Text),
            0x2 => Some(MessageKind::Binary),
            0x8 => Some(MessageKind::Close),
            0x9 => Some(MessageKind::Ping),
            0xA => Some(MessageKind::Pong),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, MessageKind::Close | MessageKind::Ping | MessageKind::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

impl Message {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            data: data.into().into_bytes(),
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Binary,
            data: data.into(),
        }
    }
}

struct Frame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Encode one frame. `mask` is only set by clients.
pub fn encode_frame(kind: MessageKind, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | kind.opcode());
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        len if len < 126 => out.push(mask_bit | len as u8),
        len if len <= u16::MAX as usize => {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Server side of an upgraded connection.
pub struct WebSocket {
    io: Box<dyn RequestIo>,
    write_deadline: Deadline,
    close_sent: bool,
    close_received: bool,
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("close_sent", &self.close_sent)
            .field("close_received", &self.close_received)
            .finish_non_exhaustive()
    }
}

impl WebSocket {
    pub(crate) fn new(io: Box<dyn RequestIo>, write_deadline: Deadline) -> Self {
        Self {
            io,
            write_deadline,
            close_sent: false,
            close_received: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_sent || self.close_received
    }

    fn read_frame(&mut self, deadline: &Deadline) -> Result<Frame> {
        let mut header = [0u8; 2];
        read_full(&mut self.io, &mut header, deadline, "websocket read")?;
        let fin = header[0] & 0x80 != 0;
        let opcode = header[0] & 0x0F;
        let masked = header[1] & 0x80 != 0;

        let len = match header[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                read_full(&mut self.io, &mut ext, deadline, "websocket read")?;
                u64::from(u16::from_be_bytes(ext))
            }
            127 => {
                let mut ext = [0u8; 8];
                read_full(&mut self.io, &mut ext, deadline, "websocket read")?;
                u64::from_be_bytes(ext)
            }
            small => u64::from(small),
        };
        if len > MAX_MESSAGE_BYTES as u64 {
            return Err(Error::exhausted(format!("websocket frame of {} bytes", len)));
        }

        let mut key = [0u8; 4];
        if masked {
            read_full(&mut self.io, &mut key, deadline, "websocket read")?;
        }
        let mut payload = vec![0u8; len as usize];
        read_full(&mut self.io, &mut payload, deadline, "websocket read")?;
        if masked {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        Ok(Frame {
            fin,
            opcode,
            payload,
        })
    }

    /// Block until the next message, bounded by `deadline`.
    ///
    /// Fragmented messages are reassembled. Pings are answered with a pong
    /// before being returned. A close frame is echoed once and returned;
    /// reading after that is `IllegalState`.
    pub fn read(&mut self, deadline: &Deadline) -> Result<Message> {
        if self.close_received {
            return Err(Error::illegal_state("websocket is closed"));
        }

        let mut partial: Option<(MessageKind, Vec<u8>)> = None;
        loop {
            let frame = self.read_frame(deadline)?;
            if frame.opcode == 0 {
                let (kind, mut data) = partial
                    .take()
                    .ok_or_else(|| Error::illegal_state("continuation frame without a message"))?;
                data.extend_from_slice(&frame.payload);
                if data.len() > MAX_MESSAGE_BYTES {
                    return Err(Error::exhausted("websocket message too large"));
                }
                if frame.fin {
                    return Ok(Message { kind, data });
                }
                partial = Some((kind, data));
                continue;
            }

            let kind = MessageKind::from_opcode(frame.opcode).ok_or_else(|| {
                Error::illegal_state(format!("unknown websocket opcode {:#x}", frame.opcode))
            })?;

            if kind.is_control() {
                match kind {
                    MessageKind::Ping => self.write_frame(MessageKind::Pong, &frame.payload)?,
                    MessageKind::Close => {
                        self.close_received = true;
                        if !self.close_sent {
                            self.close_sent = true;
                            self.write_frame(MessageKind::Close, &frame.payload)?;
                        }
                    }
                    _ => {}
                }
                return Ok(Message {
                    kind,
                    data: frame.payload,
                });
            }

            if frame.fin {
                return Ok(Message {
                    kind,
                    data: frame.payload,
                });
            }
            partial = Some((kind, frame.payload));
        }
    }

    /// Bound every frame written from now on, including pong and close
    /// replies sent while reading. Starts as the request deadline.
    pub fn set_write_deadline(&mut self, deadline: Deadline) {
        self.write_deadline = deadline;
    }

    fn write_frame(&mut self, kind: MessageKind, payload: &[u8]) -> Result<()> {
        write_all_within(
            &mut self.io,
            &encode_frame(kind, payload, None),
            &self.write_deadline,
            "write websocket frame",
        )
    }

    /// Send one unfragmented message.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        if self.close_sent {
            return Err(Error::illegal_state("websocket is closed"));
        }
        self.write_frame(message.kind, &message.data)
    }

    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(&Message::text(text))
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send(&Message::binary(data))
    }

    /// Send a close frame. Only the first call writes anything.
    pub fn close(&mut self) -> Result<()> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        self.write_frame(MessageKind::Close, &1000u16.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::duplex;
    use std::io::{Read, Write};

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn frame_lengths() {
        assert_eq!(encode_frame(MessageKind::Text, b"hi", None), vec![0x81, 2, b'h', b'i']);
        let medium = encode_frame(MessageKind::Binary, &[0u8; 300], None);
        assert_eq!(&medium[..4], &[0x82, 126, 0x01, 0x2C]);
        let large = encode_frame(MessageKind::Binary, &vec![0u8; 70_000], None);
        assert_eq!(large[1], 127);
        assert_eq!(large.len(), 70_000 + 10);
    }

    #[test]
    fn reads_masked_text_and_answers_ping() {
        let (server_io, mut client) = duplex();
        let mut ws = WebSocket::new(Box::new(server_io), Deadline::never());
        let key = [1, 2, 3, 4];
        client
            .write_all(&encode_frame(MessageKind::Ping, b"p", Some(key)))
            .unwrap();
        client
            .write_all(&encode_frame(MessageKind::Text, b"hello", Some(key)))
            .unwrap();

        let deadline = Deadline::from_timeout_ms(5_000);
        let ping = ws.read(&deadline).unwrap();
        assert_eq!(ping.kind, MessageKind::Ping);
        let text = ws.read(&deadline).unwrap();
        assert_eq!(text, Message::text("hello"));

        let mut pong = [0u8; 3];
        client.read_exact(&mut pong).unwrap();
        assert_eq!(pong, [0x8A, 1, b'p']);
    }

    #[test]
    fn reassembles_fragments() {
        let (server_io, mut client) = duplex();
        let mut ws = WebSocket::new(Box::new(server_io), Deadline::never());
        // "hel" (text, not final) + "lo" (continuation, final)
        client.write_all(&[0x01, 3, b'h', b'e', b'l']).unwrap();
        client.write_all(&[0x80, 2, b'l', b'o']).unwrap();
        let msg = ws.read(&Deadline::from_timeout_ms(5_000)).unwrap();
        assert_eq!(msg, Message::text("hello"));
    }

    #[test]
    fn close_is_idempotent_and_blocks_send() {
        let (server_io, mut client) = duplex();
        let mut ws = WebSocket::new(Box::new(server_io), Deadline::never());
        ws.close().unwrap();
        ws.close().unwrap();
        assert!(ws.send_text("late").is_err());
        drop(ws);
        assert_eq!(client.read_to_close(), vec![0x88, 2, 0x03, 0xE8]);
    }

    #[test]
    fn peer_close_is_echoed_once() {
        let (server_io, mut client) = duplex();
        let mut ws = WebSocket::new(Box::new(server_io), Deadline::never());
        client
            .write_all(&encode_frame(MessageKind::Close, &[0x03, 0xE8], Some([9, 9, 9, 9])))
            .unwrap();
        let msg = ws.read(&Deadline::from_timeout_ms(5_000)).unwrap();
        assert_eq!(msg.kind, MessageKind::Close);
        assert!(ws.is_closed());
        assert!(ws.read(&Deadline::immediate()).is_err());
        ws.close().unwrap();
        drop(ws);
        assert_eq!(client.read_to_close(), vec![0x88, 2, 0x03, 0xE8]);
    }

    #[test]
    fn read_times_out() {
        let (server_io, _client) = duplex();
        let mut ws = WebSocket::new(Box::new(server_io), Deadline::never());
        assert!(ws.read(&Deadline::from_timeout_ms(30)).unwrap_err().is_timeout());
    }

    #[test]
    fn sends_fail_once_write_deadline_passes() {
        let (_client, server_io) = duplex();
        let mut ws = WebSocket::new(Box::new(server_io), Deadline::immediate());
        assert!(ws.send_text("late").unwrap_err().is_timeout());

        ws.set_write_deadline(Deadline::from_timeout_ms(1_000));
        ws.send_text("on time").unwrap();
    }
}
