//! The length-delimited packet frame shared by all tiers.
//!
//! Layout (big-endian): magic, store mode, opcode, result code, remaining
//! follower count, body CRC, body length, arg length, partition id,
//! extent (file) id, offset, request id, then the arg blob (UTF-8 CSV of
//! downstream replica addresses) and the body.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{ProtoError, ProtoResult};
use crate::opcode::{Opcode, ResultCode, StoreMode};

/// Sentinel first byte of every frame.
pub const PACKET_MAGIC: u8 = 0xFB;

/// Fixed header width in bytes.
pub const PACKET_HEADER_SIZE: usize = 49;

/// Upper bound on a packet body; covers the largest watermark and repair
/// task lists with room to spare.
pub const MAX_PACKET_BODY: u32 = 10 * 1024 * 1024;

/// Upper bound on the downstream-address blob.
pub const MAX_PACKET_ARG: u32 = 64 * 1024;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a process-wide monotonic request id.
pub fn next_request_id() -> u64 {
    NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed)
}

/// One wire packet: request or reply.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Extent flavor the packet addresses.
    pub store_mode: StoreMode,
    /// Operation.
    pub opcode: Opcode,
    /// Reply status; `Ok` on requests.
    pub result_code: ResultCode,
    /// How many downstream replicas remain to traverse.
    pub remaining_followers: u8,
    /// CRC32 of the body.
    pub crc: u32,
    /// Owning data or meta partition.
    pub partition_id: u64,
    /// Extent (file) id; zero for metadata operations.
    pub extent_id: u64,
    /// Byte offset within the extent.
    pub offset: u64,
    /// Monotonic request id; replies echo it.
    pub req_id: u64,
    /// Downstream replica addresses still to traverse, leader first.
    pub next_addrs: Vec<String>,
    /// Opaque body.
    pub data: Vec<u8>,
}

impl Packet {
    /// Creates a request packet with a fresh request id and empty body.
    pub fn new_request(
        opcode: Opcode,
        store_mode: StoreMode,
        partition_id: u64,
        extent_id: u64,
        offset: u64,
    ) -> Self {
        Self {
            store_mode,
            opcode,
            result_code: ResultCode::Ok,
            remaining_followers: 0,
            crc: 0,
            partition_id,
            extent_id,
            offset,
            req_id: next_request_id(),
            next_addrs: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Creates a reply skeleton echoing the request's identity, the body
    /// CRC included so the sender can match the ack against its packet.
    pub fn new_reply(req: &Packet) -> Self {
        Self {
            store_mode: req.store_mode,
            opcode: req.opcode,
            result_code: ResultCode::Ok,
            remaining_followers: 0,
            crc: req.crc,
            partition_id: req.partition_id,
            extent_id: req.extent_id,
            offset: req.offset,
            req_id: req.req_id,
            next_addrs: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Attaches a body and stamps its length-independent CRC.
    pub fn set_body(&mut self, data: Vec<u8>, crc: u32) {
        self.crc = crc;
        self.data = data;
    }

    /// Marks the packet as a successful empty reply. The CRC field is
    /// left in place: forwarded-op acks are identity-matched on it.
    pub fn pack_ok_reply(&mut self) {
        self.result_code = ResultCode::Ok;
        self.next_addrs.clear();
        self.remaining_followers = 0;
        self.data.clear();
    }

    /// Marks the packet as a successful reply carrying `body`.
    pub fn pack_ok_with_body(&mut self, body: Vec<u8>) {
        self.result_code = ResultCode::Ok;
        self.next_addrs.clear();
        self.remaining_followers = 0;
        self.data = body;
    }

    /// Marks the packet as a failed reply. The body carries the action tag
    /// and message so clients can parse causality.
    pub fn pack_error_body(&mut self, code: ResultCode, action: &str, message: &str) {
        self.result_code = code;
        self.next_addrs.clear();
        self.remaining_followers = 0;
        self.data = format!("{action}: {message}").into_bytes();
        self.crc = 0;
    }

    /// Returns true if the packet carries a non-`Ok` result code.
    pub fn is_error(&self) -> bool {
        self.result_code != ResultCode::Ok
    }

    /// Returns true when a reply's identity matches this request: same
    /// request id, partition, extent, offset, and body CRC.
    pub fn matches_reply(&self, reply: &Packet) -> bool {
        self.req_id == reply.req_id
            && self.partition_id == reply.partition_id
            && self.extent_id == reply.extent_id
            && self.offset == reply.offset
            && self.crc == reply.crc
    }

    /// A compact identity string for logs.
    pub fn unique_id(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.req_id, self.partition_id, self.extent_id, self.offset, self.opcode
        )
    }

    fn encode_header(&self, arg: &[u8]) -> [u8; PACKET_HEADER_SIZE] {
        let mut h = [0u8; PACKET_HEADER_SIZE];
        h[0] = PACKET_MAGIC;
        h[1] = self.store_mode as u8;
        h[2] = self.opcode as u8;
        h[3] = self.result_code as u8;
        h[4] = self.remaining_followers;
        h[5..9].copy_from_slice(&self.crc.to_be_bytes());
        h[9..13].copy_from_slice(&(self.data.len() as u32).to_be_bytes());
        h[13..17].copy_from_slice(&(arg.len() as u32).to_be_bytes());
        h[17..25].copy_from_slice(&self.partition_id.to_be_bytes());
        h[25..33].copy_from_slice(&self.extent_id.to_be_bytes());
        h[33..41].copy_from_slice(&self.offset.to_be_bytes());
        h[41..49].copy_from_slice(&self.req_id.to_be_bytes());
        h
    }

    /// Writes the full frame to `w` and flushes it.
    pub async fn write_to<W>(&self, w: &mut W) -> ProtoResult<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        let arg = self.next_addrs.join(",").into_bytes();
        let header = self.encode_header(&arg);
        w.write_all(&header).await?;
        if !arg.is_empty() {
            w.write_all(&arg).await?;
        }
        if !self.data.is_empty() {
            w.write_all(&self.data).await?;
        }
        w.flush().await?;
        Ok(())
    }

    /// Reads one full frame from `r`.
    pub async fn read_from<R>(r: &mut R) -> ProtoResult<Self>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut h = [0u8; PACKET_HEADER_SIZE];
        r.read_exact(&mut h).await?;
        if h[0] != PACKET_MAGIC {
            return Err(ProtoError::BadMagic(h[0]));
        }
        let store_mode = StoreMode::from_u8(h[1])?;
        let opcode = Opcode::from_u8(h[2])?;
        let result_code = ResultCode::from_u8(h[3]);
        let remaining_followers = h[4];
        let crc = u32::from_be_bytes(h[5..9].try_into().unwrap());
        let size = u32::from_be_bytes(h[9..13].try_into().unwrap());
        let arg_len = u32::from_be_bytes(h[13..17].try_into().unwrap());
        if size > MAX_PACKET_BODY {
            return Err(ProtoError::FrameTooLarge {
                field: "size",
                len: size,
                limit: MAX_PACKET_BODY,
            });
        }
        if arg_len > MAX_PACKET_ARG {
            return Err(ProtoError::FrameTooLarge {
                field: "arg_len",
                len: arg_len,
                limit: MAX_PACKET_ARG,
            });
        }
        let partition_id = u64::from_be_bytes(h[17..25].try_into().unwrap());
        let extent_id = u64::from_be_bytes(h[25..33].try_into().unwrap());
        let offset = u64::from_be_bytes(h[33..41].try_into().unwrap());
        let req_id = u64::from_be_bytes(h[41..49].try_into().unwrap());

        let next_addrs = if arg_len > 0 {
            let mut arg = vec![0u8; arg_len as usize];
            r.read_exact(&mut arg).await?;
            let s = String::from_utf8(arg).map_err(|_| ProtoError::BadArg)?;
            s.split(',')
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let mut data = vec![0u8; size as usize];
        if size > 0 {
            r.read_exact(&mut data).await?;
        }

        Ok(Self {
            store_mode,
            opcode,
            result_code,
            remaining_followers,
            crc,
            partition_id,
            extent_id,
            offset,
            req_id,
            next_addrs,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        let mut p = Packet::new_request(Opcode::Write, StoreMode::Normal, 1, 2, 131072);
        p.next_addrs = vec!["10.0.0.2:17030".into(), "10.0.0.3:17030".into()];
        p.remaining_followers = 2;
        p.set_body(vec![0xAA; 512], 0xDEAD_BEEF);
        p
    }

    async fn encode(p: &Packet) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        p.write_to(&mut cursor).await.unwrap();
        cursor.into_inner()
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let p = sample_packet();
        let buf = encode(&p).await;
        assert_eq!(
            buf.len(),
            PACKET_HEADER_SIZE + "10.0.0.2:17030,10.0.0.3:17030".len() + 512
        );

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Packet::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded.opcode, Opcode::Write);
        assert_eq!(decoded.store_mode, StoreMode::Normal);
        assert_eq!(decoded.partition_id, 1);
        assert_eq!(decoded.extent_id, 2);
        assert_eq!(decoded.offset, 131072);
        assert_eq!(decoded.req_id, p.req_id);
        assert_eq!(decoded.crc, 0xDEAD_BEEF);
        assert_eq!(decoded.next_addrs, p.next_addrs);
        assert_eq!(decoded.data, p.data);
    }

    #[tokio::test]
    async fn test_frame_empty_arg_and_body() {
        let p = Packet::new_request(Opcode::GetWatermark, StoreMode::Normal, 9, 50_000_000, 0);
        let buf = encode(&p).await;
        assert_eq!(buf.len(), PACKET_HEADER_SIZE);
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Packet::read_from(&mut cursor).await.unwrap();
        assert!(decoded.next_addrs.is_empty());
        assert!(decoded.data.is_empty());
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let p = sample_packet();
        let mut buf = encode(&p).await;
        buf[0] = 0x00;
        let mut cursor = std::io::Cursor::new(buf);
        match Packet::read_from(&mut cursor).await {
            Err(ProtoError::BadMagic(0x00)) => {}
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let p = sample_packet();
        let mut buf = encode(&p).await;
        // Corrupt the size field beyond the limit.
        buf[9..13].copy_from_slice(&(MAX_PACKET_BODY + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            Packet::read_from(&mut cursor).await,
            Err(ProtoError::FrameTooLarge { field: "size", .. })
        ));
    }

    #[test]
    fn test_reply_matching() {
        let req = sample_packet();
        let mut reply = Packet::new_reply(&req);
        reply.pack_ok_reply();
        assert!(req.matches_reply(&reply), "empty ok reply keeps identity");

        let mut wrong_crc = reply.clone();
        wrong_crc.crc = 0xBEEF;
        assert!(!req.matches_reply(&wrong_crc));

        let mut wrong_offset = reply.clone();
        wrong_offset.offset += 1;
        assert!(!req.matches_reply(&wrong_offset));
    }

    #[test]
    fn test_pack_error_body_carries_action_tag() {
        let mut p = sample_packet();
        p.pack_error_body(ResultCode::ArgMismatchErr, "OpWrite", "offset out of range");
        assert!(p.is_error());
        let body = String::from_utf8(p.data.clone()).unwrap();
        assert!(body.starts_with("OpWrite"));
        assert!(p.next_addrs.is_empty());
    }

    #[test]
    fn test_request_ids_monotonic() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }
}
