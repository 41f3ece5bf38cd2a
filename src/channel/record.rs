//! Record framing.
//!
//! ```text
//! [u16 LE: 3 + payload length][flags][payload][random padding]   <- AES-256-CBC
//! [HMAC-SHA256 over the ciphertext above]
//! ```
//!
//! Padding brings the encrypted part to a multiple of the block size. The
//! reader authenticates every ciphertext byte of a record before any
//! plaintext is handed out.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::channel::config::MAX_RECORD_LENGTH;
use crate::channel::error::ChannelError;
use crate::crypto::record_cipher::padded_len;
use crate::crypto::{RecordDecryptor, RecordEncryptor, TrafficKeys, BLOCK_SIZE, MAC_SIZE};

/// Length field plus flags byte.
pub const HEADER_SIZE: usize = 3;

/// Sender wants to renegotiate; it stops writing application data after this record.
pub const FLAG_RENEGOTIATE: u8 = 0x01;

/// Sender saw the peer's request and has paused its own writes.
pub const FLAG_RENEGOTIATE_ACK: u8 = 0x02;

/// Check a record body size: whole blocks, at most what the length field holds.
pub fn check_record_size(record_size: usize) -> Result<(), ChannelError> {
    if record_size < BLOCK_SIZE
        || record_size % BLOCK_SIZE != 0
        || record_size > MAX_RECORD_LENGTH
    {
        return Err(ChannelError::InvalidConfig(format!(
            "invalid record size {}",
            record_size
        )));
    }
    Ok(())
}

/// Buffers application bytes and emits sealed records.
pub struct RecordSealer {
    encryptor: RecordEncryptor,
    buffer: Vec<u8>,
    record_size: usize,
    pending_flags: u8,
    bytes_sent: u64,
}

impl RecordSealer {
    /// `record_size` is the size of a full record body before the MAC.
    pub fn new(keys: &TrafficKeys, record_size: usize) -> Result<Self, ChannelError> {
        check_record_size(record_size)?;
        let mut buffer = Vec::with_capacity(record_size + MAC_SIZE);
        buffer.resize(HEADER_SIZE, 0);
        Ok(Self {
            encryptor: RecordEncryptor::new(keys)?,
            buffer,
            record_size,
            pending_flags: 0,
            bytes_sent: 0,
        })
    }

    /// Application bytes written with this key epoch.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Payload bytes waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - HEADER_SIZE
    }

    /// Set flag bits on the next record that goes out.
    pub fn set_flags(&mut self, flags: u8) {
        self.pending_flags |= flags;
    }

    /// Append payload, sealing a record every time one fills up.
    pub async fn write<W: AsyncWrite + Unpin + ?Sized>(
        &mut self,
        writer: &mut W,
        mut data: &[u8],
    ) -> Result<(), ChannelError> {
        while !data.is_empty() {
            let room = self.record_size - self.buffer.len();
            let n = room.min(data.len());
            self.buffer.extend_from_slice(&data[..n]);
            self.bytes_sent += n as u64;
            data = &data[n..];

            if self.buffer.len() == self.record_size {
                self.seal_record(writer).await?;
            }
        }
        Ok(())
    }

    /// Seal whatever is buffered and flush the writer.
    ///
    /// Returns `false` without writing when there is neither payload nor a
    /// pending flag.
    pub async fn flush<W: AsyncWrite + Unpin + ?Sized>(
        &mut self,
        writer: &mut W,
    ) -> Result<bool, ChannelError> {
        if self.buffered() == 0 && self.pending_flags == 0 {
            return Ok(false);
        }
        self.seal_record(writer).await?;
        writer.flush().await?;
        Ok(true)
    }

    async fn seal_record<W: AsyncWrite + Unpin + ?Sized>(
        &mut self,
        writer: &mut W,
    ) -> Result<(), ChannelError> {
        let length = self.buffer.len();
        self.buffer[..2].copy_from_slice(&(length as u16).to_le_bytes());
        self.buffer[2] = self.pending_flags;

        let padded = padded_len(length);
        self.buffer.resize(padded, 0);
        rand::rngs::OsRng.fill_bytes(&mut self.buffer[length..]);

        let tag = self.encryptor.seal_in_place(&mut self.buffer)?;
        self.buffer.extend_from_slice(&tag);
        let written = writer.write_all(&self.buffer).await;

        trace!(
            length,
            flags = self.pending_flags,
            wire = self.buffer.len(),
            "sealed record"
        );
        self.buffer.clear();
        self.buffer.resize(HEADER_SIZE, 0);
        self.pending_flags = 0;
        written?;
        Ok(())
    }
}

/// One authenticated record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedRecord {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl OpenedRecord {
    pub fn requests_renegotiation(&self) -> bool {
        self.flags & FLAG_RENEGOTIATE != 0
    }

    pub fn acknowledges_renegotiation(&self) -> bool {
        self.flags & FLAG_RENEGOTIATE_ACK != 0
    }
}

/// Reads and authenticates records.
pub struct RecordOpener {
    decryptor: RecordDecryptor,
    max_length: usize,
}

impl RecordOpener {
    /// `record_size` is the largest record body the peer sends.
    pub fn new(keys: &TrafficKeys, record_size: usize) -> Result<Self, ChannelError> {
        check_record_size(record_size)?;
        Ok(Self {
            decryptor: RecordDecryptor::new(keys)?,
            max_length: record_size,
        })
    }

    /// Read the next record.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between records. A
    /// stream that ends inside a record, a length field out of range and a
    /// MAC mismatch are all integrity failures.
    pub async fn read_record<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<OpenedRecord>, ChannelError> {
        let mut first = [0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = reader.read(&mut first[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ChannelError::IntegrityFailure);
            }
            filled += n;
        }

        let length = {
            let plain = self.decryptor.peek_first_block(&first);
            u16::from_le_bytes([plain[0], plain[1]]) as usize
        };
        // Checked before waiting for the rest, so a corrupted length cannot
        // stall the reader or swallow the records behind it.
        if !(HEADER_SIZE..=self.max_length).contains(&length) {
            return Err(ChannelError::IntegrityFailure);
        }

        let body = padded_len(length);
        let mut record = vec![0u8; body + MAC_SIZE];
        record[..BLOCK_SIZE].copy_from_slice(&first);
        if let Err(e) = reader.read_exact(&mut record[BLOCK_SIZE..]).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(ChannelError::IntegrityFailure);
            }
            return Err(e.into());
        }

        let (ciphertext, tag) = record.split_at_mut(body);
        self.decryptor.open_in_place(ciphertext, tag)?;

        trace!(length, flags = ciphertext[2], "opened record");
        Ok(Some(OpenedRecord {
            flags: ciphertext[2],
            payload: ciphertext[HEADER_SIZE..length].to_vec(),
        }))
    }
}
