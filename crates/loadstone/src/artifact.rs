//! On-disk layout of compiled artifacts.
//!
//! ```text
//! magic            4   b"LSTA"
//! signature        u32
//! runtime_len      u16, then runtime_len bytes of UTF-8
//! source_mtime     u64 seconds + u32 nanos since the Unix epoch
//! payload_len      u64, then payload_len bytes
//! payload_sha256   32
//! ```
//!
//! All integers are little-endian.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use loadstone_contracts::ARTIFACT_MAGIC;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub signature_version: u32,
    pub runtime_version: String,
    pub source_mtime_at_compile: SystemTime,
    pub payload: Vec<u8>,
}

/// Why a persisted artifact could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    Truncated { needed: usize, remaining: usize },
    BadMagic,
    RuntimeVersionNotUtf8,
    PayloadTooLarge(u64),
    ChecksumMismatch,
    TrailingBytes(usize),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::Truncated { needed, remaining } => {
                write!(f, "truncated: need {needed} bytes, {remaining} remaining")
            }
            FormatError::BadMagic => f.write_str("bad magic"),
            FormatError::RuntimeVersionNotUtf8 => f.write_str("runtime version is not UTF-8"),
            FormatError::PayloadTooLarge(n) => write!(f, "payload length {n} exceeds file size"),
            FormatError::ChecksumMismatch => f.write_str("payload checksum mismatch"),
            FormatError::TrailingBytes(n) => write!(f, "{n} trailing bytes after payload"),
        }
    }
}

impl CompiledArtifact {
    pub fn new(
        signature_version: u32,
        runtime_version: impl Into<String>,
        source_mtime_at_compile: SystemTime,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            signature_version,
            runtime_version: runtime_version.into(),
            source_mtime_at_compile,
            payload,
        }
    }

    pub fn payload_sha256_hex(&self) -> String {
        hex_lower(&Sha256::digest(&self.payload))
    }

    pub fn encode(&self) -> Vec<u8> {
        let runtime = self.runtime_version.as_bytes();
        let runtime_len = u16::try_from(runtime.len()).unwrap_or(u16::MAX);
        let runtime = &runtime[..runtime_len as usize];
        let (secs, nanos) = mtime_parts(self.source_mtime_at_compile);

        let mut out =
            Vec::with_capacity(4 + 4 + 2 + runtime.len() + 12 + 8 + self.payload.len() + 32);
        out.extend_from_slice(&ARTIFACT_MAGIC);
        out.extend_from_slice(&self.signature_version.to_le_bytes());
        out.extend_from_slice(&runtime_len.to_le_bytes());
        out.extend_from_slice(runtime);
        out.extend_from_slice(&secs.to_le_bytes());
        out.extend_from_slice(&nanos.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&Sha256::digest(&self.payload));
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut r = Reader { bytes, pos: 0 };
        if r.take(4)? != ARTIFACT_MAGIC {
            return Err(FormatError::BadMagic);
        }
        let signature_version = r.u32()?;
        let runtime_len = r.u16()? as usize;
        let runtime_version = std::str::from_utf8(r.take(runtime_len)?)
            .map_err(|_| FormatError::RuntimeVersionNotUtf8)?
            .to_string();
        let secs = r.u64()?;
        let nanos = r.u32()?;
        let payload_len = r.u64()?;
        if payload_len > r.remaining() as u64 {
            return Err(FormatError::PayloadTooLarge(payload_len));
        }
        let payload = r.take(payload_len as usize)?.to_vec();
        let checksum = r.take(32)?;
        if r.remaining() != 0 {
            return Err(FormatError::TrailingBytes(r.remaining()));
        }
        if Sha256::digest(&payload).as_slice() != checksum {
            return Err(FormatError::ChecksumMismatch);
        }
        Ok(Self {
            signature_version,
            runtime_version,
            source_mtime_at_compile: mtime_from_parts(secs, nanos),
            payload,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        if self.remaining() < n {
            return Err(FormatError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, FormatError> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, FormatError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Pre-epoch times collapse to the epoch.
pub fn mtime_parts(t: SystemTime) -> (u64, u32) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

pub fn mtime_from_parts(secs: u64, nanos: u32) -> SystemTime {
    UNIX_EPOCH + Duration::new(secs, nanos.min(999_999_999))
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
