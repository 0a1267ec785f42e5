//! Frame encoding for byte-stream transports.
//!
//! Pipes have no message boundaries, so stdio-based channels wrap each
//! message in a frame. Format: 4-byte length (u32 LE) + body.

use std::io::{ErrorKind, Read, Write};

use crate::error::{Error, Result};

/// Largest accepted frame body (16MB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(body.len()));
    }

    let len = body.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write frame length: {}", e)))?;
    writer
        .write_all(body)
        .map_err(|e| Error::Ipc(format!("Failed to write frame body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream (EOF before any length byte).
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read frame length: {}", e))),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::Ipc(format!("Failed to read frame body: {}", e)))?;

    Ok(Some(body))
}
