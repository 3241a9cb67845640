//! Worker process protocol
//!
//! Parent and worker processes speak length-prefixed bincode frames over
//! the worker's stdin/stdout:
//!
//! ```text
//! [4 bytes: payload length, little-endian u32][N bytes: bincode message]
//! ```
//!
//! The exchange is strictly request/response:
//!
//! ```text
//! Parent                         Worker
//!   |-------- HELLO ------------->|
//!   |<------- HELLO_OK -----------|
//!   |-------- RUN(task, items) -->|
//!   |<------- DONE(outputs) ------|
//!   |-------- SHUTDOWN ---------->|
//! ```
//!
//! Both sides carry a protocol version; a mismatch fails the handshake
//! rather than producing garbled results later.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Increment on breaking changes to the message set
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame; anything larger is a corrupt stream
pub const MAX_FRAME_BYTES: u32 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encode/decode failed: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(u32),
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("unexpected message: {0}")]
    Unexpected(&'static str),
}

/// Parent → worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerRequest {
    Hello { version: u32 },
    Ping,
    /// Apply the registered task to each marshalled item
    Run { task: String, items: Vec<Vec<u8>> },
    Shutdown,
}

/// Worker → parent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerResponse {
    HelloOk { version: u32 },
    Pong,
    /// Per-item outcomes, in item order; `Err` carries the failure message
    Done { outputs: Vec<Result<Vec<u8>, String>> },
    /// The whole request failed (unknown task, decode error)
    Failed { message: String },
}

/// Write one framed message
pub fn write_frame<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<(), ProtocolError> {
    let payload = bincode::serialize(message)?;
    let length = payload.len() as u32;
    if length > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message, blocking until it is complete
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T, ProtocolError> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes)?;
    let length = u32::from_le_bytes(length_bytes);
    if length > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}

/// Serve requests until `Shutdown` or the parent closes the pipe
///
/// This is the worker-side loop; the hidden worker mode of the binary calls
/// it with its stdin/stdout after registering its tasks. Task names resolve
/// through the process-wide registry.
pub fn serve(reader: &mut impl Read, writer: &mut impl Write) -> Result<(), ProtocolError> {
    loop {
        let request: WorkerRequest = match read_frame(reader) {
            Ok(request) => request,
            // Parent went away; treat a clean EOF as shutdown
            Err(ProtocolError::Io(error))
                if error.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        match request {
            WorkerRequest::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    write_frame(
                        writer,
                        &WorkerResponse::Failed {
                            message: format!(
                                "protocol version mismatch: parent {}, worker {}",
                                version, PROTOCOL_VERSION
                            ),
                        },
                    )?;
                    return Err(ProtocolError::VersionMismatch {
                        ours: PROTOCOL_VERSION,
                        theirs: version,
                    });
                }
                write_frame(writer, &WorkerResponse::HelloOk { version: PROTOCOL_VERSION })?;
            }
            WorkerRequest::Ping => write_frame(writer, &WorkerResponse::Pong)?,
            WorkerRequest::Run { task, items } => {
                let response = match crate::task::lookup(&task) {
                    Some(byte_task) => {
                        let outputs = items
                            .iter()
                            .map(|item| byte_task(item).map_err(|e| e.to_string()))
                            .collect();
                        WorkerResponse::Done { outputs }
                    }
                    None => WorkerResponse::Failed {
                        message: crate::task::TaskError::Unregistered(task).to_string(),
                    },
                };
                write_frame(writer, &response)?;
            }
            WorkerRequest::Shutdown => return Ok(()),
        }
    }
}
