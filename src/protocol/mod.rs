//! Messages exchanged with the scheduler and with compile workers.
//!
//! The client only ever speaks a handful of message kinds:
//!
//! - **Scheduler**: [`Message::RequestAssignment`] out, one
//!   [`Message::AssignmentReply`] back per requested copy.
//! - **Worker**: optional [`Message::EnvironmentTransfer`] followed by a chunk
//!   stream, then [`Message::CompileJob`] and the preprocessed source as a chunk
//!   stream, answered by [`Message::CompileResult`] and (on success) the object
//!   file as a chunk stream.
//!
//! Chunk streams are any number of [`Message::FileChunk`] terminated by
//! [`Message::End`]. Framing lives in [`codec`]; payloads are rkyv archives of
//! [`Message`].

pub mod codec;

use bytes::Bytes;
use rkyv::{Archive, Deserialize, Serialize};

use crate::job::Language;

pub use codec::{MessageCodec, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};

/// Wire protocol version spoken by this client.
pub const PROTOCOL_VERSION: u16 = 5;

/// Oldest scheduler protocol that understands multi-copy assignment requests.
pub const MIN_REDUNDANCY_PROTOCOL: u16 = 5;

/// Message type discriminant carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    RequestAssignment = 0x01,
    AssignmentReply = 0x02,
    EnvironmentTransfer = 0x03,
    FileChunk = 0x04,
    End = 0x05,
    CompileJob = 0x06,
    CompileResult = 0x07,
}

impl MessageKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(Self::RequestAssignment),
            0x02 => Some(Self::AssignmentReply),
            0x03 => Some(Self::EnvironmentTransfer),
            0x04 => Some(Self::FileChunk),
            0x05 => Some(Self::End),
            0x06 => Some(Self::CompileJob),
            0x07 => Some(Self::CompileResult),
            _ => None,
        }
    }

    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RequestAssignment => "request_assignment",
            Self::AssignmentReply => "assignment_reply",
            Self::EnvironmentTransfer => "environment_transfer",
            Self::FileChunk => "file_chunk",
            Self::End => "end",
            Self::CompileJob => "compile_job",
            Self::CompileResult => "compile_result",
        }
    }
}

/// Job metadata sent to a worker ahead of the preprocessed source.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: u32,
    pub environment: String,
    pub language: Language,
    pub input_name: String,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum Message {
    RequestAssignment {
        environment: String,
        input_path: String,
        language: Language,
        copies: u32,
    },
    AssignmentReply {
        hostname: String,
        port: u16,
        job_id: u32,
        environment: String,
        has_environment: bool,
    },
    EnvironmentTransfer {
        environment: String,
    },
    FileChunk(Bytes),
    End,
    CompileJob(JobDescriptor),
    CompileResult {
        status: i32,
        stdout: String,
        stderr: String,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RequestAssignment { .. } => MessageKind::RequestAssignment,
            Message::AssignmentReply { .. } => MessageKind::AssignmentReply,
            Message::EnvironmentTransfer { .. } => MessageKind::EnvironmentTransfer,
            Message::FileChunk(_) => MessageKind::FileChunk,
            Message::End => MessageKind::End,
            Message::CompileJob(_) => MessageKind::CompileJob,
            Message::CompileResult { .. } => MessageKind::CompileResult,
        }
    }
}
