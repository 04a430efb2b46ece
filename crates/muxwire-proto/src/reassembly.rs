//! Rebuilding arguments from received call frames.
//!
//! The inverse of [`crate::fragment`]. Each completed argument is handed out
//! as soon as its closing chunk arrives, so a receiver can start on the
//! method name before the body has finished streaming in. The checksum is
//! verified when the final frame arrives.

use bytes::{Bytes, BytesMut};

use crate::{
    checksum::{Checksum, ChecksumType},
    fragment::ARG_COUNT,
    payloads::CallBody,
};

/// One finished argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    /// Position, `0..ARG_COUNT`.
    pub index: usize,
    /// Argument bytes.
    pub bytes: Bytes,
}

/// Reasons a message's frames cannot be reassembled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    /// Checksum over the received arguments does not match the trailer.
    #[error("checksum mismatch: frame carried {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Value carried by the final frame.
        expected: u32,
        /// Value computed locally.
        actual: u32,
    },

    /// Final frame declared a checksum type but carried no value.
    #[error("final frame is missing its checksum")]
    MissingChecksum,

    /// Frames of one message disagree on the checksum algorithm.
    #[error("checksum type changed from {expected:?} to {actual:?}")]
    ChecksumTypeChanged {
        /// Type from the first frame.
        expected: ChecksumType,
        /// Type on the offending frame.
        actual: ChecksumType,
    },

    /// More chunks than three arguments can hold.
    #[error("more than {ARG_COUNT} arguments")]
    TooManyArguments,

    /// A frame arrived after the final one.
    #[error("message already complete")]
    AlreadyComplete,
}

/// Per-message reassembly state.
#[derive(Debug)]
pub struct Reassembler {
    checksum: Checksum,
    current: usize,
    partial: BytesMut,
    open: bool,
    complete: bool,
}

impl Reassembler {
    /// State for a message whose first frame declared `checksum_type`.
    pub fn new(checksum_type: ChecksumType) -> Self {
        Self {
            checksum: Checksum::new(checksum_type),
            current: 0,
            partial: BytesMut::new(),
            open: false,
            complete: false,
        }
    }

    /// True once the final frame has been accepted.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Index of the argument currently being filled.
    pub fn current_argument(&self) -> usize {
        self.current
    }

    /// Feed the next frame's body; returns arguments completed by it.
    ///
    /// On the final frame any arguments the sender omitted are completed as
    /// empty, then the checksum is checked. After an error the message must be
    /// abandoned.
    pub fn push(&mut self, body: &CallBody) -> Result<Vec<Argument>, ReassemblyError> {
        if self.complete {
            return Err(ReassemblyError::AlreadyComplete);
        }
        if body.checksum_type != self.checksum.kind() {
            return Err(ReassemblyError::ChecksumTypeChanged {
                expected: self.checksum.kind(),
                actual: body.checksum_type,
            });
        }

        let is_final = body.is_final();
        let last = body.chunks.len().saturating_sub(1);
        let mut done = Vec::new();

        for (i, chunk) in body.chunks.iter().enumerate() {
            if self.current >= ARG_COUNT {
                return Err(ReassemblyError::TooManyArguments);
            }
            self.checksum.update(chunk);

            if i < last || is_final {
                done.push(self.close_with(chunk));
            } else {
                self.partial.extend_from_slice(chunk);
                self.open = true;
            }
        }

        if is_final {
            if self.open {
                done.push(self.close_with(&Bytes::new()));
            }
            while self.current < ARG_COUNT {
                done.push(Argument { index: self.current, bytes: Bytes::new() });
                self.current += 1;
            }
            self.complete = true;

            if self.checksum.kind() != ChecksumType::None {
                let expected = body.checksum.ok_or(ReassemblyError::MissingChecksum)?;
                let actual = self.checksum.finalize();
                if expected != actual {
                    return Err(ReassemblyError::ChecksumMismatch { expected, actual });
                }
            }
        }
        Ok(done)
    }

    fn close_with(&mut self, chunk: &Bytes) -> Argument {
        let bytes = if self.partial.is_empty() {
            chunk.clone()
        } else {
            self.partial.extend_from_slice(chunk);
            self.partial.split().freeze()
        };
        let argument = Argument { index: self.current, bytes };
        self.current += 1;
        self.open = false;
        argument
    }
}
