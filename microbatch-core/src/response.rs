//! Inference responses and the flags that accompany them.

use crate::request::Tensor;

/// Bit flags attached to every emitted response.
///
/// A request may produce several responses (streaming); exactly one of
/// them carries [`ResponseFlags::FINAL`], which marks the request as
/// complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseFlags(u32);

impl ResponseFlags {
    /// No flags set
    pub const NONE: ResponseFlags = ResponseFlags(0);
    /// Last response for the request
    pub const FINAL: ResponseFlags = ResponseFlags(1);

    /// Whether the FINAL bit is set
    pub fn is_final(&self) -> bool {
        self.0 & Self::FINAL.0 != 0
    }

    /// Raw bit value
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// A response produced for a single request
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    /// Id of the request this response answers
    pub request_id: u64,

    /// Model that produced (or would have produced) the response
    pub model: String,

    /// Output tensors; empty for error responses
    pub outputs: Vec<Tensor>,

    /// Error message when the request failed instead of executing
    pub error: Option<String>,
}

impl InferenceResponse {
    /// Create a successful response
    pub fn new(request_id: u64, model: impl Into<String>, outputs: Vec<Tensor>) -> Self {
        Self { request_id, model: model.into(), outputs, error: None }
    }

    /// Create an error response
    pub fn error(request_id: u64, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self { request_id, model: model.into(), outputs: Vec::new(), error: Some(message.into()) }
    }

    /// Whether this response carries an error instead of outputs
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A response paired with its flags, as delivered on the response channel
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub response: InferenceResponse,
    pub flags: ResponseFlags,
}
