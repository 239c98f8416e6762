//! Tool result actions
//!
//! Every dispatch produces an [`ActionResponse`]; the `action` field tells
//! the caller what to do with it:
//! - `Response`: speak `response` directly
//! - `ReqLlm`: append `result` as a tool message and re-invoke the LLM
//! - `NotFound` / `Error`: speak the diagnostic in `result`
//! - `None`: silent success

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Response,
    ReqLlm,
    NotFound,
    Error,
    None,
}

#[derive(Debug, Clone)]
pub struct ActionResponse {
    pub action: Action,
    /// Data for the LLM or a diagnostic phrase.
    pub result: Option<String>,
    /// Text spoken verbatim.
    pub response: Option<String>,
}

impl ActionResponse {
    pub fn response(text: impl Into<String>) -> Self {
        Self {
            action: Action::Response,
            result: None,
            response: Some(text.into()),
        }
    }

    pub fn req_llm(result: impl Into<String>) -> Self {
        Self {
            action: Action::ReqLlm,
            result: Some(result.into()),
            response: None,
        }
    }

    pub fn not_found(diagnostic: impl Into<String>) -> Self {
        Self {
            action: Action::NotFound,
            result: Some(diagnostic.into()),
            response: None,
        }
    }

    pub fn error(diagnostic: impl Into<String>) -> Self {
        Self {
            action: Action::Error,
            result: Some(diagnostic.into()),
            response: None,
        }
    }

    pub fn none() -> Self {
        Self {
            action: Action::None,
            result: None,
            response: None,
        }
    }
}
