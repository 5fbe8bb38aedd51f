use crate::protocol::FailureId;
use evflow_reverse_calls::ReverseCallError;
use evflow_streams::error::StreamsError;
use evflow_streams::ids::EventProcessorId;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("streams: {0}")]
    Streams(#[from] StreamsError),

    #[error("reverse call: {0}")]
    ReverseCall(#[from] ReverseCallError),

    #[error("event handler not registered: {0}")]
    NotRegistered(EventProcessorId),

    #[error("registration rejected ({id}): {reason}")]
    Rejected { id: FailureId, reason: String },
}

pub type HandlerResult<T> = Result<T, HandlerError>;
