//! The error taxonomy.
//!
//! Traits raise these, the core propagates them unchanged, and
//! automations convert the non fatal ones into trap reports. The
//! token form is what ends up in a trap string.
use arcstr::ArcStr;
use splot_rpn::RpnError;
use splot_value::CastError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("property not found: {0}")]
    PropertyNotFound(ArcStr),
    #[error("property is read only: {0}")]
    PropertyReadOnly(ArcStr),
    #[error("property is write only: {0}")]
    PropertyWriteOnly(ArcStr),
    #[error("invalid value for property: {0}")]
    InvalidPropertyValue(ArcStr),
    #[error("bad state for property value: {0}")]
    BadStateForPropertyValue(ArcStr),
    #[error("property operation unsupported: {0}")]
    PropertyOperationUnsupported(ArcStr),
    #[error("method not found: {0}")]
    MethodNotFound(ArcStr),
    #[error("invalid method arguments: {0}")]
    InvalidMethodArguments(ArcStr),
    #[error("unknown resource: {0}")]
    UnknownResource(ArcStr),
    #[error("resource not yet associated: {0}")]
    UnassociatedResource(ArcStr),
    #[error("cast failed: {0}")]
    Cast(#[from] CastError),
    #[error("rpn: {0}")]
    Rpn(#[from] RpnError),
    #[error("technology error: {0}")]
    Technology(anyhow::Error),
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Technology(e)
    }
}

impl Error {
    /// The short token used in automation trap strings.
    pub fn token(&self) -> &'static str {
        match self {
            Error::PropertyNotFound(_) => "not-found",
            Error::PropertyReadOnly(_) => "read-only",
            Error::PropertyWriteOnly(_) => "write-only",
            Error::InvalidPropertyValue(_) => "invalid-value",
            Error::BadStateForPropertyValue(_) => "bad-state",
            Error::PropertyOperationUnsupported(_) => "unsupported",
            Error::MethodNotFound(_) => "no-method",
            Error::InvalidMethodArguments(_) => "bad-args",
            Error::UnknownResource(_) => "unknown-resource",
            Error::UnassociatedResource(_) => "unassociated",
            Error::Cast(_) => "invalid-value",
            Error::Rpn(RpnError::Syntax(_)) => "rpn-syntax",
            Error::Rpn(RpnError::UnknownVariable(_)) => "rpn-variable",
            Error::Rpn(RpnError::Value(_)) => "rpn-value",
            Error::Technology(_) => "technology",
        }
    }
}
