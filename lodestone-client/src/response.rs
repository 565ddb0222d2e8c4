//! The terminal outcome of a request.

use lodestone_core::{Entity, RequestError};

/// What a request ultimately produced: a typed entity or an error.
#[derive(Clone, Debug)]
pub enum Response {
    Success(Entity),
    Failure(RequestError),
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }

    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Response::Success(entity) => Some(entity),
            Response::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RequestError> {
        match self {
            Response::Success(_) => None,
            Response::Failure(error) => Some(error),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Response::Failure(e) if e.is_cancellation())
    }
}

/// A [`Response`] plus whether it carries new content.
///
/// `is_new` is false exactly when the response is a 304 revalidation of
/// content the resource already had.
#[derive(Clone, Debug)]
pub struct ResponseInfo {
    pub response: Response,
    pub is_new: bool,
}

impl ResponseInfo {
    pub(crate) fn new(response: Response) -> Self {
        ResponseInfo { response, is_new: true }
    }

    pub(crate) fn not_modified(response: Response) -> Self {
        ResponseInfo { response, is_new: false }
    }
}
