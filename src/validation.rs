use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExactlyOneError {
    #[error("Expected exactly one element but got none")]
    None,

    #[error("Expected exactly one element but got {0}")]
    More(usize),
}

/// Unwrap the single element of a response array.
pub trait ExactlyOne {
    type Item;

    fn exactly_one(self) -> Result<Self::Item, ExactlyOneError>;
}

impl<T> ExactlyOne for Vec<T> {
    type Item = T;

    fn exactly_one(mut self) -> Result<Self::Item, ExactlyOneError> {
        match self.len() {
            0 => Err(ExactlyOneError::None),
            1 => Ok(self.remove(0)),
            n => Err(ExactlyOneError::More(n)),
        }
    }
}
