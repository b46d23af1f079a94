use peg::{error::ParseError, str::LineCol};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid label selector {input:?}: {source}")]
    Labels {
        input: String,
        source: ParseError<LineCol>,
    },
    #[error("invalid field selector {input:?}: {source}")]
    Fields {
        input: String,
        source: ParseError<LineCol>,
    },
}
pub type Result<T> = std::result::Result<T, Error>;
