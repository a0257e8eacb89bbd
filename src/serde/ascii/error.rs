use std::fmt;

use derive_more::Display;
use nom;

use serde::de;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display)]
pub enum Error {
    Message(String),

    #[display("parse error: {_0}")]
    Nom(String),

    #[display("unknown keyword at {_0:?}")]
    ExpectedEnum(String),

    #[display("trailing characters in {_0:?}")]
    TrailingCharacters(String),

    #[display("value at {_0:?} cannot be read from a text line")]
    Unsupported(String),
}

impl de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a str>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&'a str>>) -> Self {
        Error::Nom(format!("{}", err))
    }
}

impl std::error::Error for Error {}
