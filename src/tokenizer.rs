use nom::{
    character::complete::{i64, not_line_ending, space0, space1},
    combinator::{eof, opt, peek},
    sequence::terminated,
};

use derive_more::Display;

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum TokenError {
    // The record ran out of tokens. Whether this is corruption or a file
    // cut off mid-write is up to the caller.
    #[display("unexpected end of record")]
    EndOfInput,

    #[display("expected integer, found {_0:?}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, TokenError>;

/// Lexer over one physical record (one line of a log file).
#[derive(Debug, Clone)]
pub struct RecordTokenizer<'a> {
    input: &'a str,
}

impl<'a> RecordTokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        RecordTokenizer { input }
    }

    fn skip_space(&self) -> &'a str {
        let result: nom::IResult<&str, &str> = space0(self.input);
        match result {
            Ok((input, _)) => input,
            Err(_) => self.input,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.skip_space().is_empty()
    }

    pub fn next_i64(&mut self) -> Result<i64> {
        let input = self.skip_space();
        if input.is_empty() {
            return Err(TokenError::EndOfInput);
        }
        // A token must be followed by whitespace or the end of the record,
        // otherwise "12ab" would lex as 12.
        let result: nom::IResult<&str, i64> = terminated(i64, peek(opt_separator))(input);
        match result {
            Ok((rest, value)) => {
                self.input = rest;
                Ok(value)
            }
            Err(_) => Err(TokenError::Malformed(first_word(input).to_owned())),
        }
    }

    pub fn next_i32(&mut self) -> Result<i32> {
        let value = self.next_i64()?;
        i32::try_from(value).map_err(|_| TokenError::Malformed(value.to_string()))
    }

    pub fn next_u32(&mut self) -> Result<u32> {
        let value = self.next_i64()?;
        u32::try_from(value).map_err(|_| TokenError::Malformed(value.to_string()))
    }

    /// The event-type tag, without consuming it.
    pub fn peek_tag(&self) -> Result<i64> {
        self.clone().next_i64()
    }

    /// Raw remainder of the record, trimmed of leading whitespace.
    pub fn rest(&mut self) -> &'a str {
        let input = self.skip_space();
        let result: nom::IResult<&str, &str> = not_line_ending(input);
        let (rest, value) = result.unwrap_or(("", input));
        self.input = rest;
        value.trim_end()
    }

    pub fn count_remaining(&self) -> usize {
        self.input.split_whitespace().count()
    }
}

fn opt_separator(input: &str) -> nom::IResult<&str, ()> {
    let (input, space) = opt(space1)(input)?;
    if space.is_some() {
        return Ok((input, ()));
    }
    let (input, _) = eof(input)?;
    Ok((input, ()))
}

fn first_word(input: &str) -> &str {
    input.split_whitespace().next().unwrap_or(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers() {
        let mut t = RecordTokenizer::new(" 2 -7 1234567890123 ");
        assert_eq!(t.next_i32(), Ok(2));
        assert_eq!(t.next_i32(), Ok(-7));
        assert_eq!(t.next_i64(), Ok(1234567890123));
        assert!(t.is_empty());
        assert_eq!(t.next_i64(), Err(TokenError::EndOfInput));
    }

    #[test]
    fn test_malformed() {
        let mut t = RecordTokenizer::new("2 12ab 3");
        assert_eq!(t.next_i64(), Ok(2));
        assert_eq!(t.next_i64(), Err(TokenError::Malformed("12ab".to_owned())));

        let mut t = RecordTokenizer::new("x");
        assert_eq!(t.next_i64(), Err(TokenError::Malformed("x".to_owned())));
    }

    #[test]
    fn test_narrowing() {
        let mut t = RecordTokenizer::new("4294967296");
        assert!(matches!(t.next_i32(), Err(TokenError::Malformed(_))));
        let mut t = RecordTokenizer::new("-1");
        assert!(matches!(t.next_u32(), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn test_peek_tag() {
        let mut t = RecordTokenizer::new("7 99999");
        assert_eq!(t.peek_tag(), Ok(7));
        assert_eq!(t.peek_tag(), Ok(7));
        assert_eq!(t.next_i64(), Ok(7));
        assert_eq!(t.next_i64(), Ok(99999));
    }

    #[test]
    fn test_rest() {
        let mut t = RecordTokenizer::new("28 100 a note with  spaces \r");
        assert_eq!(t.next_i64(), Ok(28));
        assert_eq!(t.next_i64(), Ok(100));
        assert_eq!(t.rest(), "a note with  spaces");
        assert!(t.is_empty());

        let mut t = RecordTokenizer::new("PROJECTIONS-RECORD 1");
        assert_eq!(t.count_remaining(), 2);
        assert_eq!(t.rest(), "PROJECTIONS-RECORD 1");
    }
}
