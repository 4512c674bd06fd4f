use super::error::BencodeError;
use super::value::{Dict, Value};
use bytes::Bytes;
use std::ops::Range;

const MAX_DEPTH: usize = 64;

/// How the parser reacts to malformed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Any deviation from the grammar is an error, as are trailing bytes.
    #[default]
    Strict,
    /// Stop at the first malformed element inside a collection and return
    /// what was built up to that point. Trailing bytes are ignored.
    Lenient,
}

/// The result of [`parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub value: Value,
    /// Byte range of the value stored under the first `info` key of the
    /// top-level dictionary, if there is one.
    pub info_span: Option<Range<usize>>,
    /// Number of input bytes consumed.
    pub consumed: usize,
}

/// Parses one bencoded value.
///
/// # Examples
///
/// ```
/// use swarmbit::bencode::{parse, ParseMode};
///
/// let data = b"d4:infod4:name3:abce3:foo3:bare";
/// let parsed = parse(data, ParseMode::Strict).unwrap();
/// assert_eq!(&data[parsed.info_span.unwrap()], b"d4:name3:abce");
/// ```
pub fn parse(data: &[u8], mode: ParseMode) -> Result<Parsed, BencodeError> {
    let mut decoder = Decoder::new(data, mode);
    let value = decoder.decode_value(0)?;

    if mode == ParseMode::Strict && decoder.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(Parsed {
        value,
        info_span: decoder.info_span,
        consumed: decoder.pos,
    })
}

/// Strictly decodes a complete bencoded value.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    parse(data, ParseMode::Strict).map(|parsed| parsed.value)
}

/// Strictly decodes one value at the start of `data`, returning it along
/// with the number of bytes it occupied. Anything after it is left alone.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut decoder = Decoder::new(data, ParseMode::Strict);
    let value = decoder.decode_value(0)?;
    Ok((value, decoder.pos))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    mode: ParseMode,
    halted: bool,
    info_span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8], mode: ParseMode) -> Self {
        Self {
            data,
            pos: 0,
            mode,
            halted: false,
            info_span: None,
        }
    }

    fn lenient(&self) -> bool {
        self.mode == ParseMode::Lenient
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn decode_value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek() {
            None => Err(BencodeError::UnexpectedEof),
            Some(b'i') => self.decode_integer(),
            Some(b'l') => self.decode_list(depth),
            Some(b'd') => self.decode_dict(depth),
            Some(b'0'..=b'9') => self.decode_bytes().map(Value::Bytes),
            Some(c) => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    fn decode_integer(&mut self) -> Result<Value, BencodeError> {
        let start = self.pos + 1;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == b'e')
            .map(|i| start + i)
            .ok_or(BencodeError::UnexpectedEof)?;

        let digits = &self.data[start..end];
        let (negative, magnitude) = match digits.split_first() {
            Some((b'-', rest)) => (true, rest),
            _ => (false, digits),
        };

        if magnitude.is_empty() {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }
        if !magnitude.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::InvalidInteger(
                String::from_utf8_lossy(digits).into_owned(),
            ));
        }
        if magnitude[0] == b'0' && (negative || magnitude.len() > 1) {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }

        // The slice is ASCII digits with an optional '-', so it is valid UTF-8.
        let text = std::str::from_utf8(digits)
            .map_err(|_| BencodeError::InvalidInteger("invalid utf8".into()))?;
        let value: i64 = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(text.into()))?;

        self.pos = end + 1;
        Ok(Value::Integer(value))
    }

    fn decode_bytes(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        let digits_end = self.data[start..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .map(|i| start + i)
            .ok_or(BencodeError::UnexpectedEof)?;

        if self.data[digits_end] != b':' {
            return Err(BencodeError::MissingSeparator);
        }

        let len: usize = std::str::from_utf8(&self.data[start..digits_end])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;

        let body = digits_end + 1;
        let end = body
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;

        self.pos = end;
        Ok(Bytes::copy_from_slice(&self.data[body..end]))
    }

    /// Handles an element failure inside a collection: strict mode propagates
    /// it, lenient mode marks the decoder halted so every enclosing
    /// collection stops where it is.
    fn element_failed(&mut self, err: BencodeError) -> Result<(), BencodeError> {
        if self.lenient() {
            self.halted = true;
            Ok(())
        } else {
            Err(err)
        }
    }

    fn decode_list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut list = Vec::new();

        while !self.halted {
            match self.peek() {
                None => {
                    self.element_failed(BencodeError::UnexpectedEof)?;
                }
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => match self.decode_value(depth + 1) {
                    Ok(value) => list.push(value),
                    Err(err) => self.element_failed(err)?,
                },
            }
        }

        Ok(Value::List(list))
    }

    fn decode_dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = Dict::new();

        while !self.halted {
            let key = match self.peek() {
                None => {
                    self.element_failed(BencodeError::UnexpectedEof)?;
                    break;
                }
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(b'0'..=b'9') => match self.decode_bytes() {
                    Ok(key) => key,
                    Err(err) => {
                        self.element_failed(err)?;
                        break;
                    }
                },
                Some(_) => {
                    self.element_failed(BencodeError::NonStringKey)?;
                    break;
                }
            };

            let value_start = self.pos;
            match self.decode_value(depth + 1) {
                Ok(value) => {
                    if depth == 0
                        && !self.halted
                        && self.info_span.is_none()
                        && key.as_ref() == b"info"
                    {
                        self.info_span = Some(value_start..self.pos);
                    }
                    dict.insert(key, value);
                }
                Err(err) => self.element_failed(err)?,
            }
        }

        Ok(Value::Dict(dict))
    }
}
