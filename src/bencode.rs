//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode is the serialization format used throughout BitTorrent for
//! `.torrent` files and the extension protocol.
//!
//! # Data Types
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte String | `<length>:<data>` | `4:spam` → "spam" |
//! | List | `l<items>e` | `l4:spami42ee` → ["spam", 42] |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` → {"foo": "bar"} |
//!
//! Dictionaries keep the order their keys appeared in, so
//! `encode(decode(x)) == x` for any well-formed input.
//!
//! # Examples
//!
//! ```
//! use swarmbit::bencode::{decode, encode, parse, ParseMode, Value};
//!
//! let value = decode(b"l4:spami42ee").unwrap();
//! assert_eq!(value.as_list().unwrap().len(), 2);
//! assert_eq!(encode(&value).unwrap(), b"l4:spami42ee");
//!
//! // Lenient parsing keeps whatever was valid before the first bad element.
//! let parsed = parse(b"li1ei02ee", ParseMode::Lenient).unwrap();
//! assert_eq!(parsed.value, Value::List(vec![Value::Integer(1)]));
//! ```
//!
//! # Error Handling
//!
//! - [`BencodeError::UnexpectedEof`] - Input ended unexpectedly
//! - [`BencodeError::InvalidInteger`] - Malformed integer (leading zeros, `-0`, sign)
//! - [`BencodeError::MissingSeparator`] - String length not followed by `:`
//! - [`BencodeError::NestingTooDeep`] - Recursion limit exceeded (max 64 levels)
//! - [`BencodeError::TrailingData`] - Extra data after the value (strict mode)
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix, parse, ParseMode, Parsed};
pub use encode::encode;
pub use error::BencodeError;
pub use value::{Dict, Value};
