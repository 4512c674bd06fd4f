use super::error::MetainfoError;
use super::info_hash::InfoHash;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::debug;

/// Characters left unescaped in magnet query values (RFC 3986 unreserved).
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A parsed `magnet:` URI.
///
/// # Examples
///
/// ```
/// use swarmbit::metainfo::MagnetLink;
///
/// let magnet = MagnetLink::parse(
///     "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a\
///      &dn=Example%20File&tr=udp%3A%2F%2Ftracker.example.com%3A6969&x.pe=10.0.0.1:6881",
/// )
/// .unwrap();
/// assert_eq!(magnet.display_name.as_deref(), Some("Example File"));
/// assert_eq!(magnet.trackers, vec!["udp://tracker.example.com:6969"]);
/// assert_eq!(magnet.peers.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    /// Peer address hints from `x.pe` parameters.
    pub peers: Vec<SocketAddr>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self, MetainfoError> {
        let query = uri.strip_prefix("magnet:?").ok_or_else(|| {
            MetainfoError::InvalidMagnetLink("missing magnet:? prefix".into())
        })?;
        let params = parse_query_string(query);

        let xt = params
            .get("xt")
            .and_then(|v| v.first())
            .ok_or_else(|| MetainfoError::InvalidMagnetLink("missing xt parameter".into()))?;

        let info_hash = parse_exact_topic(xt)?;

        let display_name = params.get("dn").and_then(|v| v.first()).cloned();

        let mut trackers: Vec<String> = Vec::new();
        for tracker in params.get("tr").into_iter().flatten() {
            if !trackers.contains(tracker) {
                trackers.push(tracker.clone());
            }
        }

        let peers = params
            .get("x.pe")
            .into_iter()
            .flatten()
            .filter_map(|hint| match hint.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    debug!(hint = %hint, "skipping unparsable peer hint");
                    None
                }
            })
            .collect();

        Ok(Self {
            info_hash,
            display_name,
            trackers,
            peers,
        })
    }

    pub fn to_uri(&self) -> String {
        let mut uri = String::from("magnet:?");

        let hash_str = match &self.info_hash {
            InfoHash::V1(_) => format!("urn:btih:{}", self.info_hash.to_hex()),
            InfoHash::V2(_) => format!("urn:btmh:1220{}", self.info_hash.to_hex()),
        };
        uri.push_str(&format!("xt={}", hash_str));

        if let Some(ref name) = self.display_name {
            uri.push_str(&format!("&dn={}", utf8_percent_encode(name, QUERY_VALUE)));
        }

        for tracker in &self.trackers {
            uri.push_str(&format!("&tr={}", utf8_percent_encode(tracker, QUERY_VALUE)));
        }

        for peer in &self.peers {
            uri.push_str(&format!("&x.pe={}", peer));
        }

        uri
    }
}

fn parse_exact_topic(xt: &str) -> Result<InfoHash, MetainfoError> {
    if let Some(hash) = xt.strip_prefix("urn:btih:") {
        match hash.len() {
            40 => InfoHash::from_hex(hash),
            32 => {
                let decoded = base32_decode(hash)
                    .ok_or_else(|| MetainfoError::InvalidMagnetLink("invalid base32".into()))?;
                InfoHash::from_v1_bytes(&decoded)
            }
            _ => Err(MetainfoError::InvalidMagnetLink(
                "invalid info hash length".into(),
            )),
        }
    } else if let Some(hash) = xt.strip_prefix("urn:btmh:1220") {
        let bytes = hex::decode(hash)
            .map_err(|_| MetainfoError::InvalidMagnetLink("invalid multihash".into()))?;
        InfoHash::from_v2_bytes(&bytes)
    } else {
        Err(MetainfoError::InvalidMagnetLink(
            "unsupported xt format".into(),
        ))
    }
}

/// Splits a query string into decoded values grouped by key, in order of
/// appearance.
fn parse_query_string(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();

    for part in query.split('&') {
        if let Some((key, value)) = part.split_once('=') {
            let value = value.replace('+', " ");
            params
                .entry(key.to_string())
                .or_default()
                .push(percent_decode_str(&value).decode_utf8_lossy().into_owned());
        }
    }

    params
}

fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let input = input.to_uppercase();
    let input = input.trim_end_matches('=');

    let mut output = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits_in_buffer = 0;

    for c in input.bytes() {
        let value = ALPHABET.iter().position(|&x| x == c)? as u64;
        buffer = (buffer << 5) | value;
        bits_in_buffer += 5;

        if bits_in_buffer >= 8 {
            bits_in_buffer -= 8;
            output.push((buffer >> bits_in_buffer) as u8);
            buffer &= (1 << bits_in_buffer) - 1;
        }
    }

    Some(output)
}
