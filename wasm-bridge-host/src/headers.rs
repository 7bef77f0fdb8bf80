//! Header-map transfer
//!
//! Hosts hand over bulk header reads as a [`KvList`]; inside the bridge
//! headers are plain ordered [`Pairs`]. Plugins receive pairs in the
//! proxy-wasm serialized layout produced by [`encode_pairs`].

use wasm_bridge_api::{HeaderMapType, HostError, HostResult, KvList, Pairs};

/// Drain a host list into ordered pairs
///
/// The list is walked once to size the result and once to move the pairs
/// out; it is consumed either way.
pub fn collect_pairs(list: KvList) -> Pairs {
    let mut pairs = Vec::with_capacity(list.len());
    pairs.extend(list);
    pairs
}

/// Serialize pairs for a plugin
///
/// Layout: pair count, then `(key_len, value_len)` per pair, then each key
/// and value followed by a NUL byte. Integers are little-endian u32.
pub fn encode_pairs(pairs: &[(String, String)]) -> Vec<u8> {
    let data_len: usize = pairs.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
    let mut out = Vec::with_capacity(4 + pairs.len() * 8 + data_len);
    out.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for (k, v) in pairs {
        out.extend_from_slice(&(k.len() as u32).to_le_bytes());
        out.extend_from_slice(&(v.len() as u32).to_le_bytes());
    }
    for (k, v) in pairs {
        out.extend_from_slice(k.as_bytes());
        out.push(0);
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
    out
}

/// Header sets attached to a context for the current traffic unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSnapshot {
    inbound: Pairs,
    outbound: Pairs,
    forward_direction: bool,
}

impl HeaderSnapshot {
    /// Replace one side; the direction flag always follows the latest call
    pub fn set(&mut self, pairs: Pairs, forward: bool, inbound: bool) {
        if inbound {
            self.inbound = pairs;
        } else {
            self.outbound = pairs;
        }
        self.forward_direction = forward;
    }

    pub fn inbound(&self) -> &Pairs {
        &self.inbound
    }

    pub fn outbound(&self) -> &Pairs {
        &self.outbound
    }

    pub fn forward_direction(&self) -> bool {
        self.forward_direction
    }

    /// Inbound set backing `map`, if the map is live for this direction
    pub fn live(&self, map: HeaderMapType) -> Option<&Pairs> {
        let backs = match map {
            HeaderMapType::RequestHeaders => self.forward_direction,
            HeaderMapType::ResponseHeaders => !self.forward_direction,
            _ => false,
        };
        (backs && !self.inbound.is_empty()).then_some(&self.inbound)
    }

    /// First value for `key` in the live set of `map`
    ///
    /// `None` when the map has no live set; `NotFound` when it has one but
    /// the key is absent.
    pub fn value(&self, map: HeaderMapType, key: &str) -> Option<HostResult<String>> {
        self.live(map).map(|pairs| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .ok_or(HostError::NotFound)
        })
    }

    /// Append to the live set of `map`; `false` when no live set exists
    pub fn append(&mut self, map: HeaderMapType, key: &str, value: &str) -> bool {
        if self.live(map).is_none() {
            return false;
        }
        self.inbound.push((key.to_string(), value.to_string()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of [`encode_pairs`]
    fn decode_pairs(bytes: &[u8]) -> HostResult<Pairs> {
        fn read_u32(bytes: &[u8], at: usize) -> HostResult<usize> {
            let raw = bytes
                .get(at..at + 4)
                .ok_or(HostError::ParseFailure)?
                .try_into()
                .map_err(|_| HostError::ParseFailure)?;
            Ok(u32::from_le_bytes(raw) as usize)
        }
        fn read_str(bytes: &[u8], at: usize, len: usize) -> HostResult<String> {
            let raw = bytes.get(at..at + len).ok_or(HostError::ParseFailure)?;
            if bytes.get(at + len) != Some(&0) {
                return Err(HostError::ParseFailure);
            }
            String::from_utf8(raw.to_vec()).map_err(|_| HostError::ParseFailure)
        }

        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let count = read_u32(bytes, 0)?;
        let mut sizes = Vec::with_capacity(count.min(bytes.len() / 8));
        for i in 0..count {
            let at = 4 + i * 8;
            sizes.push((read_u32(bytes, at)?, read_u32(bytes, at + 4)?));
        }
        let mut at = 4 + count * 8;
        let mut pairs = Vec::with_capacity(sizes.len());
        for (klen, vlen) in sizes {
            let key = read_str(bytes, at, klen)?;
            at += klen + 1;
            let value = read_str(bytes, at, vlen)?;
            at += vlen + 1;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    fn pairs(items: &[(&str, &str)]) -> Pairs {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_collect_pairs_keeps_order() {
        let list: KvList = vec![("User-Agent", "Shell"), ("k1", "v1")]
            .into_iter()
            .collect();
        assert_eq!(
            collect_pairs(list),
            pairs(&[("User-Agent", "Shell"), ("k1", "v1")])
        );
        assert!(collect_pairs(KvList::new()).is_empty());
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode_pairs(&pairs(&[("a", "bc")]));
        assert_eq!(
            bytes,
            vec![1, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, b'a', 0, b'b', b'c', 0]
        );
        assert_eq!(encode_pairs(&[]), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let mut bytes = encode_pairs(&pairs(&[("key", "value")]));
        bytes.truncate(bytes.len() - 2);
        assert_eq!(decode_pairs(&bytes), Err(HostError::ParseFailure));
        assert_eq!(decode_pairs(&[]), Ok(Vec::new()));
    }

    #[test]
    fn test_decode_reads_encoded_headers() {
        let original = pairs(&[(":method", "GET"), ("k1", ""), ("User-Agent", "Shell")]);
        assert_eq!(decode_pairs(&encode_pairs(&original)), Ok(original));
    }

    #[test]
    fn test_snapshot_direction_selects_live_map() {
        let mut snap = HeaderSnapshot::default();
        snap.set(pairs(&[("k1", "v1")]), true, true);
        assert!(snap.live(HeaderMapType::RequestHeaders).is_some());
        assert!(snap.live(HeaderMapType::ResponseHeaders).is_none());
        assert!(snap.live(HeaderMapType::RequestTrailers).is_none());

        snap.set(pairs(&[("k2", "v2")]), false, true);
        assert!(snap.live(HeaderMapType::RequestHeaders).is_none());
        assert_eq!(
            snap.value(HeaderMapType::ResponseHeaders, "k2"),
            Some(Ok("v2".to_string()))
        );
        assert_eq!(
            snap.value(HeaderMapType::ResponseHeaders, "k1"),
            Some(Err(HostError::NotFound))
        );
    }

    #[test]
    fn test_snapshot_empty_inbound_is_not_live() {
        let mut snap = HeaderSnapshot::default();
        snap.set(pairs(&[("out", "1")]), true, false);
        assert_eq!(snap.outbound().len(), 1);
        assert!(snap.live(HeaderMapType::RequestHeaders).is_none());
        assert!(!snap.append(HeaderMapType::RequestHeaders, "k", "v"));
    }

    #[test]
    fn test_snapshot_append() {
        let mut snap = HeaderSnapshot::default();
        snap.set(pairs(&[("k1", "v1")]), true, true);
        assert!(snap.append(HeaderMapType::RequestHeaders, "k2", "v2"));
        assert_eq!(snap.inbound(), &pairs(&[("k1", "v1"), ("k2", "v2")]));
    }
}
