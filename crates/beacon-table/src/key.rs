//! Byte layout of table keys.

/// Terminates every encoded index field.
pub(crate) const SEPARATOR: u8 = 0x00;

const META_TAG: u8 = 0x00;
const ROW_TAG: u8 = 0x01;
const INDEX_TAG: u8 = 0x02;

const ROW_ID_LEN: usize = 8;

pub(crate) fn meta_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(META_TAG);
    key.extend_from_slice(name.as_bytes());
    key
}

pub(crate) fn row_key(row_id: u64) -> [u8; 1 + ROW_ID_LEN] {
    let mut key = [0u8; 1 + ROW_ID_LEN];
    key[0] = ROW_TAG;
    key[1..].copy_from_slice(&row_id.to_be_bytes());
    key
}

/// Prefix shared by every row key.
pub(crate) fn row_space() -> [u8; 1] {
    [ROW_TAG]
}

pub(crate) fn row_id_of_row_key(key: &[u8]) -> Option<u64> {
    if key.len() != 1 + ROW_ID_LEN || key[0] != ROW_TAG {
        return None;
    }
    let mut id = [0u8; ROW_ID_LEN];
    id.copy_from_slice(&key[1..]);
    Some(u64::from_be_bytes(id))
}

/// Prefix shared by every entry of one index.
pub(crate) fn index_space(ordinal: u8) -> Vec<u8> {
    vec![INDEX_TAG, ordinal]
}

/// Appends `field` followed by the separator.
pub(crate) fn push_field(buf: &mut Vec<u8>, field: &str) {
    buf.extend_from_slice(field.as_bytes());
    buf.push(SEPARATOR);
}

pub(crate) fn index_entry(prefix: &[u8], row_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + ROW_ID_LEN);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&row_id.to_be_bytes());
    key
}

/// Row-id stored in the trailing bytes of an index entry.
pub(crate) fn row_id_of_entry(key: &[u8]) -> Option<u64> {
    let split = key.len().checked_sub(ROW_ID_LEN)?;
    let mut id = [0u8; ROW_ID_LEN];
    id.copy_from_slice(&key[split..]);
    Some(u64::from_be_bytes(id))
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when no such key exists (prefix of all `0xFF`).
pub(crate) fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
