//! Vault key codec: a bijection between `(inode, relative path)` and a
//! hardlink path under a vault branch.
//!
//! The key has the literal shape `AA/BB/CC-B64(p)`, where `AA`, `BB`, … are
//! the big-endian hex byte-words of the inode (all but the last forming a
//! directory hierarchy, the last fused with a `-` onto the base64-encoded
//! path to form the leaf file name). This gives O(1) lookup by inode without
//! a directory walk, bounds directory fan-out to 256 entries, and keeps
//! enough of the original path around to support rename recovery.
//!
//! When `base64(p)` would make the leaf name exceed the target filesystem's
//! `NAME_MAX`, the encoding is chunked: the last inode byte becomes its own
//! directory (named `CC-`, which is how a decoder tells the two shapes
//! apart), and the base64 string is split into `NAME_MAX`-sized pieces, all
//! but the last promoted to nested directories.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::KeyError;

/// Default `NAME_MAX` to assume when it cannot be queried from the target
/// filesystem (e.g. in tests against an in-memory path). Real deployments
/// must query it from the mount (see [`name_max_for`]).
pub const DEFAULT_NAME_MAX: usize = 255;

/// Queries the maximum file name length for the filesystem containing
/// `path`, falling back to [`DEFAULT_NAME_MAX`] if the platform can't tell
/// us (e.g. the path doesn't exist yet).
pub fn name_max_for(path: &Path) -> usize {
    match nix::unistd::pathconf(path, nix::unistd::PathconfVar::NAME_MAX) {
        Ok(Some(limit)) if limit > 0 => limit as usize,
        _ => DEFAULT_NAME_MAX,
    }
}

/// Minimal big-endian byte representation of an inode number: at least one
/// byte, with leading zero bytes dropped so the directory hierarchy scales
/// with the size of the inode space actually in use.
fn inode_bytes(inode: u64) -> Vec<u8> {
    let full = inode.to_be_bytes();
    let first_nonzero = full.iter().position(|&b| b != 0).unwrap_or(full.len() - 1);
    full[first_nonzero..].to_vec()
}

fn bytes_to_inode(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let offset = 8 - bytes.len();
    buf[offset..].copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

/// Splits an inode into the directory-hierarchy bytes and the LSB byte used
/// to derive the fixed-depth prefix directory that [`crate::vault`] descends
/// into for O(1) lookup-by-inode (the leaf itself still depends on the
/// relative path, which a pure inode lookup doesn't have).
pub fn split_inode(inode: u64) -> (PathBuf, u8) {
    let bytes = inode_bytes(inode);
    let (dir_bytes, lsb) = bytes.split_at(bytes.len() - 1);
    let mut prefix = PathBuf::new();
    for b in dir_bytes {
        prefix.push(format!("{b:02X}"));
    }
    (prefix, lsb[0])
}

/// Encodes `(inode, relpath)` into a vault key, splitting the encoding into
/// `name_max`-sized chunks if needed. `relpath` is the path relative to the
/// vault root, as raw bytes (not necessarily valid UTF-8).
pub fn encode(inode: u64, relpath: &[u8], name_max: usize) -> PathBuf {
    let bytes = inode_bytes(inode);
    let (dir_bytes, lsb) = bytes.split_at(bytes.len() - 1);
    let lsb = lsb[0];

    let mut out = PathBuf::new();
    for b in dir_bytes {
        out.push(format!("{b:02X}"));
    }

    let encoded = URL_SAFE_NO_PAD.encode(relpath);
    let leaf_budget = name_max.saturating_sub(3);

    if encoded.len() <= leaf_budget {
        out.push(format!("{lsb:02X}-{encoded}"));
        return out;
    }

    // Long-name path: the LSB gets its own directory (trailing dash marks it
    // as such to the decoder), then the base64 string is chunked.
    out.push(format!("{lsb:02X}-"));
    let chunk_size = name_max;
    let chunk_bytes = encoded.as_bytes();
    let mut offset = 0;
    while offset < chunk_bytes.len() {
        let end = (offset + chunk_size).min(chunk_bytes.len());
        // str is ASCII (base64 alphabet), so byte slicing is always char-aligned.
        out.push(std::str::from_utf8(&chunk_bytes[offset..end]).expect("base64 is ASCII"));
        offset = end;
    }
    out
}

/// Decodes a vault key back into `(inode, relpath)`. Total for any key
/// produced by [`encode`]; fails with [`KeyError::MalformedKey`] for
/// anything else.
pub fn decode(key: &Path) -> Result<(u64, Vec<u8>), KeyError> {
    let malformed = || KeyError::MalformedKey(key.to_path_buf());

    let components: Vec<&str> = key
        .components()
        .map(|c| c.as_os_str().to_str().ok_or_else(malformed))
        .collect::<Result<_, _>>()?;
    if components.is_empty() {
        return Err(malformed());
    }

    let mut inode_dir_bytes = Vec::new();
    let mut idx = 0;
    while idx < components.len() {
        let comp = components[idx];
        if comp.len() == 2 && comp.bytes().all(|b| b.is_ascii_hexdigit()) {
            inode_dir_bytes.push(u8::from_str_radix(comp, 16).map_err(|_| malformed())?);
            idx += 1;
        } else {
            break;
        }
    }
    // The component at `idx` must carry the LSB marker: "XX-" (directory,
    // chunked form) or "XX-<data>" (leaf, short form). Either way it is the
    // component that actually determines the LSB byte.
    let marker = components.get(idx).ok_or_else(malformed)?;
    if marker.len() < 3 || !marker.as_bytes()[0..2].iter().all(u8::is_ascii_hexdigit) {
        return Err(malformed());
    }
    if marker.as_bytes()[2] != b'-' {
        return Err(malformed());
    }
    let lsb = u8::from_str_radix(&marker[0..2], 16).map_err(|_| malformed())?;
    let suffix = &marker[3..];

    let b64 = if marker.len() == 3 {
        // Chunked form: everything after this directory is literal chunks.
        if idx + 1 >= components.len() {
            return Err(malformed());
        }
        components[idx + 1..].concat()
    } else {
        // Short form: this must be the final component.
        if idx != components.len() - 1 {
            return Err(malformed());
        }
        suffix.to_string()
    };

    inode_dir_bytes.push(lsb);
    let inode = bytes_to_inode(&inode_dir_bytes);
    let relpath = URL_SAFE_NO_PAD.decode(b64.as_bytes()).map_err(|_| malformed())?;
    Ok((inode, relpath))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_short_form() {
        for inode in [1u64, 255, 256, 65535, 65536, u64::MAX] {
            let path = b"projects/alice/report.csv";
            let key = encode(inode, path, DEFAULT_NAME_MAX);
            let (decoded_inode, decoded_path) = decode(&key).unwrap();
            assert_eq!(decoded_inode, inode);
            assert_eq!(decoded_path, path);
        }
    }

    #[test]
    fn round_trips_chunked_form() {
        let long_name = "a".repeat(1000);
        let relpath = format!("deeply/nested/{long_name}.bin");
        let key = encode(424242, relpath.as_bytes(), 255);
        // Expect more than the 3 short-form components (>=2 dirs + chunks).
        assert!(key.components().count() > 3);
        let (inode, decoded) = decode(&key).unwrap();
        assert_eq!(inode, 424242);
        assert_eq!(decoded, relpath.as_bytes());
    }

    #[test]
    fn small_inode_has_no_directory_prefix() {
        let key = encode(5, b"x", DEFAULT_NAME_MAX);
        assert_eq!(key.components().count(), 1);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(decode(Path::new("not-a-key")).is_err());
        assert!(decode(Path::new("AA/ZZ")).is_err());
        assert!(decode(Path::new("")).is_err());
    }

    #[test]
    fn keys_compare_equal_iff_pairs_do() {
        let a = encode(10, b"same", DEFAULT_NAME_MAX);
        let b = encode(10, b"same", DEFAULT_NAME_MAX);
        let c = encode(10, b"different", DEFAULT_NAME_MAX);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
