use sha2::{Digest, Sha256};

pub mod duration_parser;
pub mod nodereadinessevaluations;
pub mod nodereadinessrules;

/// Fits a name into `max_len` characters. Over-long names are truncated and suffixed with a hash of the
/// full name, so distinct inputs stay distinct.
pub(crate) fn bounded_name(name: String, max_len: usize) -> String {
    const HASH_LEN: usize = 10;

    if name.len() <= max_len {
        return name;
    }

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let hash: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()[..HASH_LEN]
        .to_string();

    let mut prefix = name[..max_len - HASH_LEN - 1].to_string();
    while prefix.ends_with(['.', '-']) {
        prefix.pop();
    }
    format!("{prefix}-{hash}")
}
