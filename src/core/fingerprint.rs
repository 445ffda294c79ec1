//! Context fingerprinting for outcome priors.
//!
//! The same failure class must map to the same fingerprint across runs, so
//! the signature is normalized before hashing: digits collapse, hex addresses
//! collapse, and paths are reduced to their final segment. Prior lookup uses
//! exact fingerprint match only; fuzzy retrieval is out of scope.

use sha2::{Digest, Sha256};

/// Fixed fingerprint over a normalized failure signature and language tag.
pub fn context_fingerprint(failure_signature: &str, language: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_signature(failure_signature).as_bytes());
    hasher.update(b"\n");
    hasher.update(language.as_bytes());
    hex::encode(hasher.finalize())
}

/// Collapse run-specific noise out of a failure signature.
pub fn normalize_signature(signature: &str) -> String {
    let mut lines = Vec::new();
    for line in signature.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<String> = line.split_whitespace().map(normalize_token).collect();
        lines.push(tokens.join(" "));
    }
    lines.join("\n")
}

fn normalize_token(token: &str) -> String {
    if token.starts_with("0x") {
        return "0xADDR".to_string();
    }
    // Paths vary by checkout location; keep only the file name. Digit runs
    // collapse to one marker so `lib.rs:42` and `lib.rs:977` agree.
    let tail = token.rsplit('/').next().unwrap_or(token);
    let mut out = String::with_capacity(tail.len());
    let mut in_digits = false;
    for c in tail.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('0');
                in_digits = true;
            }
        } else {
            in_digits = false;
            out.push(c);
        }
    }
    out
}
