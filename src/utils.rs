use anyhow::{Context, Result};
use base64::prelude::*;

/// Decodes base64url, tolerating trailing padding.
pub fn decode_base64url(value: &str, what: &str) -> Result<Vec<u8>> {
    BASE64_URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .with_context(|| format!("'{what}' was not valid base64url"))
}

pub fn encode_base64url(bytes: impl AsRef<[u8]>) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

/// String utilities for parsing and displaying humanly readable values.
pub fn to_human_readable_string(value: impl Into<String>) -> String {
    value
        .into()
        .chars()
        .fold(String::new(), |mut acc, c| {
            // Convert camelCase to space-separated words with capitalized first letter.
            if c.is_uppercase() {
                acc.push(' ');
            }

            // Check if the field is snake_case and convert to
            // space-separated words with capitalized first letter.
            if c == '_' {
                acc.push(' ');
                return acc;
            }

            acc.push(c);
            acc
        })
        .split(' ')
        .filter(|word| !word.is_empty())
        .fold(String::new(), |desc, word| {
            let word = word
                .chars()
                .enumerate()
                .fold(String::new(), |mut acc, (i, c)| {
                    if i == 0 {
                        if let Some(c) = c.to_uppercase().next() {
                            acc.push(c);
                            return acc;
                        }
                    }
                    acc.push(c);
                    acc
                });

            format!("{desc} {word}")
        })
        .trim()
        .to_string()
}
