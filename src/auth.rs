//! Bearer-token authentication for the request server.
//!
//! Tokens come from a configured whitelist. Comparison is constant-time in
//! the token bytes so response timing leaks nothing about how much of a
//! key matched; only the fixed format (prefix + length) is checked with an
//! early exit, since the format itself is public.

use subtle::ConstantTimeEq;

use crate::config::{key_format_valid, Config};
use crate::error::{Error, Result};

pub struct ApiKeys {
    keys: Vec<String>,
}

impl ApiKeys {
    pub fn new(config: &Config) -> Self {
        Self {
            keys: config.api_keys.clone(),
        }
    }

    /// Verify an `Authorization` header value against the whitelist.
    pub fn verify(&self, header: Option<&str>) -> Result<()> {
        let Some(header) = header else {
            return Err(Error::AuthClient);
        };
        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();

        // Quick rejection on the public key format; this leaks nothing
        // about the whitelist.
        if !key_format_valid(token) {
            return Err(Error::AuthClient);
        }

        // Compare against every configured key without early exit.
        let token_bytes = token.as_bytes();
        let mut matched = 0u8;
        for key in &self.keys {
            let key_bytes = key.as_bytes();
            if key_bytes.len() == token_bytes.len() {
                matched |= token_bytes.ct_eq(key_bytes).unwrap_u8();
            }
        }

        if matched == 1 {
            Ok(())
        } else {
            Err(Error::AuthClient)
        }
    }
}
