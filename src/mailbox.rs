// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Generates the opaque ids used for mailboxes and `get_random_channel_name`.
//!
//! An id is `to_base62(nanosecond timebase) || to_base62(pid) || to_base62(counter, 1 digit)
//! || to_base62(random, 1 digit)`. Encapsulated as an injectable trait so tests can supply a
//! deterministic generator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const BASE62_ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn to_base62(mut x: u64, out: &mut String, min_digits: usize) {
    let mut digits = Vec::new();
    while x > 0 {
        digits.push(BASE62_ALPHABET[(x % 62) as usize]);
        x /= 62;
    }
    while digits.len() < min_digits {
        digits.push(BASE62_ALPHABET[0]);
    }
    digits.reverse();
    out.push_str(std::str::from_utf8(&digits).expect("base62 alphabet is ascii"));
}

/// Injectable id-generation service; the default instance is process-wide (a monotonic
/// atomic counter plus the system random device).
pub trait IdGenerator: Send + Sync {
    fn generate(&self, prefix: &str) -> String;
}

pub struct DefaultIdGenerator {
    counter: AtomicU64,
}

impl DefaultIdGenerator {
    pub const fn new() -> Self {
        DefaultIdGenerator { counter: AtomicU64::new(0) }
    }
}

impl Default for DefaultIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for DefaultIdGenerator {
    fn generate(&self, prefix: &str) -> String {
        let timebase = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let pid = std::process::id() as u64;
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let random: u32 = rand::random();

        let mut out = String::with_capacity(prefix.len() + 24);
        out.push_str(prefix);
        to_base62(timebase, &mut out, 1);
        to_base62(pid, &mut out, 1);
        to_base62(counter, &mut out, 1);
        to_base62(random as u64, &mut out, 1);
        out
    }
}

/// Deterministic generator for tests: every call bumps a counter, no wall-clock or
/// randomness involved.
pub struct DeterministicIdGenerator {
    counter: AtomicU64,
}

impl DeterministicIdGenerator {
    pub const fn new() -> Self {
        DeterministicIdGenerator { counter: AtomicU64::new(0) }
    }
}

impl Default for DeterministicIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for DeterministicIdGenerator {
    fn generate(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}{n:012}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_generator_produces_unique_ids() {
        let gen = DefaultIdGenerator::new();
        let a = gen.generate("mbx_");
        let b = gen.generate("mbx_");
        assert_ne!(a, b);
        assert!(a.starts_with("mbx_"));
    }

    #[test]
    fn base62_zero_pads_to_min_digits() {
        let mut out = String::new();
        to_base62(0, &mut out, 1);
        assert_eq!(out, "0");
    }

    #[test]
    fn deterministic_generator_is_sequential() {
        let gen = DeterministicIdGenerator::new();
        assert_eq!(gen.generate("x"), "x000000000000");
        assert_eq!(gen.generate("x"), "x000000000001");
    }
}
