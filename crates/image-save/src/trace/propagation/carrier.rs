// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Carrier traits for trace context propagation.
//!
//! A carrier is whatever flat string map crosses the process boundary. Here that is the `trace`
//! object embedded in a task message, decoded into a `HashMap`.
//!
//! Keys are case-insensitive and stored lowercased.

use std::collections::HashMap;

/// Writes trace context entries into a carrier.
pub trait Injector {
    /// Sets `key` (lowercased) to `value`.
    fn set(&mut self, key: &str, value: String);
}

/// Reads trace context entries from a carrier.
pub trait Extractor {
    /// Case-insensitive lookup.
    fn get(&self, key: &str) -> Option<&str>;

    /// All keys, in their stored (lowercase) form.
    fn keys(&self) -> Vec<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect::<Vec<_>>()
    }
}
