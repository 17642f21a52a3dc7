// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Errors raised while decoding or encoding a trace carrier.
//!
//! These never leave the propagation layer: a failed extraction is logged and treated as "no
//! predecessor", a failed injection leaves the carrier without that style's entries.

use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("Cannot {} from {}, {}", operation, message, propagator_name)]
pub struct Error {
    message: &'static str,
    propagator_name: &'static str,
    operation: &'static str,
}

impl Error {
    #[must_use]
    pub fn extract(message: &'static str, propagator_name: &'static str) -> Self {
        Self {
            message,
            propagator_name,
            operation: "extract",
        }
    }

    #[must_use]
    pub fn inject(message: &'static str, propagator_name: &'static str) -> Self {
        Self {
            message,
            propagator_name,
            operation: "inject",
        }
    }
}
