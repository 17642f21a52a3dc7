// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Carrier formats the codec can read and write.
//!
//! Configured as a comma-separated list (`TRACE_PROPAGATION_STYLE=datadog,tracecontext`). The
//! order matters for extraction: the first style that yields a context becomes the primary one.

use std::{fmt::Display, str::FromStr};

use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TracePropagationStyle {
    /// `x-datadog-*` entries.
    Datadog,
    /// W3C `traceparent` / `tracestate`.
    TraceContext,
    /// Propagation disabled.
    None,
}

/// Unknown styles are logged and mapped to `None` so a bad setting never blocks startup.
impl FromStr for TracePropagationStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "datadog" => Ok(TracePropagationStyle::Datadog),
            "tracecontext" => Ok(TracePropagationStyle::TraceContext),
            "none" => Ok(TracePropagationStyle::None),
            _ => {
                error!("Trace propagation style is invalid: {:?}, using None", s);
                Ok(TracePropagationStyle::None)
            }
        }
    }
}

impl Display for TracePropagationStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let style = match self {
            TracePropagationStyle::Datadog => "datadog",
            TracePropagationStyle::TraceContext => "tracecontext",
            TracePropagationStyle::None => "none",
        };
        write!(f, "{style}")
    }
}

/// Parses `"datadog, tracecontext"` into `[Datadog, TraceContext]`, skipping empty items.
#[must_use]
pub fn parse_styles(value: &str) -> Vec<TracePropagationStyle> {
    value
        .split(',')
        .map(str::trim)
        .filter(|style| !style.is_empty())
        .filter_map(|style| TracePropagationStyle::from_str(style).ok())
        .collect()
}

/// Default extraction/injection order.
#[must_use]
pub fn default_styles() -> Vec<TracePropagationStyle> {
    vec![
        TracePropagationStyle::Datadog,
        TracePropagationStyle::TraceContext,
    ]
}
