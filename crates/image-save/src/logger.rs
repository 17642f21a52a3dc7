// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Console log format shared by the receiver and processor binaries.
//!
//! ```text
//! IMAGE_SAVE | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! ```text
//! IMAGE_SAVE | INFO | Queued task for http://example.com/a.png on tasks (traced: true)
//! IMAGE_SAVE | ERROR | Failed to save http://example.com/missing.png: Fetching ... returned status 404
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::{
    fmt::{
        format::{self, FormatEvent, FormatFields},
        FmtContext, FormattedFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    EnvFilter,
};

use crate::log_shipper::LogShipperLayer;

pub const LOG_PREFIX: &str = "IMAGE_SAVE";

/// Installs the global subscriber: console output in [`Formatter`] format, plus the log shipper
/// when one is given. `env_filter` applies to both.
pub fn init(
    env_filter: &str,
    shipper: Option<LogShipperLayer>,
) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::try_new(env_filter)?)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(Formatter)
                .with_ansi(false)
                .with_writer(std::io::stdout),
        )
        .with(shipper);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "{LOG_PREFIX} | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}
