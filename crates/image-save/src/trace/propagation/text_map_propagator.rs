// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Text map propagators for the Datadog and W3C TraceContext formats.
//!
//! **Datadog entries:**
//! ```text
//! x-datadog-trace-id: 7277407061855694839        (low 64 bits, decimal)
//! x-datadog-parent-id: 67667974448284343
//! x-datadog-sampling-priority: 1
//! x-datadog-origin: synthetics
//! x-datadog-tags: _dd.p.dm=-1,_dd.p.tid=80f198ee56343ba8
//! ```
//!
//! **W3C entries:**
//! ```text
//! traceparent: 00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01
//! tracestate: dd=s:1;o:synthetics;p:00f067aa0ba902b7;t.dm:-1,congo=t61rcWkgMzE
//! ```
//!
//! The Datadog format only carries 64 bits of trace id in `x-datadog-trace-id`; the high half
//! rides along as the `_dd.p.tid` propagated tag.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::trace::context::{Sampling, SpanContext};
use crate::trace::propagation::{
    carrier::{Extractor, Injector},
    error::Error,
    Propagator,
};

pub const DATADOG_TRACE_ID_KEY: &str = "x-datadog-trace-id";
pub const DATADOG_PARENT_ID_KEY: &str = "x-datadog-parent-id";
pub const DATADOG_SAMPLING_PRIORITY_KEY: &str = "x-datadog-sampling-priority";
pub const DATADOG_ORIGIN_KEY: &str = "x-datadog-origin";
pub const DATADOG_TAGS_KEY: &str = "x-datadog-tags";

/// High 64 bits of the trace id, 16 hex characters.
pub const DATADOG_HIGHER_ORDER_TRACE_ID_BITS_KEY: &str = "_dd.p.tid";
const DATADOG_PROPAGATION_ERROR_KEY: &str = "_dd.propagation_error";
/// Span id of the last Datadog-aware parent, taken from `tracestate` `p:`.
pub const DATADOG_LAST_PARENT_ID_KEY: &str = "_dd.parent_id";
pub const DATADOG_SAMPLING_DECISION_KEY: &str = "_dd.p.dm";
const PROPAGATED_TAG_PREFIX: &str = "_dd.p.";

pub const TRACEPARENT_KEY: &str = "traceparent";
pub const TRACESTATE_KEY: &str = "tracestate";
const MAX_TRACESTATE_MEMBERS: usize = 32;

/// Baggage items travel as `ot-baggage-<key>`.
pub const BAGGAGE_PREFIX: &str = "ot-baggage-";

lazy_static! {
    static ref TRACEPARENT_REGEX: Regex =
        Regex::new(r"(?i)^([a-f0-9]{2})-([a-f0-9]{32})-([a-f0-9]{16})-([a-f0-9]{2})(-.*)?$")
            .expect("failed creating regex");
    static ref INVALID_SEGMENT_REGEX: Regex = Regex::new(r"^0+$").expect("failed creating regex");
    static ref VALID_TAG_KEY_REGEX: Regex =
        Regex::new(r"^_dd\.p\.[\x21-\x2b\x2d-\x3c\x3e-\x7e]+$").expect("failed creating regex");
    static ref VALID_TAG_VALUE_REGEX: Regex =
        Regex::new(r"^[\x20-\x2b\x2d-\x7e]*$").expect("failed creating regex");
    static ref INVALID_ASCII_CHARACTERS_REGEX: Regex =
        Regex::new(r"[^\x20-\x7E]+").expect("failed creating regex");
    static ref VALID_SAMPLING_DECISION_REGEX: Regex =
        Regex::new(r"^-([0-9])$").expect("failed creating regex");
}

/// Reads and writes the `x-datadog-*` entries.
#[derive(Clone, Copy)]
pub struct DatadogHeaderPropagator;

impl Propagator for DatadogHeaderPropagator {
    fn extract(&self, carrier: &dyn Extractor) -> Option<SpanContext> {
        Self::extract_context(carrier)
    }

    fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector) -> Result<(), Error> {
        Self::inject_context(context, carrier)
    }
}

impl DatadogHeaderPropagator {
    fn inject_context(context: &SpanContext, carrier: &mut dyn Injector) -> Result<(), Error> {
        if !context.is_valid() {
            return Err(Error::inject("a zero trace or span id", "datadog"));
        }

        let (trace_id_higher_order_bits, trace_id_lower_order_bits) = context.trace_id_halves();
        carrier.set(DATADOG_TRACE_ID_KEY, trace_id_lower_order_bits.to_string());
        carrier.set(DATADOG_PARENT_ID_KEY, context.span_id.to_string());

        if let Some(priority) = context.sampling.priority {
            carrier.set(DATADOG_SAMPLING_PRIORITY_KEY, priority.to_string());
        }
        if let Some(origin) = &context.origin {
            carrier.set(DATADOG_ORIGIN_KEY, origin.clone());
        }

        let mut tags = context
            .tags
            .iter()
            .filter(|(k, _)| k.as_str() != DATADOG_HIGHER_ORDER_TRACE_ID_BITS_KEY)
            .filter(|(k, v)| VALID_TAG_KEY_REGEX.is_match(k) && VALID_TAG_VALUE_REGEX.is_match(v))
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<String>>();
        if trace_id_higher_order_bits != 0 {
            tags.push(format!(
                "{DATADOG_HIGHER_ORDER_TRACE_ID_BITS_KEY}={trace_id_higher_order_bits:016x}"
            ));
        }
        tags.sort();

        if !tags.is_empty() {
            carrier.set(DATADOG_TAGS_KEY, tags.join(","));
        }

        Ok(())
    }

    fn extract_context(carrier: &dyn Extractor) -> Option<SpanContext> {
        let trace_id_lower_order_bits = match Self::extract_trace_id(carrier) {
            Ok(trace_id) => trace_id,
            Err(e) => {
                debug!("{e}");
                return None;
            }
        };

        let parent_id = match Self::extract_parent_id(carrier) {
            Ok(parent_id) => parent_id,
            Err(e) => {
                debug!("{e}");
                return None;
            }
        };
        let sampling_priority = match Self::extract_sampling_priority(carrier) {
            Ok(sampling_priority) => sampling_priority,
            Err(e) => {
                debug!("{e}");
                return None;
            }
        };
        let origin = Self::extract_origin(carrier);
        let mut tags = Self::extract_tags(carrier);
        Self::validate_sampling_decision(&mut tags);
        let trace_id_higher_order_bits = Self::take_higher_order_bits(&mut tags);

        Some(SpanContext {
            trace_id: (u128::from(trace_id_higher_order_bits) << 64)
                | u128::from(trace_id_lower_order_bits),
            span_id: parent_id,
            sampling: Sampling {
                priority: Some(sampling_priority),
                mechanism: None,
            },
            origin,
            tags,
            baggage: HashMap::new(),
            links: Vec::new(),
        })
    }

    fn validate_sampling_decision(tags: &mut HashMap<String, String>) {
        let should_remove =
            tags.get(DATADOG_SAMPLING_DECISION_KEY)
                .is_some_and(|sampling_decision| {
                    let is_invalid = !VALID_SAMPLING_DECISION_REGEX.is_match(sampling_decision);
                    if is_invalid {
                        warn!("Failed to decode `_dd.p.dm`: {}", sampling_decision);
                    }
                    is_invalid
                });

        if should_remove {
            tags.remove(DATADOG_SAMPLING_DECISION_KEY);
            tags.insert(
                DATADOG_PROPAGATION_ERROR_KEY.to_string(),
                "decoding_error".to_string(),
            );
        }
    }

    /// Moves `_dd.p.tid` out of the tags and into the trace id. A malformed value is dropped and
    /// flagged, leaving a 64-bit trace id.
    fn take_higher_order_bits(tags: &mut HashMap<String, String>) -> u64 {
        let Some(tid) = tags.remove(DATADOG_HIGHER_ORDER_TRACE_ID_BITS_KEY) else {
            return 0;
        };

        match Self::higher_order_bits(&tid) {
            Some(bits) => bits,
            None => {
                warn!("Malformed Trace ID: {tid} Failed to decode trace ID from carrier.");
                tags.insert(
                    DATADOG_PROPAGATION_ERROR_KEY.to_string(),
                    format!("malformed tid {tid}"),
                );
                0
            }
        }
    }

    fn higher_order_bits(value: &str) -> Option<u64> {
        if value.len() != 16 {
            return None;
        }
        u64::from_str_radix(value, 16).ok()
    }

    fn extract_trace_id(carrier: &dyn Extractor) -> Result<u64, Error> {
        let trace_id = carrier
            .get(DATADOG_TRACE_ID_KEY)
            .ok_or(Error::extract("`trace_id` not found", "datadog"))?;

        if INVALID_SEGMENT_REGEX.is_match(trace_id) {
            return Err(Error::extract("Invalid `trace_id` found", "datadog"));
        }

        trace_id
            .parse::<u64>()
            .map_err(|_| Error::extract("Failed to decode `trace_id`", "datadog"))
    }

    /// A context without the span that handed it off cannot be resumed.
    fn extract_parent_id(carrier: &dyn Extractor) -> Result<u64, Error> {
        let parent_id = carrier
            .get(DATADOG_PARENT_ID_KEY)
            .ok_or(Error::extract("`parent_id` not found", "datadog"))?
            .parse::<u64>()
            .map_err(|_| Error::extract("Failed to decode `parent_id`", "datadog"))?;

        if parent_id == 0 {
            return Err(Error::extract("Invalid `parent_id` found", "datadog"));
        }
        Ok(parent_id)
    }

    fn extract_sampling_priority(carrier: &dyn Extractor) -> Result<i8, Error> {
        // USER_KEEP when the sender made no decision
        let sampling_priority = carrier.get(DATADOG_SAMPLING_PRIORITY_KEY).unwrap_or("2");

        sampling_priority
            .parse::<i8>()
            .map_err(|_| Error::extract("Failed to decode `sampling_priority`", "datadog"))
    }

    fn extract_origin(carrier: &dyn Extractor) -> Option<String> {
        carrier.get(DATADOG_ORIGIN_KEY).map(str::to_string)
    }

    pub fn extract_tags(carrier: &dyn Extractor) -> HashMap<String, String> {
        let carrier_tags = carrier.get(DATADOG_TAGS_KEY).unwrap_or_default();

        carrier_tags
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .filter(|(k, _)| k.starts_with(PROPAGATED_TAG_PREFIX))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// Parsed `traceparent`.
struct Traceparent {
    /// `1` when the sampled flag is set, `0` otherwise.
    sampling_priority: i8,
    trace_id: u128,
    span_id: u64,
}

/// The `dd=` member of `tracestate`.
struct Tracestate {
    sampling_priority: Option<i8>,
    origin: Option<String>,
    last_parent_id: Option<String>,
}

/// Reads and writes W3C `traceparent` / `tracestate`.
#[derive(Clone, Copy)]
pub struct TraceContextPropagator;

impl Propagator for TraceContextPropagator {
    fn extract(&self, carrier: &dyn Extractor) -> Option<SpanContext> {
        Self::extract_context(carrier)
    }

    fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector) -> Result<(), Error> {
        if !context.is_valid() {
            return Err(Error::inject("a zero trace or span id", "tracecontext"));
        }

        let flags = u8::from(context.sampling.is_sampled());
        carrier.set(
            TRACEPARENT_KEY,
            format!(
                "00-{}-{}-{flags:02x}",
                context.trace_id_hex(),
                context.span_id_hex()
            ),
        );
        carrier.set(TRACESTATE_KEY, Self::build_tracestate(context));

        Ok(())
    }
}

impl TraceContextPropagator {
    fn extract_context(carrier: &dyn Extractor) -> Option<SpanContext> {
        let tp = carrier.get(TRACEPARENT_KEY)?.trim();

        let traceparent = match Self::extract_traceparent(tp) {
            Ok(traceparent) => traceparent,
            Err(e) => {
                debug!("Failed to extract traceparent: {e}");
                return None;
            }
        };

        let mut tags = HashMap::new();
        let mut origin = None;
        let mut sampling_priority = traceparent.sampling_priority;
        if let Some(ts) = carrier.get(TRACESTATE_KEY) {
            if let Some(tracestate) = Self::extract_tracestate(ts, &mut tags) {
                if let Some(lpid) = tracestate.last_parent_id {
                    tags.insert(DATADOG_LAST_PARENT_ID_KEY.to_string(), lpid);
                }

                origin = tracestate.origin;

                sampling_priority = Self::define_sampling_priority(
                    traceparent.sampling_priority,
                    tracestate.sampling_priority,
                );
            }
        } else {
            debug!("No tracestate found in carrier");
        }

        Some(SpanContext {
            trace_id: traceparent.trace_id,
            span_id: traceparent.span_id,
            sampling: Sampling {
                priority: Some(sampling_priority),
                mechanism: None,
            },
            origin,
            tags,
            baggage: HashMap::new(),
            links: Vec::new(),
        })
    }

    fn build_tracestate(context: &SpanContext) -> String {
        let mut dd = Vec::new();
        if let Some(priority) = context.sampling.priority {
            dd.push(format!("s:{priority}"));
        }
        if let Some(origin) = &context.origin {
            dd.push(format!("o:{}", Self::encode_tag_value(origin)));
        }
        dd.push(format!("p:{}", context.span_id_hex()));

        let mut propagated = context
            .tags
            .iter()
            .filter(|(k, _)| k.as_str() != DATADOG_HIGHER_ORDER_TRACE_ID_BITS_KEY)
            .filter_map(|(k, v)| {
                let stripped = k.strip_prefix(PROPAGATED_TAG_PREFIX)?;
                Some(format!("t.{stripped}:{}", Self::encode_tag_value(v)))
            })
            .collect::<Vec<String>>();
        propagated.sort();
        dd.extend(propagated);

        // other vendors' members follow ours, unchanged
        let mut members = vec![format!("dd={}", dd.join(";"))];
        if let Some(existing) = context.tags.get(TRACESTATE_KEY) {
            members.extend(
                existing
                    .split(',')
                    .map(str::trim)
                    .filter(|member| !member.is_empty() && !member.starts_with("dd="))
                    .map(str::to_string),
            );
        }
        members.truncate(MAX_TRACESTATE_MEMBERS);
        members.join(",")
    }

    fn extract_tracestate(
        tracestate: &str,
        tags: &mut HashMap<String, String>,
    ) -> Option<Tracestate> {
        let ts_v = tracestate.split(',').map(str::trim);
        let ts = ts_v.clone().collect::<Vec<&str>>().join(",");

        if INVALID_ASCII_CHARACTERS_REGEX.is_match(&ts) {
            debug!("Received invalid tracestate {tracestate}");
            return None;
        }

        tags.insert(TRACESTATE_KEY.to_string(), ts.to_string());

        let dd: HashMap<String, String> = ts_v
            .clone()
            .find_map(|v| v.strip_prefix("dd="))?
            .split(';')
            .filter_map(|item| {
                let (k, v) = item.split_once(':')?;
                Some((k.to_string(), v.to_string()))
            })
            .collect();

        let mut tracestate = Tracestate {
            sampling_priority: None,
            origin: None,
            last_parent_id: None,
        };

        if let Some(ts_sp) = dd.get("s") {
            tracestate.sampling_priority = ts_sp.parse::<i8>().ok();
        }

        if let Some(o) = dd.get("o") {
            tracestate.origin = Some(Self::decode_tag_value(o));
        }

        if let Some(lpid) = dd.get("p") {
            tracestate.last_parent_id = Some(lpid.to_string());
        }

        for (k, v) in &dd {
            if let Some(stripped) = k.strip_prefix("t.") {
                tags.insert(
                    format!("{PROPAGATED_TAG_PREFIX}{stripped}"),
                    Self::decode_tag_value(v),
                );
            }
        }

        Some(tracestate)
    }

    fn encode_tag_value(value: &str) -> String {
        value.replace('=', "~").replace([',', ';'], "_")
    }

    fn decode_tag_value(value: &str) -> String {
        value.replace('~', "=")
    }

    fn define_sampling_priority(
        traceparent_sampling_priority: i8,
        tracestate_sampling_priority: Option<i8>,
    ) -> i8 {
        if let Some(ts_sp) = tracestate_sampling_priority {
            if (traceparent_sampling_priority == 1 && ts_sp > 0)
                || (traceparent_sampling_priority == 0 && ts_sp <= 0)
            {
                return ts_sp;
            }
        }

        traceparent_sampling_priority
    }

    fn extract_traceparent(traceparent: &str) -> Result<Traceparent, Error> {
        let captures = TRACEPARENT_REGEX
            .captures(traceparent)
            .ok_or_else(|| Error::extract("invalid traceparent", "traceparent"))?;

        let version = &captures[1];
        let trace_id = &captures[2];
        let span_id = &captures[3];
        let flags = &captures[4];
        let tail = captures.get(5).map_or("", |m| m.as_str());

        Self::extract_version(version, tail)?;

        let trace_id = Self::extract_trace_id(trace_id)?;
        let span_id = Self::extract_span_id(span_id)?;

        let trace_flags = u8::from_str_radix(flags, 16)
            .map_err(|_| Error::extract("Failed to decode trace_flags", "traceparent"))?;
        let sampling_priority = i8::from(trace_flags & 0x1 != 0);

        Ok(Traceparent {
            sampling_priority,
            trace_id,
            span_id,
        })
    }

    fn extract_version(version: &str, tail: &str) -> Result<(), Error> {
        match version {
            "ff" | "FF" => Err(Error::extract(
                "`ff` is an invalid traceparent version",
                "traceparent",
            )),
            "00" if !tail.is_empty() => Err(Error::extract(
                "Traceparent with version `00` should contain only 4 values delimited by `-`",
                "traceparent",
            )),
            "00" => Ok(()),
            _ => {
                warn!("Unsupported traceparent version {version}, still attempting to parse");
                Ok(())
            }
        }
    }

    fn extract_trace_id(trace_id: &str) -> Result<u128, Error> {
        if INVALID_SEGMENT_REGEX.is_match(trace_id) {
            return Err(Error::extract(
                "`0` value for trace_id is invalid",
                "traceparent",
            ));
        }

        u128::from_str_radix(trace_id, 16)
            .map_err(|_| Error::extract("Failed to decode trace_id", "traceparent"))
    }

    fn extract_span_id(span_id: &str) -> Result<u64, Error> {
        if INVALID_SEGMENT_REGEX.is_match(span_id) {
            return Err(Error::extract(
                "`0` value for span_id is invalid",
                "traceparent",
            ));
        }

        u64::from_str_radix(span_id, 16)
            .map_err(|_| Error::extract("Failed to decode span_id", "traceparent"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    const TRACE_ID: u128 = 0x80f1_98ee_5634_3ba8_64fe_8b2a_57d3_eff7;

    #[test]
    fn test_extract_datadog_propagator() {
        let headers = HashMap::from([
            ("x-datadog-trace-id".to_string(), "1234".to_string()),
            ("x-datadog-parent-id".to_string(), "5678".to_string()),
            ("x-datadog-sampling-priority".to_string(), "1".to_string()),
            ("x-datadog-origin".to_string(), "synthetics".to_string()),
            (
                "x-datadog-tags".to_string(),
                "_dd.p.test=value,_dd.p.dm=-4,any=tag".to_string(),
            ),
        ]);

        let context = DatadogHeaderPropagator
            .extract(&headers)
            .expect("couldn't extract trace context");

        assert_eq!(context.trace_id, 1234);
        assert_eq!(context.span_id, 5678);
        assert_eq!(context.sampling.priority, Some(1));
        assert_eq!(context.origin, Some("synthetics".to_string()));
        assert_eq!(context.tags.get("_dd.p.test").unwrap(), "value");
        assert_eq!(context.tags.get("_dd.p.dm").unwrap(), "-4");
        assert!(!context.tags.contains_key("any"));
    }

    #[test]
    fn test_extract_datadog_128_bit_trace_id() {
        let headers = HashMap::from([
            (
                "x-datadog-trace-id".to_string(),
                "7277407061855694839".to_string(),
            ),
            ("x-datadog-parent-id".to_string(), "5678".to_string()),
            (
                "x-datadog-tags".to_string(),
                "_dd.p.tid=80f198ee56343ba8".to_string(),
            ),
        ]);

        let context = DatadogHeaderPropagator.extract(&headers).unwrap();

        assert_eq!(context.trace_id, TRACE_ID);
        assert!(!context.tags.contains_key(DATADOG_HIGHER_ORDER_TRACE_ID_BITS_KEY));
        // no explicit priority means the sender kept the trace
        assert_eq!(context.sampling.priority, Some(2));
    }

    #[test]
    fn test_extract_datadog_malformed_tid_keeps_low_bits() {
        let headers = HashMap::from([
            ("x-datadog-trace-id".to_string(), "1234".to_string()),
            ("x-datadog-parent-id".to_string(), "5678".to_string()),
            ("x-datadog-tags".to_string(), "_dd.p.tid=xyz".to_string()),
        ]);

        let context = DatadogHeaderPropagator.extract(&headers).unwrap();

        assert_eq!(context.trace_id, 1234);
        assert_eq!(
            context.tags.get(DATADOG_PROPAGATION_ERROR_KEY).unwrap(),
            "malformed tid xyz"
        );
    }

    #[test]
    fn test_extract_datadog_invalid_sampling_decision() {
        let headers = HashMap::from([
            ("x-datadog-trace-id".to_string(), "1234".to_string()),
            ("x-datadog-parent-id".to_string(), "5678".to_string()),
            ("x-datadog-tags".to_string(), "_dd.p.dm=keep".to_string()),
        ]);

        let context = DatadogHeaderPropagator.extract(&headers).unwrap();

        assert!(!context.tags.contains_key(DATADOG_SAMPLING_DECISION_KEY));
        assert_eq!(
            context.tags.get(DATADOG_PROPAGATION_ERROR_KEY).unwrap(),
            "decoding_error"
        );
    }

    #[test]
    fn test_extract_datadog_rejects_bad_ids() {
        for trace_id in ["0", "000", "-1", "abc"] {
            let headers = HashMap::from([
                ("x-datadog-trace-id".to_string(), trace_id.to_string()),
                ("x-datadog-parent-id".to_string(), "5678".to_string()),
            ]);
            assert!(
                DatadogHeaderPropagator.extract(&headers).is_none(),
                "trace id {trace_id} should be rejected"
            );
        }

        for parent_id in [None, Some("0"), Some("parent_id")] {
            let mut headers =
                HashMap::from([("x-datadog-trace-id".to_string(), "1234".to_string())]);
            if let Some(parent_id) = parent_id {
                headers.insert("x-datadog-parent-id".to_string(), parent_id.to_string());
            }
            assert!(
                DatadogHeaderPropagator.extract(&headers).is_none(),
                "parent id {parent_id:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_inject_datadog() {
        let context = SpanContext {
            trace_id: TRACE_ID,
            span_id: 5678,
            sampling: Sampling {
                priority: Some(1),
                mechanism: None,
            },
            origin: Some("rum".to_string()),
            tags: HashMap::from([
                ("_dd.p.dm".to_string(), "-1".to_string()),
                ("_dd.parent_id".to_string(), "not propagated".to_string()),
            ]),
            ..Default::default()
        };

        let mut carrier = HashMap::new();
        DatadogHeaderPropagator
            .inject(&context, &mut carrier)
            .unwrap();

        assert_eq!(carrier["x-datadog-trace-id"], "7277407061855694839");
        assert_eq!(carrier["x-datadog-parent-id"], "5678");
        assert_eq!(carrier["x-datadog-sampling-priority"], "1");
        assert_eq!(carrier["x-datadog-origin"], "rum");
        assert_eq!(
            carrier["x-datadog-tags"],
            "_dd.p.dm=-1,_dd.p.tid=80f198ee56343ba8"
        );
    }

    #[test]
    fn test_inject_rejects_zero_ids() {
        let mut carrier = HashMap::new();
        assert!(DatadogHeaderPropagator
            .inject(&SpanContext::default(), &mut carrier)
            .is_err());
        assert!(TraceContextPropagator
            .inject(&SpanContext::new(0, 1), &mut carrier)
            .is_err());
        assert!(carrier.is_empty());
    }

    #[test]
    fn test_extract_traceparent_propagator() {
        let headers = HashMap::from([
            (
                "traceparent".to_string(),
                "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01".to_string(),
            ),
            (
                "tracestate".to_string(),
                "dd=p:00f067aa0ba902b7;s:2;o:rum;t.usr.id:baz64~~".to_string(),
            ),
        ]);

        let context = TraceContextPropagator
            .extract(&headers)
            .expect("couldn't extract trace context");

        assert_eq!(context.trace_id, TRACE_ID);
        assert_eq!(context.span_id, 67_667_974_448_284_343);
        assert_eq!(context.sampling.priority, Some(2));
        assert_eq!(context.origin, Some("rum".to_string()));
        assert_eq!(context.tags.get("_dd.p.usr.id").unwrap(), "baz64==");
        assert_eq!(
            context.tags.get("_dd.parent_id").unwrap(),
            "00f067aa0ba902b7"
        );
    }

    #[test]
    fn test_extract_traceparent_flags_win_over_conflicting_tracestate() {
        let headers = HashMap::from([
            (
                "traceparent".to_string(),
                "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-00".to_string(),
            ),
            ("tracestate".to_string(), "dd=s:2".to_string()),
        ]);

        let context = TraceContextPropagator.extract(&headers).unwrap();

        assert_eq!(context.sampling.priority, Some(0));
    }

    #[test]
    fn test_extract_traceparent_invalid_inputs() {
        for traceparent in [
            "ff-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01",
            "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01-extra",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-80f198ee56343ba864fe8b2a57d3eff7-0000000000000000-01",
            "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7",
            "garbage",
        ] {
            let headers = HashMap::from([("traceparent".to_string(), traceparent.to_string())]);
            assert!(
                TraceContextPropagator.extract(&headers).is_none(),
                "{traceparent} should be rejected"
            );
        }
    }

    #[test]
    fn test_extract_traceparent_future_version_is_parsed() {
        let headers = HashMap::from([(
            "traceparent".to_string(),
            "01-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01-future".to_string(),
        )]);

        let context = TraceContextPropagator.extract(&headers).unwrap();
        assert_eq!(context.trace_id, TRACE_ID);
    }

    #[test]
    fn test_extract_tracestate_non_ascii_is_ignored() {
        let headers = HashMap::from([
            (
                "traceparent".to_string(),
                "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01".to_string(),
            ),
            ("tracestate".to_string(), "dd=o:r\u{00fc}m".to_string()),
        ]);

        let context = TraceContextPropagator.extract(&headers).unwrap();

        assert_eq!(context.origin, None);
        assert_eq!(context.sampling.priority, Some(1));
    }

    #[test]
    fn test_inject_tracecontext_keeps_other_vendors() {
        let context = SpanContext {
            trace_id: TRACE_ID,
            span_id: 67_667_974_448_284_343,
            sampling: Sampling {
                priority: Some(1),
                mechanism: None,
            },
            origin: Some("synthetics".to_string()),
            tags: HashMap::from([
                ("_dd.p.dm".to_string(), "-1".to_string()),
                (
                    TRACESTATE_KEY.to_string(),
                    "dd=s:2;o:rum,congo=t61rcWkgMzE".to_string(),
                ),
            ]),
            ..Default::default()
        };

        let mut carrier = HashMap::new();
        TraceContextPropagator.inject(&context, &mut carrier).unwrap();

        assert_eq!(
            carrier["traceparent"],
            "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01"
        );
        assert_eq!(
            carrier["tracestate"],
            "dd=s:1;o:synthetics;p:00f067aa0ba902b7;t.dm:-1,congo=t61rcWkgMzE"
        );
    }

    #[test]
    fn test_inject_tracecontext_unsampled_flag() {
        let context = SpanContext {
            trace_id: 1,
            span_id: 2,
            sampling: Sampling {
                priority: Some(0),
                mechanism: None,
            },
            ..Default::default()
        };

        let mut carrier = HashMap::new();
        TraceContextPropagator.inject(&context, &mut carrier).unwrap();

        assert!(carrier["traceparent"].ends_with("-00"));
    }
}
