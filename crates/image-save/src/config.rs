// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::{
    consumer::{AckPolicy, ConsumerConfig},
    log_shipper::LogShipperConfig,
    producer::{ProducerConfig, ResponseMapping},
    retry::RetryPolicy,
    trace::{
        propagation::style::{default_styles, parse_styles, TracePropagationStyle},
        reporter::CollectorConfig,
        TracerConfig,
    },
};

const DEFAULT_AMQP_URL: &str = "amqp://rabbitmq:5672/%2f";
const DEFAULT_TASK_QUEUE: &str = "tasks";
const DEFAULT_RECEIVER_HOST: &str = "0.0.0.0";
const DEFAULT_RECEIVER_PORT: u16 = 8080;
const DEFAULT_TRACE_COLLECTOR_URL: &str = "http://trace-collector:8080/spans";
const DEFAULT_TRACE_FLUSH_INTERVAL_SECS: u64 = 3;
const DEFAULT_DOWNLOAD_DIR: &str = "./";
const DEFAULT_CONNECT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_CONNECT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_LOG_LEVEL: &str = "info";
const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Error, Debug, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Which process is reading the configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Receiver,
    Processor,
}

impl Role {
    #[must_use]
    pub fn default_service_name(self) -> &'static str {
        match self {
            Role::Receiver => "image-save.receiver",
            Role::Processor => "image-save.processor",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub amqp_url: String,
    pub queue: String,
    pub receiver_host: String,
    pub receiver_port: u16,
    pub tracing_enabled: bool,
    pub trace_collector_url: String,
    pub propagation_styles: Vec<TracePropagationStyle>,
    /// how often to flush spans, in seconds
    pub trace_flush_interval_secs: u64,
    pub download_dir: PathBuf,
    pub ack_policy: AckPolicy,
    pub response_mapping: ResponseMapping,
    pub connect_max_attempts: u32,
    pub connect_initial_backoff_ms: u64,
    pub shipping_token: Option<String>,
    pub listener_uri: Option<String>,
    pub log_level: String,
    pub proxy_url: Option<String>,
}

impl Config {
    /// Reads the environment. Unset variables take their defaults; set but unparsable ones are
    /// errors.
    pub fn from_env(role: Role) -> Result<Config, ConfigError> {
        let propagation_styles = match env::var("TRACE_PROPAGATION_STYLE") {
            Ok(value) => parse_styles(&value),
            Err(_) => default_styles(),
        };

        let config = Config {
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| role.default_service_name().to_string()),
            amqp_url: env::var("AMQP_URL").unwrap_or_else(|_| DEFAULT_AMQP_URL.to_string()),
            queue: env::var("TASK_QUEUE").unwrap_or_else(|_| DEFAULT_TASK_QUEUE.to_string()),
            receiver_host: env::var("RECEIVER_HOST")
                .unwrap_or_else(|_| DEFAULT_RECEIVER_HOST.to_string()),
            receiver_port: parse_var("RECEIVER_PORT", DEFAULT_RECEIVER_PORT)?,
            tracing_enabled: parse_bool_var("TRACING_ENABLED", true)?,
            trace_collector_url: env::var("TRACE_COLLECTOR_URL")
                .unwrap_or_else(|_| DEFAULT_TRACE_COLLECTOR_URL.to_string()),
            propagation_styles,
            trace_flush_interval_secs: parse_var(
                "TRACE_FLUSH_INTERVAL_SECS",
                DEFAULT_TRACE_FLUSH_INTERVAL_SECS,
            )?,
            download_dir: env::var("DOWNLOAD_DIR")
                .map_or_else(|_| PathBuf::from(DEFAULT_DOWNLOAD_DIR), PathBuf::from),
            ack_policy: parse_var("ACK_POLICY", AckPolicy::default())?,
            response_mapping: parse_var("RESPONSE_MAPPING", ResponseMapping::default())?,
            connect_max_attempts: parse_var(
                "CONNECT_MAX_ATTEMPTS",
                DEFAULT_CONNECT_MAX_ATTEMPTS,
            )?,
            connect_initial_backoff_ms: parse_var(
                "CONNECT_INITIAL_BACKOFF_MS",
                DEFAULT_CONNECT_INITIAL_BACKOFF_MS,
            )?,
            shipping_token: non_empty_var("SHIPPING_TOKEN"),
            listener_uri: non_empty_var("LISTENER_URI"),
            log_level: env::var("LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
            proxy_url: env::var("HTTPS_PROXY").ok(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver_port == 0 {
            return Err(ConfigError::Validation(
                "RECEIVER_PORT must not be 0".to_string(),
            ));
        }
        if self.queue.trim().is_empty() {
            return Err(ConfigError::Validation(
                "TASK_QUEUE must not be empty".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "LOG_LEVEL must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }
        if self.connect_max_attempts == 0 {
            return Err(ConfigError::Validation(
                "CONNECT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `EnvFilter` directives: noisy transport crates are silenced.
    #[must_use]
    pub fn env_filter(&self) -> String {
        format!("h2=off,hyper=off,rustls=off,lapin=warn,{}", self.log_level)
    }

    #[must_use]
    pub fn receiver_addr(&self) -> String {
        format!("{}:{}", self.receiver_host, self.receiver_port)
    }

    #[must_use]
    pub fn tracer_config(&self) -> TracerConfig {
        TracerConfig {
            enabled: self.tracing_enabled,
            ..TracerConfig::new(&self.service_name)
        }
    }

    #[must_use]
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            flush_interval: Duration::from_secs(self.trace_flush_interval_secs.max(1)),
            ..CollectorConfig::new(&self.trace_collector_url)
        }
    }

    #[must_use]
    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            queue: self.queue.clone(),
            tracing_enabled: self.tracing_enabled,
            response_mapping: self.response_mapping,
            propagation_styles: self.propagation_styles.clone(),
        }
    }

    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            queue: self.queue.clone(),
            ack_policy: self.ack_policy,
            propagation_styles: self.propagation_styles.clone(),
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_max_attempts,
            initial_backoff: Duration::from_millis(self.connect_initial_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    /// `None` unless both `SHIPPING_TOKEN` and `LISTENER_URI` are set.
    #[must_use]
    pub fn log_shipper_config(&self) -> Option<LogShipperConfig> {
        let token = self.shipping_token.as_deref()?;
        let listener_uri = self.listener_uri.as_deref()?;
        Some(LogShipperConfig::new(listener_uri, token, &self.service_name))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            value,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool_var(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value,
                reason: "expected true or false".to_string(),
            }),
        },
        Err(_) => Ok(default),
    }
}
