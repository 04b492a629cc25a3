//! Helper functions to build the OTLP exporter behind the periodic gauge backend.
use std::collections::HashMap;

use opentelemetry_otlp::{MetricExporter, Protocol};
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;

use crate::{ConfigureError, internal::env::get_optional_env};

macro_rules! feature_required {
    ($feature_name:literal, $functionality:expr, $if_enabled:expr) => {{
        #[cfg(feature = $feature_name)]
        {
            let _ = $functionality; // to avoid unused code warning
            $if_enabled
        }

        #[cfg(not(feature = $feature_name))]
        {
            return Err(ConfigureError::FeatureRequired {
                feature_name: $feature_name,
                functionality: $functionality,
            });
        }
    }};
}

/// Build a [`PushMetricExporter`] sending OTLP metrics to `endpoint`, for passing to a
/// [`PeriodicReader`](opentelemetry_sdk::metrics::PeriodicReader).
///
/// `endpoint` is the collector base URL; `/v1/metrics` is appended for the HTTP protocols.
///
/// This uses `OTEL_EXPORTER_OTLP_METRICS_PROTOCOL` and `OTEL_EXPORTER_OTLP_PROTOCOL` environment
/// variables to determine the protocol to use (or otherwise defaults to [`Protocol::HttpBinary`]).
///
/// # Errors
///
/// Returns an error if the protocol specified by the env var is not supported or if the required feature is not enabled for
/// the given protocol.
///
/// Returns an error if the endpoint is not a valid URI.
///
/// Returns an error if any headers are not valid HTTP headers.
pub fn metric_exporter(
    endpoint: &str,
    headers: Option<HashMap<String, String>>,
) -> Result<impl PushMetricExporter + use<>, ConfigureError> {
    metric_exporter_with_env(endpoint, headers, None)
}

pub(crate) fn metric_exporter_with_env(
    endpoint: &str,
    headers: Option<HashMap<String, String>>,
    env: Option<&HashMap<String, String>>,
) -> Result<impl PushMetricExporter + use<>, ConfigureError> {
    let (source, protocol) = protocol_from_env("OTEL_EXPORTER_OTLP_METRICS_PROTOCOL", env)?;

    // gauges report the latest value, so cumulative temporality is what collectors expect
    let builder = MetricExporter::builder()
        .with_temporality(opentelemetry_sdk::metrics::Temporality::Cumulative);

    let endpoint = endpoint.trim_end_matches('/');

    match protocol {
        Protocol::Grpc => {
            feature_required!("export-grpc", source, {
                use opentelemetry_otlp::WithTonicConfig;
                Ok(builder
                    .with_tonic()
                    .with_channel(
                        tonic::transport::Channel::builder(
                            endpoint.to_string().try_into().map_err(
                                |e: http::uri::InvalidUri| ConfigureError::Other(e.into()),
                            )?,
                        )
                        .connect_lazy(),
                    )
                    .with_metadata(build_metadata_from_headers(headers.as_ref())?)
                    .build()?)
            })
        }
        Protocol::HttpBinary => {
            feature_required!("export-http-protobuf", source, {
                use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
                Ok(builder
                    .with_http()
                    .with_protocol(Protocol::HttpBinary)
                    .with_headers(headers.unwrap_or_default())
                    .with_endpoint(format!("{endpoint}/v1/metrics"))
                    .build()?)
            })
        }
        Protocol::HttpJson => {
            feature_required!("export-http-json", source, {
                use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
                Ok(builder
                    .with_http()
                    .with_protocol(Protocol::HttpJson)
                    .with_headers(headers.unwrap_or_default())
                    .with_endpoint(format!("{endpoint}/v1/metrics"))
                    .build()?)
            })
        }
    }
}

#[cfg(feature = "export-grpc")]
fn build_metadata_from_headers(
    headers: Option<&HashMap<String, String>>,
) -> Result<tonic::metadata::MetadataMap, ConfigureError> {
    let Some(headers) = headers else {
        return Ok(tonic::metadata::MetadataMap::new());
    };

    let mut header_map = http::HeaderMap::new();
    for (key, value) in headers {
        header_map.insert(
            http::HeaderName::try_from(key).map_err(|e| ConfigureError::Other(e.into()))?,
            http::HeaderValue::try_from(value).map_err(|e| ConfigureError::Other(e.into()))?,
        );
    }
    Ok(tonic::metadata::MetadataMap::from_headers(header_map))
}

const DEFAULT_PROTOCOL: Protocol = Protocol::HttpBinary;

// standard OTLP protocol values in configuration
const OTEL_EXPORTER_OTLP_PROTOCOL_GRPC: &str = "grpc";
const OTEL_EXPORTER_OTLP_PROTOCOL_HTTP_PROTOBUF: &str = "http/protobuf";
const OTEL_EXPORTER_OTLP_PROTOCOL_HTTP_JSON: &str = "http/json";

fn protocol_from_str(value: &str) -> Result<Protocol, ConfigureError> {
    match value {
        OTEL_EXPORTER_OTLP_PROTOCOL_GRPC => Ok(Protocol::Grpc),
        OTEL_EXPORTER_OTLP_PROTOCOL_HTTP_PROTOBUF => Ok(Protocol::HttpBinary),
        OTEL_EXPORTER_OTLP_PROTOCOL_HTTP_JSON => Ok(Protocol::HttpJson),
        _ => Err(ConfigureError::InvalidConfigurationValue {
            parameter: "OTEL_EXPORTER_OTLP_PROTOCOL",
            value: value.to_owned(),
        }),
    }
}

/// Get a protocol from the environment (or default value), returning a string describing the source
/// plus the parsed protocol.
fn protocol_from_env(
    data_env_var: &str,
    env: Option<&HashMap<String, String>>,
) -> Result<(String, Protocol), ConfigureError> {
    // try both data-specific env var and general protocol
    [data_env_var, "OTEL_EXPORTER_OTLP_PROTOCOL"]
        .into_iter()
        .find_map(|var_name| match get_optional_env(var_name, env) {
            Ok(Some(value)) => Some(Ok((var_name, value))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        })
        .transpose()?
        .map_or_else(
            || {
                Ok((
                    "the default metrics export protocol".to_string(),
                    DEFAULT_PROTOCOL,
                ))
            },
            |(var_name, value)| Ok((format!("`{var_name}={value}`"), protocol_from_str(&value)?)),
        )
}
