//! Kafka plumbing for clickflow: a consumer actor that reads an explicitly assigned set of
//! partitions (so that the checkpoint, not the consumer group, decides where reading resumes) and
//! a producer used by the queue sink.

use rdkafka::config::ClientConfig;
use tracing::warn;

pub mod sink;
pub mod source;

pub use source::{KafkaMessage, KafkaSource, KafkaSourceConfig, PartitionAssignment, StartOffset};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// SASL credentials. The click-event cluster uses `PLAIN` over `SASL_SSL`.
#[derive(Debug, Clone, PartialEq)]
pub enum KafkaSaslAuth {
    Plain { username: String, password: String },
    ScramSha256 { username: String, password: String },
    ScramSha512 { username: String, password: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert: String,
    pub client_cert_private_key: String,
}

/// Applies TLS and SASL settings on top of a client configuration. SASL always implies TLS, the
/// brokers we talk to never accept SASL in plaintext.
pub(crate) fn update_auth_config(
    client_config: &mut ClientConfig,
    tls: Option<TlsConfig>,
    auth: Option<KafkaSaslAuth>,
) {
    let tls_enabled = tls.is_some() || auth.is_some();

    if let Some(tls) = tls {
        if tls.insecure_skip_verify {
            warn!(
                "'insecure_skip_verify' is set, certificate validation will not be performed when connecting to Kafka"
            );
            client_config
                .set("ssl.endpoint.identification.algorithm", "none")
                .set("enable.ssl.certificate.verification", "false");
        }
        if let Some(ca_cert) = tls.ca_cert {
            client_config.set("ssl.ca.location", ca_cert);
        }
        if let Some(client_auth) = tls.client_auth {
            client_config
                .set("ssl.certificate.location", client_auth.client_cert)
                .set("ssl.key.location", client_auth.client_cert_private_key);
        }
    }

    let Some(auth) = auth else {
        if tls_enabled {
            client_config.set("security.protocol", "SSL");
        }
        return;
    };

    let (mechanism, username, password) = match auth {
        KafkaSaslAuth::Plain { username, password } => ("PLAIN", username, password),
        KafkaSaslAuth::ScramSha256 { username, password } => ("SCRAM-SHA-256", username, password),
        KafkaSaslAuth::ScramSha512 { username, password } => ("SCRAM-SHA-512", username, password),
    };
    client_config
        .set("security.protocol", "SASL_SSL")
        .set("sasl.mechanisms", mechanism)
        .set("sasl.username", username)
        .set("sasl.password", password);
}
