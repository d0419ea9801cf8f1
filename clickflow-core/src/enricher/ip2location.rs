use std::time::Duration;

use reqwest::{Client, Url};
use serde_json::Value;

use crate::enricher::{GeoLookup, LookupError};
use crate::message::Location;
use crate::{Error, Result};

const COUNTRY_FIELD: &str = "country_code";
const STATE_FIELD: &str = "region_name";
const CITY_FIELD: &str = "city_name";

/// `GET {endpoint}?ip={ip}&key={key}`. A 2xx JSON object without an `error` member is a hit.
#[derive(Clone)]
pub struct Ip2LocationClient {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl Ip2LocationClient {
    /// `timeout` caps each HTTP request on its own; the enricher bounds the whole lookup.
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid geolocation endpoint {endpoint:?}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Enricher(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

impl GeoLookup for Ip2LocationClient {
    async fn lookup(&self, ip: &str) -> std::result::Result<Location, LookupError> {
        let mut request = self.client.get(self.endpoint.clone()).query(&[("ip", ip)]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.as_str())]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LookupError::Timeout
            } else {
                LookupError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| LookupError::Body(e.to_string()))?;
        location_from_body(body)
    }
}

fn location_from_body(body: Value) -> std::result::Result<Location, LookupError> {
    let Value::Object(fields) = body else {
        return Err(LookupError::Body("response is not a JSON object".to_string()));
    };
    if let Some(error) = fields.get("error") {
        return Err(LookupError::Api(error.to_string()));
    }
    let text = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Ok(Location {
        country: text(COUNTRY_FIELD),
        state: text(STATE_FIELD),
        city: text(CITY_FIELD),
    })
}
