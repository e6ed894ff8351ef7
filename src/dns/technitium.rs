use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::dns::{DnsError, DnsProvider, DnsRecordEntry, RecordData, fqdn};

#[derive(Debug, Clone)]
pub struct TechnitiumConfig {
    pub url: String,
    pub token: String,
}

/// Technitium DNS Server HTTP API client.
pub struct TechnitiumClient {
    client: Client,
    config: TechnitiumConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    response: Value,
}

#[derive(Debug, Deserialize)]
struct ZoneList {
    zones: Vec<Zone>,
}

#[derive(Debug, Deserialize)]
struct Zone {
    name: String,
    #[serde(default)]
    internal: bool,
}

#[derive(Debug, Deserialize)]
struct RecordList {
    records: Vec<Record>,
}

#[derive(Debug, Deserialize)]
struct Record {
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    #[serde(default)]
    ttl: u32,
}

impl TechnitiumClient {
    pub fn new(config: TechnitiumConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn call(&self, path: &str, params: &[(&str, String)]) -> Result<Value, DnsError> {
        let url = format!("{}/api/{}", self.config.url.trim_end_matches('/'), path);
        debug!("technitium {}", path);

        let response = self
            .client
            .get(&url)
            .query(&[("token", self.config.token.as_str())])
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DnsError::Remote(anyhow!(
                "dns request failed with status {status}: {body}"
            )));
        }

        let body: ApiResponse = response.json().await?;
        interpret(body)
    }
}

fn interpret(body: ApiResponse) -> Result<Value, DnsError> {
    if body.status == "ok" {
        return Ok(body.response);
    }

    let message = body.error_message.unwrap_or(body.status);
    let lowered = message.to_lowercase();
    if lowered.contains("not found") || lowered.contains("does not exist") {
        return Err(DnsError::NotFound);
    }
    Err(DnsError::Rejected(message))
}

#[async_trait]
impl DnsProvider for TechnitiumClient {
    async fn create_record(
        &self,
        zone: &str,
        name: &str,
        data: &RecordData,
        ttl: u32,
    ) -> Result<(), DnsError> {
        let mut params = vec![
            ("zone", zone.to_string()),
            ("domain", fqdn(zone, name)),
            ("type", data.record_type().to_string()),
            ("ttl", ttl.to_string()),
        ];
        params.extend(data.params());

        self.call("zones/records/add", &params).await?;
        Ok(())
    }

    async fn delete_record(
        &self,
        zone: &str,
        name: &str,
        data: &RecordData,
    ) -> Result<(), DnsError> {
        let mut params = vec![
            ("zone", zone.to_string()),
            ("domain", fqdn(zone, name)),
            ("type", data.record_type().to_string()),
        ];
        params.extend(data.params());

        self.call("zones/records/delete", &params).await?;
        Ok(())
    }

    async fn list_zones(&self) -> Result<Vec<String>, DnsError> {
        let response = self.call("zones/list", &[]).await?;
        let zones: ZoneList =
            serde_json::from_value(response).map_err(|e| DnsError::Remote(e.into()))?;

        Ok(zones
            .zones
            .into_iter()
            .filter(|z| !z.internal)
            .map(|z| z.name)
            .collect())
    }

    async fn list_records(&self, zone: &str) -> Result<Vec<DnsRecordEntry>, DnsError> {
        let response = self
            .call(
                "zones/records/get",
                &[
                    ("zone", zone.to_string()),
                    ("domain", zone.to_string()),
                    ("listZone", "true".to_string()),
                ],
            )
            .await?;
        let records: RecordList =
            serde_json::from_value(response).map_err(|e| DnsError::Remote(e.into()))?;

        Ok(records
            .records
            .into_iter()
            .map(|r| DnsRecordEntry {
                name: r.name,
                record_type: r.record_type,
                ttl: r.ttl,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn response(value: Value) -> ApiResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_interpret() {
        let ok = interpret(response(json!({"status": "ok", "response": {"zones": []}})));
        assert!(ok.is_ok());

        let missing = interpret(response(json!({
            "status": "error",
            "errorMessage": "Cannot delete record: record does not exist."
        })));
        assert!(matches!(missing, Err(DnsError::NotFound)));

        let rejected = interpret(response(json!({
            "status": "invalid-token",
            "errorMessage": "Invalid token or session expired."
        })));
        assert!(matches!(rejected, Err(DnsError::Rejected(_))));
    }

    #[test]
    fn test_zone_filter_shape() {
        let zones: ZoneList = serde_json::from_value(json!({
            "zones": [
                {"name": "example.org", "internal": false},
                {"name": "localhost", "internal": true},
                {"name": "lab.example.org"}
            ]
        }))
        .unwrap();
        let visible: Vec<_> = zones.zones.iter().filter(|z| !z.internal).collect();
        assert_eq!(visible.len(), 2);
    }
}
