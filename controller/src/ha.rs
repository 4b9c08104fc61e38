use std::time::Duration;

use aircon_common::{EntityState, HistoryEntry, HomeAssistant, HostError};
use anyhow::Context;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Home Assistant REST API client authenticated with a long-lived token.
#[derive(Clone)]
pub struct HaRestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct HistoryRecord {
    state: String,
    last_changed: String,
}

impl HaRestClient {
    pub fn new(base_url: &str, token: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build Home Assistant HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn transport(err: reqwest::Error) -> HostError {
    HostError::Transport(err.to_string())
}

fn invalid(err: impl std::fmt::Display) -> HostError {
    HostError::InvalidResponse(err.to_string())
}

/// History queries want an absolute instant; naive times are local.
fn history_start(start: NaiveDateTime) -> String {
    let utc = match start.and_local_timezone(Local).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => start.and_utc(),
    };
    utc.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

impl HomeAssistant for HaRestClient {
    async fn get_state(&self, entity_id: &str) -> Result<EntityState, HostError> {
        let response = self
            .http
            .get(self.url(&format!("/api/states/{entity_id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(HostError::NotFound(entity_id.to_string()));
        }
        let response = response.error_for_status().map_err(transport)?;
        response.json::<EntityState>().await.map_err(invalid)
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), HostError> {
        debug!("calling {domain}/{service} with {data}");
        let response = self
            .http
            .post(self.url(&format!("/api/services/{domain}/{service}")))
            .bearer_auth(&self.token)
            .json(&data)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HostError::ServiceCallFailed {
                service: format!("{domain}/{service}"),
                reason: format!("{status}: {body}"),
            });
        }
        Ok(())
    }

    async fn get_history(
        &self,
        entity_id: &str,
        start: NaiveDateTime,
    ) -> Result<Vec<HistoryEntry>, HostError> {
        let history_error = |reason: String| HostError::HistoryUnavailable {
            entity: entity_id.to_string(),
            reason,
        };

        let response = self
            .http
            .get(self.url(&format!("/api/history/period/{}", history_start(start))))
            .query(&[("filter_entity_id", entity_id)])
            .query(&[("no_attributes", "1")])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| history_error(err.to_string()))?
            .error_for_status()
            .map_err(|err| history_error(err.to_string()))?;

        let series = response
            .json::<Vec<Vec<HistoryRecord>>>()
            .await
            .map_err(|err| history_error(err.to_string()))?;

        series
            .into_iter()
            .flatten()
            .map(|record| {
                let last_changed = DateTime::parse_from_rfc3339(&record.last_changed)
                    .map_err(|err| invalid(format!("{}: {err}", record.last_changed)))?;
                Ok(HistoryEntry {
                    state: record.state,
                    last_changed,
                })
            })
            .collect()
    }

    async fn set_state(
        &self,
        entity_id: &str,
        state: &str,
        attributes: Value,
    ) -> Result<(), HostError> {
        self.http
            .post(self.url(&format!("/api/states/{entity_id}")))
            .bearer_auth(&self.token)
            .json(&json!({ "state": state, "attributes": attributes }))
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, method, path, path_regex, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    async fn client(server: &MockServer) -> HaRestClient {
        HaRestClient::new(&format!("{}/", server.uri()), "secret").unwrap()
    }

    #[tokio::test]
    async fn reads_entity_state_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states/climate.living"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entity_id": "climate.living",
                "state": "heat",
                "attributes": { "current_temperature": 19.5, "temperature": 21 },
                "last_changed": "2024-06-01T10:00:00+00:00"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let state = client(&server).await.get_state("climate.living").await.unwrap();

        assert_eq!(state.state, "heat");
        assert_eq!(state.attribute_f32("current_temperature"), Some(19.5));
    }

    #[tokio::test]
    async fn missing_entity_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states/cover.study"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server).await.get_state("cover.study").await.unwrap_err();

        assert_eq!(err, HostError::NotFound("cover.study".to_string()));
    }

    #[tokio::test]
    async fn posts_service_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/services/climate/set_hvac_mode"))
            .and(body_json(json!({ "entity_id": "climate.aircon", "hvac_mode": "dry" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .call_service(
                "climate",
                "set_hvac_mode",
                json!({ "entity_id": "climate.aircon", "hvac_mode": "dry" }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_service_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/services/cover/set_cover_position"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad position"))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .call_service("cover", "set_cover_position", json!({ "position": 500 }))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            HostError::ServiceCallFailed { ref service, ref reason }
                if service == "cover/set_cover_position" && reason.contains("bad position")
        ));
    }

    #[tokio::test]
    async fn flattens_history_series() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/history/period/\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z$"))
            .and(query_param("filter_entity_id", "climate.aircon"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([[
                { "state": "dry", "last_changed": "2024-06-01T08:00:00+00:00" },
                { "state": "heat", "last_changed": "2024-06-01T08:30:12.345678+00:00" }
            ]])))
            .mount(&server)
            .await;

        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap();
        let history = client(&server)
            .await
            .get_history("climate.aircon", start)
            .await
            .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history[1].state, "heat");
        assert_eq!(
            history[1].last_changed,
            DateTime::parse_from_rfc3339("2024-06-01T08:30:12.345678+00:00").unwrap()
        );
    }

    #[tokio::test]
    async fn history_failure_is_reported_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/history/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap();
        let err = client(&server)
            .await
            .get_history("climate.aircon", start)
            .await
            .unwrap_err();

        assert!(matches!(err, HostError::HistoryUnavailable { .. }));
    }

    #[tokio::test]
    async fn writes_sensor_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/states/sensor.smart_aircon_living_target_temp"))
            .and(body_json(json!({
                "state": "21.5",
                "attributes": { "unit_of_measurement": "°C" }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .set_state(
                "sensor.smart_aircon_living_target_temp",
                "21.5",
                json!({ "unit_of_measurement": "°C" }),
            )
            .await
            .unwrap();
    }
}
