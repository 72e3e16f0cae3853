//! CAME Connect REST client (device status + commands)

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

use super::auth::TokenManager;
use crate::error::{GateError, GateResult};

/// REST operations the coordinator depends on
#[async_trait]
pub trait GateApi: Send + Sync {
    /// Raw status document (first element of the `/devicestatus` array)
    async fn get_device_status(&self, device_id: &str) -> GateResult<Value>;

    /// Dispatch a command; only 200/202 count as accepted
    async fn send_command(&self, device_id: &str, command_id: u32) -> GateResult<Value>;
}

pub struct CameClient {
    base_url: String,
    http_client: Client,
    tokens: Arc<TokenManager>,
}

impl CameClient {
    pub fn new(base_url: &str, http_client: Client, tokens: Arc<TokenManager>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            tokens,
        }
    }

    /// Bearer request with a single retry after a 401.
    ///
    /// The second response is returned as-is, whatever its status.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> GateResult<(StatusCode, Value)> {
        let (status, js) = self.send_once(method.clone(), url, query, body).await?;
        if status != StatusCode::UNAUTHORIZED {
            return Ok((status, js));
        }

        tracing::warn!("[CameApi] {} {} returned 401, re-authenticating", method, url);
        self.tokens.invalidate().await;
        self.send_once(method, url, query, body).await
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> GateResult<(StatusCode, Value)> {
        let token = self.tokens.ensure_token().await?;

        let mut req = self
            .http_client
            .request(method, url)
            .bearer_auth(token)
            .header("Accept", "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        let js = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| serde_json::json!({ "ok": status.as_u16() }));

        Ok((status, js))
    }
}

#[async_trait]
impl GateApi for CameClient {
    async fn get_device_status(&self, device_id: &str) -> GateResult<Value> {
        let url = format!("{}/devicestatus", self.base_url);
        let query = [("devices", format!("[{}]", device_id))];

        let (status, js) = self.request(Method::GET, &url, &query, None).await?;
        if status != StatusCode::OK {
            return Err(GateError::Api(format!("devicestatus failed: {} {}", status, js)));
        }

        // The API has used both casings
        let first = ["Data", "data"]
            .iter()
            .filter_map(|key| js.get(*key).and_then(Value::as_array))
            .find_map(|arr| arr.first());

        match first {
            Some(status_doc) => Ok(status_doc.clone()),
            None => Err(GateError::Api("No Data from devicestatus".to_string())),
        }
    }

    async fn send_command(&self, device_id: &str, command_id: u32) -> GateResult<Value> {
        let url = format!(
            "{}/automations/{}/commands/{}",
            self.base_url, device_id, command_id
        );

        let (status, js) = self
            .request(Method::POST, &url, &[], Some(&serde_json::json!({})))
            .await?;
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            return Err(GateError::Api(format!(
                "command {} failed: {} {}",
                command_id, status, js
            )));
        }

        tracing::info!("[CameApi] Command {} accepted for device {}", command_id, device_id);
        Ok(js)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialsConfig;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_oauth(server: &MockServer, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth/auth-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": "c0de"})))
            .expect(expected)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok", "expires_in": 3600})),
            )
            .expect(expected)
            .mount(server)
            .await;
    }

    fn client(server: &MockServer) -> CameClient {
        let credentials = CredentialsConfig {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            redirect_uri: "https://beta.cameconnect.net/role".to_string(),
        };
        let http = Client::new();
        let tokens = Arc::new(TokenManager::new(credentials, &server.uri(), http.clone()));
        CameClient::new(&server.uri(), http, tokens)
    }

    #[tokio::test]
    async fn test_get_device_status_first_element() {
        let server = MockServer::start().await;
        mount_oauth(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/devicestatus"))
            .and(query_param("devices", "[42]"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Data": [{"States": [{}, {}, {"Data": [16, 100]}], "Online": true}]
            })))
            .mount(&server)
            .await;

        let doc = client(&server).get_device_status("42").await.unwrap();
        assert_eq!(doc["States"][2]["Data"], json!([16, 100]));
    }

    #[tokio::test]
    async fn test_get_device_status_lowercase_key() {
        let server = MockServer::start().await;
        mount_oauth(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/devicestatus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"Online": false}]
            })))
            .mount(&server)
            .await;

        let doc = client(&server).get_device_status("42").await.unwrap();
        assert_eq!(doc["Online"], json!(false));
    }

    #[tokio::test]
    async fn test_get_device_status_empty_is_api_error() {
        let server = MockServer::start().await;
        mount_oauth(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/devicestatus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Data": []})))
            .mount(&server)
            .await;

        let err = client(&server).get_device_status("42").await.unwrap_err();
        assert!(matches!(err, GateError::Api(_)));
    }

    #[tokio::test]
    async fn test_get_device_status_server_error() {
        let server = MockServer::start().await;
        mount_oauth(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/devicestatus"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).get_device_status("42").await.unwrap_err();
        assert!(matches!(err, GateError::Api(msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn test_401_retries_exactly_once() {
        let server = MockServer::start().await;
        // Initial exchange plus the forced re-exchange
        mount_oauth(&server, 2).await;
        Mock::given(method("GET"))
            .and(path("/devicestatus"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "expired"})))
            .expect(2)
            .mount(&server)
            .await;

        let c = client(&server);
        let url = format!("{}/devicestatus", server.uri());
        let (status, body) = c
            .request(Method::GET, &url, &[("devices", "[1]".to_string())], None)
            .await
            .unwrap();

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({"error": "expired"}));
    }

    #[tokio::test]
    async fn test_401_then_success() {
        let server = MockServer::start().await;
        mount_oauth(&server, 2).await;
        Mock::given(method("GET"))
            .and(path("/devicestatus"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/devicestatus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Data": [{"States": [{}, {}, {"Data": [17, 0]}]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let doc = client(&server).get_device_status("7").await.unwrap();
        assert_eq!(doc["States"][2]["Data"], json!([17, 0]));
    }

    #[tokio::test]
    async fn test_send_command_accepts_202() {
        let server = MockServer::start().await;
        mount_oauth(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/automations/42/commands/2"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let js = client(&server).send_command("42", 2).await.unwrap();
        assert_eq!(js, json!({"ok": 202}));
    }

    #[tokio::test]
    async fn test_send_command_rejects_other_status() {
        let server = MockServer::start().await;
        mount_oauth(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/automations/42/commands/129"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let err = client(&server).send_command("42", 129).await.unwrap_err();
        assert!(matches!(err, GateError::Api(_)));
    }
}
