//! Session context: wires token manager, REST client, hub, realtime client
//! and coordinator for one device, and tears them down together.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;

use crate::came::{CameClient, TokenManager, TokenSource};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::GateResult;
use crate::hub::EventHub;
use crate::models::DeviceSnapshot;
use crate::realtime::{ConnectionState, EventCallback, EventClient};

pub struct Session {
    device_id: String,
    tokens: Arc<TokenManager>,
    coordinator: Arc<Coordinator>,
    events: Option<EventClient>,
}

impl Session {
    /// Seed the snapshot over REST, then start whatever the refresh policy needs.
    ///
    /// Fails if the initial seed fails, so bad credentials surface at startup.
    pub async fn start(config: &Config) -> GateResult<Self> {
        let timeout = Duration::from_secs(config.api.request_timeout_secs);
        let http_client = Client::builder().timeout(timeout).build()?;

        let device_id = config.device.device_id.clone();
        let tokens = Arc::new(TokenManager::new(
            config.credentials.clone(),
            &config.api.base_url,
            http_client.clone(),
        ));
        let client = Arc::new(CameClient::new(
            &config.api.base_url,
            http_client,
            tokens.clone(),
        ));
        let hub = Arc::new(EventHub::new(&device_id));
        let coordinator = Coordinator::new(&device_id, &config.polling, client, hub);

        coordinator.refresh().await?;

        let policy = coordinator.policy();
        let events = if policy.uses_push() {
            let target = coordinator.clone();
            let on_event: EventCallback = Arc::new(move |event| target.handle_event(event));
            let token_source: Arc<dyn TokenSource> = tokens.clone();
            let events = EventClient::new(
                &config.api.ws_url,
                &config.api.origin,
                timeout,
                token_source,
                on_event,
            );
            events.start().await;
            Some(events)
        } else {
            None
        };

        coordinator.start();

        tracing::info!(
            "[Session] Device {} ready (policy: {:?})",
            device_id,
            policy
        );

        Ok(Self {
            device_id,
            tokens,
            coordinator,
            events,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DeviceSnapshot>> {
        self.coordinator.subscribe()
    }

    /// `None` when the policy has no push channel
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.events.as_ref().map(EventClient::state)
    }

    /// Stop the realtime client, the poller and any motion watch
    pub async fn shutdown(&self) {
        if let Some(events) = &self.events {
            events.stop().await;
        }
        self.coordinator.shutdown().await;
        tracing::info!("[Session] Device {} shut down", self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, CredentialsConfig, DeviceConfig, PollingConfig};
    use crate::models::{Phase, RefreshPolicy};
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
    use tokio_tungstenite::tungstenite::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_cloud(status: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/auth-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": "c"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok", "expires_in": 3600})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/devicestatus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Data": [status]})))
            .mount(&server)
            .await;
        server
    }

    fn config(base_url: String, ws_url: String, policy: RefreshPolicy) -> Config {
        Config {
            credentials: CredentialsConfig {
                client_id: "cid".to_string(),
                client_secret: "secret".to_string(),
                username: "user".to_string(),
                password: "pass".to_string(),
                redirect_uri: "https://beta.cameconnect.net/role".to_string(),
            },
            device: DeviceConfig {
                device_id: "42".to_string(),
            },
            polling: PollingConfig {
                refresh_policy: policy,
                ..PollingConfig::default()
            },
            api: ApiConfig {
                base_url,
                ws_url,
                ..ApiConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn test_periodic_session_seeds_without_push() {
        let server = mock_cloud(json!({"States": [{}, {}, {"Data": [17, 0]}], "Online": true})).await;
        let cfg = config(server.uri(), "ws://127.0.0.1:1/unused".to_string(), RefreshPolicy::Periodic);

        let session = Session::start(&cfg).await.unwrap();
        let snap = session.coordinator().snapshot().unwrap();
        assert_eq!(snap.status_pair(), [17, 0]);
        assert_eq!(snap.online(), Some(true));
        assert_eq!(session.connection_state(), None);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_on_bad_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/auth-code"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let cfg = config(server.uri(), "ws://127.0.0.1:1/unused".to_string(), RefreshPolicy::Hybrid);

        let err = Session::start(&cfg).await.err().unwrap();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_push_session_applies_ws_events() {
        let server = mock_cloud(json!({"States": [{}, {}, {"Data": [17, 0]}]})).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                if let Some(p) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                    resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, p.clone());
                }
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();
            let frame = r#"{"Data":{"EventId":21,"Data":"{\"Payload\":[16]}"}}"#;
            ws.send(Message::Text(frame.to_string())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let cfg = config(
            server.uri(),
            format!("ws://{}/events-real-time", ws_addr),
            RefreshPolicy::PushOnly,
        );
        let session = Session::start(&cfg).await.unwrap();
        let mut rx = session.subscribe();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(snap) = current {
                    if snap.phase() == Some(Phase::Open) {
                        return snap;
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("push update not published");

        assert_eq!(snapshot.status_pair(), [16, 100]);
        assert!(snapshot.last_seen().is_some());
        assert_eq!(session.connection_state(), Some(ConnectionState::Connected));

        session.shutdown().await;
        assert_eq!(session.connection_state(), Some(ConnectionState::Stopped));
    }
}
