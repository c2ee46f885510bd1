//! Matrix room sink using the client-server HTTP API

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::{NotifyError, NotifySink};

/// Matrix settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Send notifications to Matrix at all
    pub enabled: bool,

    /// Homeserver base URL, e.g. `https://matrix.org`
    #[serde(rename = "home-server")]
    pub home_server: String,

    pub username: String,

    pub password: String,

    /// Room to post into, e.g. `!abcdef:matrix.org`
    #[serde(rename = "room-id")]
    pub room_id: String,
}

impl MatrixConfig {
    /// Names of required fields that are empty
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.home_server.is_empty() {
            missing.push("home-server");
        }
        if self.username.is_empty() {
            missing.push("username");
        }
        if self.password.is_empty() {
            missing.push("password");
        }
        if self.room_id.is_empty() {
            missing.push("room-id");
        }
        missing
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
}

/// Posts `m.text` messages into one room
pub struct MatrixSink {
    client: Client,
    base: Url,
    room_id: String,
    access_token: String,
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, NotifyError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| NotifyError::InvalidResponse(format!("homeserver URL {base} cannot take a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

impl MatrixSink {
    /// Log in with the configured password and return a ready sink
    pub async fn login(config: &MatrixConfig) -> Result<Self, NotifyError> {
        debug!(home_server = %config.home_server, user = %config.username, "MatrixSink::login: called");
        let base = Url::parse(&config.home_server)
            .map_err(|e| NotifyError::InvalidResponse(format!("invalid homeserver URL: {e}")))?;
        let client = Client::new();

        let url = endpoint(&base, &["_matrix", "client", "v3", "login"])?;
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": config.username },
            "password": config.password,
        });

        let resp = client.post(url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                service: "matrix",
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let login: LoginResponse = resp.json().await?;
        info!(user = %config.username, "Logged in to Matrix");

        Ok(Self {
            client,
            base,
            room_id: config.room_id.clone(),
            access_token: login.access_token,
        })
    }

    fn send_url(&self, txn_id: &str) -> Result<Url, NotifyError> {
        endpoint(
            &self.base,
            &[
                "_matrix",
                "client",
                "v3",
                "rooms",
                &self.room_id,
                "send",
                "m.room.message",
                txn_id,
            ],
        )
    }
}

#[async_trait]
impl NotifySink for MatrixSink {
    async fn deliver(&self, message: &str) -> Result<(), NotifyError> {
        let txn_id = Uuid::now_v7().to_string();
        let url = self.send_url(&txn_id)?;
        debug!(%url, "MatrixSink::deliver: sending");

        let resp = self
            .client
            .put(url)
            .bearer_auth(&self.access_token)
            .json(&json!({ "msgtype": "m.text", "body": message }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                service: "matrix",
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
