//! REST/JSON control plane.
//!
//! Talks to an engine API that exposes image transfers as a collection:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | create | `POST {base}/imagetransfers` |
//! | query | `GET {base}/imagetransfers/{id}` |
//! | extend, pause, resume, finalize, cancel | `POST {base}/imagetransfers/{id}/{action}` |
//! | image metadata | `GET {base}/disks/{id}` or `GET {base}/disksnapshots/{id}` |
//!
//! The API reports numbers as either JSON numbers or decimal strings; both
//! are accepted.

use std::fmt;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};

use super::{ControlPlane, Direction, ImageInfo, ImageRef, Phase, SessionInfo, SignedTicket};
use crate::config::ControlPlaneConfig;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Longest response body quoted in an error message.
const ERROR_BODY_LIMIT: usize = 512;

/// Credentials for the control plane. Held in memory only.
#[derive(Clone, Default)]
pub enum Auth {
    /// No authentication header
    #[default]
    None,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// HTTP basic authentication
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// [`ControlPlane`] backed by the engine's REST API.
#[derive(Debug, Clone)]
pub struct RestControlPlane {
    client: Client,
    base_url: String,
    auth: Auth,
}

impl RestControlPlane {
    /// Create a control-plane client for `base_url` using a prepared HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `base_url` is not an absolute URL.
    pub fn new(client: Client, base_url: &str, auth: Auth) -> Result<Self> {
        reqwest::Url::parse(base_url).map_err(|e| {
            Error::InvalidInput(format!("invalid control plane URL '{base_url}': {e}"))
        })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    /// Create a control-plane client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA bundle cannot be read or the URL is invalid.
    pub fn from_config(config: &ControlPlaneConfig, auth: Auth) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .danger_accept_invalid_certs(config.insecure);

        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file)?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| Error::Tls(format!("invalid CA bundle {}: {e}", ca_file.display())))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::ControlPlane(format!("failed to build HTTP client: {e}")))?;

        Self::new(client, &config.url, auth)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.auth {
            Auth::None => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::ControlPlane(format!("{what}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(what, status, &body))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str, what: &str) -> Result<T> {
        self.send(self.client.get(self.url(path)), what)
            .await?
            .json()
            .await
            .map_err(|e| Error::ControlPlane(format!("{what}: invalid response: {e}")))
    }

    async fn action(&self, id: &str, action: &str) -> Result<()> {
        let what = format!("{action} session {id}");
        let request = self
            .client
            .post(self.url(&format!("imagetransfers/{id}/{action}")))
            .json(&serde_json::json!({}));
        self.send(request, &what).await.map(drop)
    }
}

impl ControlPlane for RestControlPlane {
    async fn create_session(&self, image: &ImageRef, direction: Direction) -> Result<SessionInfo> {
        let target = IdRef { id: image.id() };
        let body = CreateTransfer {
            disk: (!image.is_snapshot()).then_some(target),
            snapshot: image.is_snapshot().then_some(target),
            direction,
        };

        let what = format!("create {direction} session for {image}");
        let request = self.client.post(self.url("imagetransfers")).json(&body);
        let payload: TransferPayload = match self.send(request, &what).await {
            Ok(response) => response
                .json()
                .await
                .map_err(|e| Error::SessionCreation(format!("{what}: invalid response: {e}")))?,
            Err(Error::ControlPlane(msg)) => return Err(Error::SessionCreation(msg)),
            Err(e) => return Err(e),
        };

        Ok(payload.into())
    }

    async fn get_session(&self, id: &str) -> Result<SessionInfo> {
        let payload: TransferPayload = self
            .get_json(&format!("imagetransfers/{id}"), &format!("query session {id}"))
            .await?;
        Ok(payload.into())
    }

    async fn extend_session(&self, id: &str) -> Result<()> {
        self.action(id, "extend").await
    }

    async fn pause_session(&self, id: &str) -> Result<()> {
        self.action(id, "pause").await
    }

    async fn resume_session(&self, id: &str) -> Result<()> {
        self.action(id, "resume").await
    }

    async fn finalize_session(&self, id: &str) -> Result<()> {
        self.action(id, "finalize").await
    }

    async fn cancel_session(&self, id: &str) -> Result<()> {
        self.action(id, "cancel").await
    }

    async fn image_info(&self, image: &ImageRef) -> Result<ImageInfo> {
        let path = match image {
            ImageRef::Disk(id) => format!("disks/{id}"),
            ImageRef::Snapshot(id) => format!("disksnapshots/{id}"),
        };
        let payload: ImagePayload = self.get_json(&path, &format!("look up {image}")).await?;
        Ok(payload.into())
    }
}

fn status_error(what: &str, status: StatusCode, body: &str) -> Error {
    let mut body = body.trim().to_string();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }

    if body.is_empty() {
        Error::ControlPlane(format!("{what}: HTTP {status}"))
    } else {
        Error::ControlPlane(format!("{what}: HTTP {status}: {body}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct IdRef<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateTransfer<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    disk: Option<IdRef<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<IdRef<'a>>,
    direction: Direction,
}

#[derive(Debug, Deserialize)]
struct TransferPayload {
    id: String,
    phase: String,
    #[serde(default)]
    proxy_url: String,
    #[serde(default)]
    signed_ticket: String,
}

impl From<TransferPayload> for SessionInfo {
    fn from(payload: TransferPayload) -> Self {
        Self {
            id: payload.id,
            phase: Phase::from_wire(&payload.phase),
            proxy_url: payload.proxy_url,
            signed_ticket: SignedTicket::new(payload.signed_ticket),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImagePayload {
    #[serde(default, deserialize_with = "lenient_u64")]
    provisioned_size: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    actual_size: u64,
    #[serde(default)]
    format: String,
    #[serde(default)]
    storage_domains: Option<StorageDomains>,
}

#[derive(Debug, Deserialize)]
struct StorageDomains {
    #[serde(default)]
    storage_domain: Vec<DomainRef>,
}

#[derive(Debug, Deserialize)]
struct DomainRef {
    id: String,
}

impl From<ImagePayload> for ImageInfo {
    fn from(payload: ImagePayload) -> Self {
        Self {
            provisioned_size: payload.provisioned_size,
            actual_size: payload.actual_size,
            format: payload.format,
            storage_domain_id: payload
                .storage_domains
                .and_then(|d| d.storage_domain.into_iter().next())
                .map(|d| d.id),
        }
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }

    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
