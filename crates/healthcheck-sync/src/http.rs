//! `reqwest` implementations of the collaborator traits.
//!
//! Every client shares one [`reqwest::Client`] configuration: a connect
//! timeout, a total request timeout and a JSON body. Non-2xx responses map to
//! [`Error::Status`] so the retry policy can tell rate limiting and server
//! errors from permanent failures.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::{
  Error, Result,
  collaborator::{Column, FlowContact, FlowEngine, MessagingPlatform, Warehouse},
};

// ─── Shared plumbing ─────────────────────────────────────────────────────────

/// How a service expects its token to be presented.
#[derive(Clone, Copy)]
enum AuthScheme {
  /// `Authorization: Token <token>`
  Token,
  /// `Authorization: Bearer <token>`
  Bearer,
}

#[derive(Clone)]
struct Endpoint {
  service:  &'static str,
  client:   Client,
  base_url: String,
  token:    String,
  scheme:   AuthScheme,
}

impl fmt::Debug for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Endpoint")
      .field("service", &self.service)
      .field("base_url", &self.base_url)
      .field("token", &"<REDACTED>")
      .finish()
  }
}

impl Endpoint {
  fn new(
    service: &'static str,
    base_url: &str,
    token: &str,
    scheme: AuthScheme,
    connect_timeout: Duration,
    request_timeout: Duration,
  ) -> Result<Self> {
    if base_url.trim().is_empty() {
      return Err(Error::Config(format!("{service} url is empty")));
    }
    if token.trim().is_empty() {
      return Err(Error::Config(format!("{service} token is empty")));
    }
    let client = Client::builder()
      .connect_timeout(connect_timeout)
      .timeout(request_timeout)
      .build()
      .map_err(|e| Error::Config(format!("{service} http client: {e}")))?;

    Ok(Self {
      service,
      client,
      base_url: base_url.trim_end_matches('/').to_owned(),
      token: token.to_owned(),
      scheme,
    })
  }

  fn url(&self, path: &str) -> String { format!("{}{path}", self.base_url) }

  fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
    let builder = self.client.request(method, self.url(path));
    match self.scheme {
      AuthScheme::Token => builder.header("Authorization", format!("Token {}", self.token)),
      AuthScheme::Bearer => builder.bearer_auth(&self.token),
    }
  }

  /// Send and map transport failures and non-2xx statuses to [`Error`].
  async fn send(&self, builder: RequestBuilder) -> Result<Response> {
    let response = builder.send().await.map_err(|e| Error::Transport {
      service: self.service,
      message: e.to_string(),
    })?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(service = self.service, %status, "collaborator rejected request");
    Err(Error::Status { service: self.service, status: status.as_u16(), body })
  }

  async fn json<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
    response.json().await.map_err(|e| Error::Malformed {
      service: self.service,
      message: e.to_string(),
    })
  }
}

// ─── Flow engine ─────────────────────────────────────────────────────────────

/// Flow engine speaking a RapidPro-style v2 API.
#[derive(Debug, Clone)]
pub struct HttpFlowEngine {
  endpoint: Endpoint,
}

#[derive(Deserialize)]
struct ContactPage {
  #[serde(default)]
  results: Vec<FlowContact>,
}

impl HttpFlowEngine {
  pub fn new(
    base_url: &str,
    token: &str,
    connect_timeout: Duration,
    request_timeout: Duration,
  ) -> Result<Self> {
    let endpoint = Endpoint::new(
      "flow engine",
      base_url,
      token,
      AuthScheme::Token,
      connect_timeout,
      request_timeout,
    )?;
    Ok(Self { endpoint })
  }
}

#[async_trait]
impl FlowEngine for HttpFlowEngine {
  async fn list_contacts(&self, urn: &str) -> Result<Vec<FlowContact>> {
    let builder = self
      .endpoint
      .request(reqwest::Method::GET, "/api/v2/contacts.json")
      .query(&[("urn", urn)]);
    let response = self.endpoint.send(builder).await?;
    let page: ContactPage = self.endpoint.json(response).await?;
    Ok(page.results)
  }

  async fn create_contact(
    &self,
    urn: &str,
    name: Option<&str>,
    fields: &Map<String, Value>,
  ) -> Result<FlowContact> {
    let mut body = json!({ "urns": [urn], "fields": fields });
    if let Some(name) = name {
      body["name"] = Value::from(name);
    }
    let builder = self
      .endpoint
      .request(reqwest::Method::POST, "/api/v2/contacts.json")
      .json(&body);
    let response = self.endpoint.send(builder).await?;
    self.endpoint.json(response).await
  }

  async fn create_flow_start(&self, urns: &[String], flow_id: &str, extra: &Value) -> Result<()> {
    let body = json!({ "flow": flow_id, "urns": urns, "extra": extra });
    let builder = self
      .endpoint
      .request(reqwest::Method::POST, "/api/v2/flow_starts.json")
      .json(&body);
    self.endpoint.send(builder).await?;
    Ok(())
  }
}

// ─── Warehouse ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpWarehouse {
  endpoint: Endpoint,
}

#[derive(Deserialize)]
struct MaxResponse {
  max: Option<DateTime<Utc>>,
}

impl HttpWarehouse {
  pub fn new(
    base_url: &str,
    token: &str,
    connect_timeout: Duration,
    request_timeout: Duration,
  ) -> Result<Self> {
    let endpoint = Endpoint::new(
      "warehouse",
      base_url,
      token,
      AuthScheme::Bearer,
      connect_timeout,
      request_timeout,
    )?;
    Ok(Self { endpoint })
  }
}

#[async_trait]
impl Warehouse for HttpWarehouse {
  async fn load_rows(
    &self,
    dataset: &str,
    table: &str,
    schema: &[Column],
    rows: &[Value],
  ) -> Result<()> {
    let path = format!("/datasets/{dataset}/tables/{table}/rows");
    let builder = self
      .endpoint
      .request(reqwest::Method::POST, &path)
      .json(&json!({ "schema": schema, "rows": rows }));
    self.endpoint.send(builder).await?;
    Ok(())
  }

  async fn query_max(
    &self,
    dataset: &str,
    table: &str,
    field: &str,
  ) -> Result<Option<DateTime<Utc>>> {
    let path = format!("/datasets/{dataset}/tables/{table}/max");
    let builder = self
      .endpoint
      .request(reqwest::Method::GET, &path)
      .query(&[("field", field)]);
    match self.endpoint.send(builder).await {
      Ok(response) => Ok(self.endpoint.json::<MaxResponse>(response).await?.max),
      // Table not created yet.
      Err(Error::Status { status: 404, .. }) => Ok(None),
      Err(e) => Err(e),
    }
  }
}

// ─── Messaging platform ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpMessaging {
  endpoint: Endpoint,
}

impl HttpMessaging {
  pub fn new(
    base_url: &str,
    token: &str,
    connect_timeout: Duration,
    request_timeout: Duration,
  ) -> Result<Self> {
    let endpoint = Endpoint::new(
      "messaging platform",
      base_url,
      token,
      AuthScheme::Bearer,
      connect_timeout,
      request_timeout,
    )?;
    Ok(Self { endpoint })
  }
}

#[async_trait]
impl MessagingPlatform for HttpMessaging {
  async fn patch_contact_profile(&self, contact_id: &str, fields: &Value) -> Result<()> {
    let path = format!("/v1/contacts/{contact_id}/profile");
    let builder = self.endpoint.request(reqwest::Method::PATCH, &path).json(fields);
    self.endpoint.send(builder).await?;
    Ok(())
  }
}
