use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::session::SessionStore;
use crate::types::{CollectionKey, CollectionKind, Entity, Zone};

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketKind {
    Visitor,
    Subscriber,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinRequest {
    pub gate_id: String,
    pub zone_id: String,
    #[serde(rename = "type")]
    pub kind: TicketKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinResponse {
    pub ticket: Value,
    pub zone_state: Zone,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub ticket_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_convert_to_visitor: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownSegment {
    pub from: String,
    pub to: String,
    pub hours: f64,
    pub rate: f64,
    pub amount: f64,
    pub rate_mode: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResult {
    pub ticket_id: String,
    pub checkin_at: String,
    pub checkout_at: String,
    pub duration_hours: f64,
    #[serde(default)]
    pub breakdown: Vec<BreakdownSegment>,
    pub amount: f64,
    #[serde(default)]
    pub zone_state: Option<Zone>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rate_normal: f64,
    pub rate_special: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCategoryRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_normal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_special: Option<f64>,
}

/// The REST request layer. Mutations return the affected snapshot so the
/// caller can reconcile the cache without waiting for a push.
#[async_trait]
pub trait ParkingApi: Send + Sync {
    async fn fetch_zones(&self, gate_id: Option<&str>) -> Result<Vec<Entity>, ApiError>;

    async fn fetch_parking_state(&self) -> Result<Vec<Entity>, ApiError>;

    async fn check_in(&self, request: &CheckinRequest) -> Result<CheckinResponse, ApiError>;

    async fn check_out(&self, request: &CheckoutRequest) -> Result<CheckoutResult, ApiError>;

    async fn update_category(
        &self,
        category_id: &str,
        request: &UpdateCategoryRequest,
    ) -> Result<Category, ApiError>;

    async fn set_zone_open(&self, zone_id: &str, open: bool) -> Result<(), ApiError>;
}

/// Fetches whatever backs `key`.
pub async fn fetch_collection(
    api: &dyn ParkingApi,
    key: &CollectionKey,
) -> Result<Vec<Entity>, ApiError> {
    match key.kind {
        CollectionKind::Zones => api.fetch_zones(key.scope.as_deref()).await,
        CollectionKind::ParkingState => api.fetch_parking_state().await,
    }
}

pub struct HttpParkingApi {
    client: Client,
    base_url: String,
    session: Arc<dyn SessionStore>,
}

impl HttpParkingApi {
    pub fn new(base_url: &str, session: Arc<dyn SessionStore>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.session.current() {
            Some(session) => builder.header(reqwest::header::AUTHORIZATION, session.bearer()),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let resp = check_status(self.authorized(builder).send().await?).await?;
        Ok(resp.json().await?)
    }
}

async fn check_status(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
        .unwrap_or(body);
    warn!(status = status.as_u16(), %message, "request rejected");

    Err(ApiError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ParkingApi for HttpParkingApi {
    async fn fetch_zones(&self, gate_id: Option<&str>) -> Result<Vec<Entity>, ApiError> {
        let mut builder = self.client.get(self.url("/master/zones"));
        if let Some(gate_id) = gate_id {
            builder = builder.query(&[("gateId", gate_id)]);
        }
        self.send(builder).await
    }

    async fn fetch_parking_state(&self) -> Result<Vec<Entity>, ApiError> {
        self.send(self.client.get(self.url("/admin/reports/parking-state")))
            .await
    }

    async fn check_in(&self, request: &CheckinRequest) -> Result<CheckinResponse, ApiError> {
        self.send(self.client.post(self.url("/tickets/checkin")).json(request))
            .await
    }

    async fn check_out(&self, request: &CheckoutRequest) -> Result<CheckoutResult, ApiError> {
        self.send(self.client.post(self.url("/tickets/checkout")).json(request))
            .await
    }

    async fn update_category(
        &self,
        category_id: &str,
        request: &UpdateCategoryRequest,
    ) -> Result<Category, ApiError> {
        let url = self.url(&format!("/admin/categories/{category_id}"));
        self.send(self.client.put(url).json(request)).await
    }

    async fn set_zone_open(&self, zone_id: &str, open: bool) -> Result<(), ApiError> {
        let url = self.url(&format!("/admin/zones/{zone_id}/open"));
        let builder = self.client.put(url).json(&serde_json::json!({ "open": open }));
        check_status(self.authorized(builder).send().await?).await?;
        Ok(())
    }
}
