//! In-memory transport and request layer for driving the client in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::SinkExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::api::{
    ApiError, Category, CheckinRequest, CheckinResponse, CheckoutRequest, CheckoutResult,
    ParkingApi, UpdateCategoryRequest,
};
use crate::session::Session;
use crate::transport::{Connector, Link, TransportError, TransportEvent};
use crate::types::{ClientMsg, Entity, Zone};

/// The test side of one accepted connection.
pub struct MockLink {
    pub outbound: fmpsc::UnboundedReceiver<String>,
    pub inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl MockLink {
    pub fn push(&self, text: &str) {
        let _ = self.inbound.send(TransportEvent::Text(text.to_string()));
    }

    pub fn close(&self) {
        let _ = self.inbound.send(TransportEvent::Closed(None));
    }

    /// Every frame the client has sent so far.
    pub fn drain(&mut self) -> Vec<ClientMsg> {
        let mut frames = Vec::new();
        while let Ok(Some(text)) = self.outbound.try_next() {
            frames.push(serde_json::from_str(&text).expect("client sent invalid frame"));
        }
        frames
    }
}

pub struct MockConnector {
    fail_all: AtomicBool,
    pub attempts: AtomicUsize,
    links_tx: mpsc::UnboundedSender<MockLink>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockLink>) {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            fail_all: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            links_tx,
        });
        (connector, links_rx)
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &str, _session: Option<&Session>) -> Result<Link, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(TransportError::Refused(503));
        }

        let (out_tx, out_rx) = fmpsc::unbounded::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.links_tx.send(MockLink {
            outbound: out_rx,
            inbound: in_tx,
        });

        Ok(Link {
            sink: Box::pin(out_tx.sink_map_err(|_| TransportError::Closed)),
            stream: Box::pin(UnboundedReceiverStream::new(in_rx)),
        })
    }
}

pub fn zone(id: &str, category_id: &str, occupied: u32) -> Zone {
    Zone {
        id: id.into(),
        name: format!("Zone {id}"),
        category_id: category_id.into(),
        gate_ids: vec!["gate_1".into()],
        total_slots: 100,
        occupied,
        free: 100 - occupied,
        reserved: 0,
        available_for_visitors: 100 - occupied,
        available_for_subscribers: 0,
        rate_normal: 5.0,
        rate_special: 8.0,
        open: true,
    }
}

#[derive(Default)]
pub struct MockApi {
    zones: Mutex<HashMap<Option<String>, Vec<Entity>>>,
    parking_state: Mutex<Vec<Entity>>,
    zone_state: Mutex<Option<Zone>>,
    failure: Mutex<Option<u16>>,
    pub fetches: AtomicUsize,
}

impl MockApi {
    pub fn set_zones(&self, gate_id: Option<&str>, zones: Vec<Entity>) {
        self.zones
            .lock()
            .unwrap()
            .insert(gate_id.map(String::from), zones);
    }

    pub fn set_parking_state(&self, entries: Vec<Entity>) {
        *self.parking_state.lock().unwrap() = entries;
    }

    /// Zone snapshot returned by check-in and checkout.
    pub fn set_zone_state(&self, zone: Zone) {
        *self.zone_state.lock().unwrap() = Some(zone);
    }

    pub fn fail_with(&self, status: u16) {
        *self.failure.lock().unwrap() = Some(status);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    fn check(&self) -> Result<(), ApiError> {
        match *self.failure.lock().unwrap() {
            Some(status) => Err(ApiError::Rejected {
                status,
                message: "mock failure".into(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ParkingApi for MockApi {
    async fn fetch_zones(&self, gate_id: Option<&str>) -> Result<Vec<Entity>, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let zones = self.zones.lock().unwrap();
        Ok(zones
            .get(&gate_id.map(String::from))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_parking_state(&self) -> Result<Vec<Entity>, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.parking_state.lock().unwrap().clone())
    }

    async fn check_in(&self, request: &CheckinRequest) -> Result<CheckinResponse, ApiError> {
        self.check()?;
        let zone_state = self
            .zone_state
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| zone(&request.zone_id, "cat_a", 1));
        Ok(CheckinResponse {
            ticket: json!({"id": "t_1", "zoneId": request.zone_id, "gateId": request.gate_id}),
            zone_state,
        })
    }

    async fn check_out(&self, request: &CheckoutRequest) -> Result<CheckoutResult, ApiError> {
        self.check()?;
        Ok(CheckoutResult {
            ticket_id: request.ticket_id.clone(),
            checkin_at: "2025-01-01T10:00:00Z".into(),
            checkout_at: "2025-01-01T12:00:00Z".into(),
            duration_hours: 2.0,
            breakdown: Vec::new(),
            amount: 10.0,
            zone_state: self.zone_state.lock().unwrap().clone(),
        })
    }

    async fn update_category(
        &self,
        category_id: &str,
        request: &UpdateCategoryRequest,
    ) -> Result<Category, ApiError> {
        self.check()?;
        Ok(Category {
            id: category_id.into(),
            name: request.name.clone().unwrap_or_else(|| "Category".into()),
            description: request.description.clone(),
            rate_normal: request.rate_normal.unwrap_or(5.0),
            rate_special: request.rate_special.unwrap_or(8.0),
        })
    }

    async fn set_zone_open(&self, _zone_id: &str, _open: bool) -> Result<(), ApiError> {
        self.check()
    }
}
