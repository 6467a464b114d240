//! The sync client: a handle the UI holds plus a driver task that owns the
//! transport, the subscription registry and the dedup table.
//!
//! Every mutation of connection state happens on the driver task, so the
//! registry and the retry timer never race. The handle talks to it over a
//! command channel and observes it through a status watch and two
//! broadcast streams.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{
    ApiError, Category, CheckinRequest, CheckinResponse, CheckoutRequest, CheckoutResult,
    ParkingApi, UpdateCategoryRequest,
};
use crate::cache::{CachePort, QueryCache, Snapshot};
use crate::config::Config;
use crate::connection::{Action, ConnectionEvent, ConnectionStatus, Input, RetryPolicy};
use crate::dedup::EventDeduplicator;
use crate::dispatch::{log_dispatch_error, Dispatcher};
use crate::reconcile::{Reconciled, Reconciler};
use crate::refresh::{run_refresh_loop, Refresher};
use crate::session::{SessionStore, StaticSession};
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::{Connector, Link, TransportError, TransportEvent, WsConnector};
use crate::types::{AdminUpdate, ClientMsg, CollectionKey, Entity, EntityError, RateChange, Zone};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("sync driver is not running")]
    DriverStopped,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid zone snapshot: {0}")]
    InvalidZone(#[from] EntityError),
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Link, TransportError>> + Send>>;

pub struct SyncClientBuilder {
    config: Config,
    api: Arc<dyn ParkingApi>,
    connector: Arc<dyn Connector>,
    session: Arc<dyn SessionStore>,
    cache: Arc<dyn CachePort>,
}

impl SyncClientBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn session(mut self, session: Arc<dyn SessionStore>) -> Self {
        self.session = session;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CachePort>) -> Self {
        self.cache = cache;
        self
    }

    /// Starts the driver and refresh tasks. Must be called inside a tokio
    /// runtime. The client stays disconnected until [`SyncClient::connect`].
    pub fn spawn(self) -> SyncClient {
        let Self {
            config,
            api,
            connector,
            session,
            cache,
        } = self;

        let buffer = config.event_buffer.max(1);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(buffer);
        let (audit_tx, _) = broadcast::channel(buffer);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        let reconciler = Reconciler::new(cache.clone());
        let refresher = Arc::new(Refresher::new(
            cache.clone(),
            api.clone(),
            config.refresh_concurrency,
        ));
        tokio::spawn(run_refresh_loop(refresher.clone(), refresh_rx));

        let dispatcher = Dispatcher::new(
            reconciler.clone(),
            EventDeduplicator::new(config.dedup_window, config.dedup_retention),
            audit_tx.clone(),
        );
        let (driver, status_rx) = Driver::new(
            &config,
            connector,
            session,
            dispatcher,
            events_tx.clone(),
            refresh_tx.clone(),
        );
        let driver = tokio::spawn(driver.run(cmd_rx));

        SyncClient {
            cmd_tx,
            status_rx,
            events_tx,
            audit_tx,
            refresh_tx,
            api,
            cache,
            reconciler,
            refresher,
            driver: Some(driver),
        }
    }
}

/// Handle to a running sync client. Dropping it stops the driver.
pub struct SyncClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    audit_tx: broadcast::Sender<AdminUpdate>,
    refresh_tx: mpsc::UnboundedSender<CollectionKey>,
    api: Arc<dyn ParkingApi>,
    cache: Arc<dyn CachePort>,
    reconciler: Reconciler,
    refresher: Arc<Refresher>,
    driver: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn builder(config: Config, api: Arc<dyn ParkingApi>) -> SyncClientBuilder {
        let session = Arc::new(StaticSession::new(config.auth_token.as_deref()));
        SyncClientBuilder {
            config,
            api,
            connector: Arc::new(WsConnector),
            session,
            cache: Arc::new(QueryCache::new()),
        }
    }

    fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.cmd_tx.send(cmd).map_err(|_| ClientError::DriverStopped)
    }

    /// Opens the connection. No effect while already open or connecting;
    /// after retries ran out this starts a fresh cycle.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.send(Command::Connect)
    }

    /// Closes the connection and cancels any pending reconnect.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.send(Command::Disconnect)
    }

    /// Adds `gate_id` to the subscription set. Sent immediately when open,
    /// otherwise on the next successful open.
    pub fn subscribe(&self, gate_id: &str) -> Result<(), ClientError> {
        self.send(Command::Subscribe(gate_id.to_string()))
    }

    pub fn unsubscribe(&self, gate_id: &str) -> Result<(), ClientError> {
        self.send(Command::Unsubscribe(gate_id.to_string()))
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// Admin events after deduplication, for audit displays.
    pub fn audit_events(&self) -> broadcast::Receiver<AdminUpdate> {
        self.audit_tx.subscribe()
    }

    pub fn cache(&self) -> &Arc<dyn CachePort> {
        &self.cache
    }

    pub async fn zones(&self, gate_id: Option<&str>) -> Result<Snapshot, ClientError> {
        let key = match gate_id {
            Some(gate_id) => CollectionKey::zones_for_gate(gate_id),
            None => CollectionKey::zones(),
        };
        Ok(self.refresher.read(&key).await?)
    }

    pub async fn parking_state(&self) -> Result<Snapshot, ClientError> {
        Ok(self.refresher.read(&CollectionKey::parking_state()).await?)
    }

    pub async fn check_in(&self, request: &CheckinRequest) -> Result<CheckinResponse, ClientError> {
        let response = self.api.check_in(request).await?;
        self.apply_zone(&response.zone_state)?;
        Ok(response)
    }

    pub async fn check_out(&self, request: &CheckoutRequest) -> Result<CheckoutResult, ClientError> {
        let result = self.api.check_out(request).await?;
        match &result.zone_state {
            Some(zone) => self.apply_zone(zone)?,
            None => self.schedule_refresh(self.reconciler.invalidate_zones()),
        }
        Ok(result)
    }

    pub async fn update_category_rates(
        &self,
        category_id: &str,
        request: &UpdateCategoryRequest,
    ) -> Result<Category, ClientError> {
        let category = self.api.update_category(category_id, request).await?;
        let change = RateChange {
            rate_normal: Some(category.rate_normal),
            rate_special: Some(category.rate_special),
        };
        let out = self.reconciler.apply_category_rates(&category.id, &change);
        self.schedule_refresh(out);
        Ok(category)
    }

    pub async fn set_zone_open(&self, zone_id: &str, open: bool) -> Result<(), ClientError> {
        self.api.set_zone_open(zone_id, open).await?;
        let out = self.reconciler.apply_zone_open(zone_id, open);
        self.schedule_refresh(out);
        Ok(())
    }

    fn apply_zone(&self, zone: &Zone) -> Result<(), ClientError> {
        let entity = Entity::try_from(zone)?;
        let out = self.reconciler.apply_zone_update(&entity);
        self.schedule_refresh(out);
        Ok(())
    }

    fn schedule_refresh(&self, out: Reconciled) {
        for key in out.refresh {
            if self.refresh_tx.send(key).is_err() {
                debug!("refresh loop stopped");
            }
        }
    }

    /// Closes the connection and waits for the driver to finish.
    pub async fn shutdown(mut self) {
        let _ = self.send(Command::Shutdown);
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                error!(error = %e, "sync driver panicked");
            }
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

struct Driver {
    endpoint: String,
    policy: RetryPolicy,
    sweep_interval: Duration,
    connector: Arc<dyn Connector>,
    session: Arc<dyn SessionStore>,
    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    registry: SubscriptionRegistry,
    dispatcher: Dispatcher,
    refresh_tx: mpsc::UnboundedSender<CollectionKey>,
    link: Option<Link>,
    pending: Option<ConnectFuture>,
    retry_at: Option<Instant>,
    connection_id: Option<Uuid>,
}

impl Driver {
    fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        session: Arc<dyn SessionStore>,
        dispatcher: Dispatcher,
        events_tx: broadcast::Sender<ConnectionEvent>,
        refresh_tx: mpsc::UnboundedSender<CollectionKey>,
    ) -> (Self, watch::Receiver<ConnectionStatus>) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let driver = Self {
            endpoint: config.ws_url.clone(),
            policy: config.retry.clone(),
            sweep_interval: config.dedup_sweep_interval,
            connector,
            session,
            status: ConnectionStatus::default(),
            status_tx,
            events_tx,
            registry: SubscriptionRegistry::new(),
            dispatcher,
            refresh_tx,
            link: None,
            pending: None,
            retry_at: None,
            connection_id: None,
        };
        (driver, status_rx)
    }

    fn sweep_timer(&self) -> Interval {
        let period = self.sweep_interval.max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut sweep = self.sweep_timer();
        while self.step(&mut cmd_rx, &mut sweep).await {}

        self.apply(Input::Disconnect).await;
        info!("sync driver stopped");
    }

    /// Services one event. `false` once the handle asked to stop.
    async fn step(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        sweep: &mut Interval,
    ) -> bool {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Shutdown) | None => return false,
                Some(cmd) => self.handle_command(cmd).await,
            },
            result = poll_connect(&mut self.pending) => {
                self.pending = None;
                self.on_connect_result(result).await;
            }
            event = next_event(&mut self.link) => self.on_transport_event(event).await,
            _ = retry_timer(self.retry_at) => {
                self.retry_at = None;
                self.apply(Input::RetryElapsed).await;
            }
            _ = sweep.tick() => self.dispatcher.sweep(Instant::now()),
        }
        true
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.apply(Input::Connect).await,
            Command::Disconnect => self.apply(Input::Disconnect).await,
            Command::Subscribe(gate_id) => {
                let open = self.status.is_open();
                if let Some(msg) = self.registry.subscribe(&gate_id, open) {
                    self.send_frame(msg).await;
                }
            }
            Command::Unsubscribe(gate_id) => {
                let open = self.status.is_open();
                if let Some(msg) = self.registry.unsubscribe(&gate_id, open) {
                    self.send_frame(msg).await;
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn apply(&mut self, input: Input) {
        let (next, actions) = self.status.apply(input, &self.policy);
        self.status = next;
        for action in actions {
            self.perform(action).await;
        }
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::OpenTransport => self.open_transport(),
            Action::CloseTransport => self.close_transport().await,
            Action::ReplaySubscriptions => {
                let frames = self.registry.replay();
                info!(
                    connection_id = ?self.connection_id,
                    count = frames.len(),
                    "replaying subscriptions"
                );
                for msg in frames {
                    self.send_frame(msg).await;
                }
            }
            Action::ScheduleReconnect(delay) => {
                info!(
                    attempt = self.status.attempts,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            Action::CancelReconnect => self.retry_at = None,
            Action::Emit(event) => self.emit(event),
        }
    }

    fn open_transport(&mut self) {
        // a stale link from a previous cycle must not feed events
        self.link = None;

        let connection_id = Uuid::new_v4();
        self.connection_id = Some(connection_id);
        info!(%connection_id, endpoint = %self.endpoint, "opening connection");

        let connector = self.connector.clone();
        let endpoint = self.endpoint.clone();
        let session = self.session.current();
        self.pending = Some(Box::pin(async move {
            connector.connect(&endpoint, session.as_ref()).await
        }));
    }

    async fn close_transport(&mut self) {
        self.pending = None;
        let Some(mut link) = self.link.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, link.sink.close()).await {
            Ok(Ok(())) => debug!(connection_id = ?self.connection_id, "connection closed"),
            Ok(Err(e)) => debug!(error = %e, "error while closing connection"),
            Err(_) => debug!("timed out closing connection"),
        }
    }

    async fn on_connect_result(&mut self, result: Result<Link, TransportError>) {
        match result {
            Ok(link) => {
                info!(connection_id = ?self.connection_id, "connection open");
                self.link = Some(link);
                self.apply(Input::Opened).await;
            }
            Err(e) => {
                warn!(connection_id = ?self.connection_id, error = %e, "connection attempt failed");
                let reason = e.to_string();
                self.apply(Input::Errored {
                    reason: reason.clone(),
                })
                .await;
                self.apply(Input::Closed {
                    reason: Some(reason),
                })
                .await;
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Text(text) => self.on_frame(&text),
            TransportEvent::Closed(reason) => {
                info!(connection_id = ?self.connection_id, ?reason, "connection closed by peer");
                self.link = None;
                self.apply(Input::Closed { reason }).await;
            }
            TransportEvent::Error(reason) => {
                warn!(connection_id = ?self.connection_id, %reason, "transport error");
                self.link = None;
                self.apply(Input::Errored {
                    reason: reason.clone(),
                })
                .await;
                self.apply(Input::Closed {
                    reason: Some(reason),
                })
                .await;
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        match self.dispatcher.dispatch(text, Instant::now()) {
            Ok(out) => {
                for key in out.refresh {
                    if self.refresh_tx.send(key).is_err() {
                        debug!("refresh loop stopped");
                    }
                }
            }
            Err(e) => {
                log_dispatch_error(&e);
                self.status.last_error = Some(e.to_string());
                self.publish();
            }
        }
    }

    async fn send_frame(&mut self, msg: ClientMsg) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let text = match serde_json::to_string(&msg) {
            Ok(t) => t,
            Err(e) => {
                error!("failed to serialize client msg: {e}");
                return;
            }
        };

        let result = link.sink.send(text).await;
        if let Err(e) = result {
            warn!(connection_id = ?self.connection_id, error = %e, ?msg, "failed to send frame");
            self.status.last_error = Some(e.to_string());
            self.publish();
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::Connected => info!("connected"),
            ConnectionEvent::Restored => info!("connection restored"),
            ConnectionEvent::Lost { reason, attempt } => {
                warn!(%reason, attempt, "connection lost")
            }
            ConnectionEvent::Error { reason } => warn!(%reason, "connection error"),
            ConnectionEvent::Exhausted { attempts } => {
                error!(attempts, "failed to reconnect, giving up until connect is called")
            }
        }
        if self.events_tx.send(event).is_err() {
            debug!("no connection event subscribers");
        }
    }
}

async fn poll_connect(pending: &mut Option<ConnectFuture>) -> Result<Link, TransportError> {
    match pending.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_event(link: &mut Option<Link>) -> TransportEvent {
    match link.as_mut() {
        Some(link) => link
            .stream
            .next()
            .await
            .unwrap_or(TransportEvent::Closed(None)),
        None => std::future::pending().await,
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
