//! The connection scheduler: owns every account, drives reconnects with
//! backoff, keeps idle streams alive and routes outbound stanzas.
//!
//! All decisions happen on the periodic tick, which never performs socket
//! IO itself: connects run in spawned tasks that report back through the
//! attempt ids handed out by [`AccountConnection`], and keepalive or
//! capability sends go through a bounded task pool so one stuck stream
//! cannot starve the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{Account, ConnectConfig};
use crate::caps::{self, CapabilityQuery, VerificationCache};
use crate::connection::{Connection, PING_NS};
use crate::jid;
use crate::stanza::Stanza;
use crate::supervisor::{AccountConnection, AttemptOutcome, ConnectionEvents, State};
use crate::transport::now_ms;

/// Scheduler tuning. The defaults mirror a mobile-friendly profile: one
/// tick a minute, ping after a minute of silence, declare the connection
/// dead after three.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub connect: ConnectConfig,
    pub tick_interval_secs: u64,
    /// Idle seconds after which a keepalive ping is sent.
    pub ping_idle_secs: u64,
    /// Idle seconds after which the connection is declared dead.
    pub fail_idle_secs: u64,
    /// Re-announce capabilities every this many ticks even when unchanged.
    pub caps_reannounce_ticks: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            tick_interval_secs: 60,
            ping_idle_secs: 60,
            fail_idle_secs: 180,
            caps_reannounce_ticks: 60,
        }
    }
}

/// Host-visible snapshot of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountStatus {
    pub state: State,
    pub fail_count: u32,
    pub full_jid: Option<String>,
}

type Handle = Arc<Mutex<AccountConnection>>;

struct Inner {
    config: SchedulerConfig,
    events: Arc<dyn ConnectionEvents>,
    capabilities: Option<Arc<dyn CapabilityQuery>>,
    accounts: RwLock<HashMap<String, Handle>>,
    caps_cache: Mutex<VerificationCache>,
    send_pool: Arc<Semaphore>,
    ticks: AtomicU64,
    cancel: CancellationToken,
    inbound: mpsc::Sender<Stanza>,
}

/// Cheap-to-clone handle on the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        events: Arc<dyn ConnectionEvents>,
        capabilities: Option<Arc<dyn CapabilityQuery>>,
    ) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let (inbound, mut rx) = mpsc::channel::<Stanza>(256);

        let scheduler = Scheduler {
            inner: Arc::new(Inner {
                config,
                events,
                capabilities,
                accounts: RwLock::new(HashMap::new()),
                caps_cache: Mutex::new(VerificationCache::default()),
                send_pool: Arc::new(Semaphore::new(3 * parallelism)),
                ticks: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                inbound,
            }),
        };

        // Dispatcher: fan inbound stanzas out to the host.
        let dispatch = scheduler.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch.inner.cancel.cancelled() => break,
                    stanza = rx.recv() => match stanza {
                        Some(stanza) => dispatch.inner.events.on_stanza(stanza),
                        None => break,
                    },
                }
            }
        });
        scheduler
    }

    /// Replace the account set wholesale. New accounts start connecting on
    /// the next tick, removed ones are closed now, surviving ones keep
    /// their connection and failure history.
    pub fn set_accounts(&self, accounts: Vec<Account>) {
        let mut doomed: Vec<(String, Option<Connection>, bool)> = Vec::new();
        {
            let mut map = self.inner.accounts.write().expect("accounts lock poisoned");
            let keep: Vec<String> = accounts.iter().map(|a| a.jid.clone()).collect();
            map.retain(|bare, handle| {
                if keep.contains(bare) {
                    return true;
                }
                let mut ac = handle.lock().expect("account lock poisoned");
                let was_connected = ac.state() == State::Connected;
                doomed.push((bare.clone(), ac.shutdown(), was_connected));
                info!(account = %bare, "account removed");
                false
            });
            for account in accounts {
                let bare = account.jid.clone();
                match map.get(&bare) {
                    Some(handle) => {
                        handle
                            .lock()
                            .expect("account lock poisoned")
                            .update_account(account);
                    }
                    None => {
                        info!(account = %bare, "account added");
                        map.insert(bare, Arc::new(Mutex::new(AccountConnection::new(account))));
                    }
                }
            }
        }
        for (bare, connection, was_connected) in doomed {
            if let Some(connection) = &connection {
                self.invalidate_caps(connection.full_jid());
            }
            let events = self.inner.events.clone();
            tokio::spawn(async move {
                if let Some(connection) = connection {
                    connection.close().await;
                }
                if was_connected {
                    events.on_disconnected(&bare);
                }
            });
        }
    }

    /// Run ticks until shutdown.
    pub async fn run(&self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.inner.config.tick_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    /// Stop ticking and close every connection.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<Handle> = {
            let map = self.inner.accounts.read().expect("accounts lock poisoned");
            map.values().cloned().collect()
        };
        for handle in handles {
            let connection = handle.lock().expect("account lock poisoned").shutdown();
            if let Some(connection) = connection {
                connection.close().await;
            }
        }
    }

    pub async fn tick(&self) {
        self.tick_at(now_ms()).await;
    }

    /// One scheduling pass against an explicit clock. Tests drive this
    /// directly to exercise idle and backoff behavior.
    pub async fn tick_at(&self, now: u64) {
        let tick = self.inner.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let reannounce = self.inner.config.caps_reannounce_ticks > 0
            && tick % self.inner.config.caps_reannounce_ticks == 0;

        let handles: Vec<(String, Handle)> = {
            let map = self.inner.accounts.read().expect("accounts lock poisoned");
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (bare, handle) in handles {
            let action = {
                let mut ac = handle.lock().expect("account lock poisoned");
                match ac.state() {
                    State::Connected => self.plan_connected_action(&bare, &mut ac, now),
                    State::Start | State::Failed => {
                        if ac.retry_due(now) {
                            self.plan_attempt(&bare, &mut ac)
                        } else {
                            debug!(account = %bare, retry_in_ms = ac.retry_in_ms(now), "waiting out backoff");
                            TickAction::None
                        }
                    }
                    State::Connecting => TickAction::None,
                }
            };
            self.execute(bare, handle, action, reannounce).await;
        }
    }

    fn plan_connected_action(
        &self,
        bare: &str,
        ac: &mut AccountConnection,
        now: u64,
    ) -> TickAction {
        let Some(connection) = ac.connection().cloned() else {
            return TickAction::None;
        };
        if connection.is_closed() {
            let lost = ac.connection_lost(now);
            return TickAction::Lost(lost.unwrap_or(connection));
        }
        let idle = connection.last_receive().idle_secs(now);
        if idle >= self.inner.config.fail_idle_secs {
            warn!(account = %bare, idle_secs = idle, "connection idle too long, failing it");
            let lost = ac.connection_lost(now);
            return TickAction::Lost(lost.unwrap_or(connection));
        }
        TickAction::Alive {
            connection,
            needs_ping: idle >= self.inner.config.ping_idle_secs,
        }
    }

    fn plan_attempt(&self, bare: &str, ac: &mut AccountConnection) -> TickAction {
        let Some(attempt) = ac.begin_attempt() else {
            return TickAction::None;
        };
        let mut account = ac.account().clone();
        // Dodge server-side resource conflicts once the first attempt
        // failed: a lingering ghost session may still hold the resource.
        if ac.fail_count() > 0 && !account.resource.is_empty() {
            let suffix: u16 = rand::random();
            account = account.with_resource(format!("{}-{suffix:04x}", account.resource));
        }
        debug!(account = %bare, attempt, resource = %account.resource, "starting connect attempt");
        TickAction::Connect { account, attempt }
    }

    async fn execute(&self, bare: String, handle: Handle, action: TickAction, reannounce: bool) {
        match action {
            TickAction::None => {}
            TickAction::Lost(connection) => {
                self.invalidate_caps(connection.full_jid());
                connection.close().await;
                self.inner.events.on_disconnected(&bare);
            }
            TickAction::Alive {
                connection,
                needs_ping,
            } => {
                if needs_ping {
                    self.spawn_ping(connection.clone());
                }
                self.announce_caps(connection, reannounce);
            }
            TickAction::Connect { account, attempt } => {
                self.spawn_connect(bare, handle, account, attempt);
            }
        }
    }

    fn spawn_connect(&self, bare: String, handle: Handle, account: Account, attempt: u64) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let result = Connection::open(
                &account,
                &scheduler.inner.config.connect,
                scheduler.inner.inbound.clone(),
            )
            .await;
            match result {
                Ok(connection) => {
                    // The stream only counts once it demonstrably carries
                    // stanzas; initial presence is the probe.
                    let presence = Stanza::from_xml("presence", "", "<presence/>");
                    if !connection.send(&presence).await {
                        warn!(account = %bare, "initial presence failed, discarding connection");
                        connection.close().await;
                        scheduler.report_failure(
                            &bare,
                            &handle,
                            attempt,
                            crate::error::XmppError::transport("initial presence failed"),
                        );
                        return;
                    }
                    let full_jid = connection.full_jid().to_string();
                    let outcome = handle
                        .lock()
                        .expect("account lock poisoned")
                        .attempt_succeeded(attempt, connection, now_ms());
                    match outcome {
                        AttemptOutcome::Applied(old) => {
                            if let Some(old) = old {
                                scheduler.invalidate_caps(old.full_jid());
                                old.close().await;
                            }
                            info!(account = %bare, jid = %full_jid, "account connected");
                            scheduler.inner.events.on_connected(&bare, &full_jid);
                        }
                        AttemptOutcome::Stale(new) => {
                            debug!(account = %bare, "attempt superseded, discarding connection");
                            if let Some(new) = new {
                                new.close().await;
                            }
                        }
                        AttemptOutcome::RolledBack => {
                            unreachable!("attempt_succeeded never reports RolledBack")
                        }
                    }
                }
                Err(error) => {
                    scheduler.report_failure(&bare, &handle, attempt, error);
                }
            }
        });
    }

    fn report_failure(
        &self,
        bare: &str,
        handle: &Handle,
        attempt: u64,
        error: crate::error::XmppError,
    ) {
        let outcome = handle
            .lock()
            .expect("account lock poisoned")
            .attempt_failed(attempt, now_ms());
        if let AttemptOutcome::Applied(_) = outcome {
            warn!(account = %bare, error = %error, "connect attempt failed");
            self.inner.events.on_connection_failed(bare, &error);
        }
    }

    fn spawn_ping(&self, connection: Connection) {
        let pool = self.inner.send_pool.clone();
        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };
            let id = format!("ping-{:08x}", rand::random::<u32>());
            let xml = format!("<iq type='get' id='{id}'><ping xmlns='{PING_NS}'/></iq>");
            let stanza = Stanza::from_xml("iq", "", xml);
            debug!(jid = %connection.full_jid(), "sending keepalive ping");
            // A failed send already closed the connection; the next tick
            // picks up the corpse.
            connection.send(&stanza).await;
        });
    }

    fn announce_caps(&self, connection: Connection, force: bool) {
        let Some(capabilities) = self.inner.capabilities.clone() else {
            return;
        };
        let jid = connection.full_jid().to_string();
        let info = capabilities.disco_info(&jid);
        let ver = caps::ver_hash(&info);
        {
            let mut cache = self.inner.caps_cache.lock().expect("caps cache poisoned");
            if force {
                cache.invalidate(&jid);
            }
            if cache.is_current(&jid, &ver) {
                return;
            }
            cache.record(&jid, &ver);
        }
        let node = capabilities.node().to_string();
        let pool = self.inner.send_pool.clone();
        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };
            debug!(jid = %jid, ver = %ver, "announcing capabilities");
            connection.send(&caps::announcement(&node, &ver)).await;
        });
    }

    fn invalidate_caps(&self, jid: &str) {
        self.inner
            .caps_cache
            .lock()
            .expect("caps cache poisoned")
            .invalidate(jid);
    }

    /// Send one stanza through the connection its `via` full JID belongs
    /// to. Routing falls back to the account's current connection when the
    /// resource changed across a reconnect. IQs must carry an `id`
    /// attribute, or no reply could ever be correlated to them.
    pub async fn send(&self, stanza: &Stanza) -> bool {
        let Some(via) = stanza.via() else {
            warn!("dropping stanza without via routing tag");
            return false;
        };
        if stanza.name() == "iq" && stanza.attribute_value("id").is_none() {
            warn!("dropping iq without an id attribute");
            return false;
        }
        let bare = jid::bare_jid(via).to_string();
        let Some(connection) = self.connection_of(&bare) else {
            debug!(account = %bare, "no live connection for stanza");
            return false;
        };
        connection.send(stanza).await
    }

    /// Send a copy of the stanza from every connected account, with `via`
    /// rewritten per connection. True when every send succeeded.
    pub async fn send_from_all_accounts(&self, stanza: &Stanza) -> bool {
        let connections: Vec<Connection> = {
            let map = self.inner.accounts.read().expect("accounts lock poisoned");
            map.values()
                .filter_map(|handle| {
                    handle
                        .lock()
                        .expect("account lock poisoned")
                        .connection()
                        .cloned()
                })
                .collect()
        };
        let mut all_ok = true;
        for connection in connections {
            let mut copy = stanza.clone();
            copy.set_via(connection.full_jid());
            all_ok &= connection.send(&copy).await;
        }
        all_ok
    }

    /// Send a copy of the stanza from every bound resource. Each account
    /// holds at most one bound resource, so this is the same fan-out as
    /// [`Scheduler::send_from_all_accounts`]; the separate name exists for
    /// hosts that think in resources rather than accounts.
    pub async fn send_from_all_resources(&self, stanza: &Stanza) -> bool {
        self.send_from_all_accounts(stanza).await
    }

    /// The current full JID bound for a bare JID, if connected.
    pub fn full_jid_by_bare(&self, bare: &str) -> Option<String> {
        let map = self.inner.accounts.read().expect("accounts lock poisoned");
        map.get(jid::bare_jid(bare))
            .and_then(|handle| {
                handle
                    .lock()
                    .expect("account lock poisoned")
                    .full_jid()
                    .map(str::to_string)
            })
    }

    pub fn status(&self, bare: &str) -> Option<AccountStatus> {
        let map = self.inner.accounts.read().expect("accounts lock poisoned");
        map.get(bare).map(|handle| {
            let ac = handle.lock().expect("account lock poisoned");
            AccountStatus {
                state: ac.state(),
                fail_count: ac.fail_count(),
                full_jid: ac.full_jid().map(str::to_string),
            }
        })
    }

    fn connection_of(&self, bare: &str) -> Option<Connection> {
        let map = self.inner.accounts.read().expect("accounts lock poisoned");
        map.get(bare).and_then(|handle| {
            let ac = handle.lock().expect("account lock poisoned");
            match ac.state() {
                State::Connected => ac.connection().cloned(),
                _ => None,
            }
        })
    }
}

enum TickAction {
    None,
    Lost(Connection),
    Alive {
        connection: Connection,
        needs_ping: bool,
    },
    Connect {
        account: Account,
        attempt: u64,
    },
}
