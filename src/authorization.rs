use crate::firewall_controller::FirewallController;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{sleep_until, Duration, Instant};

/// Capacity of the event queue; producers wait while it is full
pub const EVENT_QUEUE_CAPACITY: usize = 128;

const VERSION_MODULUS: u32 = 13_371_337;

/// Wake-up interval while nobody is authorized
const IDLE_WAKE_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Delay before a failed reconciliation is attempted again
const SYNC_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Authenticated { address: Ipv4Addr, expiry: Instant },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Running,
    ShuttingDown,
    Terminated,
}

/// Change counter of the authorized set. Only equality matters, so wrapping is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationVersion(u32);

impl ConfigurationVersion {
    pub fn seeded() -> Self {
        Self(rand::thread_rng().gen_range(1..VERSION_MODULUS))
    }

    pub fn advance(&mut self) {
        self.0 = (self.0 + 1) % VERSION_MODULUS;
    }
}

/// Currently authorized addresses and the end of their authorization
#[derive(Debug, Default)]
pub struct AuthorizedSet {
    clients: HashMap<Ipv4Addr, Instant>,
}

impl AuthorizedSet {
    /// Sets the expiry of `address`; the latest grant wins, even if it ends earlier.
    /// Returns whether anything changed.
    pub fn upsert(&mut self, address: Ipv4Addr, expiry: Instant) -> bool {
        self.clients.insert(address, expiry) != Some(expiry)
    }

    /// Removes every entry that expired at or before `now`
    pub fn sweep(&mut self, now: Instant) -> Vec<Ipv4Addr> {
        let expired: Vec<_> = self
            .clients
            .iter()
            .filter(|&(_, &expiry)| expiry <= now)
            .map(|(&address, _)| address)
            .collect();

        for address in &expired {
            self.clients.remove(address);
        }
        expired
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.clients.values().min().copied()
    }

    pub fn addresses(&self) -> BTreeSet<Ipv4Addr> {
        self.clients.keys().copied().collect()
    }
}

/// Single owner of the authorization state.
///
/// Consumes events in arrival order, expires authorizations and drives firewall reconciliation.
/// Reconciliation runs at most once per loop iteration, so bursts of events are coalesced.
pub struct AuthorizationReactor {
    firewall: FirewallController,
    events: mpsc::Receiver<Event>,
    clients: AuthorizedSet,
    version: ConfigurationVersion,
    applied_version: Option<ConfigurationVersion>,
    next_wake: Instant,
    state: ReactorState,
}

impl AuthorizationReactor {
    pub fn new(firewall: FirewallController, events: mpsc::Receiver<Event>) -> Self {
        Self {
            firewall,
            events,
            clients: AuthorizedSet::default(),
            version: ConfigurationVersion::seeded(),
            applied_version: None,
            next_wake: Instant::now() + IDLE_WAKE_INTERVAL,
            state: ReactorState::Running,
        }
    }

    /// Runs until a shutdown event arrives or all producers are gone, then tears the firewall
    /// down. Returns the teardown result.
    pub async fn run(mut self) -> Result<(), crate::firewall_backend::FirewallError> {
        let timer = sleep_until(self.next_wake);
        tokio::pin!(timer);

        while self.state == ReactorState::Running {
            if self.applied_version != Some(self.version) {
                self.sync_firewall().await;
                timer.as_mut().reset(self.next_wake);
            }

            tokio::select! {
                event = self.events.recv() => {
                    self.on_event(event);

                    // Everything already queued is folded into the next reconciliation pass
                    while self.state == ReactorState::Running {
                        match self.events.try_recv() {
                            Ok(event) => self.on_event(Some(event)),
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => self.on_event(None),
                        }
                    }
                    timer.as_mut().reset(self.next_wake);
                }
                () = &mut timer => {
                    self.on_timer();
                    timer.as_mut().reset(self.next_wake);
                }
            }
        }

        let result = self.firewall.teardown().await;
        if let Err(e) = &result {
            log::error!("Firewall teardown incomplete: {}", e);
        }
        self.state = ReactorState::Terminated;
        log::debug!("Authorization reactor terminated");

        result
    }

    fn on_event(&mut self, event: Option<Event>) {
        match event {
            Some(Event::Authenticated { address, expiry }) => {
                self.on_authenticated(address, expiry)
            }
            Some(Event::Shutdown) => {
                log::info!("Received shutdown event");
                self.state = ReactorState::ShuttingDown;
            }
            None => {
                log::info!("Event queue closed");
                self.state = ReactorState::ShuttingDown;
            }
        }
    }

    fn on_authenticated(&mut self, address: Ipv4Addr, expiry: Instant) {
        if !self.clients.upsert(address, expiry) {
            log::debug!("Authorization of {} unchanged", address);
            return;
        }

        self.version.advance();
        if expiry < self.next_wake {
            self.next_wake = expiry;
        }
    }

    fn on_timer(&mut self) {
        loop {
            let expired = self.clients.sweep(Instant::now());
            if !expired.is_empty() {
                for address in &expired {
                    log::info!("Authorization of {} expired", address);
                }
                self.version.advance();
            }

            self.next_wake = self
                .clients
                .next_expiry()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE_INTERVAL);

            // Entries may have expired while sweeping
            if self.next_wake > Instant::now() {
                break;
            }
        }
    }

    async fn sync_firewall(&mut self) {
        let desired = self.clients.addresses();
        log::debug!("Syncing firewall: {:?}", desired);

        match self.firewall.sync_authorized_ips(&desired).await {
            Ok(()) => self.applied_version = Some(self.version),
            Err(e) => {
                log::error!(
                    "Firewall out of sync ({} authorized), retrying in {}s: {}",
                    desired.len(),
                    SYNC_RETRY_INTERVAL.as_secs(),
                    e
                );
                let retry = Instant::now() + SYNC_RETRY_INTERVAL;
                if retry < self.next_wake {
                    self.next_wake = retry;
                }
            }
        }
    }
}
