//! Connectivity supervision
//!
//! A WiFi+MQTT node runs two retry loops: one that associates with the access
//! point, and one that (re)establishes the broker session once WiFi is up.
//! Both are expressed as a single state machine, [`ConnectivitySupervisor`],
//! which decides which loop is unparked. [`Link`] pairs the machine with the
//! event channel radio callbacks post to, and drives it asynchronously.
//!
//! # State Machine
//!
//! ```text
//!            WifiUp                 SessionEstablished
//!  WiFi Down ──────► WiFi Up ─────────────────────────► WiFi Up
//!  (poll WiFi)       Session Down                       Session Up
//!      ▲             (poll session) ◄─────────────────  (nothing polls)
//!      │                   │          SessionLost
//!      └───── WifiDown ────┴───────────────────────────────┘
//! ```
//!
//! At most one loop polls at any time: [`ConnectivitySupervisor::active_poller`]
//! returns a single `Option<Poller>`.

use crate::communication::transport::TransportError;
use crate::parameters::network::WifiCredentials;
use crate::{log_debug, log_info, log_warn};
use core::fmt;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::delay::DelayNs;

/// Depth of the link event channel
pub const LINK_EVENT_QUEUE_SIZE: usize = 8;

/// State of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Down,
    /// Attempt in flight
    Connecting,
    Up,
}

/// Notifications from the WiFi radio and the MQTT client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    WifiUp { ip: Option<[u8; 4]> },
    WifiDown,
    SessionEstablished,
    SessionLost,
}

/// Retry loops under supervision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Poller {
    Wifi,
    Session,
}

/// Work the runner must perform after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkAction {
    None,
    ConnectWifi,
    ConnectSession,
    /// Session just came up; deliver whatever was queued
    FlushOutbound,
}

/// WiFi and MQTT session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivitySupervisor {
    wifi: LinkState,
    session: LinkState,
    ip: Option<[u8; 4]>,
}

impl ConnectivitySupervisor {
    /// Both links down; the WiFi loop polls
    pub const fn new() -> Self {
        Self {
            wifi: LinkState::Down,
            session: LinkState::Down,
            ip: None,
        }
    }

    pub fn wifi(&self) -> LinkState {
        self.wifi
    }

    pub fn session(&self) -> LinkState {
        self.session
    }

    /// Address assigned by the access point, while WiFi is up
    pub fn ip(&self) -> Option<[u8; 4]> {
        self.ip
    }

    /// Both links up
    pub fn is_usable(&self) -> bool {
        self.wifi == LinkState::Up && self.session == LinkState::Up
    }

    /// The one retry loop that is unparked, if any
    pub fn active_poller(&self) -> Option<Poller> {
        if self.wifi != LinkState::Up {
            Some(Poller::Wifi)
        } else if self.session != LinkState::Up {
            Some(Poller::Session)
        } else {
            None
        }
    }

    pub fn is_polling(&self, poller: Poller) -> bool {
        self.active_poller() == Some(poller)
    }

    /// Apply a link event
    pub fn on_event(&mut self, event: LinkEvent) -> LinkAction {
        match event {
            LinkEvent::WifiUp { ip } => {
                self.wifi = LinkState::Up;
                if ip.is_some() {
                    self.ip = ip;
                }
                if self.session == LinkState::Up {
                    LinkAction::None
                } else {
                    self.session = LinkState::Down;
                    LinkAction::ConnectSession
                }
            }
            LinkEvent::WifiDown => {
                self.wifi = LinkState::Down;
                self.session = LinkState::Down;
                self.ip = None;
                LinkAction::ConnectWifi
            }
            LinkEvent::SessionEstablished => {
                if self.wifi != LinkState::Up {
                    return LinkAction::None;
                }
                let was_up = self.session == LinkState::Up;
                self.session = LinkState::Up;
                if was_up {
                    LinkAction::None
                } else {
                    LinkAction::FlushOutbound
                }
            }
            LinkEvent::SessionLost => {
                self.session = LinkState::Down;
                if self.wifi == LinkState::Up {
                    LinkAction::ConnectSession
                } else {
                    LinkAction::None
                }
            }
        }
    }

    /// Retry interval elapsed: the active loop makes an attempt
    pub fn on_retry_tick(&mut self) -> LinkAction {
        match self.active_poller() {
            Some(Poller::Wifi) => {
                self.wifi = LinkState::Connecting;
                LinkAction::ConnectWifi
            }
            Some(Poller::Session) => {
                self.session = LinkState::Connecting;
                LinkAction::ConnectSession
            }
            None => LinkAction::None,
        }
    }

    /// An attempt by `poller` did not bring its link up
    pub fn on_attempt_failed(&mut self, poller: Poller) {
        match poller {
            Poller::Wifi if self.wifi == LinkState::Connecting => self.wifi = LinkState::Down,
            Poller::Session if self.session == LinkState::Connecting => {
                self.session = LinkState::Down
            }
            _ => {}
        }
    }
}

impl Default for ConnectivitySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel radio callbacks post [`LinkEvent`]s to
pub type LinkEventChannel<M> = Channel<M, LinkEvent, LINK_EVENT_QUEUE_SIZE>;

/// WiFi station driver
#[allow(async_fn_in_trait)]
pub trait WifiRadio {
    type Error: fmt::Debug;

    fn is_connected(&self) -> bool;

    /// Address assigned by DHCP, if known
    fn ip(&self) -> Option<[u8; 4]>;

    /// Start associating with `credentials`
    async fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), Self::Error>;
}

/// Session side of the link, implemented by whatever owns the MQTT transport
#[allow(async_fn_in_trait)]
pub trait SessionControl {
    /// Liveness check
    async fn session_connected(&self) -> bool;

    /// Open the broker session and subscribe
    async fn reconnect_session(&self) -> Result<(), TransportError>;

    /// Called once each time the session goes from down to up
    async fn on_session_established(&self);
}

/// Supervisor plus its event channel
pub struct Link<M: RawMutex> {
    supervisor: Mutex<M, ConnectivitySupervisor>,
    events: LinkEventChannel<M>,
}

impl<M: RawMutex> Link<M> {
    pub const fn new() -> Self {
        Self {
            supervisor: Mutex::new(ConnectivitySupervisor::new()),
            events: Channel::new(),
        }
    }

    /// Channel for radio and MQTT client callbacks
    pub fn events(&self) -> &LinkEventChannel<M> {
        &self.events
    }

    /// Post an event without waiting
    ///
    /// Dropped if the channel is full; the next retry tick reconciles the
    /// state with the drivers.
    pub fn post(&self, event: LinkEvent) {
        if self.events.try_send(event).is_err() {
            log_warn!("Link event channel full, dropping {:?}", event);
        }
    }

    /// Copy of the current supervisor state
    pub async fn state(&self) -> ConnectivitySupervisor {
        *self.supervisor.lock().await
    }

    /// Wait for one event or one retry tick and act on it
    ///
    /// Pending events are handled before the timer is armed, so a tick never
    /// overtakes an event that was already posted.
    pub async fn step<W, C, D>(
        &self,
        wifi: &mut W,
        control: &C,
        credentials: &WifiCredentials,
        delay: &mut D,
        retry_interval_ms: u32,
    ) where
        W: WifiRadio,
        C: SessionControl,
        D: DelayNs,
    {
        let action = match self.events.try_receive() {
            Ok(event) => self.apply_event(event).await,
            Err(_) => match select(delay.delay_ms(retry_interval_ms), self.events.receive()).await {
                Either::First(()) => self.on_tick(wifi, control).await,
                Either::Second(event) => self.apply_event(event).await,
            },
        };

        self.perform(action, wifi, control, credentials).await;
    }

    /// Run the retry loops forever
    pub async fn supervise<W, C, D>(
        &self,
        wifi: &mut W,
        control: &C,
        credentials: &WifiCredentials,
        delay: &mut D,
        retry_interval_ms: u32,
    ) -> !
    where
        W: WifiRadio,
        C: SessionControl,
        D: DelayNs,
    {
        log_info!("Connectivity supervisor started");
        loop {
            self.step(wifi, control, credentials, delay, retry_interval_ms)
                .await;
        }
    }

    /// Retry tick: reconcile with the drivers, then let the active loop try
    ///
    /// Events can be lost when the channel is full, so the recorded state is
    /// checked against what the radio and the session report.
    async fn on_tick<W, C>(&self, wifi: &W, control: &C) -> LinkAction
    where
        W: WifiRadio,
        C: SessionControl,
    {
        let state = self.state().await;
        if state.wifi() == LinkState::Up && !wifi.is_connected() {
            log_warn!("WiFi lost without notification");
            return self.apply_event(LinkEvent::WifiDown).await;
        }
        if state.session() == LinkState::Up && !control.session_connected().await {
            log_warn!("Session lost without notification");
            return self.apply_event(LinkEvent::SessionLost).await;
        }
        self.supervisor.lock().await.on_retry_tick()
    }

    async fn apply_event(&self, event: LinkEvent) -> LinkAction {
        log_debug!("Link event: {:?}", event);
        self.supervisor.lock().await.on_event(event)
    }

    /// Carry out `action` and any follow-up it triggers
    ///
    /// The supervisor lock is only held for the transitions, never across
    /// driver calls.
    async fn perform<W, C>(
        &self,
        mut action: LinkAction,
        wifi: &mut W,
        control: &C,
        credentials: &WifiCredentials,
    ) where
        W: WifiRadio,
        C: SessionControl,
    {
        loop {
            action = match action {
                LinkAction::None => return,
                LinkAction::ConnectWifi => {
                    if !wifi.is_connected() {
                        log_info!("Connecting to WiFi '{}'", credentials.ssid.as_str());
                        if let Err(e) = wifi.connect(credentials).await {
                            log_warn!("WiFi connect failed: {:?}", e);
                        }
                    }
                    if wifi.is_connected() {
                        self.apply_event(LinkEvent::WifiUp { ip: wifi.ip() }).await
                    } else {
                        self.supervisor.lock().await.on_attempt_failed(Poller::Wifi);
                        return;
                    }
                }
                LinkAction::ConnectSession => {
                    if !wifi.is_connected() {
                        self.apply_event(LinkEvent::WifiDown).await;
                        return;
                    }
                    let up = control.session_connected().await
                        || match control.reconnect_session().await {
                            Ok(()) => true,
                            Err(e) => {
                                log_warn!("Session connect failed: {}", e);
                                false
                            }
                        };
                    if up {
                        self.apply_event(LinkEvent::SessionEstablished).await
                    } else {
                        self.supervisor.lock().await.on_attempt_failed(Poller::Session);
                        return;
                    }
                }
                LinkAction::FlushOutbound => {
                    log_info!("Session established");
                    control.on_session_established().await;
                    return;
                }
            };
        }
    }
}

impl<M: RawMutex> Default for Link<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Mock WiFi radio and delay for testing
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use super::WifiRadio;
    use crate::communication::transport::mock::MockError;
    use crate::parameters::network::WifiCredentials;
    use embedded_hal_async::delay::DelayNs;

    /// Mock WiFi station
    ///
    /// Associates on the first `connect` unless told otherwise.
    #[derive(Debug)]
    pub struct MockWifi {
        connected: bool,
        connect_ok: bool,
        ip: [u8; 4],
        connect_attempts: u32,
    }

    impl MockWifi {
        pub fn new() -> Self {
            Self {
                connected: false,
                connect_ok: true,
                ip: [192, 168, 1, 50],
                connect_attempts: 0,
            }
        }

        pub fn set_connect_ok(&mut self, ok: bool) {
            self.connect_ok = ok;
        }

        /// Simulate losing the access point
        pub fn disconnect(&mut self) {
            self.connected = false;
        }

        pub fn connect_attempts(&self) -> u32 {
            self.connect_attempts
        }
    }

    impl Default for MockWifi {
        fn default() -> Self {
            Self::new()
        }
    }

    impl WifiRadio for MockWifi {
        type Error = MockError;

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn ip(&self) -> Option<[u8; 4]> {
            self.connected.then_some(self.ip)
        }

        async fn connect(&mut self, _credentials: &WifiCredentials) -> Result<(), MockError> {
            self.connect_attempts += 1;
            if !self.connect_ok {
                return Err(MockError);
            }
            self.connected = true;
            Ok(())
        }
    }

    /// Delay that returns immediately and accounts the requested time
    #[derive(Debug, Default)]
    pub struct MockDelay {
        elapsed_ms: u64,
        sleeps: u32,
    }

    impl MockDelay {
        pub fn new() -> Self {
            Self::default()
        }

        /// Total time slept
        pub fn elapsed_ms(&self) -> u64 {
            self.elapsed_ms
        }

        /// Number of sleeps taken
        pub fn sleeps(&self) -> u32 {
            self.sleeps
        }
    }

    impl DelayNs for MockDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.elapsed_ms += u64::from(ns / 1_000_000);
            self.sleeps += 1;
        }

        async fn delay_us(&mut self, us: u32) {
            self.elapsed_ms += u64::from(us / 1_000);
            self.sleeps += 1;
        }

        async fn delay_ms(&mut self, ms: u32) {
            self.elapsed_ms += u64::from(ms);
            self.sleeps += 1;
        }
    }
}
