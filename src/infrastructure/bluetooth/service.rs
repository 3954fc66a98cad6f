//! Bluetooth Service
//!
//! One actor task owns every piece of session state: radio state, the
//! discovery set, the connection and its catalog, the notification hub and
//! the CSV log. Host callbacks and caller requests both arrive as messages,
//! so state is only ever touched from that task.
//!
//! [`BluetoothService`] is the cloneable handle callers use. Its suspending
//! operations send a request, get back a completion receiver, and await it
//! under the configured timeout. Nothing polls.

use crate::domain::models::{
    CharacteristicInfo, ConnectionState, DeviceInfo, DiscoveredDevice, RadioState, ServiceInfo,
    WriteMode,
};
use crate::domain::settings::SessionSettings;
use crate::error::{BleError, BleResult};
use crate::infrastructure::bluetooth::{
    connection::Connection,
    host::{HostController, HostEvent, HostEventReceiver},
    notifications::{NotificationHub, NotificationStream},
    protocol::uuids,
    recorder::{CsvRecorder, LogSummary},
    scanner::DiscoverySet,
};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Timing policy for the session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// Upper bound on waiting for service discovery after connecting
    pub discovery_settle: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub rssi_timeout: Duration,
    pub disconnect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            discovery_settle: Duration::from_millis(settings.discovery_settle_ms),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            rssi_timeout: Duration::from_millis(settings.rssi_timeout_ms),
            disconnect_timeout: Duration::from_millis(settings.disconnect_timeout_ms),
        }
    }
}

/// Snapshot published by the actor after every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub radio: RadioState,
}

type Reply<T> = oneshot::Sender<BleResult<T>>;
type Completion<T> = oneshot::Receiver<T>;

enum Command {
    StartScan {
        filter: Option<Uuid>,
        reply: Reply<()>,
    },
    StopScan {
        reply: Reply<Vec<DiscoveredDevice>>,
    },
    Connect {
        target: String,
        reply: Reply<(String, Completion<BleResult<()>>)>,
    },
    CancelConnect {
        peripheral: String,
        reply: Reply<()>,
    },
    AwaitDiscovery {
        reply: oneshot::Sender<Completion<()>>,
    },
    Disconnect {
        reply: Reply<Option<Completion<()>>>,
    },
    ForceDisconnected {
        reply: Reply<()>,
    },
    Read {
        characteristic: Uuid,
        reply: Reply<Completion<Vec<u8>>>,
    },
    NextValue {
        characteristic: Uuid,
        reply: Reply<(Completion<Vec<u8>>, bool)>,
    },
    ReleaseNotify {
        characteristic: Uuid,
    },
    Write {
        characteristic: Uuid,
        data: Vec<u8>,
        mode: WriteMode,
        reply: Reply<Option<Completion<Result<(), String>>>>,
    },
    Subscribe {
        characteristic: Uuid,
        reply: Reply<NotificationStream>,
    },
    Unsubscribe {
        characteristic: Uuid,
        reply: Reply<()>,
    },
    Buffered {
        characteristic: Uuid,
        reply: Reply<Vec<Vec<u8>>>,
    },
    Services {
        reply: Reply<Vec<ServiceInfo>>,
    },
    Characteristics {
        service: Option<Uuid>,
        reply: Reply<Vec<CharacteristicInfo>>,
    },
    DeviceInfo {
        reply: Reply<DeviceInfo>,
    },
    ReadRssi {
        reply: Reply<Completion<Result<i16, String>>>,
    },
    StartLog {
        path: PathBuf,
        reply: Reply<()>,
    },
    StopLog {
        reply: Reply<Option<LogSummary>>,
    },
}

/// Handle to the session actor
#[derive(Clone)]
pub struct BluetoothService {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    config: SessionConfig,
}

impl BluetoothService {
    /// Start the session actor. Must be called inside a Tokio runtime.
    pub fn spawn(
        host: Arc<dyn HostController>,
        events: HostEventReceiver,
        config: SessionConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let actor = SessionActor::new(host, status_tx);
        tokio::spawn(actor.run(commands_rx, events));
        Self {
            commands: commands_tx,
            status: status_rx,
            config,
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> BleResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| BleError::SessionClosed)?;
        rx.await.map_err(|_| BleError::SessionClosed)?
    }

    fn notify(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Session actor already stopped");
        }
    }

    /// Scan for `duration` and return everything seen (arbitrary order)
    pub async fn scan(
        &self,
        duration: Duration,
        service_filter: Option<Uuid>,
    ) -> BleResult<Vec<DiscoveredDevice>> {
        self.request(|reply| Command::StartScan {
            filter: service_filter,
            reply,
        })
        .await?;
        tokio::time::sleep(duration).await;
        self.request(|reply| Command::StopScan { reply }).await
    }

    /// Connect to a discovered peripheral by identifier or name substring.
    /// Returns the identifier of the connected peripheral.
    pub async fn connect(&self, target: &str) -> BleResult<String> {
        let (peripheral, completion) = self
            .request(|reply| Command::Connect {
                target: target.to_string(),
                reply,
            })
            .await?;

        match timeout(self.config.connect_timeout, completion).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(BleError::SessionClosed),
            Err(_) => {
                warn!(
                    "Connection to {} timed out after {:?}",
                    peripheral, self.config.connect_timeout
                );
                self.request(|reply| Command::CancelConnect {
                    peripheral: peripheral.clone(),
                    reply,
                })
                .await?;
                return Err(BleError::ConnectTimeout(self.config.connect_timeout));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.notify(Command::AwaitDiscovery { reply: tx });
        if let Ok(discovered) = rx.await {
            if timeout(self.config.discovery_settle, discovered).await.is_err() {
                debug!("Service discovery still running after settle interval");
            }
        }

        Ok(peripheral)
    }

    /// Drop the link. A no-op when already disconnected.
    pub async fn disconnect(&self) -> BleResult<()> {
        let Some(completion) = self.request(|reply| Command::Disconnect { reply }).await? else {
            return Ok(());
        };
        if timeout(self.config.disconnect_timeout, completion)
            .await
            .is_err()
        {
            warn!("No disconnect confirmation from controller, tearing down locally");
            self.request(|reply| Command::ForceDisconnected { reply })
                .await?;
        }
        Ok(())
    }

    /// Request a fresh value from the peripheral
    pub async fn read(&self, characteristic: Uuid) -> BleResult<Vec<u8>> {
        let completion = self
            .request(|reply| Command::Read {
                characteristic,
                reply,
            })
            .await?;
        match timeout(self.config.read_timeout, completion).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BleError::NotConnected),
            Err(_) => Err(BleError::ReadTimeout(self.config.read_timeout)),
        }
    }

    /// Wait for the next notification of `characteristic`, enabling
    /// notifications for the duration if nothing else holds them
    pub async fn next_notification(&self, characteristic: Uuid) -> BleResult<Vec<u8>> {
        let (completion, temporary) = self
            .request(|reply| Command::NextValue {
                characteristic,
                reply,
            })
            .await?;
        let result = match timeout(self.config.read_timeout, completion).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BleError::NotConnected),
            Err(_) => Err(BleError::ReadTimeout(self.config.read_timeout)),
        };
        if temporary {
            self.notify(Command::ReleaseNotify { characteristic });
        }
        result
    }

    pub async fn write(&self, characteristic: Uuid, data: &[u8], mode: WriteMode) -> BleResult<()> {
        let completion = self
            .request(|reply| Command::Write {
                characteristic,
                data: data.to_vec(),
                mode,
                reply,
            })
            .await?;
        let Some(completion) = completion else {
            return Ok(());
        };
        match timeout(self.config.write_timeout, completion).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(BleError::WriteFailed(reason)),
            Ok(Err(_)) => Err(BleError::NotConnected),
            Err(_) => Err(BleError::WriteFailed(format!(
                "no confirmation within {}ms",
                self.config.write_timeout.as_millis()
            ))),
        }
    }

    /// Enable notifications and stream values until unsubscribe or
    /// disconnect. Replaces any earlier stream for the same characteristic.
    pub async fn subscribe(&self, characteristic: Uuid) -> BleResult<NotificationStream> {
        self.request(|reply| Command::Subscribe {
            characteristic,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, characteristic: Uuid) -> BleResult<()> {
        self.request(|reply| Command::Unsubscribe {
            characteristic,
            reply,
        })
        .await
    }

    /// Values currently buffered for `characteristic`, oldest first
    pub async fn buffered(&self, characteristic: Uuid) -> BleResult<Vec<Vec<u8>>> {
        self.request(|reply| Command::Buffered {
            characteristic,
            reply,
        })
        .await
    }

    pub async fn services(&self) -> BleResult<Vec<ServiceInfo>> {
        self.request(|reply| Command::Services { reply }).await
    }

    pub async fn characteristics(
        &self,
        service: Option<Uuid>,
    ) -> BleResult<Vec<CharacteristicInfo>> {
        self.request(|reply| Command::Characteristics { service, reply })
            .await
    }

    pub async fn device_info(&self) -> BleResult<DeviceInfo> {
        self.request(|reply| Command::DeviceInfo { reply }).await
    }

    pub async fn read_rssi(&self) -> BleResult<i16> {
        let completion = self.request(|reply| Command::ReadRssi { reply }).await?;
        match timeout(self.config.rssi_timeout, completion).await {
            Ok(Ok(Ok(rssi))) => Ok(rssi),
            Ok(Ok(Err(reason))) => Err(BleError::RssiUnavailable(reason)),
            Ok(Err(_)) => Err(BleError::NotConnected),
            Err(_) => Err(BleError::RssiUnavailable(format!(
                "no reading within {}ms",
                self.config.rssi_timeout.as_millis()
            ))),
        }
    }

    /// Mirror every accepted value into a CSV file until [`stop_log`]
    ///
    /// [`stop_log`]: Self::stop_log
    pub async fn start_log(&self, path: impl Into<PathBuf>) -> BleResult<()> {
        let path = path.into();
        self.request(|reply| Command::StartLog { path, reply }).await
    }

    pub async fn stop_log(&self) -> BleResult<Option<LogSummary>> {
        self.request(|reply| Command::StopLog { reply }).await
    }
}

struct SessionActor {
    host: Arc<dyn HostController>,
    status: watch::Sender<SessionStatus>,
    radio: RadioState,
    discovery: DiscoverySet,
    connection: Connection,
    hub: NotificationHub,
    recorder: Option<CsvRecorder>,
    last_rssi: Option<i16>,
    pending_connect: Option<oneshot::Sender<BleResult<()>>>,
    discovery_waiters: Vec<oneshot::Sender<()>>,
    disconnect_waiters: Vec<oneshot::Sender<()>>,
    write_waiters: HashMap<Uuid, VecDeque<oneshot::Sender<Result<(), String>>>>,
    rssi_waiters: Vec<oneshot::Sender<Result<i16, String>>>,
}

impl SessionActor {
    fn new(host: Arc<dyn HostController>, status: watch::Sender<SessionStatus>) -> Self {
        Self {
            host,
            status,
            radio: RadioState::Unknown,
            discovery: DiscoverySet::new(),
            connection: Connection::new(),
            hub: NotificationHub::new(),
            recorder: None,
            last_rssi: None,
            pending_connect: None,
            discovery_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            write_waiters: HashMap::new(),
            rssi_waiters: Vec::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: HostEventReceiver,
    ) {
        info!("Bluetooth session started");
        loop {
            // Host callbacks first so requests see the latest state
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.handle_event(event),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        if let Some(peripheral) = self.connection.begin_disconnect() {
            let _ = self.host.cancel_connection(&peripheral);
        }
        self.teardown();
        if let Some(recorder) = self.recorder.take() {
            let _ = recorder.finish();
        }
        info!("Bluetooth session stopped");
    }

    fn publish(&self) {
        self.status.send_replace(SessionStatus {
            state: self.connection.state(),
            radio: self.radio,
        });
    }

    fn require_characteristic(&self, characteristic: &Uuid) -> BleResult<String> {
        let peripheral = self.connection.require_connected()?.to_string();
        if self.connection.characteristic(characteristic).is_none() {
            return Err(BleError::CharacteristicNotFound(uuids::display_uuid(
                characteristic,
            )));
        }
        Ok(peripheral)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan { filter, reply } => {
                let _ = reply.send(self.start_scan(filter));
            }
            Command::StopScan { reply } => {
                let _ = reply.send(self.stop_scan());
            }
            Command::Connect { target, reply } => {
                let _ = reply.send(self.connect(&target));
            }
            Command::CancelConnect { peripheral, reply } => {
                self.cancel_connect(&peripheral);
                let _ = reply.send(Ok(()));
            }
            Command::AwaitDiscovery { reply } => {
                let (tx, rx) = oneshot::channel();
                if self.connection.discovery_complete() {
                    let _ = tx.send(());
                } else {
                    self.discovery_waiters.push(tx);
                }
                let _ = reply.send(rx);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(Ok(self.disconnect()));
            }
            Command::ForceDisconnected { reply } => {
                if self.connection.state() == ConnectionState::Disconnecting {
                    self.teardown();
                }
                let _ = reply.send(Ok(()));
            }
            Command::Read {
                characteristic,
                reply,
            } => {
                let _ = reply.send(self.read(characteristic));
            }
            Command::NextValue {
                characteristic,
                reply,
            } => {
                let _ = reply.send(self.next_value(characteristic));
            }
            Command::ReleaseNotify { characteristic } => self.release_notify(characteristic),
            Command::Write {
                characteristic,
                data,
                mode,
                reply,
            } => {
                let _ = reply.send(self.write(characteristic, &data, mode));
            }
            Command::Subscribe {
                characteristic,
                reply,
            } => {
                let _ = reply.send(self.subscribe(characteristic));
            }
            Command::Unsubscribe {
                characteristic,
                reply,
            } => {
                self.unsubscribe(characteristic);
                let _ = reply.send(Ok(()));
            }
            Command::Buffered {
                characteristic,
                reply,
            } => {
                let _ = reply.send(Ok(self.hub.buffered(&characteristic)));
            }
            Command::Services { reply } => {
                let result = self
                    .connection
                    .require_connected()
                    .map(|_| self.connection.services());
                let _ = reply.send(result);
            }
            Command::Characteristics { service, reply } => {
                let result = self
                    .connection
                    .require_connected()
                    .map(|_| self.connection.characteristics(service.as_ref()));
                let _ = reply.send(result);
            }
            Command::DeviceInfo { reply } => {
                let _ = reply.send(self.device_info());
            }
            Command::ReadRssi { reply } => {
                let _ = reply.send(self.read_rssi());
            }
            Command::StartLog { path, reply } => {
                let _ = reply.send(self.start_log(path));
            }
            Command::StopLog { reply } => {
                let result = match self.recorder.take() {
                    Some(recorder) => recorder
                        .finish()
                        .map(Some)
                        .map_err(|e| BleError::Log(e.to_string())),
                    None => Ok(None),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn start_scan(&mut self, filter: Option<Uuid>) -> BleResult<()> {
        self.discovery.begin(filter);
        if self.radio != RadioState::PoweredOn {
            warn!("Scan requested while radio is {}, no results", self.radio);
            return Ok(());
        }
        match filter {
            Some(service) => info!("Starting BLE scan for service {}", uuids::display_uuid(&service)),
            None => info!("Starting BLE scan"),
        }
        self.host.start_scan(filter)
    }

    fn stop_scan(&mut self) -> BleResult<Vec<DiscoveredDevice>> {
        let devices = self.discovery.end();
        if self.radio == RadioState::PoweredOn {
            if let Err(e) = self.host.stop_scan() {
                warn!("Failed to stop scan: {}", e);
            }
        }
        info!("Scan finished, {} devices found", devices.len());
        Ok(devices)
    }

    fn connect(&mut self, target: &str) -> BleResult<(String, Completion<BleResult<()>>)> {
        if self.connection.state() != ConnectionState::Disconnected {
            return Err(BleError::InvalidState(self.connection.state()));
        }
        if self.radio != RadioState::PoweredOn {
            return Err(BleError::RadioUnavailable(self.radio));
        }
        let device = self
            .discovery
            .resolve(target)
            .cloned()
            .ok_or_else(|| BleError::DeviceNotFound(target.to_string()))?;

        info!(
            "Connecting to {} ({})",
            device.display_name(),
            device.identifier
        );
        self.connection.begin_connect(&device.identifier)?;
        if let Err(e) = self.host.connect(&device.identifier) {
            error!("Controller refused connect: {}", e);
            self.connection.reset();
            return Err(e);
        }

        let (tx, rx) = oneshot::channel();
        self.pending_connect = Some(tx);
        self.last_rssi = Some(device.rssi);
        self.publish();
        Ok((device.identifier, rx))
    }

    fn cancel_connect(&mut self, peripheral: &str) {
        let pending = matches!(
            self.connection.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        );
        if !pending || !self.connection.is_current(peripheral) {
            return;
        }
        info!("Cancelling connection to {}", peripheral);
        if let Err(e) = self.host.cancel_connection(peripheral) {
            warn!("Failed to cancel connection: {}", e);
        }
        self.pending_connect = None;
        self.teardown();
    }

    fn disconnect(&mut self) -> Option<Completion<()>> {
        let peripheral = self.connection.begin_disconnect()?;
        info!("Disconnecting from {}", peripheral);
        self.publish();

        if let Err(e) = self.host.cancel_connection(&peripheral) {
            warn!("Controller refused disconnect ({}), tearing down locally", e);
            self.teardown();
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.disconnect_waiters.push(tx);
        Some(rx)
    }

    /// Back to `Disconnected`: catalog cleared, streams finished, every
    /// outstanding completion dropped
    fn teardown(&mut self) {
        let previous = self.connection.state();
        let peripheral = self.connection.reset();
        self.hub.finish_all();
        self.write_waiters.clear();
        self.rssi_waiters.clear();
        self.discovery_waiters.clear();
        self.last_rssi = None;
        if let Some(pending) = self.pending_connect.take() {
            let _ = pending.send(Err(BleError::ConnectFailed(
                "peripheral disconnected".to_string(),
            )));
        }
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if let Some(peripheral) = peripheral {
            info!("Disconnected from {} (was {})", peripheral, previous);
        }
        self.publish();
    }

    fn read(&mut self, characteristic: Uuid) -> BleResult<Completion<Vec<u8>>> {
        let peripheral = self.require_characteristic(&characteristic)?;
        self.hub.clear_buffer(&characteristic);
        let completion = self.hub.wait_next(characteristic);
        self.host.read_value(&peripheral, characteristic)?;
        Ok(completion)
    }

    fn next_value(&mut self, characteristic: Uuid) -> BleResult<(Completion<Vec<u8>>, bool)> {
        let peripheral = self.require_characteristic(&characteristic)?;
        let temporary = !self.hub.is_notifying(&characteristic);
        if temporary {
            self.host
                .set_notify_value(&peripheral, characteristic, true)?;
            self.hub.set_notifying(characteristic, true);
        }
        Ok((self.hub.wait_next(characteristic), temporary))
    }

    fn release_notify(&mut self, characteristic: Uuid) {
        if self.hub.has_subscriber(&characteristic) {
            return;
        }
        if self.hub.unsubscribe(&characteristic) {
            if let Ok(peripheral) = self.connection.require_connected() {
                if let Err(e) = self.host.set_notify_value(peripheral, characteristic, false) {
                    warn!("Failed to disable notifications: {}", e);
                }
            }
        }
    }

    fn write(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> BleResult<Option<Completion<Result<(), String>>>> {
        let peripheral = self.require_characteristic(&characteristic)?;
        debug!(
            "Writing {} bytes to {} ({:?})",
            data.len(),
            uuids::display_uuid(&characteristic),
            mode
        );
        self.host
            .write_value(&peripheral, characteristic, data, mode)
            .map_err(|e| BleError::WriteFailed(e.to_string()))?;

        match mode {
            WriteMode::WithoutResponse => Ok(None),
            WriteMode::WithResponse => {
                let (tx, rx) = oneshot::channel();
                self.write_waiters
                    .entry(characteristic)
                    .or_default()
                    .push_back(tx);
                Ok(Some(rx))
            }
        }
    }

    fn subscribe(&mut self, characteristic: Uuid) -> BleResult<NotificationStream> {
        let peripheral = self.require_characteristic(&characteristic)?;
        if !self.hub.is_notifying(&characteristic) {
            self.host
                .set_notify_value(&peripheral, characteristic, true)?;
        }
        info!("Subscribed to {}", uuids::display_uuid(&characteristic));
        Ok(self.hub.subscribe(characteristic))
    }

    fn unsubscribe(&mut self, characteristic: Uuid) {
        if !self.hub.unsubscribe(&characteristic) {
            return;
        }
        info!("Unsubscribed from {}", uuids::display_uuid(&characteristic));
        if let Ok(peripheral) = self.connection.require_connected() {
            if let Err(e) = self.host.set_notify_value(peripheral, characteristic, false) {
                warn!("Failed to disable notifications: {}", e);
            }
        }
    }

    fn device_info(&self) -> BleResult<DeviceInfo> {
        let peripheral = self.connection.require_connected()?;
        let discovered = self.discovery.get(peripheral);
        Ok(DeviceInfo {
            identifier: peripheral.to_string(),
            name: discovered.and_then(|d| d.name.clone()),
            rssi: self.last_rssi.or(discovered.map(|d| d.rssi)),
            state: self.connection.state(),
            service_count: self.connection.service_count(),
            characteristic_count: self.connection.characteristic_count(),
        })
    }

    fn read_rssi(&mut self) -> BleResult<Completion<Result<i16, String>>> {
        let peripheral = self.connection.require_connected()?.to_string();
        self.host.read_rssi(&peripheral)?;
        let (tx, rx) = oneshot::channel();
        self.rssi_waiters.push(tx);
        Ok(rx)
    }

    fn start_log(&mut self, path: PathBuf) -> BleResult<()> {
        if let Some(previous) = self.recorder.take() {
            if let Err(e) = previous.finish() {
                warn!("Failed to close previous log: {}", e);
            }
        }
        let recorder = CsvRecorder::start(&path).map_err(|e| BleError::Log(e.to_string()))?;
        self.recorder = Some(recorder);
        Ok(())
    }

    fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::PowerStateChanged(radio) => {
                info!("Bluetooth radio is {}", radio);
                self.radio = radio;
                if radio != RadioState::PoweredOn
                    && self.connection.state() != ConnectionState::Disconnected
                {
                    warn!("Radio lost power with an active connection");
                    self.teardown();
                }
                self.publish();
            }
            HostEvent::DeviceDiscovered(device) => {
                let identifier = device.identifier.clone();
                if self.discovery.record(device) {
                    debug!("Discovered {}", identifier);
                }
            }
            HostEvent::Connected { peripheral } => {
                if !self.connection.mark_connected(&peripheral) {
                    debug!("Ignoring connected event for {}", peripheral);
                    return;
                }
                info!("Connected to {}", peripheral);
                self.publish();
                if let Some(pending) = self.pending_connect.take() {
                    let _ = pending.send(Ok(()));
                }
                if let Err(e) = self.host.discover_services(&peripheral) {
                    warn!("Service discovery request failed: {}", e);
                }
            }
            HostEvent::ConnectFailed { peripheral, reason } => {
                if self.connection.state() != ConnectionState::Connecting
                    || !self.connection.is_current(&peripheral)
                {
                    return;
                }
                warn!("Connection to {} failed: {}", peripheral, reason);
                if let Some(pending) = self.pending_connect.take() {
                    let _ = pending.send(Err(BleError::ConnectFailed(reason)));
                }
                self.teardown();
            }
            HostEvent::Disconnected { peripheral } => {
                if self.connection.is_current(&peripheral) {
                    self.teardown();
                }
            }
            HostEvent::ServicesDiscovered {
                peripheral,
                services,
            } => {
                let pending = self.connection.record_services(&peripheral, &services);
                debug!("Discovered {} services on {}", services.len(), peripheral);
                for service in pending {
                    if let Err(e) = self.host.discover_characteristics(&peripheral, service) {
                        warn!("Characteristic discovery for {} failed: {}", service, e);
                    }
                }
                if self.connection.discovery_complete() {
                    self.finish_discovery();
                }
            }
            HostEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
            } => {
                if self
                    .connection
                    .record_characteristics(&peripheral, service, characteristics)
                {
                    self.finish_discovery();
                }
            }
            HostEvent::ValueUpdated {
                characteristic,
                value,
            } => self.accept_value(characteristic, value),
            HostEvent::WriteCompleted {
                characteristic,
                result,
            } => {
                let waiter = self
                    .write_waiters
                    .get_mut(&characteristic)
                    .and_then(VecDeque::pop_front);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => debug!(
                        "Unmatched write confirmation for {}",
                        uuids::display_uuid(&characteristic)
                    ),
                }
            }
            HostEvent::RssiRead { peripheral, result } => {
                if let Ok(rssi) = &result {
                    self.discovery.update_rssi(&peripheral, *rssi);
                    if self.connection.is_current(&peripheral) {
                        self.last_rssi = Some(*rssi);
                    }
                }
                for waiter in self.rssi_waiters.drain(..) {
                    let _ = waiter.send(result.clone());
                }
            }
        }
    }

    fn finish_discovery(&mut self) {
        info!(
            "Discovery complete: {} services, {} characteristics",
            self.connection.service_count(),
            self.connection.characteristic_count()
        );
        for waiter in self.discovery_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn accept_value(&mut self, characteristic: Uuid, value: Vec<u8>) {
        if self.connection.state() != ConnectionState::Connected {
            debug!(
                "Dropping value for {} while {}",
                uuids::display_uuid(&characteristic),
                self.connection.state()
            );
            return;
        }

        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.append(&characteristic, &value) {
                error!("Failed to write log record, stopping log: {}", e);
                self.recorder = None;
            }
        }
        self.hub.accept(characteristic, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::{ConnectBehaviour, FakeHost, HostCall};
    use crate::infrastructure::bluetooth::host::host_event_channel;
    use futures::StreamExt;

    fn setup(configure: impl FnOnce(FakeHost) -> FakeHost) -> (Arc<FakeHost>, BluetoothService) {
        let (tx, rx) = host_event_channel();
        let host = Arc::new(configure(FakeHost::fitness_bike(tx)));
        let service = BluetoothService::spawn(host.clone(), rx, SessionConfig::default());
        (host, service)
    }

    async fn connected(
        configure: impl FnOnce(FakeHost) -> FakeHost,
    ) -> (Arc<FakeHost>, BluetoothService) {
        let (host, service) = setup(configure);
        service
            .scan(Duration::from_secs(1), None)
            .await
            .unwrap();
        service.connect(FakeHost::BIKE_ID).await.unwrap();
        (host, service)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_returns_discoveries() {
        let (host, service) = setup(|h| h);
        let devices = service.scan(Duration::from_secs(2), None).await.unwrap();
        assert_eq!(devices.len(), 2);
        assert!(host.calls().contains(&HostCall::StartScan(None)));
        assert!(host.calls().contains(&HostCall::StopScan));

        let devices = service
            .scan(Duration::from_secs(2), Some(uuids::HEART_RATE_SERVICE))
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identifier, FakeHost::HRM_ID);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_without_power_finds_nothing() {
        let (host, service) = setup(|h| h.with_radio(RadioState::PoweredOff));
        let devices = service.scan(Duration::from_secs(2), None).await.unwrap();
        assert!(devices.is_empty());
        assert!(!host.calls().contains(&HostCall::StartScan(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_populates_catalog() {
        let (host, service) = connected(|h| h).await;
        assert_eq!(service.state(), ConnectionState::Connected);
        let services = service.services().await.unwrap();
        assert_eq!(services.len(), 2);
        let characteristics = service
            .characteristics(Some(uuids::FITNESS_MACHINE_SERVICE))
            .await
            .unwrap();
        assert_eq!(characteristics.len(), 3);
        assert!(host
            .calls()
            .contains(&HostCall::Connect(FakeHost::BIKE_ID.to_string())));

        let info = service.device_info().await.unwrap();
        assert_eq!(info.name.as_deref(), Some("KICKR CORE 1A2B"));
        assert_eq!(info.service_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_by_name_substring() {
        let (_host, service) = setup(|h| h);
        service.scan(Duration::from_secs(1), None).await.unwrap();
        let id = service.connect("kickr").await.unwrap();
        assert_eq!(id, FakeHost::BIKE_ID);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures() {
        let (_host, service) = setup(|h| h);
        assert_eq!(
            service.connect("missing").await,
            Err(BleError::DeviceNotFound("missing".to_string()))
        );

        let (_host, service) = setup(|h| h.with_radio(RadioState::PoweredOff));
        assert_eq!(
            service.connect(FakeHost::BIKE_ID).await,
            Err(BleError::RadioUnavailable(RadioState::PoweredOff))
        );

        let (_host, service) =
            setup(|h| h.with_connect_behaviour(ConnectBehaviour::Fail("rejected".into())));
        service.scan(Duration::from_secs(1), None).await.unwrap();
        assert_eq!(
            service.connect(FakeHost::BIKE_ID).await,
            Err(BleError::ConnectFailed("rejected".to_string()))
        );
        assert_eq!(service.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_cancels() {
        let (host, service) = setup(|h| h.with_connect_behaviour(ConnectBehaviour::Ignore));
        service.scan(Duration::from_secs(1), None).await.unwrap();
        let result = service.connect(FakeHost::BIKE_ID).await;
        assert_eq!(
            result,
            Err(BleError::ConnectTimeout(Duration::from_secs(10)))
        );
        assert_eq!(service.state(), ConnectionState::Disconnected);
        assert!(host
            .calls()
            .contains(&HostCall::CancelConnection(FakeHost::BIKE_ID.to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connected_rejected() {
        let (_host, service) = connected(|h| h).await;
        assert_eq!(
            service.connect(FakeHost::BIKE_ID).await,
            Err(BleError::InvalidState(ConnectionState::Connected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_when_disconnected_is_noop() {
        let (host, service) = setup(|h| h);
        service.disconnect().await.unwrap();
        assert!(host.calls().is_empty());
        assert_eq!(service.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_disconnect_tears_down_locally() {
        let (host, service) = connected(|h| h.with_silent_disconnect()).await;
        let mut stream = service.subscribe(uuids::INDOOR_BIKE_DATA).await.unwrap();
        service.disconnect().await.unwrap();
        assert_eq!(service.state(), ConnectionState::Disconnected);
        assert_eq!(stream.next().await, None);
        assert!(host
            .calls()
            .contains(&HostCall::CancelConnection(FakeHost::BIKE_ID.to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_finishes_streams_and_clears_catalog() {
        let (_host, service) = connected(|h| h).await;
        let mut stream = service.subscribe(uuids::INDOOR_BIKE_DATA).await.unwrap();
        service.disconnect().await.unwrap();
        assert_eq!(service.state(), ConnectionState::Disconnected);
        assert_eq!(stream.next().await, None);
        assert_eq!(service.services().await, Err(BleError::NotConnected));
        assert!(service
            .buffered(uuids::INDOOR_BIKE_DATA)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peripheral_dropping_link_ends_stream() {
        let (host, service) = connected(|h| h).await;
        let mut stream = service.subscribe(uuids::HEART_RATE_MEASUREMENT).await.unwrap();
        host.emit_value(uuids::HEART_RATE_MEASUREMENT, vec![0x00, 0x48]);
        host.drop_link();
        assert_eq!(stream.next().await, Some(vec![0x00, 0x48]));
        assert_eq!(stream.next().await, None);
        assert_eq!(
            service.read(uuids::FITNESS_MACHINE_FEATURE).await,
            Err(BleError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_unknown_characteristic() {
        let (host, service) = connected(|h| h).await;
        let unknown = uuids::BATTERY_LEVEL;
        assert_eq!(
            service.read(unknown).await,
            Err(BleError::CharacteristicNotFound("2A19".to_string()))
        );
        assert!(!host.calls().contains(&HostCall::Read(unknown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_value_and_timeout() {
        let features = vec![0x86, 0x50, 0x00, 0x00, 0x0C, 0xE0, 0x00, 0x00];
        let (_host, service) =
            connected(|h| h.with_read_value(uuids::FITNESS_MACHINE_FEATURE, features.clone()))
                .await;
        assert_eq!(
            service.read(uuids::FITNESS_MACHINE_FEATURE).await.unwrap(),
            features
        );
        assert_eq!(
            service.read(uuids::INDOOR_BIKE_DATA).await,
            Err(BleError::ReadTimeout(Duration::from_secs(5)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_read_value_is_buffered_until_next_read() {
        let (host, service) = connected(|h| h).await;
        assert_eq!(
            service.read(uuids::INDOOR_BIKE_DATA).await,
            Err(BleError::ReadTimeout(Duration::from_secs(5)))
        );

        host.emit_value(uuids::INDOOR_BIKE_DATA, vec![0x44, 0x02]);
        assert_eq!(
            service.buffered(uuids::INDOOR_BIKE_DATA).await.unwrap(),
            vec![vec![0x44, 0x02]]
        );

        assert_eq!(
            service.read(uuids::INDOOR_BIKE_DATA).await,
            Err(BleError::ReadTimeout(Duration::from_secs(5)))
        );
        assert!(service
            .buffered(uuids::INDOOR_BIKE_DATA)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_with_and_without_response() {
        let (host, service) = connected(|h| h).await;
        service
            .write(uuids::FITNESS_MACHINE_CONTROL_POINT, &[0x00], WriteMode::WithResponse)
            .await
            .unwrap();
        service
            .write(uuids::FITNESS_MACHINE_CONTROL_POINT, &[0x07], WriteMode::WithoutResponse)
            .await
            .unwrap();
        let calls = host.calls();
        assert!(calls.contains(&HostCall::Write(
            uuids::FITNESS_MACHINE_CONTROL_POINT,
            vec![0x00],
            WriteMode::WithResponse
        )));
        assert!(calls.contains(&HostCall::Write(
            uuids::FITNESS_MACHINE_CONTROL_POINT,
            vec![0x07],
            WriteMode::WithoutResponse
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure() {
        let (_host, service) =
            connected(|h| h.with_write_result(Err("control not permitted".into()))).await;
        assert_eq!(
            service
                .write(uuids::FITNESS_MACHINE_CONTROL_POINT, &[0x05, 0x96, 0x00], WriteMode::WithResponse)
                .await,
            Err(BleError::WriteFailed("control not permitted".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_unsubscribe() {
        let (host, service) = connected(|h| h).await;
        let mut stream = service.subscribe(uuids::INDOOR_BIKE_DATA).await.unwrap();
        host.emit_value(uuids::INDOOR_BIKE_DATA, vec![1]);
        host.emit_value(uuids::INDOOR_BIKE_DATA, vec![2]);
        assert_eq!(stream.next().await, Some(vec![1]));
        assert_eq!(stream.next().await, Some(vec![2]));

        service.unsubscribe(uuids::INDOOR_BIKE_DATA).await.unwrap();
        assert!(service
            .buffered(uuids::INDOOR_BIKE_DATA)
            .await
            .unwrap()
            .is_empty());
        service.unsubscribe(uuids::INDOOR_BIKE_DATA).await.unwrap();
        assert_eq!(stream.next().await, None);

        let calls = host.calls();
        assert!(calls.contains(&HostCall::SetNotify(uuids::INDOOR_BIKE_DATA, true)));
        let disables = calls
            .iter()
            .filter(|c| **c == HostCall::SetNotify(uuids::INDOOR_BIKE_DATA, false))
            .count();
        assert_eq!(disables, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_notification_releases_temporary_notify() {
        let (host, service) = connected(|h| {
            h.with_notification_payload(uuids::HEART_RATE_MEASUREMENT, vec![0x00, 0x50])
        })
        .await;
        let value = service
            .next_notification(uuids::HEART_RATE_MEASUREMENT)
            .await
            .unwrap();
        assert_eq!(value, vec![0x00, 0x50]);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(host
            .calls()
            .contains(&HostCall::SetNotify(uuids::HEART_RATE_MEASUREMENT, false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rssi() {
        let (_host, service) = connected(|h| h.with_rssi(Some(-42))).await;
        assert_eq!(service.read_rssi().await.unwrap(), -42);
        assert_eq!(service.device_info().await.unwrap().rssi, Some(-42));

        let (_host, service) = connected(|h| h.with_rssi(None)).await;
        assert!(matches!(
            service.read_rssi().await,
            Err(BleError::RssiUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_session_mirrors_values() {
        let path = std::env::temp_dir().join(format!(
            "ble_fitness_bridge_session_log_{}.csv",
            std::process::id()
        ));
        let (host, service) = connected(|h| h).await;
        service.start_log(&path).await.unwrap();
        let mut bike = service.subscribe(uuids::INDOOR_BIKE_DATA).await.unwrap();
        let mut hr = service.subscribe(uuids::HEART_RATE_MEASUREMENT).await.unwrap();
        host.emit_value(uuids::INDOOR_BIKE_DATA, vec![0x44, 0x00]);
        host.emit_value(uuids::HEART_RATE_MEASUREMENT, vec![0x00, 0x48]);
        assert!(bike.next().await.is_some());
        assert!(hr.next().await.is_some());
        let summary = service.stop_log().await.unwrap().unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(service.stop_log().await.unwrap(), None);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.contains(",2AD2,44 00,2"));
        let _ = std::fs::remove_file(&path);
    }
}
