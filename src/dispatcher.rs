use crate::config::AmsConfig;
use crate::connection::Connection;
use crate::error::{AmsError, Result};
use crate::output::Output;
use crate::protocol::{self, ZONE_COUNT};
use crate::subscription::{Listeners, Subscription};
use crate::types::{Diagnostics, InputId, Level, OutputId, StepDirection, StepSize, ZoneId};
use futures_util::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use uuid::Uuid;

type Reply = Box<dyn Any + Send>;

type Pending = oneshot::Receiver<Result<Reply>>;

type Job = Box<dyn for<'a> FnOnce(&'a Connection) -> BoxFuture<'a, Result<Reply>> + Send>;

/// One queued unit of work
struct Command {
    id: Uuid,
    name: &'static str,
    job: Job,
    reply: oneshot::Sender<Result<Reply>>,
}

#[derive(Default)]
struct Tasks {
    stop_tx: Option<broadcast::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PollRegistry {
    next_id: u64,
    cursor: usize,
    entries: Vec<(u64, Weak<Output>)>,
}

/// Routed outputs and the last trigger state queued per zone
#[derive(Default)]
struct ZoneTracker {
    routed: BTreeSet<OutputId>,
    /// Set when a trigger command is queued, cleared again if it fails
    triggers: [Option<bool>; ZONE_COUNT as usize],
}

impl ZoneTracker {
    fn trigger(&self, zone: ZoneId) -> Option<bool> {
        let index = usize::from(zone).checked_sub(1)?;
        self.triggers.get(index).copied().flatten()
    }

    fn slot(&mut self, zone: ZoneId) -> Option<&mut Option<bool>> {
        usize::from(zone)
            .checked_sub(1)
            .and_then(|index| self.triggers.get_mut(index))
    }

    fn set_trigger(&mut self, zone: ZoneId, on: bool) {
        if let Some(slot) = self.slot(zone) {
            *slot = Some(on);
        }
    }

    /// Drop a failed trigger state unless a later command already replaced it
    fn forget_trigger(&mut self, zone: ZoneId, on: bool) {
        if let Some(slot) = self.slot(zone) {
            if *slot == Some(on) {
                *slot = None;
            }
        }
    }

    fn zone_in_use(&self, zone: ZoneId) -> bool {
        self.routed
            .iter()
            .any(|output| protocol::zone_for_output(*output) == zone)
    }
}

struct Shared {
    config: AmsConfig,
    connection: Connection,
    queue_tx: mpsc::UnboundedSender<Command>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Command>>,
    available: AtomicBool,
    availability_listeners: Listeners<bool>,
    outputs: Mutex<PollRegistry>,
    zones: Mutex<ZoneTracker>,
    tasks: Mutex<Tasks>,
}

/// Serializes, paces and recovers every command sent to one switch
///
/// All device I/O goes through a single worker task that takes commands in
/// FIFO order, keeps at least the configured interval between sends, and
/// resets the connection after any transport failure. A second task polls
/// registered outputs round-robin through the same queue.
///
/// Cloning is cheap; clones share the same queue and connection.
///
/// # Example
///
/// ```no_run
/// use triad_ams::Dispatcher;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let dispatcher = Dispatcher::new("192.168.1.50", 52000, 8)?;
///     dispatcher.start();
///     dispatcher.set_output_to_input(1, 3).await?;
///     dispatcher.set_output_volume(1, 0.4).await?;
///     dispatcher.stop().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Dispatcher with default timings
    pub fn new(host: impl Into<String>, port: u16, input_count: u8) -> Result<Self> {
        Self::with_config(AmsConfig::new(host, port, input_count))
    }

    pub fn with_config(config: AmsConfig) -> Result<Self> {
        config.validate()?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let connection = Connection::from_config(&config);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                connection,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                available: AtomicBool::new(true),
                availability_listeners: Listeners::new(),
                outputs: Mutex::new(PollRegistry::default()),
                zones: Mutex::new(ZoneTracker::default()),
                tasks: Mutex::new(Tasks::default()),
            }),
        })
    }

    pub fn config(&self) -> &AmsConfig {
        &self.shared.config
    }

    pub fn input_count(&self) -> u8 {
        self.shared.config.input_count
    }

    /// Whether the most recent command reached the device
    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    /// Whether the worker and poller are running
    pub fn is_running(&self) -> bool {
        self.shared.lock_tasks().worker.is_some()
    }

    /// Spawn the worker and poller; no-op if already running.
    ///
    /// Must be called from within a tokio runtime. Commands issued before
    /// `start` wait in the queue.
    pub fn start(&self) {
        let mut tasks = self.shared.lock_tasks();
        if tasks.worker.is_some() {
            tracing::trace!("start(): already running");
            return;
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let shared = self.shared.clone();
        tasks.worker = Some(tokio::spawn(async move { shared.run_worker(stop_rx).await }));
        let dispatcher = self.clone();
        tasks.poller = Some(tokio::spawn(async move { dispatcher.run_poller().await }));
        tasks.stop_tx = Some(stop_tx);
        tracing::info!(
            "Dispatcher started for {}",
            self.shared.config.address()
        );
    }

    /// Stop both tasks and fail every queued command with [`AmsError::Cancelled`].
    ///
    /// A command already executing finishes its exchange first.
    pub async fn stop(&self) {
        let (stop_tx, worker, poller) = {
            let mut tasks = self.shared.lock_tasks();
            (tasks.stop_tx.take(), tasks.worker.take(), tasks.poller.take())
        };

        if let Some(poller) = poller {
            poller.abort();
            let _ = poller.await;
        }
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!("Dispatcher worker ended abnormally: {}", e);
            }
        }

        let mut queue = self.shared.queue_rx.lock().await;
        let mut cancelled = 0usize;
        while let Ok(command) = queue.try_recv() {
            tracing::debug!("Cancelling queued {} ({})", command.name, command.id);
            let _ = command.reply.send(Err(AmsError::Cancelled));
            cancelled += 1;
        }
        tracing::info!("Dispatcher stopped ({} queued command(s) cancelled)", cancelled);
    }

    /// Close the device connection gracefully
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.connection.disconnect().await
    }

    /// Observe availability changes; fires only when the value flips
    pub fn add_availability_listener(
        &self,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.availability_listeners.add(listener)
    }

    /// Add an output to background polling without keeping it alive
    pub fn register_output(&self, output: &Arc<Output>) -> Subscription {
        let id = {
            let mut registry = self.shared.lock_outputs();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, Arc::downgrade(output)));
            id
        };
        tracing::debug!("Registered output {} for polling", output.number());

        let shared = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.lock_outputs().entries.retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Snapshot of availability and every live registered output
    pub fn diagnostics(&self) -> Diagnostics {
        let outputs: Vec<Arc<Output>> = self
            .shared
            .lock_outputs()
            .entries
            .iter()
            .filter_map(|(_, output)| output.upgrade())
            .collect();
        Diagnostics {
            port: self.shared.config.port,
            input_count: self.shared.config.input_count,
            available: self.is_available(),
            outputs: outputs.iter().map(|output| output.diagnostics()).collect(),
        }
    }

    pub async fn set_output_volume(&self, output: OutputId, level: Level) -> Result<()> {
        self.execute("set_output_volume", move |c| {
            c.set_output_volume(output, level).boxed()
        })
        .await
    }

    pub async fn get_output_volume(&self, output: OutputId) -> Result<Level> {
        self.execute("get_output_volume", move |c| c.get_output_volume(output).boxed())
            .await
    }

    pub async fn set_output_mute(&self, output: OutputId, mute: bool) -> Result<()> {
        self.execute("set_output_mute", move |c| c.set_output_mute(output, mute).boxed())
            .await
    }

    pub async fn get_output_mute(&self, output: OutputId) -> Result<bool> {
        self.execute("get_output_mute", move |c| c.get_output_mute(output).boxed())
            .await
    }

    pub async fn volume_step_up(&self, output: OutputId, large: bool) -> Result<()> {
        self.step(output, StepDirection::Up, StepSize::from_large(large))
            .await
    }

    pub async fn volume_step_down(&self, output: OutputId, large: bool) -> Result<()> {
        self.step(output, StepDirection::Down, StepSize::from_large(large))
            .await
    }

    async fn step(&self, output: OutputId, direction: StepDirection, size: StepSize) -> Result<()> {
        self.execute("step_volume", move |c| {
            c.step_volume(output, direction, size).boxed()
        })
        .await
    }

    /// Route `output` to `input`, energizing the output's trigger zone if needed.
    ///
    /// A failed trigger command is logged; the route itself already succeeded.
    pub async fn set_output_to_input(&self, output: OutputId, input: InputId) -> Result<()> {
        self.execute("set_output_to_input", move |c| {
            c.set_output_to_input(output, input).boxed()
        })
        .await?;

        let zone = protocol::zone_for_output(output);
        let pending = {
            let mut zones = self.shared.lock_zones();
            zones.routed.insert(output);
            if zones.trigger(zone) == Some(true) {
                None
            } else {
                Some(self.queue_trigger(&mut zones, zone, true)?)
            }
        };
        if let Some(response) = pending {
            if let Err(e) = self.await_trigger(zone, true, response).await {
                tracing::warn!("Failed to turn on trigger zone {}: {}", zone, e);
            }
        }
        Ok(())
    }

    /// Input currently routed to `output`; also refreshes zone bookkeeping
    pub async fn get_output_source(&self, output: OutputId) -> Result<Option<InputId>> {
        let source = self
            .execute("get_output_source", move |c| c.get_output_source(output).boxed())
            .await?;

        let routed = matches!(source, Some(input) if input >= 1 && input <= self.input_count());
        let mut zones = self.shared.lock_zones();
        if routed {
            zones.routed.insert(output);
        } else {
            zones.routed.remove(&output);
        }
        Ok(source)
    }

    /// Unroute `output`, releasing its trigger zone once no output in it is routed
    pub async fn disconnect_output(&self, output: OutputId) -> Result<()> {
        self.execute("disconnect_output", move |c| c.disconnect_output(output).boxed())
            .await?;

        let zone = protocol::zone_for_output(output);
        let pending = {
            let mut zones = self.shared.lock_zones();
            zones.routed.remove(&output);
            if zones.zone_in_use(zone) || zones.trigger(zone) == Some(false) {
                None
            } else {
                Some(self.queue_trigger(&mut zones, zone, false)?)
            }
        };
        if let Some(response) = pending {
            if let Err(e) = self.await_trigger(zone, false, response).await {
                tracing::warn!("Failed to turn off trigger zone {}: {}", zone, e);
            }
        }
        Ok(())
    }

    pub async fn set_trigger_zone(&self, zone: ZoneId, on: bool) -> Result<()> {
        let response = {
            let mut zones = self.shared.lock_zones();
            self.queue_trigger(&mut zones, zone, on)?
        };
        self.await_trigger(zone, on, response).await
    }

    /// Last trigger state queued for `zone`, `None` if never driven or the
    /// last attempt failed
    pub fn trigger_zone_state(&self, zone: ZoneId) -> Option<bool> {
        self.shared.lock_zones().trigger(zone)
    }

    /// Record `on` for `zone` and queue the trigger command.
    ///
    /// Callers hold the zone lock, so the recorded state and queue order
    /// always agree.
    fn queue_trigger(&self, zones: &mut ZoneTracker, zone: ZoneId, on: bool) -> Result<Pending> {
        let response = self.submit("set_trigger_zone", move |c| {
            c.set_trigger_zone(zone, on).boxed()
        })?;
        zones.set_trigger(zone, on);
        Ok(response)
    }

    async fn await_trigger(&self, zone: ZoneId, on: bool, response: Pending) -> Result<()> {
        let result = receive::<()>("set_trigger_zone", response).await;
        if result.is_err() {
            self.shared.lock_zones().forget_trigger(zone, on);
        }
        result
    }

    /// Send arbitrary command bytes through the queue
    pub async fn send_raw(&self, command: Vec<u8>) -> Result<String> {
        self.execute("send_raw", move |c| {
            async move { c.send_raw(&command).await }.boxed()
        })
        .await
    }

    /// Queue `operation` and wait for the worker to run it
    async fn execute<T, F>(&self, name: &'static str, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a Connection) -> BoxFuture<'a, Result<T>> + Send + 'static,
    {
        let response = self.submit(name, operation)?;
        receive(name, response).await
    }

    fn submit<T, F>(&self, name: &'static str, operation: F) -> Result<Pending>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a Connection) -> BoxFuture<'a, Result<T>> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let command = Command {
            id: Uuid::new_v4(),
            name,
            job: erase(operation),
            reply,
        };
        tracing::trace!("Queueing {} ({})", name, command.id);
        self.shared
            .queue_tx
            .send(command)
            .map_err(|_| AmsError::Cancelled)?;
        Ok(response)
    }

    async fn run_poller(self) {
        let interval = self.shared.config.dispatcher.poll_interval();
        tracing::debug!("Poller started ({:?} interval)", interval);
        loop {
            match self.shared.next_poll_target() {
                Some(output) => {
                    tracing::trace!("Poller: refreshing output {}", output.number());
                    if AssertUnwindSafe(output.refresh_and_notify())
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        tracing::error!("Poller: refresh of output {} panicked", output.number());
                    }
                }
                None => tracing::trace!("Poller: no registered outputs"),
            }
            sleep(interval).await;
        }
    }
}

/// Wait for a submitted command and unpack its reply
async fn receive<T: Send + 'static>(name: &'static str, response: Pending) -> Result<T> {
    let value = response.await.map_err(|_| AmsError::Cancelled)??;
    value
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| AmsError::InvalidResponse(format!("{} returned an unexpected type", name)))
}

/// Type-erase an operation so it fits the queue
fn erase<T, F>(operation: F) -> Job
where
    T: Send + 'static,
    F: for<'a> FnOnce(&'a Connection) -> BoxFuture<'a, Result<T>> + Send + 'static,
{
    boxed_job(move |connection| {
        operation(connection)
            .map(|result| result.map(|value| Box::new(value) as Reply))
            .boxed()
    })
}

fn boxed_job<F>(job: F) -> Job
where
    F: for<'a> FnOnce(&'a Connection) -> BoxFuture<'a, Result<Reply>> + Send + 'static,
{
    Box::new(job)
}

impl Shared {
    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outputs(&self) -> std::sync::MutexGuard<'_, PollRegistry> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_zones(&self) -> std::sync::MutexGuard<'_, ZoneTracker> {
        self.zones.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_worker(&self, mut stop_rx: broadcast::Receiver<()>) {
        let mut queue = self.queue_rx.lock().await;
        let mut last_send: Option<Instant> = None;
        tracing::debug!("Worker started");
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.recv() => {
                    tracing::debug!("Worker stopped");
                    break;
                }
                command = queue.recv() => match command {
                    Some(command) => self.process(command, &mut last_send).await,
                    None => break,
                },
            }
        }
    }

    async fn process(&self, command: Command, last_send: &mut Option<Instant>) {
        let Command {
            id,
            name,
            job,
            reply,
        } = command;

        if let Some(last) = *last_send {
            sleep_until(last + self.config.dispatcher.min_send_interval()).await;
        }

        tracing::trace!("Executing {} ({})", name, id);
        let result = match self.ensure_connected().await {
            Ok(()) => job(&self.connection).await,
            Err(e) => Err(e),
        };

        let reset = match &result {
            Ok(_) => {
                *last_send = Some(Instant::now());
                self.set_available(true);
                false
            }
            Err(e) if e.is_transport() => {
                tracing::warn!("{} ({}) failed: {}; resetting connection", name, id, e);
                self.set_available(false);
                self.connection.close_now();
                true
            }
            Err(e) => {
                tracing::debug!("{} ({}) failed: {}", name, id, e);
                false
            }
        };
        if reset {
            if let Err(e) = self.ensure_connected().await {
                tracing::debug!("Best-effort reconnect failed: {}", e);
            }
        }

        if reply.send(result).is_err() {
            tracing::trace!("Caller for {} ({}) went away", name, id);
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.connection.is_connected() {
            return Ok(());
        }
        timeout(
            self.config.dispatcher.connect_timeout(),
            self.connection.connect(),
        )
        .await
        .map_err(|_| AmsError::Timeout)?
    }

    fn set_available(&self, available: bool) {
        if self.available.swap(available, Ordering::SeqCst) == available {
            return;
        }
        if available {
            tracing::info!("Triad AMS at {} is available", self.config.address());
        } else {
            tracing::warn!("Triad AMS at {} is unavailable", self.config.address());
        }
        self.availability_listeners.notify(available, "availability");
    }

    /// Next live output in round-robin order, pruning dropped ones
    fn next_poll_target(&self) -> Option<Arc<Output>> {
        let mut registry = self.lock_outputs();
        registry.entries.retain(|(_, output)| output.strong_count() > 0);
        if registry.entries.is_empty() {
            return None;
        }
        let index = registry.cursor % registry.entries.len();
        registry.cursor = index + 1;
        registry.entries[index].1.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_tracker() {
        let mut zones = ZoneTracker::default();
        assert_eq!(zones.trigger(1), None);

        zones.routed.insert(1);
        zones.routed.insert(9);
        zones.set_trigger(1, true);
        assert_eq!(zones.trigger(1), Some(true));
        assert!(zones.zone_in_use(1));
        assert!(zones.zone_in_use(2));
        assert!(!zones.zone_in_use(3));

        zones.routed.remove(&1);
        assert!(!zones.zone_in_use(1));

        // out-of-range zones are ignored
        zones.set_trigger(0, true);
        zones.set_trigger(4, true);
        assert_eq!(zones.trigger(0), None);
        assert_eq!(zones.trigger(4), None);
    }

    #[test]
    fn test_failed_trigger_only_clears_its_own_state() {
        let mut zones = ZoneTracker::default();
        zones.set_trigger(1, false);
        zones.set_trigger(1, true);
        // the earlier "off" failing must not erase the newer "on"
        zones.forget_trigger(1, false);
        assert_eq!(zones.trigger(1), Some(true));

        zones.forget_trigger(1, true);
        assert_eq!(zones.trigger(1), None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            Dispatcher::new("amp", 52000, 0),
            Err(AmsError::InvalidConfig(_))
        ));
    }
}
