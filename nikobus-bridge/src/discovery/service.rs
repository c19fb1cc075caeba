//! Background task that runs discovery sweeps.
//!
//! The service owns the [`DiscoveryEngine`] and is the only task touching
//! it. A sweep works like this:
//!
//! 1. every inventory frame is queued on the command handler,
//!    fire-and-forget
//! 2. inventory answers arrive from the listener and are fed to the engine
//! 3. once every frame has gone out and no answer has arrived for
//!    `quiet_period`, the sweep is finished and merged

use std::collections::BTreeSet;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use nikobus_protocol::ModuleAddress;

use super::engine::{AddressSweepReport, DiscoveryEngine, DiscoveryPhase, ModuleSweepReport};
use crate::command::{Command, CommandHandler};
use crate::error::{BridgeError, Result};
use crate::event::{publish, BusEvent, DiscoveryScope};
use crate::listener::InventoryFrame;

/// What to discover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryRequest {
    /// Address sweep, then a register sweep of every module found.
    All,
    Addresses,
    Module(ModuleAddress),
}

/// Reports of the sweeps one request ran.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    pub addresses: Option<AddressSweepReport>,
    pub modules: Vec<ModuleSweepReport>,
}

type Reply = oneshot::Sender<Result<DiscoveryOutcome>>;

/// Cloneable front end of the discovery task.
#[derive(Clone)]
pub struct DiscoveryHandle {
    requests: mpsc::UnboundedSender<(DiscoveryRequest, Reply)>,
}

impl DiscoveryHandle {
    /// Queue a request and wait for it to finish. Requests run one at a time.
    pub async fn request(&self, request: DiscoveryRequest) -> Result<DiscoveryOutcome> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send((request, tx))
            .map_err(|_| BridgeError::Closed)?;
        rx.await.unwrap_or(Err(BridgeError::Cancelled))
    }

    pub async fn discover_all(&self) -> Result<DiscoveryOutcome> {
        self.request(DiscoveryRequest::All).await
    }

    pub async fn discover_addresses(&self) -> Result<AddressSweepReport> {
        self.request(DiscoveryRequest::Addresses)
            .await?
            .addresses
            .ok_or_else(|| BridgeError::Data("address sweep produced no report".into()))
    }

    pub async fn discover_module(&self, address: &ModuleAddress) -> Result<ModuleSweepReport> {
        self.request(DiscoveryRequest::Module(address.clone()))
            .await?
            .modules
            .pop()
            .ok_or_else(|| BridgeError::Data(format!("no report for module {}", address)))
    }
}

pub struct DiscoveryService {
    engine: DiscoveryEngine,
    commands: CommandHandler,
    inventory: mpsc::UnboundedReceiver<InventoryFrame>,
    events: broadcast::Sender<BusEvent>,
    quiet_period: Duration,
    cancel: CancellationToken,
}

impl DiscoveryService {
    pub fn new(
        engine: DiscoveryEngine,
        commands: CommandHandler,
        inventory: mpsc::UnboundedReceiver<InventoryFrame>,
        events: broadcast::Sender<BusEvent>,
        quiet_period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            commands,
            inventory,
            events,
            quiet_period,
            cancel,
        }
    }

    /// Start the background task.
    pub fn spawn(self) -> (DiscoveryHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (DiscoveryHandle { requests: tx }, task)
    }

    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<(DiscoveryRequest, Reply)>) {
        info!("Discovery service started");
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = requests.recv() => {
                    let Some((request, reply)) = request else {
                        break;
                    };
                    let result = self.handle(request).await;
                    if let Err(e) = &result {
                        warn!("Discovery failed: {}", e);
                    }
                    let _ = reply.send(result);
                }
                frame = self.inventory.recv() => match frame {
                    Some(frame) => trace!("Discovery idle, dropping {:?}", frame),
                    None => {
                        debug!("Inventory channel closed");
                        break;
                    }
                },
            }
        }

        requests.close();
        while let Ok((_, reply)) = requests.try_recv() {
            let _ = reply.send(Err(BridgeError::Cancelled));
        }
        info!("Discovery service stopped");
    }

    async fn handle(&mut self, request: DiscoveryRequest) -> Result<DiscoveryOutcome> {
        match request {
            DiscoveryRequest::Addresses => Ok(DiscoveryOutcome {
                addresses: Some(self.address_sweep().await?),
                modules: Vec::new(),
            }),
            DiscoveryRequest::Module(address) => Ok(DiscoveryOutcome {
                addresses: None,
                modules: vec![self.module_sweep(&address).await?],
            }),
            DiscoveryRequest::All => {
                let addresses = self.address_sweep().await?;
                let mut modules = Vec::new();
                for address in self.engine.discovered_modules() {
                    match self.module_sweep(&address).await {
                        Ok(report) => modules.push(report),
                        Err(BridgeError::Cancelled) => return Err(BridgeError::Cancelled),
                        Err(e) => warn!("Discovery of module {} failed: {}", address, e),
                    }
                }
                Ok(DiscoveryOutcome {
                    addresses: Some(addresses),
                    modules,
                })
            }
        }
    }

    async fn address_sweep(&mut self) -> Result<AddressSweepReport> {
        let frames = self.engine.start_address_sweep()?;
        self.run_sweep(frames).await?;
        let report = self.engine.finish_address_sweep()?;
        publish(
            &self.events,
            BusEvent::DiscoveryFinished {
                scope: DiscoveryScope::Addresses,
                devices: report.devices.len(),
                links: 0,
            },
        );
        Ok(report)
    }

    async fn module_sweep(&mut self, address: &ModuleAddress) -> Result<ModuleSweepReport> {
        let frames = self.engine.start_module_sweep(address)?;
        self.run_sweep(frames).await?;
        let report = self.engine.finish_module_sweep()?;
        let buttons: BTreeSet<&str> = report
            .mappings
            .iter()
            .map(|m| m.push_button_address.as_str())
            .collect();
        publish(
            &self.events,
            BusEvent::DiscoveryFinished {
                scope: DiscoveryScope::Module(address.clone()),
                devices: buttons.len(),
                links: report.mappings.len(),
            },
        );
        Ok(report)
    }

    /// Send `frames` and feed answers to the engine until the bus is quiet.
    async fn run_sweep(&mut self, frames: Vec<String>) -> Result<()> {
        let total = frames.len();
        let (tick_tx, mut ticks) = mpsc::unbounded_channel();
        for frame in frames {
            let tick = tick_tx.clone();
            let command = Command::new(frame).on_complete(move |ok| {
                let _ = tick.send(ok);
            });
            // Completion is tracked through the ticks.
            drop(self.commands.enqueue(command));
        }
        drop(tick_tx);

        let cancel = self.cancel.clone();
        let mut completed = 0;
        let mut failed = 0;
        let quiet = sleep(self.quiet_period);
        tokio::pin!(quiet);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.engine.abort();
                    return Err(BridgeError::Cancelled);
                }
                frame = self.inventory.recv() => {
                    let Some(frame) = frame else {
                        self.engine.abort();
                        return Err(BridgeError::Closed);
                    };
                    self.handle_frame(frame);
                    quiet.as_mut().reset(Instant::now() + self.quiet_period);
                }
                tick = ticks.recv(), if completed < total => {
                    match tick {
                        Some(true) => completed += 1,
                        Some(false) => {
                            completed += 1;
                            failed += 1;
                        }
                        None => completed = total,
                    }
                    quiet.as_mut().reset(Instant::now() + self.quiet_period);
                }
                _ = &mut quiet, if completed >= total => break,
            }
        }

        if failed > 0 {
            warn!("Discovery: {} of {} inventory frames could not be sent", failed, total);
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: InventoryFrame) {
        let sweeping_addresses = *self.engine.phase() == DiscoveryPhase::SweepingAddresses;
        let result = match frame {
            InventoryFrame::Address(line) if sweeping_addresses => {
                self.engine.parse_inventory_response(&line).map(|_| ())
            }
            InventoryFrame::Module(line) if !sweeping_addresses => {
                self.engine.parse_module_inventory_response(&line).map(|_| ())
            }
            other => {
                debug!("Discovery: ignoring {:?} during {:?}", other, self.engine.phase());
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Discovery: skipping inventory frame: {}", e);
        }
    }
}
