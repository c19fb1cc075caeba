//! The assembled engine: one connection, its listener, the command worker
//! and the discovery service.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::CommandHandler;
use crate::config::BridgeConfig;
use crate::discovery::{DiscoveryEngine, DiscoveryHandle, DiscoveryService};
use crate::error::Result;
use crate::event::{event_channel, BusEvent};
use crate::listener::FrameListener;
use crate::store::{load_module_config, ConfigStore, ModuleConfig};
use crate::transport::{self, BusTransport};

pub struct NikobusBridge {
    transport: Arc<dyn BusTransport>,
    commands: CommandHandler,
    discovery: DiscoveryHandle,
    events: broadcast::Sender<BusEvent>,
    modules: ModuleConfig,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl NikobusBridge {
    /// Load the module document, open the connection and start all tasks.
    pub async fn connect(config: &BridgeConfig, store: Arc<dyn ConfigStore>) -> Result<Self> {
        let modules = load_module_config(store.as_ref())?;
        let transport = transport::connect(&config.connection).await?;
        Ok(Self::start(Arc::new(transport), config, store, modules))
    }

    /// Start all tasks on an already connected transport.
    pub fn with_transport(
        transport: Arc<dyn BusTransport>,
        config: &BridgeConfig,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self> {
        let modules = load_module_config(store.as_ref())?;
        Ok(Self::start(transport, config, store, modules))
    }

    fn start(
        transport: Arc<dyn BusTransport>,
        config: &BridgeConfig,
        store: Arc<dyn ConfigStore>,
        modules: ModuleConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let events = event_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (inventory_tx, inventory_rx) = mpsc::unbounded_channel();

        let listener = FrameListener::new(
            transport.clone(),
            responses_tx,
            inventory_tx,
            events.clone(),
            config.connection.read_timeout,
            cancel.clone(),
        )
        .spawn();

        let (commands, worker) = CommandHandler::spawn(
            transport.clone(),
            responses_rx,
            config.command.clone(),
            cancel.clone(),
        );

        let engine = DiscoveryEngine::new(store, config.discovery.controller_address.clone());
        let (discovery, discovery_task) = DiscoveryService::new(
            engine,
            commands.clone(),
            inventory_rx,
            events.clone(),
            config.discovery.quiet_period,
            cancel.clone(),
        )
        .spawn();

        info!("Nikobus bridge started with {} configured modules", modules.len());
        Self {
            transport,
            commands,
            discovery,
            events,
            modules,
            cancel,
            tasks: vec![listener, worker, discovery_task],
        }
    }

    /// Output control.
    pub fn commands(&self) -> &CommandHandler {
        &self.commands
    }

    pub fn discovery(&self) -> &DiscoveryHandle {
        &self.discovery
    }

    /// Subscribe to bus events.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Module document as loaded at start-up.
    pub fn modules(&self) -> &ModuleConfig {
        &self.modules
    }

    /// Stop every task and close the connection.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down Nikobus bridge");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Bridge task ended abnormally: {}", e);
            }
        }
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nikobus_protocol::{make_command, make_raw_command, Group, ModuleAddress};
    use serde_json::json;

    use super::*;
    use crate::error::BridgeError;
    use crate::store::MemoryStore;
    use crate::transport::MockTransport;

    fn test_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.connection.read_timeout = Duration::from_millis(20);
        config.command.command_delay = Duration::ZERO;
        config.command.ack_wait_timeout = Duration::from_millis(200);
        config.discovery.quiet_period = Duration::from_millis(50);
        config
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_modules(json!({
            "switch_module": {"4707": {"description": "Ground floor", "channels": []}}
        })))
    }

    #[tokio::test]
    async fn test_bridge_requires_module_config() {
        let mock = Arc::new(MockTransport::new());
        let result = NikobusBridge::with_transport(
            mock,
            &test_config(),
            Arc::new(MemoryStore::new()),
        );
        assert!(matches!(result, Err(BridgeError::MissingConfig(_))));
    }

    #[tokio::test]
    async fn test_bridge_commands_and_events() {
        let mock = Arc::new(MockTransport::new());
        let answer = make_raw_command("074700FF0000000000").unwrap();
        mock.reply_to(
            make_command(0x12, "4707", None).unwrap(),
            vec![format!("$0512{}", answer)],
        );
        let bridge = NikobusBridge::with_transport(mock.clone(), &test_config(), store()).unwrap();
        assert_eq!(bridge.modules().len(), 1);
        let mut events = bridge.subscribe();

        let state = bridge
            .commands()
            .get_output_state(&ModuleAddress::new("4707").unwrap(), Group::One)
            .await
            .unwrap();
        assert_eq!(state, "FF0000000000");

        mock.push_incoming("#N1A8B14");
        assert_eq!(
            events.recv().await.unwrap(),
            BusEvent::ButtonPressed {
                address: "1A8B14".into()
            }
        );

        bridge.shutdown().await.unwrap();
        assert!(!mock.is_open());
    }

    #[tokio::test]
    async fn test_ack_on_its_own_line() {
        let mock = Arc::new(MockTransport::new());
        let state_answer = |state: &str| make_raw_command(&format!("074700{}", state)).unwrap();
        mock.reply_to(
            make_command(0x12, "4707", None).unwrap(),
            vec!["$0512".into(), state_answer("AA00FF000011")],
        );
        mock.reply_to(
            make_command(0x15, "4707", Some("AA0000000011FF")).unwrap(),
            vec!["$0515".into(), state_answer("AA0000000011")],
        );
        let bridge = NikobusBridge::with_transport(mock.clone(), &test_config(), store()).unwrap();
        let module = ModuleAddress::new("4707").unwrap();

        let state = bridge
            .commands()
            .get_output_state(&module, Group::One)
            .await
            .unwrap();
        assert_eq!(state, "AA00FF000011");

        bridge.commands().set_output_state(&module, 3, 0x00).await.unwrap();
        assert_eq!(mock.sent_with_prefix("$1E15").len(), 1);

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_address_sweep_with_acked_records() {
        let mock = Arc::new(MockTransport::new());
        mock.reply_to(
            make_command(0x14, "0000", Some("A304")).unwrap(),
            vec![format!("$0514{}", make_raw_command("0000A307470001").unwrap())],
        );
        mock.reply_to(
            make_command(0x14, "0000", Some("A404")).unwrap(),
            vec![format!("$0514{}", make_raw_command("0000A4801C0D06").unwrap())],
        );
        let bridge = NikobusBridge::with_transport(mock, &test_config(), store()).unwrap();

        let report = bridge.discovery().discover_addresses().await.unwrap();
        let addresses: Vec<&str> = report.devices.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec!["0D1C80", "4707"]);

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_module_sweep_with_acked_blocks() {
        let mock = Arc::new(MockTransport::new());
        let block = format!("0747{}{}", "10030056340A13400156340A", "F".repeat(8));
        mock.reply_to(
            make_raw_command("1007471004").unwrap(),
            vec![format!("$0510{}", make_raw_command(&block).unwrap())],
        );
        let bridge = NikobusBridge::with_transport(mock, &test_config(), store()).unwrap();

        let report = bridge
            .discovery()
            .discover_module(&ModuleAddress::new("4707").unwrap())
            .await
            .unwrap();
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.mappings.len(), 1);
        assert_eq!(report.mappings[0].push_button_address, "1A8B14");

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_discovery() {
        let mock = Arc::new(MockTransport::new());
        let mut config = test_config();
        config.discovery.quiet_period = Duration::from_secs(30);
        let bridge = NikobusBridge::with_transport(mock, &config, store()).unwrap();

        let discovery = bridge.discovery().clone();
        let sweep = tokio::spawn(async move { discovery.discover_addresses().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        bridge.shutdown().await.unwrap();
        assert!(sweep.await.unwrap().is_err());
    }
}
