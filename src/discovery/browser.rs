//! mDNS browse adapter over mdns-sd. Produces device arrival and departure
//! events; the owner applies them to its device list.

use std::collections::HashMap;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::OutputError;
use crate::types::OutputDevice;

use super::txt::device_from_txt;

/// One change to the set of advertised speakers
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// New advertisement, or a re-advertisement updating an existing device
    Arrived(OutputDevice),
    /// The advertisement was withdrawn
    Vanished(u64),
}

/// Browser handle; dropping it stops the browse task
pub struct DeviceBrowser {
    daemon: mdns_sd::ServiceDaemon,
    task: tokio::task::JoinHandle<()>,
}

impl DeviceBrowser {
    /// Start browsing. Events arrive on the returned channel.
    pub fn start() -> Result<(Self, mpsc::UnboundedReceiver<DeviceEvent>), OutputError> {
        let daemon = mdns_sd::ServiceDaemon::new()
            .map_err(|e| OutputError::Resource(format!("mDNS daemon: {e}")))?;
        let receiver = daemon
            .browse(super::AIRPLAY_SERVICE)
            .map_err(|e| OutputError::Resource(format!("mDNS browse: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut stream = receiver.into_stream();
            // Withdrawals only carry the mDNS fullname
            let mut fullname_to_id: HashMap<String, u64> = HashMap::new();

            while let Some(event) = stream.next().await {
                match event {
                    mdns_sd::ServiceEvent::ServiceResolved(info) => {
                        let txt: HashMap<String, String> = info
                            .get_properties()
                            .iter()
                            .map(|p| (p.key().to_string(), p.val_str().to_string()))
                            .collect();

                        let name = info
                            .get_fullname()
                            .split('.')
                            .next()
                            .unwrap_or(info.get_fullname());
                        let addresses = info.get_addresses().iter().copied().collect();

                        let Some(device) =
                            device_from_txt(name, addresses, info.get_port(), &txt)
                        else {
                            continue;
                        };

                        tracing::debug!(
                            "device '{}' advertised (id {:#x}, features {:#x})",
                            device.name,
                            device.id,
                            device.raw_features
                        );
                        fullname_to_id.insert(info.get_fullname().to_string(), device.id);
                        if tx.send(DeviceEvent::Arrived(device)).is_err() {
                            break;
                        }
                    }
                    mdns_sd::ServiceEvent::ServiceRemoved(_, fullname) => {
                        if let Some(id) = fullname_to_id.remove(&fullname) {
                            tracing::debug!("device {id:#x} withdrew its advertisement");
                            if tx.send(DeviceEvent::Vanished(id)).is_err() {
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok((Self { daemon, task }, rx))
    }

    pub fn stop(self) {
        let _ = self.daemon.shutdown();
        self.task.abort();
    }
}
