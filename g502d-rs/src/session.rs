/* Attach/detach lifecycle for one hidraw interface.
 *
 * A session owns the per-interface device state, its dispatch worker and
 * the controller built on top of them. The inbound side is handed out as
 * an `InboundRouter` that the transport's reader drives. */

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::controller::{ConfigError, DeviceConfigController};
use crate::correlator::{RawEvent, ResponseCorrelator};
use crate::device::DeviceState;
use crate::dispatch::{DispatchHandle, DispatchWorker, spawn_dispatcher};
use crate::driver::Transport;
use crate::input::{MouseReport, SwitchButton};

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("Failed to start dispatch worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Host mode handshake failed: {0}")]
    Handshake(#[from] ConfigError),
}

pub struct DeviceSession {
    name: String,
    controller: Arc<DeviceConfigController>,
    worker: Option<DispatchWorker>,
}

impl DeviceSession {
    /* Seed the profiles, start the dispatcher and, on the protocol */
    /* interface, take the device out of on-board profile mode. */
    pub fn attach(
        name: &str,
        transport: Arc<dyn Transport>,
        supports_protocol: bool,
        config: &DaemonConfig,
    ) -> Result<Self, AttachError> {
        /* The mouse interface never transmits, so it gets no worker. Its */
        /* store only backs the controller that answers every intent with */
        /* ProtocolUnsupported. */
        let state = DeviceState::new(config.profiles);
        let (dispatch, worker) = if supports_protocol {
            let (dispatch, worker) = spawn_dispatcher(transport, config.queue_depth)?;
            (dispatch, Some(worker))
        } else {
            (DispatchHandle::detached(), None)
        };
        let controller = Arc::new(DeviceConfigController::new(
            state,
            dispatch,
            supports_protocol,
        ));

        if supports_protocol {
            controller.enter_host_mode()?;
            if let Err(e) = controller.query_firmware() {
                warn!("{name}: firmware query not sent: {e}");
            }
        }

        info!(
            "{name}: attached ({})",
            if supports_protocol {
                "protocol interface"
            } else {
                "mouse interface"
            }
        );

        Ok(Self {
            name: name.to_string(),
            controller,
            worker,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supports_protocol(&self) -> bool {
        self.controller.supports_protocol()
    }

    pub fn controller(&self) -> &Arc<DeviceConfigController> {
        &self.controller
    }

    /* Inbound handler for this interface. `on_switch` runs on the reader */
    /* thread for every press of the switch button, so it must not block. */
    pub fn router<F>(&self, switch: Option<SwitchButton>, on_switch: F) -> InboundRouter
    where
        F: FnMut() + Send + 'static,
    {
        InboundRouter {
            name: self.name.clone(),
            correlator: ResponseCorrelator::new(
                self.controller.state().clone(),
                self.controller.supports_protocol(),
            ),
            switch,
            on_switch: Box::new(on_switch),
        }
    }

    /* Send everything still queued, then stop the worker. Blocks. */
    pub fn detach(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        info!(
            "{}: detached ({} sent, {} failed)",
            self.name,
            self.controller.stats().sent(),
            self.controller.stats().failed()
        );
    }
}

/* Routes every inbound buffer of one interface: protocol frames to the */
/* correlator, regular mouse reports to the switch-button detector. */
pub struct InboundRouter {
    name: String,
    correlator: ResponseCorrelator,
    switch: Option<SwitchButton>,
    on_switch: Box<dyn FnMut() + Send>,
}

impl InboundRouter {
    pub fn deliver(&mut self, buf: &[u8]) -> RawEvent {
        let event = self.correlator.process(buf);

        match event {
            RawEvent::Regular => {
                if let (Some(switch), Some(report)) = (self.switch.as_mut(), MouseReport::parse(buf))
                    && switch.feed(&report)
                {
                    debug!("{}: switch button {} pressed", self.name, switch.button());
                    (self.on_switch)();
                }
            }
            RawEvent::NotProtocol => {
                debug!("{}: dropped {}-byte report", self.name, buf.len());
            }
            RawEvent::Protocol(correlation) => {
                debug!("{}: {correlation:?}", self.name);
            }
        }

        event
    }
}
