//! Built-in services and their default registration.

pub mod bandwidth;
pub mod chat;
pub mod heartbeat;
pub mod rtt;
pub mod service_info;

use std::sync::Arc;

use peerweave_core::config::ServicesConfig;
use peerweave_core::LocationId;

use crate::registry::{InitPriority, RegistryBuilder, RegistryError};
use crate::service::ServiceToken;

use bandwidth::BandwidthService;
use chat::ChatService;
use heartbeat::HeartbeatService;
use rtt::RttService;
use service_info::ServiceInfoService;

/// Handles to the services registered by [`register_defaults`]. Disabled
/// services are `None`.
#[derive(Default)]
pub struct DefaultServices {
    pub heartbeat: Option<Arc<HeartbeatService>>,
    pub rtt: Option<Arc<RttService>>,
    pub bandwidth: Option<Arc<BandwidthService>>,
    pub chat: Option<(Arc<ChatService>, ServiceToken)>,
}

/// Register service-info plus every built-in service `config` enables.
///
/// Service-info sits at OFF: the engine starts it on each connection, and
/// its exchange then starts the others.
pub fn register_defaults(
    builder: &mut RegistryBuilder,
    config: &ServicesConfig,
    local: LocationId,
) -> Result<DefaultServices, RegistryError> {
    builder.register(Arc::new(ServiceInfoService::new()), InitPriority::Off)?;

    let mut services = DefaultServices::default();
    if config.heartbeat {
        let heartbeat = Arc::new(HeartbeatService::new());
        builder.register(heartbeat.clone(), InitPriority::Immediate)?;
        services.heartbeat = Some(heartbeat);
    }
    if config.bandwidth {
        let bandwidth = Arc::new(BandwidthService::new(config.bandwidth_bytes_per_sec));
        builder.register(bandwidth.clone(), InitPriority::High)?;
        services.bandwidth = Some(bandwidth);
    }
    if config.rtt {
        let rtt = Arc::new(RttService::new());
        builder.register(rtt.clone(), InitPriority::Normal)?;
        services.rtt = Some(rtt);
    }
    if config.chat {
        let chat = Arc::new(ChatService::new(local));
        let token = builder.register(chat.clone(), InitPriority::Low)?;
        services.chat = Some((chat, token));
    }
    Ok(services)
}
