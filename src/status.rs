/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Status aggregation: modules implement [`StatusProvider`], and the [`StatusServer`] answers
//! status requests from the network with the combined report.

use std::sync::{Arc, Once, Weak};
use std::time::Instant;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::{Envelope, PayloadKind};
use crate::networking::Node;

const NAME_KEY: &str = "name";
const STATUS_KEY: &str = "status";
const MODULE_KEY: &str = "module";

/// Implemented by modules that contribute to the swarm's status report.
pub trait StatusProvider: Send + Sync {
    /// The module's name in the report.
    fn get_name(&self) -> String;

    /// The module's current status.
    fn get_status(&self) -> serde_json::Value;
}

/// A status request carries no payload; the sender and session identify the asker.
#[derive(Clone, Debug, Default, BorshDeserialize, BorshSerialize)]
pub struct StatusRequest {}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct StatusResponse {
    pub swarm_version: String,
    pub swarm_id: String,
    pub uptime: String,
    pub pbft_enabled: bool,
    /// Styled JSON: `{"module": [{"name": …, "status": …}, …]}`.
    pub module_status_json: String,
}

/// Answers status requests with the aggregated reports of the registered providers.
pub struct StatusServer {
    node: Arc<dyn Node>,
    status_providers: Vec<Weak<dyn StatusProvider>>,
    swarm_id: String,
    start_time: Instant,
    start_once: Once,
}

impl StatusServer {
    pub fn new(
        node: Arc<dyn Node>,
        status_providers: Vec<Weak<dyn StatusProvider>>,
        swarm_id: &str,
    ) -> Self {
        Self {
            node,
            status_providers,
            swarm_id: swarm_id.to_string(),
            start_time: Instant::now(),
            start_once: Once::new(),
        }
    }

    /// Register for status requests. Invoked at most once per instance; later calls are
    /// no-ops.
    pub fn start(self: &Arc<Self>) {
        self.start_once.call_once(|| {
            let server = Arc::clone(self);

            self.node.register_for_message(
                PayloadKind::StatusRequest,
                Box::new(move |_envelope, session| {
                    let Some(session) = session else {
                        log::warn!("session not set - status response not sent");
                        return;
                    };

                    session.send_signed_message(Envelope::status_response(
                        "",
                        &server.build_response(),
                    ));
                }),
            );
        });
    }

    /// The aggregated reports of every provider still alive.
    pub fn query_modules(&self) -> serde_json::Value {
        let mut module_status = Vec::new();

        for provider in &self.status_providers {
            if let Some(provider) = provider.upgrade() {
                let mut entry = serde_json::Map::new();
                entry.insert(
                    NAME_KEY.to_string(),
                    serde_json::Value::String(provider.get_name()),
                );
                entry.insert(STATUS_KEY.to_string(), provider.get_status());
                module_status.push(serde_json::Value::Object(entry));
            }
        }

        serde_json::Value::Array(module_status)
    }

    fn build_response(&self) -> StatusResponse {
        let mut module_status = serde_json::Map::new();
        module_status.insert(MODULE_KEY.to_string(), self.query_modules());
        let module_status = serde_json::Value::Object(module_status);

        StatusResponse {
            swarm_version: env!("CARGO_PKG_VERSION").to_string(),
            swarm_id: self.swarm_id.clone(),
            uptime: uptime_string(self.start_time),
            pbft_enabled: true,
            module_status_json: serde_json::to_string_pretty(&module_status).unwrap(),
        }
    }
}

fn uptime_string(start_time: Instant) -> String {
    let uptime = start_time.elapsed().as_secs();

    let days = uptime / (3600 * 24);
    let hours = (uptime % (3600 * 24)) / 3600;
    let minutes = (uptime % 3600) / 60;

    format!("{} days, {} hours, {} minutes", days, hours, minutes)
}
