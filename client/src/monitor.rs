// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;

use codec::v5::PingRequestPacket;

use crate::commands::ControlCommand;
use crate::connect_options::ConnectType;
use crate::connect_state::ConnectState;
use crate::disconnect::DisconnectGate;
use crate::shared::Shared;

const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Periodic watchdog (spec.md §4.K): while `Connected`, sends a `PINGREQ`
/// once the connection has been idle longer than the negotiated keep-alive,
/// and triggers a disconnect the moment any of the other four tasks has
/// died unexpectedly. A `keep_alive` of zero disables pinging entirely.
pub async fn run(shared: Arc<Shared>, gate: Arc<DisconnectGate>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            () = shared.cancellation.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if gate.any_task_finished().await {
            log::warn!("monitor: a runtime task exited unexpectedly, triggering disconnect");
            gate.trigger(Arc::clone(&shared), false);
            return;
        }

        if shared.session.state() != ConnectState::Connected {
            continue;
        }

        let mut keep_alive = *shared.options.keep_alive();
        if matches!(
            shared.options.connect_type(),
            ConnectType::Ws(_) | ConnectType::Wss(_)
        ) {
            if let Some(ws_keep_alive) = shared.options.websocket_keep_alive_interval() {
                if keep_alive.is_zero() || ws_keep_alive < keep_alive {
                    keep_alive = ws_keep_alive;
                }
            }
        }
        if keep_alive.is_zero() {
            continue;
        }

        let idle = shared.session.idle_for().unwrap_or(Duration::ZERO);
        if idle >= keep_alive {
            let _ignored = shared
                .control_tx
                .enqueue(ControlCommand::PingRequest(PingRequestPacket::new()));
        }
    }
}
