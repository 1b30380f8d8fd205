// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

pub mod cancellation;
pub mod client;
pub mod commands;
pub mod connect_options;
pub mod connect_state;
pub mod disconnect;
pub mod error;
pub mod events;
pub mod handler;
pub mod monitor;
pub mod packet_id_allocator;
pub mod publish;
pub mod queue;
pub mod reader;
pub mod session;
pub mod shared;
pub mod transaction;
pub mod transport;
pub mod writer_control;
pub mod writer_publish;

pub use client::AsyncClient;
pub use connect_options::{ConnectOptions, ConnectType, LastWillAndTestament};
pub use events::Event;
pub use publish::{PublishMessage, PublishOutcome};
