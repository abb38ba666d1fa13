//! `Engine` construction.
//!
//! Grounded on the teacher's `endpoint::Builder` (`with_name`/`with_udp`/
//! `.build()` consuming `self`); spec §6 `init(name, from_uri,
//! proxy_password, mac[6])` becomes `EngineBuilder::build()` here plus a
//! later `attach_proxy` call (SPEC_FULL §D).

use std::collections::VecDeque;

use crate::auth_state::AuthState;
use crate::connection::{ConnectionManager, TransportKind};
use crate::dialog::DialogTable;
use crate::engine::rand_ids::{new_call_id, new_tag};
use crate::engine::Engine;

/// Builds an [`Engine`] from local identity and transport preference.
pub struct EngineBuilder {
    user: String,
    display_name: String,
    proxy_password: String,
    mac: [u8; 6],
    transport_preference: TransportKind,
}

impl EngineBuilder {
    /// Starts a builder for user `user` (also used as the phone-number part
    /// of the engine's own Contact URI).
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            display_name: String::new(),
            proxy_password: String::new(),
            mac: [0; 6],
            transport_preference: TransportKind::Udp,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_proxy_password(mut self, password: impl Into<String>) -> Self {
        self.proxy_password = password.into();
        self
    }

    pub fn with_mac(mut self, mac: [u8; 6]) -> Self {
        self.mac = mac;
        self
    }

    pub fn with_transport_preference(mut self, kind: TransportKind) -> Self {
        self.transport_preference = kind;
        self
    }

    /// Finalizes the builder into an `Engine`. No transport is opened yet —
    /// call `Engine::attach_proxy` next (spec §6 `init` without a live
    /// socket is a partial construction only in this crate's split, which
    /// keeps I/O out of a plain builder).
    pub fn build(self) -> Engine {
        let instance_uuid = format!(
            "b5fc7dec-40e2-11e9-b210-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.mac[0], self.mac[1], self.mac[2], self.mac[3], self.mac[4], self.mac[5]
        );
        tracing::debug!(user = %self.user, "building tinysip engine");

        Engine {
            user: self.user,
            display_name: self.display_name,
            proxy_password: self.proxy_password,
            mac: self.mac,
            instance_uuid,
            transport_pref: self.transport_preference,

            local_tag: new_tag(),
            reg_call_id: new_call_id(),
            reg_cseq: 0,

            proxy_host: String::new(),
            proxy_port: 5060,
            conn: ConnectionManager::new(self.transport_preference),

            dialogs: DialogTable::new(),
            current_call: None,

            registered: false,
            registration_requested: false,
            ms_last_registered: 0,
            ms_last_register_request: 0,

            invite_auth: AuthState::new(),
            register_auth: AuthState::new(),
            message_auth: AuthState::new(),

            msg_call_id: None,

            timer_a_start: None,

            ms_last_ping: 0,
            poll_count: 0,

            recv_buf: String::new(),
            pending_messages: VecDeque::new(),

            sdp_session_id: 1,
            remote_audio: None,

            reason: String::new(),
            remote_name: String::new(),
            remote_uri: String::new(),
        }
    }
}
