//! Session-side machinery: per-client state and the handler traits the
//! message loop dispatches into.

use std::collections::HashMap;
use std::net::SocketAddr;

pub mod auth;
pub mod portal;
pub mod query;
pub mod stmt;
pub mod store;

pub const METADATA_USER: &str = "user";
pub const METADATA_DATABASE: &str = "database";
pub const METADATA_APPLICATION_NAME: &str = "application_name";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    AwaitingStartup,
    AuthenticationInProgress,
    ReadyForQuery,
    QueryInProgress,
    /// An extended-query message failed; everything but Sync is discarded
    /// until the group ends.
    AwaitingSync,
}

/// Read and mutate per-session client state. Implemented by the framed
/// transport so handlers can both inspect the session and sink messages
/// through one value.
pub trait ClientInfo {
    fn socket_addr(&self) -> SocketAddr;

    fn is_secure(&self) -> bool;

    fn state(&self) -> SessionState;

    fn set_state(&mut self, new_state: SessionState);

    fn metadata(&self) -> &HashMap<String, String>;

    fn metadata_mut(&mut self) -> &mut HashMap<String, String>;

    fn portal_store(&self) -> &store::SessionStore;
}

/// State of one accepted client session.
#[non_exhaustive]
#[derive(Debug)]
pub struct ProxySession {
    pub socket_addr: SocketAddr,
    pub is_secure: bool,
    pub state: SessionState,
    /// startup parameters; `user` is written once at startup and never
    /// rebound afterwards
    pub metadata: HashMap<String, String>,
    pub portal_store: store::SessionStore,
}

impl ProxySession {
    pub fn new(socket_addr: SocketAddr, is_secure: bool) -> ProxySession {
        ProxySession {
            socket_addr,
            is_secure,
            state: SessionState::default(),
            metadata: HashMap::new(),
            portal_store: store::SessionStore::new(),
        }
    }
}

impl ClientInfo for ProxySession {
    fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    fn is_secure(&self) -> bool {
        self.is_secure
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, new_state: SessionState) {
        self.state = new_state;
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.metadata
    }

    fn portal_store(&self) -> &store::SessionStore {
        &self.portal_store
    }
}
