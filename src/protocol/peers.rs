//! Per-peer signaling records
//!
//! Each counterpart on the signaling channel (the server, the initiator as
//! seen by a responder, every responder as seen by the initiator) carries
//! its own cookie pair, combined sequence numbers, key material and
//! handshake sub-state.

use crate::crypto::{KeyStore, SharedKeyStore, KEY_LEN};
use crate::error::InternalError;
use crate::protocol::cookie::CookiePair;
use crate::protocol::csn::CsnPair;
use crate::protocol::nonce::{Address, ADDR_INITIATOR, ADDR_SERVER};
use crate::protocol::state::{
    InitiatorHandshakeState, ResponderHandshakeState, ServerHandshakeState,
};

/// Behavior shared by all peer records
pub trait Peer {
    fn identity(&self) -> Address;
    fn cookie_pair(&self) -> &CookiePair;
    fn cookie_pair_mut(&mut self) -> &mut CookiePair;
    fn csn_pair(&self) -> &CsnPair;
    fn csn_pair_mut(&mut self) -> &mut CsnPair;
}

/// The relay server
#[derive(Debug)]
pub struct ServerContext {
    handshake_state: ServerHandshakeState,
    session_key: Option<[u8; KEY_LEN]>,
    shared_key: Option<SharedKeyStore>,
    cookie_pair: CookiePair,
    csn_pair: CsnPair,
}

impl ServerContext {
    pub fn new() -> Self {
        Self {
            handshake_state: ServerHandshakeState::New,
            session_key: None,
            shared_key: None,
            cookie_pair: CookiePair::new(),
            csn_pair: CsnPair::new(),
        }
    }

    pub fn handshake_state(&self) -> ServerHandshakeState {
        self.handshake_state
    }

    pub fn set_handshake_state(&mut self, state: ServerHandshakeState) {
        self.handshake_state = state;
    }

    /// The server's public session key, from `server-hello`
    pub fn session_key(&self) -> Option<&[u8; KEY_LEN]> {
        self.session_key.as_ref()
    }

    pub fn set_session_key(&mut self, key: [u8; KEY_LEN]) -> Result<(), InternalError> {
        if self.session_key.is_some() {
            return Err(InternalError::Invariant("server session key already set"));
        }
        self.session_key = Some(key);
        Ok(())
    }

    pub fn shared_key(&self) -> Option<&SharedKeyStore> {
        self.shared_key.as_ref()
    }

    pub fn set_shared_key(&mut self, key: SharedKeyStore) {
        self.shared_key = Some(key);
    }
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Peer for ServerContext {
    fn identity(&self) -> Address {
        ADDR_SERVER
    }

    fn cookie_pair(&self) -> &CookiePair {
        &self.cookie_pair
    }

    fn cookie_pair_mut(&mut self) -> &mut CookiePair {
        &mut self.cookie_pair
    }

    fn csn_pair(&self) -> &CsnPair {
        &self.csn_pair
    }

    fn csn_pair_mut(&mut self) -> &mut CsnPair {
        &mut self.csn_pair
    }
}

/// The initiator, as tracked by a responder
#[derive(Debug)]
pub struct InitiatorContext {
    permanent_shared: SharedKeyStore,
    tmp_local_session_key: Option<KeyStore>,
    session_shared: Option<SharedKeyStore>,
    cookie_pair: CookiePair,
    csn_pair: CsnPair,
    pub handshake_state: InitiatorHandshakeState,
    pub connected: bool,
}

impl InitiatorContext {
    pub fn new(initiator_public_key: [u8; KEY_LEN], our_permanent_key: &KeyStore) -> Self {
        Self {
            permanent_shared: our_permanent_key.shared_with(&initiator_public_key),
            tmp_local_session_key: None,
            session_shared: None,
            cookie_pair: CookiePair::new(),
            csn_pair: CsnPair::new(),
            handshake_state: InitiatorHandshakeState::New,
            connected: false,
        }
    }

    pub fn permanent_public_key(&self) -> &[u8; KEY_LEN] {
        self.permanent_shared.remote_public_key()
    }

    pub fn permanent_shared(&self) -> &SharedKeyStore {
        &self.permanent_shared
    }

    /// Stash our ephemeral session keypair until the initiator's `key` arrives
    pub fn set_tmp_local_session_key(&mut self, key: KeyStore) -> Result<(), InternalError> {
        if self.tmp_local_session_key.is_some() {
            return Err(InternalError::SessionKeyAlreadySet);
        }
        self.tmp_local_session_key = Some(key);
        Ok(())
    }

    pub fn take_tmp_local_session_key(&mut self) -> Result<KeyStore, InternalError> {
        self.tmp_local_session_key
            .take()
            .ok_or(InternalError::MissingSessionKey)
    }

    pub fn session_shared(&self) -> Option<&SharedKeyStore> {
        self.session_shared.as_ref()
    }

    pub fn set_session_shared(&mut self, key: SharedKeyStore) {
        self.session_shared = Some(key);
    }
}

impl Peer for InitiatorContext {
    fn identity(&self) -> Address {
        ADDR_INITIATOR
    }

    fn cookie_pair(&self) -> &CookiePair {
        &self.cookie_pair
    }

    fn cookie_pair_mut(&mut self) -> &mut CookiePair {
        &mut self.cookie_pair
    }

    fn csn_pair(&self) -> &CsnPair {
        &self.csn_pair
    }

    fn csn_pair_mut(&mut self) -> &mut CsnPair {
        &mut self.csn_pair
    }
}

/// A responder, as tracked by the initiator
#[derive(Debug)]
pub struct ResponderContext {
    address: Address,
    permanent_shared: Option<SharedKeyStore>,
    local_session_key: Option<KeyStore>,
    session_shared: Option<SharedKeyStore>,
    cookie_pair: CookiePair,
    csn_pair: CsnPair,
    pub handshake_state: ResponderHandshakeState,
}

impl ResponderContext {
    /// A yet-unknown responder; its permanent key arrives in a `token`
    pub fn new(address: Address) -> Self {
        Self {
            address,
            permanent_shared: None,
            local_session_key: None,
            session_shared: None,
            cookie_pair: CookiePair::new(),
            csn_pair: CsnPair::new(),
            handshake_state: ResponderHandshakeState::New,
        }
    }

    /// A pre-trusted responder; no `token` is expected
    pub fn new_trusted(
        address: Address,
        trusted_key: [u8; KEY_LEN],
        our_permanent_key: &KeyStore,
    ) -> Self {
        Self {
            address,
            permanent_shared: Some(our_permanent_key.shared_with(&trusted_key)),
            local_session_key: None,
            session_shared: None,
            cookie_pair: CookiePair::new(),
            csn_pair: CsnPair::new(),
            handshake_state: ResponderHandshakeState::TokenReceived,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn permanent_shared(&self) -> Option<&SharedKeyStore> {
        self.permanent_shared.as_ref()
    }

    pub fn set_permanent_shared(&mut self, key: SharedKeyStore) {
        self.permanent_shared = Some(key);
    }

    pub fn local_session_key(&self) -> Option<&KeyStore> {
        self.local_session_key.as_ref()
    }

    pub fn set_local_session_key(&mut self, key: KeyStore) {
        self.local_session_key = Some(key);
    }

    pub fn session_shared(&self) -> Option<&SharedKeyStore> {
        self.session_shared.as_ref()
    }

    pub fn set_session_shared(&mut self, key: SharedKeyStore) {
        self.session_shared = Some(key);
    }
}

impl Peer for ResponderContext {
    fn identity(&self) -> Address {
        self.address
    }

    fn cookie_pair(&self) -> &CookiePair {
        &self.cookie_pair
    }

    fn cookie_pair_mut(&mut self) -> &mut CookiePair {
        &mut self.cookie_pair
    }

    fn csn_pair(&self) -> &CsnPair {
        &self.csn_pair
    }

    fn csn_pair_mut(&mut self) -> &mut CsnPair {
        &mut self.csn_pair
    }
}
