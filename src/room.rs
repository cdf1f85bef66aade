//! Membership container over the server-side sessions of one daemon

use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::mailbox::Mailbox;
use crate::session::{Inbound, Session, SessionId};

pub struct BroadcastRoom {
    members: Mutex<Vec<Arc<Session>>>,
    shutdown: Arc<AtomicBool>,
    inbox: Arc<Mailbox<Inbound>>,
}

impl BroadcastRoom {
    pub fn new() -> Arc<Self> {
        Arc::new(BroadcastRoom {
            members: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            inbox: Arc::new(Mailbox::new()),
        })
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn set_shutdown(&self, on: bool) {
        self.shutdown.store(on, Ordering::SeqCst);
    }

    pub fn inbox(&self) -> Arc<Mailbox<Inbound>> {
        self.inbox.clone()
    }

    pub fn join(&self, session: Arc<Session>) {
        let mut members = self.members.lock();
        if members.iter().any(|s| s.id() == session.id()) {
            return;
        }
        debug!("session {} joined ({} connected)", session.id(), members.len() + 1);
        members.push(session);
    }

    pub fn leave(&self, id: SessionId) {
        let mut members = self.members.lock();
        let before = members.len();
        members.retain(|s| s.id() != id);
        if members.len() != before {
            debug!("session {} left ({} connected)", id, members.len());
        }
    }

    pub fn connection_count(&self) -> usize {
        self.members.lock().len()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.members.lock().iter().find(|s| s.id() == id).cloned()
    }

    /// Snapshot so no send runs under the membership lock
    fn snapshot(&self, op: &str) -> Vec<Arc<Session>> {
        let members = self.members.lock().clone();
        if members.is_empty() {
            warn!("{} on an empty room", op);
        }
        members
    }

    pub fn send(&self, payload: &str) {
        for s in self.snapshot("send") {
            if let Err(e) = s.send(payload) {
                debug!("send to session {} skipped: {}", s.id(), e);
            }
        }
    }

    pub fn single_send(&self, payload: &str) {
        for s in self.snapshot("single_send") {
            if let Err(e) = s.single_send(payload) {
                debug!("single_send to session {} skipped: {}", s.id(), e);
            }
        }
    }

    pub fn simple_send(&self, payload: &str) {
        for s in self.snapshot("simple_send") {
            if let Err(e) = s.simple_send(payload) {
                debug!("simple_send to session {} skipped: {}", s.id(), e);
            }
        }
    }

    /// Reply to one member only. Returns false if it has already left.
    pub fn send_to(&self, id: SessionId, payload: &str) -> bool {
        match self.session(id) {
            Some(s) => s.send(payload).is_ok(),
            None => {
                debug!("reply for departed session {} dropped", id);
                false
            }
        }
    }

    /// Everyone except `id`; used when one session spreads GOHOME
    pub fn send_except(&self, id: SessionId, payload: &str) {
        let members = self.members.lock().clone();
        for s in members.iter().filter(|s| s.id() != id) {
            let _ = s.send(payload);
        }
    }

    pub fn listen(&self) {
        for s in self.snapshot("listen") {
            s.listen();
        }
    }

    pub fn quit(&self) {
        for s in self.snapshot("quit") {
            s.quit();
        }
    }
}
