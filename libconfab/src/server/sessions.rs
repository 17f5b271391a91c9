// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use confab_protocol::Value;
use tracing::info;
use uuid::Uuid;

use crate::{
    consts,
    runtime::{EvalError, PrinterPrefs},
};

/// The evaluation bindings one logical user accumulates: the current
/// namespace, the last three printed values, the last caught
/// exception, and the printer toggles. A session starts out owned by
/// the connection that created it; retaining it installs it in the
/// store so later connections can rebind it by id.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub ns: String,
    pub v1: Option<Value>,
    pub v2: Option<Value>,
    pub v3: Option<Value>,
    pub last_exception: Option<EvalError>,
    pub printer: PrinterPrefs,
    id: Option<String>,
}

impl SessionState {
    pub fn new(printer: PrinterPrefs) -> SessionState {
        SessionState {
            ns: String::from(consts::DEFAULT_NS),
            v1: None,
            v2: None,
            v3: None,
            last_exception: None,
            printer,
            id: None,
        }
    }

    /// The id this session is retained under, if it has been retained.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

pub type SessionHandle = Arc<Mutex<SessionState>>;

pub fn new_session(printer: PrinterPrefs) -> SessionHandle {
    Arc::new(Mutex::new(SessionState::new(printer)))
}

/// The table of retained sessions, keyed by opaque id.
///
/// A retained session is referenced under exactly one id at a time;
/// releasing it clears the id so a later retain mints a fresh one.
/// Sessions are kept until released, there is no expiry policy.
pub struct SessionStore {
    table: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> SessionStore {
        SessionStore { table: Mutex::new(HashMap::new()) }
    }

    /// Install the session under an id, minting one if this is the
    /// first retain. Retaining an already retained session is a no-op
    /// that returns the existing id.
    pub fn retain(&self, handle: &SessionHandle) -> String {
        // lock order: table before session state, everywhere
        let mut table = self.table.lock().unwrap();
        let mut state = handle.lock().unwrap();
        if let Some(id) = &state.id {
            if table.contains_key(id) {
                return id.clone();
            }
        }
        let id = Uuid::new_v4().to_string();
        state.id = Some(id.clone());
        table.insert(id.clone(), Arc::clone(handle));
        info!("retained session {id}");
        id
    }

    /// Remove the session from the table. Returns whether it was
    /// previously retained.
    pub fn release(&self, handle: &SessionHandle) -> bool {
        let mut table = self.table.lock().unwrap();
        let mut state = handle.lock().unwrap();
        match state.id.take() {
            Some(id) => {
                let released = table.remove(&id).is_some();
                if released {
                    info!("released session {id}");
                }
                released
            }
            None => false,
        }
    }

    pub fn lookup(&self, id: &str) -> Option<SessionHandle> {
        self.table.lock().unwrap().get(id).map(Arc::clone)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retain_is_idempotent() {
        let store = SessionStore::new();
        let session = new_session(PrinterPrefs::default());

        let id = store.retain(&session);
        assert_eq!(store.retain(&session), id);
        assert_eq!(store.len(), 1);
        assert_eq!(session.lock().unwrap().id(), Some(id.as_str()));
    }

    #[test]
    fn lookup_returns_the_same_session() {
        let store = SessionStore::new();
        let session = new_session(PrinterPrefs::default());
        session.lock().unwrap().ns = String::from("scratch");

        let id = store.retain(&session);
        let found = store.lookup(&id).expect("session to be retained");
        assert!(Arc::ptr_eq(&session, &found));
        assert_eq!(found.lock().unwrap().ns, "scratch");

        assert!(store.lookup("no-such-id").is_none());
    }

    #[test]
    fn release_removes_the_entry() {
        let store = SessionStore::new();
        let session = new_session(PrinterPrefs::default());

        assert!(!store.release(&session), "releasing an unretained session");

        let id = store.retain(&session);
        assert!(store.release(&session));
        assert!(store.lookup(&id).is_none());
        assert_eq!(store.len(), 0);
        assert!(!store.release(&session), "double release");
    }

    #[test]
    fn rereleased_sessions_get_a_fresh_id() {
        let store = SessionStore::new();
        let session = new_session(PrinterPrefs::default());

        let first = store.retain(&session);
        store.release(&session);
        let second = store.retain(&session);
        assert_ne!(first, second);
        assert!(store.lookup(&first).is_none());
        assert!(store.lookup(&second).is_some());
    }
}
