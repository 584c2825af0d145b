use std::sync::Arc;

use codepush_core::{ClientId, validate_client_id};
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::{StateStore, StoreError};

const CLIENT_ID_PREFIX: &str = "dev_";
const CLIENT_ID_RANDOM_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub id: ClientId,
}

/// Hands out the stable client identity, generating it on first use.
#[derive(Clone)]
pub struct IdentityStore {
    store: Arc<dyn StateStore>,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Returns the persisted identity, creating and persisting one if none exists.
    /// An existing identity is never replaced.
    pub fn load_or_create(&self) -> Result<ClientIdentity, StoreError> {
        let state = self.store.load()?;
        if let Some(id) = state.client_id.filter(|id| validate_client_id(id).is_ok()) {
            return Ok(ClientIdentity { id });
        }

        let mut created = None;
        self.store.update(&mut |state| {
            let id = state
                .client_id
                .clone()
                .filter(|id| validate_client_id(id).is_ok())
                .unwrap_or_else(generate_client_id);
            state.client_id = Some(id.clone());
            created = Some(id);
        })?;

        let id = created.unwrap_or_else(generate_client_id);
        info!(client_id = %id, "client identity created");
        Ok(ClientIdentity { id })
    }
}

fn generate_client_id() -> ClientId {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_RANDOM_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("{CLIENT_ID_PREFIX}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStateStore, MemoryStateStore, PersistedState};

    #[test]
    fn identity_is_created_once_and_reused() {
        let store = Arc::new(MemoryStateStore::default());
        let identities = IdentityStore::new(store.clone());

        let first = identities.load_or_create().expect("create");
        assert!(first.id.starts_with(CLIENT_ID_PREFIX));
        assert!(validate_client_id(&first.id).is_ok());

        let second = identities.load_or_create().expect("reload");
        assert_eq!(first, second);
        assert_eq!(store.snapshot().client_id, Some(first.id));
    }

    #[test]
    fn identity_survives_a_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = IdentityStore::new(Arc::new(FileStateStore::in_dir(dir.path())))
            .load_or_create()
            .expect("create");
        let after_restart = IdentityStore::new(Arc::new(FileStateStore::in_dir(dir.path())))
            .load_or_create()
            .expect("reload");
        assert_eq!(first, after_restart);
    }

    #[test]
    fn creating_identity_keeps_other_fields() {
        let store = Arc::new(MemoryStateStore::new(PersistedState {
            manual_off: true,
            auth_token: Some("tok".to_owned()),
            ..PersistedState::default()
        }));
        IdentityStore::new(store.clone())
            .load_or_create()
            .expect("create");

        let state = store.snapshot();
        assert!(state.manual_off);
        assert_eq!(state.auth_token.as_deref(), Some("tok"));
    }

    #[test]
    fn unavailable_storage_is_reported() {
        let store = Arc::new(MemoryStateStore::default());
        store.set_unavailable(true);
        assert!(IdentityStore::new(store).load_or_create().is_err());
    }

    #[test]
    fn identity_is_not_regenerated_while_another_process_saves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seeded = PersistedState {
            client_id: Some("dev_original0001".to_owned()),
            auth_token: Some("tok".to_owned()),
            server_url: Some("ws://relay.example".to_owned()),
            ..PersistedState::default()
        };
        FileStateStore::in_dir(dir.path()).save(&seeded).expect("seed");

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer = {
            let store = FileStateStore::in_dir(dir.path());
            let stop = Arc::clone(&stop);
            let mut state = seeded.clone();
            std::thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                    state.manual_off = !state.manual_off;
                    store.save(&state).expect("save");
                }
            })
        };

        let identities = IdentityStore::new(Arc::new(FileStateStore::in_dir(dir.path())));
        for _ in 0..2_000 {
            let identity = identities.load_or_create().expect("load identity");
            assert_eq!(identity.id, "dev_original0001");
        }
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        writer.join().expect("writer thread");

        let state = FileStateStore::in_dir(dir.path()).load().expect("load");
        assert_eq!(state.client_id.as_deref(), Some("dev_original0001"));
        assert_eq!(state.auth_token.as_deref(), Some("tok"));
    }
}
