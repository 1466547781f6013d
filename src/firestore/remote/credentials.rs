use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;

/// The user whose writes and listens are being served. Every user gets its
/// own mutation queue; the unauthenticated user has no uid.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key used to partition per-user stores.
    pub fn to_key(&self) -> String {
        self.uid.clone().unwrap_or_else(|| "anonymous-user".to_string())
    }
}

/// An access token together with the user it was issued for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

impl Token {
    pub fn new(value: impl Into<String>, user: User) -> Self {
        Self {
            value: value.into(),
            user,
        }
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

pub type CredentialChangeListener = Arc<dyn Fn(User) + Send + Sync>;

/// Source of auth tokens for the streams.
///
/// Implementations must call the change listener once with the current user
/// as soon as it is registered, and again whenever the signed-in user
/// changes.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<Token>>;

    /// Marks the cached token stale so the next `get_token` refreshes it.
    fn invalidate_token(&self);

    fn set_change_listener(&self, listener: CredentialChangeListener);

    fn remove_change_listener(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

/// Provider for clients that never authenticate.
#[derive(Default)]
pub struct EmptyCredentialsProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for EmptyCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        listener(User::unauthenticated());
    }
}

/// Provider whose user and token are switched by the embedder, e.g. after a
/// sign-in flow completes elsewhere.
#[derive(Default)]
pub struct StaticCredentialsProvider {
    state: Mutex<StaticState>,
}

#[derive(Default)]
struct StaticState {
    user: User,
    token: Option<String>,
    force_refresh_count: usize,
    invalidations: usize,
    listener: Option<CredentialChangeListener>,
}

impl StaticCredentialsProvider {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self {
            state: Mutex::new(StaticState {
                user,
                token,
                ..StaticState::default()
            }),
        }
    }

    /// Switches the signed-in user and notifies the registered listener.
    pub fn set_user(&self, user: User, token: Option<String>) {
        let listener = {
            let mut state = self.lock();
            state.user = user.clone();
            state.token = token;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }

    pub fn invalidation_count(&self) -> usize {
        self.lock().invalidations
    }

    pub fn force_refresh_count(&self) -> usize {
        self.lock().force_refresh_count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for StaticCredentialsProvider {
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<Token>> {
        let mut state = self.lock();
        if force_refresh {
            state.force_refresh_count += 1;
        }
        Ok(state
            .token
            .clone()
            .map(|value| Token::new(value, state.user.clone())))
    }

    fn invalidate_token(&self) {
        self.lock().invalidations += 1;
    }

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        let user = {
            let mut state = self.lock();
            state.listener = Some(listener.clone());
            state.user.clone()
        };
        listener(user);
    }

    fn remove_change_listener(&self) {
        self.lock().listener = None;
    }
}
