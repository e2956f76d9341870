//! The single owner of the session.
//!
//! Every state change goes through `restore`, `login`, `register` or `logout`.
//! Each one writes the identity and the outbound `Authorization` header inside
//! the same critical section, so no reader sees one without the other.

use super::claims;
use super::store::{CredentialStore, StoredCredentials};
use super::{AccessCredential, Identity, Session, SessionEvent, SessionListener};
use crate::api::AuthHeader;
use crate::credentials::{CredentialService, TokenGrant};
use crate::error::{AuthError, AuthResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::{debug, info, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SessionManager {
    service: Arc<dyn CredentialService>,
    store: Arc<dyn CredentialStore>,
    auth_header: AuthHeader,
    state: Mutex<Session>,
    /// Held for the whole of an operation, network calls included.
    operation: Mutex<()>,
    restored: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
}

impl SessionManager {
    pub fn new(
        service: Arc<dyn CredentialService>,
        store: Arc<dyn CredentialStore>,
        auth_header: AuthHeader,
    ) -> Self {
        auth_header.clear();
        Self {
            service,
            store,
            auth_header,
            state: Mutex::new(Session::pending()),
            operation: Mutex::new(()),
            restored: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn SessionListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn snapshot(&self) -> Session {
        lock(&self.state).clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        lock(&self.state).identity().cloned()
    }

    #[cfg(test)]
    pub fn is_resolved(&self) -> bool {
        lock(&self.state).is_resolved()
    }

    /// Try to resume a previous session. Runs once per process; never fails.
    pub fn restore(&self) {
        let _op = lock(&self.operation);
        if self.restored.swap(true, Ordering::SeqCst) {
            warn!("session restore requested more than once; ignoring");
            return;
        }

        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "could not read stored credentials");
                None
            }
        };
        let long_lived = stored.as_ref().and_then(|s| s.refresh.clone());
        debug!(readable_credential = long_lived.is_some(), "restoring session");

        let restored = self
            .service
            .refresh(long_lived.as_deref())
            .map_err(|e| e.to_string())
            .and_then(|grant| {
                let (identity, credential) =
                    Self::decode_grant(&grant, None).map_err(|e| e.to_string())?;
                Ok((grant, identity, credential))
            });

        match restored {
            Ok((grant, identity, credential)) => {
                self.persist(&grant, long_lived);
                info!(subject = identity.subject_id, "session restored");
                self.sign_in(identity, credential);
            }
            Err(reason) => {
                debug!(%reason, "no session to restore");
                self.sign_out();
            }
        }
    }

    /// Authenticate with email and password.
    pub fn login(&self, email: &str, password: &str) -> AuthResult<Identity> {
        let _op = self.begin()?;
        self.login_in_operation(email, password)
    }

    /// Create an account, then sign in with the same email and password.
    pub fn register(&self, username: &str, email: &str, password: &str) -> AuthResult<Identity> {
        let _op = self.begin()?;
        self.service.create_account(username, email, password)?;
        info!(%username, "account created");
        self.login_in_operation(email, password)
    }

    /// Sign out. The server-side invalidation is best-effort; local state is
    /// always cleared, and calling this while signed out is harmless.
    ///
    /// The server is told whenever there is something to invalidate: a live
    /// session, or stored credentials left behind by a failed restore.
    pub fn logout(&self) {
        let _op = lock(&self.operation);
        let was_signed_in = lock(&self.state).is_authenticated();
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "could not read stored credentials");
                None
            }
        };

        if was_signed_in || stored.is_some() {
            let long_lived = stored.and_then(|s| s.refresh);
            if let Err(e) = self.service.invalidate(long_lived.as_deref()) {
                warn!(error = %e, "server-side logout failed; clearing local session anyway");
            }
        }

        self.sign_out();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "could not clear stored credentials");
        }
        if was_signed_in {
            info!("signed out");
        }
    }

    fn begin(&self) -> AuthResult<MutexGuard<'_, ()>> {
        match self.operation.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(e)) => Ok(e.into_inner()),
            Err(TryLockError::WouldBlock) => Err(AuthError::SessionBusy),
        }
    }

    fn login_in_operation(&self, email: &str, password: &str) -> AuthResult<Identity> {
        let grant = self.service.authenticate(email, password)?;
        let (identity, credential) = Self::decode_grant(&grant, Some(email))
            .map_err(|e| AuthError::unavailable(format!("malformed access credential: {}", e)))?;

        // A fresh login never inherits an earlier user's refresh credential
        self.persist(&grant, None);
        info!(subject = identity.subject_id, "signed in");
        self.sign_in(identity.clone(), credential);
        Ok(identity)
    }

    fn decode_grant(
        grant: &TokenGrant,
        fallback_email: Option<&str>,
    ) -> Result<(Identity, AccessCredential), claims::ClaimsError> {
        let claims = claims::decode(&grant.access)?;
        let expires_at = claims.expires_at();
        let identity = claims.into_identity(fallback_email);
        Ok((identity, AccessCredential::new(grant.access.clone(), expires_at)))
    }

    /// Save the grant. `carried_refresh` fills in for a refresh endpoint that
    /// does not rotate the long-lived credential.
    fn persist(&self, grant: &TokenGrant, carried_refresh: Option<String>) {
        let credentials = StoredCredentials {
            refresh: grant.refresh.clone().or(carried_refresh),
            access: Some(grant.access.clone()),
        };
        if let Err(e) = self.store.save(&credentials) {
            warn!(error = %e, "could not persist credentials");
        }
    }

    fn sign_in(&self, identity: Identity, credential: AccessCredential) {
        {
            let mut state = lock(&self.state);
            self.auth_header.set(credential.bearer());
            *state = Session::signed_in(identity.clone(), credential);
        }
        self.notify(SessionEvent::SignedIn(identity));
    }

    fn sign_out(&self) {
        {
            let mut state = lock(&self.state);
            *state = Session::signed_out();
            self.auth_header.clear();
        }
        self.notify(SessionEvent::SignedOut);
    }

    fn notify(&self, event: SessionEvent) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.on_session_change(&event);
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process stand-in for the credential service.

    use crate::credentials::{CredentialService, TokenGrant};
    use crate::error::{AuthError, AuthResult};
    use crate::session::claims::encode_for_test;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    struct Account {
        id: u64,
        username: String,
        email: String,
        password: String,
        staff: bool,
        groups: Vec<String>,
    }

    #[derive(Default)]
    pub struct FakeService {
        accounts: Mutex<Vec<Account>>,
        /// Server-set long-lived credential the client cannot read.
        cookie: Mutex<Option<String>>,
        pub hand_out_refresh: AtomicBool,
        pub offline: AtomicBool,
        pub fail_invalidate: AtomicBool,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeService {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_account(self, id: u64, username: &str, email: &str, password: &str, staff: bool) -> Self {
            self.accounts.lock().unwrap().push(Account {
                id,
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
                staff,
                groups: Vec::new(),
            });
            self
        }

        /// Pretend an earlier run left a valid session cookie for `id`.
        pub fn with_cookie_for(self, id: u64) -> Self {
            *self.cookie.lock().unwrap() = Some(format!("refresh-{}", id));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn check_online(&self) -> AuthResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                Err(AuthError::unavailable("connection refused"))
            } else {
                Ok(())
            }
        }

        fn grant_for(&self, account: &Account) -> TokenGrant {
            let access = encode_for_test(&json!({
                "user_id": account.id,
                "username": account.username,
                "email": account.email,
                "is_staff": account.staff,
                "groups": account.groups,
            }));
            let refresh = format!("refresh-{}", account.id);
            if self.hand_out_refresh.load(Ordering::SeqCst) {
                TokenGrant {
                    access,
                    refresh: Some(refresh),
                }
            } else {
                *self.cookie.lock().unwrap() = Some(refresh);
                TokenGrant {
                    access,
                    refresh: None,
                }
            }
        }
    }

    impl CredentialService for FakeService {
        fn refresh(&self, long_lived: Option<&str>) -> AuthResult<TokenGrant> {
            self.record("refresh");
            self.check_online()?;
            let token = long_lived
                .map(String::from)
                .or_else(|| self.cookie.lock().unwrap().clone())
                .ok_or_else(|| AuthError::unavailable("HTTP 401: no refresh credential"))?;
            let account = self
                .accounts
                .lock()
                .unwrap()
                .iter()
                .find(|a| format!("refresh-{}", a.id) == token)
                .cloned()
                .ok_or_else(|| AuthError::unavailable("HTTP 401: token is invalid"))?;
            Ok(self.grant_for(&account))
        }

        fn authenticate(&self, email: &str, password: &str) -> AuthResult<TokenGrant> {
            self.record("authenticate");
            self.check_online()?;
            let account = self
                .accounts
                .lock()
                .unwrap()
                .iter()
                .find(|a| a.email == email && a.password == password)
                .cloned()
                .ok_or(AuthError::InvalidCredentials)?;
            Ok(self.grant_for(&account))
        }

        fn create_account(&self, username: &str, email: &str, password: &str) -> AuthResult<()> {
            self.record("create_account");
            self.check_online()?;
            let mut accounts = self.accounts.lock().unwrap();
            if accounts.iter().any(|a| a.username == username) {
                return Err(AuthError::RegistrationConflict {
                    field: "username".to_string(),
                    message: "A user with that username already exists.".to_string(),
                });
            }
            if accounts.iter().any(|a| a.email == email) {
                return Err(AuthError::RegistrationConflict {
                    field: "email".to_string(),
                    message: "user with this email already exists.".to_string(),
                });
            }
            let id = accounts.iter().map(|a| a.id).max().unwrap_or(0) + 1;
            accounts.push(Account {
                id,
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
                staff: false,
                groups: Vec::new(),
            });
            Ok(())
        }

        fn invalidate(&self, long_lived: Option<&str>) -> AuthResult<()> {
            match long_lived {
                Some(token) => self.record(&format!("invalidate {}", token)),
                None => self.record("invalidate"),
            }
            if self.fail_invalidate.load(Ordering::SeqCst) {
                return Err(AuthError::unavailable("connection reset"));
            }
            *self.cookie.lock().unwrap() = None;
            Ok(())
        }
    }
}
