use std::path::PathBuf;
use std::sync::Arc;

use tidbit_core::TiddlerStore;

/// Shared state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TiddlerStore>,
    /// Page served at `/`
    pub index_path: PathBuf,
    /// Basic auth credentials; `None` leaves the wiki open
    pub credentials: Option<Arc<Credentials>>,
}

impl AppState {
    pub fn new(store: Arc<dyn TiddlerStore>, index_path: PathBuf) -> Self {
        Self {
            store,
            index_path,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Arc::new(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }));
        self
    }
}

/// The single user allowed in when a password is set
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn verify(&self, username: &str, password: &str) -> bool {
        // Evaluate both so the response time doesn't reveal which one failed.
        let user_ok = constant_time_eq(self.username.as_bytes(), username.as_bytes());
        let pass_ok = constant_time_eq(self.password.as_bytes(), password.as_bytes());
        user_ok & pass_ok
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
