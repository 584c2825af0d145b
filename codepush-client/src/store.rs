use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use codepush_core::{
    CoreError, Credentials, channel_base_from_http, normalize_http_base, push_endpoint,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `state.json` holds a handful of short strings; anything larger is corrupt.
pub const MAX_STATE_BYTES: u64 = 64 * 1024;
const STATE_FILE_NAME: &str = "state.json";

static TMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Everything the relay keeps across restarts.
///
/// Every field is re-read on demand; nothing here may be cached in memory
/// across keep-alive ticks because the process can be torn down between them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub manual_off: bool,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Channel base, e.g. `ws://relay.example:8000`.
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub http_server_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl PersistedState {
    pub fn credentials(&self) -> Option<Credentials> {
        let auth_token = self.auth_token.as_deref().map(str::trim)?;
        let server_url = self.server_url.as_deref().map(str::trim)?;
        if auth_token.is_empty() || server_url.is_empty() {
            return None;
        }
        Some(Credentials {
            auth_token: auth_token.to_owned(),
            server_url: server_url.to_owned(),
        })
    }

    /// Stores credentials for a user-entered server address and clears
    /// `manualOff`, as saving settings from the login UI does.
    pub fn configure(
        &mut self,
        server: &str,
        auth_token: &str,
        username: Option<&str>,
    ) -> Result<(), CoreError> {
        let token = auth_token.trim();
        if token.is_empty() {
            return Err(CoreError::EmptyToken);
        }
        let http_base = normalize_http_base(server)?;

        self.server_url = Some(channel_base_from_http(&http_base));
        self.http_server_url = Some(http_base);
        self.auth_token = Some(token.to_owned());
        if let Some(username) = username.map(str::trim).filter(|name| !name.is_empty()) {
            self.username = Some(username.to_owned());
        }
        self.manual_off = false;
        Ok(())
    }

    /// Where the user's push endpoint lives, once server and username are known.
    pub fn push_endpoint(&self) -> Option<String> {
        Some(push_endpoint(
            self.http_server_url.as_deref()?,
            self.username.as_deref()?,
        ))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("state file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("state read failed: {0}")]
    Read(#[source] io::Error),
    #[error("state parse failed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("state serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("state tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("state rename failed: {0}")]
    Rename(#[source] io::Error),
    #[error("state storage unavailable")]
    Unavailable,
}

/// Key/value persistence shared by the relay and the excluded login flow.
///
/// Writes are last-write-wins; the only guarantee needed is that the latest
/// write is observed by the next read.
///
/// Calls may block on file I/O. Async callers run them on the blocking pool.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<PersistedState, StoreError>;

    fn save(&self, state: &PersistedState) -> Result<(), StoreError>;

    fn update(
        &self,
        apply: &mut dyn FnMut(&mut PersistedState),
    ) -> Result<PersistedState, StoreError> {
        let mut state = self.load()?;
        apply(&mut state);
        self.save(&state)?;
        Ok(state)
    }
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at `<dir>/state.json`, creating `dir` if needed.
    pub fn in_dir(dir: &Path) -> Self {
        let _ = fs::create_dir_all(dir);
        Self::new(dir.join(STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<PersistedState, StoreError> {
        match load_state_from_path(&self.path) {
            Err(StoreError::Metadata(err)) if err.kind() == io::ErrorKind::NotFound => {
                Ok(PersistedState::default())
            }
            other => other,
        }
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        save_state_with_retry(&self.path, state)
    }
}

pub fn load_state_from_path(path: &Path) -> Result<PersistedState, StoreError> {
    let meta = fs::metadata(path).map_err(StoreError::Metadata)?;
    if meta.len() > MAX_STATE_BYTES {
        return Err(StoreError::TooLarge {
            size: meta.len(),
            max: MAX_STATE_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(StoreError::Read)?;
    serde_json::from_str(&data).map_err(StoreError::Parse)
}

/// Writes `state` next to `path` and renames it into place.
///
/// The target is replaced in one step, so a concurrent reader sees either the
/// previous file or the new one, never a missing or partial file. Each write
/// uses its own tmp name; concurrent writers do not share one.
pub fn save_state_to_path(path: &Path, state: &PersistedState) -> Result<(), StoreError> {
    let sequence = TMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("json.{}-{}.tmp", std::process::id(), sequence));
    let payload = serde_json::to_string_pretty(state).map_err(StoreError::Serialize)?;
    if let Err(err) = fs::write(&tmp, payload.as_bytes()) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::WriteTmp(err));
    }

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::Rename(err));
    }
    Ok(())
}

fn save_state_with_retry(path: &Path, state: &PersistedState) -> Result<(), StoreError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match save_state_to_path(path, state) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}

/// Platform config directory for the relay state.
///
/// `CODEPUSH_STATE_DIR` overrides the location.
pub fn default_state_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("CODEPUSH_STATE_DIR") {
        return PathBuf::from(override_dir);
    }

    let base = std::env::var_os("LOCALAPPDATA")
        .or_else(|| std::env::var_os("XDG_CONFIG_HOME"))
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("codepush")
}

/// In-memory store, used by tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<PersistedState>,
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    pub fn new(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent load and save fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<PersistedState, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.state
            .lock()
            .map(|state| state.clone())
            .map_err(|_| StoreError::Unavailable)
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let mut slot = self.state.lock().map_err(|_| StoreError::Unavailable)?;
        *slot = state.clone();
        Ok(())
    }
}
