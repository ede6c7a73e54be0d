//! Per-browser UI state.
//!
//! Every browser gets a session id cookie. A session remembers the uploaded file, the last
//! detection result and the last confidence the user picked. The result is only valid for the
//! file it was computed on and is dropped as soon as a different file is uploaded.
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use image::RgbImage;
use uuid::Uuid;

use crate::{config::DEFAULT_CONFIDENCE, hashed};

/// Identity of an uploaded file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileId {
    name: String,
    digest: u64,
}

impl FileId {
    pub fn new(name: &str, bytes: &[u8]) -> Self {
        Self {
            name: name.to_owned(),
            digest: hashed(bytes),
        }
    }
}

/// Uploaded file, raw and decoded.
pub struct Upload {
    pub id: FileId,
    pub name: String,
    pub bytes: Vec<u8>,
    pub image: RgbImage,
}

/// Annotated image and count of the last detection run.
pub struct DetectionResult {
    pub jpeg: Vec<u8>,
    pub count: usize,
}

pub struct Session {
    previous_file: Option<FileId>,
    upload: Option<Arc<Upload>>,
    result: Option<Arc<DetectionResult>>,
    confidence: f32,
    last_access: Instant,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            previous_file: None,
            upload: None,
            result: None,
            confidence: DEFAULT_CONFIDENCE,
            last_access: Instant::now(),
        }
    }
}

impl Session {
    /// Store an uploaded file. A cached result survives only a re-upload of the same file.
    pub fn upload(&mut self, name: &str, bytes: Vec<u8>, image: RgbImage) {
        let id = FileId::new(name, &bytes);
        if let Some(previous) = &self.previous_file {
            if *previous != id {
                self.result = None;
            }
        }

        self.previous_file = Some(id.clone());
        self.upload = Some(Arc::new(Upload {
            id,
            name: name.to_owned(),
            bytes,
            image,
        }));
    }

    /// Forget the uploaded file and everything computed from it.
    pub fn remove(&mut self) {
        self.previous_file = None;
        self.upload = None;
        self.result = None;
    }

    /// Store a detection result computed on the file `for_file`.
    ///
    /// Returns `false` and drops the result if another file was uploaded in the meantime.
    pub fn store_result(&mut self, for_file: &FileId, jpeg: Vec<u8>, count: usize) -> bool {
        if self.previous_file.as_ref() != Some(for_file) {
            return false;
        }

        self.result = Some(Arc::new(DetectionResult { jpeg, count }));
        true
    }

    pub fn set_confidence(&mut self, confidence: f32) {
        self.confidence = confidence;
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn upload_ref(&self) -> Option<Arc<Upload>> {
        self.upload.clone()
    }

    pub fn result(&self) -> Option<Arc<DetectionResult>> {
        self.result.clone()
    }

    pub fn count(&self) -> Option<usize> {
        self.result.as_ref().map(|result| result.count)
    }

    /// File name and content of the annotated image offered for download.
    pub fn download(&self) -> Option<(String, Arc<DetectionResult>)> {
        let upload = self.upload.as_ref()?;
        let result = self.result.as_ref()?;

        Some((
            download_file_name(&upload.name, result.count),
            Arc::clone(result),
        ))
    }
}

/// Name of the downloaded result, embedding the count.
pub fn download_file_name(original_name: &str, count: usize) -> String {
    let stem = Path::new(original_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("imagen");

    format!("resultado_{stem}_({count}).jpg")
}

/// Sessions not accessed for this long are dropped.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// All sessions of the running server.
///
/// Only [`SessionStore::with_session`] creates sessions. Creating one first evicts every session
/// idle for longer than the store's timeout.
pub struct SessionStore {
    sessions: Mutex<HashMap<Uuid, Session>>,
    idle_timeout: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_idle_timeout(SESSION_IDLE_TIMEOUT)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Run `f` on the session `id`, creating an empty one if it does not exist yet.
    pub fn with_session<R>(&self, id: Uuid, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if !sessions.contains_key(&id) {
            let idle_timeout = self.idle_timeout;
            let before = sessions.len();
            sessions.retain(|_id, session| session.last_access.elapsed() < idle_timeout);
            if sessions.len() < before {
                log::debug!("Evicted {} idle sessions", before - sessions.len());
            }
        }

        let session = sessions.entry(id).or_default();
        session.last_access = Instant::now();
        f(session)
    }

    /// Run `f` on the session `id` if it exists. Never creates a session.
    pub fn update<R>(&self, id: Uuid, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions.get_mut(&id)?;
        session.last_access = Instant::now();
        Some(f(session))
    }

    /// Read the session `id` if it exists. Never creates a session.
    pub fn get<R>(&self, id: Uuid, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.update(id, |session| f(session))
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
