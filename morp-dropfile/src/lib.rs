//! C5: the local filesystem drop-directory engine. Grounded on
//! `morp/interface/dropfile.py`: one file per message, named
//! `<valid-at-nanos>-<id>-<count>.txt`, claimed with a non-blocking
//! advisory exclusive lock via `fs2::FileExt` (the idiomatic Rust wrapper
//! around `flock`, replacing the original's direct `fcntl.flock` call).

use async_trait::async_trait;
use fs2::FileExt;
use morp_core::error::{ConfigError, InterfaceError};
use morp_core::interface::{compute_release_delay, Interface};
use morp_core::value::{Fields, FieldsExt};
use morp_core::{codec, config::ConnectionConfig, registry};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Call once at process startup to make `dropfile://`/`file://` DSNs
/// resolvable from `morp_core::registry::configure`.
pub fn register() {
    registry::register_backend("dropfile", build_interface);
}

fn build_interface(config: &ConnectionConfig) -> Result<Arc<dyn Interface>, ConfigError> {
    Ok(Arc::new(DropfileInterface::new(config)))
}

/// A file claimed by `recv`, held open and locked until `ack`/`release`
/// resolves it. Tracked out-of-band from `Fields` (the `_raw` backend
/// handle of spec §3 is never serializable, so it never enters the wire
/// format) keyed by `_id`.
struct ClaimedFile {
    file: File,
    path: PathBuf,
}

pub struct DropfileInterface {
    root: PathBuf,
    serializer: codec::Serializer,
    key: Option<codec::SealKey>,
    max_timeout: u64,
    backoff_multiplier: u64,
    backoff_amplifier: Option<u64>,
    claimed: Mutex<HashMap<String, ClaimedFile>>,
}

impl DropfileInterface {
    pub fn new(config: &ConnectionConfig) -> Self {
        let base = if config.path.is_empty() {
            "/tmp".to_string()
        } else {
            config.path.clone()
        };

        DropfileInterface {
            root: Path::new(&base).join("morp").join("queue"),
            serializer: config.serializer,
            key: config.key,
            max_timeout: config.max_timeout,
            backoff_multiplier: config.backoff_multiplier,
            backoff_amplifier: config.backoff_amplifier,
            claimed: Mutex::new(HashMap::new()),
        }
    }

    fn queue_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn body_fields(fields: &Fields) -> Fields {
        let mut body = fields.clone();
        body.remove(morp_core::value::ID);
        body.remove(morp_core::value::COUNT);
        body
    }

    fn encode(&self, fields: &Fields) -> Result<Vec<u8>, InterfaceError> {
        codec::encode(&Self::body_fields(fields), self.serializer, self.key.as_ref())
            .map_err(InterfaceError::from)
    }

    fn decode(&self, body: &[u8]) -> Result<Fields, InterfaceError> {
        codec::decode(body, self.serializer, self.key.as_ref()).map_err(InterfaceError::from)
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_nanos()
}

/// Parse a `<ts>-<id>-<count>.txt` filename into its three parts.
fn parse_filename(name: &str) -> Option<(u128, &str, i64)> {
    let stem = name.strip_suffix(".txt")?;
    let mut parts = stem.splitn(3, '-');
    let ts = parts.next()?.parse().ok()?;
    let id = parts.next()?;
    let count = parts.next()?.parse().ok()?;
    Some((ts, id, count))
}

/// One non-blocking sweep of the queue directory: skip not-yet-valid
/// files, try to lock each eligible candidate, and claim the first with a
/// non-empty body. Mirrors the inner `for message in queue.files().sort()`
/// loop in `dropfile.py::_recv`.
type ClaimedMessage = (String, i64, Vec<u8>, ClaimedFile);

fn try_claim_once(dir: &Path) -> std::io::Result<Option<ClaimedMessage>> {
    // Mirrors `connection.child_dir(name, touch=True)`: a queue that has
    // never been sent to has no directory yet, which is just an empty
    // queue, not an error.
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut entries: Vec<PathBuf> = read_dir
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    let now = now_nanos();

    for path in entries {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((ts, id, count)) = parse_filename(file_name) else {
            continue;
        };
        if now <= ts {
            continue;
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.try_lock_exclusive().is_err() {
            continue;
        }

        let mut body = Vec::new();
        (&file).read_to_end(&mut body)?;

        if body.is_empty() {
            // Another process already truncated this message (a race with
            // `ack`); clean it up without truncating again.
            FileExt::unlock(&file)?;
            let _ = fs::remove_file(&path);
            continue;
        }

        return Ok(Some((
            id.to_string(),
            count,
            body,
            ClaimedFile { file, path },
        )));
    }

    Ok(None)
}

#[async_trait]
impl Interface for DropfileInterface {
    async fn connect(&self) -> Result<(), InterfaceError> {
        fs::create_dir_all(&self.root).map_err(InterfaceError::backend)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), InterfaceError> {
        Ok(())
    }

    async fn send(
        &self,
        name: &str,
        fields: Fields,
        delay_seconds: u64,
    ) -> Result<Fields, InterfaceError> {
        let dir = self.queue_dir(name);
        fs::create_dir_all(&dir).map_err(InterfaceError::backend)?;

        let body = self.encode(&fields)?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let valid_at = now_nanos() + (delay_seconds as u128) * 1_000_000_000;

        let path = dir.join(format!("{valid_at}-{id}-1.txt"));
        let mut file = File::create(&path).map_err(InterfaceError::backend)?;
        file.write_all(&body).map_err(InterfaceError::backend)?;

        let mut sent = fields;
        sent.set_id(id);
        sent.set_count(1);
        Ok(sent)
    }

    async fn recv(&self, name: &str, timeout: Duration) -> Result<Option<Fields>, InterfaceError> {
        let dir = self.queue_dir(name);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let attempt = {
                let dir = dir.clone();
                tokio::task::spawn_blocking(move || try_claim_once(&dir))
                    .await
                    .map_err(InterfaceError::backend)?
                    .map_err(InterfaceError::backend)?
            };

            if let Some((id, count, body, claimed)) = attempt {
                let mut fields = self.decode(&body)?;
                fields.set_id(id.clone());
                fields.set_count(count);
                self.claimed.lock().unwrap().insert(id, claimed);
                return Ok(Some(fields));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - tokio::time::Instant::now())).await;
        }
    }

    async fn ack(&self, _name: &str, fields: &Fields) -> Result<(), InterfaceError> {
        let id = fields.id().ok_or(InterfaceError::NotConnected)?;
        let claimed = self
            .claimed
            .lock()
            .unwrap()
            .remove(id)
            .ok_or(InterfaceError::NotConnected)?;

        claimed.file.set_len(0).map_err(InterfaceError::backend)?;
        FileExt::unlock(&claimed.file).map_err(InterfaceError::backend)?;
        drop(claimed.file);
        let _ = fs::remove_file(&claimed.path);
        Ok(())
    }

    async fn release(
        &self,
        _name: &str,
        fields: &Fields,
        delay_seconds: Option<u64>,
    ) -> Result<(), InterfaceError> {
        let id = fields.id().ok_or(InterfaceError::NotConnected)?;
        let claimed = self
            .claimed
            .lock()
            .unwrap()
            .remove(id)
            .ok_or(InterfaceError::NotConnected)?;

        let delay = delay_seconds.unwrap_or_else(|| {
            compute_release_delay(
                fields.count(),
                self.max_timeout,
                self.backoff_multiplier,
                self.backoff_amplifier,
            )
        });

        if delay > 0 {
            // Can't rename a file out from under its own lock, so write the
            // message forward into a new, future-timestamped file and clean
            // up the original under its held lock (`dropfile.py::_release`).
            let dir = claimed
                .path
                .parent()
                .ok_or_else(|| InterfaceError::Backend("claimed file has no parent dir".into()))?;
            let valid_at = now_nanos() + (delay as u128) * 1_000_000_000;
            let next_count = fields.count() + 1;
            let dest = dir.join(format!("{valid_at}-{id}-{next_count}.txt"));

            let body = self.encode(fields)?;
            fs::write(&dest, &body).map_err(InterfaceError::backend)?;

            claimed.file.set_len(0).map_err(InterfaceError::backend)?;
            FileExt::unlock(&claimed.file).map_err(InterfaceError::backend)?;
            drop(claimed.file);
            let _ = fs::remove_file(&claimed.path);
        } else {
            // Release back into the queue as-is: unlock without truncating
            // or deleting.
            FileExt::unlock(&claimed.file).map_err(InterfaceError::backend)?;
        }

        Ok(())
    }

    async fn count(&self, name: &str) -> Result<u64, InterfaceError> {
        let dir = self.queue_dir(name);
        let n = match fs::read_dir(&dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(InterfaceError::backend(e)),
        };
        Ok(n as u64)
    }

    async fn unsafe_clear(&self, name: &str) -> Result<(), InterfaceError> {
        let dir = self.queue_dir(name);
        match fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries.filter_map(|e| e.ok()) {
                    let _ = fs::remove_file(entry.path());
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(InterfaceError::backend(e)),
        }
    }

    async fn unsafe_delete(&self, name: &str) -> Result<(), InterfaceError> {
        let dir = self.queue_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(InterfaceError::backend(e)),
        }
    }
}
