//! Local credential cache backends.
//!
//! The auth layer keeps the signed-in session (token, user id, role) in one of
//! these stores so it survives restarts; forced sign-out deletes the entry.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialStoreError {
    #[error("credential not found")]
    NotFound,
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential store backend failure: {0}")]
    Backend(String),
}

pub trait CredentialStore: Send + Sync {
    fn set_credential(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), CredentialStoreError>;

    fn get_credential(&self, service: &str, account: &str) -> Result<String, CredentialStoreError>;

    fn delete_credential(&self, service: &str, account: &str) -> Result<(), CredentialStoreError>;
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn set_credential(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), CredentialStoreError> {
        (**self).set_credential(service, account, secret)
    }

    fn get_credential(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        (**self).get_credential(service, account)
    }

    fn delete_credential(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        (**self).delete_credential(service, account)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn set_credential(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.insert((service.to_owned(), account.to_owned()), secret.to_owned());
        Ok(())
    }

    fn get_credential(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.get(&(service.to_owned(), account.to_owned()))
            .cloned()
            .ok_or(CredentialStoreError::NotFound)
    }

    fn delete_credential(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        if data
            .remove(&(service.to_owned(), account.to_owned()))
            .is_none()
        {
            return Err(CredentialStoreError::NotFound);
        }
        Ok(())
    }
}

type CredentialFile = BTreeMap<String, BTreeMap<String, String>>;

/// Credential store persisted as a single JSON document on disk.
///
/// Layout is `{ "<service>": { "<account>": "<secret>" } }`. Every write goes
/// through a temp file followed by a rename so a crash never leaves a torn file.
pub struct JsonFileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<CredentialFile, CredentialStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(CredentialFile::new()),
            Err(err) => {
                return Err(CredentialStoreError::Unavailable(format!(
                    "failed reading credential file {}: {err}",
                    self.path.display()
                )));
            }
        };

        if raw.trim().is_empty() {
            return Ok(CredentialFile::new());
        }

        serde_json::from_str::<CredentialFile>(&raw).map_err(|err| {
            CredentialStoreError::Backend(format!(
                "failed parsing credential file {}: {err}",
                self.path.display()
            ))
        })
    }

    fn persist(&self, contents: &CredentialFile) -> Result<(), CredentialStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                CredentialStoreError::Unavailable(format!(
                    "failed creating credential directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let encoded = serde_json::to_vec_pretty(contents)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        let temp_path = temp_path_for(&self.path);
        fs::write(&temp_path, encoded).map_err(|err| {
            CredentialStoreError::Unavailable(format!(
                "failed writing temp credential file {}: {err}",
                temp_path.display()
            ))
        })?;

        if let Err(rename_err) = fs::rename(&temp_path, &self.path) {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(CredentialStoreError::Backend(format!(
                        "failed replacing credential file {} after rename error ({rename_err}): {err}",
                        self.path.display()
                    )));
                }
            }
            fs::rename(&temp_path, &self.path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                CredentialStoreError::Backend(format!(
                    "failed writing credential file {} after temp write: {err}",
                    self.path.display()
                ))
            })?;
        }

        Ok(())
    }
}

impl CredentialStore for JsonFileCredentialStore {
    fn set_credential(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), CredentialStoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        let mut contents = self.load()?;
        contents
            .entry(service.to_owned())
            .or_default()
            .insert(account.to_owned(), secret.to_owned());
        self.persist(&contents)
    }

    fn get_credential(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        self.load()?
            .get(service)
            .and_then(|accounts| accounts.get(account))
            .cloned()
            .ok_or(CredentialStoreError::NotFound)
    }

    fn delete_credential(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        let mut contents = self.load()?;
        let removed = contents
            .get_mut(service)
            .and_then(|accounts| accounts.remove(account));
        if removed.is_none() {
            return Err(CredentialStoreError::NotFound);
        }
        if contents.get(service).is_some_and(BTreeMap::is_empty) {
            contents.remove(service);
        }
        self.persist(&contents)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("credentials.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

#[derive(Clone)]
pub struct ScopedCredentialStore<S: CredentialStore> {
    inner: S,
    service: String,
}

impl<S: CredentialStore> ScopedCredentialStore<S> {
    pub fn new(inner: S, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set(&self, account: &str, secret: &str) -> Result<(), CredentialStoreError> {
        self.inner.set_credential(&self.service, account, secret)
    }

    pub fn get(&self, account: &str) -> Result<String, CredentialStoreError> {
        self.inner.get_credential(&self.service, account)
    }

    pub fn delete(&self, account: &str) -> Result<(), CredentialStoreError> {
        self.inner.delete_credential(&self.service, account)
    }
}
