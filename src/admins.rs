use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

/// Persistence hook for the admin list.
pub trait AdminStore: Send + Sync {
    /// The persisted list, or `None` if nothing has been saved yet.
    fn load(&self) -> Result<Option<Vec<String>>>;
    fn save(&self, admins: &[String]) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AdminsFile {
    #[serde(default)]
    admins: Vec<String>,
}

/// Keeps the admin list in a small TOML file.
pub struct FileAdminStore {
    path: PathBuf,
}

impl FileAdminStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl AdminStore for FileAdminStore {
    fn load(&self) -> Result<Option<Vec<String>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read admins file: {}", self.path.display()))?;
        let file: AdminsFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse admins file: {}", self.path.display()))?;
        Ok(Some(file.admins))
    }

    fn save(&self, admins: &[String]) -> Result<()> {
        let file = AdminsFile {
            admins: admins.to_vec(),
        };
        let content = toml::to_string(&file).context("Failed to serialize admins list")?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write admins file: {}", self.path.display()))?;
        Ok(())
    }
}

/// Routing identities allowed to run operator commands.
///
/// `add` appends without checking for duplicates and `remove` drops every
/// matching entry; both persist the whole list before returning.
pub struct AdminRegistry {
    admins: RwLock<Vec<String>>,
    store: Box<dyn AdminStore>,
}

impl AdminRegistry {
    pub fn new(admins: Vec<String>, store: Box<dyn AdminStore>) -> Self {
        Self {
            admins: RwLock::new(admins),
            store,
        }
    }

    /// Use the persisted list if there is one, `initial` otherwise.
    pub fn load(store: Box<dyn AdminStore>, initial: &[String]) -> Result<Self> {
        let admins = match store.load()? {
            Some(admins) => admins,
            None => {
                info!("No saved admins list; using {} configured admin(s)", initial.len());
                initial.to_vec()
            }
        };
        Ok(Self::new(admins, store))
    }

    pub async fn contains(&self, uid: &str) -> bool {
        self.admins.read().await.iter().any(|admin| admin == uid)
    }

    pub async fn add(&self, name: &str) -> Result<()> {
        let mut admins = self.admins.write().await;
        admins.push(name.to_string());
        self.store.save(&admins)
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut admins = self.admins.write().await;
        admins.retain(|admin| admin != name);
        self.store.save(&admins)
    }

    pub async fn list(&self) -> Vec<String> {
        self.admins.read().await.clone()
    }
}

/// In-memory store that remembers what was last saved.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemoryAdminStore {
    pub saved: std::sync::Arc<std::sync::Mutex<Option<Vec<String>>>>,
}

#[cfg(test)]
impl AdminStore for MemoryAdminStore {
    fn load(&self) -> Result<Option<Vec<String>>> {
        Ok(self.saved.lock().unwrap().clone())
    }

    fn save(&self, admins: &[String]) -> Result<()> {
        *self.saved.lock().unwrap() = Some(admins.to_vec());
        Ok(())
    }
}
