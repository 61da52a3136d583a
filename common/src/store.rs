use log::{info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;

use crate::settings::{Settings, TextField, CLIENT_ID_ROOT};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("settings storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings storage backend failed: {0}")]
    Backend(String),
}

/// The non-volatile block that holds the settings record.
pub trait SettingsStorage {
    /// Returns `None` when nothing has been written yet.
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, StorageError>;

    fn write_block(&mut self, block: &[u8]) -> Result<(), StorageError>;
}

/// In-memory block, used by tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    block: Option<Vec<u8>>,
    fail_reads: bool,
    fail_writes: bool,
    writes: usize,
}

impl MemoryStorage {
    pub fn with_block(block: Vec<u8>) -> Self {
        Self {
            block: Some(block),
            ..Self::default()
        }
    }

    pub fn block(&self) -> Option<&[u8]> {
        self.block.as_deref()
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }
}

impl SettingsStorage for MemoryStorage {
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        if self.fail_reads {
            return Err(StorageError::Backend("read rejected".to_string()));
        }
        Ok(self.block.clone())
    }

    fn write_block(&mut self, block: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Backend("commit rejected".to_string()));
        }
        self.block = Some(block.to_vec());
        self.writes += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Record passed the check and carries the valid marker.
    Configured,
    /// Record passed the check but is not fully configured yet.
    Unconfigured,
    /// Record was absent or corrupt and has been reset to defaults.
    Reinitialized,
    /// Storage could not be read. Defaults are held in memory only and the
    /// stored block is left untouched.
    Unreadable,
}

pub struct SettingsStore<S> {
    storage: S,
    settings: Settings,
    valid: bool,
    rng: StdRng,
}

impl<S: SettingsStorage> SettingsStore<S> {
    pub fn new(storage: S) -> Self {
        Self::with_rng(storage, StdRng::from_entropy())
    }

    pub fn with_rng(storage: S, rng: StdRng) -> Self {
        Self {
            storage,
            settings: Settings::default(),
            valid: false,
            rng,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Process-wide "settings are valid" flag, refreshed by load and save.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn load(&mut self) -> LoadOutcome {
        let block = match self.storage.read_block() {
            Ok(block) => block,
            Err(err) => {
                warn!("failed to read settings block, running on defaults: {err}");
                self.settings = Settings::default();
                let client_id = self.generate_client_identity();
                self.settings.set_text(TextField::ClientId, &client_id);
                self.valid = false;
                return LoadOutcome::Unreadable;
            }
        };

        let decoded = match block.as_deref().map(Settings::decode) {
            Some(Ok(settings)) if settings.passes_load_check() => Some(settings),
            Some(Ok(_)) => {
                warn!("settings block failed sanity check, initializing");
                None
            }
            Some(Err(err)) => {
                warn!("settings block unreadable ({err}), initializing");
                None
            }
            None => {
                info!("no settings block found, initializing");
                None
            }
        };

        let Some(settings) = decoded else {
            self.initialize();
            return LoadOutcome::Reinitialized;
        };

        self.settings = settings;
        self.valid = self.settings.is_marked_valid();
        if self.valid {
            if self.settings.debug {
                info!("loaded configuration values from storage");
            }
            LoadOutcome::Configured
        } else {
            info!("device not configured yet");
            LoadOutcome::Unconfigured
        }
    }

    /// Resets every field to its default, draws a fresh client identity and saves.
    pub fn initialize(&mut self) -> bool {
        self.settings = Settings::default();
        let client_id = self.generate_client_identity();
        self.settings.set_text(TextField::ClientId, &client_id);
        self.save()
    }

    /// Recomputes the validity marker, fills in a missing client identity and
    /// commits the whole record. Returns whether the commit succeeded.
    pub fn save(&mut self) -> bool {
        self.valid = self.settings.refresh_validity_marker();
        if self.valid {
            info!("settings deemed complete");
        } else {
            info!("settings still incomplete");
        }

        if self.settings.client_id.is_empty() {
            let client_id = self.generate_client_identity();
            self.settings.set_text(TextField::ClientId, &client_id);
        }

        match self.storage.write_block(&self.settings.encode()) {
            Ok(()) => true,
            Err(err) => {
                warn!("settings commit failed, keeping in-memory copy: {err}");
                false
            }
        }
    }

    /// `<root><hex>`; uniqueness by convention only.
    pub fn generate_client_identity(&mut self) -> String {
        let suffix: u16 = self.rng.gen_range(0..0xFFFF);
        let client_id = format!("{CLIENT_ID_ROOT}{suffix:x}");
        if self.settings.debug {
            info!("new MQTT client id is {client_id}");
        }
        client_id
    }

    /// Replaces the client identity with one that differs from the current one.
    pub fn regenerate_client_identity(&mut self) -> bool {
        let previous = self.settings.client_id.clone();
        let mut client_id = self.generate_client_identity();
        while client_id == previous {
            client_id = self.generate_client_identity();
        }
        self.settings.set_text(TextField::ClientId, &client_id);
        self.save()
    }
}
