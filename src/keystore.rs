// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Sealed key storage: one file pair per paired verifier, using an
//! exclusive-create persistence pattern so a second enrollment can never
//! clobber an existing pairing. Layout is per-UUID (`<uuid>` private part,
//! `<uuid>.pub` public part) under a single directory.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Result, UltrablueError};
use crate::tpm::SealedBlob;

/// File-system-backed store of sealed (SRK-wrapped) pairing keys, one pair
/// of files per verifier UUID.
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Opens `dir`, creating it (mode 0700) if it doesn't exist.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| UltrablueError::KeyStore(e.to_string()))?;
        let mut perms = fs::metadata(&dir)
            .map_err(|e| UltrablueError::KeyStore(e.to_string()))?
            .permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o700);
        fs::set_permissions(&dir, perms).map_err(|e| UltrablueError::KeyStore(e.to_string()))?;
        Ok(Self { dir })
    }

    fn private_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(id.to_string())
    }

    fn public_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.pub"))
    }

    /// Persists a newly sealed blob pair under `id`. Fails if `id` is
    /// already enrolled, since a second `--enroll` run for the same
    /// verifier must not silently clobber the first. Rolls the private
    /// blob back if the public blob can't be written, so a failed `store`
    /// never leaves one half of the pair behind.
    pub fn store(&self, id: Uuid, blob: &SealedBlob) -> Result<()> {
        write_exclusive(&self.private_path(id), &blob.private)?;
        if let Err(e) = write_exclusive(&self.public_path(id), &blob.public) {
            let _ = fs::remove_file(self.private_path(id));
            return Err(e);
        }
        Ok(())
    }

    /// Loads a previously stored blob pair.
    pub fn load(&self, id: Uuid) -> Result<SealedBlob> {
        let private = fs::read(self.private_path(id))
            .map_err(|e| UltrablueError::KeyStore(format!("reading private blob: {e}")))?;
        let public = fs::read(self.public_path(id))
            .map_err(|e| UltrablueError::KeyStore(format!("reading public blob: {e}")))?;
        Ok(SealedBlob { private, public })
    }

    /// Returns `true` if `id` has previously been enrolled.
    pub fn contains(&self, id: Uuid) -> bool {
        self.private_path(id).is_file() && self.public_path(id).is_file()
    }
}

fn write_exclusive(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| UltrablueError::KeyStore(format!("creating {}: {e}", path.display())))?;
    file.write_all(data)
        .map_err(|e| UltrablueError::KeyStore(format!("writing {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::testing::MockTpm;
    use crate::tpm::TpmAdapter;

    #[test]
    fn store_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let tpm = MockTpm::new();
        let id = Uuid::new_v4();

        let blob = tpm.seal(b"pairing-key", None).unwrap();
        store.store(id, &blob).unwrap();

        let loaded = store.load(id).unwrap();
        assert_eq!(tpm.unseal(&loaded, None).unwrap(), b"pairing-key");
    }

    #[test]
    fn double_enroll_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let tpm = MockTpm::new();
        let id = Uuid::new_v4();
        let blob = tpm.seal(b"pairing-key", None).unwrap();

        store.store(id, &blob).unwrap();
        assert!(store.store(id, &blob).is_err());
    }

    #[test]
    fn failed_store_leaves_neither_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let tpm = MockTpm::new();
        let id = Uuid::new_v4();
        let blob = tpm.seal(b"pairing-key", None).unwrap();

        // Pre-create the public half out from under the store, so `store`
        // writes the private blob, then fails on the public one.
        std::fs::write(dir.path().join(format!("{id}.pub")), b"stale").unwrap();

        assert!(store.store(id, &blob).is_err());
        assert!(!dir.path().join(id.to_string()).exists());
    }

    #[test]
    fn contains_reflects_store_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let id = Uuid::new_v4();
        assert!(!store.contains(id));

        let tpm = MockTpm::new();
        let blob = tpm.seal(b"k", None).unwrap();
        store.store(id, &blob).unwrap();
        assert!(store.contains(id));
    }
}
