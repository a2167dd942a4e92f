use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use {recibo_channels::AuthState, tracing::debug};

use crate::{
    branch::BranchId,
    error::{Error, Result},
};

/// Directory-per-branch credential storage at `<root>/session_<branch>/`.
///
/// File contents are opaque; whatever the transport hands over is written
/// back verbatim on the next load.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, branch: &BranchId) -> PathBuf {
        self.root.join(branch.dir_name())
    }

    /// Read the branch's auth state, creating its directory if needed.
    ///
    /// A branch that was never paired yields an empty state.
    pub fn load(&self, branch: &BranchId) -> Result<AuthState> {
        let dir = self.session_dir(branch);
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let mut state = AuthState::default();
        for entry in fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let bytes = fs::read(&path).map_err(|e| Error::io(&path, e))?;
            state.files.insert(name, bytes);
        }
        debug!(branch = %branch, files = state.files.len(), "loaded credentials");
        Ok(state)
    }

    /// Write every file of `state` into the branch directory.
    pub fn persist(&self, branch: &BranchId, state: &AuthState) -> Result<()> {
        let dir = self.session_dir(branch);
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        for (name, bytes) in &state.files {
            check_file_name(name)?;
            let path = dir.join(name);
            fs::write(&path, bytes).map_err(|e| Error::io(&path, e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                    .map_err(|e| Error::io(&path, e))?;
            }
        }
        debug!(branch = %branch, files = state.files.len(), "persisted credentials");
        Ok(())
    }

    /// Remove the branch directory. Returns whether anything was deleted.
    pub fn delete(&self, branch: &BranchId) -> Result<bool> {
        let dir = self.session_dir(branch);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(&dir, e)),
        }
    }

    /// Whether the branch directory holds at least one credential file.
    pub fn has_credentials(&self, branch: &BranchId) -> bool {
        fs::read_dir(self.session_dir(branch))
            .map(|mut entries| entries.any(|e| e.is_ok_and(|e| e.path().is_file())))
            .unwrap_or(false)
    }

    /// Branches with a session directory, sorted.
    pub fn list(&self) -> Result<Vec<BranchId>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.root, e)),
        };

        let mut branches: Vec<BranchId> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().and_then(BranchId::from_dir_name))
            .collect();
        branches.sort();
        Ok(branches)
    }
}

fn check_file_name(name: &str) -> Result<()> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if plain {
        Ok(())
    } else {
        Err(Error::InvalidCredentialFile(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(id: &str) -> BranchId {
        BranchId::new(id).unwrap()
    }

    fn creds(pairs: &[(&str, &str)]) -> AuthState {
        AuthState {
            files: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
        }
    }

    #[test]
    fn load_creates_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());

        let state = store.load(&branch("5")).unwrap();
        assert!(state.is_empty());
        assert!(dir.path().join("session_5").is_dir());
        assert!(!store.has_credentials(&branch("5")));
    }

    #[test]
    fn persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        let b = branch("5");

        let state = creds(&[("creds.json", "{\"me\":1}"), ("app-state-sync-key-1.json", "k")]);
        store.persist(&b, &state).unwrap();

        assert_eq!(store.load(&b).unwrap(), state);
        assert!(store.has_credentials(&b));
    }

    #[cfg(unix)]
    #[test]
    fn persisted_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        store.persist(&branch("5"), &creds(&[("creds.json", "{}")])).unwrap();

        let mode = fs::metadata(dir.path().join("session_5/creds.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn persist_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());

        let err = store
            .persist(&branch("5"), &creds(&[("../escape", "x")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredentialFile(_)));
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        let b = branch("9");

        store.persist(&b, &creds(&[("creds.json", "{}")])).unwrap();
        assert!(store.delete(&b).unwrap());
        assert!(!store.session_dir(&b).exists());
        assert!(!store.delete(&b).unwrap());
    }

    #[test]
    fn list_finds_session_directories_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());

        store.load(&branch("7")).unwrap();
        store.load(&branch("12")).unwrap();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();
        fs::write(dir.path().join("session_file"), "not a dir").unwrap();

        assert_eq!(store.list().unwrap(), vec![branch("12"), branch("7")]);
    }

    #[test]
    fn list_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }
}
