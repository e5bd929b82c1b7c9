//! Secret & variable store.
//!
//! Resolution order, highest precedence first: process environment, `.env`
//! in the workspace root, `.ploinky/.secrets`. Writes go to `.secrets` only,
//! atomically, serialised by a process-wide lock.

use std::{collections::BTreeMap, fs, sync::Mutex};

use rand::RngCore;
use tracing::debug;

use ploinky_common::fsio::atomic_write;

use crate::{Error, Result, WorkspacePaths};

static WRITE_LOCK: Mutex<()> = Mutex::new(());

/// Parse `KEY=value` text: `#` comments, blank lines, and quoted values with
/// backslash escapes are accepted. Later duplicates win.
pub fn parse_secrets(text: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()));
    }
    vars
}

fn unquote(raw: &str) -> String {
    let quoted = (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2);
    if !quoted {
        return raw.to_string();
    }
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(escaped) => out.push(escaped),
            None => out.push('\\'),
        }
    }
    out
}

fn quote_value(value: &str) -> String {
    if value.is_empty()
        || value.contains(char::is_whitespace)
        || value.contains('"')
        || value.contains('#')
    {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        value.to_string()
    }
}

/// The workspace variable store.
#[derive(Debug, Clone)]
pub struct SecretStore {
    paths: WorkspacePaths,
}

impl SecretStore {
    pub fn new(paths: WorkspacePaths) -> Self {
        Self { paths }
    }

    fn file_vars(&self, which: FileSource) -> BTreeMap<String, String> {
        let path = match which {
            FileSource::DotEnv => self.paths.dotenv(),
            FileSource::Secrets => self.paths.secrets(),
        };
        match fs::read_to_string(&path) {
            Ok(text) => parse_secrets(&text),
            Err(_) => BTreeMap::new(),
        }
    }

    /// First non-empty value from env, `.env`, then `.ploinky/.secrets`.
    pub fn resolve_var_value(&self, name: &str) -> Option<String> {
        if let Ok(value) = std::env::var(name)
            && !value.is_empty()
        {
            return Some(value);
        }
        if let Some(value) = self.file_vars(FileSource::DotEnv).remove(name)
            && !value.is_empty()
        {
            return Some(value);
        }
        self.file_vars(FileSource::Secrets)
            .remove(name)
            .filter(|v| !v.is_empty())
    }

    /// Resolve or fail with `secret_missing` naming the files searched.
    pub fn require_var(&self, name: &str) -> Result<String> {
        self.resolve_var_value(name).ok_or_else(|| Error::SecretMissing {
            name: name.to_string(),
            searched: vec![self.paths.dotenv(), self.paths.secrets()],
        })
    }

    /// Write `name=value` to `.ploinky/.secrets` atomically, preserving the
    /// other entries. Observable by the next `resolve_var_value` call.
    pub fn set_env_var(&self, name: &str, value: &str) -> Result<()> {
        let _guard = WRITE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let path = self.paths.secrets();
        let mut vars = self.file_vars(FileSource::Secrets);
        vars.insert(name.to_string(), value.to_string());
        let mut text = String::new();
        for (key, val) in &vars {
            text.push_str(key);
            text.push('=');
            text.push_str(&quote_value(val));
            text.push('\n');
        }
        atomic_write(&path, text.as_bytes())
            .map_err(|e| Error::Message { message: e.to_string() })?;
        debug!(name, path = %path.display(), "stored variable");
        Ok(())
    }

    /// All variables persisted in `.ploinky/.secrets` (not env or `.env`).
    pub fn list(&self) -> BTreeMap<String, String> {
        self.file_vars(FileSource::Secrets)
    }

    /// Get the component token (e.g. `WEBTTY_TOKEN`), generating and storing
    /// one on first use.
    pub fn component_token(&self, name: &str) -> Result<String> {
        if let Some(token) = self.resolve_var_value(name) {
            return Ok(token);
        }
        self.rotate_token(name)
    }

    /// Generate a fresh random token for a component and persist it.
    pub fn rotate_token(&self, name: &str) -> Result<String> {
        let mut bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        self.set_env_var(name, &token)?;
        Ok(token)
    }
}

#[derive(Debug, Clone, Copy)]
enum FileSource {
    DotEnv,
    Secrets,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SecretStore) {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        fs::create_dir_all(paths.dot_ploinky()).unwrap();
        (dir, SecretStore::new(paths))
    }

    #[test]
    fn test_parse_secrets_comments_and_quotes() {
        let vars = parse_secrets(
            "# comment\nPLAIN=value\nQUOTED=\"has spaces\"\nESC=\"tab\\there\"\nSINGLE='x y'\nBAD LINE\n",
        );
        assert_eq!(vars["PLAIN"], "value");
        assert_eq!(vars["QUOTED"], "has spaces");
        assert_eq!(vars["ESC"], "tab\there");
        assert_eq!(vars["SINGLE"], "x y");
        assert_eq!(vars.len(), 4);
    }

    #[test]
    fn test_set_then_resolve_roundtrip() {
        let (_dir, store) = store();
        store.set_env_var("PLOINKY_TEST_TOKEN", "s3cret value").unwrap();
        assert_eq!(
            store.resolve_var_value("PLOINKY_TEST_TOKEN").as_deref(),
            Some("s3cret value")
        );
        // A second write preserves the first key.
        store.set_env_var("OTHER", "x").unwrap();
        assert_eq!(
            store.resolve_var_value("PLOINKY_TEST_TOKEN").as_deref(),
            Some("s3cret value")
        );
    }

    #[test]
    fn test_precedence_dotenv_over_secrets() {
        let (_dir, store) = store();
        store.set_env_var("LAYERED_VAR", "from-secrets").unwrap();
        fs::write(store.paths.dotenv(), "LAYERED_VAR=from-dotenv\n").unwrap();
        assert_eq!(
            store.resolve_var_value("LAYERED_VAR").as_deref(),
            Some("from-dotenv")
        );
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_precedence_process_env_wins() {
        let (_dir, store) = store();
        store.set_env_var("PLOINKY_PREC_TEST", "file").unwrap();
        unsafe { std::env::set_var("PLOINKY_PREC_TEST", "override") };
        assert_eq!(
            store.resolve_var_value("PLOINKY_PREC_TEST").as_deref(),
            Some("override")
        );
        unsafe { std::env::remove_var("PLOINKY_PREC_TEST") };
    }

    #[test]
    fn test_require_var_missing_lists_files() {
        let (_dir, store) = store();
        let err = store.require_var("NO_SUCH_VAR_EVER").unwrap_err();
        assert_eq!(err.code(), "secret_missing");
        assert!(err.to_string().contains(".secrets"));
    }

    #[test]
    fn test_rotate_token_changes_value() {
        let (_dir, store) = store();
        let a = store.component_token("WEBTTY_TOKEN").unwrap();
        let b = store.component_token("WEBTTY_TOKEN").unwrap();
        assert_eq!(a, b);
        let c = store.rotate_token("WEBTTY_TOKEN").unwrap();
        assert_ne!(a, c);
        assert_eq!(c.len(), 48);
    }
}
