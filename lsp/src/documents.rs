//! Server-visible documents and scratch probes.
//!
//! A probe temporarily replaces a document's text with candidate code, runs a
//! query against it, and puts the original text back. Each document has its
//! own lock, so at most one probe per path is in flight; probes on different
//! documents run concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::error::{RpcError, RpcResult};
use crate::protocol;

/// Sends document notifications to the server.
pub trait DocumentSync {
    fn send(&self, method: &str, params: Value) -> RpcResult<()>;
}

#[derive(Debug)]
struct DocState {
    path: PathBuf,
    uri: String,
    version: i32,
    open: bool,
    /// Text the document is restored to after each probe.
    saved_text: String,
    /// Text the server currently sees.
    visible_text: String,
}

/// Documents opened on one connection.
#[derive(Debug)]
pub struct DocumentStore {
    language_id: String,
    docs: Mutex<HashMap<PathBuf, Arc<Mutex<DocState>>>>,
}

impl DocumentStore {
    #[must_use]
    pub fn new(language_id: impl Into<String>) -> Self {
        Self {
            language_id: language_id.into(),
            docs: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, path: &Path) -> RpcResult<Arc<Mutex<DocState>>> {
        let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(doc) = docs.get(path) {
            return Ok(doc.clone());
        }
        let uri = protocol::path_to_file_uri(path)?.to_string();
        let doc = Arc::new(Mutex::new(DocState {
            path: path.to_path_buf(),
            uri,
            version: 0,
            open: false,
            saved_text: String::new(),
            visible_text: String::new(),
        }));
        docs.insert(path.to_path_buf(), doc.clone());
        Ok(doc)
    }

    /// Run `f` with exclusive access to the document at `path`, opening it
    /// on the server first (with its on-disk text) if needed.
    pub fn with_document<S, T, F>(&self, sync: &S, path: &Path, f: F) -> RpcResult<T>
    where
        S: DocumentSync + ?Sized,
        F: FnOnce(&mut OpenDocument<'_, S>) -> RpcResult<T>,
    {
        let doc = self.entry(path)?;
        let mut state = doc.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.open {
            let text = std::fs::read_to_string(&state.path)
                .map_err(|e| RpcError::InvalidPath(format!("{}: {e}", state.path.display())))?;
            let version = state.version + 1;
            sync.send(
                "textDocument/didOpen",
                protocol::did_open_params(&state.uri, &self.language_id, version, &text),
            )?;
            tracing::debug!(uri = %state.uri, bytes = text.len(), "opened document");
            state.version = version;
            state.open = true;
            state.visible_text.clone_from(&text);
            state.saved_text = text;
        }
        f(&mut OpenDocument {
            sync,
            state: &mut *state,
        })
    }

    /// Send `didClose` for `path`.
    ///
    /// Waits for any probe on the document to finish. The entry stays in the
    /// store so later probes share the same lock; the next one reopens it.
    pub fn close_document<S>(&self, sync: &S, path: &Path) -> RpcResult<()>
    where
        S: DocumentSync + ?Sized,
    {
        let doc = self
            .docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned();
        let Some(doc) = doc else {
            return Ok(());
        };
        let mut state = doc.lock().unwrap_or_else(PoisonError::into_inner);
        if state.open {
            sync.send("textDocument/didClose", protocol::did_close_params(&state.uri))?;
            state.open = false;
            tracing::debug!(uri = %state.uri, "closed document");
        }
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self, path: &Path) -> bool {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .is_some_and(|doc| doc.lock().unwrap_or_else(PoisonError::into_inner).open)
    }
}

/// A locked, open document.
pub struct OpenDocument<'a, S: ?Sized> {
    sync: &'a S,
    state: &'a mut DocState,
}

impl<S: DocumentSync + ?Sized> OpenDocument<'_, S> {
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.state.uri
    }

    #[must_use]
    pub fn version(&self) -> i32 {
        self.state.version
    }

    /// The text probes are restored to.
    #[must_use]
    pub fn saved_text(&self) -> &str {
        &self.state.saved_text
    }

    /// Replace the server-visible text. Returns the new version.
    pub fn write(&mut self, text: &str) -> RpcResult<i32> {
        let version = self.state.version + 1;
        self.sync.send(
            "textDocument/didChange",
            protocol::did_change_params(&self.state.uri, version, text),
        )?;
        self.state.version = version;
        text.clone_into(&mut self.state.visible_text);
        tracing::debug!(uri = %self.state.uri, version, bytes = text.len(), "wrote document");
        Ok(version)
    }

    /// Put the saved text back if a probe changed it.
    pub fn restore(&mut self) -> RpcResult<()> {
        if self.state.visible_text == self.state.saved_text {
            return Ok(());
        }
        let saved = self.state.saved_text.clone();
        self.write(&saved).map(|_| ())
    }

    /// Write `probe_text` (if any), run `query`, then restore the saved text
    /// whether or not the query succeeded.
    ///
    /// `query` receives the document URI and the version it sees.
    pub fn probe<T, Q>(&mut self, probe_text: Option<&str>, query: Q) -> RpcResult<T>
    where
        Q: FnOnce(&str, i32) -> RpcResult<T>,
    {
        if let Some(text) = probe_text {
            self.write(text)?;
        }
        let outcome = query(&self.state.uri, self.state.version);
        let restored = self.restore();
        match (outcome, restored) {
            (Err(e), Err(restore_err)) => {
                tracing::warn!("restoring {} failed: {restore_err}", self.state.uri);
                Err(e)
            }
            (outcome, Ok(())) => outcome,
            (Ok(_), Err(restore_err)) => Err(restore_err),
        }
    }
}
