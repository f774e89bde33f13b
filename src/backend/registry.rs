//! Compile-time backend registry.
//!
//! Grounded on `messaging/manager.rs::MessagingManager`: a flat
//! `HashMap<String, Arc<dyn Backend>>` fan-in. Where the spec's distilled
//! design called for a dynamic-import lookup, this crate substitutes a
//! compile-time registry populated once at startup (spec §9 redesign flag).

use super::Backend;
use crate::error::{BackendError, Result};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own `name()`. The first backend
    /// registered becomes the default used by groups with `backend: None`.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, backend);
    }

    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn Backend>> {
        let name = name
            .map(str::to_string)
            .or_else(|| self.default_name.clone())
            .ok_or_else(|| BackendError::UnknownBackend("<no backend registered>".to_string()))?;
        self.backends
            .get(&name)
            .cloned()
            .ok_or(BackendError::UnknownBackend(name))
            .map_err(Into::into)
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AgentInput, OnOutput, OnProcess, ProcessHandle};
    use crate::RegisteredGroup;
    use async_trait::async_trait;

    struct StubBackend(&'static str);

    #[async_trait]
    impl Backend for StubBackend {
        fn name(&self) -> &str {
            self.0
        }

        async fn run_agent(
            &self,
            _group: &RegisteredGroup,
            _input: AgentInput,
            _on_process: OnProcess,
            _on_output: Option<OnOutput>,
        ) -> Result<crate::parser::AgentOutput> {
            unreachable!("not exercised by registry tests")
        }

        async fn send_message(&self, _folder: &str, _text: &str) -> Result<bool> {
            Ok(false)
        }

        async fn close_stdin(&self, _folder: &str, _subdir: Option<&str>) -> Result<()> {
            Ok(())
        }

        async fn write_ipc_data(&self, _folder: &str, _filename: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn read_file(&self, _folder: &str, _relative_path: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn write_file(&self, _folder: &str, _relative_path: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn first_registered_backend_is_default() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(StubBackend("docker")));
        registry.register(Arc::new(StubBackend("sprites")));

        assert_eq!(registry.get(None).unwrap().name(), "docker");
        assert_eq!(registry.get(Some("sprites")).unwrap().name(), "sprites");
    }

    #[test]
    fn unknown_backend_name_errors() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(StubBackend("docker")));
        assert!(registry.get(Some("missing")).is_err());
    }
}
