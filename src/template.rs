//! Template sources
//!
//! Templates are opaque text read by id; the resolver never writes back.

use crate::error::{ResolveError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn load(&self, template_id: &str) -> Result<String>;
}

/// Templates stored as files under a root directory
#[derive(Debug, Clone)]
pub struct FsTemplateSource {
    root: PathBuf,
}

impl FsTemplateSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, template_id: &str) -> Result<PathBuf> {
        let relative = Path::new(template_id);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if template_id.trim().is_empty() || escapes {
            return Err(ResolveError::Template(format!("invalid template id: {}", template_id)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl TemplateSource for FsTemplateSource {
    async fn load(&self, template_id: &str) -> Result<String> {
        let path = self.resolve(template_id)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ResolveError::Template(format!("Failed to read template {}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTemplateSource {
    templates: HashMap<String, String>,
}

impl MemoryTemplateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, template_id: impl Into<String>, text: impl Into<String>) -> Self {
        self.templates.insert(template_id.into(), text.into());
        self
    }
}

#[async_trait]
impl TemplateSource for MemoryTemplateSource {
    async fn load(&self, template_id: &str) -> Result<String> {
        self.templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| ResolveError::Template(format!("template {} not found", template_id)))
    }
}
